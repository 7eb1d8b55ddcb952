//! Conflict Detector
//!
//! Scans a flushed batch against the canvas it is about to be applied to.
//! Operations are grouped by target element; a group becomes a conflict when
//! two or more participants touch the element, when an operation was based on
//! an outdated element version, when an `added` collides with a live id, or
//! when an operation targets an element locked by someone else. Everything
//! else passes through untouched in submission order.
//!
//! Detection is a pure function of the batch and the canvas, conflict ids
//! included, so the same input always yields the same output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::model::{Canvas, CanvasElement, CanvasUpdate, ElementStamp, UpdateOperation};

/// Kind of conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Overlapping edits of different kinds, or a stale edit
    SimultaneousEdit,
    /// Concurrent content edits
    ContentConflict,
    /// Concurrent moves
    PositionConflict,
    /// Edit of an element locked by another participant
    PermissionConflict,
    /// Identifier collision between element creations
    DataConflict,
    /// Anything a client sends that this server does not know
    #[serde(other)]
    Unrecognized,
}

impl ConflictType {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimultaneousEdit => "simultaneous-edit",
            Self::ContentConflict => "content-conflict",
            Self::PositionConflict => "position-conflict",
            Self::PermissionConflict => "permission-conflict",
            Self::DataConflict => "data-conflict",
            Self::Unrecognized => "unrecognized",
        }
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How disruptive a conflict is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    /// Cosmetic (positions)
    Low,
    /// Content may be lost or merged
    Medium,
    /// Deletions or permission violations
    High,
}

/// Overlapping operations on one element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict id
    pub id: Uuid,

    /// Conflict type
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,

    /// Severity
    pub severity: ConflictSeverity,

    /// Contested element
    pub element_id: String,

    /// Participants involved, in order of first involvement
    pub participants: Vec<String>,

    /// Competing operations in submission order
    pub operations: Vec<CanvasUpdate>,

    /// Element stamp the operations were judged against, when stale
    #[serde(default)]
    pub current: Option<ElementStamp>,

    /// Canvas version at detection
    #[serde(default)]
    pub canvas_version: u64,

    /// Latest server receipt time among the operations
    #[serde(default)]
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    /// Build a conflict from competing operations
    #[must_use]
    pub fn new(
        conflict_type: ConflictType,
        element_id: impl Into<String>,
        operations: Vec<CanvasUpdate>,
        canvas_version: u64,
    ) -> Self {
        let element_id = element_id.into();
        let mut participants: Vec<String> = Vec::new();
        for op in &operations {
            if !participants.contains(&op.participant_id) {
                participants.push(op.participant_id.clone());
            }
        }
        let detected_at = operations
            .iter()
            .map(|op| op.received_at)
            .max()
            .unwrap_or_default();
        let severity = severity_of(conflict_type, &operations);
        let id = conflict_id(conflict_type, &element_id, canvas_version, &operations);
        Self {
            id,
            conflict_type,
            severity,
            element_id,
            participants,
            operations,
            current: None,
            canvas_version,
            detected_at,
        }
    }

    /// Record the element stamp the operations were judged against
    #[must_use]
    pub fn with_current(mut self, stamp: ElementStamp) -> Self {
        if !self.participants.contains(&stamp.participant_id) {
            self.participants.push(stamp.participant_id.clone());
        }
        self.current = Some(stamp);
        self
    }

    /// Add a participant not represented by an operation
    #[must_use]
    pub fn with_participant(mut self, participant_id: impl Into<String>) -> Self {
        let participant_id = participant_id.into();
        if !self.participants.contains(&participant_id) {
            self.participants.push(participant_id);
        }
        self
    }

    /// Operation with the greatest server receipt key
    #[must_use]
    pub fn latest_operation(&self) -> Option<&CanvasUpdate> {
        self.operations.iter().max_by_key(|op| op.receipt_key())
    }

    /// Each participant's final operation, ordered by first involvement
    #[must_use]
    pub fn latest_per_participant(&self) -> Vec<&CanvasUpdate> {
        let mut latest: Vec<&CanvasUpdate> = Vec::new();
        for op in &self.operations {
            match latest
                .iter_mut()
                .find(|l| l.participant_id == op.participant_id)
            {
                Some(slot) => {
                    if op.receipt_key() >= slot.receipt_key() {
                        *slot = op;
                    }
                }
                None => latest.push(op),
            }
        }
        latest
    }

    /// Highest sequence among the operations; orders the resolved change
    /// among clean operations of the same batch
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.operations.iter().map(|op| op.sequence).max().unwrap_or(0)
    }
}

fn severity_of(conflict_type: ConflictType, operations: &[CanvasUpdate]) -> ConflictSeverity {
    match conflict_type {
        ConflictType::PermissionConflict => ConflictSeverity::High,
        ConflictType::SimultaneousEdit => {
            if operations
                .iter()
                .any(|op| op.operation == UpdateOperation::Removed)
            {
                ConflictSeverity::High
            } else {
                ConflictSeverity::Medium
            }
        }
        ConflictType::ContentConflict
        | ConflictType::DataConflict
        | ConflictType::Unrecognized => ConflictSeverity::Medium,
        ConflictType::PositionConflict => ConflictSeverity::Low,
    }
}

fn conflict_id(
    conflict_type: ConflictType,
    element_id: &str,
    canvas_version: u64,
    operations: &[CanvasUpdate],
) -> Uuid {
    let mut name = format!("{conflict_type}:{element_id}:{canvas_version}");
    for op in operations {
        name.push(':');
        name.push_str(&op.participant_id);
        name.push('#');
        name.push_str(&op.sequence.to_string());
    }
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// Output of a detection pass
#[derive(Debug, Clone, Default)]
pub struct Detection {
    /// Operations that can be applied as-is, in submission order
    pub clean: Vec<CanvasUpdate>,
    /// Conflicts in order of their first operation
    pub conflicts: Vec<Conflict>,
}

impl Detection {
    /// Nothing to apply and nothing to resolve
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clean.is_empty() && self.conflicts.is_empty()
    }
}

/// Stateless conflict detector
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// Create a detector
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Split a batch into clean operations and conflicts
    #[must_use]
    pub fn detect(&self, canvas: &Canvas, pending: Vec<CanvasUpdate>) -> Detection {
        let mut groups: Vec<(String, Vec<(usize, CanvasUpdate)>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for (position, update) in pending.into_iter().enumerate() {
            let key = update.element_id().to_string();
            let slot = *index.entry(key.clone()).or_insert_with(|| {
                groups.push((key, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push((position, update));
        }

        let mut clean: Vec<(usize, CanvasUpdate)> = Vec::new();
        let mut conflicts: Vec<(usize, Conflict)> = Vec::new();

        for (element_id, mut ops) in groups {
            let existing = canvas.element(&element_id);
            let stamp = canvas.stamp(&element_id);

            if let Some(owner) = existing.and_then(CanvasElement::locked_by) {
                let (violating, allowed): (Vec<_>, Vec<_>) = ops
                    .into_iter()
                    .partition(|(_, op)| op.participant_id != owner);
                ops = allowed;
                if let Some(first) = violating.first().map(|(pos, _)| *pos) {
                    let operations = violating.into_iter().map(|(_, op)| op).collect();
                    let conflict = Conflict::new(
                        ConflictType::PermissionConflict,
                        element_id.clone(),
                        operations,
                        canvas.version,
                    )
                    .with_participant(owner);
                    conflicts.push((first, conflict));
                }
            }

            let Some(first) = ops.first().map(|(pos, _)| *pos) else {
                continue;
            };

            let single_writer = ops
                .iter()
                .all(|(_, op)| op.participant_id == ops[0].1.participant_id);
            let stale = ops.iter().any(|(_, op)| is_stale(op, stamp));
            let collision = collides(existing.is_some(), &ops);

            if single_writer && !stale && !collision {
                clean.extend(ops);
                continue;
            }

            let operations: Vec<CanvasUpdate> = ops.into_iter().map(|(_, op)| op).collect();
            let conflict_type = if single_writer && stale && !collision {
                ConflictType::SimultaneousEdit
            } else {
                classify(&operations)
            };
            let mut conflict =
                Conflict::new(conflict_type, element_id, operations, canvas.version);
            if stale {
                if let Some(stamp) = stamp {
                    conflict = conflict.with_current(stamp.clone());
                }
            }
            conflicts.push((first, conflict));
        }

        clean.sort_by_key(|(pos, _)| *pos);
        conflicts.sort_by_key(|(pos, _)| *pos);
        Detection {
            clean: clean.into_iter().map(|(_, op)| op).collect(),
            conflicts: conflicts.into_iter().map(|(_, c)| c).collect(),
        }
    }
}

/// Optimistic-concurrency check against the element's last change
fn is_stale(update: &CanvasUpdate, stamp: Option<&ElementStamp>) -> bool {
    match (update.base_version, stamp) {
        (Some(base), Some(stamp)) => stamp.version > base,
        _ => false,
    }
}

/// An `added` that lands on an id that is live at that point of the group
fn collides(exists_initially: bool, ops: &[(usize, CanvasUpdate)]) -> bool {
    let mut exists = exists_initially;
    for (_, op) in ops {
        match op.operation {
            UpdateOperation::Added => {
                if exists {
                    return true;
                }
                exists = true;
            }
            UpdateOperation::Removed => exists = false,
            UpdateOperation::Updated | UpdateOperation::Moved => {}
        }
    }
    false
}

fn classify(operations: &[CanvasUpdate]) -> ConflictType {
    let any = |kind: UpdateOperation| operations.iter().any(|op| op.operation == kind);
    if any(UpdateOperation::Removed) {
        ConflictType::SimultaneousEdit
    } else if any(UpdateOperation::Added) {
        ConflictType::DataConflict
    } else if operations
        .iter()
        .all(|op| op.operation == UpdateOperation::Moved)
    {
        ConflictType::PositionConflict
    } else if operations.iter().all(CanvasUpdate::is_content_only) {
        ConflictType::ContentConflict
    } else {
        ConflictType::SimultaneousEdit
    }
}
