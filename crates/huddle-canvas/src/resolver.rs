//! Conflict Resolver
//!
//! Maps each conflict type to exactly one strategy and produces an immutable
//! resolution record. Resolution is a pure function of the conflict and the
//! supporting context (current element, session facilitator): no state is
//! carried between calls and resolution ids are derived from the conflict id.
//!
//! Every resolution is marked for notification. Strategies that cannot or
//! must not decide on their own (`escalate-to-facilitator`,
//! `manual-resolution`, a failed `validate-and-merge`) come back with
//! `applied = false` and no outcome, which drops the contested operations
//! from the batch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::conflict::{Conflict, ConflictType};
use crate::error::{Error, Result};
use crate::model::{CanvasElement, CanvasUpdate, ElementPatch, Position, UpdateOperation};

/// Resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// Keep the change received last
    LastWriteWins,
    /// Union of distinct content contributions
    MergeContent,
    /// Mean of proposed positions
    AveragePosition,
    /// Hand over to the session facilitator
    EscalateToFacilitator,
    /// Validate every candidate, then merge
    ValidateAndMerge,
    /// Wait for a human decision
    ManualResolution,
}

impl ResolutionStrategy {
    /// Strategy selected for a conflict type
    #[must_use]
    pub fn for_conflict(conflict_type: ConflictType) -> Self {
        match conflict_type {
            ConflictType::SimultaneousEdit => Self::LastWriteWins,
            ConflictType::ContentConflict => Self::MergeContent,
            ConflictType::PositionConflict => Self::AveragePosition,
            ConflictType::PermissionConflict => Self::EscalateToFacilitator,
            ConflictType::DataConflict => Self::ValidateAndMerge,
            ConflictType::Unrecognized => Self::ManualResolution,
        }
    }

    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastWriteWins => "last-write-wins",
            Self::MergeContent => "merge-content",
            Self::AveragePosition => "average-position",
            Self::EscalateToFacilitator => "escalate-to-facilitator",
            Self::ValidateAndMerge => "validate-and-merge",
            Self::ManualResolution => "manual-resolution",
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One participant's content in a merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    /// Contributing participant
    pub participant_id: String,
    /// Content they proposed
    pub content: Value,
}

/// Strategy-specific resolution payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResolutionPayload {
    /// Last-write-wins outcome
    Winner {
        /// Participant whose change stands
        participant_id: String,
        /// Winning operation; `None` when the current state was kept
        operation: Option<UpdateOperation>,
    },
    /// Merged content with its contributors
    MergedContent {
        /// Merged content
        content: Value,
        /// Distinct contributions in order of involvement
        contributors: Vec<Contribution>,
    },
    /// Mean of proposed positions
    AveragedPosition {
        /// Resulting position
        position: Position,
        /// Number of proposals averaged
        proposals: usize,
    },
    /// Escalated to the facilitator
    Escalated {
        /// Facilitator of the session, if one is present
        facilitator_id: Option<String>,
    },
    /// Merged element from valid candidates
    MergedElement {
        /// Resulting element
        element: CanvasElement,
        /// Participants whose candidates were merged, oldest first
        sources: Vec<String>,
    },
    /// Merge refused
    ValidationFailed {
        /// Validation errors per candidate
        errors: Vec<String>,
    },
    /// Needs a human decision
    ManualReview {
        /// Why the conflict could not be decided automatically
        reason: String,
    },
    /// Decision taken by a participant
    ManualDecision {
        /// Participant whose operation was chosen
        winner: String,
        /// Participant who decided
        decided_by: String,
    },
}

/// Immutable record of how a conflict was settled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    /// Resolution id
    pub id: Uuid,
    /// Conflict this resolves
    pub conflict_id: Uuid,
    /// Conflict type
    pub conflict_type: ConflictType,
    /// Contested element
    pub element_id: String,
    /// Strategy used
    pub strategy: ResolutionStrategy,
    /// Strategy-specific payload
    pub payload: ResolutionPayload,
    /// Whether the outcome was (or will be) applied to the canvas
    pub applied: bool,
    /// Whether participants must be told
    pub requires_notification: bool,
    /// Change to apply to the canvas, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CanvasUpdate>,
}

/// Supporting data for a resolution
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    /// Element as currently stored
    pub current: Option<CanvasElement>,
    /// Facilitator of the session
    pub facilitator_id: Option<String>,
}

impl ResolutionContext {
    /// Set the current element
    #[must_use]
    pub fn with_current(mut self, element: Option<CanvasElement>) -> Self {
        self.current = element;
        self
    }

    /// Set the facilitator
    #[must_use]
    pub fn with_facilitator(mut self, facilitator_id: Option<String>) -> Self {
        self.facilitator_id = facilitator_id;
        self
    }
}

struct Decision {
    payload: ResolutionPayload,
    outcome: Option<CanvasUpdate>,
    applied: bool,
}

impl Decision {
    fn apply(payload: ResolutionPayload, outcome: Option<CanvasUpdate>) -> Self {
        Self {
            payload,
            outcome,
            applied: true,
        }
    }

    fn defer(payload: ResolutionPayload) -> Self {
        Self {
            payload,
            outcome: None,
            applied: false,
        }
    }
}

/// Stateless conflict resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Create a resolver
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Resolve a conflict with the strategy its type selects
    #[must_use]
    pub fn resolve(&self, conflict: &Conflict, context: &ResolutionContext) -> ConflictResolution {
        let strategy = ResolutionStrategy::for_conflict(conflict.conflict_type);
        let decision = match strategy {
            ResolutionStrategy::EscalateToFacilitator => {
                Decision::defer(ResolutionPayload::Escalated {
                    facilitator_id: context.facilitator_id.clone(),
                })
            }
            ResolutionStrategy::ManualResolution => {
                Decision::defer(ResolutionPayload::ManualReview {
                    reason: format!(
                        "{} conflicts on element {} need a human decision",
                        conflict.conflict_type, conflict.element_id
                    ),
                })
            }
            _ if conflict.operations.is_empty() => {
                Decision::defer(ResolutionPayload::ValidationFailed {
                    errors: vec!["conflict carries no operations".to_string()],
                })
            }
            ResolutionStrategy::LastWriteWins => last_write_wins(conflict),
            ResolutionStrategy::MergeContent => merge_content(conflict),
            ResolutionStrategy::AveragePosition => average_position(conflict),
            ResolutionStrategy::ValidateAndMerge => validate_and_merge(conflict, context),
        };

        ConflictResolution {
            id: resolution_id(conflict, strategy, None),
            conflict_id: conflict.id,
            conflict_type: conflict.conflict_type,
            element_id: conflict.element_id.clone(),
            strategy,
            payload: decision.payload,
            applied: decision.applied,
            requires_notification: true,
            outcome: decision.outcome,
        }
    }

    /// Settle a conflict by picking one participant's final operation
    pub fn resolve_manually(
        &self,
        conflict: &Conflict,
        winner: &str,
        decided_by: &str,
    ) -> Result<ConflictResolution> {
        let mut operation = conflict
            .latest_per_participant()
            .into_iter()
            .find(|op| op.participant_id == winner)
            .cloned()
            .ok_or_else(|| Error::ParticipantNotFound(winner.to_string()))?;
        // The decision supersedes the version the edit was based on
        operation.base_version = None;

        let strategy = ResolutionStrategy::ManualResolution;
        Ok(ConflictResolution {
            id: resolution_id(conflict, strategy, Some(winner)),
            conflict_id: conflict.id,
            conflict_type: conflict.conflict_type,
            element_id: conflict.element_id.clone(),
            strategy,
            payload: ResolutionPayload::ManualDecision {
                winner: winner.to_string(),
                decided_by: decided_by.to_string(),
            },
            applied: true,
            requires_notification: true,
            outcome: Some(operation),
        })
    }
}

fn resolution_id(conflict: &Conflict, strategy: ResolutionStrategy, winner: Option<&str>) -> Uuid {
    let name = match winner {
        Some(winner) => format!("{strategy}:{winner}"),
        None => strategy.to_string(),
    };
    Uuid::new_v5(&conflict.id, name.as_bytes())
}

/// Update credited to the latest operation of the conflict
fn derived_update(conflict: &Conflict, operation: UpdateOperation, element: ElementPatch) -> Option<CanvasUpdate> {
    let latest = conflict.latest_operation()?;
    Some(CanvasUpdate {
        operation,
        element,
        session_id: latest.session_id.clone(),
        participant_id: latest.participant_id.clone(),
        submitted_at: latest.submitted_at,
        base_version: None,
        received_at: latest.received_at,
        sequence: latest.sequence,
    })
}

fn last_write_wins(conflict: &Conflict) -> Decision {
    let Some(latest) = conflict.latest_operation() else {
        return Decision::defer(ResolutionPayload::ValidationFailed {
            errors: vec!["conflict carries no operations".to_string()],
        });
    };

    if let Some(current) = &conflict.current {
        if current.sequence > latest.sequence {
            return Decision::apply(
                ResolutionPayload::Winner {
                    participant_id: current.participant_id.clone(),
                    operation: None,
                },
                None,
            );
        }
    }

    let mut outcome = latest.clone();
    outcome.base_version = None;
    Decision::apply(
        ResolutionPayload::Winner {
            participant_id: latest.participant_id.clone(),
            operation: Some(latest.operation),
        },
        Some(outcome),
    )
}

fn merge_content(conflict: &Conflict) -> Decision {
    let mut contributors: Vec<Contribution> = Vec::new();
    let mut metadata = Map::new();
    let mut element_type = None;

    for op in conflict.latest_per_participant() {
        if let Some(content) = &op.element.content {
            if !contributors.iter().any(|c| &c.content == content) {
                contributors.push(Contribution {
                    participant_id: op.participant_id.clone(),
                    content: content.clone(),
                });
            }
        }
        if let Some(entries) = &op.element.metadata {
            metadata.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if op.element.element_type.is_some() {
            element_type.clone_from(&op.element.element_type);
        }
    }

    let content = merged_value(&contributors);
    let mut patch = ElementPatch::id(conflict.element_id.clone());
    patch.content = (!contributors.is_empty()).then(|| content.clone());
    patch.element_type = element_type;
    patch.metadata = (!metadata.is_empty()).then_some(metadata);

    Decision::apply(
        ResolutionPayload::MergedContent {
            content,
            contributors,
        },
        derived_update(conflict, UpdateOperation::Updated, patch),
    )
}

/// Strings concatenate line by line; anything else becomes a list
fn merged_value(contributors: &[Contribution]) -> Value {
    match contributors {
        [] => Value::Null,
        [single] => single.content.clone(),
        many => {
            let texts: Option<Vec<&str>> = many.iter().map(|c| c.content.as_str()).collect();
            match texts {
                Some(texts) => Value::String(texts.join("\n")),
                None => Value::Array(many.iter().map(|c| c.content.clone()).collect()),
            }
        }
    }
}

fn average_position(conflict: &Conflict) -> Decision {
    let proposals: Vec<Position> = conflict
        .latest_per_participant()
        .into_iter()
        .filter_map(|op| op.element.position)
        .collect();

    let Some(position) = Position::mean(&proposals) else {
        return Decision::defer(ResolutionPayload::ValidationFailed {
            errors: vec!["no position proposals to average".to_string()],
        });
    };

    let patch = ElementPatch::id(conflict.element_id.clone()).with_position(position);
    Decision::apply(
        ResolutionPayload::AveragedPosition {
            position,
            proposals: proposals.len(),
        },
        derived_update(conflict, UpdateOperation::Moved, patch),
    )
}

fn validate_and_merge(conflict: &Conflict, context: &ResolutionContext) -> Decision {
    let mut ordered: Vec<&CanvasUpdate> = conflict.operations.iter().collect();
    ordered.sort_by_key(|op| op.receipt_key());

    let mut candidates: Vec<(&str, CanvasElement)> = Vec::new();
    let mut errors = Vec::new();
    for op in ordered {
        let candidate = match op.operation {
            UpdateOperation::Added => op.element.to_element().ok_or_else(|| {
                format!(
                    "candidate from {} lacks a type or position",
                    op.participant_id
                )
            }),
            UpdateOperation::Updated | UpdateOperation::Moved => match &context.current {
                Some(current) => {
                    let mut candidate = current.clone();
                    op.element.apply_to(&mut candidate);
                    Ok(candidate)
                }
                None => Err(format!(
                    "candidate from {} edits an element that does not exist",
                    op.participant_id
                )),
            },
            UpdateOperation::Removed => Err(format!(
                "candidate from {} removes the element and cannot be merged",
                op.participant_id
            )),
        };

        match candidate.and_then(|c| {
            c.validate()
                .map(|()| c)
                .map_err(|e| format!("candidate from {}: {e}", op.participant_id))
        }) {
            Ok(candidate) => candidates.push((op.participant_id.as_str(), candidate)),
            Err(e) => errors.push(e),
        }
    }

    if !errors.is_empty() {
        return Decision::defer(ResolutionPayload::ValidationFailed { errors });
    }

    let mut merged = match (&context.current, candidates.first()) {
        (Some(current), _) => current.clone(),
        (None, Some((_, first))) => first.clone(),
        (None, None) => {
            return Decision::defer(ResolutionPayload::ValidationFailed {
                errors: vec!["no candidates to merge".to_string()],
            })
        }
    };

    let mut sources: Vec<String> = Vec::new();
    for (participant, candidate) in &candidates {
        merged.element_type.clone_from(&candidate.element_type);
        merged.position = candidate.position;
        if !candidate.content.is_null() {
            merged.content = candidate.content.clone();
        }
        merged.metadata.extend(
            candidate
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if !sources.iter().any(|s| s == participant) {
            sources.push((*participant).to_string());
        }
    }
    merged.id.clone_from(&conflict.element_id);

    let operation = if context.current.is_some() {
        UpdateOperation::Updated
    } else {
        UpdateOperation::Added
    };
    let outcome = derived_update(conflict, operation, ElementPatch::full(&merged));
    Decision::apply(
        ResolutionPayload::MergedElement {
            element: merged,
            sources,
        },
        outcome,
    )
}
