//! Canvas data model
//!
//! A canvas is the shared, versioned workspace of one session. Elements are
//! kept in insertion order and are unique by id; every applied update bumps
//! the canvas version by exactly one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Longest element id accepted at ingress
const MAX_ELEMENT_ID_LEN: usize = 128;

/// Metadata key naming the only participant allowed to change an element
pub const LOCKED_BY_KEY: &str = "locked_by";

/// A 2D position on the canvas
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

impl Position {
    /// Create a position
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Both coordinates are finite numbers
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Arithmetic mean of a set of positions
    #[must_use]
    pub fn mean<'a>(positions: impl IntoIterator<Item = &'a Position>) -> Option<Self> {
        let (mut sum_x, mut sum_y, mut count) = (0.0, 0.0, 0u32);
        for p in positions {
            sum_x += p.x;
            sum_y += p.y;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        let n = f64::from(count);
        Some(Self::new(sum_x / n, sum_y / n))
    }
}

/// An element placed on a canvas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasElement {
    /// Element id, unique within its canvas
    pub id: String,

    /// Free-form type tag (sticky note, cluster, arrow, ...)
    #[serde(rename = "type")]
    pub element_type: String,

    /// Content payload
    #[serde(default)]
    pub content: Value,

    /// Position on the canvas
    pub position: Position,

    /// Metadata bag
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CanvasElement {
    /// Create an element with empty content
    #[must_use]
    pub fn new(id: impl Into<String>, element_type: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            element_type: element_type.into(),
            content: Value::Null,
            position,
            metadata: Map::new(),
        }
    }

    /// Set the content payload
    #[must_use]
    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    /// Set a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Participant holding the lock on this element, if any
    #[must_use]
    pub fn locked_by(&self) -> Option<&str> {
        self.metadata.get(LOCKED_BY_KEY).and_then(Value::as_str)
    }

    /// Structural validation used by validate-and-merge
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("element id is empty".to_string());
        }
        if self.element_type.trim().is_empty() {
            return Err(format!("element {} has an empty type", self.id));
        }
        if !self.position.is_finite() {
            return Err(format!("element {} has a non-finite position", self.id));
        }
        Ok(())
    }
}

/// A full or partial element carried by an update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementPatch {
    /// Target element id
    pub id: String,

    /// New type tag
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<String>,

    /// New content payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,

    /// New position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,

    /// Metadata entries to merge (a null value removes the key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ElementPatch {
    /// Patch that only names the target element
    #[must_use]
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Set the position
    #[must_use]
    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    /// Set the content
    #[must_use]
    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    /// Set the type tag
    #[must_use]
    pub fn with_type(mut self, element_type: impl Into<String>) -> Self {
        self.element_type = Some(element_type.into());
        self
    }

    /// Set the metadata entries
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Build a full element; requires a type and a position
    #[must_use]
    pub fn to_element(&self) -> Option<CanvasElement> {
        let element_type = self.element_type.clone()?;
        let position = self.position?;
        let mut element = CanvasElement::new(self.id.clone(), element_type, position);
        if let Some(content) = &self.content {
            element.content = content.clone();
        }
        if let Some(metadata) = &self.metadata {
            element.metadata = metadata
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }
        Some(element)
    }

    /// Apply present fields onto an element
    pub fn apply_to(&self, element: &mut CanvasElement) {
        if let Some(element_type) = &self.element_type {
            element.element_type = element_type.clone();
        }
        if let Some(content) = &self.content {
            element.content = content.clone();
        }
        if let Some(position) = self.position {
            element.position = position;
        }
        if let Some(metadata) = &self.metadata {
            for (key, value) in metadata {
                if value.is_null() {
                    element.metadata.remove(key);
                } else {
                    element.metadata.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Patch replacing every field of an element
    #[must_use]
    pub fn full(element: &CanvasElement) -> Self {
        Self {
            id: element.id.clone(),
            element_type: Some(element.element_type.clone()),
            content: Some(element.content.clone()),
            position: Some(element.position),
            metadata: Some(element.metadata.clone()),
        }
    }

    fn has_changes(&self) -> bool {
        self.element_type.is_some()
            || self.content.is_some()
            || self.position.is_some()
            || self.metadata.is_some()
    }
}

/// Kind of canvas mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOperation {
    /// Element created
    Added,
    /// Element fields changed
    Updated,
    /// Element deleted
    Removed,
    /// Element repositioned
    Moved,
}

impl UpdateOperation {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Removed => "removed",
            Self::Moved => "moved",
        }
    }
}

impl std::fmt::Display for UpdateOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canvas update as submitted by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Operation tag
    pub operation: UpdateOperation,
    /// Target element
    pub element: ElementPatch,
    /// Client submission time (display only)
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    /// Element version the client based this edit on
    #[serde(default)]
    pub base_version: Option<u64>,
}

impl UpdateRequest {
    /// Create a request
    #[must_use]
    pub fn new(operation: UpdateOperation, element: ElementPatch) -> Self {
        Self {
            operation,
            element,
            submitted_at: None,
            base_version: None,
        }
    }

    /// Set the base version
    #[must_use]
    pub fn with_base_version(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    /// Ingress validation; malformed updates never reach the batcher.
    /// Surrounding whitespace is stripped from the element id and type.
    pub fn validate(&mut self) -> Result<()> {
        let trimmed = self.element.id.trim();
        if trimmed.len() != self.element.id.len() {
            self.element.id = trimmed.to_string();
        }
        if let Some(element_type) = &mut self.element.element_type {
            let trimmed = element_type.trim();
            if trimmed.len() != element_type.len() {
                *element_type = trimmed.to_string();
            }
        }

        let id = self.element.id.as_str();
        if id.is_empty() {
            return Err(Error::invalid_update("element id is required"));
        }
        if id.len() > MAX_ELEMENT_ID_LEN {
            return Err(Error::invalid_update(format!(
                "element id longer than {MAX_ELEMENT_ID_LEN} characters"
            )));
        }
        if let Some(position) = &self.element.position {
            if !position.is_finite() {
                return Err(Error::invalid_update("position must be finite"));
            }
        }
        if self.element.element_type.as_deref() == Some("") {
            return Err(Error::invalid_update("element type must not be empty"));
        }
        match self.operation {
            UpdateOperation::Added => {
                if self.element.element_type.is_none() {
                    return Err(Error::invalid_update("added element requires a type"));
                }
                if self.element.position.is_none() {
                    return Err(Error::invalid_update("added element requires a position"));
                }
            }
            UpdateOperation::Moved => {
                if self.element.position.is_none() {
                    return Err(Error::invalid_update("move requires a position"));
                }
            }
            UpdateOperation::Updated => {
                if !self.element.has_changes() {
                    return Err(Error::invalid_update("update carries no changes"));
                }
            }
            UpdateOperation::Removed => {}
        }
        Ok(())
    }
}

/// A validated update flowing through the batcher and store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasUpdate {
    /// Operation tag
    pub operation: UpdateOperation,
    /// Target element, full or partial
    pub element: ElementPatch,
    /// Origin session
    pub session_id: String,
    /// Submitting participant
    pub participant_id: String,
    /// Client submission time
    pub submitted_at: DateTime<Utc>,
    /// Element version the client based this edit on
    #[serde(default)]
    pub base_version: Option<u64>,
    /// Server receipt time, stamped by the batcher
    #[serde(default)]
    pub received_at: DateTime<Utc>,
    /// Server receipt sequence, stamped by the batcher
    #[serde(default)]
    pub sequence: u64,
}

impl CanvasUpdate {
    /// Build an update from a validated request
    #[must_use]
    pub fn from_request(
        request: UpdateRequest,
        session_id: impl Into<String>,
        participant_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            operation: request.operation,
            element: request.element,
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            submitted_at: request.submitted_at.unwrap_or(now),
            base_version: request.base_version,
            received_at: now,
            sequence: 0,
        }
    }

    /// Target element id
    #[must_use]
    pub fn element_id(&self) -> &str {
        &self.element.id
    }

    /// Server receipt ordering key. Receipt times can tie or step back
    /// with the wall clock; the sequence cannot.
    #[must_use]
    pub fn receipt_key(&self) -> u64 {
        self.sequence
    }

    /// Update that changes fields other than position
    #[must_use]
    pub fn is_content_only(&self) -> bool {
        self.operation == UpdateOperation::Updated && self.element.position.is_none()
    }
}

/// Who changed an element last, and at which canvas version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementStamp {
    /// Canvas version produced by the change
    pub version: u64,
    /// Participant that made the change
    pub participant_id: String,
    /// Receipt sequence of the update behind the change
    #[serde(default)]
    pub sequence: u64,
    /// When the change was applied
    pub modified_at: DateTime<Utc>,
}

/// Result of applying one update to a canvas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    /// Operation that was applied
    pub operation: UpdateOperation,
    /// Element after the change (the removed element for removals)
    pub element: CanvasElement,
    /// Canvas version after the change
    pub version: u64,
    /// Participant credited with the change
    pub participant_id: String,
    /// When the change was applied
    pub applied_at: DateTime<Utc>,
}

/// A versioned canvas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Canvas {
    /// Canvas id (equal to the session id)
    pub id: String,

    /// Elements in insertion order
    pub elements: Vec<CanvasElement>,

    /// Strictly increasing version
    pub version: u64,

    /// Participant behind the last applied change
    pub last_modified_by: Option<String>,

    /// When the last change was applied
    pub last_modified_at: DateTime<Utc>,

    /// Per-element change stamps
    #[serde(default)]
    pub stamps: HashMap<String, ElementStamp>,
}

impl Canvas {
    /// Create an empty canvas at version 0
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            elements: Vec::new(),
            version: 0,
            last_modified_by: None,
            last_modified_at: Utc::now(),
            stamps: HashMap::new(),
        }
    }

    /// Get an element by id
    #[must_use]
    pub fn element(&self, element_id: &str) -> Option<&CanvasElement> {
        self.elements.iter().find(|e| e.id == element_id)
    }

    /// Get the change stamp of an element
    #[must_use]
    pub fn stamp(&self, element_id: &str) -> Option<&ElementStamp> {
        self.stamps.get(element_id)
    }

    /// Highest receipt sequence recorded in the element stamps
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.stamps.values().map(|s| s.sequence).max().unwrap_or(0)
    }

    /// Number of elements
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Apply one update, bumping the version on success
    pub fn apply(&mut self, update: &CanvasUpdate) -> Result<AppliedChange> {
        let element_id = update.element_id().to_string();
        let element = match update.operation {
            UpdateOperation::Added => {
                if self.element(&element_id).is_some() {
                    return Err(Error::ElementExists(element_id));
                }
                let element = update
                    .element
                    .to_element()
                    .ok_or_else(|| Error::invalid_update("added element requires a type and position"))?;
                self.elements.push(element.clone());
                element
            }
            UpdateOperation::Updated => {
                let target = self.element_mut(&element_id)?;
                update.element.apply_to(target);
                target.clone()
            }
            UpdateOperation::Moved => {
                let position = update
                    .element
                    .position
                    .ok_or_else(|| Error::invalid_update("move requires a position"))?;
                let target = self.element_mut(&element_id)?;
                target.position = position;
                target.clone()
            }
            UpdateOperation::Removed => {
                let pos = self
                    .elements
                    .iter()
                    .position(|e| e.id == element_id)
                    .ok_or_else(|| Error::ElementNotFound(element_id.clone()))?;
                self.elements.remove(pos)
            }
        };

        let now = Utc::now();
        self.version += 1;
        self.last_modified_by = Some(update.participant_id.clone());
        self.last_modified_at = now;
        if update.operation == UpdateOperation::Removed {
            self.stamps.remove(&element_id);
        } else {
            self.stamps.insert(
                element_id,
                ElementStamp {
                    version: self.version,
                    participant_id: update.participant_id.clone(),
                    sequence: update.sequence,
                    modified_at: now,
                },
            );
        }

        Ok(AppliedChange {
            operation: update.operation,
            element,
            version: self.version,
            participant_id: update.participant_id.clone(),
            applied_at: now,
        })
    }

    fn element_mut(&mut self, element_id: &str) -> Result<&mut CanvasElement> {
        self.elements
            .iter_mut()
            .find(|e| e.id == element_id)
            .ok_or_else(|| Error::ElementNotFound(element_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(op: UpdateOperation, patch: ElementPatch) -> CanvasUpdate {
        CanvasUpdate::from_request(UpdateRequest::new(op, patch), "s1", "p1")
    }

    fn add(id: &str, x: f64, y: f64) -> CanvasUpdate {
        update(
            UpdateOperation::Added,
            ElementPatch::id(id)
                .with_type("note")
                .with_position(Position::new(x, y)),
        )
    }

    #[test]
    fn test_position_mean() {
        let points = [Position::new(30.0, 30.0), Position::new(50.0, 10.0)];
        assert_eq!(Position::mean(&points), Some(Position::new(40.0, 20.0)));
        assert_eq!(Position::mean(&[]), None);
    }

    #[test]
    fn test_apply_bumps_version_per_change() {
        let mut canvas = Canvas::new("c1");
        let first = canvas.apply(&add("e1", 1.0, 2.0)).unwrap();
        let second = canvas
            .apply(&update(
                UpdateOperation::Moved,
                ElementPatch::id("e1").with_position(Position::new(5.0, 5.0)),
            ))
            .unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(canvas.element("e1").unwrap().position, Position::new(5.0, 5.0));
        assert_eq!(canvas.stamp("e1").unwrap().version, 2);
    }

    #[test]
    fn test_apply_not_found_leaves_version() {
        let mut canvas = Canvas::new("c1");
        let err = canvas
            .apply(&update(UpdateOperation::Removed, ElementPatch::id("ghost")))
            .unwrap_err();
        assert!(matches!(err, Error::ElementNotFound(_)));
        assert_eq!(canvas.version, 0);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let mut canvas = Canvas::new("c1");
        canvas.apply(&add("e1", 0.0, 0.0)).unwrap();
        assert!(matches!(
            canvas.apply(&add("e1", 1.0, 1.0)),
            Err(Error::ElementExists(_))
        ));
        assert_eq!(canvas.element_count(), 1);
    }

    #[test]
    fn test_remove_keeps_order_of_rest() {
        let mut canvas = Canvas::new("c1");
        for id in ["a", "b", "c"] {
            canvas.apply(&add(id, 0.0, 0.0)).unwrap();
        }
        canvas
            .apply(&update(UpdateOperation::Removed, ElementPatch::id("b")))
            .unwrap();
        let ids: Vec<_> = canvas.elements.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(canvas.stamp("b").is_none());
    }

    #[test]
    fn test_patch_metadata_null_removes_key() {
        let mut element = CanvasElement::new("e1", "note", Position::new(0.0, 0.0))
            .with_metadata("color", json!("yellow"))
            .with_metadata("locked_by", json!("p1"));
        let mut metadata = Map::new();
        metadata.insert("locked_by".to_string(), Value::Null);
        ElementPatch::id("e1")
            .with_metadata(metadata)
            .apply_to(&mut element);

        assert!(element.locked_by().is_none());
        assert_eq!(element.metadata.get("color"), Some(&json!("yellow")));
    }

    #[test]
    fn test_request_validation() {
        let mut missing_type =
            UpdateRequest::new(UpdateOperation::Added, ElementPatch::id("e1").with_position(Position::new(0.0, 0.0)));
        assert!(missing_type.validate().is_err());

        let mut bad_move = UpdateRequest::new(UpdateOperation::Moved, ElementPatch::id("e1"));
        assert!(bad_move.validate().is_err());

        let mut nan = UpdateRequest::new(
            UpdateOperation::Moved,
            ElementPatch::id("e1").with_position(Position::new(f64::NAN, 0.0)),
        );
        assert!(nan.validate().is_err());

        let mut empty_update = UpdateRequest::new(UpdateOperation::Updated, ElementPatch::id("e1"));
        assert!(empty_update.validate().is_err());

        let mut remove = UpdateRequest::new(UpdateOperation::Removed, ElementPatch::id("e1"));
        assert!(remove.validate().is_ok());
    }

    #[test]
    fn test_validation_trims_ids_and_rejects_blank_types() {
        let mut padded = UpdateRequest::new(UpdateOperation::Removed, ElementPatch::id("  e1 "));
        padded.validate().unwrap();
        assert_eq!(padded.element.id, "e1");

        let mut blank_type =
            UpdateRequest::new(UpdateOperation::Updated, ElementPatch::id("e1").with_type("   "));
        let err = blank_type.validate().unwrap_err();
        assert_eq!(err.code(), "invalid_update");

        let mut retype = UpdateRequest::new(UpdateOperation::Updated, ElementPatch::id("e1").with_type(" card "));
        retype.validate().unwrap();
        assert_eq!(retype.element.element_type.as_deref(), Some("card"));
    }

    #[test]
    fn test_stamp_records_receipt_sequence() {
        let mut canvas = Canvas::new("c1");
        let mut first = add("e1", 0.0, 0.0);
        first.sequence = 7;
        let mut second = add("e2", 0.0, 0.0);
        second.sequence = 3;
        canvas.apply(&first).unwrap();
        canvas.apply(&second).unwrap();

        assert_eq!(canvas.stamp("e1").unwrap().sequence, 7);
        assert_eq!(canvas.last_sequence(), 7);
    }

    #[test]
    fn test_element_wire_format_uses_type_key() {
        let element = CanvasElement::new("e1", "sticky", Position::new(1.0, 2.0));
        let json = serde_json::to_value(&element).unwrap();
        assert_eq!(json["type"], "sticky");
        assert_eq!(json["position"]["x"], 1.0);
    }
}
