//! Suggestion advisor seam
//!
//! Suggestion content is produced elsewhere; the collaboration core only
//! forwards a canvas snapshot and relays whatever comes back to the
//! requesting participant.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::CanvasElement;

/// Request handed to an advisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionRequest {
    /// Session the request came from
    pub session_id: String,
    /// Requesting participant
    pub participant_id: String,
    /// Canvas contents at request time
    pub elements: Vec<CanvasElement>,
    /// Canvas version of `elements`
    pub canvas_version: u64,
    /// Free-form prompt
    #[serde(default)]
    pub prompt: Option<String>,
}

/// One suggestion produced by an advisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Suggestion id
    pub id: Uuid,
    /// Kind tag (e.g. "cluster", "idea")
    pub kind: String,
    /// Human-readable text
    pub text: String,
    /// Element the suggestion refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    /// Advisor confidence in `0.0..=1.0`
    #[serde(default)]
    pub confidence: f32,
}

impl Suggestion {
    /// Create a suggestion
    #[must_use]
    pub fn new(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            text: text.into(),
            element_id: None,
            confidence: 0.0,
        }
    }

    /// Attach the element the suggestion refers to
    #[must_use]
    pub fn for_element(mut self, element_id: impl Into<String>) -> Self {
        self.element_id = Some(element_id.into());
        self
    }

    /// Set the confidence, clamped to `0.0..=1.0`
    #[must_use]
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }

    /// Normalize an advisor answer against the snapshot it was produced
    /// for: the confidence is clamped and a reference to an element the
    /// snapshot does not hold is dropped
    #[must_use]
    pub fn checked_against(mut self, elements: &[CanvasElement]) -> Self {
        let element_id = self.element_id.take();
        let confidence = self.confidence;
        let checked = self.with_confidence(confidence);
        match element_id {
            Some(id) if elements.iter().any(|e| e.id == id) => checked.for_element(id),
            _ => checked,
        }
    }
}

/// Opaque async suggestion generator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SuggestionAdvisor: Send + Sync {
    /// Advisor name for logs
    fn name(&self) -> &str;

    /// Produce suggestions for a canvas snapshot
    async fn suggest(&self, request: SuggestionRequest) -> Result<Vec<Suggestion>>;
}

/// Advisor that never suggests anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAdvisor;

#[async_trait]
impl SuggestionAdvisor for NoopAdvisor {
    fn name(&self) -> &str {
        "noop"
    }

    async fn suggest(&self, _request: SuggestionRequest) -> Result<Vec<Suggestion>> {
        Ok(Vec::new())
    }
}

/// Advisor for deployments with suggestions switched off
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledAdvisor;

#[async_trait]
impl SuggestionAdvisor for DisabledAdvisor {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn suggest(&self, _request: SuggestionRequest) -> Result<Vec<Suggestion>> {
        Err(Error::advisor("suggestions are disabled on this server"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Position;

    fn request() -> SuggestionRequest {
        SuggestionRequest {
            session_id: "s1".to_string(),
            participant_id: "p1".to_string(),
            elements: Vec::new(),
            canvas_version: 0,
            prompt: None,
        }
    }

    #[tokio::test]
    async fn test_noop_advisor() {
        let advisor = NoopAdvisor;
        assert_eq!(advisor.name(), "noop");
        assert!(advisor.suggest(request()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_advisor_refuses() {
        let err = DisabledAdvisor.suggest(request()).await.unwrap_err();
        assert_eq!(err.code(), "advisor_error");
    }

    #[test]
    fn test_confidence_is_clamped() {
        let suggestion = Suggestion::new("idea", "group the blue notes").with_confidence(1.7);
        assert!((suggestion.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_suggestion_checked_against_snapshot() {
        let elements = vec![CanvasElement::new("e1", "note", Position::new(0.0, 0.0))];

        let kept = Suggestion::new("cluster", "pair these")
            .for_element("e1")
            .checked_against(&elements);
        assert_eq!(kept.element_id.as_deref(), Some("e1"));

        let mut stray = Suggestion::new("cluster", "pair these").for_element("gone");
        stray.confidence = f32::NAN;
        let stray = stray.checked_against(&elements);
        assert!(stray.element_id.is_none());
        assert!(stray.confidence.abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_mock_advisor() {
        let mut advisor = MockSuggestionAdvisor::new();
        advisor
            .expect_suggest()
            .withf(|req| req.session_id == "s1")
            .returning(|_| Ok(vec![Suggestion::new("cluster", "merge e1 and e2").for_element("e1")]));

        let suggestions = advisor.suggest(request()).await.unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].element_id.as_deref(), Some("e1"));
    }
}
