use crate::error::{OpossumError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single `(key, value)` tag attached to an event.
///
/// Tags are the indexing dimension for cross-stream queries; an event
/// may carry multiple tags sharing a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An unpersisted event awaiting assignment of a sequence position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(rename = "event")]
    pub payload: serde_json::Value,
    pub tags: Vec<Tag>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value, tags: Vec<Tag>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            tags,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.event_type.is_empty() {
            return Err(OpossumError::InvalidArgument(
                "event_type cannot be empty".to_string(),
            ));
        }
        for tag in &self.tags {
            if tag.key.is_empty() {
                return Err(OpossumError::InvalidArgument(
                    "tag key cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Metadata stamped onto an event at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "correlationId", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(rename = "causationId", default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    #[serde(rename = "operationId", default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            operation_id: None,
            user_id: None,
        }
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// An event augmented with the position the ledger assigned it.
/// This is the shape returned by `read` and persisted to
/// an event file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub position: i64,
    pub event: Event,
    pub metadata: EventMetadata,
}

impl SequencedEvent {
    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    pub fn tags(&self) -> &[Tag] {
        &self.event.tags
    }

    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.event
            .tags
            .iter()
            .any(|t| t.key == key && t.value == value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_event_type() {
        let event = Event::new("", serde_json::json!({}), vec![]);
        assert!(event.validate().is_err());
    }

    #[test]
    fn rejects_empty_tag_key() {
        let event = Event::new(
            "course.created",
            serde_json::json!({}),
            vec![Tag::new("", "C1")],
        );
        assert!(event.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_event() {
        let event = Event::new(
            "course.created",
            serde_json::json!({"capacity": 2}),
            vec![Tag::new("courseId", "C1")],
        );
        assert!(event.validate().is_ok());
    }
}
