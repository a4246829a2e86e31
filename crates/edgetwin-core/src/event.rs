//! Event metadata attached to every published event.

use serde::{Deserialize, Serialize};

/// Metadata carried alongside an event on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier
    pub event_id: String,
    /// Publish time (unix millis)
    pub timestamp: i64,
    /// Component that published the event
    pub source: String,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: crate::now_millis(),
            source: source.into(),
        }
    }
}
