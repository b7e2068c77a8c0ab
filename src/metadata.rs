//! Model metadata
//!
//! A lightweight record of where a model came from: when it was built, the
//! hash of the graph definition it was trained against, and free-form
//! custom fields. Travels inside the persistence envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Creation timestamp.
    pub created: DateTime<Utc>,

    /// Hex SHA-256 of the serialized graph definition.
    pub graph_hash: String,

    /// Description of the trainer that produced the model, if any.
    pub trainer: Option<String>,

    /// Custom metadata fields.
    pub custom: HashMap<String, serde_json::Value>,
}

impl ModelMetadata {
    /// Create new metadata stamped with the current time.
    pub fn new(graph_hash: impl Into<String>) -> Self {
        Self {
            created: Utc::now(),
            graph_hash: graph_hash.into(),
            trainer: None,
            custom: HashMap::new(),
        }
    }

    /// Record the trainer description.
    pub fn with_trainer(mut self, trainer: impl Into<String>) -> Self {
        self.trainer = Some(trainer.into());
        self
    }

    /// Add a custom metadata field.
    pub fn with_custom(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_builder() {
        let meta = ModelMetadata::new("abc123")
            .with_trainer("graph-trainer(epochs=5)")
            .with_custom("epochs", serde_json::json!(5));
        assert_eq!(meta.graph_hash, "abc123");
        assert_eq!(meta.trainer.as_deref(), Some("graph-trainer(epochs=5)"));
        assert_eq!(meta.custom["epochs"], serde_json::json!(5));
    }

    #[test]
    fn test_metadata_serde_round_trip() {
        let meta = ModelMetadata::new("hash").with_custom("k", serde_json::json!("v"));
        let json = serde_json::to_string(&meta).unwrap();
        let back: ModelMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
    }
}
