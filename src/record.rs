//! Copyright © 2025-2026 Veld Team. All Rights Reserved.
//!
//! This file is part of Veld.
//! The Veld project belongs to the Veld Team.
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! You may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//!     http://www.apache.org/licenses/LICENSE-2.0
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

//! # Veld Record Module
//!
//! The core row representation carried inside tasks. A record's payload is a
//! JSON object whose keys are the named columns a stage declares through its
//! input/output attributes; readers and writers outside the engine are
//! responsible for producing and consuming these uniform rows.
//!
//! Records are immutable from the consumer's perspective: a stage that needs
//! to modify a record produces a new one with updated attributes rather than
//! mutating in place, preserving reproducibility across retries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Generic metadata map that may accompany a record.
pub type VeldMetadata = Map<String, Value>;

/// Fundamental row unit carried inside a [`crate::task::VeldTask`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VeldRecord {
    /// Optional stable identifier for the record.
    pub id: Option<String>,

    /// Primary payload; a JSON object keyed by column name.
    pub payload: Value,

    /// Additional attributes such as scores, tags, or provenance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<VeldMetadata>,
}

impl VeldRecord {
    /// Constructs a record with the given payload and optional identifier.
    pub fn new(id: impl Into<Option<String>>, payload: Value) -> Self {
        VeldRecord {
            id: id.into(),
            payload,
            metadata: None,
        }
    }

    /// Attaches metadata to the record.
    pub fn with_metadata(mut self, metadata: VeldMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// True when the payload object carries the named column.
    pub fn has_column(&self, column: &str) -> bool {
        self.payload
            .as_object()
            .map(|obj| obj.contains_key(column))
            .unwrap_or(false)
    }

    /// Returns the named column value, if present.
    pub fn column(&self, column: &str) -> Option<&Value> {
        self.payload.as_object().and_then(|obj| obj.get(column))
    }
}

/// Convenience alias for working on batches of records.
pub type VeldRecordBatch = Vec<VeldRecord>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn column_access() {
        let record = VeldRecord::new(
            Some("r1".to_string()),
            json!({"text": "hello", "score": 0.9}),
        );
        assert!(record.has_column("text"));
        assert!(!record.has_column("embedding"));
        assert_eq!(record.column("score"), Some(&json!(0.9)));
    }

    #[test]
    fn non_object_payload_has_no_columns() {
        let record = VeldRecord::new(None, json!("bare string"));
        assert!(!record.has_column("text"));
        assert_eq!(record.column("text"), None);
    }
}
