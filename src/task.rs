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

//! # Veld Task Module
//!
//! A [`VeldTask`] is the unit of data that flows between pipeline stages: a
//! batch of records plus an identifier and the dataset it belongs to. A task
//! is owned exclusively by whichever stage currently holds it; ownership
//! transfers by move when it is handed downstream, so a stage can never
//! mutate a task it has already emitted.

use serde::{Deserialize, Serialize};

use crate::record::VeldRecordBatch;

/// Unit of work passed between pipeline stages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VeldTask {
    /// Unique task identifier within a pipeline run.
    pub id: String,

    /// Name of the dataset this task belongs to.
    pub dataset_name: String,

    /// The batch of records carried by this task.
    pub data: VeldRecordBatch,

    /// Delivery attempts consumed so far; executor bookkeeping, never persisted.
    #[serde(skip)]
    pub(crate) attempts: u32,
}

impl VeldTask {
    /// Constructs a task from an id, dataset name, and record batch.
    pub fn new(
        id: impl Into<String>,
        dataset_name: impl Into<String>,
        data: VeldRecordBatch,
    ) -> Self {
        VeldTask {
            id: id.into(),
            dataset_name: dataset_name.into(),
            data,
            attempts: 0,
        }
    }

    /// Number of records carried by the task.
    pub fn num_records(&self) -> usize {
        self.data.len()
    }

    /// True when every record carries all of the named columns.
    pub fn has_columns<'a>(&self, columns: impl IntoIterator<Item = &'a str>) -> bool {
        let columns: Vec<&str> = columns.into_iter().collect();
        self.data
            .iter()
            .all(|record| columns.iter().all(|c| record.has_column(c)))
    }

    /// Splits the task into up to `parts` smaller tasks for fan-out.
    ///
    /// Child tasks are suffixed `<id>/0`, `<id>/1`, ... and inherit the
    /// dataset name. An empty task splits into nothing.
    pub fn split(self, parts: usize) -> Vec<VeldTask> {
        if self.data.is_empty() {
            return Vec::new();
        }
        if parts <= 1 || self.data.len() == 1 {
            return vec![self];
        }

        let parts = parts.min(self.data.len());
        let chunk_size = (self.data.len() + parts - 1) / parts;
        let mut out = Vec::with_capacity(parts);
        let mut chunk = Vec::with_capacity(chunk_size);

        for record in self.data {
            chunk.push(record);
            if chunk.len() == chunk_size {
                out.push(VeldTask::new(
                    format!("{}/{}", self.id, out.len()),
                    self.dataset_name.clone(),
                    std::mem::take(&mut chunk),
                ));
            }
        }
        if !chunk.is_empty() {
            out.push(VeldTask::new(
                format!("{}/{}", self.id, out.len()),
                self.dataset_name.clone(),
                chunk,
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VeldRecord;
    use serde_json::json;

    fn task_with(n: usize) -> VeldTask {
        let data = (0..n)
            .map(|i| VeldRecord::new(Some(format!("r{i}")), json!({"text": i})))
            .collect();
        VeldTask::new("t0", "ds", data)
    }

    #[test]
    fn split_preserves_all_records() {
        let parts = task_with(10).split(3);
        assert_eq!(parts.len(), 3);
        let total: usize = parts.iter().map(VeldTask::num_records).sum();
        assert_eq!(total, 10);
        assert_eq!(parts[0].id, "t0/0");
        assert_eq!(parts[2].dataset_name, "ds");
    }

    #[test]
    fn split_more_parts_than_records() {
        let parts = task_with(2).split(8);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|t| t.num_records() == 1));
    }

    #[test]
    fn empty_task_splits_to_nothing() {
        assert!(task_with(0).split(4).is_empty());
    }

    #[test]
    fn column_presence() {
        let task = VeldTask::new(
            "t",
            "ds",
            vec![
                VeldRecord::new(None, json!({"text": "a", "lang": "en"})),
                VeldRecord::new(None, json!({"text": "b", "lang": "de"})),
            ],
        );
        assert!(task.has_columns(["text", "lang"]));
        assert!(!task.has_columns(["text", "embedding"]));
    }
}
