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

//! # Veld Duplicate Identification Stage
//!
//! Thresholds pairwise rows with a tolerance `eps` and emits only the ids to
//! remove; the surviving dataset is produced externally by joining these ids
//! against the original records.
//!
//! Pairwise partitions arrive in keeper-priority order, so a single in-order
//! scan per partition decides every pair: a record is a duplicate only when
//! its most similar counterpart meets the threshold *and* has already been
//! retained. The keeper of every matched pair is therefore the
//! higher-priority record, exactly one id of the pair is marked, and a rerun
//! over identical input reproduces the same set.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use super::store::{self, VeldDuplicateRow, VeldPairwiseRow};
use crate::errors::{Result, VeldError};

/// Threshold-based duplicate selection over pairwise partitions.
#[derive(Clone, Debug)]
pub struct VeldIdentifyDuplicatesStage {
    input_path: PathBuf,
    output_path: PathBuf,
    eps: f32,
}

impl VeldIdentifyDuplicatesStage {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        VeldIdentifyDuplicatesStage {
            input_path: input_path.into(),
            output_path: output_path.into(),
            eps: 0.01,
        }
    }

    /// Two records are duplicates when `similarity_score >= 1.0 - eps`.
    pub fn eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Processes every pairwise partition and returns the number of
    /// duplicate ids written.
    pub fn run(&self) -> Result<u64> {
        if self.eps < 0.0 || !self.eps.is_finite() {
            return Err(VeldError::validation(format!(
                "eps must be a non-negative number, got {}",
                self.eps
            )));
        }
        let partitions = store::list_partitions(&self.input_path)?;
        if partitions.is_empty() {
            return Err(VeldError::validation(format!(
                "no pairwise partitions found under '{}'",
                self.input_path.display()
            )));
        }
        let threshold = 1.0 - self.eps;

        // Clusters are disjoint, so partitions are independent.
        let counts: Vec<u64> = partitions
            .par_iter()
            .map(|path| -> Result<u64> {
                let partition = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                let rows: Vec<VeldPairwiseRow> = store::read_jsonl(path)?;
                let duplicates = mark_duplicates(&rows, threshold);
                store::write_jsonl(&self.output_path.join(&partition), &duplicates)?;
                Ok(duplicates.len() as u64)
            })
            .collect::<Result<Vec<_>>>()?;

        let total: u64 = counts.iter().sum();
        log::info!(
            "identified {total} duplicates across {} partitions (eps {})",
            partitions.len(),
            self.eps
        );
        Ok(total)
    }
}

/// In-order scan over keeper-priority rows. A row's id is marked duplicate
/// only when its counterpart meets the threshold and was already retained;
/// everything else is retained. Self-matches (the singleton sentinel) can
/// never mark their own record.
fn mark_duplicates(rows: &[VeldPairwiseRow], threshold: f32) -> Vec<VeldDuplicateRow> {
    let mut retained: HashSet<&str> = HashSet::with_capacity(rows.len());
    let mut duplicates = Vec::new();
    for row in rows {
        let is_duplicate = row.similarity_score >= threshold
            && row.max_id != row.id
            && retained.contains(row.max_id.as_str());
        if is_duplicate {
            duplicates.push(VeldDuplicateRow { id: row.id.clone() });
        } else {
            retained.insert(row.id.as_str());
        }
    }
    duplicates
}

/// Collects every duplicate id under an output directory, partition order.
pub fn load_duplicate_ids(dir: &Path) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for path in store::list_partitions(dir)? {
        let rows: Vec<VeldDuplicateRow> = store::read_jsonl(&path)?;
        ids.extend(rows.into_iter().map(|row| row.id));
    }
    Ok(ids)
}
