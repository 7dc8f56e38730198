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

//! # Veld Semantic Deduplication
//!
//! Finds near-duplicate records by embedding proximity in three stages, each
//! independently restartable from its persisted input artifacts:
//!
//! 1. [`VeldKMeansStage`] clusters embeddings and re-partitions them by
//!    cluster, so later stages never need cross-partition coordination.
//! 2. [`VeldPairwiseStage`] computes, per cluster, each record's single most
//!    similar counterpart.
//! 3. [`VeldIdentifyDuplicatesStage`] thresholds those pairs with a tolerance
//!    `eps` and emits the ids to remove, keeping exactly one record of every
//!    matched pair.
//!
//! [`VeldSemanticDedup`] chains the three stages over a working directory.
//!
//! ## Example
//!
//! ```rust,ignore
//! use veld::dedup::{VeldSemanticDedup, VeldRankingStrategy, VeldSimMetric};
//!
//! let summary = VeldSemanticDedup::new("embeddings/", "dedup-work/", 100, 768)
//!     .sim_metric(VeldSimMetric::Cosine)
//!     .which_to_keep(VeldRankingStrategy::Hard)
//!     .eps(0.01)
//!     .run()?;
//! println!("{} duplicates among {} records", summary.duplicates, summary.records);
//! ```

pub mod identify;
pub mod kmeans;
pub mod pairwise;
pub mod store;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, VeldError};
pub use identify::VeldIdentifyDuplicatesStage;
pub use kmeans::VeldKMeansStage;
pub use pairwise::VeldPairwiseStage;

/// Similarity metric used by clustering and pairwise comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VeldSimMetric {
    /// Normalized dot product; vectors are L2-normalized on ingest.
    Cosine,
    /// Euclidean distance; similarity is its negation so "most similar"
    /// stays "maximum".
    L2,
}

impl VeldSimMetric {
    /// Similarity between two vectors; higher is more similar.
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            VeldSimMetric::Cosine => dot(a, b),
            VeldSimMetric::L2 => -euclidean(a, b),
        }
    }

    /// Distance between two vectors; lower is closer.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            VeldSimMetric::Cosine => 1.0 - dot(a, b),
            VeldSimMetric::L2 => euclidean(a, b),
        }
    }
}

/// Which record of a near-duplicate pair survives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VeldRankingStrategy {
    /// Keep the record farthest from its centroid; biases toward diversity.
    Hard,
    /// Keep the record nearest its centroid; biases toward typical examples.
    Easy,
    /// Centroid distance is ignored; keeper order is a seeded hash of the
    /// record id, so it stays deterministic across runs.
    Random,
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// L2-normalizes in place; zero vectors are left untouched.
pub(crate) fn normalize(v: &mut [f32]) {
    let norm = dot(v, v).sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Terminal summary of a full dedup run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VeldDedupSummary {
    /// Records clustered.
    pub records: u64,
    /// Non-empty clusters produced.
    pub clusters: usize,
    /// K-means iterations until convergence or cap.
    pub iterations: usize,
    /// Pairwise rows emitted; equals `records`.
    pub pairwise_rows: u64,
    /// Duplicate ids identified.
    pub duplicates: u64,
}

/// Configures and runs the full three-stage dedup workflow.
///
/// Intermediate artifacts land under the working directory in `clusters/`,
/// `pairwise/`, and `duplicates/`; a crashed run resumes by re-running only
/// the stage that failed.
#[derive(Clone, Debug)]
pub struct VeldSemanticDedup {
    input_path: PathBuf,
    work_dir: PathBuf,
    n_clusters: usize,
    embedding_dim: usize,
    input_filetype: String,
    sim_metric: VeldSimMetric,
    which_to_keep: VeldRankingStrategy,
    pairwise_batch_size: usize,
    eps: f32,
    seed: u64,
}

impl VeldSemanticDedup {
    pub fn new(
        input_path: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        n_clusters: usize,
        embedding_dim: usize,
    ) -> Self {
        VeldSemanticDedup {
            input_path: input_path.into(),
            work_dir: work_dir.into(),
            n_clusters,
            embedding_dim,
            input_filetype: "jsonl".to_string(),
            sim_metric: VeldSimMetric::Cosine,
            which_to_keep: VeldRankingStrategy::Hard,
            pairwise_batch_size: 1024,
            eps: 0.01,
            seed: kmeans::DEFAULT_SEED,
        }
    }

    pub fn input_filetype(mut self, filetype: impl Into<String>) -> Self {
        self.input_filetype = filetype.into();
        self
    }

    pub fn sim_metric(mut self, metric: VeldSimMetric) -> Self {
        self.sim_metric = metric;
        self
    }

    pub fn which_to_keep(mut self, strategy: VeldRankingStrategy) -> Self {
        self.which_to_keep = strategy;
        self
    }

    pub fn pairwise_batch_size(mut self, size: usize) -> Self {
        self.pairwise_batch_size = size;
        self
    }

    pub fn eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn clusters_dir(&self) -> PathBuf {
        self.work_dir.join("clusters")
    }

    fn pairwise_dir(&self) -> PathBuf {
        self.work_dir.join("pairwise")
    }

    fn duplicates_dir(&self) -> PathBuf {
        self.work_dir.join("duplicates")
    }

    /// Runs clustering, pairwise comparison, and duplicate identification.
    pub fn run(&self) -> Result<VeldDedupSummary> {
        if self.eps < 0.0 || !self.eps.is_finite() {
            return Err(VeldError::validation(format!(
                "eps must be a non-negative number, got {}",
                self.eps
            )));
        }

        let kmeans = VeldKMeansStage::new(
            &self.input_path,
            self.clusters_dir(),
            self.n_clusters,
            self.embedding_dim,
        )
        .input_filetype(&self.input_filetype)
        .metric(self.sim_metric)
        .seed(self.seed);
        let clustering = kmeans.run()?;

        let pairwise = VeldPairwiseStage::new(self.clusters_dir(), self.pairwise_dir())
            .which_to_keep(self.which_to_keep)
            .sim_metric(self.sim_metric)
            .pairwise_batch_size(self.pairwise_batch_size)
            .seed(self.seed);
        let pairwise_rows = pairwise.run()?;

        let identify = VeldIdentifyDuplicatesStage::new(self.pairwise_dir(), self.duplicates_dir())
            .eps(self.eps);
        let duplicates = identify.run()?;

        Ok(VeldDedupSummary {
            records: clustering.records,
            clusters: clustering.clusters,
            iterations: clustering.iterations,
            pairwise_rows,
            duplicates,
        })
    }

    /// Directory the duplicate-id partitions are written to.
    pub fn duplicates_path(&self) -> PathBuf {
        self.duplicates_dir()
    }

    /// Collects every duplicate id from the output partitions.
    pub fn load_duplicate_ids(&self) -> Result<Vec<String>> {
        identify::load_duplicate_ids(&self.duplicates_dir())
    }
}

/// True when the path has a `.jsonl` extension.
pub(crate) fn is_jsonl(path: &Path) -> bool {
    path.extension().map(|ext| ext == "jsonl").unwrap_or(false)
}
