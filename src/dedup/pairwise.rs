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

//! # Veld Pairwise Similarity Stage
//!
//! Within each cluster partition, finds every record's single most similar
//! counterpart. The similarity matrix is computed in row blocks of
//! `pairwise_batch_size` to bound peak memory for large clusters.
//!
//! Rows are emitted in **keeper-priority order**: the partition is sorted by
//! the ranking strategy's key (centroid distance for `hard`/`easy`, a seeded
//! id hash for `random`, id as the final tie-break) before comparison. The
//! duplicate-identification stage relies on that order to pick keepers, so
//! the ordering key lives in the data itself rather than in any processing
//! order.

use std::path::PathBuf;

use rayon::prelude::*;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::store::{self, VeldClusterAssignment, VeldPairwiseRow};
use super::{kmeans::DEFAULT_SEED, normalize, VeldRankingStrategy, VeldSimMetric};
use crate::errors::{Result, VeldError};

/// Sentinel score for a cluster of one: maximal self-similarity, so
/// thresholding naturally treats the record as non-duplicate.
pub const SINGLETON_SCORE: f32 = 1.0;

/// Per-cluster nearest-counterpart computation.
#[derive(Clone, Debug)]
pub struct VeldPairwiseStage {
    input_path: PathBuf,
    output_path: PathBuf,
    which_to_keep: VeldRankingStrategy,
    sim_metric: VeldSimMetric,
    pairwise_batch_size: usize,
    seed: u64,
}

impl VeldPairwiseStage {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        VeldPairwiseStage {
            input_path: input_path.into(),
            output_path: output_path.into(),
            which_to_keep: VeldRankingStrategy::Hard,
            sim_metric: VeldSimMetric::Cosine,
            pairwise_batch_size: 1024,
            seed: DEFAULT_SEED,
        }
    }

    pub fn which_to_keep(mut self, strategy: VeldRankingStrategy) -> Self {
        self.which_to_keep = strategy;
        self
    }

    pub fn sim_metric(mut self, metric: VeldSimMetric) -> Self {
        self.sim_metric = metric;
        self
    }

    pub fn pairwise_batch_size(mut self, size: usize) -> Self {
        self.pairwise_batch_size = size;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Processes every cluster partition and returns the number of rows
    /// written; one row per input record.
    pub fn run(&self) -> Result<u64> {
        if self.pairwise_batch_size == 0 {
            return Err(VeldError::validation("pairwise_batch_size must be at least 1"));
        }
        let partitions = store::list_partitions(&self.input_path)?;
        if partitions.is_empty() {
            return Err(VeldError::validation(format!(
                "no cluster partitions found under '{}'",
                self.input_path.display()
            )));
        }

        let rows_per_partition: Vec<u64> = partitions
            .par_iter()
            .map(|path| -> Result<u64> {
                let partition = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                let cluster: Vec<VeldClusterAssignment> = store::read_jsonl(path)?;
                if cluster.is_empty() {
                    return Err(VeldError::data_contract(
                        &partition,
                        "cluster partition contains no records",
                    ));
                }
                let rows = self.process_cluster(cluster);
                store::write_jsonl(&self.output_path.join(&partition), &rows)?;
                Ok(rows.len() as u64)
            })
            .collect::<Result<Vec<_>>>()?;

        let total: u64 = rows_per_partition.iter().sum();
        log::info!(
            "pairwise comparison wrote {total} rows across {} clusters",
            partitions.len()
        );
        Ok(total)
    }

    /// Orders a cluster by keeper priority and emits each record's most
    /// similar counterpart.
    fn process_cluster(&self, mut cluster: Vec<VeldClusterAssignment>) -> Vec<VeldPairwiseRow> {
        self.sort_by_ranking(&mut cluster);

        if cluster.len() == 1 {
            let only = &cluster[0];
            return vec![VeldPairwiseRow {
                id: only.id.clone(),
                max_id: only.id.clone(),
                similarity_score: SINGLETON_SCORE,
            }];
        }

        let embeddings: Vec<Vec<f32>> = cluster
            .iter()
            .map(|record| {
                let mut v = record.embedding.clone();
                if self.sim_metric == VeldSimMetric::Cosine {
                    normalize(&mut v);
                }
                v
            })
            .collect();

        let n = cluster.len();
        let mut rows = Vec::with_capacity(n);
        for block_start in (0..n).step_by(self.pairwise_batch_size) {
            let block_end = (block_start + self.pairwise_batch_size).min(n);
            for i in block_start..block_end {
                let mut best = None::<(usize, f32)>;
                // Scanning in ranking order with a strict comparison resolves
                // similarity ties to the highest-priority counterpart.
                for j in 0..n {
                    if j == i {
                        continue;
                    }
                    let score = self.sim_metric.similarity(&embeddings[i], &embeddings[j]);
                    let better = match best {
                        Some((_, best_score)) => score > best_score,
                        None => true,
                    };
                    if better {
                        best = Some((j, score));
                    }
                }
                if let Some((j, score)) = best {
                    rows.push(VeldPairwiseRow {
                        id: cluster[i].id.clone(),
                        max_id: cluster[j].id.clone(),
                        similarity_score: score,
                    });
                }
            }
        }
        rows
    }

    fn sort_by_ranking(&self, cluster: &mut [VeldClusterAssignment]) {
        match self.which_to_keep {
            VeldRankingStrategy::Hard => cluster.sort_by(|a, b| {
                b.distance_to_centroid
                    .total_cmp(&a.distance_to_centroid)
                    .then_with(|| a.id.cmp(&b.id))
            }),
            VeldRankingStrategy::Easy => cluster.sort_by(|a, b| {
                a.distance_to_centroid
                    .total_cmp(&b.distance_to_centroid)
                    .then_with(|| a.id.cmp(&b.id))
            }),
            VeldRankingStrategy::Random => {
                let seed = self.seed;
                cluster.sort_by(|a, b| {
                    xxh3_64_with_seed(a.id.as_bytes(), seed)
                        .cmp(&xxh3_64_with_seed(b.id.as_bytes(), seed))
                        .then_with(|| a.id.cmp(&b.id))
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn assignment(id: &str, embedding: Vec<f32>, distance: f32) -> VeldClusterAssignment {
        VeldClusterAssignment {
            id: id.to_string(),
            embedding,
            cluster_id: 0,
            distance_to_centroid: distance,
        }
    }

    fn stage() -> VeldPairwiseStage {
        VeldPairwiseStage::new("in", "out")
    }

    #[test]
    fn singleton_cluster_gets_sentinel_row() {
        let rows = stage().process_cluster(vec![assignment("only", vec![1.0, 0.0], 0.0)]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "only");
        assert_eq!(rows[0].max_id, "only");
        assert_eq!(rows[0].similarity_score, SINGLETON_SCORE);
    }

    #[test]
    fn nearest_counterpart_is_mutual_for_a_close_pair() {
        let rows = stage().process_cluster(vec![
            assignment("a", vec![1.0, 0.0], 0.1),
            assignment("b", vec![0.999, 0.001], 0.2),
            assignment("c", vec![0.0, 1.0], 0.9),
        ]);
        let find = |id: &str| rows.iter().find(|r| r.id == id).unwrap();
        assert_eq!(find("a").max_id, "b");
        assert_eq!(find("b").max_id, "a");
        assert!(find("a").similarity_score > 0.99);
    }

    #[test]
    fn hard_ranking_puts_outliers_first() {
        let rows = stage().which_to_keep(VeldRankingStrategy::Hard).process_cluster(vec![
            assignment("near", vec![1.0, 0.0], 0.1),
            assignment("far", vec![0.9, 0.1], 0.8),
        ]);
        assert_eq!(rows[0].id, "far");

        let rows = stage().which_to_keep(VeldRankingStrategy::Easy).process_cluster(vec![
            assignment("near", vec![1.0, 0.0], 0.1),
            assignment("far", vec![0.9, 0.1], 0.8),
        ]);
        assert_eq!(rows[0].id, "near");
    }

    #[test]
    fn small_batch_size_matches_full_matrix() {
        let cluster = vec![
            assignment("a", vec![1.0, 0.0, 0.0], 0.1),
            assignment("b", vec![0.0, 1.0, 0.0], 0.2),
            assignment("c", vec![0.7, 0.7, 0.0], 0.3),
            assignment("d", vec![0.69, 0.71, 0.0], 0.4),
            assignment("e", vec![0.0, 0.0, 1.0], 0.5),
        ];
        let full = stage().process_cluster(cluster.clone());
        let blocked = stage().pairwise_batch_size(2).process_cluster(cluster);
        assert_eq!(full, blocked);
    }

    #[test]
    fn empty_cluster_partition_is_rejected() {
        let input = tempdir().unwrap();
        let output = tempdir().unwrap();
        std::fs::write(input.path().join("cluster_0.jsonl"), "").unwrap();
        let err = VeldPairwiseStage::new(input.path(), output.path())
            .run()
            .unwrap_err();
        assert!(matches!(err, VeldError::DataContract { .. }));
    }

    proptest! {
        #[test]
        fn rerun_is_deterministic(
            seed in any::<u64>(),
            vectors in proptest::collection::vec(
                proptest::collection::vec(-1.0f32..1.0, 4),
                2..40,
            )
        ) {
            let cluster: Vec<VeldClusterAssignment> = vectors
                .iter()
                .enumerate()
                .map(|(i, v)| assignment(&format!("r{i}"), v.clone(), (i % 5) as f32 * 0.1))
                .collect();
            let stage = stage()
                .which_to_keep(VeldRankingStrategy::Random)
                .seed(seed);
            let first = stage.process_cluster(cluster.clone());
            let second = stage.process_cluster(cluster);
            prop_assert_eq!(first, second);
        }
    }
}
