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

//! # Veld K-Means Clustering Stage
//!
//! Clusters partitioned embedding records and re-partitions them by cluster,
//! so the pairwise stage can process one cluster at a time with no
//! cross-partition coordination.
//!
//! The embedding set may exceed memory, so every iteration is a single
//! streaming pass over the input partitions: each partition contributes
//! per-cluster vector sums, counts, and its farthest outliers, and only those
//! partials are merged. Seeding is k-means++ over a seeded reservoir sample,
//! which keeps runs reproducible for a fixed seed.
//!
//! A cluster left empty by an iteration is re-seeded from the globally
//! farthest outlier of that pass instead of being left degenerate.

use std::path::{Path, PathBuf};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::store::{
    self, VeldClusterAssignment, VeldEmbeddingRecord, VeldPartitionWriter,
};
use super::{normalize, VeldSimMetric};
use crate::errors::{Result, VeldError};

/// Default RNG seed for seeding and sampling.
pub const DEFAULT_SEED: u64 = 0xDA7A;

/// Reservoir size multiplier; the seeding sample holds up to
/// `n_clusters * SAMPLE_FACTOR` vectors.
const SAMPLE_FACTOR: usize = 32;

/// Outcome of a clustering run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VeldClusteringSummary {
    /// Records assigned.
    pub records: u64,
    /// Non-empty clusters written.
    pub clusters: usize,
    /// Iterations executed before convergence or the cap.
    pub iterations: usize,
}

/// Streaming K-means over partitioned embedding records.
#[derive(Clone, Debug)]
pub struct VeldKMeansStage {
    input_path: PathBuf,
    output_path: PathBuf,
    n_clusters: usize,
    embedding_dim: usize,
    input_filetype: String,
    metric: VeldSimMetric,
    max_iterations: usize,
    tolerance: f32,
    seed: u64,
}

impl VeldKMeansStage {
    pub fn new(
        input_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        n_clusters: usize,
        embedding_dim: usize,
    ) -> Self {
        VeldKMeansStage {
            input_path: input_path.into(),
            output_path: output_path.into(),
            n_clusters,
            embedding_dim,
            input_filetype: "jsonl".to_string(),
            metric: VeldSimMetric::Cosine,
            max_iterations: 100,
            tolerance: 1e-4,
            seed: DEFAULT_SEED,
        }
    }

    pub fn input_filetype(mut self, filetype: impl Into<String>) -> Self {
        self.input_filetype = filetype.into();
        self
    }

    pub fn metric(mut self, metric: VeldSimMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Convergence threshold on the maximum centroid displacement.
    pub fn tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Runs clustering and writes one `cluster_<k>.jsonl` partition per
    /// non-empty cluster under the output path.
    pub fn run(&self) -> Result<VeldClusteringSummary> {
        self.validate()?;
        let partitions = store::list_partitions(&self.input_path)?;
        if partitions.is_empty() {
            return Err(VeldError::validation(format!(
                "no input partitions found under '{}'",
                self.input_path.display()
            )));
        }

        let (records, sample) = self.sample_pass(&partitions)?;
        if (records as usize) < self.n_clusters {
            return Err(VeldError::validation(format!(
                "{} records cannot form {} clusters",
                records, self.n_clusters
            )));
        }
        log::info!(
            "clustering {} records from {} partitions into {} clusters",
            records,
            partitions.len(),
            self.n_clusters
        );

        let mut rng = SmallRng::seed_from_u64(self.seed);
        let mut centroids = self.seed_centroids(&sample, &mut rng);

        let mut iterations = 0;
        for iteration in 0..self.max_iterations {
            iterations = iteration + 1;
            let partial = self.assignment_pass(&partitions, &centroids)?;
            let (next, reseeded) = self.recompute_centroids(&centroids, partial);
            let shift = centroids
                .iter()
                .zip(&next)
                .map(|(old, new)| super::euclidean(old, new))
                .fold(0.0f32, f32::max);
            centroids = next;
            log::debug!(
                "iteration {iterations}: max centroid shift {shift:.6}, reseeded {reseeded}"
            );
            if !reseeded && shift <= self.tolerance {
                break;
            }
        }

        let clusters = self.write_clusters(&partitions, &centroids)?;
        log::info!(
            "clustering converged after {iterations} iterations; {clusters} non-empty clusters"
        );
        Ok(VeldClusteringSummary {
            records,
            clusters,
            iterations,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.n_clusters == 0 {
            return Err(VeldError::validation("n_clusters must be at least 1"));
        }
        if self.embedding_dim == 0 {
            return Err(VeldError::validation("embedding_dim must be at least 1"));
        }
        store::validate_filetype(&self.input_filetype)
    }

    /// Reads one partition, enforcing the embedding dimension and
    /// pre-normalizing for the cosine metric.
    fn load_partition(&self, path: &Path) -> Result<Vec<VeldEmbeddingRecord>> {
        let partition = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mut records: Vec<VeldEmbeddingRecord> = store::read_jsonl(path)?;
        for record in &mut records {
            if record.embedding.len() != self.embedding_dim {
                return Err(VeldError::data_contract(
                    &partition,
                    format!(
                        "record '{}' has embedding dimension {}, expected {}",
                        record.id,
                        record.embedding.len(),
                        self.embedding_dim
                    ),
                ));
            }
            if self.metric == VeldSimMetric::Cosine {
                normalize(&mut record.embedding);
            }
        }
        Ok(records)
    }

    /// First pass: counts records and draws a seeded reservoir sample.
    fn sample_pass(&self, partitions: &[PathBuf]) -> Result<(u64, Vec<Vec<f32>>)> {
        let capacity = (self.n_clusters * SAMPLE_FACTOR).max(self.n_clusters);
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let mut sample: Vec<Vec<f32>> = Vec::with_capacity(capacity);
        let mut seen = 0u64;
        for path in partitions {
            for record in self.load_partition(path)? {
                if (sample.len()) < capacity {
                    sample.push(record.embedding);
                } else {
                    let j = rng.gen_range(0..=seen);
                    if (j as usize) < capacity {
                        sample[j as usize] = record.embedding;
                    }
                }
                seen += 1;
            }
        }
        Ok((seen, sample))
    }

    /// k-means++ over the sample: each new centroid is drawn with probability
    /// proportional to its squared distance from the nearest chosen one.
    fn seed_centroids(&self, sample: &[Vec<f32>], rng: &mut SmallRng) -> Vec<Vec<f32>> {
        let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(self.n_clusters);
        centroids.push(sample[rng.gen_range(0..sample.len())].clone());

        let mut nearest_d2: Vec<f64> = sample
            .iter()
            .map(|v| {
                let d = self.metric.distance(v, &centroids[0]) as f64;
                d * d
            })
            .collect();

        while centroids.len() < self.n_clusters {
            let total: f64 = nearest_d2.iter().sum();
            let chosen = if total <= f64::EPSILON {
                rng.gen_range(0..sample.len())
            } else {
                let mut target = rng.gen::<f64>() * total;
                let mut chosen = sample.len() - 1;
                for (i, &d2) in nearest_d2.iter().enumerate() {
                    target -= d2;
                    if target <= 0.0 {
                        chosen = i;
                        break;
                    }
                }
                chosen
            };
            centroids.push(sample[chosen].clone());
            let newest = &centroids[centroids.len() - 1];
            for (i, v) in sample.iter().enumerate() {
                let d = self.metric.distance(v, newest) as f64;
                nearest_d2[i] = nearest_d2[i].min(d * d);
            }
        }
        centroids
    }

    /// One streaming assignment pass; partitions are processed in parallel
    /// and only their per-cluster partials are merged.
    fn assignment_pass(
        &self,
        partitions: &[PathBuf],
        centroids: &[Vec<f32>],
    ) -> Result<IterationPartial> {
        let partials: Vec<IterationPartial> = partitions
            .par_iter()
            .map(|path| -> Result<IterationPartial> {
                let mut partial = IterationPartial::new(self.n_clusters, self.embedding_dim);
                for record in self.load_partition(path)? {
                    let (cluster, distance) = nearest(centroids, &record.embedding, self.metric);
                    partial.observe(cluster, distance, record.embedding);
                }
                Ok(partial)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut merged = IterationPartial::new(self.n_clusters, self.embedding_dim);
        for partial in partials {
            merged.merge(partial, self.n_clusters);
        }
        Ok(merged)
    }

    /// Means of the assigned vectors; empty clusters are re-seeded from the
    /// globally farthest outliers of this pass.
    fn recompute_centroids(
        &self,
        centroids: &[Vec<f32>],
        partial: IterationPartial,
    ) -> (Vec<Vec<f32>>, bool) {
        let IterationPartial {
            sums,
            counts,
            mut outliers,
        } = partial;
        outliers.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut reseeded = false;
        let mut next: Vec<Vec<f32>> = Vec::with_capacity(self.n_clusters);
        let mut outlier_iter = outliers.into_iter();
        for (cluster, sum) in sums.into_iter().enumerate() {
            let count = counts[cluster];
            if count == 0 {
                match outlier_iter.next() {
                    Some((distance, embedding)) => {
                        log::warn!(
                            "cluster {cluster} received no assignments; re-seeding from outlier at distance {distance:.4}"
                        );
                        next.push(embedding);
                        reseeded = true;
                    }
                    // No outliers left to promote; keep the old centroid.
                    None => next.push(centroids[cluster].clone()),
                }
                continue;
            }
            let mut mean: Vec<f32> = sum
                .into_iter()
                .map(|total| (total / count as f64) as f32)
                .collect();
            if self.metric == VeldSimMetric::Cosine {
                normalize(&mut mean);
            }
            next.push(mean);
        }
        (next, reseeded)
    }

    /// Final streaming pass writing `cluster_<k>.jsonl` partitions; clusters
    /// that end up empty are not written.
    fn write_clusters(&self, partitions: &[PathBuf], centroids: &[Vec<f32>]) -> Result<usize> {
        let mut writers: Vec<VeldPartitionWriter> = (0..self.n_clusters)
            .map(|cluster| {
                VeldPartitionWriter::create(self.output_path.join(format!("cluster_{cluster}.jsonl")))
            })
            .collect::<Result<Vec<_>>>()?;

        for path in partitions {
            for record in self.load_partition(path)? {
                let (cluster, distance) = nearest(centroids, &record.embedding, self.metric);
                writers[cluster].append(&VeldClusterAssignment {
                    id: record.id,
                    embedding: record.embedding,
                    cluster_id: cluster,
                    distance_to_centroid: distance,
                })?;
            }
        }

        let mut non_empty = 0;
        for (cluster, writer) in writers.into_iter().enumerate() {
            let written = writer.records_written();
            let path = self.output_path.join(format!("cluster_{cluster}.jsonl"));
            writer.finish()?;
            if written == 0 {
                std::fs::remove_file(&path).map_err(|err| {
                    VeldError::Io(format!(
                        "failed to remove empty partition '{}': {err}",
                        path.display()
                    ))
                })?;
            } else {
                non_empty += 1;
            }
        }
        Ok(non_empty)
    }
}

/// Per-pass accumulation: vector sums and counts per cluster plus the
/// farthest-assigned outliers for re-seeding.
struct IterationPartial {
    sums: Vec<Vec<f64>>,
    counts: Vec<u64>,
    /// `(distance, embedding)` of the farthest records seen, capped at the
    /// cluster count.
    outliers: Vec<(f32, Vec<f32>)>,
}

impl IterationPartial {
    fn new(n_clusters: usize, dim: usize) -> Self {
        IterationPartial {
            sums: vec![vec![0.0; dim]; n_clusters],
            counts: vec![0; n_clusters],
            outliers: Vec::new(),
        }
    }

    fn observe(&mut self, cluster: usize, distance: f32, embedding: Vec<f32>) {
        for (total, value) in self.sums[cluster].iter_mut().zip(&embedding) {
            *total += *value as f64;
        }
        self.counts[cluster] += 1;
        self.outliers.push((distance, embedding));
        self.prune_outliers(self.counts.len());
    }

    fn merge(&mut self, other: IterationPartial, cap: usize) {
        for (mine, theirs) in self.sums.iter_mut().zip(other.sums) {
            for (total, value) in mine.iter_mut().zip(theirs) {
                *total += value;
            }
        }
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts) {
            *mine += theirs;
        }
        self.outliers.extend(other.outliers);
        self.prune_outliers(cap);
    }

    fn prune_outliers(&mut self, cap: usize) {
        if self.outliers.len() > cap * 2 {
            self.outliers.sort_by(|a, b| b.0.total_cmp(&a.0));
            self.outliers.truncate(cap);
        }
    }
}

fn nearest(centroids: &[Vec<f32>], v: &[f32], metric: VeldSimMetric) -> (usize, f32) {
    let mut best = 0;
    let mut best_distance = f32::INFINITY;
    for (cluster, centroid) in centroids.iter().enumerate() {
        let distance = metric.distance(v, centroid);
        if distance < best_distance {
            best_distance = distance;
            best = cluster;
        }
    }
    (best, best_distance)
}
