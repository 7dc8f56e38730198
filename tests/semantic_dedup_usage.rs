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

//! End-to-end usage of the semantic-deduplication workflow on a synthetic
//! corpus: 10,000 embeddings in 10 well-separated groups.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tempfile::tempdir;

use veld::dedup::store::{self, VeldClusterAssignment, VeldEmbeddingRecord, VeldPairwiseRow};
use veld::dedup::{VeldRankingStrategy, VeldSemanticDedup, VeldSimMetric};

const N_RECORDS: usize = 10_000;
const N_CLUSTERS: usize = 10;
const DIM: usize = 8;
const EPS: f32 = 0.01;

/// Ten well-separated unit directions in 8 dimensions: the eight basis
/// vectors plus two negated ones.
fn group_center(group: usize) -> Vec<f32> {
    let mut center = vec![0.0f32; DIM];
    if group < DIM {
        center[group] = 1.0;
    } else {
        center[group - DIM] = -1.0;
    }
    center
}

/// Deterministic corpus: 1,000 records per group. Most records are tiny
/// jitters of their group center and therefore near-duplicates of each
/// other; the first record of every group gets a large orthogonal component
/// so it falls below the duplicate threshold and must survive.
fn write_corpus(dir: &Path) {
    let per_group = N_RECORDS / N_CLUSTERS;
    let mut all = Vec::with_capacity(N_RECORDS);
    for group in 0..N_CLUSTERS {
        let center = group_center(group);
        for i in 0..per_group {
            let mut embedding = center.clone();
            let off_axis = (group + 1) % DIM;
            if i == 0 {
                embedding[off_axis] += 0.5;
            } else {
                embedding[off_axis] += ((group * 31 + i * 17) % 13) as f32 * 1e-4;
            }
            all.push(VeldEmbeddingRecord {
                id: format!("g{group}-r{i}"),
                embedding,
            });
        }
    }
    for (part, chunk) in all.chunks(N_RECORDS / 4).enumerate() {
        store::write_jsonl(&dir.join(format!("part_{part}.jsonl")), chunk).unwrap();
    }
}

fn workflow(input: &Path, work: &Path) -> VeldSemanticDedup {
    VeldSemanticDedup::new(input, work, N_CLUSTERS, DIM)
        .sim_metric(VeldSimMetric::Cosine)
        .which_to_keep(VeldRankingStrategy::Hard)
        .eps(EPS)
}

#[test]
fn full_workflow_on_ten_thousand_records() {
    let input = tempdir().unwrap();
    let work = tempdir().unwrap();
    write_corpus(input.path());

    let summary = workflow(input.path(), work.path()).run().unwrap();
    assert_eq!(summary.records, N_RECORDS as u64);
    assert_eq!(summary.clusters, N_CLUSTERS);
    assert_eq!(summary.pairwise_rows, N_RECORDS as u64);

    // Every id is assigned to exactly one cluster and no cluster is empty.
    let cluster_partitions = store::list_partitions(&work.path().join("clusters")).unwrap();
    assert_eq!(cluster_partitions.len(), N_CLUSTERS);
    let mut assigned: HashSet<String> = HashSet::new();
    for path in &cluster_partitions {
        let assignments: Vec<VeldClusterAssignment> = store::read_jsonl(path).unwrap();
        assert!(!assignments.is_empty());
        for assignment in assignments {
            assert!(
                assigned.insert(assignment.id.clone()),
                "{} assigned to more than one cluster",
                assignment.id
            );
        }
    }
    assert_eq!(assigned.len(), N_RECORDS);

    // One pairwise row per record, scores indexed by id for the checks below.
    let mut scores: HashMap<String, VeldPairwiseRow> = HashMap::new();
    for path in store::list_partitions(&work.path().join("pairwise")).unwrap() {
        for row in store::read_jsonl::<VeldPairwiseRow>(&path).unwrap() {
            scores.insert(row.id.clone(), row);
        }
    }
    assert_eq!(scores.len(), N_RECORDS);

    // Duplicates are a strict subset, each with a qualifying partner.
    let duplicates = workflow(input.path(), work.path()).load_duplicate_ids().unwrap();
    assert_eq!(duplicates.len() as u64, summary.duplicates);
    assert!(!duplicates.is_empty());
    assert!(duplicates.len() < N_RECORDS);
    let duplicate_set: HashSet<&String> = duplicates.iter().collect();
    assert_eq!(duplicate_set.len(), duplicates.len(), "duplicate ids repeat");
    for id in &duplicates {
        let row = &scores[id];
        assert!(row.similarity_score >= 1.0 - EPS, "{id} below threshold");
        assert_ne!(row.max_id, *id);
        assert!(assigned.contains(&row.max_id));
    }

    // The deliberately-perturbed records are below the threshold and survive.
    for group in 0..N_CLUSTERS {
        let id = format!("g{group}-r0");
        assert!(
            !duplicate_set.contains(&id),
            "perturbed record {id} should not be a duplicate"
        );
    }
}

#[test]
fn rerun_on_unchanged_input_is_idempotent() {
    let input = tempdir().unwrap();
    write_corpus(input.path());

    let work_a = tempdir().unwrap();
    let work_b = tempdir().unwrap();
    let summary_a = workflow(input.path(), work_a.path()).run().unwrap();
    let summary_b = workflow(input.path(), work_b.path()).run().unwrap();
    assert_eq!(summary_a.duplicates, summary_b.duplicates);

    let mut ids_a = workflow(input.path(), work_a.path()).load_duplicate_ids().unwrap();
    let mut ids_b = workflow(input.path(), work_b.path()).load_duplicate_ids().unwrap();
    ids_a.sort();
    ids_b.sort();
    assert_eq!(ids_a, ids_b);
}

#[test]
fn identify_stage_restarts_from_pairwise_artifacts() {
    let input = tempdir().unwrap();
    let work = tempdir().unwrap();
    write_corpus(input.path());

    let first = workflow(input.path(), work.path()).run().unwrap();

    // Re-running only the last stage over its persisted inputs reproduces
    // the same duplicate count.
    let rerun = veld::dedup::VeldIdentifyDuplicatesStage::new(
        work.path().join("pairwise"),
        work.path().join("duplicates_rerun"),
    )
    .eps(EPS)
    .run()
    .unwrap();
    assert_eq!(rerun, first.duplicates);
}
