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

//! Partitioned JSONL storage for dedup artifacts. One record per line; a
//! malformed line is a `DataContract` error naming the partition and line
//! number, so a bad partition never silently drops records.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, VeldError};

/// Input schema for the dedup workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VeldEmbeddingRecord {
    pub id: String,
    pub embedding: Vec<f32>,
}

/// Clustering output; carries the embedding so the pairwise stage restarts
/// from cluster partitions alone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VeldClusterAssignment {
    pub id: String,
    pub embedding: Vec<f32>,
    pub cluster_id: usize,
    pub distance_to_centroid: f32,
}

/// Pairwise output: each record's single most similar counterpart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VeldPairwiseRow {
    pub id: String,
    pub max_id: String,
    pub similarity_score: f32,
}

/// Duplicate-id output; joined against the original dataset at removal time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VeldDuplicateRow {
    pub id: String,
}

/// Only line-delimited JSON partitions are supported.
pub fn validate_filetype(filetype: &str) -> Result<()> {
    if filetype.eq_ignore_ascii_case("jsonl") {
        Ok(())
    } else {
        Err(VeldError::validation(format!(
            "unsupported input_filetype '{filetype}'; expected 'jsonl'"
        )))
    }
}

/// Lists `.jsonl` partitions under a directory, sorted by file name so every
/// pass over the data visits partitions in the same order.
pub fn list_partitions(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|err| {
        VeldError::Io(format!("failed to list partitions in '{}': {err}", dir.display()))
    })?;
    let mut partitions: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| {
            VeldError::Io(format!("failed to read entry in '{}': {err}", dir.display()))
        })?;
        let path = entry.path();
        if path.is_file() && super::is_jsonl(&path) {
            partitions.push(path);
        }
    }
    partitions.sort();
    Ok(partitions)
}

fn partition_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Reads one partition into memory.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let partition = partition_name(path);
    let file = File::open(path).map_err(|err| {
        VeldError::Io(format!("failed to open partition '{}': {err}", path.display()))
    })?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| {
            VeldError::Io(format!("failed to read partition '{partition}': {err}"))
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: T = serde_json::from_str(&line).map_err(|err| {
            VeldError::data_contract(
                &partition,
                format!("malformed record at line {}: {err}", line_no + 1),
            )
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Writes one partition atomically enough for restarts: a rerun overwrites
/// the whole file rather than appending.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            VeldError::Io(format!("failed to create '{}': {err}", parent.display()))
        })?;
    }
    let file = File::create(path).map_err(|err| {
        VeldError::Io(format!("failed to create partition '{}': {err}", path.display()))
    })?;
    let mut writer = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n").map_err(|err| {
            VeldError::Io(format!("failed to write partition '{}': {err}", path.display()))
        })?;
    }
    writer.flush().map_err(|err| {
        VeldError::Io(format!("failed to flush partition '{}': {err}", path.display()))
    })?;
    Ok(())
}

/// Incremental writer used when output partitions are built record by record
/// across a streaming pass.
pub struct VeldPartitionWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl VeldPartitionWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                VeldError::Io(format!("failed to create '{}': {err}", parent.display()))
            })?;
        }
        let file = File::create(&path).map_err(|err| {
            VeldError::Io(format!("failed to create partition '{}': {err}", path.display()))
        })?;
        Ok(VeldPartitionWriter {
            path,
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n").map_err(|err| {
            VeldError::Io(format!("failed to write partition '{}': {err}", self.path.display()))
        })?;
        self.records += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush().map_err(|err| {
            VeldError::Io(format!("failed to flush partition '{}': {err}", self.path.display()))
        })?;
        Ok(self.records)
    }
}
