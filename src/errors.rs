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

//! # Veld Error Module
//!
//! This module defines the error types and utilities used throughout the
//! Veld engine for consistent error handling and reporting.
//!
//! ## Error Categories
//!
//! - **Validation**: pipeline attribute mismatch or malformed configuration,
//!   always raised before execution starts
//! - **WorkerInit**: stage `setup` failure on a worker, fatal for that worker
//! - **TaskProcessing**: failure inside `process` for a single task
//! - **ResourceExhaustion**: the cluster cannot ever satisfy a stage's
//!   declared resources
//! - **DataContract**: malformed persisted inputs (dimension mismatch,
//!   corrupt partition), fatal for the affected partition only
//! - **Pipeline**: orchestration failures attributed to a stage
//! - **Io / Serde / Internal**: infrastructure failures
//!
//! Errors local to one task or partition are contained and reported in
//! aggregate by the executor; validation, scheduling, and worker
//! initialization errors halt the run.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result type used throughout Veld.
pub type Result<T> = std::result::Result<T, VeldError>;

/// Canonical error enumeration for Veld.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum VeldError {
    /// Validation errors triggered by invalid parameters, pipelines, or inputs.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A stage `setup` hook failed on a worker.
    #[error("worker init failed for stage '{stage}': {message}")]
    WorkerInit { stage: String, message: String },

    /// A stage `process` call failed for a single task.
    #[error("stage '{stage}' failed on task '{task_id}': {message}")]
    TaskProcessing {
        stage: String,
        task_id: String,
        message: String,
    },

    /// The cluster cannot satisfy a stage's declared resource request.
    #[error("resource request for stage '{stage}' cannot be satisfied: {message}")]
    ResourceExhaustion { stage: String, message: String },

    /// Malformed persisted data, isolated to the named partition.
    #[error("data contract violation in '{partition}': {message}")]
    DataContract { partition: String, message: String },

    /// Failures that occur while orchestrating a pipeline.
    #[error("pipeline error at stage '{stage}': {message}")]
    Pipeline { stage: String, message: String },

    /// Errors originating from filesystem IO.
    #[error("io error: {0}")]
    Io(String),

    /// Wrapper for serde-style serialization issues.
    #[error("serialization error: {0}")]
    Serde(String),

    /// Catch-all variant for unexpected situations.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for VeldError {
    fn from(err: io::Error) -> Self {
        VeldError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for VeldError {
    fn from(err: serde_json::Error) -> Self {
        VeldError::Serde(err.to_string())
    }
}

impl VeldError {
    /// Helper to construct simple validation errors.
    pub fn validation<T: Into<String>>(message: T) -> Self {
        VeldError::Validation {
            message: message.into(),
        }
    }

    /// Helper to construct worker initialization errors.
    pub fn worker_init(stage: impl Into<String>, message: impl Into<String>) -> Self {
        VeldError::WorkerInit {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Helper to construct per-task processing errors.
    pub fn task(
        stage: impl Into<String>,
        task_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        VeldError::TaskProcessing {
            stage: stage.into(),
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    /// Helper to construct resource exhaustion errors.
    pub fn resources(stage: impl Into<String>, message: impl Into<String>) -> Self {
        VeldError::ResourceExhaustion {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Helper to construct data contract errors for a partition.
    pub fn data_contract(partition: impl Into<String>, message: impl Into<String>) -> Self {
        VeldError::DataContract {
            partition: partition.into(),
            message: message.into(),
        }
    }

    /// Helper to construct pipeline errors.
    pub fn pipeline(stage: impl Into<String>, message: impl Into<String>) -> Self {
        VeldError::Pipeline {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Helper to construct internal errors.
    pub fn internal<T: Into<String>>(message: T) -> Self {
        VeldError::Internal(message.into())
    }

    /// True for errors contained to a single task or partition.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            VeldError::TaskProcessing { .. } | VeldError::DataContract { .. }
        )
    }
}
