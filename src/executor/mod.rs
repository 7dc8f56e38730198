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

//! # Veld Executor Module
//!
//! The executor translates a validated pipeline into per-stage worker pools
//! on a cluster, routes tasks between pools, and adapts pool sizes to
//! throughput.
//!
//! ## Execution Modes
//!
//! - **Streaming** (default): stages run concurrently; tasks flow through
//!   bounded channels, so a slow downstream stage backpressures upstream
//!   producers instead of growing memory without bound.
//! - **Batch**: every task of a wave completes stage *i* before stage *i+1*
//!   begins; simpler reasoning, higher latency.
//!
//! ## Pool Lifecycle
//!
//! Each stage's worker pool moves through
//! `Pending → Provisioning → Ready → Draining → Terminated`, with
//! `Ready → Faulted` when worker replacement is exhausted. A `Faulted` pool
//! fails the whole run.

pub mod batch;
pub mod cluster;
pub mod streaming;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::pipeline::VeldPipeline;
use crate::task::VeldTask;
use cluster::{VeldClusterSpec, VeldResourceLedger};

/// How tasks move between stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VeldExecutionMode {
    /// Concurrent stages with backpressure-bounded task flow.
    Streaming,
    /// Barrier-synchronized wave-by-wave execution.
    Batch,
}

/// Lifecycle of one stage's worker pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VeldPoolState {
    Pending,
    Provisioning,
    Ready,
    Draining,
    Faulted,
    Terminated,
}

impl fmt::Display for VeldPoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VeldPoolState::Pending => "pending",
            VeldPoolState::Provisioning => "provisioning",
            VeldPoolState::Ready => "ready",
            VeldPoolState::Draining => "draining",
            VeldPoolState::Faulted => "faulted",
            VeldPoolState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Terminal status of a pipeline run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VeldRunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Executor tuning knobs.
#[derive(Clone, Debug)]
pub struct VeldExecutorConfig {
    /// Streaming or batch execution.
    pub mode: VeldExecutionMode,

    /// Interval between progress log lines.
    pub logging_interval: Duration,

    /// Drop-and-count failed tasks instead of failing the run.
    pub ignore_failures: bool,

    /// Share of total cluster CPU the run may allocate, in (0, 1].
    pub cpu_allocation_percentage: f64,

    /// Interval between autoscaling decisions (streaming mode only).
    pub autoscale_interval: Duration,

    /// Per-task retry bound before the task counts as failed.
    pub max_task_retries: u32,

    /// Per-stage worker replacement bound before the pool faults.
    pub max_worker_restarts: u32,

    /// In-flight task bound per stage boundary (backpressure window).
    pub channel_capacity: usize,

    /// Worker floor per stage; autoscaling never goes below it.
    pub min_workers_per_stage: usize,

    /// Idle time before autoscaling releases a worker.
    pub idle_grace: Duration,

    /// Hard limit on draining after cancellation; `None` drains forever.
    pub drain_timeout: Option<Duration>,
}

impl Default for VeldExecutorConfig {
    fn default() -> Self {
        VeldExecutorConfig {
            mode: VeldExecutionMode::Streaming,
            logging_interval: Duration::from_secs(5),
            ignore_failures: false,
            cpu_allocation_percentage: 0.95,
            autoscale_interval: Duration::from_secs(10),
            max_task_retries: 3,
            max_worker_restarts: 2,
            channel_capacity: 8,
            min_workers_per_stage: 1,
            idle_grace: Duration::from_secs(10),
            drain_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Cooperative cancellation handle shared with a running pipeline.
///
/// Cancelling stops task admission; in-flight tasks drain before workers are
/// torn down, unless the configured `drain_timeout` escalates to a forced
/// stop.
#[derive(Clone, Debug, Default)]
pub struct VeldCancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl VeldCancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cooperative shutdown.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-stage outcome summary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VeldStageReport {
    pub name: String,
    /// Tasks successfully processed.
    pub processed: u64,
    /// Tasks that exhausted their retries.
    pub failed: u64,
    /// Retry deliveries performed.
    pub retried: u64,
    /// Largest concurrent worker count observed.
    pub peak_workers: usize,
    /// Last failure reason observed, if any.
    pub failure: Option<String>,
}

/// Terminal report for a pipeline run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VeldPipelineReport {
    pub pipeline: String,
    pub status: VeldRunStatus,
    pub stages: Vec<VeldStageReport>,
    /// Tasks emitted by the final stage.
    pub output_tasks: usize,
    pub elapsed_ms: u64,
}

impl VeldPipelineReport {
    pub fn is_success(&self) -> bool {
        self.status == VeldRunStatus::Completed
    }

    /// Total failed tasks across stages.
    pub fn total_failed(&self) -> u64 {
        self.stages.iter().map(|s| s.failed).sum()
    }
}

/// Runs validated pipelines against a cluster.
pub struct VeldExecutor {
    config: VeldExecutorConfig,
    cluster: VeldClusterSpec,
}

impl VeldExecutor {
    /// Creates an executor against the local machine's detected capacity.
    pub fn new(config: VeldExecutorConfig) -> Self {
        VeldExecutor {
            config,
            cluster: VeldClusterSpec::detect(),
        }
    }

    /// Creates an executor against an explicit cluster capacity.
    pub fn with_cluster(config: VeldExecutorConfig, cluster: VeldClusterSpec) -> Self {
        VeldExecutor { config, cluster }
    }

    pub fn config(&self) -> &VeldExecutorConfig {
        &self.config
    }

    /// Runs the pipeline over the given source tasks.
    pub fn run(
        &self,
        pipeline: &VeldPipeline,
        tasks: Vec<VeldTask>,
    ) -> Result<(Vec<VeldTask>, VeldPipelineReport)> {
        self.run_cancellable(pipeline, tasks, VeldCancellationToken::new())
    }

    /// Runs the pipeline with a caller-held cancellation token.
    pub fn run_cancellable(
        &self,
        pipeline: &VeldPipeline,
        tasks: Vec<VeldTask>,
        token: VeldCancellationToken,
    ) -> Result<(Vec<VeldTask>, VeldPipelineReport)> {
        pipeline.validate()?;

        // Every stage must be schedulable at all before any worker starts.
        let ledger = VeldResourceLedger::new(
            self.cluster.clone(),
            self.config.cpu_allocation_percentage,
        );
        for stage in pipeline.stages() {
            ledger.check_feasible(stage.name(), &stage.resources())?;
        }

        log::info!(
            "executing pipeline '{}' ({} stages, {} source tasks, {:?} mode)",
            pipeline.name(),
            pipeline.stages().len(),
            tasks.len(),
            self.config.mode
        );

        match self.config.mode {
            VeldExecutionMode::Streaming => {
                streaming::run(&self.config, self.cluster.clone(), pipeline, tasks, token)
            }
            VeldExecutionMode::Batch => {
                batch::run(&self.config, self.cluster.clone(), pipeline, tasks, token)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_round_trip() {
        let token = VeldCancellationToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn pool_state_display() {
        assert_eq!(VeldPoolState::Provisioning.to_string(), "provisioning");
        assert_eq!(VeldPoolState::Faulted.to_string(), "faulted");
    }
}
