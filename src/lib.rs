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

//! # Veld
//!
//! Veld is a stage-based pipeline execution engine for large-scale data
//! curation, with a built-in semantic-deduplication workflow.
//!
//! ## Architecture
//!
//! - [`task`] — the unit of data flowing between stages: a batch of records
//!   with an id and dataset name, owned by exactly one stage at a time.
//! - [`stage`] — the [`VeldStage`](stage::VeldStage) contract: declared
//!   resources, declared input/output attributes, per-worker `setup`, and a
//!   `process` transforming one task into zero or more.
//! - [`pipeline`] — ordered stage chains, built by
//!   [`VeldPipelineBuilder`](pipeline::VeldPipelineBuilder) with composite
//!   decomposition and fail-fast attribute validation.
//! - [`executor`] — the scheduling core: per-stage worker pools on a cluster,
//!   streaming (backpressure-bounded) or batch (barrier-synchronized)
//!   execution, autoscaling, retries, and a central resource ledger for
//!   fractional accelerator grants.
//! - [`dedup`] — the three-stage semantic-deduplication workflow: K-means
//!   clustering, per-cluster pairwise similarity, and threshold-based
//!   duplicate identification.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use veld::executor::{VeldExecutor, VeldExecutorConfig};
//! use veld::pipeline::VeldPipelineBuilder;
//!
//! let pipeline = VeldPipelineBuilder::new("curation")
//!     .add_stage(Arc::new(MyReader))
//!     .add_stage(Arc::new(MyFilter))
//!     .build()?;
//! let executor = VeldExecutor::new(VeldExecutorConfig::default());
//! let (outputs, report) = executor.run(&pipeline, source_tasks)?;
//! assert!(report.is_success());
//! ```

pub mod dedup;
pub mod errors;
pub mod executor;
pub mod pipeline;
pub mod record;
pub mod resources;
pub mod stage;
pub mod task;

pub use dedup::{VeldDedupSummary, VeldRankingStrategy, VeldSemanticDedup, VeldSimMetric};
pub use errors::{Result, VeldError};
pub use executor::cluster::{VeldAllocation, VeldClusterSpec, VeldResourceLedger};
pub use executor::{
    VeldCancellationToken, VeldExecutionMode, VeldExecutor, VeldExecutorConfig,
    VeldPipelineReport, VeldPoolState, VeldRunStatus, VeldStageReport,
};
pub use pipeline::{VeldPipeline, VeldPipelineBuilder};
pub use record::{VeldMetadata, VeldRecord, VeldRecordBatch};
pub use resources::VeldResources;
pub use stage::{VeldCompositeStage, VeldStage, VeldWorkerContext};
pub use task::VeldTask;
