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

//! # Veld Stage Module
//!
//! This module defines the core stage trait and execution utilities for the
//! Veld engine. Stages are the fundamental building blocks composed into
//! pipelines.
//!
//! ## Stage Design
//!
//! A stage declares its per-worker resource needs and the record columns it
//! requires and produces. The executor calls `setup` exactly once per worker
//! before any `process` call; expensive one-time initialization (loading a
//! model into device memory, opening a session) belongs there. `process`
//! transforms one task into zero or more output tasks — fan-out is allowed,
//! fan-in requires a dedicated aggregation stage.
//!
//! ## Implementing Custom Stages
//!
//! ```rust,ignore
//! use veld::stage::{VeldStage, VeldWorkerContext};
//! use veld::task::VeldTask;
//! use veld::errors::Result;
//!
//! #[derive(Debug)]
//! struct Uppercase;
//!
//! impl VeldStage for Uppercase {
//!     fn name(&self) -> &str {
//!         "transform.uppercase"
//!     }
//!
//!     fn process(&self, task: VeldTask) -> Result<Vec<VeldTask>> {
//!         // produce a new task; never mutate one already handed downstream
//!         Ok(vec![task])
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use crate::errors::{Result, VeldError};
use crate::executor::cluster::VeldAllocation;
use crate::resources::VeldResources;
use crate::task::VeldTask;

/// Per-worker execution context handed to `setup`.
#[derive(Clone, Debug)]
pub struct VeldWorkerContext {
    /// Worker index within the stage's pool.
    pub worker_id: usize,

    /// Name of the stage this worker executes.
    pub stage_name: String,

    /// The resource grant backing this worker.
    pub allocation: VeldAllocation,
}

/// Contract every primitive Veld stage must fulfill.
///
/// Implementations must be `Send + Sync`: one stage instance is shared by all
/// workers of its pool, so any mutable setup state needs interior mutability
/// (`OnceLock`, `Mutex`) keyed per worker.
pub trait VeldStage: Send + Sync + fmt::Debug {
    /// Stable name, unique within a pipeline.
    fn name(&self) -> &str;

    /// Per-worker resource request; defaults to one CPU core.
    fn resources(&self) -> VeldResources {
        VeldResources::default()
    }

    /// Record columns every incoming task must carry.
    fn input_attrs(&self) -> Vec<String> {
        Vec::new()
    }

    /// Record columns every outgoing task is guaranteed to carry.
    fn output_attrs(&self) -> Vec<String> {
        Vec::new()
    }

    /// Upper bound on concurrent workers for this stage, if any.
    fn max_parallelism(&self) -> Option<usize> {
        None
    }

    /// One-time per-worker initialization; must be idempotent per worker
    /// lifetime. Failure is fatal for the worker, not for any task.
    fn setup(&self, _ctx: &VeldWorkerContext) -> Result<()> {
        Ok(())
    }

    /// Transforms one task into zero or more output tasks.
    fn process(&self, task: VeldTask) -> Result<Vec<VeldTask>>;

    /// Vectorized variant; semantically equivalent to sequential `process`
    /// calls, only faster. The executor may coalesce up to `batch_size`
    /// pending tasks before invoking it.
    fn process_batch(&self, tasks: Vec<VeldTask>) -> Result<Vec<VeldTask>> {
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            out.extend(self.process(task)?);
        }
        Ok(out)
    }

    /// Coalescing hint for `process_batch`; `None` disables coalescing.
    fn batch_size(&self) -> Option<usize> {
        None
    }
}

/// A user-facing stage that expands into primitive stages at build time.
///
/// Decomposition is a build-time tree expansion, not runtime behavior: the
/// pipeline built from a composite contains only the primitive stages.
pub trait VeldCompositeStage: fmt::Debug {
    /// Name of the composite, used in validation messages.
    fn name(&self) -> &str;

    /// Ordered primitive stages this composite expands into.
    fn decompose(&self) -> Vec<Arc<dyn VeldStage>>;
}

/// Convenience helper executing a stage while normalizing errors.
///
/// Any failure is attributed to the stage and the task it was processing so
/// the executor can report failures per stage without every implementation
/// wrapping its own errors.
pub fn execute_stage(stage: &dyn VeldStage, task: VeldTask) -> Result<Vec<VeldTask>> {
    let task_id = task.id.clone();
    stage
        .process(task)
        .map_err(|err| VeldError::task(stage.name(), task_id, err.to_string()))
}
