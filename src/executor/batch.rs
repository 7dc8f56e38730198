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

//! # Veld Batch Runtime
//!
//! Batch execution is barrier-synchronized: every task of the current wave
//! finishes stage *i* before stage *i+1* starts. Each stage gets a dedicated
//! thread pool sized by how many resource grants the ledger can hand out at
//! once; `setup` runs once on every pool thread before any task, mirroring
//! the per-worker initialization contract of streaming mode.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use rayon::prelude::*;

use super::cluster::{VeldClusterSpec, VeldResourceLedger};
use super::{
    VeldCancellationToken, VeldExecutorConfig, VeldPipelineReport, VeldRunStatus, VeldStageReport,
};
use crate::errors::{Result, VeldError};
use crate::pipeline::VeldPipeline;
use crate::stage::{execute_stage, VeldStage, VeldWorkerContext};
use crate::task::VeldTask;

/// Runs the pipeline in batch mode. Called from `VeldExecutor` after
/// validation and feasibility checks.
pub(crate) fn run(
    config: &VeldExecutorConfig,
    cluster: VeldClusterSpec,
    pipeline: &VeldPipeline,
    tasks: Vec<VeldTask>,
    token: VeldCancellationToken,
) -> Result<(Vec<VeldTask>, VeldPipelineReport)> {
    let run_start = Instant::now();
    let mut ledger = VeldResourceLedger::new(cluster, config.cpu_allocation_percentage);

    let mut wave = tasks;
    let mut stages: Vec<VeldStageReport> = Vec::with_capacity(pipeline.stages().len());
    let mut status = VeldRunStatus::Completed;

    for stage in pipeline.stages() {
        if token.is_cancelled() {
            status = VeldRunStatus::Cancelled;
            break;
        }
        let (next, report) = run_wave(config, &mut ledger, stage.as_ref(), wave)?;
        let failed = report.failed;
        stages.push(report);
        wave = next;
        if failed > 0 && !config.ignore_failures {
            status = VeldRunStatus::Failed;
            break;
        }
    }

    log::info!(
        "pipeline '{}' {:?}: {} output tasks, {:.1}s",
        pipeline.name(),
        status,
        wave.len(),
        run_start.elapsed().as_secs_f64()
    );

    let report = VeldPipelineReport {
        pipeline: pipeline.name().to_string(),
        status,
        stages,
        output_tasks: wave.len(),
        elapsed_ms: run_start.elapsed().as_millis() as u64,
    };
    Ok((wave, report))
}

/// Runs one stage over the whole wave and returns the next wave.
fn run_wave(
    config: &VeldExecutorConfig,
    ledger: &mut VeldResourceLedger,
    stage: &dyn VeldStage,
    wave: Vec<VeldTask>,
) -> Result<(Vec<VeldTask>, VeldStageReport)> {
    if wave.is_empty() {
        return Ok((
            Vec::new(),
            VeldStageReport {
                name: stage.name().to_string(),
                processed: 0,
                failed: 0,
                retried: 0,
                peak_workers: 0,
                failure: None,
            },
        ));
    }

    // Grab as many grants as the ledger allows right now, bounded by the
    // wave size and the stage's declared parallelism ceiling.
    let request = stage.resources();
    let mut limit = wave.len().max(1);
    if let Some(cap) = stage.max_parallelism() {
        limit = limit.min(cap.max(1));
    }
    let mut allocations = Vec::new();
    while allocations.len() < limit {
        match ledger.try_allocate(stage.name(), &request)? {
            Some(allocation) => allocations.push(allocation),
            None => break,
        }
    }
    if allocations.is_empty() {
        return Err(VeldError::resources(
            stage.name(),
            "no resource grant available for batch wave",
        ));
    }
    let workers = allocations.len();
    log::info!(
        "stage '{}': batch wave of {} tasks on {} workers",
        stage.name(),
        wave.len(),
        workers
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("veld-batch-{i}"))
        .build()
        .map_err(|err| VeldError::internal(format!("failed to build batch pool: {err}")))?;

    // Per-worker setup, once on every pool thread.
    let setup_results = pool.broadcast(|ctx| {
        let worker_ctx = VeldWorkerContext {
            worker_id: ctx.index(),
            stage_name: stage.name().to_string(),
            allocation: allocations[ctx.index()].clone(),
        };
        stage.setup(&worker_ctx)
    });
    for result in setup_results {
        if let Err(err) = result {
            for allocation in &allocations {
                ledger.release(allocation);
            }
            return Err(VeldError::worker_init(stage.name(), err.to_string()));
        }
    }

    let retried = AtomicU64::new(0);
    let last_failure: Mutex<Option<String>> = Mutex::new(None);
    let results: Vec<std::result::Result<Vec<VeldTask>, ()>> = pool.install(|| {
        wave.into_par_iter()
            .map(|task| {
                process_with_retry(stage, task, config.max_task_retries, &retried, &last_failure)
            })
            .collect()
    });

    for allocation in &allocations {
        ledger.release(allocation);
    }

    let mut next = Vec::new();
    let mut processed = 0u64;
    let mut failed = 0u64;
    for result in results {
        match result {
            Ok(outputs) => {
                processed += 1;
                next.extend(outputs);
            }
            Err(()) => failed += 1,
        }
    }

    let failure = last_failure.lock().ok().and_then(|slot| slot.clone());
    Ok((
        next,
        VeldStageReport {
            name: stage.name().to_string(),
            processed,
            failed,
            retried: retried.load(Ordering::SeqCst),
            peak_workers: workers,
            failure,
        },
    ))
}

/// Same retry and panic-containment semantics as a streaming worker.
fn process_with_retry(
    stage: &dyn VeldStage,
    mut task: VeldTask,
    max_retries: u32,
    retried: &AtomicU64,
    last_failure: &Mutex<Option<String>>,
) -> std::result::Result<Vec<VeldTask>, ()> {
    loop {
        let outcome = catch_unwind(AssertUnwindSafe(|| execute_stage(stage, task.clone())));
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(VeldError::task(
                stage.name(),
                &task.id,
                "panic during process",
            )),
        };
        match result {
            Ok(outputs) => return Ok(outputs),
            Err(err) => {
                if task.attempts < max_retries {
                    task.attempts += 1;
                    retried.fetch_add(1, Ordering::SeqCst);
                    log::warn!(
                        "stage '{}': task '{}' failed (attempt {}), retrying: {err}",
                        stage.name(),
                        task.id,
                        task.attempts
                    );
                } else {
                    log::error!(
                        "stage '{}': task '{}' dropped after {} attempts: {err}",
                        stage.name(),
                        task.id,
                        task.attempts + 1
                    );
                    if let Ok(mut slot) = last_failure.lock() {
                        *slot = Some(err.to_string());
                    }
                    return Err(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{VeldExecutionMode, VeldExecutor};
    use crate::pipeline::VeldPipelineBuilder;
    use crate::record::VeldRecord;
    use serde_json::json;
    use std::sync::Arc;

    fn batch_config() -> VeldExecutorConfig {
        VeldExecutorConfig {
            mode: VeldExecutionMode::Batch,
            max_task_retries: 1,
            ..Default::default()
        }
    }

    fn cluster() -> VeldClusterSpec {
        VeldClusterSpec {
            cpu_cores: 4.0,
            gpus: 0,
            decode_units: 0,
            encode_units: 0,
        }
    }

    #[derive(Debug)]
    struct Doubler;

    impl VeldStage for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }

        fn process(&self, task: VeldTask) -> Result<Vec<VeldTask>> {
            let copy = VeldTask::new(format!("{}/copy", task.id), task.dataset_name.clone(), task.data.clone());
            Ok(vec![task, copy])
        }
    }

    fn source_tasks(n: usize) -> Vec<VeldTask> {
        (0..n)
            .map(|i| {
                VeldTask::new(
                    format!("task-{i}"),
                    "ds",
                    vec![VeldRecord::new(None, json!({"n": i}))],
                )
            })
            .collect()
    }

    #[test]
    fn waves_are_barrier_synchronized() {
        let pipeline = VeldPipelineBuilder::new("p")
            .add_stage(Arc::new(Doubler))
            .build()
            .unwrap();
        let executor = VeldExecutor::with_cluster(batch_config(), cluster());
        let (outputs, report) = executor.run(&pipeline, source_tasks(5)).unwrap();
        assert_eq!(report.status, VeldRunStatus::Completed);
        assert_eq!(outputs.len(), 10);
        assert_eq!(report.stages[0].processed, 5);
        assert!(report.stages[0].peak_workers >= 1);
    }

    #[derive(Debug)]
    struct AlwaysFails;

    impl VeldStage for AlwaysFails {
        fn name(&self) -> &str {
            "always.fails"
        }

        fn process(&self, _task: VeldTask) -> Result<Vec<VeldTask>> {
            Err(VeldError::internal("boom"))
        }
    }

    #[test]
    fn failing_wave_stops_the_run() {
        let pipeline = VeldPipelineBuilder::new("p")
            .add_stage(Arc::new(AlwaysFails))
            .add_stage(Arc::new(Doubler))
            .build()
            .unwrap();
        let executor = VeldExecutor::with_cluster(batch_config(), cluster());
        let (outputs, report) = executor.run(&pipeline, source_tasks(3)).unwrap();
        assert_eq!(report.status, VeldRunStatus::Failed);
        assert!(outputs.is_empty());
        // The second stage never ran.
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.stages[0].failed, 3);
        assert_eq!(report.stages[0].retried, 3);
    }

    #[test]
    fn ignore_failures_drops_and_continues() {
        let pipeline = VeldPipelineBuilder::new("p")
            .add_stage(Arc::new(AlwaysFails))
            .add_stage(Arc::new(Doubler))
            .build()
            .unwrap();
        let mut config = batch_config();
        config.ignore_failures = true;
        let executor = VeldExecutor::with_cluster(config, cluster());
        let (outputs, report) = executor.run(&pipeline, source_tasks(3)).unwrap();
        assert_eq!(report.status, VeldRunStatus::Completed);
        assert!(outputs.is_empty());
        assert_eq!(report.stages.len(), 2);
    }
}
