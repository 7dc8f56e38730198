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

//! # Veld Streaming Runtime
//!
//! Streaming execution runs every stage concurrently. Stage boundaries are
//! bounded channels sized by `channel_capacity`, so a slow stage
//! backpressures its producers instead of buffering without limit. A feeder
//! thread admits source tasks, a collector thread gathers final-stage output,
//! and the calling thread becomes the monitor: it owns the resource ledger,
//! all pool state transitions, worker health, autoscaling, and progress
//! logging.
//!
//! ## Draining Cascade
//!
//! Completion propagates by channel disconnection. When the feeder finishes,
//! stage 0's input eventually disconnects; its workers drain the remaining
//! queue and exit; once the monitor has joined them it drops the stage's
//! sender into the next boundary, which lets the next stage drain, and so on
//! until the collector's channel closes.
//!
//! ## Failure Containment
//!
//! `process` failures and panics are contained to the task: the worker
//! retries up to `max_task_retries`, then counts the task failed. Worker
//! `setup` failure kills only that worker; the monitor replaces it up to
//! `max_worker_restarts` before the pool faults and the run fails.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use super::cluster::{VeldAllocation, VeldClusterSpec, VeldResourceLedger};
use super::{
    VeldCancellationToken, VeldExecutorConfig, VeldPipelineReport, VeldPoolState, VeldRunStatus,
    VeldStageReport,
};
use crate::errors::{Result, VeldError};
use crate::pipeline::VeldPipeline;
use crate::resources::VeldResources;
use crate::stage::{execute_stage, VeldStage, VeldWorkerContext};
use crate::task::VeldTask;

/// Monitor loop cadence.
const TICK: Duration = Duration::from_millis(20);

/// Blocking-call granularity inside workers; bounds shutdown latency.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Default)]
struct StageStats {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    in_flight: AtomicUsize,
    busy_nanos: AtomicU64,
    last_failure: Mutex<Option<String>>,
}

impl StageStats {
    fn record_failure(&self, message: String) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut slot) = self.last_failure.lock() {
            *slot = Some(message);
        }
    }
}

/// Everything a worker thread needs, shared across the pool.
///
/// The monitor drops its reference at stage termination; once the last
/// worker's clone is gone the stage's output sender disconnects and the
/// downstream stage can drain.
struct StageShared {
    stage: Arc<dyn VeldStage>,
    rx: Receiver<VeldTask>,
    tx_out: Sender<VeldTask>,
    stats: Arc<StageStats>,
    max_task_retries: u32,
}

struct WorkerHandle {
    stop: Arc<AtomicBool>,
    allocation: VeldAllocation,
    handle: JoinHandle<Result<()>>,
}

struct StagePool {
    name: String,
    resources: VeldResources,
    max_parallelism: Option<usize>,
    state: VeldPoolState,
    rx: Receiver<VeldTask>,
    shared: Option<Arc<StageShared>>,
    stats: Arc<StageStats>,
    workers: Vec<WorkerHandle>,
    target_workers: usize,
    next_worker_id: usize,
    restarts: u32,
    peak_workers: usize,
    idle_since: Option<Instant>,
    last_queue_len: usize,
}

impl StagePool {
    fn queue_len(&self) -> usize {
        self.rx.len()
    }

    fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::SeqCst)
    }

    fn report(&self) -> VeldStageReport {
        VeldStageReport {
            name: self.name.clone(),
            processed: self.stats.processed.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
            retried: self.stats.retried.load(Ordering::SeqCst),
            peak_workers: self.peak_workers,
            failure: self
                .stats
                .last_failure
                .lock()
                .ok()
                .and_then(|slot| slot.clone()),
        }
    }
}

/// Runs the pipeline in streaming mode. Called from `VeldExecutor` after
/// validation and feasibility checks.
pub(crate) fn run(
    config: &VeldExecutorConfig,
    cluster: VeldClusterSpec,
    pipeline: &VeldPipeline,
    tasks: Vec<VeldTask>,
    token: VeldCancellationToken,
) -> Result<(Vec<VeldTask>, VeldPipelineReport)> {
    let run_start = Instant::now();
    let capacity = config.channel_capacity.max(1);
    let ledger = Mutex::new(VeldResourceLedger::new(
        cluster,
        config.cpu_allocation_percentage,
    ));

    // Chain of bounded boundaries: feeder -> stage 0 -> ... -> collector.
    let (feed_tx, mut boundary_rx) = bounded::<VeldTask>(capacity);
    let mut pools: Vec<StagePool> = Vec::with_capacity(pipeline.stages().len());
    for stage in pipeline.stages() {
        let (tx_out, next_rx) = bounded::<VeldTask>(capacity);
        let stats = Arc::new(StageStats::default());
        let shared = Arc::new(StageShared {
            stage: Arc::clone(stage),
            rx: boundary_rx.clone(),
            tx_out,
            stats: Arc::clone(&stats),
            max_task_retries: config.max_task_retries,
        });
        pools.push(StagePool {
            name: stage.name().to_string(),
            resources: stage.resources(),
            max_parallelism: stage.max_parallelism(),
            state: VeldPoolState::Pending,
            rx: boundary_rx,
            shared: Some(shared),
            stats,
            workers: Vec::new(),
            target_workers: config.min_workers_per_stage.max(1),
            next_worker_id: 0,
            restarts: 0,
            peak_workers: 0,
            idle_since: None,
            last_queue_len: 0,
        });
        boundary_rx = next_rx;
    }
    let out_rx = boundary_rx;

    let stop_admission = Arc::new(AtomicBool::new(false));
    let feeder = spawn_feeder(feed_tx, tasks, token.clone(), Arc::clone(&stop_admission));
    let collector = thread::spawn(move || {
        let mut outputs = Vec::new();
        while let Ok(task) = out_rx.recv() {
            outputs.push(task);
        }
        outputs
    });

    let mut fatal: Option<VeldError> = None;
    let mut cancel_seen: Option<Instant> = None;
    let mut last_log = Instant::now();
    let mut last_scale = Instant::now();

    loop {
        thread::sleep(TICK);

        reap_workers(&mut pools, &ledger, config, &mut fatal);
        advance_states(&mut pools, &feeder);

        if fatal.is_some() {
            stop_admission.store(true, Ordering::SeqCst);
            force_stop(&mut pools, &ledger);
            break;
        }

        if token.is_cancelled() {
            let seen = *cancel_seen.get_or_insert_with(Instant::now);
            if let Some(limit) = config.drain_timeout {
                if seen.elapsed() >= limit {
                    log::warn!("drain timeout exceeded after cancellation, forcing stop");
                    force_stop(&mut pools, &ledger);
                    break;
                }
            }
        }

        if pools
            .iter()
            .all(|pool| pool.state == VeldPoolState::Terminated)
        {
            break;
        }

        provision(&mut pools, &ledger, &mut fatal);

        if cancel_seen.is_none() && last_scale.elapsed() >= config.autoscale_interval {
            autoscale(&mut pools, &ledger, config);
            last_scale = Instant::now();
        }

        if last_log.elapsed() >= config.logging_interval {
            for pool in &pools {
                log::info!(
                    "stage '{}' [{}]: workers={} queue={} processed={} failed={} retried={}",
                    pool.name,
                    pool.state,
                    pool.workers.len(),
                    pool.queue_len(),
                    pool.stats.processed.load(Ordering::SeqCst),
                    pool.stats.failed.load(Ordering::SeqCst),
                    pool.stats.retried.load(Ordering::SeqCst),
                );
            }
            last_log = Instant::now();
        }
    }

    stop_admission.store(true, Ordering::SeqCst);
    let admitted = feeder.join().unwrap_or(0);
    // All stage senders are gone once every pool dropped its shared handle,
    // so the collector drains and exits.
    let outputs = collector.join().unwrap_or_default();

    if let Some(err) = fatal {
        return Err(err);
    }

    let stages: Vec<VeldStageReport> = pools.iter().map(StagePool::report).collect();
    let total_failed: u64 = stages.iter().map(|s| s.failed).sum();
    let status = if token.is_cancelled() {
        VeldRunStatus::Cancelled
    } else if total_failed > 0 && !config.ignore_failures {
        VeldRunStatus::Failed
    } else {
        VeldRunStatus::Completed
    };

    log::info!(
        "pipeline '{}' {:?}: {} admitted, {} output tasks, {} failed, {:.1}s",
        pipeline.name(),
        status,
        admitted,
        outputs.len(),
        total_failed,
        run_start.elapsed().as_secs_f64()
    );

    let report = VeldPipelineReport {
        pipeline: pipeline.name().to_string(),
        status,
        stages,
        output_tasks: outputs.len(),
        elapsed_ms: run_start.elapsed().as_millis() as u64,
    };
    Ok((outputs, report))
}

fn spawn_feeder(
    feed_tx: Sender<VeldTask>,
    tasks: Vec<VeldTask>,
    token: VeldCancellationToken,
    stop_admission: Arc<AtomicBool>,
) -> JoinHandle<u64> {
    thread::spawn(move || {
        let mut admitted = 0u64;
        'outer: for mut task in tasks {
            loop {
                if token.is_cancelled() || stop_admission.load(Ordering::SeqCst) {
                    log::info!("task admission stopped after {admitted} tasks");
                    break 'outer;
                }
                match feed_tx.send_timeout(task, WAIT_SLICE) {
                    Ok(()) => {
                        admitted += 1;
                        break;
                    }
                    Err(SendTimeoutError::Timeout(back)) => task = back,
                    Err(SendTimeoutError::Disconnected(_)) => break 'outer,
                }
            }
        }
        admitted
    })
}

/// Joins workers whose threads have exited and accounts for setup failures.
fn reap_workers(
    pools: &mut [StagePool],
    ledger: &Mutex<VeldResourceLedger>,
    config: &VeldExecutorConfig,
    fatal: &mut Option<VeldError>,
) {
    for pool in pools.iter_mut() {
        let mut i = 0;
        while i < pool.workers.len() {
            if !pool.workers[i].handle.is_finished() {
                i += 1;
                continue;
            }
            let worker = pool.workers.remove(i);
            if let Ok(mut guard) = ledger.lock() {
                guard.release(&worker.allocation);
            }
            let init_error = match worker.handle.join() {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(_) => Some(VeldError::worker_init(
                    &pool.name,
                    "worker thread panicked outside task execution",
                )),
            };
            if let Some(err) = init_error {
                pool.restarts += 1;
                log::error!(
                    "stage '{}': worker died during initialization (restart {}/{}): {err}",
                    pool.name,
                    pool.restarts,
                    config.max_worker_restarts
                );
                if pool.restarts > config.max_worker_restarts {
                    pool.state = VeldPoolState::Faulted;
                    if fatal.is_none() {
                        *fatal = Some(err);
                    }
                }
            }
        }
    }
}

/// Moves pools along `Ready -> Draining -> Terminated` as upstream completes.
fn advance_states(pools: &mut [StagePool], feeder: &JoinHandle<u64>) {
    for i in 0..pools.len() {
        let upstream_done = if i == 0 {
            feeder.is_finished()
        } else {
            pools[i - 1].state == VeldPoolState::Terminated
        };
        let pool = &mut pools[i];
        match pool.state {
            VeldPoolState::Terminated | VeldPoolState::Faulted => {}
            VeldPoolState::Draining => {
                if pool.workers.is_empty() && pool.queue_len() == 0 && pool.in_flight() == 0 {
                    pool.state = VeldPoolState::Terminated;
                    // Dropping the shared handle disconnects this stage's
                    // output sender, letting the next stage drain.
                    pool.shared = None;
                    log::info!("stage '{}' drained", pool.name);
                }
            }
            _ => {
                if upstream_done {
                    pool.state = VeldPoolState::Draining;
                    log::debug!("stage '{}' draining", pool.name);
                }
            }
        }
    }
}

/// Spawns workers up to each pool's target while the ledger has headroom.
fn provision(
    pools: &mut [StagePool],
    ledger: &Mutex<VeldResourceLedger>,
    fatal: &mut Option<VeldError>,
) {
    for pool in pools.iter_mut() {
        let wants_workers = match pool.state {
            VeldPoolState::Pending | VeldPoolState::Provisioning | VeldPoolState::Ready => true,
            // A starved pool may still need a worker to clear its queue.
            VeldPoolState::Draining => pool.queue_len() > 0 || pool.in_flight() > 0,
            _ => false,
        };
        if !wants_workers {
            continue;
        }
        if pool.state == VeldPoolState::Pending {
            pool.state = VeldPoolState::Provisioning;
        }
        while pool.workers.len() < pool.target_workers {
            let grant = match ledger.lock() {
                Ok(mut guard) => guard.try_allocate(&pool.name, &pool.resources),
                Err(_) => break,
            };
            match grant {
                Ok(Some(allocation)) => spawn_worker(pool, allocation, ledger),
                Ok(None) => break,
                Err(err) => {
                    if fatal.is_none() {
                        *fatal = Some(err);
                    }
                    return;
                }
            }
        }
        if pool.state == VeldPoolState::Provisioning && !pool.workers.is_empty() {
            pool.state = VeldPoolState::Ready;
        }
    }
}

fn spawn_worker(
    pool: &mut StagePool,
    allocation: VeldAllocation,
    ledger: &Mutex<VeldResourceLedger>,
) {
    let shared = match &pool.shared {
        Some(shared) => Arc::clone(shared),
        None => {
            if let Ok(mut guard) = ledger.lock() {
                guard.release(&allocation);
            }
            return;
        }
    };
    let stop = Arc::new(AtomicBool::new(false));
    let ctx = VeldWorkerContext {
        worker_id: pool.next_worker_id,
        stage_name: pool.name.clone(),
        allocation: allocation.clone(),
    };
    let thread_stop = Arc::clone(&stop);
    let spawned = thread::Builder::new()
        .name(format!("veld-{}-{}", pool.name, pool.next_worker_id))
        .spawn(move || worker_loop(shared, ctx, thread_stop));
    match spawned {
        Ok(handle) => {
            log::debug!("stage '{}': spawned worker {}", pool.name, pool.next_worker_id);
            pool.next_worker_id += 1;
            pool.workers.push(WorkerHandle {
                stop,
                allocation,
                handle,
            });
            pool.peak_workers = pool.peak_workers.max(pool.workers.len());
        }
        Err(err) => {
            log::error!("stage '{}': failed to spawn worker thread: {err}", pool.name);
            if let Ok(mut guard) = ledger.lock() {
                guard.release(&allocation);
            }
        }
    }
}

/// Grows backlogged pools and shrinks idle ones, never below the floor.
fn autoscale(pools: &mut [StagePool], ledger: &Mutex<VeldResourceLedger>, config: &VeldExecutorConfig) {
    let now = Instant::now();
    let floor = config.min_workers_per_stage.max(1);

    for pool in pools.iter_mut() {
        if pool.state != VeldPoolState::Ready {
            pool.idle_since = None;
            continue;
        }
        let busy = pool.queue_len() > 0 || pool.in_flight() > 0;
        if busy {
            pool.idle_since = None;
            continue;
        }
        let since = *pool.idle_since.get_or_insert(now);
        if now.duration_since(since) >= config.idle_grace && pool.workers.len() > floor {
            pool.target_workers = pool.target_workers.saturating_sub(1).max(floor);
            if let Some(worker) = pool.workers.last() {
                worker.stop.store(true, Ordering::SeqCst);
            }
            log::info!(
                "stage '{}': scaling down to {} workers after idle grace",
                pool.name,
                pool.target_workers
            );
        }
    }

    // Rank growth candidates by estimated time to clear their backlog.
    let mut candidates: Vec<(usize, f64)> = pools
        .iter()
        .enumerate()
        .filter_map(|(i, pool)| {
            if pool.state != VeldPoolState::Ready {
                return None;
            }
            // Only grow a pool whose previous target has been met and whose
            // backlog is not already shrinking.
            if pool.workers.len() < pool.target_workers {
                return None;
            }
            let queue = pool.queue_len();
            if queue == 0 || queue < pool.last_queue_len {
                return None;
            }
            if let Some(cap) = pool.max_parallelism {
                if pool.workers.len() >= cap {
                    return None;
                }
            }
            let processed = pool.stats.processed.load(Ordering::SeqCst).max(1);
            let avg_secs =
                pool.stats.busy_nanos.load(Ordering::SeqCst) as f64 / processed as f64 / 1e9;
            Some((i, queue as f64 * avg_secs.max(1e-3)))
        })
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

    for (index, _) in candidates {
        let headroom = match ledger.lock() {
            Ok(guard) => guard.cpu_headroom(),
            Err(_) => 0.0,
        };
        let pool = &mut pools[index];
        if headroom + 1e-9 < pool.resources.cpu_cores {
            continue;
        }
        pool.target_workers += 1;
        log::info!(
            "stage '{}': scaling up to {} workers (queue={})",
            pool.name,
            pool.target_workers,
            pool.queue_len()
        );
    }

    for pool in pools.iter_mut() {
        pool.last_queue_len = pool.queue_len();
    }
}

/// Tears everything down without waiting for queues to drain. Undelivered
/// tasks are counted as failed.
fn force_stop(pools: &mut [StagePool], ledger: &Mutex<VeldResourceLedger>) {
    for pool in pools.iter() {
        for worker in &pool.workers {
            worker.stop.store(true, Ordering::SeqCst);
        }
    }
    for pool in pools.iter_mut() {
        for worker in pool.workers.drain(..) {
            let _ = worker.handle.join();
            if let Ok(mut guard) = ledger.lock() {
                guard.release(&worker.allocation);
            }
        }
        let mut dropped = 0u64;
        while let Ok(task) = pool.rx.try_recv() {
            dropped += 1;
            log::debug!("stage '{}': dropping task '{}' on forced stop", pool.name, task.id);
        }
        if dropped > 0 {
            pool.stats.failed.fetch_add(dropped, Ordering::SeqCst);
            log::warn!("stage '{}': dropped {dropped} queued tasks on forced stop", pool.name);
        }
        pool.shared = None;
        if pool.state != VeldPoolState::Faulted {
            pool.state = VeldPoolState::Terminated;
        }
    }
}

fn worker_loop(
    shared: Arc<StageShared>,
    ctx: VeldWorkerContext,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    shared
        .stage
        .setup(&ctx)
        .map_err(|err| VeldError::worker_init(shared.stage.name(), err.to_string()))?;
    log::debug!("stage '{}': worker {} ready", shared.stage.name(), ctx.worker_id);

    let batch_hint = shared.stage.batch_size().unwrap_or(1).max(1);
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let first = match shared.rx.recv_timeout(WAIT_SLICE) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        shared.stats.in_flight.fetch_add(1, Ordering::SeqCst);
        let mut batch = vec![first];
        while batch.len() < batch_hint {
            match shared.rx.try_recv() {
                Ok(task) => {
                    shared.stats.in_flight.fetch_add(1, Ordering::SeqCst);
                    batch.push(task);
                }
                Err(_) => break,
            }
        }
        if batch.len() > 1 {
            process_coalesced(&shared, batch, &stop);
        } else if let Some(task) = batch.pop() {
            process_task(&shared, task, &stop);
        }
    }
    Ok(())
}

/// Runs a coalesced batch through `process_batch`, falling back to per-task
/// execution on failure so one poison task cannot sink its peers.
fn process_coalesced(shared: &StageShared, batch: Vec<VeldTask>, stop: &AtomicBool) {
    let start = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        shared.stage.process_batch(batch.clone())
    }));
    shared
        .stats
        .busy_nanos
        .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    match outcome {
        Ok(Ok(outputs)) => {
            shared
                .stats
                .processed
                .fetch_add(batch.len() as u64, Ordering::SeqCst);
            shared
                .stats
                .in_flight
                .fetch_sub(batch.len(), Ordering::SeqCst);
            for task in outputs {
                if !send_downstream(shared, task, stop) {
                    break;
                }
            }
        }
        _ => {
            for task in batch {
                process_task(shared, task, stop);
            }
        }
    }
}

/// Runs a single task with in-worker retries, then settles its fate.
fn process_task(shared: &StageShared, mut task: VeldTask, stop: &AtomicBool) {
    let stage = shared.stage.as_ref();
    loop {
        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| execute_stage(stage, task.clone())));
        shared
            .stats
            .busy_nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(VeldError::task(
                stage.name(),
                &task.id,
                "panic during process",
            )),
        };
        match result {
            Ok(outputs) => {
                shared.stats.processed.fetch_add(1, Ordering::SeqCst);
                for out in outputs {
                    if !send_downstream(shared, out, stop) {
                        break;
                    }
                }
                break;
            }
            Err(err) => {
                if task.attempts < shared.max_task_retries && !stop.load(Ordering::Relaxed) {
                    task.attempts += 1;
                    shared.stats.retried.fetch_add(1, Ordering::SeqCst);
                    log::warn!(
                        "stage '{}': task '{}' failed (attempt {}), retrying: {err}",
                        stage.name(),
                        task.id,
                        task.attempts
                    );
                    thread::sleep(Duration::from_millis(10 * task.attempts as u64));
                } else {
                    log::error!(
                        "stage '{}': task '{}' dropped after {} attempts: {err}",
                        stage.name(),
                        task.id,
                        task.attempts + 1
                    );
                    shared.stats.record_failure(err.to_string());
                    break;
                }
            }
        }
    }
    shared.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
}

/// Pushes an output task into the next boundary, yielding to backpressure.
/// Returns false when the task could not be delivered.
fn send_downstream(shared: &StageShared, task: VeldTask, stop: &AtomicBool) -> bool {
    let mut task = task;
    loop {
        match shared.tx_out.send_timeout(task, WAIT_SLICE) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if stop.load(Ordering::Relaxed) {
                    return false;
                }
                task = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
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

    fn fast_config() -> VeldExecutorConfig {
        VeldExecutorConfig {
            mode: VeldExecutionMode::Streaming,
            logging_interval: Duration::from_secs(60),
            autoscale_interval: Duration::from_millis(50),
            idle_grace: Duration::from_millis(100),
            max_task_retries: 1,
            channel_capacity: 4,
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
    struct AddColumn {
        name: &'static str,
        column: &'static str,
    }

    impl VeldStage for AddColumn {
        fn name(&self) -> &str {
            self.name
        }

        fn process(&self, mut task: VeldTask) -> Result<Vec<VeldTask>> {
            for record in &mut task.data {
                if let Some(obj) = record.payload.as_object_mut() {
                    obj.insert(self.column.to_string(), json!(true));
                }
            }
            Ok(vec![task])
        }
    }

    fn source_tasks(n: usize) -> Vec<VeldTask> {
        (0..n)
            .map(|i| {
                VeldTask::new(
                    format!("task-{i}"),
                    "ds",
                    vec![VeldRecord::new(Some(format!("r{i}")), json!({"text": i}))],
                )
            })
            .collect()
    }

    #[test]
    fn two_stage_pipeline_preserves_tasks() {
        let pipeline = VeldPipelineBuilder::new("p")
            .add_stage(Arc::new(AddColumn {
                name: "a",
                column: "a",
            }))
            .add_stage(Arc::new(AddColumn {
                name: "b",
                column: "b",
            }))
            .build()
            .unwrap();
        let executor = VeldExecutor::with_cluster(fast_config(), cluster());
        let (outputs, report) = executor.run(&pipeline, source_tasks(12)).unwrap();
        assert_eq!(report.status, VeldRunStatus::Completed);
        assert_eq!(outputs.len(), 12);
        assert_eq!(report.output_tasks, 12);
        assert!(outputs
            .iter()
            .all(|t| t.data[0].payload.get("a").is_some() && t.data[0].payload.get("b").is_some()));
    }

    #[derive(Debug)]
    struct FailOn {
        id: &'static str,
    }

    impl VeldStage for FailOn {
        fn name(&self) -> &str {
            "flaky"
        }

        fn process(&self, task: VeldTask) -> Result<Vec<VeldTask>> {
            if task.id == self.id {
                return Err(VeldError::internal("corrupt shard"));
            }
            Ok(vec![task])
        }
    }

    #[test]
    fn failed_task_fails_run_unless_ignored() {
        let pipeline = VeldPipelineBuilder::new("p")
            .add_stage(Arc::new(FailOn { id: "task-3" }))
            .build()
            .unwrap();

        let executor = VeldExecutor::with_cluster(fast_config(), cluster());
        let (outputs, report) = executor.run(&pipeline, source_tasks(8)).unwrap();
        assert_eq!(report.status, VeldRunStatus::Failed);
        assert_eq!(outputs.len(), 7);
        assert_eq!(report.total_failed(), 1);
        assert_eq!(report.stages[0].retried, 1);

        let mut config = fast_config();
        config.ignore_failures = true;
        let executor = VeldExecutor::with_cluster(config, cluster());
        let (outputs, report) = executor.run(&pipeline, source_tasks(8)).unwrap();
        assert_eq!(report.status, VeldRunStatus::Completed);
        assert_eq!(outputs.len(), 7);
    }

    #[derive(Debug)]
    struct BrokenSetup;

    impl VeldStage for BrokenSetup {
        fn name(&self) -> &str {
            "broken.setup"
        }

        fn setup(&self, _ctx: &VeldWorkerContext) -> Result<()> {
            Err(VeldError::internal("model weights missing"))
        }

        fn process(&self, task: VeldTask) -> Result<Vec<VeldTask>> {
            Ok(vec![task])
        }
    }

    #[test]
    fn exhausted_worker_restarts_fail_the_run() {
        let pipeline = VeldPipelineBuilder::new("p")
            .add_stage(Arc::new(BrokenSetup))
            .build()
            .unwrap();
        let mut config = fast_config();
        config.max_worker_restarts = 1;
        let executor = VeldExecutor::with_cluster(config, cluster());
        let err = executor.run(&pipeline, source_tasks(4)).unwrap_err();
        assert!(matches!(err, VeldError::WorkerInit { .. }), "got {err:?}");
    }

    fn dummy_allocation() -> VeldAllocation {
        VeldAllocation {
            stage: "s".to_string(),
            cpu_cores: 1.0,
            gpu_device: None,
            gpu_fraction: None,
            whole_devices: Vec::new(),
            decode_units: 0,
            encode_units: 0,
        }
    }

    fn test_pool(queued: usize, workers: usize) -> (StagePool, crossbeam_channel::Sender<VeldTask>) {
        let (tx, rx) = bounded::<VeldTask>(16);
        for i in 0..queued {
            tx.send(VeldTask::new(format!("t{i}"), "ds", Vec::new()))
                .unwrap();
        }
        let mut pool = StagePool {
            name: "s".to_string(),
            resources: VeldResources::cpu(1.0),
            max_parallelism: None,
            state: VeldPoolState::Ready,
            rx,
            shared: None,
            stats: Arc::new(StageStats::default()),
            workers: Vec::new(),
            target_workers: workers,
            next_worker_id: workers,
            restarts: 0,
            peak_workers: workers,
            idle_since: None,
            last_queue_len: 0,
        };
        for _ in 0..workers {
            let stop = Arc::new(AtomicBool::new(false));
            let thread_stop = Arc::clone(&stop);
            let handle = thread::spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            });
            pool.workers.push(WorkerHandle {
                stop,
                allocation: dummy_allocation(),
                handle,
            });
        }
        (pool, tx)
    }

    #[test]
    fn autoscale_grows_backlog_and_shrinks_idle_to_floor() {
        let config = VeldExecutorConfig {
            idle_grace: Duration::ZERO,
            min_workers_per_stage: 1,
            ..Default::default()
        };
        let ledger = Mutex::new(VeldResourceLedger::new(cluster(), 1.0));
        let (backlogged, _feed) = test_pool(6, 1);
        let (idle, _unused) = test_pool(0, 3);
        let mut pools = vec![backlogged, idle];

        autoscale(&mut pools, &ledger, &config);
        assert_eq!(pools[0].target_workers, 2, "backlogged pool should grow");
        assert_eq!(pools[1].target_workers, 2, "idle pool should shrink");

        // Repeated idle intervals shrink to the floor and no further.
        autoscale(&mut pools, &ledger, &config);
        autoscale(&mut pools, &ledger, &config);
        autoscale(&mut pools, &ledger, &config);
        assert_eq!(pools[1].target_workers, 1, "floor must hold");
        assert!(pools[1]
            .workers
            .iter()
            .any(|w| w.stop.load(Ordering::Relaxed)));

        for pool in &mut pools {
            for worker in pool.workers.drain(..) {
                worker.stop.store(true, Ordering::SeqCst);
                worker.handle.join().unwrap().unwrap();
            }
        }
    }

    #[test]
    fn pre_cancelled_run_admits_nothing() {
        let pipeline = VeldPipelineBuilder::new("p")
            .add_stage(Arc::new(AddColumn {
                name: "a",
                column: "a",
            }))
            .build()
            .unwrap();
        let token = VeldCancellationToken::new();
        token.cancel();
        let executor = VeldExecutor::with_cluster(fast_config(), cluster());
        let (outputs, report) = executor
            .run_cancellable(&pipeline, source_tasks(100), token)
            .unwrap();
        assert_eq!(report.status, VeldRunStatus::Cancelled);
        assert!(outputs.is_empty());
    }
}
