//! Engine core loop: schedule, execute, apply.
//!
//! Scheduler state sits behind one mutex and the abort queue behind another;
//! both are taken in the order aborts -> scheduler and neither is held while
//! the executor runs, so requests can be added or aborted from other threads
//! mid-step. Aborts that arrive while a batch is executing are queued and
//! applied before that batch's results, and before the next schedule.
//! Pipelined steps take turns on their own lock; the batch queue is locked
//! only to push or pop, never while waiting on a batch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use engine_common::config::EngineConfig;
use engine_common::{EngineError, Result};
use engine_executor::{ExecutionHandle, Executor, ModelOutput, RequestId, SchedulerOutput};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::block_pool::BlockPoolMetrics;
use crate::outputs::{EngineCoreOutputs, StepResult};
use crate::prefix_cache::PrefixCacheMetrics;
use crate::request::{FinishReason, Request, RequestStatus};
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_steps: u64,
    pub total_requests: u64,
    pub waiting_requests: usize,
    pub running_requests: usize,
    pub kv_usage: f64,
    pub block_pool: BlockPoolMetrics,
    pub prefix_cache: PrefixCacheMetrics,
}

#[derive(Debug, Default)]
struct AbortState {
    in_flight_batches: usize,
    pending: HashSet<RequestId>,
}

pub struct EngineCore<E: Executor> {
    executor: E,
    scheduler: Mutex<Scheduler>,
    aborts: Mutex<AbortState>,
    batch_queue: Mutex<VecDeque<(SchedulerOutput, ExecutionHandle)>>,
    pipeline: Mutex<()>,
    batch_queue_size: usize,
    total_steps: AtomicU64,
    total_requests: AtomicU64,
    shut_down: AtomicBool,
}

impl<E: Executor> EngineCore<E> {
    pub fn new(config: &EngineConfig, executor: E) -> Result<Self> {
        let scheduler = Scheduler::new(config)?;
        tracing::info!(
            target: "engine",
            num_blocks = config.cache.num_blocks,
            block_size = config.cache.block_size,
            max_num_seqs = config.scheduler.max_num_seqs,
            max_num_batched_tokens = config.scheduler.max_num_batched_tokens,
            policy = ?config.cache.eviction_policy,
            "engine core initialised"
        );
        Ok(Self {
            executor,
            scheduler: Mutex::new(scheduler),
            aborts: Mutex::new(AbortState::default()),
            batch_queue: Mutex::new(VecDeque::new()),
            pipeline: Mutex::new(()),
            batch_queue_size: config.batch_queue_size,
            total_steps: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn add_request(&self, req: Request) -> Result<()> {
        self.scheduler.lock().add_request(req)?;
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Abort now, or after the executing batch if one is in flight.
    pub fn abort_requests<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut aborts = self.aborts.lock();
        if aborts.in_flight_batches > 0 {
            aborts.pending.extend(ids.into_iter().map(|id| id.as_ref().to_string()));
            tracing::debug!(target: "engine", pending = aborts.pending.len(), "abort queued behind in-flight batch");
            return;
        }
        self.scheduler.lock().abort_requests(ids);
    }

    /// Finish live requests with `reason`, e.g. the batch of a failed step.
    /// Their notices are delivered with the next outputs.
    pub fn finish_requests<I, S>(&self, ids: I, reason: FinishReason) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.scheduler.lock().finish_requests(ids, reason)
    }

    pub fn has_unfinished_requests(&self) -> bool {
        self.scheduler.lock().has_unfinished_requests()
    }

    /// Unfinished requests or submitted batches not yet applied. Does not
    /// wait on an executing batch.
    pub fn has_pending_work(&self) -> bool {
        !self.batch_queue.lock().is_empty() || self.has_unfinished_requests()
    }

    pub fn request_status(&self, id: &str) -> Option<RequestStatus> {
        self.scheduler.lock().request_status(id)
    }

    /// Run `f` against the scheduler under its lock.
    pub fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
        let mut sched = self.scheduler.lock();
        f(&mut sched)
    }

    /// Finish notices not yet delivered by a step, e.g. aborts on an idle
    /// engine.
    pub fn take_finished_outputs(&self) -> HashMap<usize, EngineCoreOutputs> {
        self.scheduler.lock().take_finished_reports()
    }

    /// One synchronous step. Returns without calling the executor when
    /// nothing is unfinished or nothing fits the budget.
    pub fn step(&self) -> Result<StepResult> {
        let output = {
            let mut aborts = self.aborts.lock();
            let mut sched = self.scheduler.lock();
            apply_pending(&mut aborts, &mut sched);
            if !sched.has_unfinished_requests() {
                return Ok(StepResult::idle(sched.take_finished_reports()));
            }
            let output = sched.schedule();
            if output.is_empty() {
                return Ok(StepResult::idle(sched.take_finished_reports()));
            }
            aborts.in_flight_batches += 1;
            output
        };
        self.total_steps.fetch_add(1, Ordering::Relaxed);
        let result = self.executor.execute_model(&output);
        self.finish_batch(&output, result)
    }

    /// Pipelined step: keep up to `batch_queue_size` batches submitted and
    /// apply results strictly in submission order. While the queue has room
    /// and a new batch was scheduled, returns without waiting.
    pub fn step_with_batch_queue(&self) -> Result<StepResult> {
        // one pipelined step at a time, so batches are applied in order
        let _turn = self.pipeline.lock();
        let has_room = self.batch_queue.lock().len() < self.batch_queue_size;
        let mut scheduled = false;
        if has_room {
            let output = {
                let mut aborts = self.aborts.lock();
                let mut sched = self.scheduler.lock();
                apply_pending(&mut aborts, &mut sched);
                let output = if sched.has_unfinished_requests() { sched.schedule() } else { SchedulerOutput::default() };
                if !output.is_empty() {
                    sched.mark_in_flight(&output);
                    aborts.in_flight_batches += 1;
                }
                output
            };
            if !output.is_empty() {
                self.total_steps.fetch_add(1, Ordering::Relaxed);
                let handle = self.executor.submit_model(&output);
                self.batch_queue.lock().push_back((output, handle));
                scheduled = true;
            }
        }

        if scheduled && self.batch_queue.lock().len() < self.batch_queue_size {
            return Ok(StepResult { outputs: self.take_finished_outputs(), executed: true });
        }
        let next = self.batch_queue.lock().pop_front();
        let Some((output, handle)) = next else {
            return Ok(StepResult::idle(self.take_finished_outputs()));
        };
        let result = handle.wait();
        self.finish_batch(&output, result)
    }

    fn finish_batch(&self, output: &SchedulerOutput, result: Result<ModelOutput>) -> Result<StepResult> {
        let mut aborts = self.aborts.lock();
        aborts.in_flight_batches = aborts.in_flight_batches.saturating_sub(1);
        let mut sched = self.scheduler.lock();
        sched.release_in_flight(output);
        apply_pending(&mut aborts, &mut sched);
        drop(aborts);

        let model_output = match result {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(
                    target: "engine",
                    step = output.step_id,
                    num_requests = output.num_requests(),
                    num_tokens = output.total_num_scheduled_tokens,
                    error = %e,
                    "executor failed"
                );
                return Err(EngineError::StepFailed {
                    num_requests: output.num_requests(),
                    num_tokens: output.total_num_scheduled_tokens,
                    request_ids: output.request_ids().map(str::to_string).collect(),
                    source: Box::new(e),
                });
            }
        };
        let mut outputs = sched.update_from_output(output, &model_output);
        for (client, reports) in sched.take_finished_reports() {
            outputs.entry(client).or_default().merge(reports);
        }
        tracing::trace!(target: "engine", step = output.step_id, clients = outputs.len(), "step applied");
        Ok(StepResult { outputs, executed: true })
    }

    pub fn get_stats(&self) -> EngineStats {
        let sched = self.scheduler.lock();
        EngineStats {
            total_steps: self.total_steps.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            waiting_requests: sched.num_waiting(),
            running_requests: sched.num_running(),
            kv_usage: sched.kv().usage(),
            block_pool: sched.kv().pool_metrics(),
            prefix_cache: sched.kv().prefix_metrics(),
        }
    }

    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = {
            let mut queue = self.batch_queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        self.executor.shutdown();
        tracing::info!(target: "engine", dropped_batches = dropped, "engine core shut down");
    }
}

fn apply_pending(aborts: &mut AbortState, sched: &mut Scheduler) {
    if aborts.pending.is_empty() {
        return;
    }
    let ids: Vec<RequestId> = aborts.pending.drain().collect();
    let n = sched.abort_requests(&ids);
    tracing::debug!(target: "engine", queued = ids.len(), aborted = n, "applied queued aborts");
}
