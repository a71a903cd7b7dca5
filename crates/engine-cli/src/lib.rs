//! Synthetic workloads for driving the engine core from the command line.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use engine_common::config::LoadBalancerConfig;
use engine_core::{
    EngineCore, EngineCoreOutputMessage, EngineCoreOutputs, EngineCoreProc, EngineProcOptions, EngineStats,
    P2cLoadBalancer, Request, SamplingParams, WorkerState,
};
use engine_executor::Executor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Consecutive steps that neither ran a batch nor produced output before
/// the run is declared stuck.
const MAX_IDLE_STEPS: usize = 1000;
const OUTPUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Requests sharing a small set of system prompts, followed by a unique tail.
#[derive(Debug, Clone)]
pub struct Workload {
    pub requests: usize,
    pub prefixes: usize,
    pub prefix_len: u32,
    pub suffix_len: u32,
    pub max_tokens: usize,
    pub vocab_size: u32,
    pub seed: u64,
}

impl Default for Workload {
    fn default() -> Self {
        Self { requests: 64, prefixes: 4, prefix_len: 48, suffix_len: 16, max_tokens: 32, vocab_size: 32000, seed: 0 }
    }
}

impl Workload {
    pub fn build(&self) -> Vec<Request> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let prefixes: Vec<Vec<u32>> = (0..self.prefixes.max(1))
            .map(|_| (0..self.prefix_len).map(|_| rng.gen_range(0..self.vocab_size)).collect())
            .collect();
        (0..self.requests)
            .map(|i| {
                let mut tokens = prefixes[rng.gen_range(0..prefixes.len())].clone();
                tokens.extend((0..self.suffix_len).map(|_| rng.gen_range(0..self.vocab_size)));
                Request::new(format!("req-{i}"), 0, tokens, SamplingParams::with_max_tokens(self.max_tokens))
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SimReport {
    pub submitted: usize,
    pub finished: usize,
    pub rejected: usize,
    pub generated_tokens: usize,
    pub elapsed: Duration,
    pub stats: EngineStats,
}

impl SimReport {
    pub fn tokens_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.generated_tokens as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Default)]
struct Tally {
    finished: usize,
    rejected: usize,
    generated_tokens: usize,
}

impl Tally {
    fn add(&mut self, outputs: &EngineCoreOutputs) {
        for out in &outputs.outputs {
            self.generated_tokens += out.new_token_ids.len();
        }
        self.finished += outputs.finished_requests.len();
    }

    fn report(self, submitted: usize, elapsed: Duration, stats: EngineStats) -> SimReport {
        SimReport {
            submitted,
            finished: self.finished,
            rejected: self.rejected,
            generated_tokens: self.generated_tokens,
            elapsed,
            stats,
        }
    }
}

/// Drive the engine by calling `step` (or the pipelined variant) until every
/// request has finished.
pub fn run_stepped<E: Executor>(core: &EngineCore<E>, requests: Vec<Request>, pipelined: bool) -> anyhow::Result<SimReport> {
    let start = Instant::now();
    let submitted = requests.len();
    let mut tally = Tally::default();
    for req in requests {
        let id = req.request_id.clone();
        if let Err(e) = core.add_request(req) {
            tracing::warn!(request_id = %id, error = %e, "request rejected");
            tally.rejected += 1;
        }
    }

    let mut idle = 0;
    while core.has_pending_work() {
        let res = if pipelined { core.step_with_batch_queue()? } else { core.step()? };
        if res.executed || !res.outputs.is_empty() {
            idle = 0;
        } else {
            idle += 1;
            if idle > MAX_IDLE_STEPS {
                bail!("engine stalled with {} requests waiting", core.get_stats().waiting_requests);
            }
        }
        for out in res.outputs.values() {
            tally.add(out);
        }
    }
    Ok(tally.report(submitted, start.elapsed(), core.get_stats()))
}

/// Same workload through the async request queue.
pub async fn run_queued<E: Executor + 'static>(
    core: Arc<EngineCore<E>>,
    requests: Vec<Request>,
    pipelined: bool,
) -> anyhow::Result<SimReport> {
    let start = Instant::now();
    let submitted = requests.len();
    let opts = EngineProcOptions { pipelined, ..EngineProcOptions::default() };
    let (handle, mut rx, task) = EngineCoreProc::start(core, opts);
    for req in requests {
        handle.add_request(req).await?;
    }

    let mut tally = Tally::default();
    while tally.finished + tally.rejected < submitted {
        let msg = tokio::time::timeout(OUTPUT_TIMEOUT, rx.recv())
            .await
            .context("no engine output before timeout")?
            .context("engine output channel closed")?;
        match msg {
            EngineCoreOutputMessage::Outputs { outputs, .. } => tally.add(&outputs),
            EngineCoreOutputMessage::AddFailed { request_id, error } => {
                tracing::warn!(%request_id, %error, "request rejected");
                tally.rejected += 1;
            }
            EngineCoreOutputMessage::StepFailed { error } => bail!("engine step failed: {error}"),
        }
    }

    let stats = handle.get_stats().await?;
    handle.shutdown().await?;
    task.await.context("engine task panicked")?;
    Ok(tally.report(submitted, start.elapsed(), stats))
}

/// Route `requests` over `workers` simulated backends with power-of-two
/// choices. Each backend completes an outstanding request per tick with a
/// probability equal to its speed, and fails with `failure_rate`.
pub fn run_balancer(
    cfg: LoadBalancerConfig,
    workers: usize,
    requests: usize,
    failure_rate: f64,
    seed: u64,
) -> anyhow::Result<Vec<WorkerState>> {
    if !(0.0..=1.0).contains(&failure_rate) {
        bail!("failure rate {failure_rate} is outside [0, 1]");
    }
    let lb = P2cLoadBalancer::new(cfg)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let speeds: Vec<(String, f64)> = (0..workers).map(|i| (format!("worker-{i}"), rng.gen_range(0.2..1.0))).collect();
    for (id, _) in &speeds {
        lb.add_worker(id.clone(), None);
    }

    for _ in 0..requests {
        let id = lb.select_worker()?;
        lb.update_worker(&id, 1, None);
        for (id, speed) in &speeds {
            let pending = lb.worker(id).map_or(0, |w| w.pending);
            if pending == 0 || !rng.gen_bool(*speed) {
                continue;
            }
            if rng.gen_bool(failure_rate) {
                lb.record_failure(id);
            } else {
                // queueing delay grows with backlog, service time with slowness
                lb.record_success(id, (pending as f64 + 1.0) * 10.0 / speed);
            }
        }
    }
    Ok(lb.snapshot())
}
