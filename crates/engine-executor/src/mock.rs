//! Deterministic in-process executor for tests, benches and the CLI.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use engine_common::{EngineError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{Executor, ModelOutput, SchedulerOutput, TokenId};

/// Samples pseudo-random tokens derived from (seed, request id, position), so
/// the same batch always produces the same output.
#[derive(Debug)]
pub struct MockExecutor {
    seed: u64,
    vocab_size: u32,
    tokens_per_step: usize,
    eos_token_id: Option<TokenId>,
    eos_after: Option<usize>,
    latency: Option<Duration>,
    calls: AtomicU64,
    fail_remaining: AtomicUsize,
    shut_down: AtomicBool,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MockExecutor {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            vocab_size: 32_000,
            tokens_per_step: 1,
            eos_token_id: None,
            eos_after: None,
            latency: None,
            calls: AtomicU64::new(0),
            fail_remaining: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Sampled ids are drawn from `0..vocab_size`.
    pub fn with_vocab_size(mut self, vocab_size: u32) -> Self {
        self.vocab_size = vocab_size.max(1);
        self
    }

    pub fn with_tokens_per_step(mut self, n: usize) -> Self {
        self.tokens_per_step = n.max(1);
        self
    }

    /// Emit `eos` as the `after`-th output token of every request.
    pub fn with_eos(mut self, eos: TokenId, after: usize) -> Self {
        self.eos_token_id = Some(eos);
        self.eos_after = Some(after.max(1));
        self
    }

    /// Sleep for `latency` inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `n` calls with an executor error.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn sample(&self, request_id: &str, position: usize) -> TokenId {
        // fnv-1a over the id keeps the stream stable across runs
        let id_hash = request_id
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
        let mut rng = StdRng::seed_from_u64(self.seed ^ id_hash ^ (position as u64).rotate_left(32));
        let tok = rng.gen_range(0..self.vocab_size);
        match self.eos_token_id {
            // never emit eos by accident
            Some(eos) if tok == eos => (tok + 1) % self.vocab_size,
            _ => tok,
        }
    }
}

impl Executor for MockExecutor {
    fn execute_model(&self, batch: &SchedulerOutput) -> Result<ModelOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.is_shut_down() {
            return Err(EngineError::Executor("executor is shut down".into()));
        }
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            tracing::debug!(target: "executor", step = batch.step_id, "injected failure");
            return Err(EngineError::Executor(format!("injected failure at step {}", batch.step_id)));
        }
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }

        let pairs = batch.scheduled.iter().map(|req| {
            if !req.completes_sequence() {
                // partial prefill chunk: nothing to sample yet
                return (req.request_id.clone(), Vec::new());
            }
            let first_out = req.num_tokens.saturating_sub(req.num_prompt_tokens);
            let tokens = (0..self.tokens_per_step)
                .map(|i| {
                    let out_idx = first_out + i;
                    match (self.eos_token_id, self.eos_after) {
                        (Some(eos), Some(after)) if out_idx + 1 >= after => eos,
                        _ => self.sample(&req.request_id, req.num_tokens + i),
                    }
                })
                .collect();
            (req.request_id.clone(), tokens)
        });
        Ok(ModelOutput::from_pairs(pairs))
    }

    fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::debug!(target: "executor", calls = self.calls(), "mock executor shut down");
        }
    }
}
