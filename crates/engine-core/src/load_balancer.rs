//! Power-of-two-choices worker selection.
//!
//! Each decision samples `sample_size` workers uniformly from the healthy
//! and degraded pool (the whole pool when none are) and picks the one with
//! the fewest pending requests, then the lowest average latency.

use std::collections::BTreeMap;

use engine_common::config::LoadBalancerConfig;
use engine_common::{EngineError, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Weight of the running average when folding in a latency sample.
const LATENCY_DECAY: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerHealth {
    Healthy,
    Degraded,
    Recovering,
    Failed,
}

impl WorkerHealth {
    fn selectable(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: String,
    pub health: WorkerHealth,
    pub pending: u64,
    pub avg_latency_ms: f64,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub locality_group: Option<String>,
}

impl WorkerState {
    fn new(id: String, locality_group: Option<String>) -> Self {
        Self {
            id,
            health: WorkerHealth::Healthy,
            pending: 0,
            avg_latency_ms: 0.0,
            consecutive_failures: 0,
            total_requests: 0,
            locality_group,
        }
    }
}

#[derive(Debug)]
pub struct P2cLoadBalancer {
    cfg: LoadBalancerConfig,
    workers: Mutex<BTreeMap<String, WorkerState>>,
    rng: Mutex<StdRng>,
}

impl P2cLoadBalancer {
    pub fn new(cfg: LoadBalancerConfig) -> Result<Self> {
        cfg.validate()?;
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { cfg, workers: Mutex::new(BTreeMap::new()), rng: Mutex::new(rng) })
    }

    pub fn add_worker(&self, id: impl Into<String>, locality_group: Option<&str>) {
        let id = id.into();
        tracing::debug!(target: "load_balancer", worker = %id, group = ?locality_group, "worker added");
        self.workers
            .lock()
            .insert(id.clone(), WorkerState::new(id, locality_group.map(str::to_string)));
    }

    pub fn remove_worker(&self, id: &str) -> bool {
        self.workers.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn select_worker(&self) -> Result<String> {
        let workers = self.workers.lock();
        let all: Vec<&WorkerState> = workers.values().collect();
        self.pick(&all)
    }

    /// Prefer workers in `group`; fall back to every worker when the group
    /// has no selectable member.
    pub fn select_worker_in_group(&self, group: &str) -> Result<String> {
        let workers = self.workers.lock();
        let local: Vec<&WorkerState> = workers
            .values()
            .filter(|w| w.locality_group.as_deref() == Some(group) && w.health.selectable())
            .collect();
        if !local.is_empty() {
            return self.pick(&local);
        }
        let all: Vec<&WorkerState> = workers.values().collect();
        self.pick(&all)
    }

    fn pick(&self, pool: &[&WorkerState]) -> Result<String> {
        let healthy: Vec<&WorkerState> = pool.iter().copied().filter(|w| w.health.selectable()).collect();
        let candidates = if healthy.is_empty() { pool.to_vec() } else { healthy };
        if candidates.is_empty() {
            return Err(EngineError::NoWorkers);
        }
        let k = self.cfg.sample_size.min(candidates.len());
        let mut rng = self.rng.lock();
        let best = candidates
            .choose_multiple(&mut *rng, k)
            .min_by(|a, b| a.pending.cmp(&b.pending).then(a.avg_latency_ms.total_cmp(&b.avg_latency_ms)))
            .ok_or(EngineError::NoWorkers)?;
        tracing::trace!(target: "load_balancer", worker = %best.id, pending = best.pending, "worker selected");
        Ok(best.id.clone())
    }

    /// Adjust pending (clamped at zero) and fold in a latency sample.
    pub fn update_worker(&self, id: &str, pending_delta: i64, latency_ms: Option<f64>) -> bool {
        let mut workers = self.workers.lock();
        let Some(w) = workers.get_mut(id) else {
            tracing::debug!(target: "load_balancer", worker = %id, "update for unknown worker ignored");
            return false;
        };
        w.pending = w.pending.saturating_add_signed(pending_delta);
        if pending_delta > 0 {
            w.total_requests += pending_delta as u64;
        }
        if let Some(sample) = latency_ms {
            w.avg_latency_ms = LATENCY_DECAY * w.avg_latency_ms + (1.0 - LATENCY_DECAY) * sample;
        }
        true
    }

    /// A completed request: resets the failure streak and promotes
    /// RECOVERING / DEGRADED workers to HEALTHY. A FAILED worker moves to
    /// RECOVERING.
    pub fn record_success(&self, id: &str, latency_ms: f64) -> bool {
        if !self.update_worker(id, -1, Some(latency_ms)) {
            return false;
        }
        let mut workers = self.workers.lock();
        let Some(w) = workers.get_mut(id) else { return false };
        w.consecutive_failures = 0;
        let next = match w.health {
            WorkerHealth::Failed => WorkerHealth::Recovering,
            _ => WorkerHealth::Healthy,
        };
        if next != w.health {
            tracing::info!(target: "load_balancer", worker = %id, from = ?w.health, to = ?next, "worker health changed");
            w.health = next;
        }
        true
    }

    /// A failed request: FAILED once the streak exceeds the threshold,
    /// DEGRADED before that.
    pub fn record_failure(&self, id: &str) -> bool {
        if !self.update_worker(id, -1, None) {
            return false;
        }
        let mut workers = self.workers.lock();
        let Some(w) = workers.get_mut(id) else { return false };
        w.consecutive_failures += 1;
        let next = if w.consecutive_failures > self.cfg.failure_threshold {
            WorkerHealth::Failed
        } else if w.health == WorkerHealth::Healthy {
            WorkerHealth::Degraded
        } else {
            w.health
        };
        if next != w.health {
            tracing::warn!(target: "load_balancer", worker = %id, failures = w.consecutive_failures, to = ?next, "worker health changed");
            w.health = next;
        }
        true
    }

    pub fn set_health(&self, id: &str, health: WorkerHealth) -> bool {
        match self.workers.lock().get_mut(id) {
            Some(w) => {
                w.health = health;
                true
            }
            None => false,
        }
    }

    pub fn worker(&self, id: &str) -> Option<WorkerState> {
        self.workers.lock().get(id).cloned()
    }

    /// Workers ordered by id.
    pub fn snapshot(&self) -> Vec<WorkerState> {
        self.workers.lock().values().cloned().collect()
    }
}
