//! Prometheus metrics for the engine core.
//!
//! Each `EngineMetrics` owns its registry, so several engines in one process
//! do not collide. Values are refreshed from `EngineStats` snapshots.

use engine_common::{EngineError, Result};
use engine_core::{EngineHandle, EngineStats};
use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::atomic::Ordering;

pub struct EngineMetrics {
    registry: Registry,
    waiting_requests: IntGauge,
    running_requests: IntGauge,
    total_steps: IntGauge,
    total_requests: IntGauge,
    queue_depth: IntGauge,
    batch_size: IntGauge,
    kv_usage: Gauge,
    blocks: IntGaugeVec,
    block_hit_rate: Gauge,
    block_evictions: IntGauge,
    block_fragmentation: Gauge,
    prefix_entries: IntGaugeVec,
    prefix_hit_rate: Gauge,
    prefix_evictions: IntGauge,
    prefix_rejected: IntGauge,
}

impl EngineMetrics {
    /// Metrics named `<namespace>_*`.
    pub fn new(namespace: &str) -> Result<Self> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| Opts::new(name, help).namespace(namespace.to_string());

        let m = Self {
            waiting_requests: IntGauge::with_opts(opts("waiting_requests", "Requests waiting for admission")).map_err(prom)?,
            running_requests: IntGauge::with_opts(opts("running_requests", "Requests in the running set")).map_err(prom)?,
            total_steps: IntGauge::with_opts(opts("total_steps", "Engine steps that ran the executor")).map_err(prom)?,
            total_requests: IntGauge::with_opts(opts("total_requests", "Requests accepted")).map_err(prom)?,
            queue_depth: IntGauge::with_opts(opts("queue_depth", "Scheduler queue depth")).map_err(prom)?,
            batch_size: IntGauge::with_opts(opts("batch_size", "Last batch size")).map_err(prom)?,
            kv_usage: Gauge::with_opts(opts("kv_usage_ratio", "Fraction of KV blocks holding live content")).map_err(prom)?,
            blocks: IntGaugeVec::new(opts("kv_blocks", "KV blocks by state"), &["state"]).map_err(prom)?,
            block_hit_rate: Gauge::with_opts(opts("kv_block_hit_rate", "Block hash lookup hit rate")).map_err(prom)?,
            block_evictions: IntGauge::with_opts(opts("kv_block_evictions", "Blocks evicted")).map_err(prom)?,
            block_fragmentation: Gauge::with_opts(opts("kv_block_fragmentation", "Share of free blocks outside the longest free run"))
                .map_err(prom)?,
            prefix_entries: IntGaugeVec::new(opts("prefix_cache_entries", "Prefix cache entries by tier"), &["tier"]).map_err(prom)?,
            prefix_hit_rate: Gauge::with_opts(opts("prefix_cache_hit_rate", "Prefix cache hit rate")).map_err(prom)?,
            prefix_evictions: IntGauge::with_opts(opts("prefix_cache_evictions", "Prefix cache entries evicted")).map_err(prom)?,
            prefix_rejected: IntGauge::with_opts(opts("prefix_cache_rejected_inserts", "Inserts refused by a full cache"))
                .map_err(prom)?,
            registry,
        };

        let collectors: Vec<Box<dyn Collector>> = vec![
            Box::new(m.waiting_requests.clone()),
            Box::new(m.running_requests.clone()),
            Box::new(m.total_steps.clone()),
            Box::new(m.total_requests.clone()),
            Box::new(m.queue_depth.clone()),
            Box::new(m.batch_size.clone()),
            Box::new(m.kv_usage.clone()),
            Box::new(m.blocks.clone()),
            Box::new(m.block_hit_rate.clone()),
            Box::new(m.block_evictions.clone()),
            Box::new(m.block_fragmentation.clone()),
            Box::new(m.prefix_entries.clone()),
            Box::new(m.prefix_hit_rate.clone()),
            Box::new(m.prefix_evictions.clone()),
            Box::new(m.prefix_rejected.clone()),
        ];
        for c in collectors {
            m.registry.register(c).map_err(prom)?;
        }
        tracing::debug!(target: "obs", namespace, "engine metrics registered");
        Ok(m)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn observe(&self, stats: &EngineStats) {
        self.waiting_requests.set(stats.waiting_requests as i64);
        self.running_requests.set(stats.running_requests as i64);
        self.total_steps.set(stats.total_steps as i64);
        self.total_requests.set(stats.total_requests as i64);
        self.kv_usage.set(stats.kv_usage);

        let pool = &stats.block_pool;
        self.blocks.with_label_values(&["free"]).set(pool.current_free as i64);
        self.blocks.with_label_values(&["allocated"]).set(pool.current_allocated as i64);
        self.blocks.with_label_values(&["cached"]).set(pool.current_cached as i64);
        self.blocks.with_label_values(&["pinned"]).set(pool.current_pinned as i64);
        self.block_hit_rate.set(pool.hit_rate);
        self.block_evictions.set(pool.evictions as i64);
        self.block_fragmentation.set(pool.fragmentation);

        let prefix = &stats.prefix_cache;
        self.prefix_entries.with_label_values(&["hot"]).set(prefix.hot as i64);
        self.prefix_entries.with_label_values(&["warm"]).set(prefix.warm as i64);
        self.prefix_entries.with_label_values(&["cold"]).set(prefix.cold as i64);
        self.prefix_hit_rate.set(prefix.hit_rate);
        self.prefix_evictions.set(prefix.evictions as i64);
        self.prefix_rejected.set(prefix.rejected_inserts as i64);
    }

    /// Queue depth and batch size published by a running engine queue.
    pub fn observe_handle(&self, handle: &EngineHandle) {
        self.queue_depth.set(handle.queue_depth.load(Ordering::Relaxed) as i64);
        self.batch_size.set(handle.last_batch_size.load(Ordering::Relaxed) as i64);
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf).map_err(prom)?;
        String::from_utf8(buf).map_err(|e| EngineError::Message(e.to_string()))
    }
}

fn prom(e: prometheus::Error) -> EngineError {
    EngineError::Message(format!("metrics: {e}"))
}
