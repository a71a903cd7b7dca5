use std::time::Instant;

use engine_cli::{run_stepped, Workload};
use engine_common::config::{EngineConfig, EvictionPolicyKind};
use engine_core::EngineCore;
use engine_executor::mock::MockExecutor;

fn main() -> anyhow::Result<()> {
    let n: usize = std::env::var("N").ok().and_then(|v| v.parse().ok()).unwrap_or(256);
    let blocks: usize = std::env::var("BLOCKS").ok().and_then(|v| v.parse().ok()).unwrap_or(512);
    let workload = Workload { requests: n, prefixes: 8, prefix_len: 64, ..Workload::default() };

    for policy in [EvictionPolicyKind::Lru, EvictionPolicyKind::Arc] {
        for pipelined in [false, true] {
            let mut cfg = EngineConfig::default();
            cfg.cache.num_blocks = blocks;
            cfg.cache.eviction_policy = policy;
            let core = EngineCore::new(&cfg, MockExecutor::new(1))?;
            let start = Instant::now();
            let report = run_stepped(&core, workload.build(), pipelined)?;
            println!(
                "{policy:?} pipelined={pipelined}: {} requests, {} tokens in {:.2}s, block hit rate {:.2}, prefix hit rate {:.2}",
                report.finished,
                report.generated_tokens,
                start.elapsed().as_secs_f32(),
                report.stats.block_pool.hit_rate,
                report.stats.prefix_cache.hit_rate
            );
        }
    }
    Ok(())
}
