use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use engine_cli::{run_balancer, run_queued, run_stepped, SimReport, Workload};
use engine_common::config::{EngineConfig, EvictionPolicyKind, MatcherKind};
use engine_core::EngineCore;
use engine_executor::mock::MockExecutor;
use engine_obs::EngineMetrics;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "engine", version, about = "Inference engine core simulator")]
struct Cli {
    /// YAML config file. Without it, ENGINE_CONFIG or defaults with ENGINE_* overrides apply
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a shared-prefix workload through the engine with a mock executor
    Simulate(SimulateArgs),
    /// Route a synthetic load over simulated workers with power-of-two choices
    Balance(BalanceArgs),
    /// Print the effective configuration as YAML
    Config,
    Version,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[arg(short = 'n', long, default_value_t = 64)]
    requests: usize,
    /// Distinct shared prompt prefixes
    #[arg(long, default_value_t = 4)]
    prefixes: usize,
    #[arg(long, default_value_t = 48)]
    prefix_len: u32,
    #[arg(long, default_value_t = 16)]
    suffix_len: u32,
    #[arg(short = 't', long, default_value_t = 32)]
    max_tokens: usize,
    #[arg(long)]
    eviction_policy: Option<EvictionPolicyKind>,
    #[arg(long)]
    matcher: Option<MatcherKind>,
    #[arg(long)]
    num_blocks: Option<usize>,
    /// Overlap execution with scheduling through the batch queue
    #[arg(long)]
    pipelined: bool,
    /// Submit through the async request queue instead of stepping directly
    #[arg(long = "async")]
    queued: bool,
    /// Also print Prometheus metrics
    #[arg(long)]
    metrics: bool,
    /// Print engine stats as JSON instead of the summary
    #[arg(long)]
    json: bool,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Args, Debug)]
struct BalanceArgs {
    #[arg(short, long, default_value_t = 8)]
    workers: usize,
    #[arg(short = 'n', long, default_value_t = 10_000)]
    requests: usize,
    #[arg(long, default_value_t = 0.01)]
    failure_rate: f64,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Simulate(args) => simulate(load_config(cli.config)?, args).await,
        Commands::Balance(args) => balance(load_config(cli.config)?, args),
        Commands::Config => {
            print!("{}", load_config(cli.config)?.to_yaml()?);
            Ok(())
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<EngineConfig> {
    let cfg = match path {
        Some(p) => EngineConfig::from_path(p)?,
        None => EngineConfig::load()?,
    };
    Ok(cfg)
}

async fn simulate(mut cfg: EngineConfig, args: SimulateArgs) -> anyhow::Result<()> {
    if let Some(policy) = args.eviction_policy {
        cfg.cache.eviction_policy = policy;
    }
    if let Some(matcher) = args.matcher {
        cfg.prefix_cache.matcher = matcher;
    }
    if let Some(n) = args.num_blocks {
        cfg.cache.num_blocks = n;
    }
    cfg.validate()?;

    let workload = Workload {
        requests: args.requests,
        prefixes: args.prefixes,
        prefix_len: args.prefix_len,
        suffix_len: args.suffix_len,
        max_tokens: args.max_tokens,
        seed: args.seed,
        ..Workload::default()
    };
    let core = Arc::new(EngineCore::new(&cfg, MockExecutor::new(args.seed))?);
    tracing::info!(
        requests = workload.requests,
        policy = ?cfg.cache.eviction_policy,
        matcher = ?cfg.prefix_cache.matcher,
        pipelined = args.pipelined,
        queued = args.queued,
        "starting simulation"
    );

    let report = if args.queued {
        run_queued(core.clone(), workload.build(), args.pipelined).await?
    } else {
        let core = core.clone();
        let requests = workload.build();
        tokio::task::spawn_blocking(move || {
            let report = run_stepped(&core, requests, args.pipelined);
            core.shutdown();
            report
        })
        .await??
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.stats)?);
    } else {
        print_report(&report);
    }

    if args.metrics {
        let metrics = EngineMetrics::new("engine")?;
        metrics.observe(&report.stats);
        print!("{}", metrics.render()?);
    }
    Ok(())
}

fn print_report(report: &SimReport) {
    println!(
        "requests: {} submitted, {} finished, {} rejected",
        report.submitted, report.finished, report.rejected
    );
    println!(
        "tokens: {} generated in {:.2}s ({:.0} tok/s), {} steps",
        report.generated_tokens,
        report.elapsed.as_secs_f64(),
        report.tokens_per_sec(),
        report.stats.total_steps
    );
    let pool = &report.stats.block_pool;
    println!(
        "kv blocks: hit rate {:.2}, {} evictions, usage {:.2}",
        pool.hit_rate, pool.evictions, report.stats.kv_usage
    );
    let prefix = &report.stats.prefix_cache;
    println!(
        "prefix cache: hit rate {:.2}, {} hot / {} warm / {} cold, {} evictions",
        prefix.hit_rate, prefix.hot, prefix.warm, prefix.cold, prefix.evictions
    );
}

fn balance(cfg: EngineConfig, args: BalanceArgs) -> anyhow::Result<()> {
    let workers = run_balancer(cfg.load_balancer, args.workers, args.requests, args.failure_rate, args.seed)?;
    println!("{:<12} {:>10} {:>8} {:>12}  health", "worker", "requests", "pending", "latency_ms");
    for w in workers {
        println!(
            "{:<12} {:>10} {:>8} {:>12.1}  {:?}",
            w.id, w.total_requests, w.pending, w.avg_latency_ms, w.health
        );
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
