use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use numadp_config::NumaDpConfig;
use numadp_core::prelude::*;
use numadp_telemetry::{init_logging, MetricsRecorder};

#[derive(Parser)]
#[command(name = "numadp", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the detected NUMA topology as YAML
    Probe(ProbeArgs),
    /// Initialize the pool system and exercise it with bound workers
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Use a simulated topology with this many nodes instead of the host
    #[arg(long)]
    pub simulate_nodes: Option<u32>,
    /// Memory per simulated node in bytes
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    pub simulate_node_bytes: u64,
}

impl SimulateArgs {
    fn platform(&self) -> Arc<dyn NumaPlatform> {
        match self.simulate_nodes {
            Some(nodes) => Arc::new(
                SimulatedPlatform::builder()
                    .nodes(nodes)
                    .node_memory(self.simulate_node_bytes)
                    .build(),
            ),
            None => host_platform(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub simulate: SimulateArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Configuration file; defaults to config/numadp.yaml and NUMADP_* variables
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    #[command(flatten)]
    pub simulate: SimulateArgs,
    /// Allocate/free iterations per worker
    #[arg(long, default_value_t = 10_000)]
    pub rounds: usize,
    /// Size class the workers allocate from
    #[arg(long, default_value_t = SizeClass::Small)]
    pub class: SizeClass,
}

/// Outcome of one worker run across all nodes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub workers: usize,
    pub allocations: u64,
    pub exhausted: u64,
    pub unbound: usize,
}

#[derive(Serialize)]
struct RunSummary<'a> {
    nodes: usize,
    pool_size: usize,
    workers: &'a WorkerReport,
    stats: StatsSnapshot,
    pools: Vec<PoolUsage>,
}

pub fn probe(args: ProbeArgs) -> anyhow::Result<()> {
    init_logging("warn");
    let platform = args.simulate.platform();
    let report = numadp_core::topology::probe(platform.as_ref())?;
    print!("{}", serde_yaml::to_string(&report)?);
    Ok(())
}

pub fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => NumaDpConfig::load_from_path(path),
        None => NumaDpConfig::load(),
    }
    .context("failed to load configuration")?;
    init_logging(&config.telemetry.log_filter);

    let platform = args.simulate.platform();
    let system = PoolSystem::init(platform, config.pool_system_config())
        .context("failed to initialize pool system")?;
    let allocator = FixedBlockAllocator::new(Arc::new(system));

    let counts = config.blocks.carve_counts();
    for node in allocator.system().nodes() {
        allocator
            .carve_counts(node, &counts)
            .with_context(|| format!("failed to carve blocks on node {node}"))?;
    }

    let report = run_workers(&allocator, config.workers.per_node, args.rounds, args.class);
    let system = allocator.system();
    let summary = RunSummary {
        nodes: system.num_nodes(),
        pool_size: system.pool_size(),
        workers: &report,
        stats: system.stats().snapshot(),
        pools: system.usage_all(),
    };
    print!("{}", serde_yaml::to_string(&summary)?);

    if config.telemetry.metrics {
        let metrics = MetricsRecorder::new()?;
        metrics.observe(&allocator);
        print!("{}", metrics.gather_metrics()?);
    }

    let released = system.destroy();
    info!(released, "run complete");
    Ok(())
}

/// Spawns `per_node` workers on every node. Each binds itself to its node and
/// repeatedly allocates and frees one block of `class`.
pub fn run_workers(
    allocator: &FixedBlockAllocator,
    per_node: usize,
    rounds: usize,
    class: SizeClass,
) -> WorkerReport {
    let nodes = allocator.system().nodes();

    thread::scope(|s| {
        let handles: Vec<_> = nodes
            .iter()
            .flat_map(|&node| (0..per_node).map(move |worker| (node, worker)))
            .map(|(node, worker)| {
                thread::Builder::new()
                    .name(format!("numadp-worker-{node}-{worker}"))
                    .spawn_scoped(s, move || worker_loop(allocator, node, rounds, class))
            })
            .collect();

        handles
            .into_iter()
            .fold(WorkerReport::default(), |mut total, handle| {
                match handle.map(|h| h.join()) {
                    Ok(Ok(report)) => {
                        total.workers += 1;
                        total.allocations += report.allocations;
                        total.exhausted += report.exhausted;
                        total.unbound += report.unbound;
                    }
                    Ok(Err(_)) => warn!("worker panicked"),
                    Err(e) => warn!(error = %e, "failed to spawn worker"),
                }
                total
            })
    })
}

fn worker_loop(
    allocator: &FixedBlockAllocator,
    node: NodeId,
    rounds: usize,
    class: SizeClass,
) -> WorkerReport {
    let mut report = WorkerReport::default();
    if let Err(e) = allocator.system().bind_worker_to_node(node) {
        warn!(node = %node, error = %e, "worker running without node affinity");
        report.unbound = 1;
    }

    for _ in 0..rounds {
        match allocator.allocate(node, class) {
            Ok(ptr) => {
                report.allocations += 1;
                // SAFETY: the block is active and owned by this worker until freed.
                unsafe { ptr.as_ptr().write_bytes(0x5A, class.size().min(64)) };
                if let Err(e) = allocator.free(ptr) {
                    warn!(node = %node, error = %e, "free rejected");
                }
            }
            Err(_) => report.exhausted += 1,
        }
    }
    report
}
