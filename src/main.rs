//! Lookup simulator.
//!
//! Builds an overlay of simulated nodes, runs a batch of lookups for random
//! keys and prints a JSON report comparing the results with the true
//! siblings of each key.
//!
//! # Usage
//!
//! ```bash
//! kbr-sim --nodes 256 --lookups 200 --routing iterative --metric xor
//! RUST_LOG=overlay_kbr=debug kbr-sim --nodes 32 --lookups 1 --loss 0.1
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use overlay_kbr::{
    KeyMetric, LinkModel, LookupOutcome, OverlayConfig, OverlayKey, RingMetric, RoutingMode,
    SimStats, Simulator, XorMetric,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Metric {
    Xor,
    Ring,
}

#[derive(Parser, Debug)]
#[command(name = "kbr-sim")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "128")]
    nodes: usize,

    #[arg(short, long, default_value = "100")]
    lookups: usize,

    #[arg(short, long, default_value = "1")]
    seed: u64,

    /// iterative, exhaustive-iterative, semi-recursive, full-recursive,
    /// recursive-source or direct. Defaults to the configured mode.
    #[arg(short, long, value_parser = parse_routing)]
    routing: Option<RoutingMode>,

    #[arg(short, long, value_enum, default_value = "xor")]
    metric: Metric,

    #[arg(long, default_value = "4")]
    num_siblings: usize,

    /// Neighbours each node learns at start; 0 teaches everyone everything.
    #[arg(long, default_value = "0")]
    neighbours: usize,

    /// Per-message loss probability.
    #[arg(long, default_value = "0.0")]
    loss: f64,

    /// Fraction of nodes that fail before the lookups start.
    #[arg(long, default_value = "0.0")]
    fail_fraction: f64,

    /// JSON file with an `OverlayConfig`.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn parse_routing(value: &str) -> Result<RoutingMode, String> {
    serde_json::from_value(serde_json::Value::String(value.to_owned()))
        .map_err(|_| format!("unknown routing mode {value:?}"))
}

#[derive(Debug, Serialize)]
struct Report {
    metric: &'static str,
    routing: RoutingMode,
    nodes: usize,
    failed_nodes: usize,
    lookups: usize,
    valid: usize,
    success_rate: f64,
    mean_hops: f64,
    /// Mean share of the true siblings found by valid lookups.
    mean_sibling_overlap: f64,
    stats: SimStats,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<OverlayConfig>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => OverlayConfig::default(),
    };
    if let Some(routing) = args.routing {
        config.routing = routing;
    }
    config.validate().context("invalid overlay configuration")?;

    let report = match args.metric {
        Metric::Xor => run::<XorMetric>(&args, config)?,
        Metric::Ring => run::<RingMetric>(&args, config)?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run<M: KeyMetric>(args: &Args, config: OverlayConfig) -> Result<Report> {
    anyhow::ensure!(args.nodes > 0, "--nodes must be at least 1");
    anyhow::ensure!((0.0..=1.0).contains(&args.loss), "--loss must be within [0, 1]");

    let link = LinkModel {
        loss_rate: args.loss,
        ..LinkModel::default()
    };
    let routing = config.routing;
    let mut sim = Simulator::<M>::new(config, link, args.seed);
    sim.add_random_nodes(args.nodes);
    if args.neighbours == 0 {
        sim.connect_all();
    } else {
        sim.connect_random(args.neighbours);
    }

    let mut rng = StdRng::seed_from_u64(args.seed ^ 0x5eed);
    let to_fail = ((args.nodes as f64) * args.fail_fraction.clamp(0.0, 1.0)) as usize;
    let handles = sim.handles();
    for node in handles.iter().skip(1).take(to_fail) {
        sim.fail_node(&node.addr);
    }
    let alive = sim.alive_handles();
    info!(
        nodes = args.nodes,
        failed = to_fail,
        metric = M::default().name(),
        ?routing,
        "overlay ready"
    );

    let mut pending = Vec::with_capacity(args.lookups);
    for _ in 0..args.lookups {
        let from = alive[rng.gen_range(0..alive.len())];
        let mut key = [0u8; 32];
        rng.fill(&mut key);
        let key = OverlayKey::from_bytes(key);
        let rx = sim.lookup(&from.addr, key, args.num_siblings)?;
        pending.push((key, rx));
    }
    sim.run_until_idle();

    let mut valid = 0;
    let mut hops = 0u64;
    let mut overlap = 0.0;
    for (key, mut rx) in pending {
        let outcome: LookupOutcome = match rx.try_recv() {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(key = %key.short(), %err, "lookup never reported");
                continue;
            }
        };
        if !outcome.valid {
            continue;
        }
        valid += 1;
        hops += u64::from(outcome.hops);
        let truth = sim.true_siblings(&key, args.num_siblings.max(1));
        let found = outcome.siblings.iter().filter(|node| truth.contains(node)).count();
        overlap += found as f64 / truth.len().max(1) as f64;
    }

    let per_valid = |total: f64| if valid > 0 { total / valid as f64 } else { 0.0 };
    Ok(Report {
        metric: M::default().name(),
        routing,
        nodes: args.nodes,
        failed_nodes: to_fail,
        lookups: args.lookups,
        valid,
        success_rate: if args.lookups > 0 {
            valid as f64 / args.lookups as f64
        } else {
            0.0
        },
        mean_hops: per_valid(hops as f64),
        mean_sibling_overlap: per_valid(overlap),
        stats: sim.stats().clone(),
    })
}
