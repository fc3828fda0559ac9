mod cli;
mod simulator;
mod sink;

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use raid5_rs::metrics::install_metrics_sink;

use crate::cli::{Cli, Command, LayoutArgs, SimulateArgs};
use crate::sink::{MetricsEmitter, run_aggregator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Simulate(args) => simulate(args).await,
        Command::Layout(args) => layout(&args),
    }
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (tx, rx) = mpsc::channel(args.metrics_queue_cap.max(1));
    let emitter = MetricsEmitter::new(tx);
    if !install_metrics_sink(emitter.clone()) {
        warn!("metrics sink already installed; summary will be empty");
    }
    let aggregator = tokio::spawn(run_aggregator(rx, shutdown_rx));

    let cancel = Arc::new(AtomicBool::new(false));
    let worker = {
        let cancel = Arc::clone(&cancel);
        tokio::task::spawn_blocking(move || simulator::run(&args, &cancel))
    };
    tokio::pin!(worker);

    let result = tokio::select! {
        joined = &mut worker => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown: ctrl-c");
            cancel.store(true, Ordering::Relaxed);
            worker.await
        },
    };

    let _ = shutdown_tx.send(true);
    let totals = aggregator.await?;

    let report = result??;
    info!(
        "exit: ops={} reads={} writes={} bytes_read={} bytes_written={} recovery_requests={}",
        report.ops,
        report.reads,
        report.writes,
        report.bytes_read,
        report.bytes_written,
        report.recovery_requests
    );
    info!(
        "cache: stripes={} hashed={} handled={} reconstruct_writes={} read_modify_writes={}",
        report.cache.nr_stripes,
        report.cache.hashed,
        report.cache.handled,
        report.cache.reconstruct_writes,
        report.cache.read_modify_writes
    );
    totals.log_summary();
    if emitter.dropped() > 0 {
        warn!("metrics: dropped_events={}", emitter.dropped());
    }
    for line in report.status.lines() {
        info!("{line}");
    }
    info!("volume sha256={}", report.digest);
    Ok(())
}

fn layout(args: &LayoutArgs) -> anyhow::Result<()> {
    let config = args.array.config();
    config.validate()?;
    let geometry = config.geometry();
    let rows = args.stripes.min(config.disk_size / config.chunk_size as u64);

    let mut out = String::new();
    let _ = write!(out, "{:>8}", "stripe");
    for slot in 0..geometry.raid_disks {
        let _ = write!(out, "{:>8}", format!("disk{slot}"));
    }
    out.push('\n');
    for row in 0..rows {
        let sector = row * geometry.sectors_per_chunk;
        let pd = geometry.parity_disk(sector);
        let _ = write!(out, "{row:>8}");
        for slot in 0..geometry.raid_disks {
            if slot == pd {
                let _ = write!(out, "{:>8}", "P");
            } else {
                let chunk = geometry.inverse_map(sector, slot, pd) / geometry.sectors_per_chunk;
                let _ = write!(out, "{:>8}", format!("D{chunk}"));
            }
        }
        out.push('\n');
    }
    println!("layout {}:\n{out}", config.layout.name());
    Ok(())
}
