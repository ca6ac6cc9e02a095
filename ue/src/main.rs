//! Sidelink UE Main Application
//!
//! Runs a group of sidelink (V2X mode 4) nodes over an in-process loopback
//! air channel and reports what each of them sent and received.

mod config;
mod sim;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use config::SidelinkConfig;
use layers::phy::SnrAverage;

/// Sidelink UE loopback simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Number of simulated nodes
    #[arg(long)]
    nodes: Option<usize>,

    /// Subframes to simulate
    #[arg(long)]
    ticks: Option<u64>,

    /// Channel noise standard deviation
    #[arg(long)]
    noise: Option<f32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SidelinkConfig::from_file(path)?,
        None => SidelinkConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }
    if let Some(nodes) = args.nodes {
        config.simulation.nodes = nodes;
    }
    if let Some(ticks) = args.ticks {
        config.simulation.ticks = ticks;
    }
    if let Some(noise) = args.noise {
        config.simulation.noise_std = noise;
    }

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting sidelink UE simulation");
    if let Some(path) = &args.config {
        info!("Configuration file: {}", path);
    }
    config.validate()?;

    info!("Simulation configuration:");
    info!("  Bandwidth: {} MHz", config.carrier.bandwidth_mhz);
    info!(
        "  Pool: {} subchannels x {} PRB",
        config.resource_pool.num_subchannels, config.resource_pool.subchannel_size
    );
    info!("  Nodes: {} of group {}", config.simulation.nodes, config.tx.node_count);
    info!("  Ticks: {}", config.simulation.ticks);
    info!(
        "  Traffic: {} SDUs of {} bytes per node",
        config.simulation.traffic.sdus_per_node, config.simulation.traffic.sdu_size
    );

    let reports = tokio::select! {
        result = sim::run_simulation(&config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            return Ok(());
        }
    };

    let reports = match reports {
        Ok(reports) => reports,
        Err(e) => {
            error!("Simulation failed: {}", e);
            return Err(e);
        }
    };

    for report in &reports {
        info!("Node {} statistics:", report.node);
        info!("  Ticks: {}", report.ticks);
        info!("  SDUs sent: {}, received: {} ({} bytes)", report.sdus_sent, report.sdus_received, report.bytes_received);
        info!(
            "  PHY tx: {} new, {} repetitions, {} errors",
            report.phy.worker.tx_new, report.phy.worker.tx_retx, report.phy.worker.tx_errors
        );
        info!(
            "  PHY rx: {} SCI, {} ok, {} ko, {} duplicates",
            report.phy.scan.sci_found, report.phy.worker.rx_ok, report.phy.worker.rx_ko, report.phy.worker.rx_duplicates
        );
        info!(
            "  Sync: {} sent, {} MIB ok, {} ko, {} off timing, PSBCH SNR {}",
            report.phy.worker.sync_tx,
            report.phy.worker.mib_ok,
            report.phy.worker.mib_ko,
            report.phy.worker.mib_mismatch,
            snr_text(&report.phy.link.psbch)
        );
        for (source, avg) in report.phy.link.pssch.iter().enumerate().filter(|(_, avg)| avg.samples > 0) {
            info!("  PSSCH SNR from node {}: {} ({} samples)", source, snr_text(avg), avg.samples);
        }
        info!("  HARQ average transmissions: {:.2}", report.mac.average_retx);
        info!("  RF: {} subframes sent, {} silent", report.rf.tx_subframes, report.rf.tx_silent);
    }

    info!("Sidelink UE simulation complete");
    Ok(())
}

fn snr_text(avg: &SnrAverage) -> String {
    avg.snr_db.map_or_else(|| "n/a".to_string(), |snr| format!("{:.1} dB", snr))
}
