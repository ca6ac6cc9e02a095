//! Multi-node loopback simulation
//!
//! Every node runs a MAC and a PHY on its own port of a shared loopback air
//! channel. Traffic is queued before the start; received SDUs are counted per
//! node until its MAC goes away.

use crate::config::SidelinkConfig;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use interfaces::{AirChannel, AirChannelConfig, RfFrontend, RfStats};
use layers::mac::{ChannelDemux, DeliveredSdu, MacMetrics, SidelinkMac};
use layers::phy::{PhyStats, SlPhy};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What one node did during a simulation
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub node: usize,
    pub ticks: u64,
    pub sdus_sent: u64,
    pub sdus_received: u64,
    pub bytes_received: u64,
    pub phy: PhyStats,
    pub mac: MacMetrics,
    pub rf: RfStats,
}

struct Node {
    id: usize,
    phy: Arc<SlPhy>,
    mac: Arc<SidelinkMac>,
    rf: Arc<dyn RfFrontend>,
    sink: JoinHandle<(u64, u64)>,
}

/// Count delivered SDUs until the channel closes
fn spawn_sink(node: usize, mut rx: mpsc::Receiver<DeliveredSdu>) -> JoinHandle<(u64, u64)> {
    tokio::spawn(async move {
        let (mut sdus, mut bytes) = (0u64, 0u64);
        while let Some(sdu) = rx.recv().await {
            debug!(
                "Node {}: SDU of {} bytes from {:06x} on LCID {}",
                node,
                sdu.data.len(),
                sdu.src,
                sdu.lcid
            );
            sdus += 1;
            bytes += sdu.data.len() as u64;
        }
        (sdus, bytes)
    })
}

fn sdu_payload(node: usize, seq: u64, size: usize) -> Bytes {
    let mut data = vec![0u8; size];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (node as u64 * 31 + seq * 7 + i as u64) as u8;
    }
    Bytes::from(data)
}

/// Run every node for `simulation.ticks` subframes
pub async fn run_simulation(config: &SidelinkConfig) -> Result<Vec<NodeReport>> {
    config.validate()?;
    let sim = &config.simulation;
    let nof_prb = config.bandwidth()?.nof_prb();

    let air = AirChannel::new(AirChannelConfig {
        nof_nodes: sim.nodes,
        nof_prb,
        noise_std: sim.noise_std,
        random_phase: sim.random_phase,
        receive_timeout_ms: sim.receive_timeout_ms,
        seed: sim.seed,
    })?;

    let mut nodes = Vec::with_capacity(sim.nodes);
    for id in 0..sim.nodes {
        let (tx, rx) = mpsc::channel(1024);
        let mac = Arc::new(SidelinkMac::new(config.mac_config(id as u32), Arc::new(ChannelDemux::new(tx))));
        let phy = Arc::new(SlPhy::new(config.phy_config(id as u32), nof_prb, mac.clone())?);
        let rf: Arc<dyn RfFrontend> = Arc::new(air.attach(id)?);

        for seq in 0..sim.traffic.sdus_per_node {
            let sdu = sdu_payload(id, seq, sim.traffic.sdu_size);
            if let Err(e) = mac.write_sdu(Some(sim.traffic.lcid), sdu).await {
                warn!("Node {}: SDU {} not queued: {}", id, seq, e);
                break;
            }
        }

        nodes.push(Node { id, phy, mac, rf, sink: spawn_sink(id, rx) });
    }
    info!("{} nodes on {} PRB, {} ticks", sim.nodes, nof_prb, sim.ticks);

    let runs: Vec<_> = nodes
        .iter()
        .map(|node| tokio::spawn(Arc::clone(&node.phy).run(Arc::clone(&node.rf), Some(sim.ticks))))
        .collect();

    let mut ticks = Vec::with_capacity(runs.len());
    let mut failure = None;
    for (id, run) in runs.into_iter().enumerate() {
        match run.await {
            Ok(Ok(n)) => ticks.push(n),
            Ok(Err(e)) => {
                warn!("Node {} stopped: {}", id, e);
                failure.get_or_insert_with(|| anyhow!("node {}: {}", id, e));
                ticks.push(0);
            }
            Err(e) => return Err(anyhow!("node {} task failed: {}", id, e)),
        }
    }
    if let Some(e) = failure {
        for node in &nodes {
            node.phy.stop();
        }
        return Err(e);
    }

    let mut reports = Vec::with_capacity(nodes.len());
    for (node, ticks) in nodes.into_iter().zip(ticks) {
        let Node { id, phy, mac, rf, sink } = node;
        let phy_stats = phy.stats().await;
        let mac_metrics = mac.metrics().await;
        let rf_stats = rf.stats().await;

        // The sink ends once the last reference to the MAC is gone
        drop(phy);
        drop(mac);
        let (sdus_received, bytes_received) = sink.await.map_err(|e| anyhow!("node {} sink failed: {}", id, e))?;

        reports.push(NodeReport {
            node: id,
            ticks,
            sdus_sent: mac_metrics.tx_sdus,
            sdus_received,
            bytes_received,
            phy: phy_stats,
            mac: mac_metrics,
            rf: rf_stats,
        });
    }
    Ok(reports)
}
