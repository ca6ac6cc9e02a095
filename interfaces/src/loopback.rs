//! In-process loopback air channel
//!
//! Connects several simulated nodes in the frequency domain. Every node
//! reports exactly one (possibly silent) transmission per tick; a receiver
//! gets the superposition of all other nodes' subframes for that tick once
//! every node has reported, plus white noise. Nodes are half duplex: a node
//! transmitting in a tick receives only noise for it.

use crate::{InterfaceError, RfFrontend, RfStats, SubframeGrid};
use async_trait::async_trait;
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

/// Loopback channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirChannelConfig {
    /// Number of attached nodes
    #[serde(default = "default_nof_nodes")]
    pub nof_nodes: usize,
    /// Carrier width in resource blocks
    #[serde(default = "default_nof_prb")]
    pub nof_prb: usize,
    /// Per-dimension noise standard deviation
    #[serde(default)]
    pub noise_std: f32,
    /// Rotate every transmission by a random phase
    #[serde(default = "default_random_phase")]
    pub random_phase: bool,
    /// How long a receiver waits for the other nodes of a tick
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Noise/phase generator seed
    #[serde(default)]
    pub seed: u64,
}

fn default_nof_nodes() -> usize {
    2
}

fn default_nof_prb() -> usize {
    25
}

fn default_random_phase() -> bool {
    true
}

fn default_receive_timeout_ms() -> u64 {
    2000
}

impl Default for AirChannelConfig {
    fn default() -> Self {
        Self {
            nof_nodes: default_nof_nodes(),
            nof_prb: default_nof_prb(),
            noise_std: 0.0,
            random_phase: default_random_phase(),
            receive_timeout_ms: default_receive_timeout_ms(),
            seed: 0,
        }
    }
}

/// Transmissions reported for one tick
#[derive(Default)]
struct AirSlot {
    transmissions: Vec<(usize, Option<SubframeGrid>)>,
    deliveries: usize,
}

struct AirState {
    slots: BTreeMap<u64, AirSlot>,
    rng: StdRng,
}

/// Shared medium between loopback nodes
pub struct AirChannel {
    config: AirChannelConfig,
    state: Mutex<AirState>,
    notify: Notify,
}

impl AirChannel {
    pub fn new(config: AirChannelConfig) -> Result<Arc<Self>, InterfaceError> {
        if config.nof_nodes == 0 {
            return Err(InterfaceError::InvalidConfig("loopback needs at least one node".into()));
        }
        if config.nof_prb == 0 {
            return Err(InterfaceError::InvalidConfig("carrier without resource blocks".into()));
        }

        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Arc::new(Self {
            config,
            state: Mutex::new(AirState { slots: BTreeMap::new(), rng }),
            notify: Notify::new(),
        }))
    }

    /// Attach a node; node ids must be unique and below `nof_nodes`
    pub fn attach(self: &Arc<Self>, node: usize) -> Result<LoopbackRf, InterfaceError> {
        if node >= self.config.nof_nodes {
            return Err(InterfaceError::InvalidConfig(format!(
                "node {} out of range for {} nodes",
                node, self.config.nof_nodes
            )));
        }

        Ok(LoopbackRf {
            air: Arc::clone(self),
            node,
            next_rx: AtomicU64::new(0),
            stats: Mutex::new(RfStats::default()),
        })
    }

    async fn put(&self, node: usize, tick: u64, grid: Option<SubframeGrid>) -> Result<(), InterfaceError> {
        {
            let mut state = self.state.lock().await;
            let slot = state.slots.entry(tick).or_default();
            if slot.transmissions.iter().any(|(n, _)| *n == node) {
                return Err(InterfaceError::DuplicateTransmission { node, tick });
            }
            slot.transmissions.push((node, grid));
            trace!("Node {} reported tick {} ({} of {})", node, tick, slot.transmissions.len(), self.config.nof_nodes);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Build the received subframe for `node` if every node has reported `tick`
    async fn try_collect(&self, node: usize, tick: u64) -> Option<SubframeGrid> {
        let mut state = self.state.lock().await;
        let AirState { slots, rng } = &mut *state;

        let slot = slots.get_mut(&tick)?;
        if slot.transmissions.len() < self.config.nof_nodes {
            return None;
        }

        let mut rx = SubframeGrid::new(self.config.nof_prb, tick);
        let self_tx = slot.transmissions.iter().any(|(n, g)| *n == node && g.is_some());
        if !self_tx {
            for (from, grid) in slot.transmissions.iter() {
                if *from == node {
                    continue;
                }
                if let Some(grid) = grid {
                    if self.config.random_phase {
                        let phase: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
                        let mut rotated = grid.clone();
                        rotated.apply_gain(Complex32::from_polar(1.0, phase));
                        rx.accumulate(&rotated);
                    } else {
                        rx.accumulate(grid);
                    }
                }
            }
        }
        rx.add_noise(rng, self.config.noise_std);

        slot.deliveries += 1;
        if slot.deliveries >= self.config.nof_nodes {
            slots.remove(&tick);
        }

        Some(rx)
    }

    async fn take(&self, node: usize, tick: u64) -> Result<SubframeGrid, InterfaceError> {
        let timeout = Duration::from_millis(self.config.receive_timeout_ms);
        loop {
            // Register interest before checking so a concurrent report is not missed
            let notified = self.notify.notified();
            if let Some(grid) = self.try_collect(node, tick).await {
                return Ok(grid);
            }
            if tokio::time::timeout(timeout, notified).await.is_err() {
                warn!("Node {} timed out waiting for tick {}", node, tick);
                return Err(InterfaceError::Timeout(tick));
            }
        }
    }
}

/// One node's view of the loopback air channel
pub struct LoopbackRf {
    air: Arc<AirChannel>,
    node: usize,
    next_rx: AtomicU64,
    stats: Mutex<RfStats>,
}

impl LoopbackRf {
    pub fn node(&self) -> usize {
        self.node
    }
}

#[async_trait]
impl RfFrontend for LoopbackRf {
    async fn receive(&self) -> Result<SubframeGrid, InterfaceError> {
        let tick = self.next_rx.fetch_add(1, Ordering::SeqCst);
        let result = self.air.take(self.node, tick).await;

        let mut stats = self.stats.lock().await;
        match &result {
            Ok(_) => stats.rx_subframes += 1,
            Err(_) => stats.rx_timeouts += 1,
        }
        result
    }

    async fn transmit(&self, tick: u64, grid: Option<SubframeGrid>) -> Result<(), InterfaceError> {
        if let Some(g) = &grid {
            if g.nof_prb() != self.air.config.nof_prb {
                return Err(InterfaceError::InvalidMessage);
            }
            debug!("Node {} transmitting at tick {}", self.node, tick);
        }

        {
            let mut stats = self.stats.lock().await;
            if grid.is_some() {
                stats.tx_subframes += 1;
            } else {
                stats.tx_silent += 1;
            }
        }

        self.air.put(self.node, tick, grid).await
    }

    fn nof_prb(&self) -> usize {
        self.air.config.nof_prb
    }

    async fn stats(&self) -> RfStats {
        self.stats.lock().await.clone()
    }
}
