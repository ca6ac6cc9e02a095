//! Physical Layer (PHY) Submodules
//!
//! This module contains the LTE V2X sidelink physical layer (transmission
//! mode 4) according to 3GPP TS 36.211/36.212/36.213: resource pool timing,
//! SCI format 1, PSCCH/PSSCH processing, two-generation soft combining,
//! autonomous transmit scheduling and the sync subframe with its MIB-SL.

pub mod resource_pool;
pub mod mcs;
pub mod sequence;
pub mod resource_grid;
pub mod softbuffer;
pub mod primitives;
pub mod chest;
pub mod modem;
pub mod coding;
pub mod sci;
pub mod pscch;
pub mod scanner;
pub mod pssch;
pub mod psbch;
pub mod link_quality;
pub mod combiner;
pub mod tx_scheduler;
pub mod worker;
pub mod tx_sequencer;

// Re-export commonly used types
pub use combiner::{CombineSource, HarqCombiner};
pub use link_quality::{LinkStats, SnrAverage};
pub use psbch::{MibSl, SyncDetection};
pub use primitives::PhyPrimitives;
pub use resource_pool::{ResourcePool, ResourcePoolConfig};
pub use scanner::{ControlChannelScanner, ScanStats};
pub use sci::{SciCodec, SciMessage};
pub use tx_scheduler::{TxScheduler, TxSchedulerConfig};
pub use tx_sequencer::{TxRequest, TxSequencer};
pub use worker::{PoolContext, SlWorker, SyncRole, WorkerStats, TX_ADVANCE};

use crate::{mac::MacPhyInterface, LayerError};
use interfaces::{RfFrontend, SubframeGrid};
use mcs::{McsDescriptor, MAX_MCS};
use sequence::NOF_SL_IDS;
use link_quality::LinkQuality;
use psbch::{bandwidth_of, PsbchProcessor};
use pscch::PscchProcessor;
use pssch::PsschProcessor;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tracing::{debug, error, info, warn};
use worker::SlChains;

/// PHY layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlPhyConfig {
    /// Ticks processed concurrently
    #[serde(default = "default_nof_workers")]
    pub nof_workers: usize,
    /// PSCCH candidates below this DMRS SNR are not decoded
    #[serde(default = "default_min_snr_db")]
    pub min_snr_db: f32,
    /// Buffer reported when both decodes of an occasion succeed
    #[serde(default)]
    pub combine_preference: CombineSource,
    /// Pattern XORed onto the SCI CRC
    #[serde(default)]
    pub crc_mask: u16,
    /// Soft buffer capacity in bits
    #[serde(default = "default_max_tbs")]
    pub max_tbs: u32,
    /// Send the sync subframes of the pool instead of decoding them
    #[serde(default)]
    pub sync_master: bool,
    /// Sidelink synchronisation identity sent as sync master (0..336)
    #[serde(default)]
    pub sync_id: u16,
    #[serde(default)]
    pub pool: ResourcePoolConfig,
    #[serde(default)]
    pub tx: TxSchedulerConfig,
}

fn default_nof_workers() -> usize {
    4
}

fn default_min_snr_db() -> f32 {
    3.0
}

fn default_max_tbs() -> u32 {
    40_000
}

impl Default for SlPhyConfig {
    fn default() -> Self {
        Self {
            nof_workers: default_nof_workers(),
            min_snr_db: default_min_snr_db(),
            combine_preference: CombineSource::default(),
            crc_mask: 0,
            max_tbs: default_max_tbs(),
            sync_master: false,
            sync_id: 0,
            pool: ResourcePoolConfig::default(),
            tx: TxSchedulerConfig::default(),
        }
    }
}

/// PHY layer statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhyStats {
    pub worker: WorkerStats,
    /// Control channel search since the last reconfiguration
    pub scan: ScanStats,
    pub nof_slots: u32,
    pub link: LinkStats,
}

/// Sidelink PHY: worker pool, pool snapshot and transmit ordering
pub struct SlPhy {
    config: SlPhyConfig,
    context: RwLock<Arc<PoolContext>>,
    chains: SlChains,
    idle_workers: std::sync::Mutex<Vec<SlWorker>>,
    next_worker_id: AtomicUsize,
    running: AtomicBool,
}

impl SlPhy {
    /// Create a PHY for a carrier of `nof_prb` resource blocks with the built-in primitives
    pub fn new(config: SlPhyConfig, nof_prb: usize, mac: Arc<dyn MacPhyInterface>) -> Result<Self, LayerError> {
        Self::with_primitives(config, nof_prb, mac, PhyPrimitives::reference())
    }

    pub fn with_primitives(
        config: SlPhyConfig,
        nof_prb: usize,
        mac: Arc<dyn MacPhyInterface>,
        primitives: PhyPrimitives,
    ) -> Result<Self, LayerError> {
        if config.nof_workers == 0 {
            return Err(LayerError::InvalidConfiguration("at least one worker required".into()));
        }
        if config.sync_id >= NOF_SL_IDS {
            return Err(LayerError::InvalidConfiguration(format!(
                "sync id {} outside 0..{}",
                config.sync_id, NOF_SL_IDS
            )));
        }
        if config.sync_master && bandwidth_of(nof_prb).is_none() {
            return Err(LayerError::InvalidConfiguration(format!(
                "{} PRB carrier cannot be announced in the MIB-SL",
                nof_prb
            )));
        }

        let pool = Arc::new(Self::build_pool(&config, nof_prb, config.pool.clone())?);
        let scheduler = TxScheduler::new(config.tx.clone(), Arc::clone(&pool))?;

        let pscch = PscchProcessor::new(primitives.clone());
        let context = PoolContext::new(pool, pscch.clone(), config.crc_mask, config.min_snr_db);

        info!(
            "Sidelink PHY: {} PRB, {} workers, combine preference {:?}, min SNR {:.1} dB",
            nof_prb, config.nof_workers, config.combine_preference, config.min_snr_db
        );
        if config.sync_master {
            info!("Sync master with sync id {}", config.sync_id);
        }

        Ok(Self {
            chains: SlChains {
                pscch,
                pssch: PsschProcessor::new(primitives.clone()),
                psbch: PsbchProcessor::new(primitives.clone()),
                sync: SyncRole {
                    master: config.sync_master,
                    sync_id: config.sync_id,
                },
                link: LinkQuality::new(config.tx.node_count),
                combiner: HarqCombiner::new(primitives.codec, config.combine_preference),
                scheduler: Mutex::new(scheduler),
                mac,
                nof_prb,
                counters: Default::default(),
            },
            context: RwLock::new(Arc::new(context)),
            config,
            idle_workers: std::sync::Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        })
    }

    fn build_pool(config: &SlPhyConfig, nof_prb: usize, pool_config: ResourcePoolConfig) -> Result<ResourcePool, LayerError> {
        let pool = ResourcePool::new(pool_config, nof_prb)?;

        // Every TBS the pool can announce must fit the soft buffers
        let largest = (1..=pool.num_subchannels())
            .filter_map(|len| McsDescriptor::new(MAX_MCS, pool.pssch_nof_prb(len)))
            .map(|mcs| mcs.tbs)
            .max()
            .unwrap_or(0);
        if largest > config.max_tbs {
            return Err(LayerError::InvalidConfiguration(format!(
                "pool allows TBS {} above soft buffer capacity {}",
                largest, config.max_tbs
            )));
        }
        Ok(pool)
    }

    pub fn config(&self) -> &SlPhyConfig {
        &self.config
    }

    /// Current resource pool snapshot
    pub async fn pool(&self) -> Arc<ResourcePool> {
        Arc::clone(&self.context.read().await.pool)
    }

    /// Replace the resource pool; ticks already being processed finish on the old one
    pub async fn configure(&self, pool_config: ResourcePoolConfig) -> Result<(), LayerError> {
        let pool = Arc::new(Self::build_pool(&self.config, self.chains.nof_prb, pool_config)?);
        let context = PoolContext::new(
            Arc::clone(&pool),
            self.chains.pscch.clone(),
            self.config.crc_mask,
            self.config.min_snr_db,
        );

        {
            let mut current = self.context.write().await;
            *current = Arc::new(context);
        }
        self.chains.scheduler.lock().await.set_pool(pool);
        info!("Resource pool reconfigured");
        Ok(())
    }

    /// Drop pending repetitions and clear worker scratch buffers
    pub async fn reset(&self) {
        let pool = self.pool().await;
        self.chains.scheduler.lock().await.set_pool(pool);
        let mut workers = self.idle_workers.lock().unwrap_or_else(|e| e.into_inner());
        for worker in workers.iter_mut() {
            worker.reset();
        }
        debug!("PHY reset ({} idle workers)", workers.len());
    }

    fn take_worker(&self) -> SlWorker {
        let worker = self.idle_workers.lock().unwrap_or_else(|e| e.into_inner()).pop();
        worker.unwrap_or_else(|| {
            SlWorker::new(self.next_worker_id.fetch_add(1, Ordering::Relaxed), self.config.max_tbs)
        })
    }

    fn release_worker(&self, worker: SlWorker) {
        self.idle_workers.lock().unwrap_or_else(|e| e.into_inner()).push(worker);
    }

    /// Process the subframe received at `tick`; returns what to transmit at
    /// `tick + TX_ADVANCE`
    pub async fn work(&self, tick: u64, grid: &SubframeGrid) -> Option<SubframeGrid> {
        let context = Arc::clone(&*self.context.read().await);
        let mut worker = self.take_worker();
        let out = worker.work(&self.chains, &context, tick, grid).await;
        self.release_worker(worker);
        out
    }

    /// Receive from `rf` until `nof_ticks` subframes were processed (forever
    /// when `None`) or [`SlPhy::stop`] is called; returns the number of ticks
    pub async fn run(self: Arc<Self>, rf: Arc<dyn RfFrontend>, nof_ticks: Option<u64>) -> Result<u64, LayerError> {
        let nof_workers = self.config.nof_workers;
        let (tx, rx) = mpsc::channel::<TxRequest>(nof_workers + TX_ADVANCE as usize);
        let sequencer = tokio::spawn(TxSequencer::new(Arc::clone(&rf), rx, 0).run());

        // Nothing can be scheduled before the first worker finishes
        for tick in 0..TX_ADVANCE {
            tx.send(TxRequest { tick, grid: None })
                .await
                .map_err(|_| LayerError::InvalidState("tx sequencer stopped".into()))?;
        }

        self.running.store(true, Ordering::SeqCst);
        info!("Starting sidelink PHY processing");

        let semaphore = Arc::new(Semaphore::new(nof_workers));
        let mut processed = 0u64;
        let mut result: Result<(), LayerError> = Ok(());

        while self.running.load(Ordering::SeqCst) && nof_ticks.map_or(true, |n| processed < n) {
            let grid = match rf.receive().await {
                Ok(grid) => grid,
                Err(e) => {
                    error!("Receive failed after {} ticks: {}", processed, e);
                    result = Err(e.into());
                    break;
                }
            };
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let phy = Arc::clone(&self);
            let tx = tx.clone();
            tokio::spawn(async move {
                let tick = grid.tick;
                let out = phy.work(tick, &grid).await;
                if tx.send(TxRequest { tick: tick + TX_ADVANCE, grid: out }).await.is_err() {
                    warn!("Tx sequencer gone, dropping tick {}", tick + TX_ADVANCE);
                }
                drop(permit);
            });
            processed += 1;
        }

        self.running.store(false, Ordering::SeqCst);
        drop(tx);
        match sequencer.await {
            Ok(Ok(transmitted)) => debug!("{} subframes transmitted", transmitted),
            Ok(Err(e)) => {
                error!("Tx sequencer failed: {}", e);
                result = result.and(Err(e));
            }
            Err(e) => {
                error!("Tx sequencer task failed: {}", e);
                result = result.and(Err(LayerError::ProcessingError(e.to_string())));
            }
        }

        info!("Sidelink PHY stopped after {} ticks", processed);
        result.map(|_| processed)
    }

    /// Stop a running [`SlPhy::run`] after the tick in progress
    pub fn stop(&self) {
        info!("Stopping PHY processing");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> PhyStats {
        let context = self.context.read().await;
        PhyStats {
            worker: self.chains.counters.snapshot(),
            scan: context.scanner.stats(),
            nof_slots: context.pool.nof_slots(),
            link: self.chains.link.snapshot(),
        }
    }
}
