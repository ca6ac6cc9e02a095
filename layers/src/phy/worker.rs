//! Sidelink PHY worker
//!
//! A worker runs the whole pipeline of one tick: blind control channel search
//! and data channel decode of the received subframe (or the PSBCH of a sync
//! subframe), then the transmission decision for the subframe `TX_ADVANCE`
//! ticks ahead. Workers own only their
//! scratch soft buffer; everything else is shared through [`SlChains`] and the
//! pool snapshot they were handed.

use super::combiner::{CombiningBufferPair, HarqCombiner};
use super::link_quality::LinkQuality;
use super::psbch::{bandwidth_of, MibSl, PsbchProcessor};
use super::pscch::PscchProcessor;
use super::pssch::PsschProcessor;
use super::resource_pool::ResourcePool;
use super::scanner::{ControlChannelScanner, ScanResult};
use super::sci::SciCodec;
use super::softbuffer::SoftBuffer;
use super::tx_scheduler::{TxGrant, TxScheduler};
use crate::mac::{DlGrant, MacPhyInterface};
use crate::LayerError;
use common::types::Tti;
use interfaces::SubframeGrid;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

/// Ticks between reception of a subframe and the transmission it schedules
pub const TX_ADVANCE: u64 = 4;

/// Pool dependent state, replaced as a whole on reconfiguration
pub struct PoolContext {
    pub pool: Arc<ResourcePool>,
    pub scanner: ControlChannelScanner,
}

impl PoolContext {
    pub fn new(pool: Arc<ResourcePool>, pscch: PscchProcessor, crc_mask: u16, min_snr_db: f32) -> Self {
        let codec = SciCodec::new(Arc::clone(&pool)).with_crc_mask(crc_mask);
        Self {
            scanner: ControlChannelScanner::new(pscch, codec, min_snr_db),
            pool,
        }
    }

    pub fn codec(&self) -> &SciCodec {
        self.scanner.codec()
    }
}

/// Worker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub ticks: u64,
    pub rx_grants: u64,
    pub rx_ok: u64,
    pub rx_ko: u64,
    /// Occasions the MAC acknowledged without decoding
    pub rx_duplicates: u64,
    /// Successful decodes of an already decoded block
    pub rx_repeated: u64,
    pub rx_errors: u64,
    pub tx_new: u64,
    pub tx_retx: u64,
    pub tx_errors: u64,
    /// Sync subframes sent as sync reference
    pub sync_tx: u64,
    pub mib_ok: u64,
    /// Sync signal found but PSBCH not decoded
    pub mib_ko: u64,
    /// MIBs announcing another TTI than the local one
    pub mib_mismatch: u64,
}

#[derive(Default)]
pub struct WorkerCounters {
    ticks: AtomicU64,
    rx_grants: AtomicU64,
    rx_ok: AtomicU64,
    rx_ko: AtomicU64,
    rx_duplicates: AtomicU64,
    rx_repeated: AtomicU64,
    rx_errors: AtomicU64,
    tx_new: AtomicU64,
    tx_retx: AtomicU64,
    tx_errors: AtomicU64,
    sync_tx: AtomicU64,
    mib_ok: AtomicU64,
    mib_ko: AtomicU64,
    mib_mismatch: AtomicU64,
}

impl WorkerCounters {
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            rx_grants: self.rx_grants.load(Ordering::Relaxed),
            rx_ok: self.rx_ok.load(Ordering::Relaxed),
            rx_ko: self.rx_ko.load(Ordering::Relaxed),
            rx_duplicates: self.rx_duplicates.load(Ordering::Relaxed),
            rx_repeated: self.rx_repeated.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            tx_new: self.tx_new.load(Ordering::Relaxed),
            tx_retx: self.tx_retx.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            sync_tx: self.sync_tx.load(Ordering::Relaxed),
            mib_ok: self.mib_ok.load(Ordering::Relaxed),
            mib_ko: self.mib_ko.load(Ordering::Relaxed),
            mib_mismatch: self.mib_mismatch.load(Ordering::Relaxed),
        }
    }
}

/// Synchronisation role of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRole {
    /// Send the sync subframes instead of listening to them
    pub master: bool,
    pub sync_id: u16,
}

/// Processing chains and collaborators shared by every worker
pub struct SlChains {
    pub pscch: PscchProcessor,
    pub pssch: PsschProcessor,
    pub psbch: PsbchProcessor,
    pub sync: SyncRole,
    pub link: LinkQuality,
    pub combiner: HarqCombiner,
    pub scheduler: Mutex<TxScheduler>,
    pub mac: Arc<dyn MacPhyInterface>,
    pub nof_prb: usize,
    pub counters: WorkerCounters,
}

/// Per-tick receive and transmit pipeline
pub struct SlWorker {
    id: usize,
    /// Scratch buffer for the standalone decode of each occasion
    fresh: SoftBuffer,
}

impl SlWorker {
    pub fn new(id: usize, max_tbs: u32) -> Self {
        debug!("Sidelink worker {} created", id);
        Self {
            id,
            fresh: SoftBuffer::new(max_tbs),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Clear the scratch buffer
    pub fn reset(&mut self) {
        self.fresh.reset();
    }

    /// Process the subframe received at `tick`; returns the subframe to
    /// transmit at `tick + TX_ADVANCE`, `None` for silence
    pub async fn work(
        &mut self,
        chains: &SlChains,
        ctx: &PoolContext,
        tick: u64,
        grid: &SubframeGrid,
    ) -> Option<SubframeGrid> {
        chains.counters.ticks.fetch_add(1, Ordering::Relaxed);

        let tti = Tti::from_tick(tick);
        if ctx.pool.is_sync_subframe(tti) {
            if !chains.sync.master {
                self.synchronise(chains, grid, tti);
            }
        } else if let Some(found) = ctx.scanner.scan(grid, tti) {
            if let Err(e) = self.receive(chains, ctx, grid, tti, &found).await {
                chains.counters.rx_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Worker {}: receive at {} failed: {}", self.id, tti, e);
            }
        }

        let tx_tick = tick + TX_ADVANCE;
        match self.transmit(chains, ctx, tx_tick).await {
            Ok(grid) => grid,
            Err(e) => {
                chains.counters.tx_errors.fetch_add(1, Ordering::Relaxed);
                error!("Worker {}: transmission for tick {} failed: {}", self.id, tx_tick, e);
                None
            }
        }
    }

    /// Decode the PSBCH of a sync subframe and check its timing against ours
    fn synchronise(&self, chains: &SlChains, grid: &SubframeGrid, tti: Tti) {
        let detection = match chains.psbch.decode(grid) {
            Ok(Some(detection)) => detection,
            Ok(None) => return,
            Err(e) => {
                chains.counters.rx_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Worker {}: sync subframe at {} failed: {}", self.id, tti, e);
                return;
            }
        };
        chains.link.update_psbch(detection.snr_db);

        match detection.mib {
            Some(mib) => {
                chains.counters.mib_ok.fetch_add(1, Ordering::Relaxed);
                if mib.tti() != tti {
                    chains.counters.mib_mismatch.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Worker {}: sync id {} announces {} while at {}",
                        self.id,
                        detection.sync_id,
                        mib.tti(),
                        tti
                    );
                }
            }
            None => {
                chains.counters.mib_ko.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Worker {}: PSBCH of sync id {} at {} not decoded, snr {:.1} dB",
                    self.id, detection.sync_id, tti, detection.snr_db
                );
            }
        }
    }

    async fn receive(
        &mut self,
        chains: &SlChains,
        ctx: &PoolContext,
        grid: &SubframeGrid,
        tti: Tti,
        found: &ScanResult,
    ) -> Result<(), LayerError> {
        let msg = found.msg;
        let grant = DlGrant::from_sci(&msg, tti, found.slot, ctx.pool.nof_slots());
        chains.counters.rx_grants.fetch_add(1, Ordering::Relaxed);

        let action = chains.mac.new_grant(grant).await;
        let tb = &action.tb[0];
        if !tb.enabled {
            if tb.ack {
                chains.counters.rx_duplicates.fetch_add(1, Ordering::Relaxed);
                trace!("Worker {}: HARQ {} already acknowledged, skipping decode", self.id, action.pid);
            }
            return Ok(());
        }
        let Some(softbuffer) = tb.softbuffer.clone() else {
            return Err(LayerError::InvalidState(format!("HARQ {} action without soft buffer", action.pid)));
        };

        // 1. Demodulation
        let soft = chains.pssch.demodulate(grid, &ctx.pool, &msg, found.scramble_id);
        let soft = match soft {
            Ok(soft) => soft,
            Err(e) => {
                chains.mac.tb_decoded(&grant, 0, false, None).await;
                return Err(e);
            }
        };

        // 2. Combining against the HARQ soft buffer; the lock is not held across awaits
        let outcome = {
            let mut combined = softbuffer
                .lock()
                .map_err(|_| LayerError::InvalidState("soft buffer lock poisoned".into()))?;
            let pair = CombiningBufferPair {
                fresh: &mut self.fresh,
                combined: &mut *combined,
            };
            chains.combiner.combine_decode(&msg, pair, &soft.llr)
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                chains.mac.tb_decoded(&grant, 0, false, None).await;
                return Err(e);
            }
        };

        chains.link.update_pssch(found.slot, soft.snr_db);

        // 3. Delivery
        if outcome.success && outcome.repeated {
            chains.counters.rx_repeated.fetch_add(1, Ordering::Relaxed);
            debug!("Worker {}: HARQ {} decoded again, not delivering", self.id, action.pid);
            chains.mac.tb_decoded(&grant, 0, false, None).await;
            return Ok(());
        }

        let ack = chains.mac.tb_decoded(&grant, 0, outcome.success, outcome.payload).await;
        if ack {
            chains.counters.rx_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            chains.counters.rx_ko.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            "Worker {}: PSSCH {} slot {} pid {} rti {} tbs {} {} ({:?}) snr {:.1} dB",
            self.id,
            tti,
            found.slot,
            action.pid,
            msg.rti,
            msg.mcs.tbs,
            if ack { "OK" } else { "KO" },
            outcome.generation_used,
            soft.snr_db
        );
        Ok(())
    }

    async fn transmit(
        &mut self,
        chains: &SlChains,
        ctx: &PoolContext,
        tx_tick: u64,
    ) -> Result<Option<SubframeGrid>, LayerError> {
        let tti = Tti::from_tick(tx_tick);
        if ctx.pool.is_sync_subframe(tti) {
            if !chains.sync.master {
                return Ok(None);
            }
            return self.encode_sync(chains, tx_tick).map(Some);
        }
        let Some(slot) = ctx.pool.slot_index(tti) else {
            return Ok(None);
        };

        let grant = {
            let mut scheduler = chains.scheduler.lock().await;
            if let Some(retx) = scheduler.take_retransmission(slot) {
                chains.counters.tx_retx.fetch_add(1, Ordering::Relaxed);
                Some(retx)
            } else if scheduler.is_eligible(slot) {
                let max_bytes = scheduler.max_payload_bytes();
                match chains.mac.next_tx_pdu(max_bytes).await {
                    Some(pdu) => {
                        let grant = scheduler.schedule(slot, pdu);
                        if grant.is_some() {
                            chains.counters.tx_new.fetch_add(1, Ordering::Relaxed);
                        }
                        grant
                    }
                    None => None,
                }
            } else {
                None
            }
        };

        match grant {
            Some(grant) => self.encode(chains, ctx, tx_tick, &grant).map(Some),
            None => Ok(None),
        }
    }

    fn encode(
        &self,
        chains: &SlChains,
        ctx: &PoolContext,
        tx_tick: u64,
        grant: &TxGrant,
    ) -> Result<SubframeGrid, LayerError> {
        let sci = &grant.sci;
        let mut grid = SubframeGrid::new(chains.nof_prb, tx_tick);

        // 1. SCI
        let (sci_bits, n_x_id) = ctx.codec().encode(sci)?;

        // 2. PSCCH
        chains.pscch.encode(&mut grid, &ctx.pool, &sci_bits, sci.start_subchannel)?;

        // 3. PSSCH
        chains.pssch.encode(&mut grid, &ctx.pool, sci, n_x_id, &grant.payload)?;

        info!(
            "Worker {}: tx tick {} slot {} L={} start={} mcs={} tbs={} rti={}",
            self.id,
            tx_tick,
            grant.slot,
            sci.num_subchannels,
            sci.start_subchannel,
            sci.mcs.idx,
            sci.mcs.tbs,
            sci.rti
        );
        Ok(grid)
    }

    fn encode_sync(&self, chains: &SlChains, tx_tick: u64) -> Result<SubframeGrid, LayerError> {
        let tti = Tti::from_tick(tx_tick);
        let bandwidth = bandwidth_of(chains.nof_prb).ok_or_else(|| {
            LayerError::InvalidConfiguration(format!("no MIB-SL bandwidth for {} PRB", chains.nof_prb))
        })?;
        let mut grid = SubframeGrid::new(chains.nof_prb, tx_tick);
        chains.psbch.encode(&mut grid, &MibSl::new(bandwidth, tti), chains.sync.sync_id)?;

        chains.counters.sync_tx.fetch_add(1, Ordering::Relaxed);
        trace!("Worker {}: sync subframe for {} (id {})", self.id, tti, chains.sync.sync_id);
        Ok(grid)
    }
}
