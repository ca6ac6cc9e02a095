//! Medium Access Control (MAC) Layer Implementation
//!
//! Implements the sidelink MAC of 3GPP TS 36.321: HARQ reception of the
//! SL-SCH, SL-SCH PDU assembly from queued SDUs and delivery of received SDUs
//! to the upper layers.

pub mod demux;
pub mod harq;
pub mod slsch_pdu;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::LayerError;
pub use demux::{BufferPool, ChannelDemux, DeliveredSdu, PayloadAllocator, PayloadBuffer, PduDemux};
pub use harq::{DlAction, DlGrant, DlHarqEntity, GrantKind, HarqConfig, TbAction, MAX_HARQ_PROC, MAX_TB};
pub use slsch_pdu::{SlSchPdu, SlSdu};

/// MAC layer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacConfig {
    /// Own layer-2 id, source of transmitted PDUs
    #[serde(default = "default_src_id")]
    pub src_id: u32,
    /// Layer-2 destination of transmitted PDUs
    #[serde(default = "default_dst_id")]
    pub dst_id: u32,
    /// Logical channel of SDUs written without one
    #[serde(default = "default_lcid")]
    pub default_lcid: u8,
    /// Duplicates tolerated on an acknowledged HARQ process before reset
    #[serde(default = "default_duplicate_reset_threshold")]
    pub duplicate_reset_threshold: u32,
    /// Receive payload buffers
    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,
    /// Soft buffer capacity in bits
    #[serde(default = "default_max_tbs")]
    pub max_tbs: u32,
    /// SDUs waiting for transmission before new ones are refused
    #[serde(default = "default_tx_queue_len")]
    pub tx_queue_len: usize,
}

fn default_src_id() -> u32 {
    1
}

fn default_dst_id() -> u32 {
    0xFF_FFFF
}

fn default_lcid() -> u8 {
    3
}

fn default_duplicate_reset_threshold() -> u32 {
    6
}

fn default_buffer_pool_size() -> usize {
    32
}

fn default_max_tbs() -> u32 {
    40_000
}

fn default_tx_queue_len() -> usize {
    256
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            src_id: default_src_id(),
            dst_id: default_dst_id(),
            default_lcid: default_lcid(),
            duplicate_reset_threshold: default_duplicate_reset_threshold(),
            buffer_pool_size: default_buffer_pool_size(),
            max_tbs: default_max_tbs(),
            tx_queue_len: default_tx_queue_len(),
        }
    }
}

impl MacConfig {
    pub fn harq_config(&self) -> HarqConfig {
        HarqConfig {
            duplicate_reset_threshold: self.duplicate_reset_threshold,
            max_tbs: self.max_tbs,
        }
    }
}

/// MAC-PHY interface for reception grants and transmit data
#[async_trait]
pub trait MacPhyInterface: Send + Sync {
    /// A control message scheduled a transport block; decide how to receive it
    async fn new_grant(&self, grant: DlGrant) -> DlAction;

    /// Decode result of transport block `tb_idx`; returns the final ack
    async fn tb_decoded(&self, grant: &DlGrant, tb_idx: usize, ack: bool, data: Option<Bytes>) -> bool;

    /// Next MAC PDU of at most `max_bytes` bytes, if data is waiting
    async fn next_tx_pdu(&self, max_bytes: usize) -> Option<Bytes>;
}

/// MAC counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MacMetrics {
    pub rx_grants: u64,
    pub rx_delivered: u64,
    pub rx_failed: u64,
    pub tx_pdus: u64,
    pub tx_sdus: u64,
    pub tx_queue_len: usize,
    pub average_retx: f32,
}

#[derive(Default)]
struct MacCounters {
    rx_grants: AtomicU64,
    rx_delivered: AtomicU64,
    rx_failed: AtomicU64,
    tx_pdus: AtomicU64,
    tx_sdus: AtomicU64,
}

/// Sidelink MAC layer
pub struct SidelinkMac {
    config: MacConfig,
    harq: DlHarqEntity,
    tx_queue: Mutex<VecDeque<SlSdu>>,
    counters: MacCounters,
}

impl SidelinkMac {
    /// Create a MAC delivering through `demux` with its own payload buffer pool
    pub fn new(config: MacConfig, demux: Arc<dyn PduDemux>) -> Self {
        let pool = Arc::new(BufferPool::new(config.buffer_pool_size, (config.max_tbs / 8) as usize));
        Self::with_allocator(config, pool, demux)
    }

    pub fn with_allocator(config: MacConfig, allocator: Arc<dyn PayloadAllocator>, demux: Arc<dyn PduDemux>) -> Self {
        info!(
            "Sidelink MAC: L2 id {:06x} -> {:06x}, duplicate threshold {}",
            config.src_id, config.dst_id, config.duplicate_reset_threshold
        );
        Self {
            harq: DlHarqEntity::new(config.harq_config(), allocator, demux),
            config,
            tx_queue: Mutex::new(VecDeque::new()),
            counters: MacCounters::default(),
        }
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn harq(&self) -> &DlHarqEntity {
        &self.harq
    }

    /// Queue an SDU for transmission
    pub async fn write_sdu(&self, lcid: Option<u8>, data: Bytes) -> Result<(), LayerError> {
        let lcid = lcid.unwrap_or(self.config.default_lcid);
        if lcid >= slsch_pdu::LCID_PADDING || data.is_empty() || data.len() > slsch_pdu::MAX_SDU_LEN {
            return Err(LayerError::InvalidPdu);
        }

        let mut queue = self.tx_queue.lock().await;
        if queue.len() >= self.config.tx_queue_len {
            warn!("Tx queue full ({} SDUs), dropping SDU of {} bytes", queue.len(), data.len());
            return Err(LayerError::ResourceUnavailable);
        }
        queue.push_back(SlSdu { lcid, data });
        Ok(())
    }

    /// Reset HARQ reception and drop queued SDUs
    pub async fn reset(&self) {
        self.harq.reset().await;
        self.tx_queue.lock().await.clear();
    }

    pub async fn metrics(&self) -> MacMetrics {
        MacMetrics {
            rx_grants: self.counters.rx_grants.load(Ordering::Relaxed),
            rx_delivered: self.counters.rx_delivered.load(Ordering::Relaxed),
            rx_failed: self.counters.rx_failed.load(Ordering::Relaxed),
            tx_pdus: self.counters.tx_pdus.load(Ordering::Relaxed),
            tx_sdus: self.counters.tx_sdus.load(Ordering::Relaxed),
            tx_queue_len: self.tx_queue.lock().await.len(),
            average_retx: self.harq.average_retx().await,
        }
    }
}

#[async_trait]
impl MacPhyInterface for SidelinkMac {
    async fn new_grant(&self, grant: DlGrant) -> DlAction {
        self.counters.rx_grants.fetch_add(1, Ordering::Relaxed);
        self.harq.new_grant(grant).await
    }

    async fn tb_decoded(&self, grant: &DlGrant, tb_idx: usize, ack: bool, data: Option<Bytes>) -> bool {
        let ack = self.harq.tb_decoded(grant, tb_idx, ack, data).await;
        if ack {
            self.counters.rx_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.rx_failed.fetch_add(1, Ordering::Relaxed);
        }
        ack
    }

    async fn next_tx_pdu(&self, max_bytes: usize) -> Option<Bytes> {
        let mut queue = self.tx_queue.lock().await;
        let mut pdu = SlSchPdu::new(self.config.src_id, self.config.dst_id);
        let mut len = pdu.encoded_len();

        while let Some(sdu) = queue.front() {
            let footprint = SlSchPdu::sdu_footprint(sdu.data.len());
            if len + footprint > max_bytes {
                break;
            }
            len += footprint;
            if let Some(sdu) = queue.pop_front() {
                if let Err(e) = pdu.push(sdu.lcid, sdu.data) {
                    warn!("Dropping SDU: {}", e);
                }
            }
        }

        if pdu.sdus.is_empty() {
            if let Some(sdu) = queue.front() {
                warn!(
                    "SDU of {} bytes does not fit a PDU of {} bytes, dropping",
                    sdu.data.len(),
                    max_bytes
                );
                queue.pop_front();
            }
            return None;
        }
        drop(queue);

        let nof_sdus = pdu.sdus.len() as u64;
        match pdu.write(None) {
            Ok(bytes) => {
                self.counters.tx_pdus.fetch_add(1, Ordering::Relaxed);
                self.counters.tx_sdus.fetch_add(nof_sdus, Ordering::Relaxed);
                debug!("SL-SCH PDU of {} bytes with {} SDUs", bytes.len(), nof_sdus);
                Some(bytes)
            }
            Err(e) => {
                warn!("Building SL-SCH PDU: {}", e);
                None
            }
        }
    }
}
