//! Sidelink Transmit Scheduler
//!
//! Autonomous resource selection for a node in a fixed-size group: node
//! `sidelink_id` owns every pool slot with `slot % node_count == sidelink_id`.
//! A transport block is sent on an owned slot and repeated once, with the
//! retransmission index set, `time_gap` slots later on the same subchannels.

use super::mcs::{McsDescriptor, MAX_MCS};
use super::resource_pool::ResourcePool;
use super::sci::SciMessage;
use crate::LayerError;
use bytes::Bytes;
use common::utils::is_dft_size;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Transmit scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSchedulerConfig {
    /// Position of this node in the group
    #[serde(default)]
    pub sidelink_id: u32,
    /// Number of nodes sharing the pool
    #[serde(default = "default_node_count")]
    pub node_count: u32,
    /// Slots between a transmission and its repetition
    #[serde(default = "default_time_gap")]
    pub time_gap: u8,
    /// Highest MCS the scheduler may pick
    #[serde(default = "default_max_mcs")]
    pub max_mcs: u8,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub resource_reservation: u8,
    /// Send every transport block a second time
    #[serde(default = "default_retransmit")]
    pub retransmit: bool,
    /// Seed of the start subchannel selection
    #[serde(default)]
    pub seed: u64,
}

fn default_node_count() -> u32 {
    5
}

fn default_time_gap() -> u8 {
    5
}

fn default_max_mcs() -> u8 {
    11
}

fn default_retransmit() -> bool {
    true
}

impl Default for TxSchedulerConfig {
    fn default() -> Self {
        Self {
            sidelink_id: 0,
            node_count: default_node_count(),
            time_gap: default_time_gap(),
            max_mcs: default_max_mcs(),
            priority: 0,
            resource_reservation: 0,
            retransmit: default_retransmit(),
            seed: 0,
        }
    }
}

impl TxSchedulerConfig {
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.node_count == 0 || self.sidelink_id >= self.node_count {
            return Err(LayerError::InvalidConfiguration(format!(
                "sidelink id {} outside group of {}",
                self.sidelink_id, self.node_count
            )));
        }
        if self.max_mcs > MAX_MCS {
            return Err(LayerError::InvalidConfiguration(format!("max MCS {} above {}", self.max_mcs, MAX_MCS)));
        }
        if self.priority > 7 || self.resource_reservation > 15 {
            return Err(LayerError::InvalidConfiguration(format!(
                "priority {} / reservation {} do not fit SCI",
                self.priority, self.resource_reservation
            )));
        }
        if self.time_gap > 15 {
            return Err(LayerError::InvalidConfiguration(format!("time gap {} does not fit SCI", self.time_gap)));
        }
        if self.retransmit && (self.time_gap == 0 || self.time_gap as u32 % self.node_count != 0) {
            return Err(LayerError::InvalidConfiguration(format!(
                "time gap {} does not land on a slot owned by this node (group of {})",
                self.time_gap, self.node_count
            )));
        }
        Ok(())
    }
}

/// A transmission decided for one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxGrant {
    pub sci: SciMessage,
    /// Pool slot ordinal
    pub slot: u32,
    /// MAC PDU padded to the transport block size
    pub payload: Bytes,
}

pub struct TxScheduler {
    config: TxSchedulerConfig,
    pool: Arc<ResourcePool>,
    rng: StdRng,
    /// Repetitions keyed by the slot they are due in
    pending: BTreeMap<u32, TxGrant>,
}

impl TxScheduler {
    pub fn new(config: TxSchedulerConfig, pool: Arc<ResourcePool>) -> Result<Self, LayerError> {
        config.validate()?;
        info!(
            "Tx scheduler: node {}/{} gap {} max MCS {}",
            config.sidelink_id, config.node_count, config.time_gap, config.max_mcs
        );
        let rng = StdRng::seed_from_u64(config.seed ^ config.sidelink_id as u64);
        Ok(Self {
            config,
            pool,
            rng,
            pending: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &TxSchedulerConfig {
        &self.config
    }

    /// Switch to a new pool; pending repetitions refer to the old one and are dropped
    pub fn set_pool(&mut self, pool: Arc<ResourcePool>) {
        if !self.pending.is_empty() {
            debug!("Dropping {} pending repetitions on pool change", self.pending.len());
        }
        self.pending.clear();
        self.pool = pool;
    }

    /// Whether `slot` belongs to this node
    pub fn is_eligible(&self, slot: u32) -> bool {
        slot % self.config.node_count == self.config.sidelink_id
    }

    /// Largest payload in bytes any allocation can carry at `max_mcs`
    pub fn max_payload_bytes(&self) -> usize {
        (1..=self.pool.num_subchannels())
            .filter_map(|len| {
                let n_prb = self.pool.pssch_nof_prb(len);
                if !is_dft_size(n_prb as usize) {
                    return None;
                }
                McsDescriptor::new(self.config.max_mcs, n_prb)
            })
            .map(|mcs| (mcs.tbs.saturating_sub(1) / 8) as usize)
            .max()
            .unwrap_or(0)
    }

    /// Pick subchannels and MCS for a payload of `payload_bits` in `slot`
    pub fn build_grant(&mut self, slot: u32, payload_bits: u32) -> Option<SciMessage> {
        if !self.is_eligible(slot) {
            return None;
        }

        let n = self.pool.num_subchannels();
        for len in 1..=n {
            let n_prb = self.pool.pssch_nof_prb(len);
            if !is_dft_size(n_prb as usize) {
                continue;
            }

            let mcs = (0..=self.config.max_mcs)
                .filter_map(|idx| McsDescriptor::new(idx, n_prb))
                .find(|mcs| mcs.tbs > payload_bits);

            if let Some(mcs) = mcs {
                let start_subchannel = self.rng.gen_range(0..=n - len);
                debug!(
                    "Slot {}: {} bits on {} subchannels from {} ({} PRB) mcs {} tbs {}",
                    slot, payload_bits, len, start_subchannel, n_prb, mcs.idx, mcs.tbs
                );
                return Some(SciMessage {
                    priority: self.config.priority,
                    resource_reservation: self.config.resource_reservation,
                    num_subchannels: len,
                    start_subchannel,
                    time_gap: self.config.time_gap,
                    rti: 0,
                    mcs,
                });
            }
        }

        warn!("No allocation carries {} bits up to MCS {}", payload_bits, self.config.max_mcs);
        None
    }

    /// Decide the transmission of `slot` for `payload`; queues its repetition
    pub fn schedule(&mut self, slot: u32, payload: Bytes) -> Option<TxGrant> {
        let sci = self.build_grant(slot, payload.len() as u32 * 8)?;

        let mut padded = payload.to_vec();
        padded.resize(sci.mcs.tbs_bytes(), 0);
        let grant = TxGrant {
            sci,
            slot,
            payload: Bytes::from(padded),
        };

        if self.config.retransmit {
            let due = (slot + self.config.time_gap as u32) % self.pool.nof_slots().max(1);
            self.pending.insert(
                due,
                TxGrant {
                    sci: sci.as_retransmission(),
                    slot: due,
                    payload: grant.payload.clone(),
                },
            );
        }

        Some(grant)
    }

    /// Repetition due in `slot`, if any
    pub fn take_retransmission(&mut self, slot: u32) -> Option<TxGrant> {
        self.pending.remove(&slot)
    }

    pub fn has_pending(&self, slot: u32) -> bool {
        self.pending.contains_key(&slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::resource_pool::ResourcePoolConfig;

    fn scheduler(config: TxSchedulerConfig) -> TxScheduler {
        let pool = ResourcePool::new(ResourcePoolConfig::default(), 25).unwrap();
        TxScheduler::new(config, Arc::new(pool)).unwrap()
    }

    #[test]
    fn test_scenario_800_bits() {
        let mut sched = scheduler(TxSchedulerConfig::default());
        let sci = sched.build_grant(0, 800).unwrap();
        // 3 PRB on one subchannel cannot carry 800 bits at MCS 11
        assert_eq!(sci.num_subchannels, 2);
        assert_eq!(sched.pool.pssch_nof_prb(2), 8);
        assert_eq!(sci.mcs.idx, 7);
        assert_eq!(sci.mcs.tbs, 888);
        assert!(sci.start_subchannel <= 3);
        assert_eq!(sci.rti, 0);
        assert_eq!(sci.time_gap, 5);
    }

    #[test]
    fn test_eligibility() {
        let config = TxSchedulerConfig { sidelink_id: 2, ..Default::default() };
        let mut sched = scheduler(config);
        assert!(sched.build_grant(0, 100).is_none());
        assert!(sched.build_grant(7, 100).is_some());
        assert!(sched.is_eligible(12));
        assert!(!sched.is_eligible(13));
    }

    #[test]
    fn test_start_subchannel_range() {
        let mut sched = scheduler(TxSchedulerConfig::default());
        let mut seen = [false; 5];
        for i in 0..200 {
            let sci = sched.build_grant(i * 5, 100).unwrap();
            assert_eq!(sci.num_subchannels, 1);
            seen[sci.start_subchannel as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_payload_too_large() {
        let mut sched = scheduler(TxSchedulerConfig::default());
        let max = sched.max_payload_bytes();
        assert!(max > 0);
        assert!(sched.build_grant(0, max as u32 * 8).is_some());
        assert!(sched.build_grant(0, (max as u32 + 1) * 8).is_none());
    }

    #[test]
    fn test_retransmission_follows() {
        let mut sched = scheduler(TxSchedulerConfig::default());
        let grant = sched.schedule(10, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(grant.payload.len(), grant.sci.mcs.tbs_bytes());
        assert!(sched.has_pending(15));
        assert!(sched.take_retransmission(14).is_none());

        let retx = sched.take_retransmission(15).unwrap();
        assert_eq!(retx.sci, grant.sci.as_retransmission());
        assert_eq!(retx.payload, grant.payload);
        assert!(sched.take_retransmission(15).is_none());
    }

    #[test]
    fn test_config_validation() {
        assert!(TxSchedulerConfig::default().validate().is_ok());
        let bad_gap = TxSchedulerConfig { time_gap: 4, ..Default::default() };
        assert!(bad_gap.validate().is_err());
        let no_retx = TxSchedulerConfig { time_gap: 4, retransmit: false, ..Default::default() };
        assert!(no_retx.validate().is_ok());
        let bad_id = TxSchedulerConfig { sidelink_id: 5, ..Default::default() };
        assert!(bad_id.validate().is_err());
        let bad_mcs = TxSchedulerConfig { max_mcs: 29, ..Default::default() };
        assert!(bad_mcs.validate().is_err());
    }
}
