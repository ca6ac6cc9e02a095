//! Sidelink resource pool
//!
//! Maps absolute subframes onto the pool's logical slot sequence
//! (3GPP TS 36.213 Section 14.1.5) and describes the pool's subchannel
//! geometry, including the resource indication value used by SCI format 1
//! (TS 36.213 Section 14.1.1.4C).

use crate::LayerError;
use common::types::{Tti, TTI_PERIOD};
use common::utils::ceil_log2;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info};

/// PRBs occupied by the control channel at the start of a transmission
pub const PSCCH_NOF_PRB: u32 = 2;

/// Resource pool configuration (SL-CommResourcePoolV2X)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePoolConfig {
    /// Subframe bitmap applied cyclically over the pool candidates
    #[serde(default = "default_subframe_bitmap")]
    pub subframe_bitmap: Vec<bool>,
    /// Number of subchannels
    #[serde(default = "default_num_subchannels")]
    pub num_subchannels: u32,
    /// Subchannel width in PRBs
    #[serde(default = "default_subchannel_size")]
    pub subchannel_size: u32,
    /// First PRB of subchannel 0
    #[serde(default)]
    pub start_rb_subchannel: u32,
    /// Pool start offset in subframes (sl-OffsetIndicator)
    #[serde(default)]
    pub offset: u32,
    /// Sidelink synchronisation period in subframes
    #[serde(default = "default_sync_period")]
    pub sync_period: u32,
    /// Subframe of the synchronisation period carrying SLSS
    #[serde(default)]
    pub sync_offset: u32,
}

fn default_subframe_bitmap() -> Vec<bool> {
    [true, false].iter().copied().cycle().take(20).collect()
}

fn default_num_subchannels() -> u32 {
    5
}

fn default_subchannel_size() -> u32 {
    5
}

fn default_sync_period() -> u32 {
    5
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            subframe_bitmap: default_subframe_bitmap(),
            num_subchannels: default_num_subchannels(),
            subchannel_size: default_subchannel_size(),
            start_rb_subchannel: 0,
            offset: 0,
            sync_period: default_sync_period(),
            sync_offset: 0,
        }
    }
}

impl ResourcePoolConfig {
    /// Check the configuration against a carrier of `nof_prb` resource blocks
    pub fn validate(&self, nof_prb: usize) -> Result<(), LayerError> {
        if self.subframe_bitmap.is_empty() {
            return Err(LayerError::InvalidConfiguration("empty subframe bitmap".into()));
        }
        if self.num_subchannels == 0 {
            return Err(LayerError::InvalidConfiguration("pool without subchannels".into()));
        }
        if self.subchannel_size <= PSCCH_NOF_PRB {
            return Err(LayerError::InvalidConfiguration(format!(
                "subchannel size {} leaves no PSSCH resource blocks",
                self.subchannel_size
            )));
        }
        if self.sync_period == 0 || self.sync_offset >= self.sync_period {
            return Err(LayerError::InvalidConfiguration(format!(
                "sync offset {} outside period {}",
                self.sync_offset, self.sync_period
            )));
        }
        let last_prb = self.start_rb_subchannel as usize
            + (self.num_subchannels * self.subchannel_size) as usize;
        if last_prb > nof_prb {
            return Err(LayerError::InvalidConfiguration(format!(
                "pool ends at PRB {} beyond carrier of {} PRBs",
                last_prb, nof_prb
            )));
        }
        Ok(())
    }

    /// Whether `tti` is reserved for sidelink synchronisation
    pub fn is_sync_subframe(&self, tti: Tti) -> bool {
        (tti.0 % TTI_PERIOD) % self.sync_period.max(1) == self.sync_offset
    }
}

/// A configured resource pool; immutable, swapped wholesale on reconfiguration
#[derive(Debug, Clone)]
pub struct ResourcePool {
    config: ResourcePoolConfig,
    /// Logical slot ordinal per subframe of the hyper-frame
    slot_table: Vec<Option<u32>>,
    nof_slots: u32,
}

impl ResourcePool {
    /// Build the pool's slot table for a carrier of `nof_prb` resource blocks
    pub fn new(config: ResourcePoolConfig, nof_prb: usize) -> Result<Self, LayerError> {
        config.validate(nof_prb)?;

        let period = TTI_PERIOD as usize;

        // Subframes not carrying sidelink synchronisation, from the pool offset on
        let candidates: Vec<usize> = (0..period)
            .map(|i| (config.offset as usize + i) % period)
            .filter(|&t| !config.is_sync_subframe(Tti(t as u32)))
            .collect();

        // Reserved subframes make the candidate count a multiple of the bitmap length
        let m = candidates.len();
        let nof_reserved = m % config.subframe_bitmap.len();
        let mut reserved = vec![false; m];
        for r in 0..nof_reserved {
            reserved[r * m / nof_reserved] = true;
        }

        let mut slot_table = vec![None; period];
        let mut nof_slots = 0u32;
        for (k, &tick) in candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| !reserved[*i])
            .map(|(_, t)| t)
            .enumerate()
        {
            if config.subframe_bitmap[k % config.subframe_bitmap.len()] {
                slot_table[tick] = Some(nof_slots);
                nof_slots += 1;
            }
        }

        info!(
            "Resource pool: {} subchannels x {} PRB from PRB {}, {} slots per period ({} reserved subframes)",
            config.num_subchannels, config.subchannel_size, config.start_rb_subchannel, nof_slots, nof_reserved
        );

        Ok(Self { config, slot_table, nof_slots })
    }

    pub fn config(&self) -> &ResourcePoolConfig {
        &self.config
    }

    pub fn num_subchannels(&self) -> u32 {
        self.config.num_subchannels
    }

    pub fn subchannel_size(&self) -> u32 {
        self.config.subchannel_size
    }

    /// Number of pool slots in one hyper-frame
    pub fn nof_slots(&self) -> u32 {
        self.nof_slots
    }

    /// Whether `tti` carries the sync signals instead of pool traffic
    pub fn is_sync_subframe(&self, tti: Tti) -> bool {
        self.config.is_sync_subframe(tti)
    }

    /// Logical slot ordinal of a subframe, `None` when it is not part of the pool
    pub fn slot_index(&self, tti: Tti) -> Option<u32> {
        self.slot_table
            .get((tti.0 % TTI_PERIOD) as usize)
            .copied()
            .flatten()
    }

    /// PRB range of subchannel `index`
    pub fn subchannel_offset(&self, index: u32) -> Range<u32> {
        let start = self.config.start_rb_subchannel + index * self.config.subchannel_size;
        start..start + self.config.subchannel_size
    }

    /// PRBs of the control channel for a transmission starting at `start`
    pub fn pscch_prbs(&self, start: u32) -> Range<u32> {
        let first = self.subchannel_offset(start).start;
        first..first + PSCCH_NOF_PRB
    }

    /// PRBs of the data channel for `len` subchannels starting at `start`
    pub fn pssch_prbs(&self, len: u32, start: u32) -> Range<u32> {
        let first = self.subchannel_offset(start).start;
        first + PSCCH_NOF_PRB..first + len * self.config.subchannel_size
    }

    /// PSSCH PRB count for a transmission over `len` subchannels
    pub fn pssch_nof_prb(&self, len: u32) -> u32 {
        (len * self.config.subchannel_size).saturating_sub(PSCCH_NOF_PRB)
    }

    /// Width in bits of the frequency resource location field
    pub fn riv_bits(&self) -> usize {
        let n = self.config.num_subchannels;
        ceil_log2(n * (n + 1) / 2) as usize
    }

    /// Encode `len` subchannels starting at `start` into a RIV
    pub fn encode_riv(&self, len: u32, start: u32) -> u32 {
        let n = self.config.num_subchannels;
        if len - 1 <= n / 2 {
            n * (len - 1) + start
        } else {
            n * (n - len + 1) + (n - 1 - start)
        }
    }

    /// Decode a RIV into `(len, start)`; `None` for values outside the pool
    pub fn decode_riv(&self, riv: u32) -> Option<(u32, u32)> {
        let n = self.config.num_subchannels;
        if riv >= n * (n + 1) / 2 {
            debug!("RIV {} out of range for {} subchannels", riv, n);
            return None;
        }

        let a = riv / n;
        let b = riv % n;
        if a + b < n {
            Some((a + 1, b))
        } else {
            Some((n - a + 1, n - 1 - b))
        }
    }
}
