//! Sidelink Control Information format 1 (TS 36.212 Section 5.4.3.1.2)
//!
//! 32 information bits followed by a 16-bit CRC:
//!
//! | field                        | bits                      |
//! |------------------------------|---------------------------|
//! | priority                     | 3                         |
//! | resource reservation         | 4                         |
//! | frequency resource location  | ceil(log2(N(N+1)/2))      |
//! | time gap                     | 4                         |
//! | MCS                          | 5                         |
//! | retransmission index         | 1                         |
//! | reserved (zero)              | up to 32                  |
//!
//! The CRC remainder over the information bits doubles as the PSSCH
//! scrambling identity n_X_ID.

use super::mcs::{McsDescriptor, MAX_MCS};
use super::resource_pool::ResourcePool;
use crate::LayerError;
use common::utils::{append_bits, crc16_bits, BitReader};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// SCI format 1 information bits
pub const SCI1_INFO_BITS: usize = 32;

/// SCI CRC length
pub const SCI_CRC_BITS: usize = 16;

/// SCI format 1 length including CRC
pub const SCI1_LEN: usize = SCI1_INFO_BITS + SCI_CRC_BITS;

/// Decoded or to-be-transmitted SCI format 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SciMessage {
    /// ProSe per-packet priority (0..=7)
    pub priority: u8,
    /// Resource reservation period index (0..=15)
    pub resource_reservation: u8,
    /// Number of subchannels L
    pub num_subchannels: u32,
    /// First subchannel of the allocation
    pub start_subchannel: u32,
    /// Subframes between initial transmission and retransmission (0..=15)
    pub time_gap: u8,
    /// Retransmission index: 0 initial transmission, 1 retransmission
    pub rti: u8,
    pub mcs: McsDescriptor,
}

impl SciMessage {
    pub fn is_retransmission(&self) -> bool {
        self.rti != 0
    }

    /// Redundancy version of the PSSCH this SCI schedules
    pub fn rv(&self) -> u8 {
        if self.rti == 0 {
            0
        } else {
            2
        }
    }

    /// The same transmission announced as the retransmission
    pub fn as_retransmission(&self) -> Self {
        Self { rti: 1, ..*self }
    }

    /// Pool slot of the initial transmission of a block seen in `slot`,
    /// wrapping at `nof_slots` (no wrap when 0)
    pub fn initial_slot(&self, slot: u32, nof_slots: u32) -> u32 {
        let back = self.rti as u32 * self.time_gap as u32;
        match nof_slots {
            0 => slot.saturating_sub(back),
            n => (slot as i64 - back as i64).rem_euclid(n as i64) as u32,
        }
    }
}

/// Successful SCI decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SciDecode {
    pub msg: SciMessage,
    /// CRC remainder over the information bits (n_X_ID)
    pub crc_remainder: u16,
}

/// Reasons an SCI candidate is rejected
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SciError {
    #[error("SCI of {0} bits, expected {SCI1_LEN}")]
    InvalidLength(usize),

    #[error("SCI CRC mismatch: computed {computed:#06x}, received {received:#06x}")]
    CrcMismatch { computed: u16, received: u16 },

    #[error("RIV {0} outside resource pool")]
    InvalidRiv(u32),

    #[error("MCS {0} not supported")]
    InvalidMcs(u8),
}

/// SCI format 1 encoder/decoder bound to one resource pool
#[derive(Debug, Clone)]
pub struct SciCodec {
    pool: Arc<ResourcePool>,
    /// Pattern XORed onto the transmitted CRC
    crc_mask: u16,
}

impl SciCodec {
    pub fn new(pool: Arc<ResourcePool>) -> Self {
        Self { pool, crc_mask: 0 }
    }

    /// Use a non-zero CRC mask
    pub fn with_crc_mask(mut self, crc_mask: u16) -> Self {
        self.crc_mask = crc_mask;
        self
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// CRC remainder over SCI information bits
    pub fn crc_remainder(info_bits: &[u8]) -> u16 {
        crc16_bits(info_bits)
    }

    fn information_bits(&self, msg: &SciMessage) -> Result<Vec<u8>, LayerError> {
        let n = self.pool.num_subchannels();
        if msg.num_subchannels == 0 || msg.start_subchannel + msg.num_subchannels > n {
            return Err(LayerError::ProcessingError(format!(
                "allocation of {} subchannels from {} outside pool of {}",
                msg.num_subchannels, msg.start_subchannel, n
            )));
        }
        if msg.priority > 7 || msg.resource_reservation > 15 || msg.time_gap > 15 || msg.rti > 1 || msg.mcs.idx > MAX_MCS {
            return Err(LayerError::InvalidPdu);
        }

        let riv = self.pool.encode_riv(msg.num_subchannels, msg.start_subchannel);

        let mut bits = Vec::with_capacity(SCI1_LEN);
        append_bits(&mut bits, msg.priority as u32, 3);
        append_bits(&mut bits, msg.resource_reservation as u32, 4);
        append_bits(&mut bits, riv, self.pool.riv_bits());
        append_bits(&mut bits, msg.time_gap as u32, 4);
        append_bits(&mut bits, msg.mcs.idx as u32, 5);
        append_bits(&mut bits, msg.rti as u32, 1);
        bits.resize(SCI1_INFO_BITS, 0);
        Ok(bits)
    }

    /// Encode `msg` into 48 bits; returns the bits and the CRC remainder
    pub fn encode(&self, msg: &SciMessage) -> Result<(Vec<u8>, u16), LayerError> {
        let mut bits = self.information_bits(msg)?;
        let crc = Self::crc_remainder(&bits);
        append_bits(&mut bits, (crc ^ self.crc_mask) as u32, SCI_CRC_BITS);
        Ok((bits, crc))
    }

    /// Unpack and check one SCI candidate
    pub fn decode(&self, bits: &[u8]) -> Result<SciDecode, SciError> {
        if bits.len() != SCI1_LEN {
            return Err(SciError::InvalidLength(bits.len()));
        }

        let info = &bits[..SCI1_INFO_BITS];
        let computed = Self::crc_remainder(info);
        let received = BitReader::new(&bits[SCI1_INFO_BITS..])
            .read(SCI_CRC_BITS)
            .unwrap_or_default() as u16;
        if received ^ self.crc_mask != computed {
            return Err(SciError::CrcMismatch { computed, received });
        }

        let mut reader = BitReader::new(info);
        let mut field = |n: usize| reader.read(n).unwrap_or_default();
        let priority = field(3) as u8;
        let resource_reservation = field(4) as u8;
        let riv = field(self.pool.riv_bits());
        let time_gap = field(4) as u8;
        let mcs_idx = field(5) as u8;
        let rti = field(1) as u8;

        let (num_subchannels, start_subchannel) = self.pool.decode_riv(riv).ok_or(SciError::InvalidRiv(riv))?;
        let mcs = McsDescriptor::new(mcs_idx, self.pool.pssch_nof_prb(num_subchannels))
            .ok_or(SciError::InvalidMcs(mcs_idx))?;

        let msg = SciMessage {
            priority,
            resource_reservation,
            num_subchannels,
            start_subchannel,
            time_gap,
            rti,
            mcs,
        };
        trace!("SCI decoded: {:?} n_X_ID={:#06x}", msg, computed);

        Ok(SciDecode { msg, crc_remainder: computed })
    }
}
