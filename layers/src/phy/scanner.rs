//! Blind PSCCH search
//!
//! Every subchannel of the pool is a PSCCH candidate. Candidates are tried in
//! ascending order and the first SCI that decodes and points back at the
//! subchannel it was found on is taken.

use super::pscch::PscchProcessor;
use super::sci::{SciCodec, SciError, SciMessage};
use common::types::Tti;
use interfaces::SubframeGrid;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// A control message found in a subframe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanResult {
    pub msg: SciMessage,
    /// SCI CRC remainder, seeds PSSCH scrambling
    pub scramble_id: u16,
    /// Subchannel the PSCCH was found on
    pub subchannel: u32,
    /// Pool slot ordinal of the subframe
    pub slot: u32,
    pub snr_db: f32,
}

/// Scanner counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub scans: u64,
    pub sci_found: u64,
    /// Valid SCI whose allocation starts on another subchannel
    pub sci_inconsistent: u64,
    pub sci_crc_failed: u64,
}

#[derive(Default)]
struct ScanCounters {
    scans: AtomicU64,
    sci_found: AtomicU64,
    sci_inconsistent: AtomicU64,
    sci_crc_failed: AtomicU64,
}

/// Per-subframe control channel search over one resource pool
pub struct ControlChannelScanner {
    pscch: PscchProcessor,
    codec: SciCodec,
    /// Candidates with a DMRS SNR below this are not decoded
    min_snr_db: f32,
    counters: ScanCounters,
}

impl ControlChannelScanner {
    pub fn new(pscch: PscchProcessor, codec: SciCodec, min_snr_db: f32) -> Self {
        Self {
            pscch,
            codec,
            min_snr_db,
            counters: ScanCounters::default(),
        }
    }

    pub fn codec(&self) -> &SciCodec {
        &self.codec
    }

    /// Search `grid`, received at `tti`, for a control message
    pub fn scan(&self, grid: &SubframeGrid, tti: Tti) -> Option<ScanResult> {
        let pool = self.codec.pool();
        let slot = pool.slot_index(tti)?;
        self.counters.scans.fetch_add(1, Ordering::Relaxed);

        for subchannel in 0..pool.num_subchannels() {
            let candidate = match self.pscch.decode(grid, pool, subchannel) {
                Ok(candidate) => candidate,
                Err(e) => {
                    debug!("PSCCH candidate {} at {}: {}", subchannel, tti, e);
                    continue;
                }
            };
            if candidate.snr_db < self.min_snr_db {
                continue;
            }

            match self.codec.decode(&candidate.bits) {
                Ok(decoded) if decoded.msg.start_subchannel == subchannel => {
                    self.counters.sci_found.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "SCI at {} (slot {}) subchannel {}: L={} mcs={} tbs={} rti={} gap={} snr={:.1} dB",
                        tti,
                        slot,
                        subchannel,
                        decoded.msg.num_subchannels,
                        decoded.msg.mcs.idx,
                        decoded.msg.mcs.tbs,
                        decoded.msg.rti,
                        decoded.msg.time_gap,
                        candidate.snr_db
                    );
                    return Some(ScanResult {
                        msg: decoded.msg,
                        scramble_id: decoded.crc_remainder,
                        subchannel,
                        slot,
                        snr_db: candidate.snr_db,
                    });
                }
                Ok(decoded) => {
                    self.counters.sci_inconsistent.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "SCI on subchannel {} announces start subchannel {}, ignoring",
                        subchannel, decoded.msg.start_subchannel
                    );
                }
                Err(SciError::CrcMismatch { .. }) => {
                    self.counters.sci_crc_failed.fetch_add(1, Ordering::Relaxed);
                    trace!("SCI CRC failed on subchannel {}", subchannel);
                }
                Err(e) => {
                    debug!("SCI on subchannel {} rejected: {}", subchannel, e);
                }
            }
        }

        None
    }

    pub fn stats(&self) -> ScanStats {
        ScanStats {
            scans: self.counters.scans.load(Ordering::Relaxed),
            sci_found: self.counters.sci_found.load(Ordering::Relaxed),
            sci_inconsistent: self.counters.sci_inconsistent.load(Ordering::Relaxed),
            sci_crc_failed: self.counters.sci_crc_failed.load(Ordering::Relaxed),
        }
    }
}
