//! Sidelink synchronisation subframe (TS 36.211 Sections 9.6 and 9.7)
//!
//! A synchronisation reference sends the PSSS, the SSSS and the PSBCH on the
//! six PRBs around the carrier centre. The PSBCH carries the MIB-SL-V2X
//! (TS 36.331 Section 6.5.2):
//!
//! | field                  | bits |
//! |------------------------|------|
//! | sl-Bandwidth           | 3    |
//! | tdd-ConfigSL           | 3    |
//! | directFrameNumber      | 10   |
//! | directSubframeNumber   | 4    |
//! | inCoverage             | 1    |
//! | reserved (zero)        | 27   |
//!
//! followed by a 16-bit CRC.

use super::primitives::PhyPrimitives;
use super::resource_grid::{extract_psbch, map_dmrs, map_psbch, nof_dmrs_re, nof_psbch_re, PSSS_SYMBOLS, SSSS_SYMBOLS};
use super::sequence::{
    descramble_llr, pilot_sequence, psbch_c_init, psbch_dmrs_c_init, psss_root, psss_sequence, scramble_bits,
    ssss_sequence, NOF_SL_IDS, SLSS_LEN,
};
use crate::LayerError;
use common::types::{Bandwidth, ModulationScheme, Tti, SUBCARRIERS_PER_PRB};
use common::utils::{append_bits, crc16_bits, BitReader};
use interfaces::SubframeGrid;
use num_complex::Complex32;
use std::ops::Range;
use tracing::{debug, trace};

/// PRBs occupied by a synchronisation subframe
pub const SLSS_NOF_PRB: u32 = 6;

/// MIB-SL-V2X information bits
pub const MIB_SL_BITS: usize = 48;

const MIB_SL_CRC_BITS: usize = 16;

/// MIB-SL-V2X length including CRC
pub const MIB_SL_LEN: usize = MIB_SL_BITS + MIB_SL_CRC_BITS;

/// Coded bits carried by the PSBCH (QPSK over the central six PRBs)
pub const PSBCH_NOF_CODED_BITS: usize = nof_psbch_re(SLSS_NOF_PRB as usize) * 2;

/// Normalised PSSS correlation needed to declare a sync signal present
pub const PSSS_DETECT_THRESHOLD: f32 = 0.6;

/// First sync sequence subcarrier within the central 72
const SLSS_SC_OFFSET: usize = 5;

/// Decoded or to-be-transmitted MIB-SL-V2X
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MibSl {
    pub bandwidth: Bandwidth,
    /// Direct frame number (0..1024)
    pub dfn: u16,
    /// Direct subframe number (0..10)
    pub dsfn: u8,
    pub in_coverage: bool,
}

impl MibSl {
    /// MIB announcing `tti` on a carrier of `bandwidth`
    pub fn new(bandwidth: Bandwidth, tti: Tti) -> Self {
        Self {
            bandwidth,
            dfn: tti.sfn() as u16,
            dsfn: tti.subframe() as u8,
            in_coverage: false,
        }
    }

    /// TTI the sender was on, 10 * DFN + DSFN
    pub fn tti(&self) -> Tti {
        Tti(self.dfn as u32 * 10 + self.dsfn as u32)
    }

    /// Information bits followed by the CRC
    pub fn pack(&self) -> Result<Vec<u8>, LayerError> {
        if self.dfn >= 1024 || self.dsfn >= 10 {
            return Err(LayerError::InvalidPdu);
        }

        let mut bits = Vec::with_capacity(MIB_SL_LEN);
        append_bits(&mut bits, bandwidth_code(self.bandwidth), 3);
        append_bits(&mut bits, 0, 3);
        append_bits(&mut bits, self.dfn as u32, 10);
        append_bits(&mut bits, self.dsfn as u32, 4);
        append_bits(&mut bits, self.in_coverage as u32, 1);
        bits.resize(MIB_SL_BITS, 0);

        let crc = crc16_bits(&bits);
        append_bits(&mut bits, crc as u32, MIB_SL_CRC_BITS);
        Ok(bits)
    }

    /// Check the CRC and unpack; `None` on a CRC or field error
    pub fn unpack(bits: &[u8]) -> Option<Self> {
        if bits.len() != MIB_SL_LEN {
            return None;
        }
        let received = BitReader::new(&bits[MIB_SL_BITS..]).read(MIB_SL_CRC_BITS)? as u16;
        if crc16_bits(&bits[..MIB_SL_BITS]) != received {
            return None;
        }

        let mut reader = BitReader::new(&bits[..MIB_SL_BITS]);
        let bandwidth = bandwidth_from_code(reader.read(3)?)?;
        let _tdd_config = reader.read(3)?;
        let dfn = reader.read(10)? as u16;
        let dsfn = reader.read(4)? as u8;
        let in_coverage = reader.read(1)? == 1;
        if dsfn >= 10 {
            return None;
        }
        Some(Self { bandwidth, dfn, dsfn, in_coverage })
    }
}

fn bandwidth_code(bandwidth: Bandwidth) -> u32 {
    match bandwidth {
        Bandwidth::Bw1_4 => 0,
        Bandwidth::Bw3 => 1,
        Bandwidth::Bw5 => 2,
        Bandwidth::Bw10 => 3,
        Bandwidth::Bw15 => 4,
        Bandwidth::Bw20 => 5,
    }
}

fn bandwidth_from_code(code: u32) -> Option<Bandwidth> {
    match code {
        0 => Some(Bandwidth::Bw1_4),
        1 => Some(Bandwidth::Bw3),
        2 => Some(Bandwidth::Bw5),
        3 => Some(Bandwidth::Bw10),
        4 => Some(Bandwidth::Bw15),
        5 => Some(Bandwidth::Bw20),
        _ => None,
    }
}

/// Bandwidth whose transmission bandwidth is `nof_prb`
pub fn bandwidth_of(nof_prb: usize) -> Option<Bandwidth> {
    (0..6).filter_map(bandwidth_from_code).find(|bw| bw.nof_prb() == nof_prb)
}

/// A sync signal found in a subframe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncDetection {
    pub sync_id: u16,
    /// Normalised PSSS correlation (0..=1)
    pub psss_peak: f32,
    /// Signal to noise ratio measured on the PSBCH DMRS
    pub snr_db: f32,
    /// `None` when the PSBCH did not decode
    pub mib: Option<MibSl>,
}

/// Central PRBs of a carrier of `nof_prb`
fn central_prbs(nof_prb: usize) -> Result<Range<u32>, LayerError> {
    if nof_prb < SLSS_NOF_PRB as usize {
        return Err(LayerError::InvalidConfiguration(format!(
            "{} PRB carrier cannot hold a sync subframe",
            nof_prb
        )));
    }
    let start = (nof_prb as u32 - SLSS_NOF_PRB) / 2;
    Ok(start..start + SLSS_NOF_PRB)
}

/// Normalised correlation of `sequence` against the sync subcarriers of `symbols`
fn correlate(grid: &SubframeGrid, first_sc: usize, symbols: &[usize], sequence: &[Complex32]) -> f32 {
    let mut metric = 0.0;
    for &l in symbols {
        let rx = grid.symbol_slice(l, first_sc, SLSS_LEN);
        let energy: f32 = rx.iter().map(|y| y.norm_sqr()).sum();
        if energy <= 0.0 {
            continue;
        }
        let corr: Complex32 = rx.iter().zip(sequence).map(|(y, s)| y * s.conj()).sum();
        metric += corr.norm_sqr() / (energy * SLSS_LEN as f32);
    }
    metric / symbols.len() as f32
}

/// PSSS/SSSS and PSBCH processor
#[derive(Clone)]
pub struct PsbchProcessor {
    primitives: PhyPrimitives,
}

impl PsbchProcessor {
    pub fn new(primitives: PhyPrimitives) -> Self {
        Self { primitives }
    }

    /// Fill the central PRBs of `grid` with the sync signals of `sync_id` and `mib`
    pub fn encode(&self, grid: &mut SubframeGrid, mib: &MibSl, sync_id: u16) -> Result<(), LayerError> {
        if sync_id >= NOF_SL_IDS {
            return Err(LayerError::InvalidConfiguration(format!("sync id {} out of range", sync_id)));
        }
        let prbs = central_prbs(grid.nof_prb())?;
        let first_sc = prbs.start as usize * SUBCARRIERS_PER_PRB + SLSS_SC_OFFSET;

        // 1. PSSS and SSSS
        let psss = psss_sequence(psss_root(sync_id));
        let ssss = ssss_sequence(sync_id);
        for (symbols, sequence) in [(&PSSS_SYMBOLS, &psss), (&SSSS_SYMBOLS, &ssss)] {
            for &l in symbols.iter() {
                for (k, &v) in sequence.iter().enumerate() {
                    grid.set(first_sc + k, l, v);
                }
            }
        }

        // 2. Channel coding and scrambling
        let mut coded = self.primitives.codec.encode_control(&mib.pack()?, PSBCH_NOF_CODED_BITS);
        scramble_bits(&mut coded, psbch_c_init(sync_id));

        // 3. Modulation and mapping
        let symbols = self.primitives.modem.modulate(&coded, ModulationScheme::Qpsk);
        map_psbch(grid, &prbs, &symbols)?;

        // 4. DMRS
        map_dmrs(
            grid,
            &prbs,
            &pilot_sequence(psbch_dmrs_c_init(sync_id), nof_dmrs_re(SLSS_NOF_PRB as usize)),
        )?;

        trace!("Sync subframe id {} DFN {} DSFN {} on PRB {:?}", sync_id, mib.dfn, mib.dsfn, prbs);
        Ok(())
    }

    /// Search `grid` for a sync signal and decode its PSBCH
    pub fn decode(&self, grid: &SubframeGrid) -> Result<Option<SyncDetection>, LayerError> {
        let prbs = central_prbs(grid.nof_prb())?;
        let first_sc = prbs.start as usize * SUBCARRIERS_PER_PRB + SLSS_SC_OFFSET;

        // 1. PSSS root
        let (group, psss_peak) = [0u16, NOF_SL_IDS / 2]
            .into_iter()
            .map(|first_id| {
                let peak = correlate(grid, first_sc, &PSSS_SYMBOLS, &psss_sequence(psss_root(first_id)));
                (first_id, peak)
            })
            .fold((0, 0.0f32), |best, c| if c.1 > best.1 { c } else { best });
        if psss_peak < PSSS_DETECT_THRESHOLD {
            trace!("No PSSS (peak {:.2})", psss_peak);
            return Ok(None);
        }

        // 2. SSSS identity within the group
        let (sync_id, ssss_peak) = (group..group + NOF_SL_IDS / 2)
            .map(|id| (id, correlate(grid, first_sc, &SSSS_SYMBOLS, &ssss_sequence(id))))
            .fold((group, 0.0f32), |best, c| if c.1 > best.1 { c } else { best });

        // 3. PSBCH
        let ce = self.primitives.estimator.estimate(grid, &prbs, psbch_dmrs_c_init(sync_id))?;
        let symbols = extract_psbch(grid, &prbs)?;
        let mut llr = self.primitives.modem.demodulate(&symbols, &ce, ModulationScheme::Qpsk);
        descramble_llr(&mut llr, psbch_c_init(sync_id));
        let mib = MibSl::unpack(&self.primitives.codec.decode_control(&llr, MIB_SL_LEN));

        debug!(
            "Sync id {} (PSSS {:.2}, SSSS {:.2}) snr {:.1} dB, MIB {:?}",
            sync_id,
            psss_peak,
            ssss_peak,
            ce.snr_db(),
            mib
        );
        Ok(Some(SyncDetection {
            sync_id,
            psss_peak,
            snr_db: ce.snr_db(),
            mib,
        }))
    }
}
