/// PSSCH (Physical Sidelink Shared Channel) implementation
/// Based on 3GPP TS 36.211 Section 9.3 and TS 36.212 Section 5.4.2

use super::primitives::PhyPrimitives;
use super::resource_grid::{extract_data, map_data, map_dmrs, nof_data_re, nof_dmrs_re};
use super::resource_pool::ResourcePool;
use super::sci::SciMessage;
use super::sequence::{descramble_llr, pilot_sequence, pssch_c_init, pssch_dmrs_c_init, scramble_bits};
use crate::LayerError;
use interfaces::SubframeGrid;
use tracing::trace;

/// Subframe number used in the PSSCH scrambling seed
const N_SSF: u32 = 0;

/// Coded bits available to a transmission scheduled by `msg`
pub fn pssch_nof_coded_bits(pool: &ResourcePool, msg: &SciMessage) -> usize {
    nof_data_re(pool.pssch_nof_prb(msg.num_subchannels) as usize) * msg.mcs.modulation.bits_per_symbol()
}

/// Demodulated PSSCH occasion
#[derive(Debug, Clone)]
pub struct PsschSoftBits {
    pub llr: Vec<f32>,
    /// Signal to noise ratio measured on the PSSCH DMRS
    pub snr_db: f32,
}

/// PSSCH processor
#[derive(Clone)]
pub struct PsschProcessor {
    primitives: PhyPrimitives,
}

impl PsschProcessor {
    pub fn new(primitives: PhyPrimitives) -> Self {
        Self { primitives }
    }

    /// Encode `payload` on the PSSCH scheduled by `msg`
    pub fn encode(
        &self,
        grid: &mut SubframeGrid,
        pool: &ResourcePool,
        msg: &SciMessage,
        n_x_id: u16,
        payload: &[u8],
    ) -> Result<(), LayerError> {
        let prbs = pool.pssch_prbs(msg.num_subchannels, msg.start_subchannel);
        let n_prb = (prbs.end - prbs.start) as usize;

        // 1. Transport block CRC, coding and rate matching
        let mut coded = self.primitives.codec.encode_data(
            payload,
            msg.mcs.tbs,
            msg.rv(),
            pssch_nof_coded_bits(pool, msg),
        )?;

        // 2. Scrambling keyed by the SCI CRC
        scramble_bits(&mut coded, pssch_c_init(n_x_id, N_SSF));

        // 3. Modulation and mapping
        let symbols = self.primitives.modem.modulate(&coded, msg.mcs.modulation);
        map_data(grid, &prbs, &symbols)?;

        // 4. DMRS
        map_dmrs(grid, &prbs, &pilot_sequence(pssch_dmrs_c_init(n_x_id), nof_dmrs_re(n_prb)))?;

        trace!(
            "PSSCH PRB {:?} tbs={} mcs={} rv={} n_X_ID={:#06x}",
            prbs,
            msg.mcs.tbs,
            msg.mcs.idx,
            msg.rv(),
            n_x_id
        );
        Ok(())
    }

    /// Descrambled soft bits of the PSSCH scheduled by `msg`
    pub fn demodulate(
        &self,
        grid: &SubframeGrid,
        pool: &ResourcePool,
        msg: &SciMessage,
        n_x_id: u16,
    ) -> Result<PsschSoftBits, LayerError> {
        let prbs = pool.pssch_prbs(msg.num_subchannels, msg.start_subchannel);

        let ce = self.primitives.estimator.estimate(grid, &prbs, pssch_dmrs_c_init(n_x_id))?;
        let symbols = extract_data(grid, &prbs)?;
        let mut llr = self.primitives.modem.demodulate(&symbols, &ce, msg.mcs.modulation);
        descramble_llr(&mut llr, pssch_c_init(n_x_id, N_SSF));

        let snr_db = ce.snr_db();
        trace!("PSSCH PRB {:?}: {} soft bits, snr {:.1} dB", prbs, llr.len(), snr_db);
        Ok(PsschSoftBits { llr, snr_db })
    }
}
