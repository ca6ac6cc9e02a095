/// PSCCH (Physical Sidelink Control Channel) implementation
/// Based on 3GPP TS 36.211 Section 9.4 and TS 36.212 Section 5.4.3

use super::primitives::PhyPrimitives;
use super::resource_grid::{extract_data, map_data, map_dmrs, nof_data_re, nof_dmrs_re};
use super::resource_pool::{ResourcePool, PSCCH_NOF_PRB};
use super::sci::SCI1_LEN;
use super::sequence::{descramble_llr, pilot_sequence, scramble_bits, PSCCH_C_INIT, PSCCH_DMRS_C_INIT};
use crate::LayerError;
use common::types::ModulationScheme;
use interfaces::SubframeGrid;
use tracing::trace;

/// Coded bits carried by one PSCCH (QPSK over two PRBs)
pub const PSCCH_NOF_CODED_BITS: usize = nof_data_re(PSCCH_NOF_PRB as usize) * 2;

/// Soft demodulated PSCCH candidate
#[derive(Debug, Clone)]
pub struct PscchCandidate {
    /// Hard decided SCI bits
    pub bits: Vec<u8>,
    /// Signal to noise ratio measured on the PSCCH DMRS
    pub snr_db: f32,
}

/// PSCCH processor
#[derive(Clone)]
pub struct PscchProcessor {
    primitives: PhyPrimitives,
}

impl PscchProcessor {
    pub fn new(primitives: PhyPrimitives) -> Self {
        Self { primitives }
    }

    /// Place coded SCI bits on the PSCCH of `start_subchannel`
    pub fn encode(
        &self,
        grid: &mut SubframeGrid,
        pool: &ResourcePool,
        sci_bits: &[u8],
        start_subchannel: u32,
    ) -> Result<(), LayerError> {
        let prbs = pool.pscch_prbs(start_subchannel);

        // 1. Channel coding
        let mut coded = self.primitives.codec.encode_control(sci_bits, PSCCH_NOF_CODED_BITS);

        // 2. Scrambling
        scramble_bits(&mut coded, PSCCH_C_INIT);

        // 3. Modulation and mapping
        let symbols = self.primitives.modem.modulate(&coded, ModulationScheme::Qpsk);
        map_data(grid, &prbs, &symbols)?;

        // 4. DMRS
        map_dmrs(grid, &prbs, &pilot_sequence(PSCCH_DMRS_C_INIT, nof_dmrs_re(PSCCH_NOF_PRB as usize)))?;

        trace!("PSCCH on subchannel {} PRB {:?}", start_subchannel, prbs);
        Ok(())
    }

    /// Demodulate and decode the PSCCH candidate of `subchannel`
    pub fn decode(
        &self,
        grid: &SubframeGrid,
        pool: &ResourcePool,
        subchannel: u32,
    ) -> Result<PscchCandidate, LayerError> {
        let prbs = pool.pscch_prbs(subchannel);

        let ce = self.primitives.estimator.estimate(grid, &prbs, PSCCH_DMRS_C_INIT)?;
        let symbols = extract_data(grid, &prbs)?;
        let mut llr = self.primitives.modem.demodulate(&symbols, &ce, ModulationScheme::Qpsk);
        descramble_llr(&mut llr, PSCCH_C_INIT);

        Ok(PscchCandidate {
            bits: self.primitives.codec.decode_control(&llr, SCI1_LEN),
            snr_db: ce.snr_db(),
        })
    }
}
