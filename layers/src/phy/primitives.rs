//! Signal processing primitives consumed by the sidelink procedures
//!
//! Channel estimation, (de)modulation and channel coding sit behind these
//! traits; the procedures in this crate only rely on the stated input/output
//! lengths. Soft bits follow the usual convention: positive values favour 0.

use super::softbuffer::SoftBuffer;
use super::{chest::PilotChannelEstimator, coding::RepetitionCodec, modem::QamModem};
use crate::LayerError;
use bytes::Bytes;
use common::types::ModulationScheme;
use interfaces::SubframeGrid;
use num_complex::Complex32;
use std::ops::Range;
use std::sync::Arc;

/// Channel estimate over one PRB range
#[derive(Debug, Clone)]
pub struct ChannelEstimate {
    /// Estimate per subcarrier of the range
    pub ce: Vec<Complex32>,
    /// Noise variance per resource element
    pub noise_estimate: f32,
    /// Mean received pilot power
    pub rsrp: f32,
}

impl ChannelEstimate {
    /// Signal to noise ratio in dB
    pub fn snr_db(&self) -> f32 {
        10.0 * (self.rsrp / self.noise_estimate.max(1e-9)).log10()
    }
}

/// Result of one transport block decode attempt
#[derive(Debug, Clone)]
pub struct DecodedTb {
    /// Hard-decided transport block (without CRC)
    pub data: Bytes,
    pub crc_ok: bool,
}

/// Pilot based channel estimation
pub trait ChannelEstimator: Send + Sync {
    /// Estimate the channel on `prbs` from pilots generated with `dmrs_c_init`
    fn estimate(
        &self,
        grid: &SubframeGrid,
        prbs: &Range<u32>,
        dmrs_c_init: u32,
    ) -> Result<ChannelEstimate, LayerError>;
}

/// Symbol mapping and soft demapping
pub trait Modem: Send + Sync {
    /// Map `bits` (length a multiple of the modulation order) onto symbols
    fn modulate(&self, bits: &[u8], modulation: ModulationScheme) -> Vec<Complex32>;

    /// Equalise `symbols` (frequency first over the estimate's subcarriers) and
    /// return one soft value per bit
    fn demodulate(
        &self,
        symbols: &[Complex32],
        ce: &ChannelEstimate,
        modulation: ModulationScheme,
    ) -> Vec<f32>;
}

/// Forward error correction for control and data channels
pub trait ChannelCodec: Send + Sync {
    /// Encode control information bits into `nof_coded_bits`
    fn encode_control(&self, bits: &[u8], nof_coded_bits: usize) -> Vec<u8>;

    /// Decode `nof_bits` control information bits from soft values
    fn decode_control(&self, llr: &[f32], nof_bits: usize) -> Vec<u8>;

    /// Attach the CRC to a `tbs` bit transport block and rate match to `nof_coded_bits`
    fn encode_data(&self, payload: &[u8], tbs: u32, rv: u8, nof_coded_bits: usize) -> Result<Vec<u8>, LayerError>;

    /// Combine soft values into `softbuffer` and decode its content
    fn decode_data(&self, llr: &[f32], rv: u8, softbuffer: &mut SoftBuffer) -> Result<DecodedTb, LayerError>;
}

/// Primitive implementations used by one PHY instance
#[derive(Clone)]
pub struct PhyPrimitives {
    pub estimator: Arc<dyn ChannelEstimator>,
    pub modem: Arc<dyn Modem>,
    pub codec: Arc<dyn ChannelCodec>,
}

impl PhyPrimitives {
    /// Built-in least-squares estimator, QAM modem and repetition codec
    pub fn reference() -> Self {
        Self {
            estimator: Arc::new(PilotChannelEstimator::default()),
            modem: Arc::new(QamModem),
            codec: Arc::new(RepetitionCodec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snr() {
        let ce = ChannelEstimate { ce: vec![], noise_estimate: 0.01, rsrp: 1.0 };
        assert!((ce.snr_db() - 20.0).abs() < 1e-3);
    }
}
