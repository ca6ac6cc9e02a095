//! Least-squares channel estimation on the sidelink DMRS
//!
//! Each DMRS symbol yields a per-subcarrier LS estimate; the estimates are
//! averaged over the four DMRS symbols and the spread between them gives the
//! noise variance.

use super::primitives::{ChannelEstimate, ChannelEstimator};
use super::resource_grid::{extract_dmrs, nof_dmrs_re, DMRS_SYMBOLS};
use super::sequence::pilot_sequence;
use crate::LayerError;
use common::types::SUBCARRIERS_PER_PRB;
use interfaces::SubframeGrid;
use num_complex::Complex32;
use std::ops::Range;
use tracing::trace;

pub struct PilotChannelEstimator {
    /// Lower bound on the reported noise variance
    pub noise_floor: f32,
}

impl Default for PilotChannelEstimator {
    fn default() -> Self {
        Self { noise_floor: 1e-6 }
    }
}

impl ChannelEstimator for PilotChannelEstimator {
    fn estimate(
        &self,
        grid: &SubframeGrid,
        prbs: &Range<u32>,
        dmrs_c_init: u32,
    ) -> Result<ChannelEstimate, LayerError> {
        let n_prb = (prbs.end - prbs.start) as usize;
        let n_sc = n_prb * SUBCARRIERS_PER_PRB;
        let rx = extract_dmrs(grid, prbs)?;
        let pilots = pilot_sequence(dmrs_c_init, nof_dmrs_re(n_prb));

        // LS estimate per (symbol, subcarrier); pilots have unit magnitude
        let ls: Vec<Complex32> = rx.iter().zip(pilots.iter()).map(|(y, p)| y * p.conj()).collect();

        let nof_symbols = DMRS_SYMBOLS.len();
        let mut ce = vec![Complex32::new(0.0, 0.0); n_sc];
        for s in 0..nof_symbols {
            for k in 0..n_sc {
                ce[k] += ls[s * n_sc + k];
            }
        }
        ce.iter_mut().for_each(|h| *h /= nof_symbols as f32);

        let mut spread = 0.0f32;
        for s in 0..nof_symbols {
            for k in 0..n_sc {
                spread += (ls[s * n_sc + k] - ce[k]).norm_sqr();
            }
        }
        let noise_estimate = (spread / (n_sc * (nof_symbols - 1)) as f32).max(self.noise_floor);
        let rsrp = ce.iter().map(|h| h.norm_sqr()).sum::<f32>() / n_sc as f32;

        trace!("Channel estimate on PRB {:?}: rsrp {:.3} noise {:.5}", prbs, rsrp, noise_estimate);

        Ok(ChannelEstimate { ce, noise_estimate, rsrp })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::resource_grid::map_dmrs;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_flat_channel() {
        let mut grid = SubframeGrid::new(10, 0);
        let prbs = 2..4;
        let pilots = pilot_sequence(1234, nof_dmrs_re(2));
        map_dmrs(&mut grid, &prbs, &pilots).unwrap();
        let gain = Complex32::from_polar(0.5, 1.0);
        grid.apply_gain(gain);

        let est = PilotChannelEstimator::default().estimate(&grid, &prbs, 1234).unwrap();
        assert_eq!(est.ce.len(), 24);
        for h in &est.ce {
            assert!((h - gain).norm() < 1e-4);
        }
        assert!((est.rsrp - 0.25).abs() < 1e-4);
        assert_eq!(est.noise_estimate, 1e-6);
    }

    #[test]
    fn test_noise_estimate() {
        let mut grid = SubframeGrid::new(10, 0);
        let prbs = 0..10;
        map_dmrs(&mut grid, &prbs, &pilot_sequence(99, nof_dmrs_re(10))).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        // Noise variance 2 * 0.1^2
        grid.add_noise(&mut rng, 0.1);

        let est = PilotChannelEstimator::default().estimate(&grid, &prbs, 99).unwrap();
        assert!((est.noise_estimate - 0.02).abs() < 0.005, "noise {}", est.noise_estimate);
        assert!(est.snr_db() > 14.0);
    }

    #[test]
    fn test_wrong_pilots_give_no_channel() {
        let mut grid = SubframeGrid::new(4, 0);
        map_dmrs(&mut grid, &(0..4), &pilot_sequence(1, nof_dmrs_re(4))).unwrap();
        let est = PilotChannelEstimator::default().estimate(&grid, &(0..4), 2).unwrap();
        // Mismatched pilots decorrelate: little coherent energy survives the averaging
        assert!(est.rsrp < 0.5);
    }
}
