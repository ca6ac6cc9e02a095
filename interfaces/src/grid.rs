//! Frequency-domain subframe buffer
//!
//! One subframe of resource elements as handed over by (or to) the OFDM /
//! SC-FDMA transform, indexed `[subcarrier, symbol]`.

use common::types::{SUBCARRIERS_PER_PRB, SYMBOLS_PER_SUBFRAME};
use ndarray::{s, Array2, ArrayView1};
use num_complex::Complex32;
use rand::Rng;

/// Resource elements of one subframe
#[derive(Debug, Clone)]
pub struct SubframeGrid {
    /// 2D grid: [subcarriers, symbols]
    grid: Array2<Complex32>,
    /// Number of resource blocks
    nof_prb: usize,
    /// Absolute subframe counter this grid belongs to
    pub tick: u64,
}

impl SubframeGrid {
    /// Create an all-zero grid
    pub fn new(nof_prb: usize, tick: u64) -> Self {
        Self {
            grid: Array2::zeros((nof_prb * SUBCARRIERS_PER_PRB, SYMBOLS_PER_SUBFRAME)),
            nof_prb,
            tick,
        }
    }

    pub fn nof_prb(&self) -> usize {
        self.nof_prb
    }

    pub fn nof_subcarriers(&self) -> usize {
        self.nof_prb * SUBCARRIERS_PER_PRB
    }

    /// Resource element at (subcarrier, symbol)
    pub fn get(&self, subcarrier: usize, symbol: usize) -> Complex32 {
        self.grid[[subcarrier, symbol]]
    }

    /// Set the resource element at (subcarrier, symbol)
    pub fn set(&mut self, subcarrier: usize, symbol: usize, value: Complex32) {
        self.grid[[subcarrier, symbol]] = value;
    }

    /// Contiguous subcarrier range of one symbol
    pub fn symbol_slice(&self, symbol: usize, first_sc: usize, nof_sc: usize) -> ArrayView1<'_, Complex32> {
        self.grid.slice(s![first_sc..first_sc + nof_sc, symbol])
    }

    /// Superimpose another grid of the same dimensions
    pub fn accumulate(&mut self, other: &SubframeGrid) {
        if self.grid.dim() == other.grid.dim() {
            self.grid += &other.grid;
        }
    }

    /// Scale every resource element by a complex gain
    pub fn apply_gain(&mut self, gain: Complex32) {
        self.grid.mapv_inplace(|v| v * gain);
    }

    /// Add complex white Gaussian noise with per-dimension standard deviation `std`
    pub fn add_noise<R: Rng>(&mut self, rng: &mut R, std: f32) {
        if std <= 0.0 {
            return;
        }
        self.grid.mapv_inplace(|v| v + Complex32::new(gaussian(rng) * std, gaussian(rng) * std));
    }

    /// Mean energy per resource element
    pub fn mean_energy(&self) -> f32 {
        let n = self.grid.len().max(1) as f32;
        self.grid.iter().map(|v| v.norm_sqr()).sum::<f32>() / n
    }
}

/// Standard normal sample (Box-Muller)
fn gaussian<R: Rng>(rng: &mut R) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}
