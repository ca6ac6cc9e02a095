//! Received signal quality
//!
//! Exponential moving averages of the SNR measured on the PSBCH of the sync
//! reference and on the PSSCH of every node of the group. A node is known by
//! the slot it transmits in, `slot % node_count`.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Weight of a new sample in the moving averages
pub const SNR_EMA_COEFF: f32 = 0.1;

/// Moving average of SNR samples in dB
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SnrAverage {
    /// Current average, `None` before the first sample
    pub snr_db: Option<f32>,
    pub samples: u64,
}

impl SnrAverage {
    /// Fold in one sample; the first sample seeds the average
    pub fn update(&mut self, snr_db: f32) {
        if !snr_db.is_finite() {
            return;
        }
        self.snr_db = Some(match self.snr_db {
            Some(avg) => SNR_EMA_COEFF * snr_db + (1.0 - SNR_EMA_COEFF) * avg,
            None => snr_db,
        });
        self.samples += 1;
    }
}

/// Link quality snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    pub psbch: SnrAverage,
    /// PSSCH SNR per transmitting node
    pub pssch: Vec<SnrAverage>,
}

/// Shared link quality tracker
#[derive(Debug)]
pub struct LinkQuality {
    state: Mutex<LinkStats>,
}

impl LinkQuality {
    pub fn new(node_count: u32) -> Self {
        Self {
            state: Mutex::new(LinkStats {
                psbch: SnrAverage::default(),
                pssch: vec![SnrAverage::default(); node_count.max(1) as usize],
            }),
        }
    }

    pub fn update_psbch(&self, snr_db: f32) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).psbch.update(snr_db);
    }

    /// Record the PSSCH SNR of the node owning pool slot `slot`
    pub fn update_pssch(&self, slot: u32, snr_db: f32) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let nof_nodes = state.pssch.len() as u32;
        if let Some(avg) = state.pssch.get_mut((slot % nof_nodes) as usize) {
            avg.update(snr_db);
        }
    }

    pub fn snapshot(&self) -> LinkStats {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_average() {
        let mut avg = SnrAverage::default();
        assert_eq!(avg.snr_db, None);
        avg.update(20.0);
        assert_eq!(avg.snr_db, Some(20.0));
        avg.update(10.0);
        assert!((avg.snr_db.unwrap() - 19.0).abs() < 1e-5);
        avg.update(f32::NEG_INFINITY);
        assert_eq!(avg.samples, 2);
    }

    #[test]
    fn test_pssch_keyed_by_owner() {
        let link = LinkQuality::new(5);
        link.update_pssch(3, 12.0);
        link.update_pssch(8, 2.0);
        link.update_pssch(4089, 30.0);
        link.update_psbch(25.0);

        let stats = link.snapshot();
        assert_eq!(stats.pssch.len(), 5);
        assert_eq!(stats.pssch[3].samples, 2);
        assert!((stats.pssch[3].snr_db.unwrap() - 11.0).abs() < 1e-5);
        assert_eq!(stats.pssch[4].snr_db, Some(30.0));
        assert_eq!(stats.pssch[0].snr_db, None);
        assert_eq!(stats.psbch.snr_db, Some(25.0));
    }
}
