//! PSSCH modulation and coding schemes
//!
//! I_MCS maps onto modulation order and TBS index as for PUSCH
//! (TS 36.213 Table 8.6.1-1). Transport block sizes are derived from a
//! spectral efficiency per TBS index over the PSSCH data resource elements
//! and quantised with the procedure of TS 38.214 Section 5.1.3.2, which keeps
//! the sizes byte aligned and monotonic in both MCS and PRB count.

use super::resource_grid::nof_data_re;
use common::types::ModulationScheme;
use serde::{Deserialize, Serialize};

/// Highest valid MCS index
pub const MAX_MCS: u8 = 28;

/// Spectral efficiency per TBS index, in bits per resource element x 1024
const SPECTRAL_EFFICIENCY_X1024: [u32; 27] = [
    240, 314, 386, 502, 616, 758, 898, 1052, 1204, 1358, 1512, 1696, 1960, 2204, 2476, 2646,
    2850, 3120, 3402, 3696, 3996, 4314, 4632, 4932, 5238, 5454, 5688,
];

/// TS 38.214 Table 5.1.3.2-1
const TBS_TABLE: [u32; 93] = [
    24, 32, 40, 48, 56, 64, 72, 80, 88, 96, 104, 112, 120, 128, 136, 144, 152, 160, 168, 176,
    184, 192, 208, 224, 240, 256, 272, 288, 304, 320, 336, 352, 368, 384, 408, 432, 456, 480,
    504, 528, 552, 576, 608, 640, 672, 704, 736, 768, 808, 848, 888, 928, 984, 1032, 1064, 1128,
    1160, 1192, 1224, 1256, 1288, 1320, 1352, 1416, 1480, 1544, 1608, 1672, 1736, 1800, 1864,
    1928, 2024, 2088, 2152, 2216, 2280, 2408, 2472, 2536, 2600, 2664, 2728, 2792, 2856, 2976,
    3104, 3240, 3368, 3496, 3624, 3752, 3824,
];

/// Modulation, TBS index and resulting transport block size of one transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct McsDescriptor {
    /// MCS index carried in SCI
    pub idx: u8,
    pub modulation: ModulationScheme,
    /// Transport block size in bits
    pub tbs: u32,
}

impl McsDescriptor {
    /// Descriptor for MCS `idx` on `n_prb` PSSCH resource blocks
    pub fn new(idx: u8, n_prb: u32) -> Option<Self> {
        let (modulation, itbs) = mcs_to_itbs(idx)?;
        let tbs = transport_block_size(modulation, itbs, n_prb)?;
        Some(Self { idx, modulation, tbs })
    }

    /// Transport block size in bytes
    pub fn tbs_bytes(&self) -> usize {
        (self.tbs / 8) as usize
    }
}

/// Modulation and TBS index of MCS `idx`
pub fn mcs_to_itbs(idx: u8) -> Option<(ModulationScheme, u8)> {
    match idx {
        0..=10 => Some((ModulationScheme::Qpsk, idx)),
        11..=20 => Some((ModulationScheme::Qam16, idx - 1)),
        21..=28 => Some((ModulationScheme::Qam64, idx - 2)),
        _ => None,
    }
}

/// Transport block size in bits for TBS index `itbs` over `n_prb` resource blocks
pub fn transport_block_size(modulation: ModulationScheme, itbs: u8, n_prb: u32) -> Option<u32> {
    let se = *SPECTRAL_EFFICIENCY_X1024.get(itbs as usize)? as f64 / 1024.0;
    let n_re = nof_data_re(n_prb as usize) as f64;
    if n_re == 0.0 {
        return None;
    }

    let n_info = n_re * se;
    let code_rate = se / modulation.bits_per_symbol() as f64;

    if n_info <= 3824.0 {
        let n = ((n_info.log2().floor() as i32) - 6).max(3);
        let step = 2f64.powi(n);
        let n_info_q = (step * (n_info / step).floor()).max(24.0) as u32;
        TBS_TABLE.iter().copied().find(|&tbs| tbs >= n_info_q)
    } else {
        let n = ((n_info - 24.0).log2().floor() as i32) - 5;
        let step = 2f64.powi(n);
        let n_info_q = (step * ((n_info - 24.0) / step).round()).max(3840.0);
        let with_crc = n_info_q + 24.0;

        let tbs = if code_rate <= 0.25 {
            let c = (with_crc / 3816.0).ceil();
            8.0 * c * (with_crc / (8.0 * c)).ceil() - 24.0
        } else if n_info_q > 8424.0 {
            let c = (with_crc / 8424.0).ceil();
            8.0 * c * (with_crc / (8.0 * c)).ceil() - 24.0
        } else {
            8.0 * (with_crc / 8.0).ceil() - 24.0
        };
        Some(tbs as u32)
    }
}
