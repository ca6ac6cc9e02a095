//! Common Types for the Sidelink UE
//!
//! Defines fundamental types shared by the PHY, MAC and RF interface crates

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};
use std::fmt;

/// Number of subframes in one hyper-frame period (1024 frames of 10 subframes)
pub const TTI_PERIOD: u32 = 10240;

/// Subcarriers per physical resource block
pub const SUBCARRIERS_PER_PRB: usize = 12;

/// OFDM/SC-FDMA symbols per subframe (normal cyclic prefix)
pub const SYMBOLS_PER_SUBFRAME: usize = 14;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// System information RNTI
    pub const SI: Self = Self(0xFFFF);

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }
}

/// Transmission time interval index within the hyper-frame (0..10240)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tti(pub u32);

impl Tti {
    /// Map an absolute tick counter onto the hyper-frame
    pub fn from_tick(tick: u64) -> Self {
        Self((tick % TTI_PERIOD as u64) as u32)
    }

    /// TTI `n` subframes later, wrapping at the hyper-frame boundary
    pub fn add(self, n: u32) -> Self {
        Self((self.0 + n % TTI_PERIOD) % TTI_PERIOD)
    }

    /// System frame number
    pub fn sfn(&self) -> u32 {
        self.0 / 10
    }

    /// Subframe number within the frame
    pub fn subframe(&self) -> u32 {
        self.0 % 10
    }
}

impl fmt::Display for Tti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sfn(), self.subframe())
    }
}

/// Modulation scheme, valued by bits per symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum ModulationScheme {
    /// QPSK
    Qpsk = 2,
    /// 16-QAM
    Qam16 = 4,
    /// 64-QAM
    Qam64 = 6,
}

impl ModulationScheme {
    /// Modulation order Qm
    pub fn bits_per_symbol(&self) -> usize {
        *self as usize
    }
}

/// LTE channel bandwidth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bandwidth {
    /// 1.4 MHz
    Bw1_4,
    /// 3 MHz
    Bw3,
    /// 5 MHz
    Bw5,
    /// 10 MHz
    Bw10,
    /// 15 MHz
    Bw15,
    /// 20 MHz
    Bw20,
}

impl Bandwidth {
    /// Parse a bandwidth given in MHz
    pub fn from_mhz(mhz: f32) -> Option<Self> {
        match (mhz * 10.0).round() as u32 {
            14 => Some(Bandwidth::Bw1_4),
            30 => Some(Bandwidth::Bw3),
            50 => Some(Bandwidth::Bw5),
            100 => Some(Bandwidth::Bw10),
            150 => Some(Bandwidth::Bw15),
            200 => Some(Bandwidth::Bw20),
            _ => None,
        }
    }

    /// Number of PRBs in the transmission bandwidth
    pub fn nof_prb(&self) -> usize {
        match self {
            Bandwidth::Bw1_4 => 6,
            Bandwidth::Bw3 => 15,
            Bandwidth::Bw5 => 25,
            Bandwidth::Bw10 => 50,
            Bandwidth::Bw15 => 75,
            Bandwidth::Bw20 => 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_tti_wrap() {
        let tti = Tti::from_tick(10245);
        assert_eq!(tti, Tti(5));
        assert_eq!(Tti(10238).add(4), Tti(2));
        assert_eq!(Tti(1234).to_string(), "123.4");
    }

    #[test]
    fn test_bandwidth_conversion() {
        assert_eq!(Bandwidth::from_mhz(10.0), Some(Bandwidth::Bw10));
        assert_eq!(Bandwidth::from_mhz(1.4).map(|bw| bw.nof_prb()), Some(6));
        assert_eq!(Bandwidth::from_mhz(7.0), None);
    }

    #[test]
    fn test_modulation_order() {
        assert_eq!(ModulationScheme::from_u8(4), Some(ModulationScheme::Qam16));
        assert_eq!(ModulationScheme::Qam64.bits_per_symbol(), 6);
        assert!(ModulationScheme::from_u8(3).is_none());
    }
}
