//! Pseudo-random sequences (3GPP TS 36.211 Section 7.2)
//!
//! Length-31 Gold sequence used for PSCCH/PSSCH/PSBCH scrambling and for the
//! reference signal pilots of the simplified DMRS, plus the sidelink
//! synchronisation sequences (Section 9.7).

use num_complex::Complex32;

/// PSCCH scrambling initialisation (TS 36.211 Section 9.4.2)
pub const PSCCH_C_INIT: u32 = 510;

/// PSCCH DMRS pilot initialisation
pub const PSCCH_DMRS_C_INIT: u32 = 511;

/// PSSCH scrambling initialisation, c_init = n_X_ID * 2^14 + n_ssf * 2^9 + 510
pub fn pssch_c_init(n_x_id: u16, n_ssf: u32) -> u32 {
    ((n_x_id as u32) << 14) + ((n_ssf & 0x1F) << 9) + 510
}

/// PSSCH DMRS pilot initialisation, keyed by the SCI checksum like the data scrambling
pub fn pssch_dmrs_c_init(n_x_id: u16) -> u32 {
    ((n_x_id as u32) << 14) + 511
}

/// Length of the sidelink synchronisation sequences
pub const SLSS_LEN: usize = 62;

/// Number of sidelink synchronisation identities N_SL_ID
pub const NOF_SL_IDS: u16 = 336;

/// PSSS root index for `sync_id` (TS 36.211 Section 9.7.1.1)
pub fn psss_root(sync_id: u16) -> u32 {
    if sync_id < NOF_SL_IDS / 2 {
        26
    } else {
        37
    }
}

/// Length-63 Zadoff-Chu sequence of `root` with the centre element punctured
pub fn psss_sequence(root: u32) -> Vec<Complex32> {
    (0..SLSS_LEN as u64)
        .map(|n| {
            let m = if n < 31 { n * (n + 1) } else { (n + 1) * (n + 2) };
            let phase = -std::f64::consts::PI * ((root as u64 * m) % 126) as f64 / 63.0;
            Complex32::new(phase.cos() as f32, phase.sin() as f32)
        })
        .collect()
}

/// SSSS of `sync_id`; Gold sequence pilots in place of the interleaved m-sequences
pub fn ssss_sequence(sync_id: u16) -> Vec<Complex32> {
    pilot_sequence(((sync_id as u32) << 14) + 509, SLSS_LEN)
}

/// PSBCH scrambling initialisation, c_init = N_SL_ID
pub fn psbch_c_init(sync_id: u16) -> u32 {
    sync_id as u32
}

/// PSBCH DMRS pilot initialisation
pub fn psbch_dmrs_c_init(sync_id: u16) -> u32 {
    ((sync_id as u32) << 14) + 508
}

/// Gold sequence generator
pub struct GoldSequence {
    /// LFSR states
    x1: u32,
    x2: u32,
}

impl GoldSequence {
    /// Create a generator with initialisation value `c_init`
    pub fn new(c_init: u32) -> Self {
        let mut seq = Self {
            x1: 1,
            x2: c_init & 0x7FFFFFFF,
        };

        // Nc = 1600
        for _ in 0..1600 {
            seq.advance();
        }

        seq
    }

    fn advance(&mut self) {
        // x1(n+31) = (x1(n+3) + x1(n)) mod 2
        let x1_new = ((self.x1 >> 3) ^ self.x1) & 1;
        self.x1 = ((self.x1 >> 1) | (x1_new << 30)) & 0x7FFFFFFF;

        // x2(n+31) = (x2(n+3) + x2(n+2) + x2(n+1) + x2(n)) mod 2
        let x2_new = ((self.x2 >> 3) ^ (self.x2 >> 2) ^ (self.x2 >> 1) ^ self.x2) & 1;
        self.x2 = ((self.x2 >> 1) | (x2_new << 30)) & 0x7FFFFFFF;
    }

    /// Next bit c(n)
    pub fn next_bit(&mut self) -> u8 {
        let c = (self.x1 ^ self.x2) & 1;
        self.advance();
        c as u8
    }

    /// Next unit-energy QPSK symbol
    pub fn next_qpsk_symbol(&mut self) -> Complex32 {
        let amplitude = std::f32::consts::FRAC_1_SQRT_2;
        let c0 = self.next_bit();
        let c1 = self.next_bit();

        Complex32::new(
            amplitude * (1.0 - 2.0 * c0 as f32),
            amplitude * (1.0 - 2.0 * c1 as f32),
        )
    }
}

/// XOR `bits` in place with the sequence for `c_init`
pub fn scramble_bits(bits: &mut [u8], c_init: u32) {
    let mut seq = GoldSequence::new(c_init);
    for bit in bits.iter_mut() {
        *bit ^= seq.next_bit();
    }
}

/// Flip soft bits where the sequence for `c_init` is one
pub fn descramble_llr(llr: &mut [f32], c_init: u32) {
    let mut seq = GoldSequence::new(c_init);
    for value in llr.iter_mut() {
        if seq.next_bit() == 1 {
            *value = -*value;
        }
    }
}

/// `len` QPSK pilot symbols for `c_init`
pub fn pilot_sequence(c_init: u32, len: usize) -> Vec<Complex32> {
    let mut seq = GoldSequence::new(c_init);
    (0..len).map(|_| seq.next_qpsk_symbol()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_prefix() {
        // c_init = 0 leaves x2 at zero, so the output is the x1 m-sequence after 1600 steps
        let mut a = GoldSequence::new(0);
        let mut b = GoldSequence::new(0);
        let first: Vec<u8> = (0..32).map(|_| a.next_bit()).collect();
        let again: Vec<u8> = (0..32).map(|_| b.next_bit()).collect();
        assert_eq!(first, again);
        assert!(first.iter().any(|&bit| bit == 1));
    }

    #[test]
    fn test_scrambling_is_involution() {
        let original: Vec<u8> = (0..100).map(|i| (i % 3 == 0) as u8).collect();
        let mut bits = original.clone();
        scramble_bits(&mut bits, pssch_c_init(0xBEEF, 0));
        assert_ne!(bits, original);
        scramble_bits(&mut bits, pssch_c_init(0xBEEF, 0));
        assert_eq!(bits, original);
    }

    #[test]
    fn test_descramble_matches_scramble() {
        let mut bits = vec![0u8; 64];
        scramble_bits(&mut bits, PSCCH_C_INIT);
        // Bit 0 maps to +1, so a scrambled all-zero word yields the sequence as signs
        let mut llr: Vec<f32> = bits.iter().map(|&b| if b == 0 { 1.0 } else { -1.0 }).collect();
        descramble_llr(&mut llr, PSCCH_C_INIT);
        assert!(llr.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_pilots_unit_energy() {
        let pilots = pilot_sequence(pssch_dmrs_c_init(7), 48);
        assert_eq!(pilots.len(), 48);
        for p in pilots {
            assert!((p.norm() - 1.0).abs() < 1e-6);
        }
        assert_ne!(pilot_sequence(1, 16), pilot_sequence(2, 16));
    }

    fn correlation(a: &[Complex32], b: &[Complex32]) -> f32 {
        let cross: Complex32 = a.iter().zip(b).map(|(x, y)| x * y.conj()).sum();
        cross.norm() / a.len() as f32
    }

    #[test]
    fn test_sync_sequences() {
        let psss = psss_sequence(psss_root(0));
        assert_eq!(psss.len(), SLSS_LEN);
        assert!(psss.iter().all(|d| (d.norm() - 1.0).abs() < 1e-5));
        assert!((psss[0] - Complex32::new(1.0, 0.0)).norm() < 1e-6);
        assert_eq!(psss_root(167), 26);
        assert_eq!(psss_root(168), 37);

        // The two roots and neighbouring SSSS identities are far apart
        assert!(correlation(&psss, &psss_sequence(37)) < 0.5);
        assert!(correlation(&ssss_sequence(3), &ssss_sequence(4)) < 0.5);
        assert!((correlation(&ssss_sequence(3), &ssss_sequence(3)) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_pssch_c_init() {
        assert_eq!(pssch_c_init(0, 0), 510);
        assert_eq!(pssch_c_init(1, 1), (1 << 14) + (1 << 9) + 510);
    }
}
