//! QAM modulation mapper and max-log soft demapper (TS 36.211 Section 7.1)

use super::primitives::{ChannelEstimate, Modem};
use common::types::ModulationScheme;
use num_complex::Complex32;

/// Gray mapped QPSK / 16QAM / 64QAM
pub struct QamModem;

/// Normalisation factor of each constellation
fn scale(modulation: ModulationScheme) -> f32 {
    match modulation {
        ModulationScheme::Qpsk => 1.0 / 2f32.sqrt(),
        ModulationScheme::Qam16 => 1.0 / 10f32.sqrt(),
        ModulationScheme::Qam64 => 1.0 / 42f32.sqrt(),
    }
}

/// Unnormalised amplitude of one axis for its bits (sign bit first)
fn level(bits: &[u8]) -> f32 {
    let sign = 1.0 - 2.0 * bits[0] as f32;
    let magnitude = match bits.len() {
        1 => 1.0,
        2 => 2.0 - (1.0 - 2.0 * bits[1] as f32),
        _ => 4.0 - (1.0 - 2.0 * bits[1] as f32) * (2.0 - (1.0 - 2.0 * bits[2] as f32)),
    };
    sign * magnitude
}

/// Max-log LLRs of the bits of one axis
fn axis_llr(y: f32, bits_per_axis: usize, scale: f32, noise: f32, out: &mut Vec<f32>) {
    let nof_levels = 1usize << bits_per_axis;
    let mut d0 = [f32::MAX; 3];
    let mut d1 = [f32::MAX; 3];
    let mut pattern = [0u8; 3];

    for candidate in 0..nof_levels {
        for (i, bit) in pattern.iter_mut().take(bits_per_axis).enumerate() {
            *bit = ((candidate >> (bits_per_axis - 1 - i)) & 1) as u8;
        }
        let x = level(&pattern[..bits_per_axis]) * scale;
        let d = (y - x) * (y - x);
        for i in 0..bits_per_axis {
            if pattern[i] == 0 {
                d0[i] = d0[i].min(d);
            } else {
                d1[i] = d1[i].min(d);
            }
        }
    }

    for i in 0..bits_per_axis {
        out.push((d1[i] - d0[i]) / noise);
    }
}

impl Modem for QamModem {
    fn modulate(&self, bits: &[u8], modulation: ModulationScheme) -> Vec<Complex32> {
        let qm = modulation.bits_per_symbol();
        let s = scale(modulation);
        let mut i_bits = [0u8; 3];
        let mut q_bits = [0u8; 3];

        bits.chunks_exact(qm)
            .map(|chunk| {
                for (j, &b) in chunk.iter().enumerate() {
                    if j % 2 == 0 {
                        i_bits[j / 2] = b;
                    } else {
                        q_bits[j / 2] = b;
                    }
                }
                Complex32::new(level(&i_bits[..qm / 2]) * s, level(&q_bits[..qm / 2]) * s)
            })
            .collect()
    }

    fn demodulate(
        &self,
        symbols: &[Complex32],
        ce: &ChannelEstimate,
        modulation: ModulationScheme,
    ) -> Vec<f32> {
        let qm = modulation.bits_per_symbol();
        let per_axis = qm / 2;
        let s = scale(modulation);
        let n_sc = ce.ce.len().max(1);
        let mut llr = Vec::with_capacity(symbols.len() * qm);
        let mut i_llr = Vec::with_capacity(3);
        let mut q_llr = Vec::with_capacity(3);

        for (idx, y) in symbols.iter().enumerate() {
            let h = ce.ce.get(idx % n_sc).copied().unwrap_or_default();
            let gain = h.norm_sqr();
            if gain < 1e-12 {
                llr.extend(std::iter::repeat(0.0).take(qm));
                continue;
            }

            // Zero forcing; noise grows by 1/|h|^2
            let z = y * h.conj() / gain;
            let noise = ce.noise_estimate / gain;

            i_llr.clear();
            q_llr.clear();
            axis_llr(z.re, per_axis, s, noise, &mut i_llr);
            axis_llr(z.im, per_axis, s, noise, &mut q_llr);
            for j in 0..per_axis {
                llr.push(i_llr[j]);
                llr.push(q_llr[j]);
            }
        }

        llr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_channel(n_sc: usize) -> ChannelEstimate {
        ChannelEstimate {
            ce: vec![Complex32::new(1.0, 0.0); n_sc],
            noise_estimate: 0.1,
            rsrp: 1.0,
        }
    }

    #[test]
    fn test_qpsk_mapping() {
        let symbols = QamModem.modulate(&[0, 0, 1, 0], ModulationScheme::Qpsk);
        let a = 1.0 / 2f32.sqrt();
        assert_eq!(symbols, vec![Complex32::new(a, a), Complex32::new(-a, a)]);
    }

    #[test]
    fn test_16qam_mapping() {
        // 0011 -> 3/sqrt(10) + j3/sqrt(10), 1101 -> -1/sqrt(10) - j3/sqrt(10)
        let s = 1.0 / 10f32.sqrt();
        let symbols = QamModem.modulate(&[0, 0, 1, 1, 1, 1, 0, 1], ModulationScheme::Qam16);
        assert!((symbols[0] - Complex32::new(3.0 * s, 3.0 * s)).norm() < 1e-6);
        assert!((symbols[1] - Complex32::new(-s, -3.0 * s)).norm() < 1e-6);
    }

    #[test]
    fn test_unit_average_energy() {
        for modulation in [ModulationScheme::Qpsk, ModulationScheme::Qam16, ModulationScheme::Qam64] {
            let qm = modulation.bits_per_symbol();
            let bits: Vec<u8> = (0..(1usize << qm))
                .flat_map(|v| (0..qm).map(move |i| ((v >> (qm - 1 - i)) & 1) as u8))
                .collect();
            let symbols = QamModem.modulate(&bits, modulation);
            let energy = symbols.iter().map(|s| s.norm_sqr()).sum::<f32>() / symbols.len() as f32;
            assert!((energy - 1.0).abs() < 1e-4, "{:?} energy {}", modulation, energy);
        }
    }

    #[test]
    fn test_hard_decisions_recover_bits() {
        for modulation in [ModulationScheme::Qpsk, ModulationScheme::Qam16, ModulationScheme::Qam64] {
            let bits: Vec<u8> = (0..120).map(|i| ((i * 7 + i / 3) % 2) as u8).collect();
            let symbols = QamModem.modulate(&bits, modulation);
            // Rotate by a known channel and equalise it away
            let h = Complex32::from_polar(0.7, -2.0);
            let rx: Vec<Complex32> = symbols.iter().map(|s| s * h).collect();
            let ce = ChannelEstimate { ce: vec![h; 12], noise_estimate: 0.01, rsrp: 0.49 };

            let llr = QamModem.demodulate(&rx, &ce, modulation);
            let decided: Vec<u8> = llr.iter().map(|&l| (l < 0.0) as u8).collect();
            assert_eq!(decided, bits, "{:?}", modulation);
        }
    }

    #[test]
    fn test_zero_channel_gives_erasures() {
        let ce = ChannelEstimate { ce: vec![Complex32::new(0.0, 0.0); 12], noise_estimate: 0.1, rsrp: 0.0 };
        let llr = QamModem.demodulate(&[Complex32::new(1.0, 1.0)], &ce, ModulationScheme::Qpsk);
        assert_eq!(llr, vec![0.0, 0.0]);
        let llr = QamModem.demodulate(&[Complex32::new(1.0, -1.0)], &unit_channel(12), ModulationScheme::Qpsk);
        assert!(llr[0] > 0.0 && llr[1] < 0.0);
    }
}
