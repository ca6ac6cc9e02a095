//! Reference channel coding
//!
//! Control information is repeated over the available coded bits. Transport
//! blocks get a CRC-24A and are read out of a circular buffer starting at a
//! redundancy version dependent position, so successive transmissions with
//! different redundancy versions land on the same soft buffer positions.

use super::primitives::{ChannelCodec, DecodedTb};
use super::softbuffer::{SoftBuffer, TB_CRC_LEN};
use crate::LayerError;
use common::utils::{append_bits, crc24a_bits, pack_bits, unpack_bits};
use tracing::debug;

/// Repetition code over a circular buffer
pub struct RepetitionCodec;

/// Circular buffer start for redundancy version `rv` on a buffer of `n` bits
pub fn rv_start(rv: u8, n: usize) -> usize {
    (rv as usize % 4) * n / 4
}

impl RepetitionCodec {
    /// Hard decide `llr`; `None` when any position carries no information
    fn hard_decide(llr: &[f32]) -> Option<Vec<u8>> {
        if llr.iter().any(|&v| v == 0.0) {
            return None;
        }
        Some(llr.iter().map(|&v| (v < 0.0) as u8).collect())
    }
}

impl ChannelCodec for RepetitionCodec {
    fn encode_control(&self, bits: &[u8], nof_coded_bits: usize) -> Vec<u8> {
        if bits.is_empty() {
            return vec![0; nof_coded_bits];
        }
        (0..nof_coded_bits).map(|i| bits[i % bits.len()]).collect()
    }

    fn decode_control(&self, llr: &[f32], nof_bits: usize) -> Vec<u8> {
        let mut acc = vec![0.0f32; nof_bits];
        if nof_bits == 0 {
            return Vec::new();
        }
        for (i, &v) in llr.iter().enumerate() {
            acc[i % nof_bits] += v;
        }
        acc.iter().map(|&v| (v < 0.0) as u8).collect()
    }

    fn encode_data(&self, payload: &[u8], tbs: u32, rv: u8, nof_coded_bits: usize) -> Result<Vec<u8>, LayerError> {
        let tbs = tbs as usize;
        if payload.len() * 8 > tbs {
            return Err(LayerError::ProcessingError(format!(
                "payload of {} bytes exceeds TBS {}",
                payload.len(),
                tbs
            )));
        }

        let mut bits = unpack_bits(payload);
        bits.resize(tbs, 0);
        let crc = crc24a_bits(&bits);
        append_bits(&mut bits, crc, TB_CRC_LEN as usize);

        let n = bits.len();
        if nof_coded_bits < n {
            return Err(LayerError::ProcessingError(format!(
                "{} coded bits cannot carry {} bits",
                nof_coded_bits, n
            )));
        }

        let start = rv_start(rv, n);
        Ok((0..nof_coded_bits).map(|i| bits[(start + i) % n]).collect())
    }

    fn decode_data(&self, llr: &[f32], rv: u8, softbuffer: &mut SoftBuffer) -> Result<DecodedTb, LayerError> {
        let tbs = softbuffer.tbs() as usize;
        let n = tbs + TB_CRC_LEN as usize;
        if softbuffer.llr().len() != n {
            return Err(LayerError::InvalidState(format!(
                "soft buffer holds {} values for TBS {}",
                softbuffer.llr().len(),
                tbs
            )));
        }

        let start = rv_start(rv, n);
        {
            let buffer = softbuffer.llr_mut();
            for (i, &v) in llr.iter().enumerate() {
                buffer[(start + i) % n] += v;
            }
        }

        let (data, crc_ok) = match Self::hard_decide(softbuffer.llr()) {
            Some(bits) => {
                let mut expected = Vec::with_capacity(TB_CRC_LEN as usize);
                append_bits(&mut expected, crc24a_bits(&bits[..tbs]), TB_CRC_LEN as usize);
                (pack_bits(&bits[..tbs]), expected[..] == bits[tbs..])
            }
            None => (pack_bits(&vec![0u8; tbs]), false),
        };

        debug!("Decoded TBS {} rv {}: crc {}", tbs, rv, if crc_ok { "ok" } else { "ko" });
        softbuffer.set_decoded(crc_ok);
        Ok(DecodedTb { data, crc_ok })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_llr(bits: &[u8], magnitude: f32) -> Vec<f32> {
        bits.iter().map(|&b| if b == 0 { magnitude } else { -magnitude }).collect()
    }

    #[test]
    fn test_control_repetition() {
        let bits = vec![1, 0, 1, 1, 0];
        let coded = RepetitionCodec.encode_control(&bits, 23);
        assert_eq!(coded.len(), 23);
        let mut llr = to_llr(&coded, 1.0);
        // One corrupted copy is outvoted by the others
        llr[0] = 1.0;
        assert_eq!(RepetitionCodec.decode_control(&llr, bits.len()), bits);
    }

    #[test]
    fn test_data_round_trip_with_rv() {
        let payload = b"sidelink";
        let tbs = 64;
        for rv in [0u8, 2] {
            let coded = RepetitionCodec.encode_data(payload, tbs, rv, 200).unwrap();
            let mut sb = SoftBuffer::new(1000);
            sb.reset_tbs(tbs).unwrap();
            let tb = RepetitionCodec.decode_data(&to_llr(&coded, 1.0), rv, &mut sb).unwrap();
            assert!(tb.crc_ok);
            assert!(sb.is_decoded());
            assert_eq!(&tb.data[..], payload);
        }
    }

    #[test]
    fn test_wrong_rv_fails() {
        let coded = RepetitionCodec.encode_data(b"abcd", 32, 0, 56).unwrap();
        let mut sb = SoftBuffer::new(100);
        sb.reset_tbs(32).unwrap();
        let tb = RepetitionCodec.decode_data(&to_llr(&coded, 1.0), 2, &mut sb).unwrap();
        assert!(!tb.crc_ok);
    }

    #[test]
    fn test_empty_buffer_never_passes() {
        let mut sb = SoftBuffer::new(100);
        sb.reset_tbs(32).unwrap();
        let tb = RepetitionCodec.decode_data(&[], 0, &mut sb).unwrap();
        assert!(!tb.crc_ok);
    }

    #[test]
    fn test_soft_combining() {
        let coded = RepetitionCodec.encode_data(b"combine!", 64, 0, 88).unwrap();
        let mut first = to_llr(&coded, 1.0);
        let mut second = to_llr(&coded, 1.0);
        for i in [3, 40] {
            first[i] = -first[i] * 0.5;
        }
        for i in [10, 77] {
            second[i] = -second[i] * 0.5;
        }

        let mut alone = SoftBuffer::new(100);
        alone.reset_tbs(64).unwrap();
        assert!(!RepetitionCodec.decode_data(&second, 0, &mut alone).unwrap().crc_ok);

        let mut sb = SoftBuffer::new(100);
        sb.reset_tbs(64).unwrap();
        assert!(!RepetitionCodec.decode_data(&first, 0, &mut sb).unwrap().crc_ok);
        let tb = RepetitionCodec.decode_data(&second, 0, &mut sb).unwrap();
        assert!(tb.crc_ok);
        assert_eq!(&tb.data[..], b"combine!");
    }

    #[test]
    fn test_too_few_coded_bits() {
        assert!(RepetitionCodec.encode_data(b"abcd", 32, 0, 40).is_err());
        assert!(RepetitionCodec.encode_data(b"abcdefgh", 32, 0, 100).is_err());
    }
}
