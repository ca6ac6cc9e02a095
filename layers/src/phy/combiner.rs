//! Two-generation soft combining
//!
//! Sidelink mode 4 has no feedback channel. A transport block is sent twice,
//! the SCI retransmission index telling the receiver which generation it is
//! looking at. Each occasion is decoded twice: once on its own ("fresh") and
//! once accumulated onto whatever the previous occasion left behind
//! ("combined"). The combined buffer is cleared when a first generation
//! arrives and after a second generation was consumed, so it never spans more
//! than one initial transmission and its repetition.

use super::primitives::ChannelCodec;
use super::sci::SciMessage;
use super::softbuffer::SoftBuffer;
use crate::LayerError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Soft buffer a decode result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineSource {
    /// This occasion only
    Fresh,
    /// This occasion accumulated onto the previous one
    #[default]
    Combined,
}

/// Soft buffers used by one receive occasion
pub struct CombiningBufferPair<'a> {
    /// Receive worker scratch buffer
    pub fresh: &'a mut SoftBuffer,
    /// HARQ sub-process buffer
    pub combined: &'a mut SoftBuffer,
}

/// Result of one combining occasion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub success: bool,
    /// Decoded transport block when `success`
    pub payload: Option<Bytes>,
    pub generation_used: Option<CombineSource>,
    /// The combined buffer had already been decoded before this occasion
    pub repeated: bool,
}

/// Decodes each occasion against fresh and combined soft buffers
#[derive(Clone)]
pub struct HarqCombiner {
    codec: Arc<dyn ChannelCodec>,
    preference: CombineSource,
}

impl HarqCombiner {
    pub fn new(codec: Arc<dyn ChannelCodec>, preference: CombineSource) -> Self {
        Self { codec, preference }
    }

    pub fn preference(&self) -> CombineSource {
        self.preference
    }

    /// Decode the soft bits `llr` of the PSSCH scheduled by `msg`
    pub fn combine_decode(
        &self,
        msg: &SciMessage,
        pair: CombiningBufferPair<'_>,
        llr: &[f32],
    ) -> Result<DecodeOutcome, LayerError> {
        let CombiningBufferPair { fresh, combined } = pair;
        let tbs = msg.mcs.tbs;
        let rv = msg.rv();

        fresh.reset_tbs(tbs)?;

        if !msg.is_retransmission() {
            combined.reset_tbs(tbs)?;
        } else if combined.check_tbs(tbs).is_err() {
            // First generation missed or for another block; start over
            debug!("Combined soft buffer sized for {} bits, resetting for {}", combined.tbs(), tbs);
            combined.reset_tbs(tbs)?;
        }
        let repeated = combined.is_decoded();

        let fresh_tb = self.codec.decode_data(llr, rv, fresh)?;
        let combined_tb = self.codec.decode_data(llr, rv, combined)?;

        if msg.is_retransmission() {
            combined.reset();
        }

        trace!(
            "Combining rti={} tbs={}: fresh {} combined {}{}",
            msg.rti,
            tbs,
            if fresh_tb.crc_ok { "ok" } else { "ko" },
            if combined_tb.crc_ok { "ok" } else { "ko" },
            if repeated { " (repeat)" } else { "" }
        );

        let chosen = match (fresh_tb.crc_ok, combined_tb.crc_ok) {
            (true, true) => match self.preference {
                CombineSource::Fresh => Some((CombineSource::Fresh, fresh_tb.data)),
                CombineSource::Combined => Some((CombineSource::Combined, combined_tb.data)),
            },
            (true, false) => Some((CombineSource::Fresh, fresh_tb.data)),
            (false, true) => Some((CombineSource::Combined, combined_tb.data)),
            (false, false) => None,
        };

        Ok(match chosen {
            Some((source, data)) => DecodeOutcome {
                success: true,
                payload: Some(data),
                generation_used: Some(source),
                repeated,
            },
            None => DecodeOutcome {
                success: false,
                payload: None,
                generation_used: None,
                repeated,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::coding::RepetitionCodec;
    use crate::phy::mcs::McsDescriptor;
    use common::types::ModulationScheme;

    const TBS: u32 = 64;
    // Coded length equal to the CRC attached block: one soft value per position
    const CODED: usize = 88;

    fn msg(rti: u8) -> SciMessage {
        SciMessage {
            priority: 0,
            resource_reservation: 0,
            num_subchannels: 1,
            start_subchannel: 0,
            time_gap: 5,
            rti,
            mcs: McsDescriptor { idx: 0, modulation: ModulationScheme::Qpsk, tbs: TBS },
        }
    }

    fn soft_bits(rv: u8, weak_errors: &[usize]) -> Vec<f32> {
        let coded = RepetitionCodec.encode_data(b"sidelink", TBS, rv, CODED).unwrap();
        let mut llr: Vec<f32> = coded.iter().map(|&b| if b == 0 { 1.0 } else { -1.0 }).collect();
        for &i in weak_errors {
            llr[i] = -0.5 * llr[i];
        }
        llr
    }

    fn combiner(preference: CombineSource) -> HarqCombiner {
        HarqCombiner::new(Arc::new(RepetitionCodec), preference)
    }

    #[test]
    fn test_initial_transmission_idempotent() {
        let combiner = combiner(CombineSource::Combined);
        let mut fresh = SoftBuffer::new(1000);
        let mut combined = SoftBuffer::new(1000);
        let llr = soft_bits(0, &[]);

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let pair = CombiningBufferPair { fresh: &mut fresh, combined: &mut combined };
            outcomes.push(combiner.combine_decode(&msg(0), pair, &llr).unwrap());
        }
        assert!(outcomes.iter().all(|o| *o == outcomes[0]));
        assert!(outcomes[0].success);
        assert!(!outcomes[0].repeated);
        assert_eq!(outcomes[0].generation_used, Some(CombineSource::Combined));
        assert_eq!(outcomes[0].payload.as_deref(), Some(&b"sidelink"[..]));
    }

    #[test]
    fn test_initial_transmission_clears_combined() {
        let combiner = combiner(CombineSource::Combined);
        let mut fresh = SoftBuffer::new(1000);
        let mut combined = SoftBuffer::new(1000);

        // Left over from an unrelated block, same size and already decoded
        combined.reset_tbs(TBS).unwrap();
        combined.llr_mut().iter_mut().enumerate().for_each(|(i, v)| *v = if i % 2 == 0 { 7.0 } else { -7.0 });
        combined.set_decoded(true);

        let llr = soft_bits(0, &[3, 40]);
        let pair = CombiningBufferPair { fresh: &mut fresh, combined: &mut combined };
        let outcome = combiner.combine_decode(&msg(0), pair, &llr).unwrap();
        assert!(!outcome.success);
        assert!(!outcome.repeated);
        assert_eq!(combined.tbs(), fresh.tbs());
        assert_eq!(combined.llr(), fresh.llr());
        assert!(!combined.is_clear());

        // Same again with a leftover of another size
        combined.reset_tbs(2 * TBS).unwrap();
        combined.llr_mut().iter_mut().for_each(|v| *v = 3.0);
        let pair = CombiningBufferPair { fresh: &mut fresh, combined: &mut combined };
        combiner.combine_decode(&msg(0), pair, &llr).unwrap();
        assert_eq!(combined.tbs(), TBS);
        assert_eq!(combined.llr(), fresh.llr());
    }

    #[test]
    fn test_preference_when_both_succeed() {
        let combiner = combiner(CombineSource::Fresh);
        let mut fresh = SoftBuffer::new(1000);
        let mut combined = SoftBuffer::new(1000);
        let pair = CombiningBufferPair { fresh: &mut fresh, combined: &mut combined };
        let outcome = combiner.combine_decode(&msg(0), pair, &soft_bits(0, &[])).unwrap();
        assert_eq!(outcome.generation_used, Some(CombineSource::Fresh));
    }

    #[test]
    fn test_two_generation_coverage() {
        let combiner = combiner(CombineSource::Combined);
        let mut fresh = SoftBuffer::new(1000);
        let mut combined = SoftBuffer::new(1000);

        // Generation 1 corrupted on buffer positions 3 and 40
        let first = soft_bits(0, &[3, 40]);
        // Generation 2 corrupted on coded bits 10 and 77; rv 2 starts at
        // position 44, so these land on buffer positions 54 and 33
        let second = soft_bits(2, &[10, 77]);

        let pair = CombiningBufferPair { fresh: &mut fresh, combined: &mut combined };
        let outcome = combiner.combine_decode(&msg(0), pair, &first).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.generation_used, None);

        let pair = CombiningBufferPair { fresh: &mut fresh, combined: &mut combined };
        let outcome = combiner.combine_decode(&msg(1), pair, &second).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.generation_used, Some(CombineSource::Combined));
        assert_eq!(outcome.payload.as_deref(), Some(&b"sidelink"[..]));

        // Consumed: the combined buffer is clear after the second generation
        assert!(combined.is_clear());
        assert!(!combined.is_decoded());
    }

    #[test]
    fn test_second_generation_alone_fails() {
        let combiner = combiner(CombineSource::Combined);
        let mut fresh = SoftBuffer::new(1000);
        let mut combined = SoftBuffer::new(1000);
        let pair = CombiningBufferPair { fresh: &mut fresh, combined: &mut combined };
        let outcome = combiner.combine_decode(&msg(1), pair, &soft_bits(2, &[10, 77])).unwrap();
        assert!(!outcome.success);
    }

    #[test]
    fn test_no_double_delivery() {
        let combiner = combiner(CombineSource::Combined);
        let mut fresh = SoftBuffer::new(1000);
        let mut combined = SoftBuffer::new(1000);

        let pair = CombiningBufferPair { fresh: &mut fresh, combined: &mut combined };
        let first = combiner.combine_decode(&msg(0), pair, &soft_bits(0, &[])).unwrap();
        assert!(first.success && !first.repeated);

        let pair = CombiningBufferPair { fresh: &mut fresh, combined: &mut combined };
        let second = combiner.combine_decode(&msg(1), pair, &soft_bits(2, &[])).unwrap();
        assert!(second.success);
        assert!(second.repeated);
    }
}
