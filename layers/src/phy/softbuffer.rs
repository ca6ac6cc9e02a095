//! Receiver soft buffers
//!
//! A soft buffer accumulates log-likelihood ratios of one transport block
//! across transmissions. It holds one soft value per bit of the CRC attached
//! transport block and remembers the size it was last reset for, so a decode
//! for a different size is rejected instead of mixing unrelated soft bits.

use crate::LayerError;
use std::sync::{Arc, Mutex};

/// Transport block CRC length
pub const TB_CRC_LEN: u32 = 24;

/// Soft buffer shared between a HARQ process and the decoder
pub type SharedSoftBuffer = Arc<Mutex<SoftBuffer>>;

#[derive(Debug, Clone)]
pub struct SoftBuffer {
    llr: Vec<f32>,
    tbs: u32,
    max_tbs: u32,
    decoded: bool,
}

impl SoftBuffer {
    /// Allocate a buffer able to hold transport blocks up to `max_tbs` bits
    pub fn new(max_tbs: u32) -> Self {
        Self {
            llr: Vec::with_capacity((max_tbs + TB_CRC_LEN) as usize),
            tbs: 0,
            max_tbs,
            decoded: false,
        }
    }

    pub fn shared(max_tbs: u32) -> SharedSoftBuffer {
        Arc::new(Mutex::new(Self::new(max_tbs)))
    }

    /// Clear the content and size the buffer for `tbs` bits
    pub fn reset_tbs(&mut self, tbs: u32) -> Result<(), LayerError> {
        if tbs > self.max_tbs {
            return Err(LayerError::InvalidConfiguration(format!(
                "TBS {} exceeds soft buffer capacity {}",
                tbs, self.max_tbs
            )));
        }
        self.llr.clear();
        self.llr.resize((tbs + TB_CRC_LEN) as usize, 0.0);
        self.tbs = tbs;
        self.decoded = false;
        Ok(())
    }

    /// Clear the content keeping the current size
    pub fn reset(&mut self) {
        self.llr.iter_mut().for_each(|v| *v = 0.0);
        self.decoded = false;
    }

    /// Transport block size the buffer is currently sized for (0 when never used)
    pub fn tbs(&self) -> u32 {
        self.tbs
    }

    pub fn max_tbs(&self) -> u32 {
        self.max_tbs
    }

    /// Whether the current content passed the transport block CRC
    pub fn is_decoded(&self) -> bool {
        self.decoded
    }

    pub fn set_decoded(&mut self, decoded: bool) {
        self.decoded = decoded;
    }

    /// Fail unless the buffer is sized for `tbs`
    pub fn check_tbs(&self, tbs: u32) -> Result<(), LayerError> {
        if self.tbs != tbs {
            return Err(LayerError::SoftBufferMismatch { buffer: self.tbs, requested: tbs });
        }
        Ok(())
    }

    pub fn llr(&self) -> &[f32] {
        &self.llr
    }

    pub fn llr_mut(&mut self) -> &mut [f32] {
        &mut self.llr
    }

    /// True when no soft information has been accumulated
    pub fn is_clear(&self) -> bool {
        self.llr.iter().all(|&v| v == 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_sizes_buffer() {
        let mut sb = SoftBuffer::new(1000);
        assert_eq!(sb.tbs(), 0);
        sb.reset_tbs(888).unwrap();
        assert_eq!(sb.llr().len(), 912);
        assert!(sb.is_clear());
        assert!(sb.check_tbs(888).is_ok());
        assert!(matches!(
            sb.check_tbs(768),
            Err(LayerError::SoftBufferMismatch { buffer: 888, requested: 768 })
        ));
    }

    #[test]
    fn test_reset_clears_content() {
        let mut sb = SoftBuffer::new(100);
        sb.reset_tbs(64).unwrap();
        sb.llr_mut()[3] = 2.5;
        sb.set_decoded(true);
        assert!(!sb.is_clear());
        sb.reset();
        assert!(sb.is_clear());
        assert!(!sb.is_decoded());
        assert_eq!(sb.tbs(), 64);
    }

    #[test]
    fn test_capacity_limit() {
        let mut sb = SoftBuffer::new(100);
        assert!(sb.reset_tbs(101).is_err());
    }
}
