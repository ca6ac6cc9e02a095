//! Common Utilities
//!
//! Checksums and bit handling shared by the control and data channel codecs.
//! Bit vectors are `u8` slices holding one bit (0 or 1) per element, MSB first.

use bytes::{Bytes, BytesMut, BufMut};
use tracing::trace;

/// CRC-16 generator polynomial (x^16 + x^12 + x^5 + 1)
pub const CRC16_POLY: u16 = 0x1021;

/// CRC-24A generator polynomial
pub const CRC24A_POLY: u32 = 0x864CFB;

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Calculate CRC-24A over an unpacked bit vector
pub fn crc24a_bits(bits: &[u8]) -> u32 {
    let mut crc: u32 = 0;

    for &bit in bits {
        let feedback = ((crc >> 23) & 1) ^ (bit as u32 & 1);
        crc = (crc << 1) & 0xFFFFFF;
        if feedback != 0 {
            crc ^= CRC24A_POLY;
        }
    }

    crc
}

/// Calculate CRC-16 over an unpacked bit vector
pub fn crc16_bits(bits: &[u8]) -> u16 {
    let mut crc: u16 = 0;

    for &bit in bits {
        let feedback = ((crc >> 15) & 1) ^ (bit as u16 & 1);
        crc <<= 1;
        if feedback != 0 {
            crc ^= CRC16_POLY;
        }
    }

    crc
}

/// Pack bits into bytes (MSB first); a trailing partial byte is zero padded
pub fn pack_bits(bits: &[u8]) -> Bytes {
    let mut bytes = BytesMut::with_capacity((bits.len() + 7) / 8);

    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (i, &bit) in chunk.iter().enumerate() {
            if bit != 0 {
                byte |= 1 << (7 - i);
            }
        }
        bytes.put_u8(byte);
    }

    bytes.freeze()
}

/// Unpack bytes into bits (MSB first)
pub fn unpack_bits(bytes: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);

    for &byte in bytes {
        for i in 0..8 {
            bits.push((byte >> (7 - i)) & 1);
        }
    }

    bits
}

/// Append the `n` least significant bits of `value`, MSB first
pub fn append_bits(bits: &mut Vec<u8>, value: u32, n: usize) {
    for i in (0..n).rev() {
        bits.push(((value >> i) & 1) as u8);
    }
}

/// Sequential MSB-first reader over an unpacked bit vector
pub struct BitReader<'a> {
    bits: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(bits: &'a [u8]) -> Self {
        Self { bits, pos: 0 }
    }

    /// Read the next `n` bits (n <= 32); `None` if the vector is exhausted
    pub fn read(&mut self, n: usize) -> Option<u32> {
        let end = self.pos.checked_add(n)?;
        if end > self.bits.len() || n > 32 {
            return None;
        }
        let value = self.bits[self.pos..end]
            .iter()
            .fold(0u32, |acc, &bit| (acc << 1) | (bit as u32 & 1));
        self.pos = end;
        Some(value)
    }

    /// Current read position in bits
    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Smallest `k` such that `2^k >= n`
pub fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        32 - (n - 1).leading_zeros()
    }
}

/// Whether `n` factors as 2^a * 3^b * 5^c, the sizes supported by the
/// transform precoder
pub fn is_dft_size(n: usize) -> bool {
    if n == 0 {
        return false;
    }

    let mut v = n;
    for factor in [2, 3, 5] {
        while v % factor == 0 {
            v /= factor;
        }
    }

    trace!("DFT size check for {}: {}", n, v == 1);
    v == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_hex() {
        let data = vec![0x12, 0x34, 0xAB, 0xCD];
        assert_eq!(bytes_to_hex(&data), "12 34 ab cd");
    }

    #[test]
    fn test_crc24a_check_value() {
        assert_eq!(crc24a_bits(&unpack_bits(b"123456789")), 0xCDE703);
    }

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/XMODEM parameters
        assert_eq!(crc16_bits(&unpack_bits(b"123456789")), 0x31C3);
    }

    #[test]
    fn test_bit_packing() {
        let bits = vec![1, 0, 1, 0, 1, 0, 1, 0, 1];
        let packed = pack_bits(&bits);
        assert_eq!(packed[0], 0xAA);
        assert_eq!(packed[1], 0x80);

        let unpacked = unpack_bits(&packed);
        assert_eq!(unpacked[..9], bits[..]);
    }

    #[test]
    fn test_bit_reader() {
        let mut bits = Vec::new();
        append_bits(&mut bits, 0b101, 3);
        append_bits(&mut bits, 0x1234, 16);

        let mut reader = BitReader::new(&bits);
        assert_eq!(reader.read(3), Some(0b101));
        assert_eq!(reader.read(16), Some(0x1234));
        assert_eq!(reader.position(), 19);
        assert_eq!(reader.read(1), None);
    }

    #[test]
    fn test_ceil_log2() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(15), 4);
        assert_eq!(ceil_log2(16), 4);
        assert_eq!(ceil_log2(17), 5);
    }

    #[test]
    fn test_dft_sizes() {
        assert!(is_dft_size(3));
        assert!(is_dft_size(8));
        assert!(is_dft_size(18));
        assert!(!is_dft_size(7));
        assert!(!is_dft_size(23));
        assert!(!is_dft_size(0));
    }
}
