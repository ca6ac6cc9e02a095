//! SL-SCH MAC PDU (3GPP TS 36.321 Section 6.1.6)
//!
//! ```text
//! | V(4)=3 | R(4) | SRC(24) | DST(24) | subheader... | SDU... | padding |
//! ```
//!
//! Every SDU subheader is `R/F2/E/LCID` followed by an 8 bit `F/L(7)` or a
//! 16 bit `F/L(15)` length. A padding subheader (LCID 31, no length) may
//! close the header; bytes after the last SDU are padding.

use crate::LayerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// SL-SCH subheader version
pub const SLSCH_VERSION: u8 = 3;

/// Version, source and destination
pub const SLSCH_HEADER_LEN: usize = 7;

/// Padding logical channel
pub const LCID_PADDING: u8 = 31;

/// Largest SDU carried with a 7 bit length field
const SHORT_LENGTH_MAX: usize = 0x7F;

/// Largest SDU carried at all
pub const MAX_SDU_LEN: usize = 0x7FFF;

/// One MAC SDU of a sidelink PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlSdu {
    pub lcid: u8,
    pub data: Bytes,
}

/// Sidelink shared channel MAC PDU
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlSchPdu {
    /// Source layer-2 id (24 bits)
    pub src: u32,
    /// Destination layer-2 id (24 bits)
    pub dst: u32,
    pub sdus: Vec<SlSdu>,
}

impl SlSchPdu {
    pub fn new(src: u32, dst: u32) -> Self {
        Self {
            src: src & 0xFF_FFFF,
            dst: dst & 0xFF_FFFF,
            sdus: Vec::new(),
        }
    }

    /// Header bytes needed to carry an SDU of `len` bytes
    pub fn subheader_len(len: usize) -> usize {
        if len <= SHORT_LENGTH_MAX {
            2
        } else {
            3
        }
    }

    /// Bytes taken by an SDU of `len` bytes including its subheader
    pub fn sdu_footprint(len: usize) -> usize {
        Self::subheader_len(len) + len
    }

    /// Append an SDU
    pub fn push(&mut self, lcid: u8, data: Bytes) -> Result<(), LayerError> {
        if lcid >= LCID_PADDING || data.len() > MAX_SDU_LEN {
            return Err(LayerError::InvalidPdu);
        }
        self.sdus.push(SlSdu { lcid, data });
        Ok(())
    }

    /// Encoded size without padding
    pub fn encoded_len(&self) -> usize {
        SLSCH_HEADER_LEN + self.sdus.iter().map(|s| Self::sdu_footprint(s.data.len())).sum::<usize>()
    }

    /// Serialise, padding up to `pad_to` bytes when given
    pub fn write(&self, pad_to: Option<usize>) -> Result<Bytes, LayerError> {
        let len = self.encoded_len();
        let total = pad_to.unwrap_or(len);
        if total < len {
            return Err(LayerError::ProcessingError(format!(
                "PDU of {} bytes does not fit {} bytes",
                len, total
            )));
        }
        let padding_subheader = total > len;

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(SLSCH_VERSION << 4);
        put_u24(&mut buf, self.src);
        put_u24(&mut buf, self.dst);

        for (i, sdu) in self.sdus.iter().enumerate() {
            let last = i + 1 == self.sdus.len() && !padding_subheader;
            let e = if last { 0 } else { 1 << 5 };
            let n = sdu.data.len();
            if n <= SHORT_LENGTH_MAX {
                buf.put_u8(e | sdu.lcid);
                buf.put_u8(n as u8);
            } else {
                buf.put_u8(e | sdu.lcid);
                buf.put_u16(0x8000 | n as u16);
            }
        }
        if padding_subheader {
            buf.put_u8(LCID_PADDING);
        }

        for sdu in &self.sdus {
            buf.put_slice(&sdu.data);
        }
        buf.resize(total, 0);
        Ok(buf.freeze())
    }

    /// Parse a received PDU; bytes after the last SDU are ignored
    pub fn parse(data: &[u8]) -> Result<Self, LayerError> {
        let mut buf = data;
        if buf.remaining() < SLSCH_HEADER_LEN {
            return Err(LayerError::InvalidPdu);
        }
        let version = buf.get_u8() >> 4;
        if version != SLSCH_VERSION {
            return Err(LayerError::InvalidPdu);
        }
        let src = get_u24(&mut buf);
        let dst = get_u24(&mut buf);

        let mut headers = Vec::new();
        while buf.has_remaining() {
            let b = buf.get_u8();
            let more = b & (1 << 5) != 0;
            let lcid = b & 0x1F;
            if lcid == LCID_PADDING {
                break;
            }

            if !buf.has_remaining() {
                return Err(LayerError::InvalidPdu);
            }
            let len = if buf.chunk()[0] & 0x80 == 0 {
                buf.get_u8() as usize
            } else if buf.remaining() >= 2 {
                (buf.get_u16() & 0x7FFF) as usize
            } else {
                return Err(LayerError::InvalidPdu);
            };
            headers.push((lcid, len));

            if !more {
                break;
            }
        }

        let mut sdus = Vec::with_capacity(headers.len());
        for (lcid, len) in headers {
            if buf.remaining() < len {
                return Err(LayerError::InvalidPdu);
            }
            if len > 0 {
                sdus.push(SlSdu {
                    lcid,
                    data: Bytes::copy_from_slice(&buf[..len]),
                });
            }
            buf.advance(len);
        }

        Ok(Self { src, dst, sdus })
    }
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u16(value as u16);
}

fn get_u24(buf: &mut &[u8]) -> u32 {
    let hi = buf.get_u8() as u32;
    (hi << 16) | buf.get_u16() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut pdu = SlSchPdu::new(0x123456, 0xABCDEF);
        pdu.push(4, Bytes::from_static(b"abc")).unwrap();
        let bytes = pdu.write(None).unwrap();
        assert_eq!(&bytes[..7], &[0x30, 0x12, 0x34, 0x56, 0xAB, 0xCD, 0xEF]);
        // Last subheader: E = 0, LCID 4, F = 0, L = 3
        assert_eq!(&bytes[7..9], &[0x04, 0x03]);
        assert_eq!(&bytes[9..], b"abc");
        assert_eq!(bytes.len(), pdu.encoded_len());
    }

    #[test]
    fn test_parse_with_padding() {
        let mut pdu = SlSchPdu::new(1, 2);
        pdu.push(3, Bytes::from_static(b"first")).unwrap();
        pdu.push(5, Bytes::from(vec![0x5A; 300])).unwrap();
        let bytes = pdu.write(Some(400)).unwrap();
        assert_eq!(bytes.len(), 400);
        // Long length field on the second subheader
        assert_eq!(&bytes[9..12], &[0x20 | 5, 0x81, 0x2C]);
        assert_eq!(bytes[12], LCID_PADDING);

        let parsed = SlSchPdu::parse(&bytes).unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_trailing_zeros_ignored() {
        let mut pdu = SlSchPdu::new(7, 8);
        pdu.push(1, Bytes::from_static(b"x")).unwrap();
        let mut bytes = pdu.write(None).unwrap().to_vec();
        bytes.resize(64, 0);
        assert_eq!(SlSchPdu::parse(&bytes).unwrap(), pdu);
    }

    #[test]
    fn test_malformed() {
        assert!(SlSchPdu::parse(&[0x30, 0, 0]).is_err());
        // Wrong version
        assert!(SlSchPdu::parse(&[0x10, 0, 0, 1, 0, 0, 2, 0x01, 0x01, 0xFF]).is_err());
        // SDU longer than the PDU
        assert!(SlSchPdu::parse(&[0x30, 0, 0, 1, 0, 0, 2, 0x01, 0x05, 0xFF]).is_err());

        let mut pdu = SlSchPdu::new(0, 0);
        assert!(pdu.push(LCID_PADDING, Bytes::new()).is_err());
        pdu.push(1, Bytes::from_static(b"too long")).unwrap();
        assert!(pdu.write(Some(8)).is_err());
    }
}
