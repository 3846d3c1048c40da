//! DTLS 1.2 record layer (RFC 6347 §4.1): content type, protocol version,
//! epoch, 48-bit sequence number, and a length-prefixed fragment.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rtc_shared::error::{Error, Result};

pub const HEADER_LEN: usize = 13;

pub mod content_type {
    pub const CHANGE_CIPHER_SPEC: u8 = 20;
    pub const ALERT: u8 = 21;
    pub const HANDSHAKE: u8 = 22;
    pub const APPLICATION_DATA: u8 = 23;
}

/// DTLS 1.2's on-the-wire version is the one's complement of the TLS
/// version: `{254, 253}` for "1.2".
pub const PROTOCOL_VERSION: (u8, u8) = (254, 253);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub content_type: u8,
    pub epoch: u16,
    pub sequence_number: u64, // 48 bits
    pub fragment: Bytes,
}

impl Record {
    pub fn new(content_type: u8, epoch: u16, sequence_number: u64, fragment: Bytes) -> Self {
        Self { content_type, epoch, sequence_number, fragment }
    }

    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.fragment.len());
        buf.put_u8(self.content_type);
        buf.put_u8(PROTOCOL_VERSION.0);
        buf.put_u8(PROTOCOL_VERSION.1);
        buf.put_u16(self.epoch);
        // 48-bit sequence number, big-endian
        let seq_bytes = self.sequence_number.to_be_bytes();
        buf.put_slice(&seq_bytes[2..8]);
        buf.put_u16(self.fragment.len() as u16);
        buf.put_slice(&self.fragment);
        buf.freeze()
    }

    /// Parses one record from the front of `buf`, returning it and the
    /// number of bytes consumed. A datagram may carry several coalesced
    /// records.
    pub fn unmarshal(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < HEADER_LEN {
            return Err(Error::short("dtls_record_header"));
        }
        let mut r = buf;
        let content_type = r.get_u8();
        let _major = r.get_u8();
        let _minor = r.get_u8();
        let epoch = r.get_u16();
        let mut seq_bytes = [0u8; 8];
        for b in seq_bytes.iter_mut().take(8).skip(2) {
            *b = r.get_u8();
        }
        let sequence_number = u64::from_be_bytes(seq_bytes);
        let len = r.get_u16() as usize;
        if r.remaining() < len {
            return Err(Error::short("dtls_record_fragment"));
        }
        let fragment = Bytes::copy_from_slice(&r[..len]);
        Ok((
            Record { content_type, epoch, sequence_number, fragment },
            HEADER_LEN + len,
        ))
    }
}

/// Splits a coalesced datagram into its component records.
pub fn unmarshal_all(mut buf: &[u8]) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let (record, n) = Record::unmarshal(buf)?;
        out.push(record);
        buf = &buf[n..];
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let r = Record::new(content_type::HANDSHAKE, 1, 42, Bytes::from_static(b"hello"));
        let buf = r.marshal();
        let (parsed, n) = Record::unmarshal(&buf).unwrap();
        assert_eq!(parsed, r);
        assert_eq!(n, buf.len());
    }

    #[test]
    fn coalesced_records_split() {
        let a = Record::new(content_type::HANDSHAKE, 0, 0, Bytes::from_static(b"a"));
        let b = Record::new(content_type::ALERT, 0, 1, Bytes::from_static(b"bb"));
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a.marshal());
        buf.extend_from_slice(&b.marshal());
        let records = unmarshal_all(&buf).unwrap();
        assert_eq!(records, vec![a, b]);
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(Record::unmarshal(&[0u8; 4]).is_err());
    }
}
