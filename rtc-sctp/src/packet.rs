//! SCTP common header, CRC32C checksum, and chunk framing (RFC 4960 §3).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};
use rtc_shared::error::{Error, Result};

pub const COMMON_HEADER_LEN: usize = 12;
pub const CHUNK_HEADER_LEN: usize = 4;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub mod chunk_type {
    pub const DATA: u8 = 0;
    pub const INIT: u8 = 1;
    pub const INIT_ACK: u8 = 2;
    pub const SACK: u8 = 3;
    pub const HEARTBEAT: u8 = 4;
    pub const HEARTBEAT_ACK: u8 = 5;
    pub const ABORT: u8 = 6;
    pub const SHUTDOWN: u8 = 7;
    pub const SHUTDOWN_ACK: u8 = 8;
    pub const ERROR: u8 = 9;
    pub const COOKIE_ECHO: u8 = 10;
    pub const COOKIE_ACK: u8 = 11;
    pub const SHUTDOWN_COMPLETE: u8 = 14;
    pub const RECONFIG: u8 = 130;
}

pub mod data_flags {
    pub const END: u8 = 0x01;
    pub const BEGIN: u8 = 0x02;
    pub const UNORDERED: u8 = 0x04;
}

pub mod cause_code {
    pub const STALE_COOKIE: u16 = 3;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub verification_tag: u32,
}

/// An unparsed chunk: type, flags, and a raw value slice (without the
/// chunk's own 4-byte type/flags/length header, and without the padding
/// to the next 4-byte boundary).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub chunk_type: u8,
    pub flags: u8,
    pub value: Bytes,
}

impl RawChunk {
    fn marshal(&self, buf: &mut BytesMut) {
        let len = CHUNK_HEADER_LEN + self.value.len();
        buf.put_u8(self.chunk_type);
        buf.put_u8(self.flags);
        buf.put_u16(len as u16);
        buf.put_slice(&self.value);
        let padding = (4 - (len % 4)) % 4;
        buf.put_bytes(0, padding);
    }
}

/// Marshals a full SCTP packet: common header followed by chunks, with the
/// checksum field computed over the whole packet with the field itself
/// zeroed (RFC 4960 §6.8).
pub fn marshal_packet(header: &CommonHeader, chunks: &[RawChunk]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(header.source_port);
    buf.put_u16(header.destination_port);
    buf.put_u32(header.verification_tag);
    buf.put_u32(0); // checksum placeholder
    for chunk in chunks {
        chunk.marshal(&mut buf);
    }
    let checksum = CASTAGNOLI.checksum(&buf);
    buf[8..12].copy_from_slice(&checksum.to_le_bytes());
    buf.freeze()
}

pub struct ParsedPacket {
    pub header: CommonHeader,
    pub chunks: Vec<RawChunk>,
}

/// Unmarshals a packet, verifying its CRC32C checksum (RFC 4960's checksum
/// is little-endian, unlike every other SCTP field).
pub fn unmarshal_packet(buf: &[u8]) -> Result<ParsedPacket> {
    if buf.len() < COMMON_HEADER_LEN {
        return Err(Error::short("sctp_common_header"));
    }
    let mut expected = buf.to_vec();
    expected[8..12].copy_from_slice(&[0, 0, 0, 0]);
    let computed = CASTAGNOLI.checksum(&expected);
    let received = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    if computed != received {
        return Err(Error::IntegrityFailure("sctp_checksum"));
    }

    let mut r = &buf[..4];
    let source_port = r.get_u16();
    let destination_port = r.get_u16();
    let verification_tag = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let header = CommonHeader { source_port, destination_port, verification_tag };

    let mut chunks = Vec::new();
    let mut cursor = &buf[COMMON_HEADER_LEN..];
    while !cursor.is_empty() {
        if cursor.len() < CHUNK_HEADER_LEN {
            return Err(Error::short("sctp_chunk_header"));
        }
        let chunk_type = cursor[0];
        let flags = cursor[1];
        let len = u16::from_be_bytes([cursor[2], cursor[3]]) as usize;
        if len < CHUNK_HEADER_LEN || cursor.len() < len {
            return Err(Error::short("sctp_chunk_body"));
        }
        let value = Bytes::copy_from_slice(&cursor[CHUNK_HEADER_LEN..len]);
        chunks.push(RawChunk { chunk_type, flags, value });
        let padded = len + ((4 - (len % 4)) % 4);
        let consumed = padded.min(cursor.len());
        cursor = &cursor[consumed..];
    }

    Ok(ParsedPacket { header, chunks })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_with_valid_checksum() {
        let header = CommonHeader { source_port: 5000, destination_port: 5000, verification_tag: 42 };
        let chunks = vec![RawChunk { chunk_type: chunk_type::DATA, flags: data_flags::BEGIN | data_flags::END, value: Bytes::from_static(b"hi") }];
        let packet = marshal_packet(&header, &chunks);
        let parsed = unmarshal_packet(&packet).unwrap();
        assert_eq!(parsed.header, header);
        assert_eq!(parsed.chunks, chunks);
    }

    #[test]
    fn tampered_checksum_rejected() {
        let header = CommonHeader { source_port: 1, destination_port: 2, verification_tag: 3 };
        let mut packet = marshal_packet(&header, &[]).to_vec();
        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        assert!(unmarshal_packet(&packet).is_err());
    }

    #[test]
    fn chunk_padding_is_4_byte_aligned() {
        let header = CommonHeader { source_port: 1, destination_port: 2, verification_tag: 3 };
        let chunks = vec![RawChunk { chunk_type: chunk_type::DATA, flags: 0, value: Bytes::from_static(b"abc") }];
        let packet = marshal_packet(&header, &chunks);
        assert_eq!(packet.len() % 4, 0);
    }
}
