use bytes::{Buf, BufMut};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{Marshal, MarshalSize, Unmarshal};

pub const VERSION: u8 = 2;

pub mod packet_type {
    pub const SENDER_REPORT: u8 = 200;
    pub const RECEIVER_REPORT: u8 = 201;
    pub const SOURCE_DESCRIPTION: u8 = 202;
    pub const GOODBYE: u8 = 203;
    pub const APPLICATION_DEFINED: u8 = 204;
    pub const TRANSPORT_SPECIFIC_FEEDBACK: u8 = 205;
    pub const PAYLOAD_SPECIFIC_FEEDBACK: u8 = 206;
}

pub mod format {
    pub const NACK: u8 = 1;
    pub const PLI: u8 = 1;
    pub const FIR: u8 = 4;
    pub const REMB_AFB: u8 = 15;
}

/// The common 4-byte RTCP header: version(2)/padding(1)/count-or-fmt(5),
/// packet type(8), length in 4-byte words minus one(16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub padding: bool,
    pub count: u8,
    pub packet_type: u8,
    /// Length of the packet body (excluding this header) in bytes, as
    /// derived from the wire `length` word count. Set by `unmarshal`;
    /// ignored by `marshal_to` callers, who recompute it from the body.
    pub length_bytes: usize,
}

impl RtcpHeader {
    pub fn new(packet_type: u8, count: u8) -> Self {
        Self {
            padding: false,
            count,
            packet_type,
            length_bytes: 0,
        }
    }
}

impl MarshalSize for RtcpHeader {
    fn marshal_size(&self) -> usize {
        4
    }
}

impl RtcpHeader {
    /// `body_len` is the length, in bytes, of everything after this header.
    pub fn marshal_with_len(&self, buf: &mut [u8], body_len: usize) -> Result<usize> {
        if buf.len() < 4 {
            return Err(Error::WrongMarshalSize { need: 4, have: buf.len() });
        }
        if body_len % 4 != 0 {
            return Err(Error::short("rtcp_body_len_not_4_aligned"));
        }
        let b0 = (VERSION << 6) | ((self.padding as u8) << 5) | (self.count & 0x1F);
        buf[0] = b0;
        buf[1] = self.packet_type;
        let words = (body_len / 4) as u16;
        buf[2..4].copy_from_slice(&words.to_be_bytes());
        Ok(4)
    }
}

impl Unmarshal for RtcpHeader {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < 4 {
            return Err(Error::short("rtcp_header"));
        }
        let b0 = buf.get_u8();
        let version = b0 >> 6;
        if version != VERSION {
            return Err(Error::InvalidFraming { field: "rtcp_version" });
        }
        let padding = (b0 & 0x20) != 0;
        let count = b0 & 0x1F;
        let packet_type = buf.get_u8();
        let words = buf.get_u16();
        Ok(RtcpHeader {
            padding,
            count,
            packet_type,
            length_bytes: words as usize * 4,
        })
    }
}

pub fn put_header(buf: &mut bytes::BytesMut, packet_type: u8, count: u8, body_len: usize) {
    let b0 = (VERSION << 6) | (count & 0x1F);
    buf.put_u8(b0);
    buf.put_u8(packet_type);
    buf.put_u16((body_len / 4) as u16);
}
