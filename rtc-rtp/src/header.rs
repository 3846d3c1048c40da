//! RTP fixed header and extension parsing per RFC 3550 §5.1 / RFC 5285.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{Marshal, MarshalSize, Unmarshal};

pub const HEADER_LEN: usize = 12;
const VERSION: u8 = 2;
const EXTENSION_PROFILE_ONE_BYTE: u16 = 0xBEDE;
const EXTENSION_PROFILE_TWO_BYTE: u16 = 0x1000;

/// One parsed header extension: local id plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExtension {
    pub id: u8,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extensions: Vec<RawExtension>,
    /// Two-byte extensions allow 0-length payloads and ids up to 255;
    /// one-byte extensions cap at id 14 and 16-byte payloads. Track which
    /// form was parsed so re-serialization stays consistent.
    pub extensions_two_byte: bool,
}

impl Default for RtpHeader {
    fn default() -> Self {
        Self {
            version: VERSION,
            padding: false,
            marker: false,
            payload_type: 0,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            csrc: Vec::new(),
            extensions: Vec::new(),
            extensions_two_byte: false,
        }
    }
}

impl RtpHeader {
    pub fn extension_with_id(&self, id: u8) -> Option<&Bytes> {
        self.extensions.iter().find(|e| e.id == id).map(|e| &e.payload)
    }

    pub fn set_extension(&mut self, id: u8, payload: Bytes) {
        if let Some(e) = self.extensions.iter_mut().find(|e| e.id == id) {
            e.payload = payload;
        } else {
            self.extensions.push(RawExtension { id, payload });
            if !self.extensions_two_byte {
                self.extensions_two_byte = self.extensions.iter().any(|e| e.id > 14 || e.payload.len() > 16);
            }
        }
    }
}

impl MarshalSize for RtpHeader {
    fn marshal_size(&self) -> usize {
        let mut size = HEADER_LEN + self.csrc.len() * 4;
        if !self.extensions.is_empty() {
            size += 4 + self.extension_payload_len();
        }
        size
    }
}

impl RtpHeader {
    fn extension_payload_len(&self) -> usize {
        let raw: usize = if self.extensions_two_byte {
            self.extensions.iter().map(|e| 2 + e.payload.len()).sum()
        } else {
            self.extensions.iter().map(|e| 1 + e.payload.len()).sum()
        };
        rtc_shared::marshal::pad4(raw)
    }
}

impl Marshal for RtpHeader {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let need = self.marshal_size();
        if buf.len() < need {
            return Err(Error::WrongMarshalSize { need, have: buf.len() });
        }
        let mut w = &mut buf[..];
        let has_ext = !self.extensions.is_empty();
        let b0 = (VERSION << 6)
            | ((self.padding as u8) << 5)
            | ((has_ext as u8) << 4)
            | (self.csrc.len() as u8 & 0x0F);
        w.put_u8(b0);
        w.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        w.put_u16(self.sequence_number);
        w.put_u32(self.timestamp);
        w.put_u32(self.ssrc);
        for c in &self.csrc {
            w.put_u32(*c);
        }
        if has_ext {
            let profile = if self.extensions_two_byte {
                EXTENSION_PROFILE_TWO_BYTE
            } else {
                EXTENSION_PROFILE_ONE_BYTE
            };
            w.put_u16(profile);
            let payload_len = self.extension_payload_len();
            w.put_u16((payload_len / 4) as u16);
            let start_remaining = w.len();
            for e in &self.extensions {
                if self.extensions_two_byte {
                    w.put_u8(e.id);
                    w.put_u8(e.payload.len() as u8);
                    w.put_slice(&e.payload);
                } else {
                    w.put_u8((e.id << 4) | ((e.payload.len() - 1) as u8 & 0x0F));
                    w.put_slice(&e.payload);
                }
            }
            let written = start_remaining - w.len();
            for _ in written..payload_len {
                w.put_u8(0);
            }
        }
        Ok(need)
    }
}

impl Unmarshal for RtpHeader {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < HEADER_LEN {
            return Err(Error::short("rtp_header"));
        }
        let b0 = buf.get_u8();
        let version = b0 >> 6;
        let padding = (b0 & 0x20) != 0;
        let has_ext = (b0 & 0x10) != 0;
        let cc = (b0 & 0x0F) as usize;
        let b1 = buf.get_u8();
        let marker = (b1 & 0x80) != 0;
        let payload_type = b1 & 0x7F;
        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < cc * 4 {
            return Err(Error::short("rtp_csrc"));
        }
        let mut csrc = Vec::with_capacity(cc);
        for _ in 0..cc {
            csrc.push(buf.get_u32());
        }

        let mut extensions = Vec::new();
        let mut extensions_two_byte = false;
        if has_ext {
            if buf.remaining() < 4 {
                return Err(Error::short("rtp_ext_header"));
            }
            let profile = buf.get_u16();
            let len_words = buf.get_u16() as usize;
            let ext_len = len_words * 4;
            if buf.remaining() < ext_len {
                return Err(Error::short("rtp_ext_body"));
            }
            let mut body = buf.copy_to_bytes(ext_len);
            extensions_two_byte = profile == EXTENSION_PROFILE_TWO_BYTE;
            if profile == EXTENSION_PROFILE_ONE_BYTE {
                while body.remaining() > 0 {
                    let b = body[0];
                    if b == 0 {
                        body.advance(1);
                        continue;
                    }
                    let id = b >> 4;
                    let len = ((b & 0x0F) + 1) as usize;
                    body.advance(1);
                    if body.remaining() < len {
                        break;
                    }
                    let payload = body.copy_to_bytes(len);
                    extensions.push(RawExtension { id, payload });
                }
            } else if profile == EXTENSION_PROFILE_TWO_BYTE {
                while body.remaining() >= 2 {
                    let id = body[0];
                    let len = body[1] as usize;
                    body.advance(2);
                    if id == 0 {
                        continue;
                    }
                    if body.remaining() < len {
                        break;
                    }
                    let payload = body.copy_to_bytes(len);
                    extensions.push(RawExtension { id, payload });
                }
            }
            // Unknown profile: extension body is kept opaque, dropped here
            // since the core only negotiates the two RFC 5285 profiles.
        }

        Ok(RtpHeader {
            version,
            padding,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extensions,
            extensions_two_byte,
        })
    }
}

pub fn header_only_len(buf: &[u8]) -> Result<usize> {
    let mut b = buf;
    let h = RtpHeader::unmarshal(&mut b)?;
    Ok(h.marshal_size())
}

pub fn encode_abs_send_time(ntp: u64) -> Bytes {
    let v = crate::extension::abs_send_time_from_ntp(ntp);
    let mut b = BytesMut::with_capacity(3);
    b.put_u8((v >> 16) as u8);
    b.put_u8((v >> 8) as u8);
    b.put_u8(v as u8);
    b.freeze()
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_header() -> RtpHeader {
        let mut h = RtpHeader {
            payload_type: 96,
            sequence_number: 1000,
            timestamp: 90000,
            ssrc: 0xDEAD_BEEF,
            marker: true,
            csrc: vec![1, 2],
            ..Default::default()
        };
        h.set_extension(1, Bytes::from_static(&[0xAA, 0xBB, 0xCC]));
        h
    }

    #[test]
    fn round_trip_with_one_byte_extensions() {
        let h = sample_header();
        let buf = h.marshal().unwrap();
        let mut b = &buf[..];
        let parsed = RtpHeader::unmarshal(&mut b).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn round_trip_with_two_byte_extensions() {
        let mut h = sample_header();
        h.extensions_two_byte = true;
        h.set_extension(200, Bytes::from(vec![0u8; 20]));
        let buf = h.marshal().unwrap();
        let mut b = &buf[..];
        let parsed = RtpHeader::unmarshal(&mut b).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn rejects_short_buffer() {
        let buf = [0u8; 4];
        let mut b = &buf[..];
        assert!(RtpHeader::unmarshal(&mut b).is_err());
    }
}
