use bytes::{Buf, BufMut, Bytes};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::RtpHeader;

/// One RTP datagram: header plus payload, with an optional trailing pad.
///
/// Padding-only packets (empty payload, pad length in the trailing byte) are
/// accepted; a pad length of 0 or greater than the packet body is rejected
/// as `InvalidFraming`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }
}

impl MarshalSize for RtpPacket {
    fn marshal_size(&self) -> usize {
        self.header.marshal_size() + self.payload.len()
    }
}

impl Marshal for RtpPacket {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let hn = self.header.marshal_to(buf)?;
        let need = hn + self.payload.len();
        if buf.len() < need {
            return Err(Error::WrongMarshalSize { need, have: buf.len() });
        }
        buf[hn..need].copy_from_slice(&self.payload);
        Ok(need)
    }
}

impl Unmarshal for RtpPacket {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = RtpHeader::unmarshal(buf)?;
        let mut payload = buf.copy_to_bytes(buf.remaining());
        if header.padding {
            let pad_len = *payload.last().ok_or_else(|| Error::short("rtp_pad_len"))? as usize;
            if pad_len == 0 || pad_len > payload.len() {
                return Err(Error::short("rtp_pad_len"));
            }
            payload.truncate(payload.len() - pad_len);
        }
        Ok(RtpPacket { header, payload })
    }
}

/// Extended, rollover-aware sequence number used to index the SRTP replay
/// window and jitter buffer origin math.
pub fn extend_sequence(cycles: u32, seq: u16) -> u64 {
    ((cycles as u64) << 16) | seq as u64
}

pub fn pad_to(buf: &mut bytes::BytesMut, multiple: usize) {
    let rem = buf.len() % multiple;
    if rem != 0 {
        let pad_len = multiple - rem;
        for i in 0..pad_len {
            if i + 1 == pad_len {
                buf.put_u8(pad_len as u8);
            } else {
                buf.put_u8(0);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::RtpHeader;

    #[test]
    fn round_trip_simple_packet() {
        let pkt = RtpPacket::new(
            RtpHeader {
                payload_type: 111,
                sequence_number: 5,
                timestamp: 1000,
                ssrc: 42,
                marker: true,
                ..Default::default()
            },
            Bytes::from_static(b"hello"),
        );
        let buf = pkt.marshal().unwrap();
        let mut b = &buf[..];
        let parsed = RtpPacket::unmarshal(&mut b).unwrap();
        assert_eq!(parsed, pkt);
    }

    #[test]
    fn padding_only_packet_accepted() {
        let mut header = RtpHeader {
            padding: true,
            ..Default::default()
        };
        header.sequence_number = 1;
        let mut raw = header.marshal().unwrap();
        raw.extend_from_slice(&[0, 0, 0, 4]); // pad_len=4
        let mut b = &raw[..];
        let pkt = RtpPacket::unmarshal(&mut b).unwrap();
        assert!(pkt.payload.is_empty());
    }

    #[test]
    fn zero_pad_len_rejected() {
        let mut header = RtpHeader {
            padding: true,
            ..Default::default()
        };
        header.sequence_number = 1;
        let mut raw = header.marshal().unwrap();
        raw.extend_from_slice(&[0]);
        let mut b = &raw[..];
        assert!(RtpPacket::unmarshal(&mut b).is_err());
    }

    #[test]
    fn extend_sequence_orders_across_wrap() {
        assert!(extend_sequence(1, 0) > extend_sequence(0, 65535));
    }
}
