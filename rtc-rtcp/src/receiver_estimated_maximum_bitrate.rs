//! REMB, draft-alvestrand-rmcat-remb-03: PSFB fmt=15 (AFB) whose FCI opens
//! with the ASCII marker "REMB" followed by an exponent/mantissa-encoded
//! bitrate and the list of SSRCs it applies to.

use bytes::{Buf, BufMut};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{format, packet_type, put_header, RtcpHeader};

const REMB_IDENTIFIER: [u8; 4] = *b"REMB";
const MAX_MANTISSA: u64 = (1 << 18) - 1;

/// Encodes `bitrate_bps` as (6-bit exponent, 18-bit mantissa) such that
/// `mantissa << exponent` is the closest representable value not exceeding
/// the input (matching common REMB encoders).
pub fn encode_brmantissa_exp(bitrate_bps: u64) -> (u8, u32) {
    let mut exp = 0u8;
    let mut mantissa = bitrate_bps;
    while mantissa > MAX_MANTISSA {
        mantissa >>= 1;
        exp += 1;
    }
    (exp.min(63), mantissa as u32)
}

pub fn decode_brmantissa_exp(exp: u8, mantissa: u32) -> u64 {
    (mantissa as u64) << exp
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceiverEstimatedMaximumBitrate {
    pub sender_ssrc: u32,
    pub bitrate: u64,
    pub ssrcs: Vec<u32>,
}

impl MarshalSize for ReceiverEstimatedMaximumBitrate {
    fn marshal_size(&self) -> usize {
        4 + 4 + 4 + 4 + 4 + self.ssrcs.len() * 4
    }
}

impl Marshal for ReceiverEstimatedMaximumBitrate {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let need = self.marshal_size();
        if buf.len() < need {
            return Err(Error::WrongMarshalSize { need, have: buf.len() });
        }
        let body_len = need - 4;
        let mut tmp = bytes::BytesMut::with_capacity(need);
        put_header(&mut tmp, packet_type::PAYLOAD_SPECIFIC_FEEDBACK, format::REMB_AFB, body_len);
        tmp.put_u32(self.sender_ssrc);
        tmp.put_u32(0); // media ssrc is always 0 for REMB
        tmp.put_slice(&REMB_IDENTIFIER);
        let (exp, mantissa) = encode_brmantissa_exp(self.bitrate);
        tmp.put_u8(self.ssrcs.len() as u8);
        let word = ((exp as u32) << 26) | (mantissa & 0x3FFFF);
        tmp.put_slice(&word.to_be_bytes()[1..4]);
        for s in &self.ssrcs {
            tmp.put_u32(*s);
        }
        buf[..need].copy_from_slice(&tmp);
        Ok(need)
    }
}

impl Unmarshal for ReceiverEstimatedMaximumBitrate {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = RtcpHeader::unmarshal(buf)?;
        if header.packet_type != packet_type::PAYLOAD_SPECIFIC_FEEDBACK || header.count != format::REMB_AFB {
            return Err(Error::InvalidFraming { field: "remb_packet_type" });
        }
        if buf.remaining() < 8 + 4 + 4 {
            return Err(Error::short("remb_header"));
        }
        let sender_ssrc = buf.get_u32();
        let _media_ssrc = buf.get_u32();
        let mut ident = [0u8; 4];
        buf.copy_to_slice(&mut ident);
        if ident != REMB_IDENTIFIER {
            return Err(Error::InvalidFraming { field: "remb_identifier" });
        }
        let num_ssrc = buf.get_u8() as usize;
        let mut word_bytes = [0u8; 4];
        word_bytes[1..4].copy_from_slice(&[buf.get_u8(), buf.get_u8(), buf.get_u8()]);
        let word = u32::from_be_bytes(word_bytes);
        let exp = (word >> 26) as u8;
        let mantissa = word & 0x3FFFF;
        if buf.remaining() < num_ssrc * 4 {
            return Err(Error::short("remb_ssrcs"));
        }
        let mut ssrcs = Vec::with_capacity(num_ssrc);
        for _ in 0..num_ssrc {
            ssrcs.push(buf.get_u32());
        }
        Ok(ReceiverEstimatedMaximumBitrate {
            sender_ssrc,
            bitrate: decode_brmantissa_exp(exp, mantissa),
            ssrcs,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bitrate_round_trip_top_bits_match() {
        for bitrate in [1_000u64, 1_500_000, 8_000_000, 50_000_000] {
            let (exp, mantissa) = encode_brmantissa_exp(bitrate);
            let decoded = decode_brmantissa_exp(exp, mantissa);
            // top 18 mantissa bits worth of precision must match
            assert!((decoded as i64 - bitrate as i64).unsigned_abs() <= (1u64 << exp) as u64);
        }
    }

    #[test]
    fn packet_round_trip() {
        let remb = ReceiverEstimatedMaximumBitrate {
            sender_ssrc: 42,
            bitrate: 2_500_000,
            ssrcs: vec![1, 2, 3],
        };
        let buf = remb.marshal().unwrap();
        let mut b = &buf[..];
        let parsed = ReceiverEstimatedMaximumBitrate::unmarshal(&mut b).unwrap();
        assert_eq!(parsed.sender_ssrc, remb.sender_ssrc);
        assert_eq!(parsed.ssrcs, remb.ssrcs);
        assert!((parsed.bitrate as i64 - remb.bitrate as i64).abs() < 32);
    }
}
