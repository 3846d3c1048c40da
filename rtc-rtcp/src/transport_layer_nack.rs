//! Generic NACK, RFC 4585 §6.2.1: RTPFB with fmt=1. FCI is a run of
//! (packet_id, bitmask-of-16-following-losses) pairs.

use bytes::{Buf, BufMut};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{format, packet_type, put_header, RtcpHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackPair {
    pub packet_id: u16,
    pub lost_bitmask: u16,
}

impl NackPair {
    /// Sequence numbers this pair covers: the `packet_id` itself plus any
    /// bit set in the bitmask (bit 0 = packet_id+1, ... bit 15 = packet_id+16).
    pub fn packet_list(&self) -> Vec<u16> {
        let mut out = vec![self.packet_id];
        for i in 0..16u16 {
            if self.lost_bitmask & (1 << i) != 0 {
                out.push(self.packet_id.wrapping_add(i + 1));
            }
        }
        out
    }
}

/// Packs a (possibly non-contiguous) sorted set of lost sequence numbers
/// into the minimal run of NACK pairs.
pub fn pack_nack_pairs(mut lost: Vec<u16>) -> Vec<NackPair> {
    lost.sort_unstable();
    lost.dedup();
    let mut pairs = Vec::new();
    let mut i = 0;
    while i < lost.len() {
        let base = lost[i];
        let mut mask = 0u16;
        let mut j = i + 1;
        while j < lost.len() {
            let delta = lost[j].wrapping_sub(base);
            if delta == 0 || delta > 16 {
                break;
            }
            mask |= 1 << (delta - 1);
            j += 1;
        }
        pairs.push(NackPair { packet_id: base, lost_bitmask: mask });
        i = j;
    }
    pairs
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportLayerNack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub nacks: Vec<NackPair>,
}

impl MarshalSize for TransportLayerNack {
    fn marshal_size(&self) -> usize {
        4 + 8 + self.nacks.len() * 4
    }
}

impl Marshal for TransportLayerNack {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let need = self.marshal_size();
        if buf.len() < need {
            return Err(Error::WrongMarshalSize { need, have: buf.len() });
        }
        let body_len = need - 4;
        let mut tmp = bytes::BytesMut::with_capacity(need);
        put_header(&mut tmp, packet_type::TRANSPORT_SPECIFIC_FEEDBACK, format::NACK, body_len);
        tmp.put_u32(self.sender_ssrc);
        tmp.put_u32(self.media_ssrc);
        for p in &self.nacks {
            tmp.put_u16(p.packet_id);
            tmp.put_u16(p.lost_bitmask);
        }
        buf[..need].copy_from_slice(&tmp);
        Ok(need)
    }
}

impl Unmarshal for TransportLayerNack {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = RtcpHeader::unmarshal(buf)?;
        if header.packet_type != packet_type::TRANSPORT_SPECIFIC_FEEDBACK || header.count != format::NACK {
            return Err(Error::InvalidFraming { field: "nack_packet_type" });
        }
        if buf.remaining() < 8 {
            return Err(Error::short("nack_ssrcs"));
        }
        let sender_ssrc = buf.get_u32();
        let media_ssrc = buf.get_u32();
        let mut remaining_bytes = header.length_bytes.saturating_sub(8);
        let mut nacks = Vec::new();
        while remaining_bytes >= 4 && buf.remaining() >= 4 {
            let packet_id = buf.get_u16();
            let lost_bitmask = buf.get_u16();
            nacks.push(NackPair { packet_id, lost_bitmask });
            remaining_bytes -= 4;
        }
        Ok(TransportLayerNack { sender_ssrc, media_ssrc, nacks })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let nack = TransportLayerNack {
            sender_ssrc: 1,
            media_ssrc: 2,
            nacks: vec![NackPair { packet_id: 10, lost_bitmask: 0b101 }],
        };
        let buf = nack.marshal().unwrap();
        let mut b = &buf[..];
        assert_eq!(TransportLayerNack::unmarshal(&mut b).unwrap(), nack);
    }

    #[test]
    fn pack_contiguous_run() {
        let pairs = pack_nack_pairs(vec![5, 6, 8, 30]);
        assert_eq!(pairs[0].packet_id, 5);
        assert_eq!(pairs[0].packet_list(), vec![5, 6, 8]);
        assert_eq!(pairs[1].packet_id, 30);
    }
}
