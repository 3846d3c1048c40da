//! SRTP/SRTCP protect & unprotect sessions. One inbound and one outbound
//! `SrtpSession` are created per DTLS-SRTP transport (§4.2), each keyed from
//! its own half of the exported keying material.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{Marshal, Unmarshal};
use rtc_shared::replay::ReplayDetector;
use rtcp::header::RtcpHeader;
use rtp::RtpPacket;

use crate::cipher::{apply_keystream, auth_tag, rtcp_iv, rtp_iv};
use crate::key_derivation::{derive, label};
use crate::protection_profile::{ProtectionProfile, AES128_CM_SHA1_80};

#[derive(Debug, Default, Clone)]
struct StreamState {
    roc: u32,
    highest_seq: u16,
    seen_first: bool,
    replay: Option<ReplayDetector>,
}

/// Keying material for one direction, derived once from the DTLS exporter
/// output and reused for the lifetime of the transport.
#[derive(Debug, Clone)]
pub struct SrtpKeys {
    pub master_key: [u8; 16],
    pub master_salt: [u8; 14],
}

pub struct SrtpSession {
    profile: ProtectionProfile,
    rtp_enc_key: Vec<u8>,
    rtp_auth_key: Vec<u8>,
    rtp_salt: Vec<u8>,
    rtcp_enc_key: Vec<u8>,
    rtcp_auth_key: Vec<u8>,
    rtcp_salt: Vec<u8>,
    streams: HashMap<u32, StreamState>,
    srtcp_send_index: HashMap<u32, u32>,
    allow_repeat_tx: bool,
    replay_window_enabled: bool,
}

impl SrtpSession {
    pub fn new(keys: &SrtpKeys, allow_repeat_tx: bool) -> Self {
        let profile = AES128_CM_SHA1_80;
        Self {
            rtp_enc_key: derive(&keys.master_key, &keys.master_salt, label::RTP_ENCRYPTION, profile.key_len),
            rtp_auth_key: derive(&keys.master_key, &keys.master_salt, label::RTP_AUTH, profile.auth_key_len),
            rtp_salt: derive(&keys.master_key, &keys.master_salt, label::RTP_SALT, profile.salt_len),
            rtcp_enc_key: derive(&keys.master_key, &keys.master_salt, label::RTCP_ENCRYPTION, profile.key_len),
            rtcp_auth_key: derive(&keys.master_key, &keys.master_salt, label::RTCP_AUTH, profile.auth_key_len),
            rtcp_salt: derive(&keys.master_key, &keys.master_salt, label::RTCP_SALT, profile.salt_len),
            profile,
            streams: HashMap::new(),
            srtcp_send_index: HashMap::new(),
            allow_repeat_tx,
            replay_window_enabled: true,
        }
    }

    fn stream_mut(&mut self, ssrc: u32) -> &mut StreamState {
        self.streams.entry(ssrc).or_default()
    }

    /// RFC 3711 Appendix A's rollover guess, without re-ordering tolerance:
    /// only the sign of the half-window distance between the incoming
    /// sequence and the highest seen so far decides whether we've wrapped.
    fn guess_roc(roc: u32, highest_seq: u16, seq: u16) -> u32 {
        let v = highest_seq as i32;
        let s = seq as i32;
        if v < 32768 {
            if s - v > 32768 {
                roc.wrapping_sub(1)
            } else {
                roc
            }
        } else if v - 32768 > s {
            roc.wrapping_add(1)
        } else {
            roc
        }
    }

    /// Encrypts and authenticates one outbound RTP packet.
    pub fn protect_rtp(&mut self, packet: &RtpPacket) -> Result<Bytes> {
        let ssrc = packet.header.ssrc;
        let seq = packet.header.sequence_number;
        let roc = {
            let st = self.stream_mut(ssrc);
            if !st.seen_first {
                st.seen_first = true;
                st.highest_seq = seq;
            } else {
                st.roc = Self::guess_roc(st.roc, st.highest_seq, seq);
                if seq > st.highest_seq || st.highest_seq.wrapping_sub(seq) > 32768 {
                    st.highest_seq = seq;
                }
            }
            st.roc
        };

        let header_bytes = packet.header.marshal()?;
        let mut out = BytesMut::with_capacity(header_bytes.len() + packet.payload.len() + self.profile.auth_tag_len);
        out.extend_from_slice(&header_bytes);
        let mut payload = packet.payload.to_vec();
        let iv = rtp_iv(&self.rtp_salt, ssrc, roc, seq);
        apply_keystream(&self.rtp_enc_key, iv, &mut payload);
        out.extend_from_slice(&payload);

        let mut auth_input = out.clone();
        auth_input.put_u32(roc);
        let tag = auth_tag(&self.rtp_auth_key, &auth_input);
        out.extend_from_slice(&tag);
        Ok(out.freeze())
    }

    /// Verifies and decrypts one inbound SRTP datagram, rejecting replays.
    pub fn unprotect_rtp(&mut self, data: &[u8]) -> Result<RtpPacket> {
        if data.len() < self.profile.auth_tag_len {
            return Err(Error::short("srtp_packet"));
        }
        let (body, tag) = data.split_at(data.len() - self.profile.auth_tag_len);
        let mut peek = body;
        let header = rtp::RtpHeader::unmarshal(&mut peek)?;
        let ssrc = header.ssrc;
        let seq = header.sequence_number;

        let roc = {
            let st = self.streams.entry(ssrc).or_default();
            if !st.seen_first {
                st.seen_first = true;
                st.highest_seq = seq;
                if self.replay_window_enabled {
                    st.replay = Some(ReplayDetector::new(self.allow_repeat_tx));
                }
                st.roc
            } else {
                Self::guess_roc(st.roc, st.highest_seq, seq)
            }
        };

        let mut auth_input = BytesMut::with_capacity(body.len() + 4);
        auth_input.extend_from_slice(body);
        auth_input.put_u32(roc);
        let expected = auth_tag(&self.rtp_auth_key, &auth_input);
        if !constant_time_eq(&expected, tag) {
            return Err(Error::IntegrityFailure("srtp_auth"));
        }

        let ext_seq = ((roc as u64) << 16) | seq as u64;
        {
            let st = self.streams.get_mut(&ssrc).unwrap();
            if let Some(replay) = st.replay.as_mut() {
                if !replay.accept(ext_seq) {
                    return Err(Error::IntegrityFailure("srtp_replay"));
                }
            }
            if seq > st.highest_seq || st.highest_seq.wrapping_sub(seq) > 32768 {
                st.highest_seq = seq;
                st.roc = roc;
            }
        }

        let hn = peek.as_ptr() as usize - body.as_ptr() as usize;
        let mut encrypted_payload = body[hn..].to_vec();
        let iv = rtp_iv(&self.rtp_salt, ssrc, roc, seq);
        apply_keystream(&self.rtp_enc_key, iv, &mut encrypted_payload);
        Ok(RtpPacket::new(header, Bytes::from(encrypted_payload)))
    }

    /// Encrypts one outbound compound RTCP datagram.
    pub fn protect_rtcp(&mut self, packet_bytes: &[u8], ssrc: u32) -> Result<Bytes> {
        let index = self.srtcp_send_index.entry(ssrc).or_insert(0);
        let this_index = *index;
        *index = index.wrapping_add(1) & 0x7FFF_FFFF;

        // First 8 bytes of an RTCP compound (header + ssrc) stay in the
        // clear; everything after is encrypted, per RFC 3711 §3.4.
        if packet_bytes.len() < 8 {
            return Err(Error::short("srtcp_packet"));
        }
        let (clear, rest) = packet_bytes.split_at(8);
        let mut encrypted = rest.to_vec();
        let iv = rtcp_iv(&self.rtcp_salt, ssrc, this_index);
        apply_keystream(&self.rtcp_enc_key, iv, &mut encrypted);

        let mut out = BytesMut::with_capacity(8 + encrypted.len() + 4 + self.profile.auth_tag_len);
        out.extend_from_slice(clear);
        out.extend_from_slice(&encrypted);
        // E-bit (encrypted flag, always 1 here) | 31-bit index
        out.put_u32(0x8000_0000 | this_index);
        let tag = auth_tag(&self.rtcp_auth_key, &out);
        out.extend_from_slice(&tag);
        Ok(out.freeze())
    }

    pub fn unprotect_rtcp(&mut self, data: &[u8]) -> Result<Bytes> {
        if data.len() < 8 + 4 + self.profile.auth_tag_len {
            return Err(Error::short("srtcp_packet"));
        }
        let (body, tag) = data.split_at(data.len() - self.profile.auth_tag_len);
        let expected = auth_tag(&self.rtcp_auth_key, body);
        if !constant_time_eq(&expected, tag) {
            return Err(Error::IntegrityFailure("srtcp_auth"));
        }
        let (payload_and_index, index_bytes) = body.split_at(body.len() - 4);
        let index_word = u32::from_be_bytes(index_bytes.try_into().unwrap());
        let index = index_word & 0x7FFF_FFFF;

        let mut header_peek = payload_and_index;
        let header = RtcpHeader::unmarshal(&mut header_peek)?;
        let ssrc_bytes = &payload_and_index[4..8];
        let ssrc = u32::from_be_bytes(ssrc_bytes.try_into().unwrap());
        let _ = header;

        let (clear, rest) = payload_and_index.split_at(8);
        let mut decrypted = rest.to_vec();
        let iv = rtcp_iv(&self.rtcp_salt, ssrc, index);
        apply_keystream(&self.rtcp_enc_key, iv, &mut decrypted);

        let mut out = BytesMut::with_capacity(8 + decrypted.len());
        out.extend_from_slice(clear);
        out.extend_from_slice(&decrypted);
        Ok(out.freeze())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

#[cfg(test)]
mod test {
    use super::*;
    use rtp::RtpHeader;

    fn keys() -> SrtpKeys {
        SrtpKeys { master_key: [9u8; 16], master_salt: [3u8; 14] }
    }

    #[test]
    fn rtp_protect_unprotect_round_trip() {
        let mut out_session = SrtpSession::new(&keys(), false);
        let mut in_session = SrtpSession::new(&keys(), true);

        let pkt = RtpPacket::new(
            RtpHeader { payload_type: 96, sequence_number: 10, timestamp: 1000, ssrc: 55, ..Default::default() },
            Bytes::from_static(b"some encoded video bytes"),
        );
        let protected = out_session.protect_rtp(&pkt).unwrap();
        let recovered = in_session.unprotect_rtp(&protected).unwrap();
        assert_eq!(recovered.payload, pkt.payload);
        assert_eq!(recovered.header.sequence_number, pkt.header.sequence_number);
    }

    #[test]
    fn rtp_replay_is_rejected() {
        let mut out_session = SrtpSession::new(&keys(), false);
        let mut in_session = SrtpSession::new(&keys(), false);
        let pkt = RtpPacket::new(
            RtpHeader { sequence_number: 1, ssrc: 1, ..Default::default() },
            Bytes::from_static(b"x"),
        );
        let protected = out_session.protect_rtp(&pkt).unwrap();
        assert!(in_session.unprotect_rtp(&protected).is_ok());
        assert!(in_session.unprotect_rtp(&protected).is_err());
    }

    #[test]
    fn tampered_packet_fails_integrity() {
        let mut out_session = SrtpSession::new(&keys(), false);
        let mut in_session = SrtpSession::new(&keys(), false);
        let pkt = RtpPacket::new(
            RtpHeader { sequence_number: 1, ssrc: 1, ..Default::default() },
            Bytes::from_static(b"x"),
        );
        let mut protected = out_session.protect_rtp(&pkt).unwrap().to_vec();
        let last = protected.len() - 1;
        protected[last] ^= 0xFF;
        assert!(matches!(in_session.unprotect_rtp(&protected), Err(Error::IntegrityFailure(_))));
    }
}
