//! H.264 RTP packetization (RFC 6184): Annex-B bitstream splitting,
//! single-NAL-unit / STAP-A / FU-A modes, and the matching depacketizer.
//!
//! Grounded on aiortc's `codecs/h264.py` `_packetize_fu_a`/`_packetize_stap_a`/
//! `H264PayloadDescriptor.parse`, with one correction: `_packetize_stap_a`'s
//! aggregated-header update (`if stap_header & 0x60 > nri: stap_header =
//! stap_header & 0x9f | nri`) can *decrease* the header's NRI when a later
//! NALU disagrees, where RFC 6184 §5.7.1 requires the header's F bit to be
//! the bitwise OR and its NRI to be the *maximum* of every constituent NALU.
//! [`merge_f_nri`] implements the corrected rule.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rtc_shared::error::{Error, Result};

use super::PACKET_MAX;

const NAL_TYPE_FU_A: u8 = 28;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_SEI: u8 = 6;

const NAL_HEADER_SIZE: usize = 1;
const FU_A_HEADER_SIZE: usize = 2;
const LENGTH_FIELD_SIZE: usize = 2;
const STAP_A_HEADER_SIZE: usize = NAL_HEADER_SIZE + LENGTH_FIELD_SIZE;

/// Folds one more constituent NALU's header byte into a running `(F, NRI)`
/// accumulator for a STAP-A aggregate header. `f` and `nri` are already
/// masked/positioned as in a NAL header (`0x80` and `0x60` respectively).
fn merge_f_nri(acc_f: u8, acc_nri: u8, nalu_header: u8) -> (u8, u8) {
    (acc_f | (nalu_header & 0x80), acc_nri.max(nalu_header & 0x60))
}

/// Splits an Annex-B bitstream (`00 00 01` or `00 00 00 01` start codes)
/// into its constituent NALUs, in order. Each match records where its
/// start-code zero run began (`nal_end` for the previous NALU) and where
/// the NALU payload itself starts (just past the `01`).
fn split_annex_b(buf: &[u8]) -> Vec<&[u8]> {
    let len = buf.len();
    // (zero-run start, nal payload start)
    let mut marks: Vec<(usize, usize)> = Vec::new();
    let mut i = 0;
    while i + 3 <= len {
        if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 {
            marks.push((i, i + 3));
            i += 3;
            continue;
        }
        if i + 4 <= len && buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 0 && buf[i + 3] == 1 {
            marks.push((i, i + 4));
            i += 4;
            continue;
        }
        i += 1;
    }
    let mut nalus = Vec::with_capacity(marks.len());
    for (idx, &(_, nal_start)) in marks.iter().enumerate() {
        let nal_end = marks.get(idx + 1).map(|&(zero_run_start, _)| zero_run_start).unwrap_or(len);
        if nal_start < nal_end {
            nalus.push(&buf[nal_start..nal_end]);
        }
    }
    nalus
}

fn packetize_fu_a(nalu: &[u8]) -> Vec<Bytes> {
    let available_size = PACKET_MAX - FU_A_HEADER_SIZE;
    let payload_size = nalu.len() - NAL_HEADER_SIZE;
    let num_packets = payload_size.div_ceil(available_size).max(1);
    let mut num_larger_packets = payload_size % num_packets;
    let package_size = payload_size / num_packets;

    let f_nri = nalu[0] & (0x80 | 0x60);
    let nal_type = nalu[0] & 0x1f;
    let fu_indicator = f_nri | NAL_TYPE_FU_A;

    let mut packets = Vec::with_capacity(num_packets);
    let mut offset = NAL_HEADER_SIZE;
    let mut first = true;
    while offset < nalu.len() {
        let this_size = if num_larger_packets > 0 {
            num_larger_packets -= 1;
            package_size + 1
        } else {
            package_size
        };
        let end = offset + this_size;
        let is_last = end >= nalu.len();
        let fu_header = if first {
            nal_type | 0x80
        } else if is_last {
            nal_type | 0x40
        } else {
            nal_type
        };

        let mut packet = BytesMut::with_capacity(FU_A_HEADER_SIZE + this_size);
        packet.put_u8(fu_indicator);
        packet.put_u8(fu_header);
        packet.extend_from_slice(&nalu[offset..end.min(nalu.len())]);
        packets.push(packet.freeze());

        offset = end;
        first = false;
    }
    packets
}

/// Aggregates as many leading NALUs of `nalus` as fit in one STAP-A packet
/// (or, if even the first one doesn't fit alongside the STAP-A header,
/// emits it alone as a single NAL unit). Returns the packet and how many
/// input NALUs it consumed.
fn packetize_stap_a(nalus: &[&[u8]]) -> (Bytes, usize) {
    let mut available = PACKET_MAX - STAP_A_HEADER_SIZE;
    let mut f = 0u8;
    let mut nri = 0u8;
    let mut payload = BytesMut::new();
    let mut count = 0;

    for &nalu in nalus {
        if nalu.len() + LENGTH_FIELD_SIZE > available {
            break;
        }
        let (new_f, new_nri) = merge_f_nri(f, nri, nalu[0]);
        f = new_f;
        nri = new_nri;
        available -= LENGTH_FIELD_SIZE + nalu.len();
        payload.put_u16(nalu.len() as u16);
        payload.extend_from_slice(nalu);
        count += 1;
    }

    if count <= 1 {
        return (Bytes::copy_from_slice(nalus[0]), 1);
    }

    let header = f | nri | NAL_TYPE_STAP_A;
    let mut out = BytesMut::with_capacity(1 + payload.len());
    out.put_u8(header);
    out.extend_from_slice(&payload);
    (out.freeze(), count)
}

/// Fragments an Annex-B H.264 bitstream into RTP payloads, discarding SEI
/// NALUs (type 6) and choosing single-NAL/STAP-A/FU-A per NALU size.
pub struct H264Packetizer;

impl H264Packetizer {
    pub fn new() -> Self {
        H264Packetizer
    }

    pub fn packetize(&mut self, bitstream: &[u8]) -> Vec<Bytes> {
        let nalus: Vec<&[u8]> = split_annex_b(bitstream)
            .into_iter()
            .filter(|nalu| !nalu.is_empty() && (nalu[0] & 0x1f) != NAL_TYPE_SEI)
            .collect();

        let mut packets = Vec::new();
        let mut i = 0;
        while i < nalus.len() {
            if nalus[i].len() > PACKET_MAX {
                packets.extend(packetize_fu_a(nalus[i]));
                i += 1;
            } else {
                let (packet, consumed) = packetize_stap_a(&nalus[i..]);
                packets.push(packet);
                i += consumed;
            }
        }
        packets
    }
}

impl Default for H264Packetizer {
    fn default() -> Self {
        Self::new()
    }
}

/// `first_fragment` mirrors the RTP-level "first packet of an access unit"
/// flag: true for single-NAL and STAP-A packets (a complete unit in one
/// packet, or an aggregate starting one), and for the first fragment of an
/// FU-A run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H264PayloadDescriptor {
    pub first_fragment: bool,
}

/// Reconstructs an Annex-B byte stream (re-inserting `00 00 00 01` start
/// codes) from one RTP payload. A STAP-A payload expands to every NALU it
/// aggregated, concatenated with their own start codes.
pub fn depacketize(data: &[u8]) -> Result<(H264PayloadDescriptor, BytesMut)> {
    if data.is_empty() {
        return Err(Error::short("h264_empty_payload"));
    }
    let mut output = BytesMut::new();
    let nal_type = data[0] & 0x1f;

    if nal_type == NAL_TYPE_FU_A {
        if data.len() < FU_A_HEADER_SIZE {
            return Err(Error::short("h264_fu_a_truncated"));
        }
        let f_nri = data[0] & (0x80 | 0x60);
        let original_nal_type = data[1] & 0x1f;
        let first_fragment = data[1] & 0x80 != 0;

        if first_fragment {
            output.extend_from_slice(&[0, 0, 0, 1]);
            output.extend_from_slice(&[f_nri | original_nal_type]);
        }
        output.extend_from_slice(&data[FU_A_HEADER_SIZE..]);
        return Ok((H264PayloadDescriptor { first_fragment }, output));
    }

    let mut offsets = Vec::new();
    if nal_type == NAL_TYPE_STAP_A {
        if data.len() <= STAP_A_HEADER_SIZE {
            return Err(Error::short("h264_stap_a_truncated"));
        }
        let mut buf = Bytes::copy_from_slice(&data[1..]);
        let mut offset = 1;
        while buf.remaining() > 0 {
            if buf.remaining() < LENGTH_FIELD_SIZE {
                return Err(Error::short("h264_stap_a_length_field_truncated"));
            }
            let nalu_size = buf.get_u16() as usize;
            offset += LENGTH_FIELD_SIZE;
            if offset > data.len() || nalu_size > buf.remaining() {
                return Err(Error::short("h264_stap_a_bad_nalu_length"));
            }
            offsets.push(offset);
            buf.advance(nalu_size);
            offset += nalu_size;
        }
    } else {
        offsets.push(0);
    }
    offsets.push(data.len() + LENGTH_FIELD_SIZE);

    for pair in offsets.windows(2) {
        let (start, end) = (pair[0], pair[1] - LENGTH_FIELD_SIZE);
        output.extend_from_slice(&[0, 0, 0, 1]);
        output.extend_from_slice(&data[start..end]);
    }

    Ok((H264PayloadDescriptor { first_fragment: true }, output))
}

#[cfg(test)]
mod test {
    use super::*;

    fn annex_b(nalus: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for nalu in nalus {
            buf.extend_from_slice(&[0, 0, 0, 1]);
            buf.extend_from_slice(nalu);
        }
        buf
    }

    #[test]
    fn splits_annex_b_into_nalus() {
        let sps: &[u8] = &[0x67, 1, 2, 3];
        let pps: &[u8] = &[0x68, 4, 5];
        let idr: &[u8] = &[0x65, 6, 7, 8, 9];
        let bitstream = annex_b(&[sps, pps, idr]);
        let nalus = split_annex_b(&bitstream);
        assert_eq!(nalus, vec![sps, pps, idr]);
    }

    #[test]
    fn sei_nalus_are_discarded() {
        let sps: &[u8] = &[0x67, 1, 2];
        let sei: &[u8] = &[0x06, 9, 9, 9];
        let idr: &[u8] = &[0x65, 3, 4];
        let bitstream = annex_b(&[sps, sei, idr]);
        let mut packetizer = H264Packetizer::new();
        let packets = packetizer.packetize(&bitstream);
        // sps + idr aggregate into one STAP-A; sei never appears.
        assert_eq!(packets.len(), 1);
        let (_, reconstructed) = depacketize(&packets[0]).unwrap();
        assert!(!reconstructed.windows(sei.len()).any(|w| w == sei));
    }

    #[test]
    fn small_nalus_aggregate_into_stap_a_and_round_trip() {
        let sps: &[u8] = &[0x67, 1, 2, 3];
        let pps: &[u8] = &[0x68, 4, 5];
        let bitstream = annex_b(&[sps, pps]);
        let mut packetizer = H264Packetizer::new();
        let packets = packetizer.packetize(&bitstream);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][0] & 0x1f, NAL_TYPE_STAP_A);

        let (descriptor, reconstructed) = depacketize(&packets[0]).unwrap();
        assert!(descriptor.first_fragment);
        assert_eq!(reconstructed, annex_b(&[sps, pps]));
    }

    #[test]
    fn stap_a_header_nri_takes_the_max_not_a_buggy_comparison() {
        // sps carries NRI=0x40, pps carries the higher NRI=0x60; the
        // aggregate header must end up with 0x60, not silently keep 0x40.
        let sps: &[u8] = &[0x47, 1, 2]; // 0x47 = F=0 NRI=0x40 type=7
        let pps: &[u8] = &[0x68, 3, 4]; // 0x68 = F=0 NRI=0x60 type=8
        let bitstream = annex_b(&[sps, pps]);
        let mut packetizer = H264Packetizer::new();
        let packets = packetizer.packetize(&bitstream);
        assert_eq!(packets[0][0] & 0x60, 0x60);
    }

    #[test]
    fn large_nalu_fragments_via_fu_a_and_round_trips() {
        let mut nalu = vec![0x65u8];
        nalu.extend(std::iter::repeat(0xAB).take(PACKET_MAX * 2));
        let bitstream = annex_b(&[&nalu]);
        let mut packetizer = H264Packetizer::new();
        let packets = packetizer.packetize(&bitstream);
        assert!(packets.len() > 1);
        for packet in &packets {
            assert_eq!(packet[0] & 0x1f, NAL_TYPE_FU_A);
        }

        let mut reconstructed = BytesMut::new();
        for (i, packet) in packets.iter().enumerate() {
            let (descriptor, chunk) = depacketize(packet).unwrap();
            assert_eq!(descriptor.first_fragment, i == 0);
            // only the first fragment's reconstruction carries the
            // re-inserted start code and original NAL header; later
            // fragments are pure continuation bytes.
            reconstructed.extend_from_slice(&chunk);
        }
        assert_eq!(reconstructed, annex_b(&[&nalu]));
    }
}
