//! RTP receiver: owns inbound media for one kind (audio|video) as sans-io
//! state, collapsing packet handling and periodic RTCP reporting into
//! `handle_rtp`/`handle_rtcp`/`handle_timeout` calls the host makes on its
//! own schedule.

use std::collections::{BTreeSet, VecDeque};

use bytes::Bytes;
use rand::Rng;

use rtc_shared::error::Result;
use rtc_shared::seq::SeqNum;
use rtcp::{PictureLossIndication, ReportBlock, RtcpPacket, TransportLayerNack};
use rtp::{RtpHeader, RtpPacket};

use media::codecs::{h264, vp8, vp9};
use media::jitter::JitterBuffer;

const RTCP_INTERVAL_BASE_MS: u64 = 500;
const RTCP_INTERVAL_JITTER_MS: u64 = 1000;

/// Which depacketizer a receiver's negotiated payload type uses.
pub enum Depacketizer {
    Vp8,
    Vp9,
    H264,
    Audio,
}

impl Depacketizer {
    /// Strips the codec-specific descriptor, returning whether this
    /// payload opens a new coded frame alongside the remaining media bytes.
    fn depacketize(&self, payload: &[u8]) -> Result<(bool, Bytes)> {
        match self {
            Depacketizer::Vp8 => {
                let (d, b) = vp8::depacketize(payload)?;
                Ok((d.start_of_partition && d.partition_index == 0, b))
            }
            Depacketizer::Vp9 => {
                let (d, b) = vp9::depacketize(payload)?;
                Ok((d.begin_frame, b))
            }
            Depacketizer::H264 => {
                let (d, b) = h264::depacketize(payload)?;
                Ok((d.first_fragment, b.freeze()))
            }
            Depacketizer::Audio => Ok((true, Bytes::copy_from_slice(payload))),
        }
    }
}

/// One reassembled coded frame handed to the host's decoder.
pub struct DecodedFrame {
    pub payload_type: u8,
    pub data: Bytes,
    pub timestamp: u32,
}

/// Per-remote-ssrc running statistics.
#[derive(Debug, Clone, Default)]
pub struct StreamStatistics {
    ssrc: u32,
    base_seq: u16,
    max_seq: u16,
    cycles: u32,
    packets_received: u64,
    jitter_q4: f64,
    last_arrival_ms: Option<i64>,
    last_rtp_timestamp: Option<u32>,
    prior_packets_received_at_rr: u64,
    prior_expected_at_rr: u64,
    initialized: bool,
}

impl StreamStatistics {
    fn update(&mut self, header: &RtpHeader, arrival_ms: i64, clock_rate: u32) {
        if !self.initialized || header.ssrc != self.ssrc {
            self.ssrc = header.ssrc;
            self.base_seq = header.sequence_number;
            self.max_seq = header.sequence_number;
            self.cycles = 0;
            self.packets_received = 0;
            self.jitter_q4 = 0.0;
            self.last_arrival_ms = None;
            self.last_rtp_timestamp = None;
            self.prior_packets_received_at_rr = 0;
            self.prior_expected_at_rr = 0;
            self.initialized = true;
        } else if SeqNum::new(header.sequence_number).gt(SeqNum::new(self.max_seq)) {
            // A 16-bit wraparound looks like the sequence number going
            // numerically backwards even though it is wrap-aware "greater".
            if header.sequence_number < self.max_seq {
                self.cycles = self.cycles.wrapping_add(1);
            }
            self.max_seq = header.sequence_number;
        }
        self.packets_received += 1;

        if let (Some(last_arrival), Some(last_ts)) = (self.last_arrival_ms, self.last_rtp_timestamp) {
            if clock_rate > 0 {
                let arrival_delta_units = ((arrival_ms - last_arrival) as f64) * (clock_rate as f64 / 1000.0);
                let timestamp_delta = header.timestamp.wrapping_sub(last_ts) as i32 as f64;
                let d = (arrival_delta_units - timestamp_delta).abs();
                self.jitter_q4 += d - (self.jitter_q4 + 8.0) / 16.0;
            }
        }
        self.last_arrival_ms = Some(arrival_ms);
        self.last_rtp_timestamp = Some(header.timestamp);
    }

    fn extended_max_seq(&self) -> u32 {
        (self.cycles << 16) | self.max_seq as u32
    }

    fn jitter(&self) -> u32 {
        (self.jitter_q4 as i64).max(0) as u32 >> 4
    }

    /// `(fraction_lost, cumulative_lost)` since the last time this was
    /// called, per RFC 3550 §6.4.1.
    fn loss_since_last_report(&mut self) -> (u8, i32) {
        let extended_max = self.extended_max_seq() as i64;
        let expected = extended_max - self.base_seq as i64 + 1;
        let lost = (expected - self.packets_received as i64).clamp(-(1 << 23), (1 << 23) - 1);

        let expected_interval = expected as u64 - self.prior_expected_at_rr;
        let received_interval = self.packets_received - self.prior_packets_received_at_rr;
        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64).min(255) as u8
        };

        self.prior_expected_at_rr = expected as u64;
        self.prior_packets_received_at_rr = self.packets_received;

        (fraction, lost as i32)
    }
}

/// Tracks sequence-number gaps and emits one RTPFB NACK per newly-missing
/// run.
#[derive(Debug, Default)]
struct NackGenerator {
    ssrc: Option<u32>,
    max_seq: u16,
    missing: BTreeSet<u16>,
    initialized: bool,
}

impl NackGenerator {
    /// Returns the freshly-missing set to NACK, if this packet's arrival
    /// extended the known range.
    fn observe(&mut self, ssrc: u32, seq: u16) -> Option<Vec<u16>> {
        if self.ssrc != Some(ssrc) {
            self.ssrc = Some(ssrc);
            self.max_seq = seq;
            self.missing.clear();
            self.initialized = true;
            return None;
        }
        self.missing.remove(&seq);
        if !SeqNum::new(seq).gt(SeqNum::new(self.max_seq)) {
            return None;
        }
        let mut newly_missing = Vec::new();
        let mut s = self.max_seq.wrapping_add(1);
        while s != seq {
            self.missing.insert(s);
            newly_missing.push(s);
            s = s.wrapping_add(1);
        }
        self.max_seq = seq;
        if newly_missing.is_empty() {
            None
        } else {
            Some(self.missing.iter().copied().collect())
        }
    }
}

pub struct RtpReceiverConfig {
    pub local_ssrc: u32,
    pub payload_type: u8,
    pub depacketizer: Depacketizer,
    pub clock_rate: u32,
    pub is_audio: bool,
    pub jitter_buffer_capacity: usize,
}

pub struct RtpReceiver {
    local_ssrc: u32,
    payload_type: u8,
    depacketizer: Depacketizer,
    clock_rate: u32,
    is_audio: bool,

    stats: StreamStatistics,
    nack_gen: NackGenerator,
    jitter_buffer: JitterBuffer,

    last_sr_compact: Option<u32>,
    last_sr_arrival_ms: Option<u64>,

    next_rtcp_ms: Option<u64>,
    transmit: VecDeque<Bytes>,
    frames: VecDeque<DecodedFrame>,
}

impl RtpReceiver {
    pub fn new(config: RtpReceiverConfig) -> Self {
        RtpReceiver {
            local_ssrc: config.local_ssrc,
            payload_type: config.payload_type,
            depacketizer: config.depacketizer,
            clock_rate: config.clock_rate,
            is_audio: config.is_audio,
            stats: StreamStatistics::default(),
            nack_gen: NackGenerator::default(),
            jitter_buffer: JitterBuffer::new(config.jitter_buffer_capacity),
            last_sr_compact: None,
            last_sr_arrival_ms: None,
            next_rtcp_ms: None,
            transmit: VecDeque::new(),
            frames: VecDeque::new(),
        }
    }

    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.transmit.pop_front()
    }

    pub fn poll_timeout(&self) -> Option<u64> {
        self.next_rtcp_ms
    }

    pub fn poll_frame(&mut self) -> Option<DecodedFrame> {
        self.frames.pop_front()
    }

    /// Feeds one RTP packet already routed to this receiver. Drops silently
    /// when the payload type doesn't match what this receiver negotiated.
    pub fn handle_rtp(&mut self, packet: &RtpPacket, arrival_ms: i64) -> Result<()> {
        if packet.header.payload_type != self.payload_type {
            return Ok(());
        }

        self.stats.update(&packet.header, arrival_ms, self.clock_rate);

        if let Some(newly_missing) = self.nack_gen.observe(packet.header.ssrc, packet.header.sequence_number) {
            let nack = TransportLayerNack {
                sender_ssrc: self.local_ssrc,
                media_ssrc: packet.header.ssrc,
                nacks: rtcp::pack_nack_pairs(newly_missing),
            };
            self.transmit.push_back(rtcp::marshal_compound(&[RtcpPacket::TransportLayerNack(nack)])?);
        } else {
            self.nack_gen.missing.remove(&packet.header.sequence_number);
        }

        if self.is_audio {
            let (_, payload) = self.depacketizer.depacketize(&packet.payload)?;
            self.frames.push_back(DecodedFrame { payload_type: self.payload_type, data: payload, timestamp: packet.header.timestamp });
            return Ok(());
        }

        let (first_in_frame, payload) = self.depacketizer.depacketize(&packet.payload)?;
        for frame in self.jitter_buffer.add(
            packet.header.sequence_number,
            packet.header.timestamp,
            first_in_frame,
            packet.header.marker,
            payload,
        ) {
            self.frames.push_back(DecodedFrame { payload_type: self.payload_type, data: frame.payload, timestamp: frame.timestamp });
        }
        Ok(())
    }

    /// Handles RTCP addressed to this receiver: SR updates remote-outbound
    /// stats, BYE is surfaced via the return value for the host to stop
    /// the track.
    pub fn handle_rtcp(&mut self, packet: &RtcpPacket, now_ms: u64) -> bool {
        match packet {
            RtcpPacket::SenderReport(sr) => {
                self.last_sr_compact = Some(rtc_shared::time::ntp_to_compact(sr.sender_info.ntp_time));
                self.last_sr_arrival_ms = Some(now_ms);
                false
            }
            RtcpPacket::Goodbye(_) => true,
            _ => false,
        }
    }

    fn schedule_next_rtcp(&mut self, now_ms: u64) {
        let jitter_ms = rand::rng().random_range(0..RTCP_INTERVAL_JITTER_MS);
        self.next_rtcp_ms = Some(now_ms + RTCP_INTERVAL_BASE_MS + jitter_ms);
    }

    /// Emits an RR if a remote stream is known and the schedule is due.
    /// Call unconditionally; it is a no-op before the first scheduled
    /// deadline.
    pub fn handle_timeout(&mut self, now_ms: u64) -> Result<()> {
        match self.next_rtcp_ms {
            None => {
                self.schedule_next_rtcp(now_ms);
                return Ok(());
            }
            Some(deadline) if now_ms < deadline => return Ok(()),
            _ => {}
        }
        if self.stats.initialized {
            let (fraction_lost, packets_lost) = self.stats.loss_since_last_report();
            let (last_sr, delay_last_sr) = match (self.last_sr_compact, self.last_sr_arrival_ms) {
                (Some(lsr), Some(arrival)) => (lsr, (((now_ms.saturating_sub(arrival)) as u64) * 65536 / 1000) as u32),
                _ => (0, 0),
            };
            let rr = rtcp::ReceiverReport {
                ssrc: self.local_ssrc,
                report_blocks: vec![ReportBlock {
                    ssrc: self.stats.ssrc,
                    fraction_lost,
                    packets_lost,
                    last_seq_num: self.stats.extended_max_seq(),
                    jitter: self.stats.jitter(),
                    last_sr,
                    delay_last_sr,
                }],
            };
            self.transmit.push_back(rtcp::marshal_compound(&[RtcpPacket::ReceiverReport(rr)])?);
        }
        self.schedule_next_rtcp(now_ms);
        Ok(())
    }

    /// Requests a keyframe from the given media ssrc via PSFB PLI.
    pub fn send_rtcp_pli(&mut self, media_ssrc: u32) -> Result<()> {
        let pli = PictureLossIndication { sender_ssrc: self.local_ssrc, media_ssrc };
        self.transmit.push_back(rtcp::marshal_compound(&[RtcpPacket::PictureLossIndication(pli)])?);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pkt(seq: u16, ts: u32, ssrc: u32, marker: bool, payload: &[u8]) -> RtpPacket {
        RtpPacket::new(
            RtpHeader { payload_type: 96, sequence_number: seq, timestamp: ts, ssrc, marker, ..Default::default() },
            Bytes::copy_from_slice(payload),
        )
    }

    fn receiver(is_audio: bool, depacketizer: Depacketizer) -> RtpReceiver {
        RtpReceiver::new(RtpReceiverConfig {
            local_ssrc: 1,
            payload_type: 96,
            depacketizer,
            clock_rate: 90000,
            is_audio,
            jitter_buffer_capacity: 128,
        })
    }

    #[test]
    fn audio_packet_produces_frame_immediately() {
        let mut r = receiver(true, Depacketizer::Audio);
        r.handle_rtp(&pkt(1, 0, 42, true, b"pcm"), 0).unwrap();
        let frame = r.poll_frame().unwrap();
        assert_eq!(&frame.data[..], b"pcm");
    }

    #[test]
    fn nack_generated_for_gap() {
        let mut r = receiver(true, Depacketizer::Audio);
        r.handle_rtp(&pkt(1, 0, 42, true, b"a"), 0).unwrap();
        r.handle_rtp(&pkt(3, 0, 42, true, b"c"), 1).unwrap();
        let nack_bytes = r.poll_transmit().unwrap();
        let parsed = rtcp::parse_compound(nack_bytes).unwrap();
        match &parsed[0] {
            RtcpPacket::TransportLayerNack(nack) => {
                assert_eq!(nack.nacks[0].packet_list(), vec![2]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pli_emits_from_local_ssrc() {
        let mut r = receiver(true, Depacketizer::Audio);
        r.send_rtcp_pli(999).unwrap();
        let bytes = r.poll_transmit().unwrap();
        let parsed = rtcp::parse_compound(bytes).unwrap();
        match &parsed[0] {
            RtcpPacket::PictureLossIndication(pli) => {
                assert_eq!(pli.sender_ssrc, 1);
                assert_eq!(pli.media_ssrc, 999);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bye_surfaces_to_caller() {
        let mut r = receiver(true, Depacketizer::Audio);
        let bye = RtcpPacket::Goodbye(rtcp::Goodbye { sources: vec![42], reason: Bytes::new() });
        assert!(r.handle_rtcp(&bye, 0));
    }

    #[test]
    fn video_frame_waits_for_complete_jitter_run() {
        let mut r = receiver(false, Depacketizer::Vp8);
        let mut first = media::codecs::vp8::Vp8PayloadDescriptor { start_of_partition: true, ..Default::default() };
        first.partition_index = 0;
        use rtc_shared::marshal::Marshal;
        let mut payload = first.marshal().unwrap();
        payload.extend_from_slice(b"frame");
        r.handle_rtp(&pkt(1, 1000, 7, true, &payload), 0).unwrap();
        assert!(r.poll_frame().is_some());
    }
}
