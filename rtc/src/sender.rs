//! RTP sender: owns outbound media for one track as sans-io state. The
//! host drives it with `send_frame`/`handle_rtcp`/`handle_timeout` instead
//! of running a pair of cooperative RTP/RTCP tasks -- there is nothing here
//! to run them on.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use rand::Rng;

use rtc_shared::error::Result;
use rtc_shared::seq::SeqNum;
use rtcp::source_description::{SdesChunk, SdesItem};
use rtcp::{Goodbye, NackPair, PictureLossIndication, ReceiverEstimatedMaximumBitrate, ReportBlock, RtcpPacket, SenderInfo, SenderReport, SourceDescription};
use rtp::extension::{abs_send_time_from_ntp, uri};
use rtp::{ExtensionMap, RtpHeader, RtpPacket};
use rtc_shared::marshal::Marshal;

use media::codecs::{h264::H264Packetizer, vp8::Vp8Packetizer, vp9::Vp9Packetizer};

/// Size of the sent-packet ring used to answer NACK-driven retransmits.
pub const RTP_HISTORY_SIZE: usize = 128;

/// RTCP report interval base; the actual interval is `0.5 + rand(0,1)` s.
const RTCP_INTERVAL_BASE_MS: u64 = 500;
const RTCP_INTERVAL_JITTER_MS: u64 = 1000;

/// EWMA weight applied to each new round-trip sample.
const RTT_EWMA_ALPHA: f64 = 0.85;

/// Which payload packetizer a sender's codec uses. Audio codecs carry the
/// encoded frame as a single RTP payload with no extra framing.
pub enum Packetizer {
    Vp8(Vp8Packetizer),
    Vp9(Vp9Packetizer),
    H264(H264Packetizer),
    Audio,
}

impl Packetizer {
    fn packetize(&mut self, frame: &[u8]) -> Result<Vec<Bytes>> {
        match self {
            Packetizer::Vp8(p) => p.packetize(frame),
            Packetizer::Vp9(p) => p.packetize(frame),
            Packetizer::H264(p) => Ok(p.packetize(frame)),
            Packetizer::Audio => Ok(vec![Bytes::copy_from_slice(frame)]),
        }
    }

    fn force_keyframe(&mut self) {
        if let Packetizer::Vp9(p) = self {
            p.force_keyframe();
        }
    }
}

/// One previously-sent packet, kept around so a NACK can be answered
/// without re-encoding.
#[derive(Clone)]
struct HistoryEntry {
    sequence_number: u16,
    payload: Bytes,
    header: RtpHeader,
}

/// One coded frame ready to leave the (out-of-scope) encoder: payload
/// bytes plus the RTP timestamp advance since the previous frame.
pub struct EncodedFrame {
    pub data: Bytes,
    pub timestamp_advance: u32,
}

/// The encoder boundary for offloaded codec work: actual codec CPU work is
/// external, so the sender only ever calls through this trait to pull
/// frames and push feedback back into the encoder.
pub trait FrameEncoder {
    fn poll_frame(&mut self) -> Option<EncodedFrame>;
    fn request_keyframe(&mut self) {}
    fn set_target_bitrate(&mut self, _bitrate_bps: u64) {}
}

pub struct RtpSenderConfig {
    pub ssrc: u32,
    pub rtx_ssrc: Option<u32>,
    pub payload_type: u8,
    pub rtx_payload_type: Option<u8>,
    pub cname: Bytes,
    pub mid: Option<String>,
    pub packetizer: Packetizer,
    pub extensions: ExtensionMap,
}

pub struct RtpSender {
    ssrc: u32,
    rtx_ssrc: Option<u32>,
    payload_type: u8,
    rtx_payload_type: Option<u8>,
    cname: Bytes,
    mid: Option<String>,
    packetizer: Packetizer,
    extensions: ExtensionMap,

    next_seq: SeqNum,
    next_rtx_seq: SeqNum,
    timestamp: u32,
    started: bool,

    history: Vec<Option<HistoryEntry>>,

    packet_count: u32,
    octet_count: u32,

    force_keyframe: bool,
    target_bitrate: Option<u64>,

    last_sr_lsr: Option<u32>,
    last_sr_time_ms: Option<u64>,
    rtt_ms: Option<f64>,

    next_rtcp_ms: Option<u64>,
    closed: bool,

    transmit: VecDeque<Bytes>,
}

impl RtpSender {
    pub fn new(config: RtpSenderConfig) -> Self {
        RtpSender {
            ssrc: config.ssrc,
            rtx_ssrc: config.rtx_ssrc,
            payload_type: config.payload_type,
            rtx_payload_type: config.rtx_payload_type,
            cname: config.cname,
            mid: config.mid,
            packetizer: config.packetizer,
            extensions: config.extensions,
            next_seq: SeqNum::new(rand::rng().random()),
            next_rtx_seq: SeqNum::new(rand::rng().random()),
            timestamp: rand::rng().random(),
            started: false,
            history: vec![None; RTP_HISTORY_SIZE],
            packet_count: 0,
            octet_count: 0,
            force_keyframe: false,
            target_bitrate: None,
            last_sr_lsr: None,
            last_sr_time_ms: None,
            rtt_ms: None,
            next_rtcp_ms: None,
            closed: false,
            transmit: VecDeque::new(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn rtt_ms(&self) -> Option<f64> {
        self.rtt_ms
    }

    pub fn target_bitrate(&self) -> Option<u64> {
        self.target_bitrate
    }

    /// PSFB PLI sets this; the next `send_frame` should carry an IDR. The
    /// actual encoder decision lives outside this crate, so callers check
    /// this before encoding and clear it is done for them here.
    pub fn wants_keyframe(&self) -> bool {
        self.force_keyframe
    }

    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.transmit.pop_front()
    }

    pub fn poll_timeout(&self) -> Option<u64> {
        self.next_rtcp_ms
    }

    /// Packetizes one encoded frame into RTP packets and queues them for
    /// transmission. `now_ntp` is the 64-bit NTP timestamp used for
    /// `abs_send_time`; `now_ms` schedules the next RTCP report if this is
    /// the first frame sent.
    pub fn send_frame(&mut self, frame: &EncodedFrame, now_ms: u64, now_ntp: u64) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.force_keyframe {
            self.packetizer.force_keyframe();
        }
        self.timestamp = self.timestamp.wrapping_add(frame.timestamp_advance);

        let payloads = self.packetizer.packetize(&frame.data)?;
        self.force_keyframe = false;

        let abs_send_time = abs_send_time_from_ntp(now_ntp);
        let last = payloads.len().saturating_sub(1);
        for (i, payload) in payloads.into_iter().enumerate() {
            let mut header = RtpHeader {
                payload_type: self.payload_type,
                sequence_number: self.next_seq.value(),
                timestamp: self.timestamp,
                ssrc: self.ssrc,
                marker: i == last,
                ..Default::default()
            };
            if let Some(id) = self.extensions.id_for(uri::ABS_SEND_TIME) {
                header.set_extension(id, Bytes::copy_from_slice(&abs_send_time.to_be_bytes()[1..]));
            }
            if let (Some(id), Some(mid)) = (self.extensions.id_for(uri::MID), self.mid.as_ref()) {
                header.set_extension(id, Bytes::copy_from_slice(mid.as_bytes()));
            }

            let packet = RtpPacket::new(header.clone(), payload.clone());
            let raw = packet.marshal()?;
            self.transmit.push_back(raw.freeze());

            self.packet_count += 1;
            self.octet_count += payload.len() as u32;

            let slot = (header.sequence_number as usize) % RTP_HISTORY_SIZE;
            self.history[slot] = Some(HistoryEntry { sequence_number: header.sequence_number, payload, header });

            self.next_seq = self.next_seq.plus_one();
        }

        if self.next_rtcp_ms.is_none() {
            self.schedule_next_rtcp(now_ms);
        }
        Ok(())
    }

    fn schedule_next_rtcp(&mut self, now_ms: u64) {
        let jitter_ms = rand::rng().random_range(0..RTCP_INTERVAL_JITTER_MS);
        self.next_rtcp_ms = Some(now_ms + RTCP_INTERVAL_BASE_MS + jitter_ms);
    }

    /// Emits the periodic SR+SDES compound, or BYE if the sender has been
    /// stopped. The host calls this when `poll_timeout` has elapsed.
    pub fn handle_timeout(&mut self, now_ms: u64, now_ntp: u64) -> Result<()> {
        let Some(deadline) = self.next_rtcp_ms else { return Ok(()) };
        if now_ms < deadline {
            return Ok(());
        }
        if self.closed {
            let bye = RtcpPacket::Goodbye(Goodbye { sources: vec![self.ssrc], reason: Bytes::new() });
            self.transmit.push_back(rtcp::marshal_compound(&[bye])?);
            self.next_rtcp_ms = None;
            return Ok(());
        }

        let sr = SenderReport {
            ssrc: self.ssrc,
            sender_info: SenderInfo {
                ntp_time: now_ntp,
                rtp_time: self.timestamp,
                packet_count: self.packet_count,
                octet_count: self.octet_count,
            },
            report_blocks: vec![],
        };
        let sdes = SourceDescription {
            chunks: vec![SdesChunk { ssrc: self.ssrc, items: vec![SdesItem::cname(self.cname.clone())] }],
        };
        self.transmit.push_back(rtcp::marshal_compound(&[
            RtcpPacket::SenderReport(sr),
            RtcpPacket::SourceDescription(sdes),
        ])?);

        self.last_sr_lsr = Some(rtc_shared::time::ntp_to_compact(now_ntp));
        self.last_sr_time_ms = Some(now_ms);
        self.schedule_next_rtcp(now_ms);
        Ok(())
    }

    /// Folds one piece of incoming RTCP feedback addressed to this sender.
    pub fn handle_rtcp(&mut self, packet: &RtcpPacket, now_ms: u64) {
        match packet {
            RtcpPacket::SenderReport(sr) => self.handle_report_blocks(&sr.report_blocks, now_ms),
            RtcpPacket::ReceiverReport(rr) => self.handle_report_blocks(&rr.report_blocks, now_ms),
            RtcpPacket::TransportLayerNack(nack) => self.handle_nack(nack.nacks.iter().flat_map(|p| p.packet_list())),
            RtcpPacket::PictureLossIndication(_) => {
                self.force_keyframe = true;
            }
            RtcpPacket::ReceiverEstimatedMaximumBitrate(remb) => self.handle_remb(remb),
            _ => {}
        }
    }

    fn handle_report_blocks(&mut self, blocks: &[ReportBlock], now_ms: u64) {
        for rb in blocks {
            if rb.ssrc != self.ssrc {
                continue;
            }
            let (Some(lsr), Some(lsr_time)) = (self.last_sr_lsr, self.last_sr_time_ms) else { continue };
            if rb.last_sr != lsr || rb.delay_last_sr == 0 {
                continue;
            }
            let now_compact_elapsed_ms = now_ms.saturating_sub(lsr_time) as f64;
            let dlsr_ms = rb.delay_last_sr as f64 / 65536.0 * 1000.0;
            let sample = (now_compact_elapsed_ms - dlsr_ms).max(0.0);
            self.rtt_ms = Some(match self.rtt_ms {
                None => sample,
                Some(prev) => RTT_EWMA_ALPHA * prev + (1.0 - RTT_EWMA_ALPHA) * sample,
            });
        }
    }

    fn handle_nack(&mut self, lost: impl Iterator<Item = u16>) {
        for seq in lost {
            let slot = (seq as usize) % RTP_HISTORY_SIZE;
            let Some(entry) = &self.history[slot] else { continue };
            if entry.sequence_number != seq {
                continue;
            }
            let raw = if let (Some(rtx_ssrc), Some(rtx_pt)) = (self.rtx_ssrc, self.rtx_payload_type) {
                let mut rtx_payload = BytesMut::with_capacity(2 + entry.payload.len());
                rtx_payload.extend_from_slice(&entry.sequence_number.to_be_bytes());
                rtx_payload.extend_from_slice(&entry.payload);
                let header = RtpHeader {
                    payload_type: rtx_pt,
                    sequence_number: self.next_rtx_seq.value(),
                    timestamp: entry.header.timestamp,
                    ssrc: rtx_ssrc,
                    marker: entry.header.marker,
                    ..Default::default()
                };
                self.next_rtx_seq = self.next_rtx_seq.plus_one();
                RtpPacket::new(header, rtx_payload.freeze())
            } else {
                RtpPacket::new(entry.header.clone(), entry.payload.clone())
            };
            if let Ok(marshaled) = raw.marshal() {
                self.transmit.push_back(marshaled.freeze());
            }
        }
    }

    fn handle_remb(&mut self, remb: &ReceiverEstimatedMaximumBitrate) {
        if remb.ssrcs.contains(&self.ssrc) || remb.ssrcs.is_empty() {
            self.target_bitrate = Some(remb.bitrate);
        }
    }

    /// Cancels both tasks conceptually: the next `handle_timeout` emits a
    /// BYE instead of an SR and no further `send_frame` calls do anything.
    pub fn close(&mut self, now_ms: u64) {
        self.closed = true;
        self.next_rtcp_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rtp::extension::uri;

    fn sender() -> RtpSender {
        let mut extensions = ExtensionMap::new();
        extensions.register(1, uri::ABS_SEND_TIME);
        RtpSender::new(RtpSenderConfig {
            ssrc: 1111,
            rtx_ssrc: Some(2222),
            payload_type: 96,
            rtx_payload_type: Some(97),
            cname: Bytes::from_static(b"test-cname"),
            mid: Some("0".into()),
            packetizer: Packetizer::Audio,
            extensions,
        })
    }

    #[test]
    fn send_frame_queues_one_packet_per_payload() {
        let mut s = sender();
        s.send_frame(&EncodedFrame { data: Bytes::from_static(b"hello"), timestamp_advance: 160 }, 0, 0).unwrap();
        assert!(s.poll_transmit().is_some());
        assert!(s.poll_transmit().is_none());
    }

    #[test]
    fn pli_sets_keyframe_request() {
        let mut s = sender();
        assert!(!s.wants_keyframe());
        s.handle_rtcp(&RtcpPacket::PictureLossIndication(PictureLossIndication { sender_ssrc: 1, media_ssrc: 1111 }), 0);
        assert!(s.wants_keyframe());
    }

    #[test]
    fn nack_retransmits_from_history_as_rtx() {
        let mut s = sender();
        s.send_frame(&EncodedFrame { data: Bytes::from_static(b"frame0"), timestamp_advance: 0 }, 0, 0).unwrap();
        let sent_seq = s.history[0].as_ref().map(|_| ()).is_some();
        assert!(sent_seq);
        let _ = s.poll_transmit();

        let seq_sent = (0..RTP_HISTORY_SIZE).find_map(|i| s.history[i].as_ref().map(|e| e.sequence_number));
        let nack = rtcp::TransportLayerNack {
            sender_ssrc: 1,
            media_ssrc: 1111,
            nacks: vec![NackPair { packet_id: seq_sent.unwrap(), lost_bitmask: 0 }],
        };
        s.handle_rtcp(&RtcpPacket::TransportLayerNack(nack), 0);
        assert!(s.poll_transmit().is_some());
    }

    #[test]
    fn remb_updates_target_bitrate() {
        let mut s = sender();
        let remb = ReceiverEstimatedMaximumBitrate { sender_ssrc: 1, bitrate: 500_000, ssrcs: vec![1111] };
        s.handle_rtcp(&RtcpPacket::ReceiverEstimatedMaximumBitrate(remb), 0);
        assert_eq!(s.target_bitrate(), Some(500_000));
    }

    #[test]
    fn close_emits_bye_on_next_timeout() {
        let mut s = sender();
        s.send_frame(&EncodedFrame { data: Bytes::from_static(b"x"), timestamp_advance: 0 }, 0, 0).unwrap();
        let _ = s.poll_transmit();
        s.close(0);
        s.handle_timeout(0, 0).unwrap();
        let bye = s.poll_transmit().unwrap();
        let parsed = rtcp::parse_compound(bye).unwrap();
        assert!(matches!(parsed[0], RtcpPacket::Goodbye(_)));
    }
}
