//! The DTLS-SRTP transport (§4.2): the single duplex byte channel to one
//! peer that multiplexes DTLS handshake records, SRTP-protected RTP,
//! SRTCP-protected RTCP, and opaque SCTP user data, demultiplexing and
//! routing everything but the SCTP bytes itself. An external `sctp`
//! association rides on top of it via [`DtlsSrtpTransport::send_data`] /
//! [`DtlsSrtpTransport::poll_received_data`], matching the architecture
//! diagram's separation of the SCTP Association from this transport.

use std::collections::VecDeque;

use bytes::Bytes;

use dtls::{Certificate, DtlsRole, DtlsState, DtlsTransport};
use media::bandwidth::RemoteBitrateEstimator;
use rtc_shared::error::{Error, Result};
use rtc_shared::util::{match_dtls, match_srtp, match_srtcp};
use rtcp::RtcpPacket;
use rtp::RtpPacket;
use srtp::{SrtpKeys, SrtpSession};

use crate::router::{RtcpTarget, ReceiverId, RtpRouter};

/// A bandwidth estimate ready for the host to push into an encoder's
/// `target_bitrate` (§4.9's "consumer (RTP sender) pushes this value").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthEstimate {
    pub bitrate_bps: u64,
    pub ssrcs: Vec<u32>,
}

/// Outcome of classifying and, where applicable, routing one received
/// datagram.
pub enum Demuxed {
    /// A DTLS handshake or application-data record was consumed. Any
    /// decrypted SCTP bytes are available from `poll_received_data`.
    Dtls,
    /// An SRTP packet, unprotected and routed (`receiver` is `None` when
    /// the router dropped it per §4.3).
    Rtp { receiver: Option<ReceiverId>, packet: RtpPacket },
    /// An SRTCP compound packet, unprotected, parsed, and routed. Each
    /// entry is one contained RTCP packet and the targets it was routed to.
    Rtcp(Vec<(RtcpPacket, Vec<RtcpTarget>)>),
    /// Not DTLS or SRTP/SRTCP: handed back unchanged for ICE/STUN.
    Stun(Bytes),
}

pub struct DtlsSrtpTransportConfig {
    pub dtls: dtls::TransportConfig,
    /// Negotiated local id for the `abs-send-time` header extension
    /// (§4.1). `None` disables the bandwidth estimator (§4.9): without the
    /// extension there is no send-time to derive inter-arrival deltas
    /// from.
    pub abs_send_time_ext_id: Option<u8>,
}

impl Default for DtlsSrtpTransportConfig {
    fn default() -> Self {
        Self { dtls: dtls::TransportConfig::default(), abs_send_time_ext_id: None }
    }
}

/// Running byte/packet counters for the stats report (§4.2 "Counters").
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

pub struct DtlsSrtpTransport {
    dtls: DtlsTransport,
    router: RtpRouter,
    inbound_srtp: Option<SrtpSession>,
    outbound_srtp: Option<SrtpSession>,
    counters: TransportCounters,
    abs_send_time_ext_id: Option<u8>,
    bandwidth: RemoteBitrateEstimator,
    bandwidth_estimates: VecDeque<BandwidthEstimate>,
}

impl DtlsSrtpTransport {
    pub fn new(role: DtlsRole, certificate: Certificate, config: DtlsSrtpTransportConfig) -> Self {
        Self {
            dtls: DtlsTransport::new(role, certificate, config.dtls),
            router: RtpRouter::new(),
            inbound_srtp: None,
            outbound_srtp: None,
            counters: TransportCounters::default(),
            abs_send_time_ext_id: config.abs_send_time_ext_id,
            bandwidth: RemoteBitrateEstimator::new(),
            bandwidth_estimates: VecDeque::new(),
        }
    }

    pub fn state(&self) -> DtlsState {
        self.dtls.state()
    }

    pub fn router(&mut self) -> &mut RtpRouter {
        &mut self.router
    }

    pub fn counters(&self) -> TransportCounters {
        self.counters
    }

    pub fn start(&mut self, now_ms: u64) -> Result<()> {
        self.dtls.start(now_ms)
    }

    pub fn poll_timeout(&self) -> Option<u64> {
        self.dtls.poll_timeout()
    }

    pub fn handle_timeout(&mut self, now_ms: u64) {
        self.dtls.handle_timeout(now_ms);
        self.establish_srtp_if_ready();
    }

    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        let bytes = self.dtls.poll_transmit()?;
        self.counters.bytes_sent += bytes.len() as u64;
        Some(bytes)
    }

    /// Classifies and handles one received datagram per §4.2's demux rule.
    pub fn handle_receive(&mut self, now_ms: u64, data: &[u8]) -> Result<Demuxed> {
        if data.is_empty() {
            return Err(Error::short("dtls_srtp_transport_empty_datagram"));
        }
        self.counters.bytes_received += data.len() as u64;

        if match_dtls(data) {
            self.dtls.handle_receive(now_ms, data)?;
            self.establish_srtp_if_ready();
            Ok(Demuxed::Dtls)
        } else if match_srtcp(data) {
            let session = self.inbound_srtp.as_mut().ok_or(Error::NotConnected)?;
            let cleartext = session.unprotect_rtcp(data)?;
            let packets = rtcp::parse_compound(cleartext)?;
            let routed = packets.into_iter().map(|packet| {
                let targets = self.router.route_rtcp(&packet);
                (packet, targets)
            }).collect();
            Ok(Demuxed::Rtcp(routed))
        } else if match_srtp(data) {
            let session = self.inbound_srtp.as_mut().ok_or(Error::NotConnected)?;
            let packet = session.unprotect_rtp(data)?;
            self.counters.packets_received += 1;
            self.observe_bandwidth(&packet, now_ms);
            let receiver = self.router.route_rtp(packet.header.ssrc, packet.header.payload_type);
            Ok(Demuxed::Rtp { receiver, packet })
        } else {
            Ok(Demuxed::Stun(Bytes::copy_from_slice(data)))
        }
    }

    /// SRTP-protects one outbound RTP packet. Fails with `NotConnected`
    /// before the handshake has produced keying material.
    pub fn protect_rtp(&mut self, packet: &RtpPacket) -> Result<Bytes> {
        let session = self.outbound_srtp.as_mut().ok_or(Error::NotConnected)?;
        let out = session.protect_rtp(packet)?;
        self.counters.packets_sent += 1;
        Ok(out)
    }

    /// SRTCP-protects one already-marshaled outbound RTCP compound packet.
    pub fn protect_rtcp(&mut self, packet_bytes: &[u8], ssrc: u32) -> Result<Bytes> {
        let session = self.outbound_srtp.as_mut().ok_or(Error::NotConnected)?;
        session.protect_rtcp(packet_bytes, ssrc)
    }

    /// Hands one opaque SCTP PDU to the DTLS session as application data.
    pub fn send_data(&mut self, data: &[u8]) -> Result<()> {
        if self.dtls.state() != DtlsState::Connected {
            return Err(Error::NotConnected);
        }
        self.dtls.send_data(data)
    }

    /// Pops one decrypted SCTP PDU received over the DTLS session, in
    /// arrival order.
    pub fn poll_received_data(&mut self) -> Option<Bytes> {
        self.dtls.poll_received_data()
    }

    /// Sends `close_notify` and tears down both SRTP sessions. Per §4.2,
    /// `send_data`/`protect_rtp` fail with `NotConnected` afterwards.
    pub fn close(&mut self) {
        self.dtls.close();
        self.inbound_srtp = None;
        self.outbound_srtp = None;
    }

    /// Pops the next bandwidth estimate produced by inbound RTP carrying
    /// the `abs-send-time` extension, if the AIMD controller has one ready
    /// (§4.9: at most once per `feedback_interval`, or immediately on
    /// overuse).
    pub fn poll_bandwidth_estimate(&mut self) -> Option<BandwidthEstimate> {
        self.bandwidth_estimates.pop_front()
    }

    /// Feeds one inbound RTP packet's abs-send-time to the bandwidth
    /// estimator (§4.9). A no-op when the extension wasn't negotiated or
    /// isn't present on this packet.
    fn observe_bandwidth(&mut self, packet: &RtpPacket, now_ms: u64) {
        let Some(ext_id) = self.abs_send_time_ext_id else { return };
        let Some(raw) = packet.header.extension_with_id(ext_id) else { return };
        if raw.len() != 3 {
            return;
        }
        let abs_send_time = ((raw[0] as u32) << 16) | ((raw[1] as u32) << 8) | raw[2] as u32;
        if let Some((bitrate_bps, ssrcs)) =
            self.bandwidth.add(now_ms as i64, abs_send_time, packet.payload.len(), packet.header.ssrc)
        {
            self.bandwidth_estimates.push_back(BandwidthEstimate { bitrate_bps, ssrcs });
        }
    }

    fn establish_srtp_if_ready(&mut self) {
        if self.inbound_srtp.is_some() || self.dtls.state() != DtlsState::Connected {
            return;
        }
        let Some(keys) = self.dtls.export_srtp_keys() else { return };
        // Inbound/outbound keyed from opposite halves of the exporter
        // output (§4.2 "Keying"); only the inbound side tolerates repeat
        // transmission (our own retransmitted RTX/NACK replies loop back
        // through nothing, but a peer's retransmit of an already-seen
        // packet must not be treated as an attack).
        self.inbound_srtp = Some(SrtpSession::new(
            &SrtpKeys { master_key: keys.remote_key, master_salt: keys.remote_salt },
            true,
        ));
        self.outbound_srtp = Some(SrtpSession::new(
            &SrtpKeys { master_key: keys.local_key, master_salt: keys.local_salt },
            false,
        ));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rtp::RtpHeader;

    fn handshake_to_connected(client: &mut DtlsSrtpTransport, server: &mut DtlsSrtpTransport) {
        client.start(0).unwrap();
        let mut now = 0u64;
        for _ in 0..20 {
            let mut progressed = false;
            while let Some(pkt) = client.poll_transmit() {
                server.handle_receive(now, &pkt).unwrap();
                progressed = true;
            }
            while let Some(pkt) = server.poll_transmit() {
                client.handle_receive(now, &pkt).unwrap();
                progressed = true;
            }
            now += 10;
            if client.state() == DtlsState::Connected && server.state() == DtlsState::Connected {
                break;
            }
            if !progressed {
                break;
            }
        }
    }

    fn pair() -> (DtlsSrtpTransport, DtlsSrtpTransport) {
        let client = DtlsSrtpTransport::new(
            DtlsRole::Client,
            Certificate::generate_self_signed().unwrap(),
            DtlsSrtpTransportConfig::default(),
        );
        let server = DtlsSrtpTransport::new(
            DtlsRole::Server,
            Certificate::generate_self_signed().unwrap(),
            DtlsSrtpTransportConfig::default(),
        );
        (client, server)
    }

    #[test]
    fn handshake_derives_srtp_sessions_on_both_sides() {
        let (mut client, mut server) = pair();
        handshake_to_connected(&mut client, &mut server);
        assert_eq!(client.state(), DtlsState::Connected);
        assert_eq!(server.state(), DtlsState::Connected);
        assert!(client.outbound_srtp.is_some());
        assert!(server.inbound_srtp.is_some());
    }

    #[test]
    fn srtp_packet_round_trips_and_routes() {
        let (mut client, mut server) = pair();
        handshake_to_connected(&mut client, &mut server);
        server.router().register_receiver(vec![], vec![96], None);

        let packet = RtpPacket::new(
            RtpHeader { payload_type: 96, sequence_number: 1, timestamp: 1000, ssrc: 42, ..Default::default() },
            Bytes::from_static(b"payload"),
        );
        let protected = client.protect_rtp(&packet).unwrap();
        match server.handle_receive(0, &protected).unwrap() {
            Demuxed::Rtp { receiver, packet: routed } => {
                assert!(receiver.is_some());
                assert_eq!(routed.header.ssrc, 42);
                assert_eq!(&routed.payload[..], b"payload");
            }
            _ => panic!("expected Rtp"),
        }
    }

    #[test]
    fn sctp_bytes_carry_over_dtls() {
        let (mut client, mut server) = pair();
        handshake_to_connected(&mut client, &mut server);
        client.send_data(b"sctp init chunk").unwrap();
        let datagram = client.poll_transmit().unwrap();
        assert!(matches!(server.handle_receive(0, &datagram).unwrap(), Demuxed::Dtls));
        assert_eq!(&server.poll_received_data().unwrap()[..], b"sctp init chunk");
    }

    #[test]
    fn unrecognized_first_byte_is_handed_back_as_stun() {
        let (mut client, _server) = pair();
        let stun_like = [0u8, 1, 2, 3];
        match client.handle_receive(0, &stun_like).unwrap() {
            Demuxed::Stun(bytes) => assert_eq!(&bytes[..], &stun_like),
            _ => panic!("expected Stun"),
        }
    }

    #[test]
    fn rtp_before_handshake_is_not_connected() {
        let (mut client, _server) = pair();
        let srtp_like = [128u8, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(client.handle_receive(0, &srtp_like), Err(Error::NotConnected));
    }

    /// Scenario #6: sustained arrival delay on inbound RTP carrying
    /// `abs-send-time` eventually drives the bandwidth estimator to a
    /// reduced target bitrate (§4.9).
    #[test]
    fn sustained_overuse_produces_a_bandwidth_estimate() {
        const ABS_SEND_TIME_EXT_ID: u8 = 3;
        let mut server = DtlsSrtpTransport::new(
            DtlsRole::Server,
            Certificate::generate_self_signed().unwrap(),
            DtlsSrtpTransportConfig { abs_send_time_ext_id: Some(ABS_SEND_TIME_EXT_ID), ..Default::default() },
        );

        // abs-send-time runs in 1/2^26s units; a 30fps source advances by
        // roughly (1/30 s) per group. Arrival clock runs an extra 40ms
        // behind every group, a sustained queuing delay well past the
        // scenario's 20ms floor, to give the Kalman filter and adaptive
        // threshold ample margin to converge within the loop bound.
        let timestamp_step: u32 = ((1.0 / 30.0) * (1u64 << 26) as f64) as u32;
        let mut abs_send_time: u32 = 1_000_000;
        let mut arrival_ms: i64 = 0;
        let mut got_estimate = false;

        for seq in 0..2000u16 {
            let mut header = RtpHeader {
                payload_type: 96,
                sequence_number: seq,
                timestamp: seq as u32 * 3000,
                ssrc: 55,
                ..Default::default()
            };
            let raw = [(abs_send_time >> 16) as u8, (abs_send_time >> 8) as u8, abs_send_time as u8];
            header.set_extension(ABS_SEND_TIME_EXT_ID, Bytes::copy_from_slice(&raw));
            let packet = RtpPacket::new(header, Bytes::from_static(b"frame-bytes-of-video"));

            server.observe_bandwidth(&packet, arrival_ms as u64);
            if server.poll_bandwidth_estimate().is_some() {
                got_estimate = true;
                break;
            }

            abs_send_time = abs_send_time.wrapping_add(timestamp_step);
            arrival_ms += 33 + 40;
        }

        assert!(got_estimate, "expected a bandwidth estimate after sustained overuse");
    }

    #[test]
    fn bandwidth_estimator_ignores_packets_without_the_extension() {
        let mut server = DtlsSrtpTransport::new(
            DtlsRole::Server,
            Certificate::generate_self_signed().unwrap(),
            DtlsSrtpTransportConfig::default(),
        );
        let packet = RtpPacket::new(
            RtpHeader { payload_type: 96, sequence_number: 1, ssrc: 1, ..Default::default() },
            Bytes::from_static(b"x"),
        );
        server.observe_bandwidth(&packet, 0);
        assert!(server.poll_bandwidth_estimate().is_none());
    }
}
