//! End-to-end scenarios driven through `DtlsSrtpTransport` directly,
//! wiring two in-process instances together with no real sockets.

use bytes::Bytes;

use dtls::{Certificate, DtlsRole, DtlsState, TransportConfig as DtlsConfig};
use rtc::{DtlsSrtpTransport, DtlsSrtpTransportConfig};
use rtcp::{RtcpPacket, TransportLayerNack};
use rtp::{RtpHeader, RtpPacket};

fn pump(client: &mut DtlsSrtpTransport, server: &mut DtlsSrtpTransport, rounds: u32) {
    let mut now = 0u64;
    for _ in 0..rounds {
        let mut progressed = false;
        while let Some(pkt) = client.poll_transmit() {
            let _ = server.handle_receive(now, &pkt);
            progressed = true;
        }
        while let Some(pkt) = server.poll_transmit() {
            let _ = client.handle_receive(now, &pkt);
            progressed = true;
        }
        now += 10;
        if !progressed {
            break;
        }
    }
}

/// Scenario #1: fingerprint mismatch fails both sides closed before any
/// media can flow.
#[test]
fn fingerprint_mismatch_blocks_all_media() {
    let client_cert = Certificate::generate_self_signed().unwrap();
    let server_cert = Certificate::generate_self_signed().unwrap();
    let bogus = [0xAAu8; 32];

    let mut client = DtlsSrtpTransport::new(
        DtlsRole::Client,
        client_cert,
        DtlsSrtpTransportConfig { dtls: DtlsConfig { remote_fingerprint: Some(bogus), ..Default::default() } },
    );
    let mut server = DtlsSrtpTransport::new(DtlsRole::Server, server_cert, DtlsSrtpTransportConfig::default());

    client.start(0).unwrap();
    pump(&mut client, &mut server, 10);

    assert_eq!(client.state(), DtlsState::Failed);
    let packet = RtpPacket::new(RtpHeader { ssrc: 1, ..Default::default() }, Bytes::from_static(b"x"));
    assert!(client.protect_rtp(&packet).is_err());
}

/// Scenario #4: a dropped RTP packet between sender and receiver is
/// recovered via an RTPFB NACK round trip, carried for real over SRTP.
#[test]
fn nack_driven_retransmit_recovers_dropped_packet() {
    let client_cert = Certificate::generate_self_signed().unwrap();
    let server_cert = Certificate::generate_self_signed().unwrap();
    let mut client = DtlsSrtpTransport::new(DtlsRole::Client, client_cert, DtlsSrtpTransportConfig::default());
    let mut server = DtlsSrtpTransport::new(DtlsRole::Server, server_cert, DtlsSrtpTransportConfig::default());
    client.start(0).unwrap();
    pump(&mut client, &mut server, 20);
    assert_eq!(client.state(), DtlsState::Connected);
    assert_eq!(server.state(), DtlsState::Connected);

    server.router().register_receiver(vec![], vec![96], None);

    let make = |seq: u16| {
        RtpPacket::new(
            RtpHeader { payload_type: 96, sequence_number: seq, timestamp: seq as u32 * 160, ssrc: 7, marker: true, ..Default::default() },
            Bytes::from_static(b"audio"),
        )
    };

    // Packet 1 arrives; packet 2 is dropped; packet 3 arrives, exposing the
    // gap.
    let p1 = client.protect_rtp(&make(1)).unwrap();
    let p2 = client.protect_rtp(&make(2)).unwrap();
    let p3 = client.protect_rtp(&make(3)).unwrap();
    server.handle_receive(0, &p1).unwrap();
    server.handle_receive(0, &p3).unwrap();

    // The receiver (simulated here as the router having already dispatched
    // to a would-be RtpReceiver) would emit an RTPFB NACK for seq 2; we
    // build it by hand to exercise the sender's retransmit path over the
    // same protected transport.
    let nack = RtcpPacket::TransportLayerNack(TransportLayerNack {
        sender_ssrc: 999,
        media_ssrc: 7,
        nacks: rtcp::pack_nack_pairs(vec![2]),
    });
    let compound = rtcp::marshal_compound(&[nack]).unwrap();
    let protected_rtcp = server.protect_rtcp(&compound, 7).unwrap();

    client.router().register_sender(7);
    match client.handle_receive(0, &protected_rtcp).unwrap() {
        rtc::Demuxed::Rtcp(routed) => {
            assert_eq!(routed.len(), 1);
            assert!(matches!(routed[0].1[0], rtc::RtcpTarget::Sender(7)));
        }
        _ => panic!("expected Rtcp"),
    }

    // Retransmitting the dropped packet and delivering it completes the
    // recovery.
    let retransmit = client.protect_rtp(&make(2)).unwrap();
    match server.handle_receive(0, &retransmit).unwrap() {
        rtc::Demuxed::Rtp { packet, .. } => assert_eq!(packet.header.sequence_number, 2),
        _ => panic!("expected Rtp"),
    }
}
