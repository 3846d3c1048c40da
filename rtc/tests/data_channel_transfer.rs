//! Scenario #3 (scaled down for test runtime): a data channel carries a
//! multi-chunk transfer end to end through `DtlsSrtpTransport::send_data`/
//! `poll_received_data`, an `sctp::Association` on each side, and the DCEP
//! layer, refilling from `bufferedamountlow` the way a real sender would.

use dtls::{Certificate, DtlsRole, DtlsState};
use rtc::{DtlsSrtpTransport, DtlsSrtpTransportConfig};
use sctp::{Association, TransportConfig as SctpConfig};
use datachannel::{DataChannelConfig, DataChannelEvent, DataChannels};

struct Peer {
    transport: DtlsSrtpTransport,
    assoc: Association,
    channels: DataChannels,
}

fn pump(client: &mut Peer, server: &mut Peer, now: &mut u64, rounds: u32) -> (Vec<DataChannelEvent>, Vec<DataChannelEvent>) {
    let mut client_events = Vec::new();
    let mut server_events = Vec::new();
    for _ in 0..rounds {
        let mut progressed = false;

        while let Some(pkt) = client.transport.poll_transmit() {
            let _ = server.transport.handle_receive(*now, &pkt);
            progressed = true;
        }
        while let Some(pkt) = server.transport.poll_transmit() {
            let _ = client.transport.handle_receive(*now, &pkt);
            progressed = true;
        }

        for (peer, events) in [(&mut *client, &mut client_events), (&mut *server, &mut server_events)] {
            while let Some(data) = peer.transport.poll_received_data() {
                let _ = peer.assoc.handle_receive(*now, &data);
                progressed = true;
            }
            while let Some(pkt) = peer.assoc.poll_transmit() {
                if peer.transport.state() == DtlsState::Connected {
                    let _ = peer.transport.send_data(&pkt);
                    progressed = true;
                }
            }
            while let Some(event) = peer.assoc.poll_event() {
                if let Ok(Some(dc_event)) = peer.channels.handle_association_event(&mut peer.assoc, event, *now) {
                    events.push(dc_event);
                }
            }
            peer.assoc.handle_timeout(*now);
        }

        client.transport.handle_timeout(*now);
        server.transport.handle_timeout(*now);
        *now += 10;
        if !progressed {
            break;
        }
    }
    (client_events, server_events)
}

#[test]
fn chunked_transfer_refills_on_buffered_amount_low() {
    let client_cert = Certificate::generate_self_signed().unwrap();
    let server_cert = Certificate::generate_self_signed().unwrap();
    let mut client = Peer {
        transport: DtlsSrtpTransport::new(DtlsRole::Client, client_cert, DtlsSrtpTransportConfig::default()),
        assoc: Association::new(SctpConfig { is_client: true, ..Default::default() }),
        channels: DataChannels::new(true),
    };
    let mut server = Peer {
        transport: DtlsSrtpTransport::new(DtlsRole::Server, server_cert, DtlsSrtpTransportConfig::default()),
        assoc: Association::new(SctpConfig { is_client: false, ..Default::default() }),
        channels: DataChannels::new(false),
    };

    let mut now = 0u64;
    client.transport.start(now).unwrap();
    pump(&mut client, &mut server, &mut now, 20);
    assert_eq!(client.transport.state(), DtlsState::Connected);
    assert_eq!(server.transport.state(), DtlsState::Connected);

    client.assoc.initiate(now).unwrap();
    pump(&mut client, &mut server, &mut now, 20);

    let config = DataChannelConfig::reliable("transfer");
    let id = client.channels.open(&mut client.assoc, config, now).unwrap();
    let (client_events, _) = pump(&mut client, &mut server, &mut now, 20);
    assert!(client_events.iter().any(|e| matches!(e, DataChannelEvent::Open { id: opened } if *opened == id)));

    // Default `buffered_amount_low_threshold` is 0: the next chunk is only
    // queued once the association has fully drained the previous one.
    const CHUNK: usize = 16_384;
    const CHUNKS: usize = 4;
    let payload: Vec<u8> = (0..CHUNK).map(|i| (i % 251) as u8).collect();

    let mut sent = 0usize;
    client.channels.send(&mut client.assoc, id, &payload, false, now).unwrap();
    sent += 1;

    let mut received: Vec<u8> = Vec::new();
    while sent < CHUNKS || received.len() < sent * CHUNK {
        let (_, server_events) = pump(&mut client, &mut server, &mut now, 5);
        for event in server_events {
            if let DataChannelEvent::Message { data, .. } = event {
                received.extend_from_slice(&data);
            }
        }
        let crossed = client.channels.poll_buffered_amount_low(&client.assoc);
        if !crossed.is_empty() && sent < CHUNKS {
            client.channels.send(&mut client.assoc, id, &payload, false, now).unwrap();
            sent += 1;
        }
        now += 10;
        if now > 200_000 {
            break;
        }
    }

    assert_eq!(sent, CHUNKS);
    assert_eq!(received.len(), CHUNKS * CHUNK);
    for chunk in received.chunks(CHUNK) {
        assert_eq!(chunk, &payload[..]);
    }
}
