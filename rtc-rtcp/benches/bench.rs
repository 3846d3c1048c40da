use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, Criterion};
use rtc_rtcp::{
    goodbye::Goodbye,
    picture_loss_indication::PictureLossIndication,
    receiver_report::ReceiverReport,
    report_block::{ReportBlock, SenderInfo},
    sender_report::SenderReport,
    source_description::{SdesChunk, SdesItem, SourceDescription},
    transport_layer_nack::{NackPair, TransportLayerNack},
};
use rtc_shared::marshal::{Marshal, MarshalSize, Unmarshal};

fn benchmark_sender_report(c: &mut Criterion) {
    let sr = SenderReport {
        ssrc: 0x902f9e2e,
        sender_info: SenderInfo {
            ntp_time: 0xda8bd1fcdddda05a,
            rtp_time: 0xaaf4edd5,
            packet_count: 1000,
            octet_count: 50000,
        },
        report_blocks: vec![
            ReportBlock {
                ssrc: 0xbc5e9a40,
                fraction_lost: 10,
                packets_lost: 100,
                last_seq_num: 0x46e1,
                jitter: 273,
                last_sr: 0x9f36432,
                delay_last_sr: 150137,
            },
            ReportBlock {
                ssrc: 0xbc5e9a41,
                fraction_lost: 5,
                packets_lost: 50,
                last_seq_num: 0x46e2,
                jitter: 150,
                last_sr: 0x9f36433,
                delay_last_sr: 150138,
            },
        ],
    };

    let raw = sr.marshal().unwrap();
    let mut b = &raw[..];
    let p = SenderReport::unmarshal(&mut b).unwrap();
    assert_eq!(sr, p);

    let mut buf = BytesMut::zeroed(sr.marshal_size());
    c.bench_function("SenderReport MarshalTo", |bch| {
        bch.iter(|| sr.marshal_to(&mut buf).unwrap())
    });
    c.bench_function("SenderReport Marshal", |bch| bch.iter(|| sr.marshal().unwrap()));
    c.bench_function("SenderReport Unmarshal", |bch| {
        bch.iter(|| {
            let mut b = &raw[..];
            SenderReport::unmarshal(&mut b).unwrap()
        })
    });
}

fn benchmark_receiver_report(c: &mut Criterion) {
    let rr = ReceiverReport {
        ssrc: 0x902f9e2e,
        report_blocks: vec![ReportBlock {
            ssrc: 0xbc5e9a40,
            fraction_lost: 10,
            packets_lost: 100,
            last_seq_num: 0x46e1,
            jitter: 273,
            last_sr: 0x9f36432,
            delay_last_sr: 150137,
        }],
    };

    let raw = rr.marshal().unwrap();
    let mut b = &raw[..];
    let p = ReceiverReport::unmarshal(&mut b).unwrap();
    assert_eq!(rr, p);

    let mut buf = BytesMut::zeroed(rr.marshal_size());
    c.bench_function("ReceiverReport MarshalTo", |bch| {
        bch.iter(|| rr.marshal_to(&mut buf).unwrap())
    });
    c.bench_function("ReceiverReport Marshal", |bch| bch.iter(|| rr.marshal().unwrap()));
    c.bench_function("ReceiverReport Unmarshal", |bch| {
        bch.iter(|| {
            let mut b = &raw[..];
            ReceiverReport::unmarshal(&mut b).unwrap()
        })
    });
}

fn benchmark_picture_loss_indication(c: &mut Criterion) {
    let pli = PictureLossIndication { sender_ssrc: 0x902f9e2e, media_ssrc: 0xbc5e9a40 };

    let raw = pli.marshal().unwrap();
    let mut b = &raw[..];
    let p = PictureLossIndication::unmarshal(&mut b).unwrap();
    assert_eq!(pli, p);

    let mut buf = BytesMut::zeroed(pli.marshal_size());
    c.bench_function("PictureLossIndication MarshalTo", |bch| {
        bch.iter(|| pli.marshal_to(&mut buf).unwrap())
    });
    c.bench_function("PictureLossIndication Marshal", |bch| bch.iter(|| pli.marshal().unwrap()));
    c.bench_function("PictureLossIndication Unmarshal", |bch| {
        bch.iter(|| {
            let mut b = &raw[..];
            PictureLossIndication::unmarshal(&mut b).unwrap()
        })
    });
}

fn benchmark_transport_layer_nack(c: &mut Criterion) {
    let nack = TransportLayerNack {
        sender_ssrc: 0x902f9e2e,
        media_ssrc: 0xbc5e9a40,
        nacks: vec![
            NackPair { packet_id: 1000, lost_bitmask: 0b0101010101010101 },
            NackPair { packet_id: 2000, lost_bitmask: 0b1010101010101010 },
            NackPair { packet_id: 3000, lost_bitmask: 0b1111000011110000 },
        ],
    };

    let raw = nack.marshal().unwrap();
    let mut b = &raw[..];
    let p = TransportLayerNack::unmarshal(&mut b).unwrap();
    assert_eq!(nack, p);

    let mut buf = BytesMut::zeroed(nack.marshal_size());
    c.bench_function("TransportLayerNack MarshalTo", |bch| {
        bch.iter(|| nack.marshal_to(&mut buf).unwrap())
    });
    c.bench_function("TransportLayerNack Marshal", |bch| bch.iter(|| nack.marshal().unwrap()));
    c.bench_function("TransportLayerNack Unmarshal", |bch| {
        bch.iter(|| {
            let mut b = &raw[..];
            TransportLayerNack::unmarshal(&mut b).unwrap()
        })
    });
}

fn benchmark_goodbye(c: &mut Criterion) {
    let goodbye = Goodbye {
        sources: vec![0x902f9e2e, 0xbc5e9a40, 0x12345678],
        reason: Bytes::from_static(b"Session ended"),
    };

    let raw = goodbye.marshal().unwrap();
    let mut b = &raw[..];
    let p = Goodbye::unmarshal(&mut b).unwrap();
    assert_eq!(goodbye, p);

    let mut buf = BytesMut::zeroed(goodbye.marshal_size());
    c.bench_function("Goodbye MarshalTo", |bch| bch.iter(|| goodbye.marshal_to(&mut buf).unwrap()));
    c.bench_function("Goodbye Marshal", |bch| bch.iter(|| goodbye.marshal().unwrap()));
    c.bench_function("Goodbye Unmarshal", |bch| {
        bch.iter(|| {
            let mut b = &raw[..];
            Goodbye::unmarshal(&mut b).unwrap()
        })
    });
}

fn benchmark_source_description(c: &mut Criterion) {
    let sdes = SourceDescription {
        chunks: vec![
            SdesChunk {
                ssrc: 0x902f9e2e,
                items: vec![
                    SdesItem::cname(Bytes::from_static(b"user@example.com")),
                    SdesItem { item_type: 2, text: Bytes::from_static(b"John Doe") },
                ],
            },
            SdesChunk {
                ssrc: 0xbc5e9a40,
                items: vec![SdesItem::cname(Bytes::from_static(b"peer@example.com"))],
            },
        ],
    };

    let raw = sdes.marshal().unwrap();
    let mut b = &raw[..];
    let p = SourceDescription::unmarshal(&mut b).unwrap();
    assert_eq!(sdes, p);

    let mut buf = BytesMut::zeroed(sdes.marshal_size());
    c.bench_function("SourceDescription MarshalTo", |bch| {
        bch.iter(|| sdes.marshal_to(&mut buf).unwrap())
    });
    c.bench_function("SourceDescription Marshal", |bch| bch.iter(|| sdes.marshal().unwrap()));
    c.bench_function("SourceDescription Unmarshal", |bch| {
        bch.iter(|| {
            let mut b = &raw[..];
            SourceDescription::unmarshal(&mut b).unwrap()
        })
    });
}

criterion_group!(
    benches,
    benchmark_sender_report,
    benchmark_receiver_report,
    benchmark_picture_loss_indication,
    benchmark_transport_layer_nack,
    benchmark_goodbye,
    benchmark_source_description
);
criterion_main!(benches);
