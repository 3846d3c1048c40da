use bytes::{Buf, Bytes};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::goodbye::Goodbye;
use crate::header::{packet_type, RtcpHeader};
use crate::picture_loss_indication::PictureLossIndication;
use crate::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use crate::receiver_report::ReceiverReport;
use crate::sender_report::SenderReport;
use crate::source_description::SourceDescription;
use crate::transport_layer_nack::TransportLayerNack;

/// A single parsed RTCP packet out of a (possibly compound) datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(SourceDescription),
    Goodbye(Goodbye),
    TransportLayerNack(TransportLayerNack),
    PictureLossIndication(PictureLossIndication),
    ReceiverEstimatedMaximumBitrate(ReceiverEstimatedMaximumBitrate),
    /// A syntactically valid but semantically unsupported feedback/APP
    /// packet, kept so a compound's other packets can still be delivered.
    Raw { header: RtcpHeader, body: Bytes },
}

impl RtcpPacket {
    pub fn media_ssrc(&self) -> Option<u32> {
        match self {
            RtcpPacket::SenderReport(p) => Some(p.ssrc),
            RtcpPacket::ReceiverReport(p) => Some(p.ssrc),
            RtcpPacket::TransportLayerNack(p) => Some(p.media_ssrc),
            RtcpPacket::PictureLossIndication(p) => Some(p.media_ssrc),
            RtcpPacket::ReceiverEstimatedMaximumBitrate(p) => Some(p.sender_ssrc),
            _ => None,
        }
    }
}

impl MarshalSize for RtcpPacket {
    fn marshal_size(&self) -> usize {
        match self {
            RtcpPacket::SenderReport(p) => p.marshal_size(),
            RtcpPacket::ReceiverReport(p) => p.marshal_size(),
            RtcpPacket::SourceDescription(p) => p.marshal_size(),
            RtcpPacket::Goodbye(p) => p.marshal_size(),
            RtcpPacket::TransportLayerNack(p) => p.marshal_size(),
            RtcpPacket::PictureLossIndication(p) => p.marshal_size(),
            RtcpPacket::ReceiverEstimatedMaximumBitrate(p) => p.marshal_size(),
            RtcpPacket::Raw { body, .. } => 4 + body.len(),
        }
    }
}

impl Marshal for RtcpPacket {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            RtcpPacket::SenderReport(p) => p.marshal_to(buf),
            RtcpPacket::ReceiverReport(p) => p.marshal_to(buf),
            RtcpPacket::SourceDescription(p) => p.marshal_to(buf),
            RtcpPacket::Goodbye(p) => p.marshal_to(buf),
            RtcpPacket::TransportLayerNack(p) => p.marshal_to(buf),
            RtcpPacket::PictureLossIndication(p) => p.marshal_to(buf),
            RtcpPacket::ReceiverEstimatedMaximumBitrate(p) => p.marshal_to(buf),
            RtcpPacket::Raw { header, body } => {
                let need = 4 + body.len();
                if buf.len() < need {
                    return Err(Error::WrongMarshalSize { need, have: buf.len() });
                }
                header.marshal_with_len(buf, body.len())?;
                buf[4..need].copy_from_slice(body);
                Ok(need)
            }
        }
    }
}

/// Parses one RTCP packet, leaving `buf` positioned after it — used by
/// `parse_compound` to walk a concatenated datagram.
pub fn unmarshal_one(buf: &mut Bytes) -> Result<RtcpPacket> {
    if buf.remaining() < 4 {
        return Err(Error::short("rtcp_packet"));
    }
    let mut peek = buf.clone();
    let header = RtcpHeader::unmarshal(&mut peek)?;
    let total_len = 4 + header.length_bytes;
    if buf.remaining() < total_len {
        return Err(Error::short("rtcp_packet_body"));
    }
    let mut slice = buf.copy_to_bytes(total_len);

    let packet = match header.packet_type {
        packet_type::SENDER_REPORT => RtcpPacket::SenderReport(SenderReport::unmarshal(&mut slice)?),
        packet_type::RECEIVER_REPORT => RtcpPacket::ReceiverReport(ReceiverReport::unmarshal(&mut slice)?),
        packet_type::SOURCE_DESCRIPTION => {
            RtcpPacket::SourceDescription(SourceDescription::unmarshal(&mut slice)?)
        }
        packet_type::GOODBYE => RtcpPacket::Goodbye(Goodbye::unmarshal(&mut slice)?),
        packet_type::TRANSPORT_SPECIFIC_FEEDBACK if header.count == crate::header::format::NACK => {
            RtcpPacket::TransportLayerNack(TransportLayerNack::unmarshal(&mut slice)?)
        }
        packet_type::PAYLOAD_SPECIFIC_FEEDBACK if header.count == crate::header::format::PLI => {
            RtcpPacket::PictureLossIndication(PictureLossIndication::unmarshal(&mut slice)?)
        }
        packet_type::PAYLOAD_SPECIFIC_FEEDBACK if header.count == crate::header::format::REMB_AFB => {
            match ReceiverEstimatedMaximumBitrate::unmarshal(&mut slice) {
                Ok(remb) => RtcpPacket::ReceiverEstimatedMaximumBitrate(remb),
                Err(_) => RtcpPacket::Raw { header, body: slice.slice(4..) },
            }
        }
        _ => RtcpPacket::Raw { header, body: slice.slice(4..) },
    };
    Ok(packet)
}

/// Parses every packet out of a compound RTCP datagram.
pub fn parse_compound(mut buf: Bytes) -> Result<Vec<RtcpPacket>> {
    if buf.is_empty() {
        return Err(Error::InvalidFraming { field: "empty_compound" });
    }
    let mut packets = Vec::new();
    while buf.has_remaining() {
        packets.push(unmarshal_one(&mut buf)?);
    }
    Ok(packets)
}

/// Serializes multiple RTCP packets back-to-back into one compound datagram.
pub fn marshal_compound(packets: &[RtcpPacket]) -> Result<Bytes> {
    let total: usize = packets.iter().map(|p| p.marshal_size()).sum();
    let mut out = bytes::BytesMut::zeroed(total);
    let mut offset = 0;
    for p in packets {
        let n = p.marshal_to(&mut out[offset..])?;
        offset += n;
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::report_block::SenderInfo;

    #[test]
    fn compound_round_trip() {
        let packets = vec![
            RtcpPacket::SenderReport(SenderReport {
                ssrc: 1,
                sender_info: SenderInfo { ntp_time: 10, rtp_time: 20, packet_count: 3, octet_count: 400 },
                report_blocks: vec![],
            }),
            RtcpPacket::SourceDescription(SourceDescription {
                chunks: vec![crate::source_description::SdesChunk {
                    ssrc: 1,
                    items: vec![crate::source_description::SdesItem::cname(Bytes::from_static(b"cname"))],
                }],
            }),
            RtcpPacket::Goodbye(Goodbye { sources: vec![1], reason: Bytes::new() }),
        ];
        let buf = marshal_compound(&packets).unwrap();
        let parsed = parse_compound(buf).unwrap();
        assert_eq!(parsed, packets);
    }

    #[test]
    fn empty_compound_rejected() {
        assert!(parse_compound(Bytes::new()).is_err());
    }
}
