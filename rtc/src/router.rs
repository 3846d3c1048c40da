//! RTP/RTCP router: lives inside the DTLS-SRTP transport in spirit but has
//! no knowledge of sockets, so it is exercised here as a plain,
//! unit-testable struct the transport glue drives.

use std::collections::HashMap;

use rtcp::RtcpPacket;

/// Opaque handle returned by [`RtpRouter::register_receiver`]. Stable across
/// ssrc rebinding; only [`RtpRouter::unregister_receiver`] invalidates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(u32);

struct ReceiverBinding {
    ssrcs: Vec<u32>,
    payload_types: Vec<u8>,
    #[allow(dead_code)]
    mid: Option<String>,
}

/// Where one RTCP packet's feedback belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpTarget {
    Receiver(ReceiverId),
    Sender(u32),
}

/// Dispatches parsed RTP/RTCP packets to the receiver or sender they
/// belong to within one BUNDLE group.
#[derive(Debug, Default)]
pub struct RtpRouter {
    next_id: u32,
    receivers: HashMap<ReceiverId, ReceiverBinding>,
    senders: std::collections::HashSet<u32>,
}

impl RtpRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a receiver by its known ssrcs, payload types, and
    /// optional mid. An empty `ssrcs` is legal: the first unambiguous
    /// payload-type match binds one in.
    pub fn register_receiver(&mut self, ssrcs: Vec<u32>, payload_types: Vec<u8>, mid: Option<String>) -> ReceiverId {
        let id = ReceiverId(self.next_id);
        self.next_id += 1;
        self.receivers.insert(id, ReceiverBinding { ssrcs, payload_types, mid });
        id
    }

    pub fn register_sender(&mut self, ssrc: u32) {
        self.senders.insert(ssrc);
    }

    /// Removes every binding referencing `id` (universal invariant 5's
    /// corollary: unregistration removes all bindings for the value).
    pub fn unregister_receiver(&mut self, id: ReceiverId) {
        self.receivers.remove(&id);
    }

    pub fn unregister_sender(&mut self, ssrc: u32) {
        self.senders.remove(&ssrc);
    }

    fn receiver_by_ssrc(&self, ssrc: u32) -> Option<ReceiverId> {
        self.receivers.iter().find(|(_, b)| b.ssrcs.contains(&ssrc)).map(|(id, _)| *id)
    }

    /// Routes one RTP packet by `(ssrc, payload_type)`. Binds a previously
    /// unknown ssrc to the unambiguous payload-type match it resolves to;
    /// drops (returns `None`) when the ssrc is unknown and the payload
    /// type maps to zero or more than one receiver.
    pub fn route_rtp(&mut self, ssrc: u32, payload_type: u8) -> Option<ReceiverId> {
        if let Some(id) = self.receiver_by_ssrc(ssrc) {
            return Some(id);
        }
        let mut matches: Vec<ReceiverId> =
            self.receivers.iter().filter(|(_, b)| b.payload_types.contains(&payload_type)).map(|(id, _)| *id).collect();
        if matches.len() != 1 {
            return None;
        }
        let id = matches.remove(0);
        self.receivers.get_mut(&id).unwrap().ssrcs.push(ssrc);
        Some(id)
    }

    /// Routes one parsed RTCP packet to every receiver/sender it addresses.
    /// A single packet can yield several deliveries (e.g. an RR with report
    /// blocks for more than one sender, or a BYE naming several ssrcs).
    pub fn route_rtcp(&self, packet: &RtcpPacket) -> Vec<RtcpTarget> {
        let mut targets = Vec::new();
        match packet {
            RtcpPacket::SenderReport(sr) => {
                if let Some(id) = self.receiver_by_ssrc(sr.ssrc) {
                    targets.push(RtcpTarget::Receiver(id));
                }
                for rb in &sr.report_blocks {
                    if self.senders.contains(&rb.ssrc) {
                        targets.push(RtcpTarget::Sender(rb.ssrc));
                    }
                }
            }
            RtcpPacket::ReceiverReport(rr) => {
                for rb in &rr.report_blocks {
                    if self.senders.contains(&rb.ssrc) {
                        targets.push(RtcpTarget::Sender(rb.ssrc));
                    }
                }
            }
            RtcpPacket::Goodbye(bye) => {
                for ssrc in &bye.sources {
                    if let Some(id) = self.receiver_by_ssrc(*ssrc) {
                        targets.push(RtcpTarget::Receiver(id));
                    }
                }
            }
            RtcpPacket::TransportLayerNack(nack) => {
                if self.senders.contains(&nack.media_ssrc) {
                    targets.push(RtcpTarget::Sender(nack.media_ssrc));
                }
            }
            RtcpPacket::PictureLossIndication(pli) => {
                if self.senders.contains(&pli.media_ssrc) {
                    targets.push(RtcpTarget::Sender(pli.media_ssrc));
                }
            }
            RtcpPacket::ReceiverEstimatedMaximumBitrate(remb) => {
                for ssrc in &remb.ssrcs {
                    if self.senders.contains(ssrc) {
                        targets.push(RtcpTarget::Sender(*ssrc));
                    }
                }
            }
            RtcpPacket::SourceDescription(_) | RtcpPacket::Raw { .. } => {}
        }
        targets
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rtcp::{Goodbye, PictureLossIndication, ReportBlock, SenderReport};

    #[test]
    fn known_ssrc_routes_directly() {
        let mut router = RtpRouter::new();
        let id = router.register_receiver(vec![42], vec![96], None);
        assert_eq!(router.route_rtp(42, 96), Some(id));
    }

    #[test]
    fn unknown_ssrc_binds_on_unambiguous_payload_type() {
        let mut router = RtpRouter::new();
        let id = router.register_receiver(vec![], vec![96], None);
        assert_eq!(router.route_rtp(7, 96), Some(id));
        // now bound: a second packet from the same ssrc routes without pt help.
        assert_eq!(router.route_rtp(7, 255), Some(id));
    }

    #[test]
    fn ambiguous_payload_type_drops() {
        let mut router = RtpRouter::new();
        router.register_receiver(vec![], vec![96], None);
        router.register_receiver(vec![], vec![96], None);
        assert_eq!(router.route_rtp(7, 96), None);
    }

    #[test]
    fn unknown_ssrc_and_pt_drops() {
        let mut router = RtpRouter::new();
        router.register_receiver(vec![1], vec![96], None);
        assert_eq!(router.route_rtp(999, 111), None);
    }

    #[test]
    fn unregister_removes_bindings() {
        let mut router = RtpRouter::new();
        let id = router.register_receiver(vec![42], vec![96], None);
        router.unregister_receiver(id);
        assert_eq!(router.route_rtp(42, 96), None);
    }

    #[test]
    fn bye_notifies_every_named_receiver() {
        let mut router = RtpRouter::new();
        let a = router.register_receiver(vec![1], vec![], None);
        let b = router.register_receiver(vec![2], vec![], None);
        let bye = RtcpPacket::Goodbye(Goodbye { sources: vec![1, 2], reason: Default::default() });
        let targets = router.route_rtcp(&bye);
        assert!(targets.contains(&RtcpTarget::Receiver(a)));
        assert!(targets.contains(&RtcpTarget::Receiver(b)));
    }

    #[test]
    fn sr_report_blocks_route_to_senders() {
        let mut router = RtpRouter::new();
        router.register_sender(100);
        let sr = RtcpPacket::SenderReport(SenderReport {
            ssrc: 1,
            sender_info: Default::default(),
            report_blocks: vec![ReportBlock { ssrc: 100, ..Default::default() }],
        });
        assert_eq!(router.route_rtcp(&sr), vec![RtcpTarget::Sender(100)]);
    }

    #[test]
    fn pli_routes_by_media_ssrc() {
        let mut router = RtpRouter::new();
        router.register_sender(55);
        let pli = RtcpPacket::PictureLossIndication(PictureLossIndication { sender_ssrc: 1, media_ssrc: 55 });
        assert_eq!(router.route_rtcp(&pli), vec![RtcpTarget::Sender(55)]);
    }
}
