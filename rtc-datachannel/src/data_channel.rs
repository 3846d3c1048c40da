//! Data channel lifecycle layered on top of a plain [`rtc_sctp::Association`]:
//! DCEP negotiation, stream id allocation by DTLS role, ready-state tracking
//! and buffered-amount accounting (RFC 8831/8832).
//!
//! Dial/accept split, `DataChannelConfig`, and reliability-parameter
//! mapping, adapted to this core's `Association`, which already does SCTP
//! fragmentation/reassembly and hands back whole messages via
//! `AssociationEvent::Message`, so there is no per-chunk glue layer to carry
//! over — this module only has to speak DCEP and manage channel state.

use crate::dcep::{ChannelType, DataChannelOpen, Message as DcepMessage};
use bytes::Bytes;
use log::debug;
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{Marshal, Unmarshal};
use sctp::{Association, AssociationEvent};
use std::collections::{BTreeSet, HashMap};

/// PPIDs used on the SCTP stream carrying a data channel (RFC 8832 §8.1,
/// RFC 8831 §6.6).
pub mod ppid {
    pub const DCEP: u32 = 50;
    pub const STRING: u32 = 51;
    pub const BINARY: u32 = 53;
    pub const STRING_EMPTY: u32 = 56;
    pub const BINARY_EMPTY: u32 = 57;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Negotiation-time parameters for a channel, mirroring the RTCDataChannelInit
/// dictionary.
#[derive(Debug, Clone)]
pub struct DataChannelConfig {
    pub label: String,
    pub protocol: String,
    pub channel_type: ChannelType,
    pub priority: u16,
    pub reliability_parameter: u32,
    /// `negotiated`: both sides pre-agree on `id` out of band and skip DCEP
    /// entirely.
    pub negotiated: bool,
    pub id: Option<u16>,
}

impl DataChannelConfig {
    pub fn reliable(label: impl Into<String>) -> Self {
        DataChannelConfig {
            label: label.into(),
            protocol: String::new(),
            channel_type: ChannelType::Reliable,
            priority: 0,
            reliability_parameter: 0,
            negotiated: false,
            id: None,
        }
    }

    fn ordered(&self) -> bool {
        self.channel_type.ordered()
    }
}

/// One data channel: lifecycle state plus buffered-amount bookkeeping.
/// Payload send/receive itself is driven through [`DataChannels`], which
/// owns the shared [`Association`].
#[derive(Debug, Clone)]
pub struct DataChannel {
    pub id: u16,
    pub config: DataChannelConfig,
    pub ready_state: ReadyState,
    pub buffered_amount_low_threshold: usize,
    last_buffered_amount: usize,
    messages_sent: usize,
    messages_received: usize,
    bytes_sent: usize,
    bytes_received: usize,
}

impl DataChannel {
    pub fn messages_sent(&self) -> usize {
        self.messages_sent
    }
    pub fn messages_received(&self) -> usize {
        self.messages_received
    }
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }
    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }
}

/// Message payloads and channel lifecycle transitions the host reacts to.
#[derive(Debug, Clone)]
pub enum DataChannelEvent {
    /// Channel finished negotiation (DCEP ACK received, or DCEP OPEN
    /// accepted and acked) and is ready to send/receive.
    Open { id: u16 },
    /// A complete application message arrived. `is_string` reflects the
    /// PPID the peer tagged it with (51/56 vs 53/57).
    Message { id: u16, data: Bytes, is_string: bool },
    /// Crossed `buffered_amount_low_threshold` going downward.
    BufferedAmountLow { id: u16 },
    /// Peer reset the incoming stream, or our own close completed.
    Closed { id: u16 },
}

/// Owns every data channel multiplexed over one SCTP association and
/// translates [`AssociationEvent`]s into [`DataChannelEvent`]s.
pub struct DataChannels {
    channels: HashMap<u16, DataChannel>,
    next_id: u16,
    /// Ids of our own closed channels, available for reuse before bumping
    /// `next_id` further -- closing chat2 (id 3) and then opening chat4
    /// hands chat4 id 3 back rather than the next unused odd id.
    free_ids: BTreeSet<u16>,
    is_client: bool,
}

impl DataChannels {
    /// `is_client` is this side's DTLS role: stream ids opened locally use
    /// odd ids on the client, even ids on the server. Parity follows DTLS
    /// role, not who happens to dial first.
    pub fn new(is_client: bool) -> Self {
        DataChannels {
            channels: HashMap::new(),
            next_id: if is_client { 1 } else { 0 },
            free_ids: BTreeSet::new(),
            is_client,
        }
    }

    fn alloc_id(&mut self) -> u16 {
        if let Some(&id) = self.free_ids.iter().next() {
            self.free_ids.remove(&id);
            return id;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(2);
        id
    }

    fn expected_parity(&self) -> u16 {
        if self.is_client {
            1
        } else {
            0
        }
    }

    pub fn get(&self, id: u16) -> Option<&DataChannel> {
        self.channels.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataChannel> {
        self.channels.values()
    }

    /// Begins opening a channel: allocates (or validates a negotiated) id,
    /// sends DCEP OPEN unless `negotiated`, and registers the channel as
    /// `Connecting` (or `Open` immediately when negotiated, since there is
    /// no handshake to wait for).
    pub fn open(
        &mut self,
        association: &mut Association,
        config: DataChannelConfig,
        now_ms: u64,
    ) -> Result<u16> {
        let id = match config.id {
            Some(id) => {
                if !config.negotiated {
                    return Err(Error::InvalidState("explicit id without negotiated"));
                }
                id
            }
            None => self.alloc_id(),
        };
        if self.channels.contains_key(&id) {
            return Err(Error::InvalidState("data channel id already in use"));
        }

        let ready_state = if config.negotiated {
            ReadyState::Open
        } else {
            let open = DataChannelOpen {
                channel_type: config.channel_type,
                priority: config.priority,
                reliability_parameter: config.reliability_parameter,
                label: config.label.clone(),
                protocol: config.protocol.clone(),
            };
            let buf = DcepMessage::Open(open).marshal()?;
            association.send(id, ppid::DCEP, true, &buf, now_ms)?;
            ReadyState::Connecting
        };

        self.channels.insert(
            id,
            DataChannel {
                id,
                config,
                ready_state,
                buffered_amount_low_threshold: 0,
                last_buffered_amount: 0,
                messages_sent: 0,
                messages_received: 0,
                bytes_sent: 0,
                bytes_received: 0,
            },
        );
        Ok(id)
    }

    /// Sends one application message. Binary/string and empty-message PPIDs
    /// follow RFC 8831 §6.6 exactly (an empty SCTP user message is not
    /// legal, so empty payloads are sent as one zero byte under the
    /// `*_EMPTY` PPID and the receiver is expected to discard that byte).
    pub fn send(
        &mut self,
        association: &mut Association,
        id: u16,
        data: &[u8],
        is_string: bool,
        now_ms: u64,
    ) -> Result<()> {
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or(Error::InvalidState("unknown data channel id"))?;
        if !matches!(channel.ready_state, ReadyState::Open) {
            return Err(Error::InvalidState("data channel not open"));
        }
        let ppid = match (is_string, data.is_empty()) {
            (true, true) => ppid::STRING_EMPTY,
            (true, false) => ppid::STRING,
            (false, true) => ppid::BINARY_EMPTY,
            (false, false) => ppid::BINARY,
        };
        let wire: &[u8] = if data.is_empty() { &[0u8] } else { data };
        association.send(id, ppid, channel.config.ordered(), wire, now_ms)?;
        channel.messages_sent += 1;
        channel.bytes_sent += data.len();
        Ok(())
    }

    /// Resets the channel's outgoing stream (RFC 8831 §6.7 close procedure).
    /// The channel moves to `Closed` once the peer's corresponding
    /// `StreamReset` event for this id arrives back through
    /// [`Self::handle_association_event`].
    pub fn close(&mut self, association: &mut Association, id: u16) -> Result<()> {
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or(Error::InvalidState("unknown data channel id"))?;
        channel.ready_state = ReadyState::Closing;
        association.reset_stream(id)
    }

    /// Feeds one [`AssociationEvent`] pulled from the underlying
    /// association's `poll_event`, translating it into zero or one
    /// [`DataChannelEvent`] for the host.
    pub fn handle_association_event(
        &mut self,
        association: &mut Association,
        event: AssociationEvent,
        now_ms: u64,
    ) -> Result<Option<DataChannelEvent>> {
        match event {
            AssociationEvent::Message { stream_id, ppid, data } => {
                self.handle_message(association, stream_id, ppid, data, now_ms)
            }
            AssociationEvent::StreamReset { stream_id } => {
                if let Some(channel) = self.channels.get_mut(&stream_id) {
                    channel.ready_state = ReadyState::Closed;
                    let recycle = !channel.config.negotiated && stream_id % 2 == self.expected_parity();
                    if recycle {
                        // Stale once its id goes back into the pool; the next
                        // `open()` on this id creates a fresh entry.
                        self.channels.remove(&stream_id);
                        self.free_ids.insert(stream_id);
                    }
                    Ok(Some(DataChannelEvent::Closed { id: stream_id }))
                } else {
                    Ok(None)
                }
            }
            AssociationEvent::Established | AssociationEvent::Closed => Ok(None),
        }
    }

    fn handle_message(
        &mut self,
        association: &mut Association,
        stream_id: u16,
        ppid: u32,
        data: Bytes,
        now_ms: u64,
    ) -> Result<Option<DataChannelEvent>> {
        if ppid == ppid::DCEP {
            return self.handle_dcep(association, stream_id, &data, now_ms);
        }

        let channel = match self.channels.get_mut(&stream_id) {
            Some(channel) => channel,
            // A peer-initiated, pre-negotiated channel we never got an
            // explicit `open()` call for locally is not representable here;
            // the host must call `open` with `negotiated: true` up front.
            None => return Ok(None),
        };
        channel.messages_received += 1;
        channel.bytes_received += data.len();
        let (payload, is_string) = match ppid {
            ppid::STRING => (data, true),
            ppid::STRING_EMPTY => (Bytes::new(), true),
            ppid::BINARY_EMPTY => (Bytes::new(), false),
            _ => (data, false),
        };
        Ok(Some(DataChannelEvent::Message { id: stream_id, data: payload, is_string }))
    }

    fn handle_dcep(
        &mut self,
        association: &mut Association,
        stream_id: u16,
        data: &[u8],
        now_ms: u64,
    ) -> Result<Option<DataChannelEvent>> {
        let mut buf = Bytes::copy_from_slice(data);
        let msg = DcepMessage::unmarshal(&mut buf)?;
        match msg {
            DcepMessage::Open(open) => {
                // Re-check id parity against our own role on every incoming
                // OPEN rather than trusting the peer: a colliding parity
                // means both sides picked the same id space.
                if stream_id % 2 == self.expected_parity() {
                    debug!("rejecting DCEP OPEN on id {stream_id} with colliding parity");
                    return Err(Error::ProtocolViolation("data channel id parity collision"));
                }
                if self.channels.contains_key(&stream_id) {
                    return Ok(None);
                }
                let ack = DcepMessage::Ack.marshal()?;
                association.send(stream_id, ppid::DCEP, true, &ack, now_ms)?;
                self.channels.insert(
                    stream_id,
                    DataChannel {
                        id: stream_id,
                        config: DataChannelConfig {
                            label: open.label,
                            protocol: open.protocol,
                            channel_type: open.channel_type,
                            priority: open.priority,
                            reliability_parameter: open.reliability_parameter,
                            negotiated: false,
                            id: Some(stream_id),
                        },
                        ready_state: ReadyState::Open,
                        buffered_amount_low_threshold: 0,
                        last_buffered_amount: 0,
                        messages_sent: 0,
                        messages_received: 0,
                        bytes_sent: 0,
                        bytes_received: 0,
                    },
                );
                Ok(Some(DataChannelEvent::Open { id: stream_id }))
            }
            DcepMessage::Ack => {
                if let Some(channel) = self.channels.get_mut(&stream_id) {
                    channel.ready_state = ReadyState::Open;
                    Ok(Some(DataChannelEvent::Open { id: stream_id }))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Re-reads every open channel's outstanding bytes from the association
    /// and reports which ones just crossed their low-threshold downward.
    /// The host calls this after pumping `poll_transmit`/`handle_timeout`,
    /// since the association (not this layer) is what drains the backlog.
    pub fn poll_buffered_amount_low(&mut self, association: &Association) -> Vec<u16> {
        let mut crossed = Vec::new();
        for channel in self.channels.values_mut() {
            let current = association.buffered_amount(channel.id);
            if channel.last_buffered_amount > channel.buffered_amount_low_threshold
                && current <= channel.buffered_amount_low_threshold
            {
                crossed.push(channel.id);
            }
            channel.last_buffered_amount = current;
        }
        crossed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sctp::TransportConfig;

    fn assoc(is_client: bool) -> Association {
        Association::new(TransportConfig { is_client, ..Default::default() })
    }

    #[test]
    fn id_allocation_follows_role_parity() {
        let mut client = DataChannels::new(true);
        let mut server = DataChannels::new(false);
        let mut a = assoc(true);
        let mut b = assoc(false);
        let id1 = client.open(&mut a, DataChannelConfig::reliable("a"), 0).unwrap();
        let id2 = server.open(&mut b, DataChannelConfig::reliable("b"), 0).unwrap();
        assert_eq!(id1 % 2, 1);
        assert_eq!(id2 % 2, 0);
    }

    #[test]
    fn negotiated_channel_is_open_immediately() {
        let mut channels = DataChannels::new(true);
        let mut a = assoc(true);
        let config = DataChannelConfig {
            negotiated: true,
            id: Some(4),
            ..DataChannelConfig::reliable("negotiated")
        };
        let id = channels.open(&mut a, config, 0).unwrap();
        assert_eq!(channels.get(id).unwrap().ready_state, ReadyState::Open);
    }

    #[test]
    fn closed_channel_id_is_recycled() {
        let mut client = DataChannels::new(true);
        let mut a = assoc(true);
        let chat1 = client.open(&mut a, DataChannelConfig::reliable("chat1"), 0).unwrap();
        let chat2 = client.open(&mut a, DataChannelConfig::reliable("chat2"), 0).unwrap();
        let chat3 = client.open(&mut a, DataChannelConfig::reliable("chat3"), 0).unwrap();
        assert_eq!((chat1, chat2, chat3), (1, 3, 5));

        client
            .handle_association_event(&mut a, AssociationEvent::StreamReset { stream_id: chat2 }, 0)
            .unwrap();

        let chat4 = client.open(&mut a, DataChannelConfig::reliable("chat4"), 0).unwrap();
        assert_eq!(chat4, chat2);
    }

    #[test]
    fn dcep_open_with_colliding_parity_is_rejected() {
        let mut channels = DataChannels::new(true);
        let mut a = assoc(true);
        let open = DataChannelOpen {
            channel_type: ChannelType::Reliable,
            priority: 0,
            reliability_parameter: 0,
            label: "x".to_string(),
            protocol: String::new(),
        };
        let buf = DcepMessage::Open(open).marshal().unwrap();
        // Client expects its own locally-opened ids to be odd, so an
        // incoming OPEN on an odd id (the same parity the client itself
        // uses) must be rejected rather than silently accepted.
        let err = channels.handle_dcep(&mut a, 3, &buf, 0).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }
}
