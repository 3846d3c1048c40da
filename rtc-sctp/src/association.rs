//! Sans-io SCTP association state machine (RFC 4960), driven by
//! `poll_transmit`/`poll_timeout`/`handle_timeout`/`handle_receive` the same
//! way `rtc_dtls::DtlsTransport` is — the host owns the clock and the
//! datagram socket, this struct only ever touches bytes and a monotonic
//! millisecond timestamp it is handed.
//!
//! Chunk framing lives in [`crate::chunk`] and [`crate::packet`]; this module
//! is the handshake, congestion control, reassembly, and RFC 6525 stream
//! reconfiguration logic layered on top of it. DCEP and `DataChannel` are a
//! layer above this one, in `rtc-datachannel`.

use std::collections::{BTreeSet, HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use rtc_shared::error::{Error, Result};
use rtc_shared::seq::Tsn;

use crate::chunk::{
    abort_chunk, cookie_ack_chunk, cookie_echo_chunk, error_chunk, heartbeat_chunk, heartbeat_info,
    parse_reconfig_params, reconfig_chunk, reconfig_result, shutdown_ack_chunk,
    shutdown_complete_chunk, DataChunk, ErrorCause, GapAckBlock, InitChunk, InitOptionalParams,
    OutgoingResetRequest, ReconfigParam, ReconfigResponse, SackChunk, ShutdownChunk,
};
use crate::config::{self, TransportConfig};
use crate::packet::{cause_code, chunk_type, marshal_packet, unmarshal_packet, CommonHeader, RawChunk};

type HmacSha1 = Hmac<Sha1>;

/// SCTP association states (RFC 4960 §4), the client/server handshake
/// variants plus the full shutdown cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Closed,
    CookieWait,
    CookieEchoed,
    Established,
    ShutdownPending,
    ShutdownSent,
    ShutdownReceived,
    ShutdownAckSent,
}

/// Things the host needs to react to: message delivery, stream teardown
/// (peer- or self-initiated), and the two association-wide transitions.
#[derive(Debug, Clone)]
pub enum AssociationEvent {
    Established,
    Closed,
    Message { stream_id: u16, ppid: u32, data: Bytes },
    StreamReset { stream_id: u16 },
}

struct OutboundChunk {
    tsn: u32,
    stream_id: u16,
    stream_seq: u16,
    ppid: u32,
    unordered: bool,
    begin: bool,
    end: bool,
    user_data: Bytes,
    book_size: usize,
    acked: bool,
    misses: u32,
    retransmit: bool,
    sent_count: u32,
    sent_time_ms: Option<u64>,
}

fn build_data_raw(chunk: &OutboundChunk) -> RawChunk {
    DataChunk {
        tsn: chunk.tsn,
        stream_id: chunk.stream_id,
        stream_seq: chunk.stream_seq,
        ppid: chunk.ppid,
        unordered: chunk.unordered,
        begin: chunk.begin,
        end: chunk.end,
        user_data: chunk.user_data.clone(),
    }
    .into_raw()
}

/// Per-stream reassembly queue. Fragments are kept sorted by tsn and popped
/// as complete, in-order messages once a contiguous BEGIN..END run for the
/// stream's next expected `stream_seq` is present.
#[derive(Default)]
struct InboundStream {
    reassembly: Vec<DataChunk>,
    next_seq: u16,
}

impl InboundStream {
    fn add_chunk(&mut self, chunk: DataChunk) {
        let pos = self
            .reassembly
            .iter()
            .position(|c| Tsn::new(c.tsn).gt(Tsn::new(chunk.tsn)));
        match pos {
            Some(i) => self.reassembly.insert(i, chunk),
            None => self.reassembly.push(chunk),
        }
    }

    fn pop_messages(&mut self) -> Vec<(u16, u32, Bytes)> {
        let mut out = Vec::new();
        loop {
            let mut pos = 0usize;
            let mut expected_tsn = 0u32;
            let mut user_data: Vec<u8> = Vec::new();
            let mut completed = false;
            while pos < self.reassembly.len() {
                let chunk = &self.reassembly[pos];
                if chunk.stream_seq != self.next_seq {
                    break;
                }
                if pos == 0 {
                    if !chunk.begin {
                        break;
                    }
                    expected_tsn = chunk.tsn;
                    user_data = chunk.user_data.to_vec();
                } else {
                    if chunk.tsn != expected_tsn {
                        break;
                    }
                    user_data.extend_from_slice(&chunk.user_data);
                }
                if chunk.end {
                    let stream_id = chunk.stream_id;
                    let ppid = chunk.ppid;
                    self.reassembly.drain(0..=pos);
                    self.next_seq = self.next_seq.wrapping_add(1);
                    out.push((stream_id, ppid, Bytes::from(user_data)));
                    completed = true;
                    break;
                }
                pos += 1;
                expected_tsn = expected_tsn.wrapping_add(1);
            }
            if !completed {
                break;
            }
        }
        out
    }
}

struct RetransmitTimer {
    raw: RawChunk,
    failures: u32,
    deadline_ms: u64,
}

pub struct Association {
    config: TransportConfig,
    state: AssociationState,

    hmac_key: [u8; 16],
    local_verification_tag: u32,
    remote_verification_tag: u32,

    local_tsn: u32,
    last_received_tsn: u32,
    last_sacked_tsn: u32,

    advertised_rwnd: u32,
    inbound_streams: HashMap<u16, InboundStream>,
    sack_duplicates: Vec<u32>,
    sack_misordered: BTreeSet<u32>,
    sack_needed: bool,

    cwnd: usize,
    ssthresh: usize,
    flight_size: usize,
    partial_bytes_acked: usize,
    fast_recovery_exit: Option<u32>,
    fast_recovery_transmit: bool,

    outbound_queue: VecDeque<OutboundChunk>,
    outbound_queue_pos: usize,
    outbound_stream_seq: HashMap<u16, u16>,

    reconfig_queue: Vec<u16>,
    reconfig_request: Option<(u32, Vec<u16>)>,
    reconfig_request_seq: u32,
    reconfig_response_seq: u32,

    srtt: Option<f64>,
    rttvar: Option<f64>,
    rto_ms: u64,

    t1: Option<RetransmitTimer>,
    t2: Option<RetransmitTimer>,
    t3_deadline_ms: Option<u64>,

    outbox: VecDeque<Bytes>,
    events: VecDeque<AssociationEvent>,
}

impl Association {
    pub fn new(config: TransportConfig) -> Self {
        let mut hmac_key = [0u8; 16];
        rand::rng().fill_bytes(&mut hmac_key);
        let local_verification_tag = rand::rng().next_u32();
        let local_tsn = rand::rng().next_u32();
        let rto_ms = config.rto_initial_ms;
        let advertised_rwnd = config.advertised_rwnd;

        Association {
            state: AssociationState::Closed,
            hmac_key,
            local_verification_tag,
            remote_verification_tag: 0,
            local_tsn,
            last_received_tsn: 0,
            last_sacked_tsn: Tsn::new(local_tsn).minus_one().value(),
            advertised_rwnd,
            inbound_streams: HashMap::new(),
            sack_duplicates: Vec::new(),
            sack_misordered: BTreeSet::new(),
            sack_needed: false,
            cwnd: 3 * config::USERDATA_MAX_LENGTH,
            ssthresh: usize::MAX,
            flight_size: 0,
            partial_bytes_acked: 0,
            fast_recovery_exit: None,
            fast_recovery_transmit: false,
            outbound_queue: VecDeque::new(),
            outbound_queue_pos: 0,
            outbound_stream_seq: HashMap::new(),
            reconfig_queue: Vec::new(),
            reconfig_request: None,
            reconfig_request_seq: local_tsn,
            reconfig_response_seq: 0,
            srtt: None,
            rttvar: None,
            rto_ms,
            t1: None,
            t2: None,
            t3_deadline_ms: None,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            config,
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn is_client(&self) -> bool {
        self.config.is_client
    }

    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.outbox.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<AssociationEvent> {
        self.events.pop_front()
    }

    /// Bytes still queued or in flight for `stream_id` (enqueued via `send`
    /// but not yet acked). A data-channel layer uses this to track
    /// `bufferedAmount`.
    pub fn buffered_amount(&self, stream_id: u16) -> usize {
        self.outbound_queue.iter().filter(|c| c.stream_id == stream_id).map(|c| c.book_size).sum()
    }

    pub fn poll_timeout(&self) -> Option<u64> {
        [
            self.t1.as_ref().map(|t| t.deadline_ms),
            self.t2.as_ref().map(|t| t.deadline_ms),
            self.t3_deadline_ms,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn handle_timeout(&mut self, now_ms: u64) {
        if matches!(&self.t1, Some(t) if now_ms >= t.deadline_ms) {
            self.t1_expired(now_ms);
        }
        if matches!(&self.t2, Some(t) if now_ms >= t.deadline_ms) {
            self.t2_expired(now_ms);
        }
        if matches!(self.t3_deadline_ms, Some(d) if now_ms >= d) {
            self.t3_expired(now_ms);
        }
    }

    /// Sends INIT and enters COOKIE-WAIT. Only meaningful for the client;
    /// the server waits for an inbound INIT instead.
    pub fn initiate(&mut self, now_ms: u64) -> Result<()> {
        if self.state != AssociationState::Closed {
            return Err(Error::InvalidState("sctp_already_started"));
        }
        let init = InitChunk {
            initiate_tag: self.local_verification_tag,
            advertised_rwnd: self.advertised_rwnd,
            outbound_streams: 65535,
            inbound_streams: 65535,
            initial_tsn: self.local_tsn,
            params: InitOptionalParams { state_cookie: None, supported_ext_chunks: vec![chunk_type::RECONFIG] },
        };
        let raw = init.into_raw(false);
        self.send_chunk_raw(raw.clone());
        self.start_t1(raw, now_ms);
        self.state = AssociationState::CookieWait;
        Ok(())
    }

    /// Queues a user message on `stream_id`, fragmenting at
    /// [`config::USERDATA_MAX_LENGTH`], and pushes as much of it as `cwnd`
    /// allows onto the wire immediately.
    pub fn send(&mut self, stream_id: u16, ppid: u32, ordered: bool, data: &[u8], now_ms: u64) -> Result<()> {
        if self.state != AssociationState::Established {
            return Err(Error::NotConnected);
        }
        let stream_seq = *self.outbound_stream_seq.get(&stream_id).unwrap_or(&0);
        let fragments = data.len().div_ceil(config::USERDATA_MAX_LENGTH).max(1);
        let mut pos = 0;
        for fragment in 0..fragments {
            let end = (pos + config::USERDATA_MAX_LENGTH).min(data.len());
            let user_data = Bytes::copy_from_slice(&data[pos..end]);
            let chunk = OutboundChunk {
                tsn: self.local_tsn,
                stream_id,
                stream_seq,
                ppid,
                unordered: !ordered,
                begin: fragment == 0,
                end: fragment == fragments - 1,
                book_size: user_data.len(),
                user_data,
                acked: false,
                misses: 0,
                retransmit: false,
                sent_count: 0,
                sent_time_ms: None,
            };
            self.local_tsn = self.local_tsn.wrapping_add(1);
            pos = end;
            self.outbound_queue.push_back(chunk);
        }
        self.outbound_stream_seq.insert(stream_id, stream_seq.wrapping_add(1));

        if self.t3_deadline_ms.is_none() {
            self.transmit(now_ms);
        }
        Ok(())
    }

    /// Queues `stream_id` for an outgoing RFC 6525 stream reset and sends a
    /// request immediately if none is already outstanding.
    pub fn reset_stream(&mut self, stream_id: u16) -> Result<()> {
        if self.state != AssociationState::Established {
            return Err(Error::NotConnected);
        }
        if !self.reconfig_queue.contains(&stream_id) {
            self.reconfig_queue.push(stream_id);
        }
        self.transmit_reconfig();
        Ok(())
    }

    /// Begins a graceful shutdown; sends SHUTDOWN once the outbound queue
    /// has drained.
    pub fn shutdown(&mut self, now_ms: u64) -> Result<()> {
        if self.state != AssociationState::Established {
            return Err(Error::InvalidState("sctp_not_established"));
        }
        self.state = AssociationState::ShutdownPending;
        self.try_finish_shutdown(now_ms);
        Ok(())
    }

    /// Sends ABORT and closes immediately, without waiting on in-flight data.
    pub fn abort(&mut self) {
        if self.state == AssociationState::Closed {
            return;
        }
        self.send_chunk_raw(abort_chunk(&[], false));
        self.transition_closed();
    }

    pub fn handle_receive(&mut self, now_ms: u64, data: &[u8]) -> Result<()> {
        let parsed = match unmarshal_packet(data) {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };

        let is_bare_init = parsed.chunks.len() == 1 && parsed.chunks[0].chunk_type == chunk_type::INIT;
        let expected_tag = if is_bare_init { 0 } else { self.local_verification_tag };
        if parsed.header.verification_tag != expected_tag {
            log::debug!(
                "sctp: bad verification tag {} vs {}",
                parsed.header.verification_tag,
                expected_tag
            );
            return Ok(());
        }

        for raw in &parsed.chunks {
            self.receive_chunk(raw, now_ms);
        }

        if self.sack_needed {
            self.send_sack();
        }
        Ok(())
    }

    fn receive_chunk(&mut self, raw: &RawChunk, now_ms: u64) {
        match raw.chunk_type {
            chunk_type::INIT if !self.config.is_client => self.handle_init(raw, now_ms),
            chunk_type::COOKIE_ECHO if !self.config.is_client => self.handle_cookie_echo(raw, now_ms),
            chunk_type::INIT_ACK if self.state == AssociationState::CookieWait => self.handle_init_ack(raw, now_ms),
            chunk_type::COOKIE_ACK if self.state == AssociationState::CookieEchoed => self.handle_cookie_ack(now_ms),
            chunk_type::ERROR if matches!(self.state, AssociationState::CookieWait | AssociationState::CookieEchoed) => {
                self.cancel_t1();
                self.transition_closed();
            }
            chunk_type::DATA => self.handle_data_chunk(raw),
            chunk_type::SACK => self.handle_sack_chunk(raw, now_ms),
            chunk_type::HEARTBEAT => {
                if let Ok(info) = heartbeat_info(raw) {
                    self.send_chunk_raw(heartbeat_chunk(info, true));
                }
            }
            chunk_type::ABORT => {
                log::debug!("sctp: association aborted by remote party");
                self.transition_closed();
            }
            chunk_type::SHUTDOWN => self.handle_shutdown(now_ms),
            chunk_type::SHUTDOWN_ACK if self.state == AssociationState::ShutdownSent => {
                self.cancel_t2();
                self.send_chunk_raw(shutdown_complete_chunk(false));
                self.transition_closed();
            }
            chunk_type::SHUTDOWN_COMPLETE if self.state == AssociationState::ShutdownAckSent => {
                self.cancel_t2();
                self.transition_closed();
            }
            chunk_type::RECONFIG if self.state == AssociationState::Established => self.handle_reconfig(raw),
            _ => {}
        }
    }

    fn handle_init(&mut self, raw: &RawChunk, now_ms: u64) {
        let Ok(init) = InitChunk::from_raw(raw) else { return };
        self.last_received_tsn = Tsn::new(init.initial_tsn).minus_one().value();
        self.reconfig_response_seq = self.last_received_tsn;
        self.remote_verification_tag = init.initiate_tag;
        self.ssthresh = init.advertised_rwnd as usize;

        let ack = InitChunk {
            initiate_tag: self.local_verification_tag,
            advertised_rwnd: self.advertised_rwnd,
            outbound_streams: 65535,
            inbound_streams: 65535,
            initial_tsn: self.local_tsn,
            params: InitOptionalParams {
                state_cookie: Some(self.generate_cookie(now_ms)),
                supported_ext_chunks: vec![chunk_type::RECONFIG],
            },
        };
        self.send_chunk_raw(ack.into_raw(true));
    }

    fn handle_cookie_echo(&mut self, raw: &RawChunk, now_ms: u64) {
        let cookie = &raw.value;
        if cookie.len() != 24 {
            return;
        }
        let (ts_bytes, mac_bytes) = cookie.split_at(4);
        let Ok(mut mac) = <HmacSha1 as Mac>::new_from_slice(&self.hmac_key) else { return };
        mac.update(ts_bytes);
        if mac.verify_slice(mac_bytes).is_err() {
            log::debug!("sctp: state cookie is invalid");
            return;
        }

        let timestamp = u32::from_be_bytes([ts_bytes[0], ts_bytes[1], ts_bytes[2], ts_bytes[3]]);
        let now_secs = (now_ms / 1000) as i64;
        let lifetime_secs = (config::COOKIE_LIFETIME_MS / 1000) as i64;
        if now_secs - (timestamp as i64) > lifetime_secs || (timestamp as i64) > now_secs {
            log::debug!("sctp: state cookie has expired");
            self.send_chunk_raw(error_chunk(&[ErrorCause {
                code: cause_code::STALE_COOKIE,
                info: Bytes::from_static(&[0u8; 8]),
            }]));
            return;
        }

        self.send_chunk_raw(cookie_ack_chunk());
        self.transition_established();
    }

    fn handle_init_ack(&mut self, raw: &RawChunk, now_ms: u64) {
        let Ok(init_ack) = InitChunk::from_raw(raw) else { return };
        self.cancel_t1();
        self.last_received_tsn = Tsn::new(init_ack.initial_tsn).minus_one().value();
        self.reconfig_response_seq = self.last_received_tsn;
        self.remote_verification_tag = init_ack.initiate_tag;
        self.ssthresh = init_ack.advertised_rwnd as usize;

        let Some(cookie) = init_ack.params.state_cookie else { return };
        let echo = cookie_echo_chunk(cookie);
        self.send_chunk_raw(echo.clone());
        self.start_t1(echo, now_ms);
        self.state = AssociationState::CookieEchoed;
    }

    fn handle_cookie_ack(&mut self, _now_ms: u64) {
        self.cancel_t1();
        self.transition_established();
    }

    fn handle_shutdown(&mut self, now_ms: u64) {
        self.cancel_t2();
        self.state = AssociationState::ShutdownReceived;
        let ack = shutdown_ack_chunk();
        self.send_chunk_raw(ack.clone());
        self.start_t2(ack, now_ms);
        self.state = AssociationState::ShutdownAckSent;
    }

    fn handle_data_chunk(&mut self, raw: &RawChunk) {
        let Ok(chunk) = DataChunk::from_raw(raw) else { return };
        self.sack_needed = true;
        if self.mark_received(chunk.tsn) {
            return;
        }
        let stream_id = chunk.stream_id;
        let data_len = chunk.user_data.len() as u32;
        self.inbound_streams.entry(stream_id).or_default().add_chunk(chunk);
        self.advertised_rwnd = self.advertised_rwnd.saturating_sub(data_len);

        let messages = self
            .inbound_streams
            .get_mut(&stream_id)
            .map(|s| s.pop_messages())
            .unwrap_or_default();
        for (sid, ppid, data) in messages {
            self.advertised_rwnd += data.len() as u32;
            self.events.push_back(AssociationEvent::Message { stream_id: sid, ppid, data });
        }
    }

    /// Returns true if `tsn` is a duplicate (already delivered, or already
    /// in the misordered set).
    fn mark_received(&mut self, tsn: u32) -> bool {
        if Tsn::new(self.last_received_tsn).gte(Tsn::new(tsn)) || self.sack_misordered.contains(&tsn) {
            self.sack_duplicates.push(tsn);
            return true;
        }

        self.sack_misordered.insert(tsn);
        let mut last_received = self.last_received_tsn;
        for &t in &self.sack_misordered {
            if t == last_received.wrapping_add(1) {
                last_received = t;
            } else {
                break;
            }
        }
        self.last_received_tsn = last_received;

        self.sack_duplicates.retain(|&t| Tsn::new(t).gt(Tsn::new(last_received)));
        self.sack_misordered.retain(|&t| Tsn::new(t).gt(Tsn::new(last_received)));
        false
    }

    fn handle_sack_chunk(&mut self, raw: &RawChunk, now_ms: u64) {
        let Ok(sack) = SackChunk::from_raw(raw) else { return };
        if Tsn::new(self.last_sacked_tsn).gt(Tsn::new(sack.cumulative_tsn_ack)) {
            return;
        }
        self.last_sacked_tsn = sack.cumulative_tsn_ack;

        let mut done = 0usize;
        let mut done_bytes = 0usize;
        let mut rto_sample = None;
        for i in 0..self.outbound_queue.len() {
            if Tsn::new(self.outbound_queue[i].tsn).gt(Tsn::new(self.last_sacked_tsn)) {
                break;
            }
            done += 1;
            if !self.outbound_queue[i].acked {
                let book = self.outbound_queue[i].book_size;
                done_bytes += book;
                self.flight_size = self.flight_size.saturating_sub(book);
            }
            if done == 1 && self.outbound_queue[i].sent_count == 1 {
                if let Some(sent_at) = self.outbound_queue[i].sent_time_ms {
                    rto_sample = Some(now_ms.saturating_sub(sent_at));
                }
            }
        }
        if let Some(sample) = rto_sample {
            self.update_rto(sample);
        }

        let mut loss = false;
        let mut highest_seen_tsn = None;
        if !sack.gap_ack_blocks.is_empty() {
            let last_gap = *sack.gap_ack_blocks.last().unwrap();
            let highest = sack.cumulative_tsn_ack.wrapping_add(last_gap.end as u32);
            highest_seen_tsn = Some(highest);

            let mut seen: BTreeSet<u32> = BTreeSet::new();
            for gap in &sack.gap_ack_blocks {
                for p in gap.start..=gap.end {
                    seen.insert(sack.cumulative_tsn_ack.wrapping_add(p as u32));
                }
            }

            for i in done..self.outbound_queue.len() {
                let tsn = self.outbound_queue[i].tsn;
                if Tsn::new(tsn).gt(Tsn::new(highest)) {
                    break;
                }
                if !seen.contains(&tsn) {
                    self.outbound_queue[i].misses += 1;
                    if self.outbound_queue[i].misses == config::FAST_RETRANSMIT_MISSES {
                        self.outbound_queue[i].misses = 0;
                        self.outbound_queue[i].retransmit = true;
                        self.outbound_queue[i].acked = false;
                        let book = self.outbound_queue[i].book_size;
                        self.flight_size = self.flight_size.saturating_sub(book);
                        loss = true;
                    }
                } else if !self.outbound_queue[i].acked {
                    let book = self.outbound_queue[i].book_size;
                    done_bytes += book;
                    self.outbound_queue[i].acked = true;
                    self.flight_size = self.flight_size.saturating_sub(book);
                }
            }
        }

        let mut restart_t3 = done > 0;
        if done > 0 {
            self.outbound_queue.drain(0..done);
            self.outbound_queue_pos = self.outbound_queue_pos.saturating_sub(done);
        }

        if self.fast_recovery_exit.is_none() {
            if done > 0 {
                if self.cwnd <= self.ssthresh {
                    self.cwnd += done_bytes.min(config::USERDATA_MAX_LENGTH);
                } else {
                    self.partial_bytes_acked += done_bytes;
                    if self.partial_bytes_acked >= self.cwnd {
                        self.partial_bytes_acked -= self.cwnd;
                        self.cwnd += config::USERDATA_MAX_LENGTH;
                    }
                }
            }
            if loss {
                self.ssthresh = (self.cwnd / 2).max(4 * config::USERDATA_MAX_LENGTH);
                self.cwnd = self.ssthresh;
                self.partial_bytes_acked = 0;
                self.fast_recovery_exit = highest_seen_tsn;
                self.fast_recovery_transmit = true;
                restart_t3 = true;
            }
        } else if let Some(exit) = self.fast_recovery_exit {
            if Tsn::new(sack.cumulative_tsn_ack).gte(Tsn::new(exit)) {
                self.fast_recovery_exit = None;
            }
        }

        if self.outbound_queue.is_empty() {
            self.cancel_t3();
        } else if restart_t3 {
            self.cancel_t3();
            self.start_t3(now_ms);
        }

        self.transmit(now_ms);
        self.try_finish_shutdown(now_ms);
    }

    fn handle_reconfig(&mut self, raw: &RawChunk) {
        let Ok(params) = parse_reconfig_params(&raw.value) else { return };
        for param in params {
            match param {
                ReconfigParam::OutgoingReset(req) => {
                    for &stream_id in &req.stream_ids {
                        self.inbound_streams.remove(&stream_id);
                        self.events.push_back(AssociationEvent::StreamReset { stream_id });
                    }
                    self.reconfig_response_seq = req.request_seq;
                    let resp = ReconfigResponse { response_seq: req.request_seq, result: reconfig_result::SUCCESS_PERFORMED };
                    let mut buf = BytesMut::new();
                    resp.marshal(&mut buf);
                    self.send_chunk_raw(reconfig_chunk(buf));
                }
                ReconfigParam::Response(resp) => {
                    if let Some((seq, streams)) = self.reconfig_request.clone() {
                        if resp.response_seq == seq {
                            for stream_id in streams {
                                self.outbound_stream_seq.remove(&stream_id);
                                self.events.push_back(AssociationEvent::StreamReset { stream_id });
                            }
                            self.reconfig_request = None;
                            self.transmit_reconfig();
                        }
                    }
                }
                ReconfigParam::Unknown { .. } => {}
            }
        }
    }

    fn transmit_reconfig(&mut self) {
        if self.reconfig_request.is_some() || self.reconfig_queue.is_empty() {
            return;
        }
        let take = self.reconfig_queue.len().min(config::RECONFIG_MAX_STREAMS);
        let streams: Vec<u16> = self.reconfig_queue.drain(0..take).collect();
        let request_seq = self.reconfig_request_seq;
        self.reconfig_request_seq = self.reconfig_request_seq.wrapping_add(1);
        let req = OutgoingResetRequest {
            request_seq,
            response_seq: self.reconfig_response_seq,
            sender_last_tsn: Tsn::new(self.local_tsn).minus_one().value(),
            stream_ids: streams.clone(),
        };
        let mut buf = BytesMut::new();
        req.marshal(&mut buf);
        self.send_chunk_raw(reconfig_chunk(buf));
        self.reconfig_request = Some((request_seq, streams));
    }

    fn transmit(&mut self, now_ms: u64) {
        for pos in 0..self.outbound_queue_pos {
            let raw = {
                let cwnd = self.cwnd;
                let flight_size = self.flight_size;
                let fast_recovery_transmit = self.fast_recovery_transmit;
                let chunk = &mut self.outbound_queue[pos];
                if !chunk.retransmit {
                    None
                } else if !fast_recovery_transmit && flight_size + chunk.book_size > cwnd {
                    return;
                } else {
                    if fast_recovery_transmit {
                        self.fast_recovery_transmit = false;
                    }
                    self.flight_size += chunk.book_size;
                    chunk.retransmit = false;
                    chunk.sent_count += 1;
                    Some(build_data_raw(chunk))
                }
            };
            if let Some(raw) = raw {
                self.send_chunk_raw(raw);
            }
        }

        let mut burst = 0;
        while self.outbound_queue_pos < self.outbound_queue.len() && burst < config::MAX_BURST {
            let pos = self.outbound_queue_pos;
            let raw = {
                let cwnd = self.cwnd;
                let flight_size = self.flight_size;
                let chunk = &mut self.outbound_queue[pos];
                if flight_size + chunk.book_size > cwnd {
                    None
                } else {
                    self.flight_size += chunk.book_size;
                    chunk.sent_count += 1;
                    chunk.sent_time_ms = Some(now_ms);
                    Some(build_data_raw(chunk))
                }
            };
            let Some(raw) = raw else { break };
            self.send_chunk_raw(raw);
            if self.t3_deadline_ms.is_none() {
                self.start_t3(now_ms);
            }
            self.outbound_queue_pos += 1;
            burst += 1;
        }
    }

    fn try_finish_shutdown(&mut self, now_ms: u64) {
        if self.state == AssociationState::ShutdownPending && self.outbound_queue.is_empty() {
            let chunk = ShutdownChunk { cumulative_tsn_ack: self.last_received_tsn }.into_raw();
            self.send_chunk_raw(chunk.clone());
            self.start_t2(chunk, now_ms);
            self.state = AssociationState::ShutdownSent;
        }
    }

    fn send_sack(&mut self) {
        let mut gaps: Vec<GapAckBlock> = Vec::new();
        let mut gap_next: Option<u32> = None;
        for &tsn in &self.sack_misordered {
            let pos = tsn.wrapping_sub(self.last_received_tsn) as u16;
            if Some(tsn) == gap_next {
                if let Some(last) = gaps.last_mut() {
                    last.end = pos;
                }
            } else {
                gaps.push(GapAckBlock { start: pos, end: pos });
            }
            gap_next = Some(tsn.wrapping_add(1));
        }

        let sack = SackChunk {
            cumulative_tsn_ack: self.last_received_tsn,
            advertised_rwnd: self.advertised_rwnd,
            gap_ack_blocks: gaps,
            duplicate_tsns: self.sack_duplicates.clone(),
        };
        self.send_chunk_raw(sack.into_raw());
        self.sack_duplicates.clear();
        self.sack_needed = false;
    }

    fn update_rto(&mut self, sample_ms: u64) {
        let sample = sample_ms as f64;
        match (self.srtt, self.rttvar) {
            (Some(s), Some(v)) => {
                self.rttvar = Some((1.0 - config::RTO_BETA) * v + config::RTO_BETA * (s - sample).abs());
                self.srtt = Some((1.0 - config::RTO_ALPHA) * s + config::RTO_ALPHA * sample);
            }
            _ => {
                self.rttvar = Some(sample / 2.0);
                self.srtt = Some(sample);
            }
        }
        let rto = self.srtt.unwrap() + 4.0 * self.rttvar.unwrap();
        self.rto_ms = (rto as u64).clamp(config::RTO_MIN_MS, config::RTO_MAX_MS);
    }

    fn generate_cookie(&self, now_ms: u64) -> Bytes {
        let ts_bytes = ((now_ms / 1000) as u32).to_be_bytes();
        let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.hmac_key).expect("16-byte hmac key");
        mac.update(&ts_bytes);
        let digest = mac.finalize().into_bytes();
        let mut cookie = Vec::with_capacity(4 + digest.len());
        cookie.extend_from_slice(&ts_bytes);
        cookie.extend_from_slice(&digest);
        Bytes::from(cookie)
    }

    fn transition_established(&mut self) {
        self.state = AssociationState::Established;
        self.events.push_back(AssociationEvent::Established);
    }

    fn transition_closed(&mut self) {
        if self.state == AssociationState::Closed {
            return;
        }
        self.t1 = None;
        self.t2 = None;
        self.t3_deadline_ms = None;
        self.state = AssociationState::Closed;
        self.events.push_back(AssociationEvent::Closed);
    }

    fn send_chunk_raw(&mut self, raw: RawChunk) {
        let header = CommonHeader {
            source_port: self.config.local_port,
            destination_port: self.config.remote_port,
            verification_tag: self.remote_verification_tag,
        };
        self.outbox.push_back(marshal_packet(&header, &[raw]));
    }

    fn start_t1(&mut self, raw: RawChunk, now_ms: u64) {
        self.t1 = Some(RetransmitTimer { raw, failures: 0, deadline_ms: now_ms + self.rto_ms });
    }

    fn cancel_t1(&mut self) {
        self.t1 = None;
    }

    fn t1_expired(&mut self, now_ms: u64) {
        let Some(timer) = self.t1.as_mut() else { return };
        timer.failures += 1;
        if timer.failures > self.config.max_init_retransmits {
            self.t1 = None;
            self.transition_closed();
            return;
        }
        let raw = timer.raw.clone();
        timer.deadline_ms = now_ms + self.rto_ms;
        self.send_chunk_raw(raw);
    }

    fn start_t2(&mut self, raw: RawChunk, now_ms: u64) {
        self.t2 = Some(RetransmitTimer { raw, failures: 0, deadline_ms: now_ms + self.rto_ms });
    }

    fn cancel_t2(&mut self) {
        self.t2 = None;
    }

    fn t2_expired(&mut self, now_ms: u64) {
        let Some(timer) = self.t2.as_mut() else { return };
        timer.failures += 1;
        if timer.failures > self.config.max_assoc_retransmits {
            self.t2 = None;
            self.transition_closed();
            return;
        }
        let raw = timer.raw.clone();
        timer.deadline_ms = now_ms + self.rto_ms;
        self.send_chunk_raw(raw);
    }

    fn start_t3(&mut self, now_ms: u64) {
        self.t3_deadline_ms = Some(now_ms + self.rto_ms);
    }

    fn cancel_t3(&mut self) {
        self.t3_deadline_ms = None;
    }

    fn t3_expired(&mut self, now_ms: u64) {
        self.t3_deadline_ms = None;
        self.flight_size = 0;
        self.outbound_queue_pos = 0;
        self.partial_bytes_acked = 0;
        self.ssthresh = (self.cwnd / 2).max(4 * config::USERDATA_MAX_LENGTH);
        self.cwnd = config::USERDATA_MAX_LENGTH;
        self.transmit(now_ms);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn configs() -> (TransportConfig, TransportConfig) {
        let client = TransportConfig { is_client: true, ..TransportConfig::default() };
        let server = TransportConfig { is_client: false, ..TransportConfig::default() };
        (client, server)
    }

    fn pump(from: &mut Association, to: &mut Association, now_ms: u64) {
        while let Some(pkt) = from.poll_transmit() {
            to.handle_receive(now_ms, &pkt).unwrap();
        }
    }

    fn handshake(client: &mut Association, server: &mut Association) {
        let mut now = 0u64;
        client.initiate(now).unwrap();
        for _ in 0..4 {
            pump(client, server, now);
            pump(server, client, now);
            now += 10;
            if client.state() == AssociationState::Established && server.state() == AssociationState::Established {
                break;
            }
        }
        assert_eq!(client.state(), AssociationState::Established);
        assert_eq!(server.state(), AssociationState::Established);
    }

    #[test]
    fn handshake_reaches_established_both_sides() {
        let (c, s) = configs();
        let mut client = Association::new(c);
        let mut server = Association::new(s);
        handshake(&mut client, &mut server);
    }

    #[test]
    fn fragmented_message_reassembles_in_order() {
        let (c, s) = configs();
        let mut client = Association::new(c);
        let mut server = Association::new(s);
        handshake(&mut client, &mut server);

        let payload = vec![7u8; 3000];
        client.send(1, 53, true, &payload, 100).unwrap();
        pump(&mut client, &mut server, 100);
        pump(&mut server, &mut client, 100);

        let mut received = None;
        while let Some(ev) = server.poll_event() {
            if let AssociationEvent::Message { data, stream_id, ppid } = ev {
                assert_eq!(stream_id, 1);
                assert_eq!(ppid, 53);
                received = Some(data);
            }
        }
        assert_eq!(received.expect("message delivered").to_vec(), payload);
    }

    #[test]
    fn stale_cookie_is_rejected_with_error() {
        let (c, s) = configs();
        let mut client = Association::new(c);
        let mut server = Association::new(s);

        client.initiate(0).unwrap();
        pump(&mut client, &mut server, 0); // INIT -> server
        pump(&mut server, &mut client, 0); // INIT-ACK -> client, client sends COOKIE-ECHO

        let stale_now = config::COOKIE_LIFETIME_MS + 61_000;
        pump(&mut client, &mut server, stale_now);

        assert_ne!(server.state(), AssociationState::Established);
    }

    #[test]
    fn outgoing_stream_reset_notifies_peer() {
        let (c, s) = configs();
        let mut client = Association::new(c);
        let mut server = Association::new(s);
        handshake(&mut client, &mut server);

        client.send(2, 53, true, b"hi", 50).unwrap();
        pump(&mut client, &mut server, 50);
        pump(&mut server, &mut client, 50);
        server.events.clear();

        client.reset_stream(2).unwrap();
        pump(&mut client, &mut server, 60);
        pump(&mut server, &mut client, 60);

        let mut server_saw_reset = false;
        while let Some(ev) = server.poll_event() {
            if let AssociationEvent::StreamReset { stream_id } = ev {
                assert_eq!(stream_id, 2);
                server_saw_reset = true;
            }
        }
        assert!(server_saw_reset);

        let mut client_saw_reset = false;
        while let Some(ev) = client.poll_event() {
            if let AssociationEvent::StreamReset { stream_id } = ev {
                assert_eq!(stream_id, 2);
                client_saw_reset = true;
            }
        }
        assert!(client_saw_reset);
    }
}
