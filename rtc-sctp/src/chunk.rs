//! Typed chunk bodies layered on top of [`crate::packet::RawChunk`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rtc_shared::error::{Error, Result};

use crate::packet::{chunk_type, data_flags, RawChunk};

fn get_u16(buf: &mut &[u8], field: &'static str) -> Result<u16> {
    if buf.len() < 2 {
        return Err(Error::short(field));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8], field: &'static str) -> Result<u32> {
    if buf.len() < 4 {
        return Err(Error::short(field));
    }
    Ok(buf.get_u32())
}

/// DATA chunk body (RFC 4960 §3.3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub tsn: u32,
    pub stream_id: u16,
    pub stream_seq: u16,
    pub ppid: u32,
    pub unordered: bool,
    pub begin: bool,
    pub end: bool,
    pub user_data: Bytes,
}

impl DataChunk {
    pub fn into_raw(self) -> RawChunk {
        let mut flags = 0u8;
        if self.unordered {
            flags |= data_flags::UNORDERED;
        }
        if self.begin {
            flags |= data_flags::BEGIN;
        }
        if self.end {
            flags |= data_flags::END;
        }
        let mut value = BytesMut::with_capacity(12 + self.user_data.len());
        value.put_u32(self.tsn);
        value.put_u16(self.stream_id);
        value.put_u16(self.stream_seq);
        value.put_u32(self.ppid);
        value.put_slice(&self.user_data);
        RawChunk { chunk_type: chunk_type::DATA, flags, value: value.freeze() }
    }

    pub fn from_raw(raw: &RawChunk) -> Result<Self> {
        let mut r = &raw.value[..];
        let tsn = get_u32(&mut r, "sctp_data_tsn")?;
        let stream_id = get_u16(&mut r, "sctp_data_stream_id")?;
        let stream_seq = get_u16(&mut r, "sctp_data_stream_seq")?;
        let ppid = get_u32(&mut r, "sctp_data_ppid")?;
        let user_data = Bytes::copy_from_slice(r);
        Ok(DataChunk {
            tsn,
            stream_id,
            stream_seq,
            ppid,
            unordered: raw.flags & data_flags::UNORDERED != 0,
            begin: raw.flags & data_flags::BEGIN != 0,
            end: raw.flags & data_flags::END != 0,
            user_data,
        })
    }
}

/// Subset of INIT/INIT-ACK optional parameters this core understands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitOptionalParams {
    pub state_cookie: Option<Bytes>,
    pub supported_ext_chunks: Vec<u8>,
}

mod init_param_type {
    pub const STATE_COOKIE: u16 = 7;
    pub const SUPPORTED_EXT: u16 = 0x8008;
}

fn marshal_params(out: &mut BytesMut, params: &InitOptionalParams) {
    if let Some(cookie) = &params.state_cookie {
        put_param(out, init_param_type::STATE_COOKIE, cookie);
    }
    if !params.supported_ext_chunks.is_empty() {
        put_param(out, init_param_type::SUPPORTED_EXT, &params.supported_ext_chunks);
    }
}

fn put_param(out: &mut BytesMut, param_type: u16, value: &[u8]) {
    let len = 4 + value.len();
    out.put_u16(param_type);
    out.put_u16(len as u16);
    out.put_slice(value);
    let padding = (4 - (len % 4)) % 4;
    out.put_bytes(0, padding);
}

fn parse_params(mut buf: &[u8]) -> Result<InitOptionalParams> {
    let mut params = InitOptionalParams::default();
    while buf.len() >= 4 {
        let param_type = u16::from_be_bytes([buf[0], buf[1]]);
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if len < 4 || buf.len() < len {
            return Err(Error::short("sctp_init_param"));
        }
        let value = &buf[4..len];
        match param_type {
            init_param_type::STATE_COOKIE => params.state_cookie = Some(Bytes::copy_from_slice(value)),
            init_param_type::SUPPORTED_EXT => params.supported_ext_chunks = value.to_vec(),
            _ => {}
        }
        let padded = len + ((4 - (len % 4)) % 4);
        buf = &buf[padded.min(buf.len())..];
    }
    Ok(params)
}

/// Shared shape of INIT and INIT-ACK (RFC 4960 §3.3.2/§3.3.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitChunk {
    pub initiate_tag: u32,
    pub advertised_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_tsn: u32,
    pub params: InitOptionalParams,
}

impl InitChunk {
    pub fn into_raw(self, is_ack: bool) -> RawChunk {
        let mut value = BytesMut::new();
        value.put_u32(self.initiate_tag);
        value.put_u32(self.advertised_rwnd);
        value.put_u16(self.outbound_streams);
        value.put_u16(self.inbound_streams);
        value.put_u32(self.initial_tsn);
        marshal_params(&mut value, &self.params);
        let chunk_type = if is_ack { chunk_type::INIT_ACK } else { chunk_type::INIT };
        RawChunk { chunk_type, flags: 0, value: value.freeze() }
    }

    pub fn from_raw(raw: &RawChunk) -> Result<Self> {
        let mut r = &raw.value[..];
        let initiate_tag = get_u32(&mut r, "sctp_init_tag")?;
        let advertised_rwnd = get_u32(&mut r, "sctp_init_rwnd")?;
        let outbound_streams = get_u16(&mut r, "sctp_init_os")?;
        let inbound_streams = get_u16(&mut r, "sctp_init_is")?;
        let initial_tsn = get_u32(&mut r, "sctp_init_tsn")?;
        let params = parse_params(r)?;
        Ok(InitChunk {
            initiate_tag,
            advertised_rwnd,
            outbound_streams,
            inbound_streams,
            initial_tsn,
            params,
        })
    }
}

/// One gap-ack-block entry in a SACK (RFC 4960 §3.3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapAckBlock {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackChunk {
    pub cumulative_tsn_ack: u32,
    pub advertised_rwnd: u32,
    pub gap_ack_blocks: Vec<GapAckBlock>,
    pub duplicate_tsns: Vec<u32>,
}

impl SackChunk {
    pub fn into_raw(self) -> RawChunk {
        let mut value = BytesMut::new();
        value.put_u32(self.cumulative_tsn_ack);
        value.put_u32(self.advertised_rwnd);
        value.put_u16(self.gap_ack_blocks.len() as u16);
        value.put_u16(self.duplicate_tsns.len() as u16);
        for block in &self.gap_ack_blocks {
            value.put_u16(block.start);
            value.put_u16(block.end);
        }
        for tsn in &self.duplicate_tsns {
            value.put_u32(*tsn);
        }
        RawChunk { chunk_type: chunk_type::SACK, flags: 0, value: value.freeze() }
    }

    pub fn from_raw(raw: &RawChunk) -> Result<Self> {
        let mut r = &raw.value[..];
        let cumulative_tsn_ack = get_u32(&mut r, "sctp_sack_cum_tsn")?;
        let advertised_rwnd = get_u32(&mut r, "sctp_sack_rwnd")?;
        let num_gaps = get_u16(&mut r, "sctp_sack_num_gaps")? as usize;
        let num_dups = get_u16(&mut r, "sctp_sack_num_dups")? as usize;
        let mut gap_ack_blocks = Vec::with_capacity(num_gaps);
        for _ in 0..num_gaps {
            let start = get_u16(&mut r, "sctp_sack_gap_start")?;
            let end = get_u16(&mut r, "sctp_sack_gap_end")?;
            gap_ack_blocks.push(GapAckBlock { start, end });
        }
        let mut duplicate_tsns = Vec::with_capacity(num_dups);
        for _ in 0..num_dups {
            duplicate_tsns.push(get_u32(&mut r, "sctp_sack_dup_tsn")?);
        }
        Ok(SackChunk { cumulative_tsn_ack, advertised_rwnd, gap_ack_blocks, duplicate_tsns })
    }
}

/// ERROR/ABORT cause (RFC 4960 §3.3.10). Only the fields this core emits or
/// inspects are represented; unrecognized causes round-trip as opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCause {
    pub code: u16,
    pub info: Bytes,
}

impl ErrorCause {
    pub fn marshal(&self, out: &mut BytesMut) {
        let len = 4 + self.info.len();
        out.put_u16(self.code);
        out.put_u16(len as u16);
        out.put_slice(&self.info);
        let padding = (4 - (len % 4)) % 4;
        out.put_bytes(0, padding);
    }
}

pub fn abort_chunk(causes: &[ErrorCause], reflected: bool) -> RawChunk {
    let mut value = BytesMut::new();
    for cause in causes {
        cause.marshal(&mut value);
    }
    let flags = if reflected { 0x01 } else { 0x00 };
    RawChunk { chunk_type: chunk_type::ABORT, flags, value: value.freeze() }
}

/// RECONFIG re-configuration parameters this core supports (RFC 6525 §4):
/// outgoing/incoming stream reset request and a reconfiguration response.
pub mod reconfig_param_type {
    pub const OUTGOING_RESET: u16 = 13;
    pub const INCOMING_RESET: u16 = 14;
    pub const RECONFIG_RESPONSE: u16 = 16;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingResetRequest {
    pub request_seq: u32,
    pub response_seq: u32,
    pub sender_last_tsn: u32,
    pub stream_ids: Vec<u16>,
}

impl OutgoingResetRequest {
    pub fn marshal(&self, out: &mut BytesMut) {
        let len = 4 + 12 + self.stream_ids.len() * 2;
        out.put_u16(reconfig_param_type::OUTGOING_RESET);
        out.put_u16(len as u16);
        out.put_u32(self.request_seq);
        out.put_u32(self.response_seq);
        out.put_u32(self.sender_last_tsn);
        for id in &self.stream_ids {
            out.put_u16(*id);
        }
        let padding = (4 - (len % 4)) % 4;
        out.put_bytes(0, padding);
    }

    pub fn parse(value: &[u8]) -> Result<Self> {
        let mut r = value;
        let request_seq = get_u32(&mut r, "sctp_reconfig_req_seq")?;
        let response_seq = get_u32(&mut r, "sctp_reconfig_resp_seq")?;
        let sender_last_tsn = get_u32(&mut r, "sctp_reconfig_last_tsn")?;
        let mut stream_ids = Vec::new();
        while r.len() >= 2 {
            stream_ids.push(get_u16(&mut r, "sctp_reconfig_stream_id")?);
        }
        Ok(OutgoingResetRequest { request_seq, response_seq, sender_last_tsn, stream_ids })
    }
}

pub mod reconfig_result {
    pub const SUCCESS_NOTHING_TO_DO: u32 = 0;
    pub const SUCCESS_PERFORMED: u32 = 1;
    pub const DENIED: u32 = 2;
    pub const ERROR_BAD_SEQNO: u32 = 3;
    pub const IN_PROGRESS: u32 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconfigResponse {
    pub response_seq: u32,
    pub result: u32,
}

impl ReconfigResponse {
    pub fn marshal(&self, out: &mut BytesMut) {
        out.put_u16(reconfig_param_type::RECONFIG_RESPONSE);
        out.put_u16(12);
        out.put_u32(self.response_seq);
        out.put_u32(self.result);
    }

    pub fn parse(value: &[u8]) -> Result<Self> {
        let mut r = value;
        let response_seq = get_u32(&mut r, "sctp_reconfig_resp_seq")?;
        let result = get_u32(&mut r, "sctp_reconfig_result")?;
        Ok(ReconfigResponse { response_seq, result })
    }
}

/// Parsed view of a RECONFIG chunk's parameter(s). This core only ever
/// emits a single parameter per RECONFIG chunk, but parses leniently.
pub enum ReconfigParam {
    OutgoingReset(OutgoingResetRequest),
    Response(ReconfigResponse),
    Unknown { param_type: u16 },
}

pub fn parse_reconfig_params(mut buf: &[u8]) -> Result<Vec<ReconfigParam>> {
    let mut out = Vec::new();
    while buf.len() >= 4 {
        let param_type = u16::from_be_bytes([buf[0], buf[1]]);
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if len < 4 || buf.len() < len {
            return Err(Error::short("sctp_reconfig_param"));
        }
        let value = &buf[4..len];
        let parsed = match param_type {
            reconfig_param_type::OUTGOING_RESET => ReconfigParam::OutgoingReset(OutgoingResetRequest::parse(value)?),
            reconfig_param_type::RECONFIG_RESPONSE => ReconfigParam::Response(ReconfigResponse::parse(value)?),
            _ => ReconfigParam::Unknown { param_type },
        };
        out.push(parsed);
        let padded = len + ((4 - (len % 4)) % 4);
        buf = &buf[padded.min(buf.len())..];
    }
    Ok(out)
}

pub fn reconfig_chunk(param_bytes: BytesMut) -> RawChunk {
    RawChunk { chunk_type: chunk_type::RECONFIG, flags: 0, value: param_bytes.freeze() }
}

/// HEARTBEAT/HEARTBEAT-ACK carry a single opaque "Heartbeat Info" parameter
/// (RFC 4960 §3.3.5/§3.3.6) that the receiver echoes back byte-for-byte.
mod heartbeat_param_type {
    pub const HEARTBEAT_INFO: u16 = 1;
}

pub fn heartbeat_chunk(info: Bytes, is_ack: bool) -> RawChunk {
    let mut value = BytesMut::new();
    put_param(&mut value, heartbeat_param_type::HEARTBEAT_INFO, &info);
    let chunk_type = if is_ack { chunk_type::HEARTBEAT_ACK } else { chunk_type::HEARTBEAT };
    RawChunk { chunk_type, flags: 0, value: value.freeze() }
}

pub fn heartbeat_info(raw: &RawChunk) -> Result<Bytes> {
    let mut r = &raw.value[..];
    if r.len() < 4 {
        return Err(Error::short("sctp_heartbeat_info"));
    }
    let param_type = u16::from_be_bytes([r[0], r[1]]);
    let len = u16::from_be_bytes([r[2], r[3]]) as usize;
    if param_type != heartbeat_param_type::HEARTBEAT_INFO || len < 4 || r.len() < len {
        return Err(Error::short("sctp_heartbeat_info"));
    }
    Ok(Bytes::copy_from_slice(&r[4..len]))
}

/// SHUTDOWN carries the cumulative TSN ack point (RFC 4960 §3.3.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownChunk {
    pub cumulative_tsn_ack: u32,
}

impl ShutdownChunk {
    pub fn into_raw(self) -> RawChunk {
        let mut value = BytesMut::with_capacity(4);
        value.put_u32(self.cumulative_tsn_ack);
        RawChunk { chunk_type: chunk_type::SHUTDOWN, flags: 0, value: value.freeze() }
    }

    pub fn from_raw(raw: &RawChunk) -> Result<Self> {
        let mut r = &raw.value[..];
        Ok(ShutdownChunk { cumulative_tsn_ack: get_u32(&mut r, "sctp_shutdown_cum_tsn")? })
    }
}

pub fn shutdown_ack_chunk() -> RawChunk {
    RawChunk { chunk_type: chunk_type::SHUTDOWN_ACK, flags: 0, value: Bytes::new() }
}

pub fn shutdown_complete_chunk(reflected: bool) -> RawChunk {
    RawChunk {
        chunk_type: chunk_type::SHUTDOWN_COMPLETE,
        flags: if reflected { 0x01 } else { 0x00 },
        value: Bytes::new(),
    }
}

pub fn cookie_echo_chunk(cookie: Bytes) -> RawChunk {
    RawChunk { chunk_type: chunk_type::COOKIE_ECHO, flags: 0, value: cookie }
}

pub fn cookie_ack_chunk() -> RawChunk {
    RawChunk { chunk_type: chunk_type::COOKIE_ACK, flags: 0, value: Bytes::new() }
}

pub fn error_chunk(causes: &[ErrorCause]) -> RawChunk {
    let mut value = BytesMut::new();
    for cause in causes {
        cause.marshal(&mut value);
    }
    RawChunk { chunk_type: chunk_type::ERROR, flags: 0, value: value.freeze() }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn data_chunk_round_trip() {
        let chunk = DataChunk {
            tsn: 7,
            stream_id: 3,
            stream_seq: 1,
            ppid: 53,
            unordered: false,
            begin: true,
            end: true,
            user_data: Bytes::from_static(b"hello"),
        };
        let raw = chunk.clone().into_raw();
        let parsed = DataChunk::from_raw(&raw).unwrap();
        assert_eq!(chunk, parsed);
    }

    #[test]
    fn init_chunk_round_trip_with_cookie() {
        let chunk = InitChunk {
            initiate_tag: 123,
            advertised_rwnd: 131072,
            outbound_streams: 65535,
            inbound_streams: 65535,
            initial_tsn: 9999,
            params: InitOptionalParams { state_cookie: Some(Bytes::from_static(b"cookie-bytes")), supported_ext_chunks: vec![chunk_type::RECONFIG] },
        };
        let raw = chunk.clone().into_raw(true);
        assert_eq!(raw.chunk_type, chunk_type::INIT_ACK);
        let parsed = InitChunk::from_raw(&raw).unwrap();
        assert_eq!(chunk, parsed);
    }

    #[test]
    fn sack_chunk_round_trip() {
        let chunk = SackChunk {
            cumulative_tsn_ack: 10,
            advertised_rwnd: 131072,
            gap_ack_blocks: vec![GapAckBlock { start: 2, end: 2 }],
            duplicate_tsns: vec![11],
        };
        let raw = chunk.clone().into_raw();
        let parsed = SackChunk::from_raw(&raw).unwrap();
        assert_eq!(chunk, parsed);
    }

    #[test]
    fn outgoing_reset_request_round_trip() {
        let req = OutgoingResetRequest { request_seq: 1, response_seq: 0, sender_last_tsn: 42, stream_ids: vec![0, 2, 4] };
        let mut buf = BytesMut::new();
        req.marshal(&mut buf);
        let parsed = parse_reconfig_params(&buf).unwrap();
        assert_eq!(parsed.len(), 1);
        match &parsed[0] {
            ReconfigParam::OutgoingReset(parsed_req) => assert_eq!(parsed_req, &req),
            _ => panic!("wrong variant"),
        }
    }
}
