//! Named RTP header extensions (RFC 5285) and the URI-to-id map negotiation
//! supplies for a given m-line.

use std::collections::HashMap;

/// URIs of the header extensions the core understands. Unknown extensions
/// still round-trip through `RawExtensions` but are not interpreted.
pub mod uri {
    pub const ABS_SEND_TIME: &str = "http://www.webrtc.org/experiments/rtc-hdrext/abs-send-time";
    pub const AUDIO_LEVEL: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
    pub const MID: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
    pub const REPAIRED_RTP_STREAM_ID: &str = "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id";
    pub const RTP_STREAM_ID: &str = "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id";
    pub const TRANSMISSION_OFFSET: &str = "urn:ietf:params:rtp-hdrext:toffset";
    pub const TRANSPORT_SEQUENCE_NUMBER: &str =
        "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
}

/// Negotiated mapping from extension URI to the one-byte/two-byte local id
/// used on the wire, supplied by the out-of-scope SDP layer.
#[derive(Debug, Default, Clone)]
pub struct ExtensionMap {
    uri_to_id: HashMap<String, u8>,
    id_to_uri: HashMap<u8, String>,
}

impl ExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: u8, uri: impl Into<String>) {
        let uri = uri.into();
        self.uri_to_id.insert(uri.clone(), id);
        self.id_to_uri.insert(id, uri);
    }

    pub fn id_for(&self, uri: &str) -> Option<u8> {
        self.uri_to_id.get(uri).copied()
    }

    pub fn uri_for(&self, id: u8) -> Option<&str> {
        self.id_to_uri.get(&id).map(|s| s.as_str())
    }
}

/// `abs_send_time`: `(ntp_time_64 >> 14) & 0xFFFFFF`, a 24-bit fixed-point
/// value with 6 fractional bits.
pub fn abs_send_time_from_ntp(ntp: u64) -> u32 {
    ((ntp >> 14) & 0x00FF_FFFF) as u32
}
