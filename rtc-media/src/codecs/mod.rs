//! Payload packetizers/depacketizers: each coded frame becomes one or more
//! RTP payloads of at most [`PACKET_MAX`] bytes, each carrying a
//! codec-specific descriptor prefix ahead of the media bytes.

pub mod h264;
pub mod vp8;
pub mod vp9;

/// Largest RTP payload this core will ever produce, leaving room under a
/// typical path MTU for the RTP header, SRTP auth tag and any extensions.
pub const PACKET_MAX: usize = 1300;
