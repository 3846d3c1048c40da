//! Jitter buffer, payload packetizers (VP8/VP9/H.264) and the arrival-time
//! bandwidth estimator: the media-plane pieces that sit between an RTP
//! sender/receiver and the codec itself.

pub mod bandwidth;
pub mod codecs;
pub mod jitter;

pub use jitter::{JitterBuffer, JitterFrame};
