use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds shared across the RTP/RTCP/SRTP/DTLS/SCTP stack.
///
/// These map onto the error kinds of the propagation policy: parser errors
/// are dropped at the datagram edge and never reach the caller as an `Error`
/// unless explicitly surfaced (e.g. from a `marshal`/`unmarshal` call used by
/// a test or a higher layer that chooses to propagate it).
#[derive(Error, Debug, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A packet or chunk failed a length/field validity check while parsing.
    #[error("invalid framing: {field}")]
    InvalidFraming { field: &'static str },

    /// SRTP/SRTCP authentication, CRC32C, or DTLS fingerprint mismatch.
    #[error("integrity check failed: {0}")]
    IntegrityFailure(&'static str),

    /// Operation requires a live transport/association.
    #[error("not connected")]
    NotConnected,

    /// Operation is not legal in the current state machine step.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A handshake or retransmit budget was exhausted.
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// Peer sent a chunk/flag forbidden by the current protocol state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Unknown codec or unsupported negotiated parameter.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Peer signalled BYE, ABORT, or DTLS close_notify.
    #[error("peer closed the session")]
    PeerClosed,

    /// Generic short-buffer condition surfaced by a `Buf`-based unmarshal.
    #[error("unexpected end of buffer: expected at least {expected}, got {actual}")]
    UnexpectedEndOfBuffer { expected: usize, actual: usize },

    #[error("buffer too small to marshal: need {need}, have {have}")]
    WrongMarshalSize { need: usize, have: usize },
}

impl Error {
    pub fn short(field: &'static str) -> Error {
        Error::InvalidFraming { field }
    }
}
