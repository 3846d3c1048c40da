//! RTP router, sender, receiver, and the DTLS-SRTP transport that ties the
//! wire types (`rtp`/`rtcp`), the media plane (`media`), and the secure
//! transport (`dtls`/`srtp`) together into sans-io transceiver state.
//! Nothing here owns a socket or a task -- the host drives each component
//! with `handle_*`/`poll_*` calls.

pub mod receiver;
pub mod router;
pub mod sender;
pub mod transport;

pub use receiver::{DecodedFrame, Depacketizer, RtpReceiver, RtpReceiverConfig, StreamStatistics};
pub use router::{ReceiverId, RtcpTarget, RtpRouter};
pub use sender::{EncodedFrame, Packetizer, RtpSender, RtpSenderConfig, RTP_HISTORY_SIZE};
pub use transport::{BandwidthEstimate, Demuxed, DtlsSrtpTransport, DtlsSrtpTransportConfig, TransportCounters};
