//! Sans-io DTLS 1.2 transport for rtc-core.
//!
//! [`DtlsTransport`] owns nothing but bytes in, bytes out: feed datagrams
//! via [`DtlsTransport::handle_receive`], drain outgoing records via
//! [`DtlsTransport::poll_transmit`], and drive retransmission via
//! [`DtlsTransport::poll_timeout`] / [`DtlsTransport::handle_timeout`]. No
//! socket, thread, or async runtime lives in this crate.

pub mod cert;
pub mod cipher;
pub mod handshake;
pub mod prf;
pub mod record;
pub mod transport;

pub use cert::Certificate;
pub use transport::{DtlsRole, DtlsState, DtlsTransport, TransportConfig};
