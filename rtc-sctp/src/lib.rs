//! Sans-io SCTP association for WebRTC data channels (RFC 4960 + RFC 6525),
//! carried as opaque user data over a DTLS session (RFC 8261).
//!
//! This crate owns wire framing (`packet`, `chunk`), the tunables (`config`),
//! and the association state machine (`association`). It knows nothing
//! about DCEP or `DataChannel` objects — those live in `rtc-datachannel`,
//! layered on top of `Association::send`/`poll_event`.

pub mod association;
pub mod chunk;
pub mod config;
pub mod packet;

pub use association::{Association, AssociationEvent, AssociationState};
pub use config::TransportConfig;
