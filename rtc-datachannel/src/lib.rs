//! DCEP (RFC 8832) and data channel lifecycle (RFC 8831) layered over a
//! plain `sctp::Association`.

pub mod data_channel;
pub mod dcep;

pub use data_channel::{
    ppid, DataChannel, DataChannelConfig, DataChannelEvent, DataChannels, ReadyState,
};
pub use dcep::ChannelType;
