pub mod extension;
pub mod header;
pub mod packet;

pub use extension::ExtensionMap;
pub use header::{RawExtension, RtpHeader};
pub use packet::RtpPacket;
