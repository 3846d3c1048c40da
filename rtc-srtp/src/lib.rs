//! SRTP/SRTCP protection (RFC 3711) for the DTLS-SRTP transport described
//! in §4.2: one `SrtpSession` per direction, keyed from the DTLS exporter.

pub mod cipher;
pub mod context;
pub mod key_derivation;
pub mod protection_profile;

pub use context::{SrtpKeys, SrtpSession};
pub use protection_profile::{ProtectionProfile, AES128_CM_SHA1_80};
