/// SRTP protection profile. The core only negotiates
/// `SRTP_AES128_CM_SHA1_80` per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionProfile {
    pub key_len: usize,
    pub salt_len: usize,
    pub auth_tag_len: usize,
    pub auth_key_len: usize,
}

pub const AES128_CM_SHA1_80: ProtectionProfile = ProtectionProfile {
    key_len: 16,
    salt_len: 14,
    auth_tag_len: 10,
    auth_key_len: 20,
};
