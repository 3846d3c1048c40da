//! AES-128-CM keystream generation and HMAC-SHA1-80 authentication, per
//! RFC 3711 §§4.1.1, 4.2.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type Aes128Ctr = Ctr128BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// Builds the 16-byte counter-mode IV for an RTP packet: the session salt
/// shifted in, XORed with the SSRC at bytes [4..8] and the 48-bit rollover
/// counter||sequence at bytes [8..14].
pub fn rtp_iv(salt: &[u8], ssrc: u32, roc: u32, seq: u16) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..14].copy_from_slice(&salt[..14]);
    for (i, b) in ssrc.to_be_bytes().iter().enumerate() {
        iv[4 + i] ^= b;
    }
    let index: u64 = ((roc as u64) << 16) | seq as u64;
    let index_bytes = index.to_be_bytes(); // 8 bytes, top 2 are zero
    for i in 0..6 {
        iv[8 + i] ^= index_bytes[2 + i];
    }
    iv
}

/// Same shape as `rtp_iv` but keyed by the 31-bit SRTCP packet index
/// (RFC 3711 §4.1.1, "for SRTCP... i is the 31-bit SRTCP index").
pub fn rtcp_iv(salt: &[u8], ssrc: u32, srtcp_index: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..14].copy_from_slice(&salt[..14]);
    for (i, b) in ssrc.to_be_bytes().iter().enumerate() {
        iv[4 + i] ^= b;
    }
    let index = (srtcp_index & 0x7FFF_FFFF) as u64;
    let index_bytes = index.to_be_bytes();
    for i in 0..6 {
        iv[8 + i] ^= index_bytes[2 + i];
    }
    iv
}

/// Applies the AES-128-CTR keystream in place (protect == unprotect: CTR
/// mode is its own inverse).
pub fn apply_keystream(key: &[u8], iv: [u8; 16], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(data);
}

/// HMAC-SHA1 over `data`, truncated to the negotiated 80-bit tag.
pub fn auth_tag(auth_key: &[u8], data: &[u8]) -> [u8; 10] {
    let mut mac = HmacSha1::new_from_slice(auth_key).expect("HMAC accepts any key length");
    mac.update(data);
    let full = mac.finalize().into_bytes();
    let mut tag = [0u8; 10];
    tag.copy_from_slice(&full[..10]);
    tag
}
