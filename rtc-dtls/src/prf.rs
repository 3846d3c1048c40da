//! TLS 1.2 PRF (RFC 5246 §5) over HMAC-SHA256, and the two derivations this
//! core needs it for: the master secret and the RFC 5764 SRTP keying
//! material export.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// `P_hash(secret, seed)`, expanded to at least `out_len` bytes and
/// truncated to exactly `out_len`.
fn p_hash(secret: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len + 32);
    let mut a = {
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(seed);
        mac.finalize().into_bytes().to_vec()
    };
    while out.len() < out_len {
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(&a);
        mac.update(seed);
        out.extend_from_slice(&mac.finalize().into_bytes());

        let mut next_a = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        next_a.update(&a);
        a = next_a.finalize().into_bytes().to_vec();
    }
    out.truncate(out_len);
    out
}

fn prf(secret: &[u8], label: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut full_seed = Vec::with_capacity(label.len() + seed.len());
    full_seed.extend_from_slice(label);
    full_seed.extend_from_slice(seed);
    p_hash(secret, &full_seed, out_len)
}

/// `master_secret = PRF(pre_master_secret, "master secret", client_random ||
/// server_random)[0..48]`.
pub fn master_secret(pre_master_secret: &[u8], client_random: &[u8; 32], server_random: &[u8; 32]) -> [u8; 48] {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    let bytes = prf(pre_master_secret, b"master secret", &seed, 48);
    let mut out = [0u8; 48];
    out.copy_from_slice(&bytes);
    out
}

/// RFC 5764 §4.2's `EXTRACTOR-dtls_srtp` keying material, ordered
/// client-write then server-write: `client_key || server_key ||
/// client_salt || server_salt` (RFC 3711 §8.1's ordering for an exporter).
pub struct SrtpKeyingMaterial {
    pub client_key: [u8; 16],
    pub server_key: [u8; 16],
    pub client_salt: [u8; 14],
    pub server_salt: [u8; 14],
}

pub fn export_srtp_keying_material(
    master_secret: &[u8; 48],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> SrtpKeyingMaterial {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    // 2 * (16-byte key + 14-byte salt) = 60 bytes.
    let bytes = prf(master_secret, b"EXTRACTOR-dtls_srtp", &seed, 60);

    let mut client_key = [0u8; 16];
    let mut server_key = [0u8; 16];
    let mut client_salt = [0u8; 14];
    let mut server_salt = [0u8; 14];
    client_key.copy_from_slice(&bytes[0..16]);
    server_key.copy_from_slice(&bytes[16..32]);
    client_salt.copy_from_slice(&bytes[32..46]);
    server_salt.copy_from_slice(&bytes[46..60]);
    SrtpKeyingMaterial { client_key, server_key, client_salt, server_salt }
}

/// `verify_data = PRF(master_secret, label, Hash(handshake_messages))[0..12]`
/// (RFC 5246 §7.4.9). `label` is `"client finished"` or `"server finished"`.
pub fn verify_data(master_secret: &[u8; 48], label: &[u8], handshake_hash: &[u8]) -> [u8; 12] {
    let bytes = prf(master_secret, label, handshake_hash, 12);
    let mut out = [0u8; 12];
    out.copy_from_slice(&bytes);
    out
}

/// GCM cipher suites carry no MAC keys: `key_block = client_write_key ||
/// server_write_key || client_write_IV || server_write_IV` (RFC 5246 §6.3,
/// RFC 5288), with write keys 16 bytes and fixed IVs 4 bytes each. Note the
/// seed order is `server_random || client_random`, the reverse of the
/// master-secret derivation.
pub struct GcmKeyBlock {
    pub client_write_key: [u8; 16],
    pub server_write_key: [u8; 16],
    pub client_write_iv: [u8; 4],
    pub server_write_iv: [u8; 4],
}

pub fn gcm_key_block(master_secret: &[u8; 48], client_random: &[u8; 32], server_random: &[u8; 32]) -> GcmKeyBlock {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);
    let bytes = prf(master_secret, b"key expansion", &seed, 40);

    let mut client_write_key = [0u8; 16];
    let mut server_write_key = [0u8; 16];
    let mut client_write_iv = [0u8; 4];
    let mut server_write_iv = [0u8; 4];
    client_write_key.copy_from_slice(&bytes[0..16]);
    server_write_key.copy_from_slice(&bytes[16..32]);
    client_write_iv.copy_from_slice(&bytes[32..36]);
    server_write_iv.copy_from_slice(&bytes[36..40]);
    GcmKeyBlock { client_write_key, server_write_key, client_write_iv, server_write_iv }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn p_hash_is_deterministic() {
        let a = p_hash(b"secret", b"seed", 40);
        let b = p_hash(b"secret", b"seed", 40);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn master_secret_depends_on_randoms() {
        let pms = [0x42u8; 32];
        let cr = [1u8; 32];
        let sr = [2u8; 32];
        let sr2 = [3u8; 32];
        let m1 = master_secret(&pms, &cr, &sr);
        let m2 = master_secret(&pms, &cr, &sr2);
        assert_ne!(m1, m2);
        assert_eq!(m1.len(), 48);
    }

    #[test]
    fn exported_keying_material_splits_client_and_server() {
        let ms = [0x11u8; 48];
        let cr = [4u8; 32];
        let sr = [5u8; 32];
        let km = export_srtp_keying_material(&ms, &cr, &sr);
        assert_ne!(km.client_key, km.server_key);
        assert_ne!(km.client_salt, km.server_salt);
    }

    #[test]
    fn verify_data_is_12_bytes_and_label_dependent() {
        let ms = [0x22u8; 48];
        let hash = [0x33u8; 32];
        let client_vd = verify_data(&ms, b"client finished", &hash);
        let server_vd = verify_data(&ms, b"server finished", &hash);
        assert_ne!(client_vd, server_vd);
    }

    #[test]
    fn gcm_key_block_splits_four_ways() {
        let ms = [0x44u8; 48];
        let cr = [6u8; 32];
        let sr = [7u8; 32];
        let kb = gcm_key_block(&ms, &cr, &sr);
        assert_ne!(kb.client_write_key, kb.server_write_key);
        assert_ne!(kb.client_write_iv, kb.server_write_iv);
    }
}
