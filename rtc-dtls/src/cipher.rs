//! AES-128-GCM record protection (RFC 5288, RFC 6347 §4.1.2.1's nonce
//! handling for DTLS). Each direction gets a 16-byte write key and a 4-byte
//! fixed IV from [`crate::prf::GcmKeyBlock`]; an 8-byte explicit nonce
//! travels in the clear at the front of the ciphertext record.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use bytes::{BufMut, Bytes, BytesMut};
use rtc_shared::error::{Error, Result};

pub const EXPLICIT_NONCE_LEN: usize = 8;
pub const TAG_LEN: usize = 16;

pub struct GcmRecordProtector {
    cipher: Aes128Gcm,
    fixed_iv: [u8; 4],
}

impl GcmRecordProtector {
    pub fn new(write_key: &[u8; 16], fixed_iv: [u8; 4]) -> Self {
        Self { cipher: Aes128Gcm::new(write_key.into()), fixed_iv }
    }

    fn nonce(&self, explicit_nonce: &[u8; 8]) -> Nonce {
        let mut n = [0u8; 12];
        n[..4].copy_from_slice(&self.fixed_iv);
        n[4..].copy_from_slice(explicit_nonce);
        *Nonce::from_slice(&n)
    }

    /// Encrypts `plaintext` under the 13-byte DTLS AEAD associated data
    /// (`epoch || sequence_number(48 bits) || content_type || version ||
    /// length`), returning `explicit_nonce || ciphertext || tag`.
    pub fn encrypt(&self, explicit_nonce: [u8; 8], aad: &[u8; 13], plaintext: &[u8]) -> Bytes {
        let nonce = self.nonce(&explicit_nonce);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .expect("aes-gcm encryption with valid key/nonce length cannot fail");
        let mut out = BytesMut::with_capacity(EXPLICIT_NONCE_LEN + ciphertext.len());
        out.put_slice(&explicit_nonce);
        out.put_slice(&ciphertext);
        out.freeze()
    }

    /// Splits the explicit nonce from `sealed`, decrypts, and verifies the
    /// tag against `aad` (which must carry the record's real length field,
    /// i.e. the length of `sealed` as received, not the plaintext length).
    pub fn decrypt(&self, aad: &[u8; 13], sealed: &[u8]) -> Result<Bytes> {
        if sealed.len() < EXPLICIT_NONCE_LEN + TAG_LEN {
            return Err(Error::short("dtls_gcm_record"));
        }
        let mut explicit_nonce = [0u8; 8];
        explicit_nonce.copy_from_slice(&sealed[..EXPLICIT_NONCE_LEN]);
        let nonce = self.nonce(&explicit_nonce);
        let ciphertext = &sealed[EXPLICIT_NONCE_LEN..];
        let plaintext = self
            .cipher
            .decrypt(&nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| Error::IntegrityFailure("dtls_gcm_tag"))?;
        Ok(Bytes::from(plaintext))
    }
}

/// Builds the 13-byte GCM associated data for one record.
pub fn build_aad(epoch: u16, sequence_number: u64, content_type: u8, length: u16) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[0..2].copy_from_slice(&epoch.to_be_bytes());
    let seq_bytes = sequence_number.to_be_bytes();
    aad[2..8].copy_from_slice(&seq_bytes[2..8]);
    aad[8] = content_type;
    aad[9] = 254;
    aad[10] = 253;
    aad[11..13].copy_from_slice(&length.to_be_bytes());
    aad
}
