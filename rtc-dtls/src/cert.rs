//! Self-signed ECDSA P-256 certificates for DTLS authentication, and their
//! SHA-256 fingerprints (the identity WebRTC peers actually check, via the
//! SDP `a=fingerprint` line, rather than a PKI chain).

use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::DecodePrivateKey;
use rand::Rng;
use rcgen::{CertificateParams, KeyPair};
use rtc_shared::error::{Error, Result};
use sha2::{Digest, Sha256};

/// A self-signed ECDSA P-256 certificate and the signing key backing it.
#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    signing_key: SigningKey,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate").field("fingerprint", &self.fingerprint_hex()).finish()
    }
}

fn random_common_name() -> String {
    let mut rng = rand::rng();
    (0..16).map(|_| rng.sample(rand::distr::Alphanumeric) as char).collect()
}

impl Certificate {
    /// Generates a new self-signed certificate with rcgen's default validity
    /// window and a random hex common name. Only a validity window covering
    /// the session is required; rcgen's multi-year default satisfies that
    /// without this core needing to reach for a date/time crate of its own.
    pub fn generate_self_signed() -> Result<Self> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|_| Error::ProtocolViolation("dtls_cert_keygen"))?;
        let params = CertificateParams::new(vec![random_common_name()])
            .map_err(|_| Error::ProtocolViolation("dtls_cert_params"))?;

        let x509_cert = params
            .self_signed(&key_pair)
            .map_err(|_| Error::ProtocolViolation("dtls_cert_self_sign"))?;
        let der = key_pair.serialize_der();
        let signing_key = SigningKey::from_pkcs8_der(&der)
            .map_err(|_| Error::ProtocolViolation("dtls_cert_signing_key"))?;

        Ok(Self { der: x509_cert.der().to_vec(), signing_key })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// SHA-256 over the DER-encoded certificate, the exact bytes carried in
    /// the handshake's Certificate message.
    pub fn fingerprint_bytes(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(&self.der);
        let digest = h.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    /// Colon-separated uppercase hex, matching the `a=fingerprint:sha-256`
    /// SDP presentation.
    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint_bytes().iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(":")
    }

    /// Signs `message` (the ECDHE `ServerKeyExchange` parameters, prefixed
    /// with `client_random || server_random` per RFC 5246 §7.4.3) with this
    /// certificate's private key, producing a DER-encoded ECDSA signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let sig: Signature = self.signing_key.sign(message);
        sig.to_der().as_bytes().to_vec()
    }
}

/// Computes the SHA-256 fingerprint of a raw DER certificate, for comparing
/// a received `Certificate` message against the SDP-exchanged value.
pub fn fingerprint_of_der(der: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(der);
    let digest = h.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generates_distinct_certificates() {
        let a = Certificate::generate_self_signed().unwrap();
        let b = Certificate::generate_self_signed().unwrap();
        assert_ne!(a.der(), b.der());
        assert_ne!(a.fingerprint_bytes(), b.fingerprint_bytes());
    }

    #[test]
    fn fingerprint_matches_der_hash() {
        let cert = Certificate::generate_self_signed().unwrap();
        assert_eq!(cert.fingerprint_bytes(), fingerprint_of_der(cert.der()));
    }

    #[test]
    fn fingerprint_hex_is_colon_separated_uppercase() {
        let cert = Certificate::generate_self_signed().unwrap();
        let hex = cert.fingerprint_hex();
        assert_eq!(hex.split(':').count(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() || c == ':'));
    }

    #[test]
    fn sign_produces_verifiable_signature() {
        use p256::ecdsa::signature::Verifier;
        let cert = Certificate::generate_self_signed().unwrap();
        let msg = b"client_random||server_random||params";
        let sig_der = cert.sign(msg);
        let verifying_key = cert.signing_key.verifying_key();
        let sig = Signature::from_der(&sig_der).unwrap();
        assert!(verifying_key.verify(msg, &sig).is_ok());
    }
}
