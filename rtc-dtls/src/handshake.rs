//! DTLS 1.2 handshake message framing (RFC 6347 §4.2, RFC 5246 §7.4) and the
//! body types this core negotiates: ECDHE-ECDSA key exchange with the
//! `use_srtp` extension (RFC 5764).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rtc_shared::error::{Error, Result};

pub mod msg_type {
    pub const HELLO_REQUEST: u8 = 0;
    pub const CLIENT_HELLO: u8 = 1;
    pub const SERVER_HELLO: u8 = 2;
    pub const HELLO_VERIFY_REQUEST: u8 = 3;
    pub const CERTIFICATE: u8 = 11;
    pub const SERVER_KEY_EXCHANGE: u8 = 12;
    pub const CERTIFICATE_REQUEST: u8 = 13;
    pub const SERVER_HELLO_DONE: u8 = 14;
    pub const CERTIFICATE_VERIFY: u8 = 15;
    pub const CLIENT_KEY_EXCHANGE: u8 = 16;
    pub const FINISHED: u8 = 20;
}

/// `TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256`, the one suite this core
/// negotiates (ECDHE-ECDSA, AEAD record protection).
pub const CIPHER_SUITE_ECDHE_ECDSA_AES128_GCM_SHA256: u16 = 0xC02B;
pub const EXTENSION_USE_SRTP: u16 = 14;
pub const SRTP_AES128_CM_SHA1_80: u16 = 0x0001;
pub const NAMED_CURVE_SECP256R1: u16 = 23;
pub const EC_CURVE_TYPE_NAMED_CURVE: u8 = 3;
/// ecdsa_secp256r1_sha256, the one signature scheme this core produces.
pub const SIGNATURE_SCHEME_ECDSA_SECP256R1_SHA256: u16 = 0x0403;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHeader {
    pub msg_type: u8,
    pub length: u32,
    pub message_seq: u16,
    pub fragment_offset: u32,
    pub fragment_length: u32,
}

pub const HEADER_LEN: usize = 12;

impl HandshakeHeader {
    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u8(self.msg_type);
        buf.put_slice(&self.length.to_be_bytes()[1..4]);
        buf.put_u16(self.message_seq);
        buf.put_slice(&self.fragment_offset.to_be_bytes()[1..4]);
        buf.put_slice(&self.fragment_length.to_be_bytes()[1..4]);
    }

    pub fn unmarshal(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(Error::short("dtls_handshake_header"));
        }
        let msg_type = buf.get_u8();
        let length = read_u24(buf);
        let message_seq = buf.get_u16();
        let fragment_offset = read_u24(buf);
        let fragment_length = read_u24(buf);
        Ok(HandshakeHeader { msg_type, length, message_seq, fragment_offset, fragment_length })
    }
}

fn read_u24(buf: &mut Bytes) -> u32 {
    let b = [buf.get_u8(), buf.get_u8(), buf.get_u8()];
    u32::from_be_bytes([0, b[0], b[1], b[2]])
}

fn put_u24(buf: &mut BytesMut, v: u32) {
    buf.put_slice(&v.to_be_bytes()[1..4]);
}

/// Wraps a handshake body with its header, unfragmented (every handshake
/// message this core sends fits in one DTLS record).
pub fn frame_message(msg_type: u8, message_seq: u16, body: &[u8]) -> Bytes {
    let header = HandshakeHeader {
        msg_type,
        length: body.len() as u32,
        message_seq,
        fragment_offset: 0,
        fragment_length: body.len() as u32,
    };
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    header.marshal(&mut buf);
    buf.put_slice(body);
    buf.freeze()
}

/// One fully-reassembled handshake message (this core never actually
/// fragments across multiple records, so reassembly is a length check).
pub struct ParsedMessage {
    pub header: HandshakeHeader,
    pub body: Bytes,
    /// The exact `header || body` bytes, as folded into the handshake
    /// transcript hash.
    pub raw: Bytes,
}

pub fn parse_message(buf: Bytes) -> Result<ParsedMessage> {
    let original = buf.clone();
    let mut cursor = buf;
    let header = HandshakeHeader::unmarshal(&mut cursor)?;
    if header.fragment_offset != 0 || header.fragment_length != header.length {
        return Err(Error::Unsupported("fragmented_handshake_message"));
    }
    if cursor.remaining() < header.length as usize {
        return Err(Error::short("dtls_handshake_body"));
    }
    let body = cursor.copy_to_bytes(header.length as usize);
    let raw = original.slice(0..HEADER_LEN + header.length as usize);
    Ok(ParsedMessage { header, body, raw })
}

fn put_vec8(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u8(data.len() as u8);
    buf.put_slice(data);
}

fn get_vec8(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 1 {
        return Err(Error::short("dtls_vec8_len"));
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(Error::short("dtls_vec8_body"));
    }
    Ok(buf.copy_to_bytes(len))
}

fn put_vec16(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

fn get_vec16(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(Error::short("dtls_vec16_len"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(Error::short("dtls_vec16_body"));
    }
    Ok(buf.copy_to_bytes(len))
}

fn put_vec24(buf: &mut BytesMut, data: &[u8]) {
    put_u24(buf, data.len() as u32);
    buf.put_slice(data);
}

fn get_vec24(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 3 {
        return Err(Error::short("dtls_vec24_len"));
    }
    let len = read_u24(buf) as usize;
    if buf.remaining() < len {
        return Err(Error::short("dtls_vec24_body"));
    }
    Ok(buf.copy_to_bytes(len))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub random: [u8; 32],
    pub session_id: Bytes,
    pub cookie: Bytes,
    pub cipher_suites: Vec<u16>,
    pub use_srtp_profiles: Vec<u16>,
}

impl ClientHello {
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(254);
        buf.put_u8(253);
        buf.put_slice(&self.random);
        put_vec8(&mut buf, &self.session_id);
        put_vec8(&mut buf, &self.cookie);
        let mut suites = BytesMut::new();
        for s in &self.cipher_suites {
            suites.put_u16(*s);
        }
        put_vec16(&mut buf, &suites);
        put_vec8(&mut buf, &[0]); // compression methods: null only

        let mut ext = BytesMut::new();
        write_use_srtp_extension(&mut ext, &self.use_srtp_profiles);
        write_supported_groups_extension(&mut ext);
        write_ec_point_formats_extension(&mut ext);
        write_signature_algorithms_extension(&mut ext);
        put_vec16(&mut buf, &ext);
        buf.freeze()
    }

    pub fn unmarshal(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < 34 {
            return Err(Error::short("client_hello"));
        }
        let _major = buf.get_u8();
        let _minor = buf.get_u8();
        let mut random = [0u8; 32];
        buf.copy_to_slice(&mut random);
        let session_id = get_vec8(&mut buf)?;
        let cookie = get_vec8(&mut buf)?;
        let mut suites_bytes = get_vec16(&mut buf)?;
        let mut cipher_suites = Vec::new();
        while suites_bytes.remaining() >= 2 {
            cipher_suites.push(suites_bytes.get_u16());
        }
        let _compression = get_vec8(&mut buf)?;
        let use_srtp_profiles = if buf.remaining() >= 2 {
            let mut ext = get_vec16(&mut buf)?;
            read_use_srtp_profiles(&mut ext)?
        } else {
            Vec::new()
        };
        Ok(ClientHello { random, session_id, cookie, cipher_suites, use_srtp_profiles })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloVerifyRequest {
    pub cookie: Bytes,
}

impl HelloVerifyRequest {
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(254);
        buf.put_u8(253);
        put_vec8(&mut buf, &self.cookie);
        buf.freeze()
    }

    pub fn unmarshal(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(Error::short("hello_verify_request"));
        }
        let _major = buf.get_u8();
        let _minor = buf.get_u8();
        let cookie = get_vec8(&mut buf)?;
        Ok(HelloVerifyRequest { cookie })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub random: [u8; 32],
    pub session_id: Bytes,
    pub cipher_suite: u16,
    pub use_srtp_profile: Option<u16>,
}

impl ServerHello {
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(254);
        buf.put_u8(253);
        buf.put_slice(&self.random);
        put_vec8(&mut buf, &self.session_id);
        buf.put_u16(self.cipher_suite);
        buf.put_u8(0); // compression: null
        if let Some(profile) = self.use_srtp_profile {
            let mut ext = BytesMut::new();
            write_use_srtp_extension(&mut ext, &[profile]);
            put_vec16(&mut buf, &ext);
        }
        buf.freeze()
    }

    pub fn unmarshal(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < 34 {
            return Err(Error::short("server_hello"));
        }
        let _major = buf.get_u8();
        let _minor = buf.get_u8();
        let mut random = [0u8; 32];
        buf.copy_to_slice(&mut random);
        let session_id = get_vec8(&mut buf)?;
        if buf.remaining() < 3 {
            return Err(Error::short("server_hello_suite"));
        }
        let cipher_suite = buf.get_u16();
        let _compression = buf.get_u8();
        let use_srtp_profile = if buf.remaining() >= 2 {
            let mut ext = get_vec16(&mut buf)?;
            read_use_srtp_profiles(&mut ext)?.first().copied()
        } else {
            None
        };
        Ok(ServerHello { random, session_id, cipher_suite, use_srtp_profile })
    }
}

fn write_use_srtp_extension(buf: &mut BytesMut, profiles: &[u16]) {
    buf.put_u16(EXTENSION_USE_SRTP);
    let mut body = BytesMut::new();
    let mut profile_bytes = BytesMut::new();
    for p in profiles {
        profile_bytes.put_u16(*p);
    }
    put_vec16(&mut body, &profile_bytes);
    body.put_u8(0); // mki length
    put_vec16(buf, &body);
}

fn write_supported_groups_extension(buf: &mut BytesMut) {
    buf.put_u16(10);
    let mut body = BytesMut::new();
    let mut groups = BytesMut::new();
    groups.put_u16(NAMED_CURVE_SECP256R1);
    put_vec16(&mut body, &groups);
    put_vec16(buf, &body);
}

fn write_ec_point_formats_extension(buf: &mut BytesMut) {
    buf.put_u16(11);
    let mut body = BytesMut::new();
    put_vec8(&mut body, &[0]); // uncompressed
    put_vec16(buf, &body);
}

fn write_signature_algorithms_extension(buf: &mut BytesMut) {
    buf.put_u16(13);
    let mut body = BytesMut::new();
    let mut algos = BytesMut::new();
    algos.put_u16(SIGNATURE_SCHEME_ECDSA_SECP256R1_SHA256);
    put_vec16(&mut body, &algos);
    put_vec16(buf, &body);
}

fn read_use_srtp_profiles(buf: &mut Bytes) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    while buf.remaining() >= 4 {
        let ext_type = buf.get_u16();
        let mut ext_body = get_vec16(buf)?;
        if ext_type == EXTENSION_USE_SRTP {
            let mut profiles = get_vec16(&mut ext_body)?;
            while profiles.remaining() >= 2 {
                out.push(profiles.get_u16());
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateMessage {
    pub certificates: Vec<Bytes>,
}

impl CertificateMessage {
    pub fn marshal(&self) -> Bytes {
        let mut list = BytesMut::new();
        for cert in &self.certificates {
            put_vec24(&mut list, cert);
        }
        let mut buf = BytesMut::new();
        put_vec24(&mut buf, &list);
        buf.freeze()
    }

    pub fn unmarshal(mut buf: Bytes) -> Result<Self> {
        let mut list = get_vec24(&mut buf)?;
        let mut certificates = Vec::new();
        while list.has_remaining() {
            certificates.push(get_vec24(&mut list)?);
        }
        Ok(CertificateMessage { certificates })
    }
}

/// `ServerKeyExchange` for a named-curve ECDHE group: the public point plus
/// an ECDSA signature over `client_random || server_random || params`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeyExchange {
    pub public_key: Bytes,
    pub signature_scheme: u16,
    pub signature: Bytes,
}

impl ServerKeyExchange {
    pub fn params_bytes(named_curve: u16, public_key: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(EC_CURVE_TYPE_NAMED_CURVE);
        buf.put_u16(named_curve);
        put_vec8(&mut buf, public_key);
        buf.freeze()
    }

    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(EC_CURVE_TYPE_NAMED_CURVE);
        buf.put_u16(NAMED_CURVE_SECP256R1);
        put_vec8(&mut buf, &self.public_key);
        buf.put_u16(self.signature_scheme);
        put_vec16(&mut buf, &self.signature);
        buf.freeze()
    }

    pub fn unmarshal(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < 3 {
            return Err(Error::short("server_key_exchange"));
        }
        let curve_type = buf.get_u8();
        if curve_type != EC_CURVE_TYPE_NAMED_CURVE {
            return Err(Error::Unsupported("ec_curve_type"));
        }
        let _named_curve = buf.get_u16();
        let public_key = get_vec8(&mut buf)?;
        if buf.remaining() < 2 {
            return Err(Error::short("server_key_exchange_sig_alg"));
        }
        let signature_scheme = buf.get_u16();
        let signature = get_vec16(&mut buf)?;
        Ok(ServerKeyExchange { public_key, signature_scheme, signature })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKeyExchange {
    pub public_key: Bytes,
}

impl ClientKeyExchange {
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_vec8(&mut buf, &self.public_key);
        buf.freeze()
    }

    pub fn unmarshal(mut buf: Bytes) -> Result<Self> {
        let public_key = get_vec8(&mut buf)?;
        Ok(ClientKeyExchange { public_key })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateVerify {
    pub signature_scheme: u16,
    pub signature: Bytes,
}

impl CertificateVerify {
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(self.signature_scheme);
        put_vec16(&mut buf, &self.signature);
        buf.freeze()
    }

    pub fn unmarshal(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(Error::short("certificate_verify"));
        }
        let signature_scheme = buf.get_u16();
        let signature = get_vec16(&mut buf)?;
        Ok(CertificateVerify { signature_scheme, signature })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finished {
    pub verify_data: [u8; 12],
}

impl Finished {
    pub fn marshal(&self) -> Bytes {
        Bytes::copy_from_slice(&self.verify_data)
    }

    pub fn unmarshal(buf: Bytes) -> Result<Self> {
        if buf.len() != 12 {
            return Err(Error::short("finished"));
        }
        let mut verify_data = [0u8; 12];
        verify_data.copy_from_slice(&buf);
        Ok(Finished { verify_data })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn handshake_header_round_trip() {
        let h = HandshakeHeader {
            msg_type: msg_type::CLIENT_HELLO,
            length: 100,
            message_seq: 3,
            fragment_offset: 0,
            fragment_length: 100,
        };
        let mut buf = BytesMut::new();
        h.marshal(&mut buf);
        let mut b = buf.freeze();
        assert_eq!(HandshakeHeader::unmarshal(&mut b).unwrap(), h);
    }

    #[test]
    fn client_hello_round_trip() {
        let ch = ClientHello {
            random: [7u8; 32],
            session_id: Bytes::new(),
            cookie: Bytes::from_static(b"cookie"),
            cipher_suites: vec![CIPHER_SUITE_ECDHE_ECDSA_AES128_GCM_SHA256],
            use_srtp_profiles: vec![SRTP_AES128_CM_SHA1_80],
        };
        let buf = ch.marshal();
        let parsed = ClientHello::unmarshal(buf).unwrap();
        assert_eq!(parsed, ch);
    }

    #[test]
    fn server_hello_round_trip() {
        let sh = ServerHello {
            random: [1u8; 32],
            session_id: Bytes::new(),
            cipher_suite: CIPHER_SUITE_ECDHE_ECDSA_AES128_GCM_SHA256,
            use_srtp_profile: Some(SRTP_AES128_CM_SHA1_80),
        };
        let buf = sh.marshal();
        let parsed = ServerHello::unmarshal(buf).unwrap();
        assert_eq!(parsed, sh);
    }

    #[test]
    fn certificate_message_round_trip() {
        let msg = CertificateMessage { certificates: vec![Bytes::from_static(b"der-cert-bytes")] };
        let buf = msg.marshal();
        assert_eq!(CertificateMessage::unmarshal(buf).unwrap(), msg);
    }

    #[test]
    fn server_key_exchange_round_trip() {
        let ske = ServerKeyExchange {
            public_key: Bytes::from_static(&[4u8; 65]),
            signature_scheme: SIGNATURE_SCHEME_ECDSA_SECP256R1_SHA256,
            signature: Bytes::from_static(b"signature-bytes"),
        };
        let buf = ske.marshal();
        assert_eq!(ServerKeyExchange::unmarshal(buf).unwrap(), ske);
    }

    #[test]
    fn finished_rejects_wrong_length() {
        assert!(Finished::unmarshal(Bytes::from_static(b"short")).is_err());
    }
}
