use bytes::{Buf, BufMut, Bytes};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{pad4, Marshal, MarshalSize, Unmarshal};

use crate::header::{packet_type, put_header, RtcpHeader};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Goodbye {
    pub sources: Vec<u32>,
    pub reason: Bytes,
}

impl MarshalSize for Goodbye {
    fn marshal_size(&self) -> usize {
        let body = self.sources.len() * 4 + if self.reason.is_empty() { 0 } else { 1 + self.reason.len() };
        4 + pad4(body)
    }
}

impl Marshal for Goodbye {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let mut tmp = bytes::BytesMut::new();
        for s in &self.sources {
            tmp.put_u32(*s);
        }
        if !self.reason.is_empty() {
            tmp.put_u8(self.reason.len() as u8);
            tmp.put_slice(&self.reason);
        }
        let unpadded = tmp.len();
        let padded = pad4(unpadded);
        for _ in unpadded..padded {
            tmp.put_u8(0);
        }
        let need = 4 + padded;
        if buf.len() < need {
            return Err(Error::WrongMarshalSize { need, have: buf.len() });
        }
        let mut head = bytes::BytesMut::with_capacity(4);
        put_header(&mut head, packet_type::GOODBYE, self.sources.len() as u8, padded);
        buf[..4].copy_from_slice(&head);
        buf[4..need].copy_from_slice(&tmp);
        Ok(need)
    }
}

impl Unmarshal for Goodbye {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = RtcpHeader::unmarshal(buf)?;
        if header.packet_type != packet_type::GOODBYE {
            return Err(Error::InvalidFraming { field: "bye_packet_type" });
        }
        if buf.remaining() < header.count as usize * 4 {
            return Err(Error::short("bye_sources"));
        }
        let mut sources = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            sources.push(buf.get_u32());
        }
        let consumed_before_reason = header.count as usize * 4;
        let mut reason = Bytes::new();
        if header.length_bytes > consumed_before_reason && buf.remaining() > 0 {
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(Error::short("bye_reason"));
            }
            reason = buf.copy_to_bytes(len);
        }
        Ok(Goodbye { sources, reason })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_without_reason() {
        let bye = Goodbye { sources: vec![1, 2, 3], reason: Bytes::new() };
        let buf = bye.marshal().unwrap();
        let mut b = &buf[..];
        assert_eq!(Goodbye::unmarshal(&mut b).unwrap(), bye);
    }

    #[test]
    fn round_trip_with_reason() {
        let bye = Goodbye { sources: vec![9], reason: Bytes::from_static(b"camera switched off") };
        let buf = bye.marshal().unwrap();
        let mut b = &buf[..];
        assert_eq!(Goodbye::unmarshal(&mut b).unwrap(), bye);
    }
}
