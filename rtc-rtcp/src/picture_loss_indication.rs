use bytes::Buf;
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{format, packet_type, put_header, RtcpHeader};

/// PSFB fmt=1: Picture Loss Indication, no FCI payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PictureLossIndication {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl MarshalSize for PictureLossIndication {
    fn marshal_size(&self) -> usize {
        4 + 8
    }
}

impl Marshal for PictureLossIndication {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let need = self.marshal_size();
        if buf.len() < need {
            return Err(Error::WrongMarshalSize { need, have: buf.len() });
        }
        let mut tmp = bytes::BytesMut::with_capacity(need);
        put_header(&mut tmp, packet_type::PAYLOAD_SPECIFIC_FEEDBACK, format::PLI, 8);
        tmp.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        tmp.extend_from_slice(&self.media_ssrc.to_be_bytes());
        buf[..need].copy_from_slice(&tmp);
        Ok(need)
    }
}

impl Unmarshal for PictureLossIndication {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = RtcpHeader::unmarshal(buf)?;
        if header.packet_type != packet_type::PAYLOAD_SPECIFIC_FEEDBACK || header.count != format::PLI {
            return Err(Error::InvalidFraming { field: "pli_packet_type" });
        }
        if buf.remaining() < 8 {
            return Err(Error::short("pli_body"));
        }
        Ok(PictureLossIndication { sender_ssrc: buf.get_u32(), media_ssrc: buf.get_u32() })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let pli = PictureLossIndication { sender_ssrc: 1, media_ssrc: 2 };
        let buf = pli.marshal().unwrap();
        let mut b = &buf[..];
        assert_eq!(PictureLossIndication::unmarshal(&mut b).unwrap(), pli);
    }
}
