use bytes::{Buf, Bytes};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{packet_type, put_header, RtcpHeader};
use crate::report_block::{ReportBlock, REPORT_BLOCK_LEN};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub report_blocks: Vec<ReportBlock>,
}

impl MarshalSize for ReceiverReport {
    fn marshal_size(&self) -> usize {
        4 + 4 + self.report_blocks.len() * REPORT_BLOCK_LEN
    }
}

impl Marshal for ReceiverReport {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let need = self.marshal_size();
        if buf.len() < need {
            return Err(Error::WrongMarshalSize { need, have: buf.len() });
        }
        let body_len = need - 4;
        let mut tmp = bytes::BytesMut::with_capacity(need);
        put_header(&mut tmp, packet_type::RECEIVER_REPORT, self.report_blocks.len() as u8, body_len);
        tmp.extend_from_slice(&self.ssrc.to_be_bytes());
        for rb in &self.report_blocks {
            tmp.extend_from_slice(&rb.marshal()?);
        }
        buf[..need].copy_from_slice(&tmp);
        Ok(need)
    }
}

impl Unmarshal for ReceiverReport {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = RtcpHeader::unmarshal(buf)?;
        if header.packet_type != packet_type::RECEIVER_REPORT {
            return Err(Error::InvalidFraming { field: "rr_packet_type" });
        }
        if buf.remaining() < 4 {
            return Err(Error::short("rr_body"));
        }
        let ssrc = buf.get_u32();
        let mut report_blocks = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            report_blocks.push(ReportBlock::unmarshal(buf)?);
        }
        Ok(ReceiverReport { ssrc, report_blocks })
    }
}

pub fn unmarshal_body(ssrc: u32, count: u8, body: &mut Bytes) -> Result<ReceiverReport> {
    let mut report_blocks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        report_blocks.push(ReportBlock::unmarshal(body)?);
    }
    Ok(ReceiverReport { ssrc, report_blocks })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let rr = ReceiverReport {
            ssrc: 55,
            report_blocks: vec![ReportBlock { ssrc: 1, jitter: 7, ..Default::default() }],
        };
        let buf = rr.marshal().unwrap();
        let mut b = &buf[..];
        assert_eq!(ReceiverReport::unmarshal(&mut b).unwrap(), rr);
    }
}
