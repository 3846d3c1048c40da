use bytes::{Buf, BufMut};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{Marshal, MarshalSize, Unmarshal};
use rtc_shared::util::{pack_i24, unpack_i24};

pub const REPORT_BLOCK_LEN: usize = 24;
pub const SENDER_INFO_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenderInfo {
    pub ntp_time: u64,
    pub rtp_time: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl MarshalSize for SenderInfo {
    fn marshal_size(&self) -> usize {
        SENDER_INFO_LEN
    }
}

impl Marshal for SenderInfo {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < SENDER_INFO_LEN {
            return Err(Error::WrongMarshalSize { need: SENDER_INFO_LEN, have: buf.len() });
        }
        let mut w = &mut buf[..];
        w.put_u64(self.ntp_time);
        w.put_u32(self.rtp_time);
        w.put_u32(self.packet_count);
        w.put_u32(self.octet_count);
        Ok(SENDER_INFO_LEN)
    }
}

impl Unmarshal for SenderInfo {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < SENDER_INFO_LEN {
            return Err(Error::short("sender_info"));
        }
        Ok(SenderInfo {
            ntp_time: buf.get_u64(),
            rtp_time: buf.get_u32(),
            packet_count: buf.get_u32(),
            octet_count: buf.get_u32(),
        })
    }
}

/// One SR/RR report block, referencing a single remote SSRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub packets_lost: i32,
    pub last_seq_num: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_last_sr: u32,
}

impl MarshalSize for ReportBlock {
    fn marshal_size(&self) -> usize {
        REPORT_BLOCK_LEN
    }
}

impl Marshal for ReportBlock {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < REPORT_BLOCK_LEN {
            return Err(Error::WrongMarshalSize { need: REPORT_BLOCK_LEN, have: buf.len() });
        }
        let mut w = &mut buf[..];
        w.put_u32(self.ssrc);
        w.put_u8(self.fraction_lost);
        w.put_slice(&pack_i24(self.packets_lost));
        w.put_u32(self.last_seq_num);
        w.put_u32(self.jitter);
        w.put_u32(self.last_sr);
        w.put_u32(self.delay_last_sr);
        Ok(REPORT_BLOCK_LEN)
    }
}

impl Unmarshal for ReportBlock {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < REPORT_BLOCK_LEN {
            return Err(Error::short("report_block"));
        }
        let ssrc = buf.get_u32();
        let fraction_lost = buf.get_u8();
        let lost = [buf.get_u8(), buf.get_u8(), buf.get_u8()];
        let packets_lost = unpack_i24(lost);
        let last_seq_num = buf.get_u32();
        let jitter = buf.get_u32();
        let last_sr = buf.get_u32();
        let delay_last_sr = buf.get_u32();
        Ok(ReportBlock {
            ssrc,
            fraction_lost,
            packets_lost,
            last_seq_num,
            jitter,
            last_sr,
            delay_last_sr,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn report_block_round_trip() {
        let rb = ReportBlock {
            ssrc: 1,
            fraction_lost: 12,
            packets_lost: -100,
            last_seq_num: 99999,
            jitter: 42,
            last_sr: 7,
            delay_last_sr: 8,
        };
        let buf = rb.marshal().unwrap();
        let mut b = &buf[..];
        assert_eq!(ReportBlock::unmarshal(&mut b).unwrap(), rb);
    }
}
