use bytes::{Buf, BufMut, Bytes};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{pad4, Marshal, MarshalSize, Unmarshal};

use crate::header::{packet_type, put_header, RtcpHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SdesItemType {
    Cname = 1,
    Name = 2,
    Email = 3,
    Phone = 4,
    Loc = 5,
    Tool = 6,
    Note = 7,
    Priv = 8,
}

impl SdesItemType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Cname,
            2 => Self::Name,
            3 => Self::Email,
            4 => Self::Phone,
            5 => Self::Loc,
            6 => Self::Tool,
            7 => Self::Note,
            8 => Self::Priv,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    pub item_type: u8,
    pub text: Bytes,
}

impl SdesItem {
    pub fn cname(text: impl Into<Bytes>) -> Self {
        SdesItem { item_type: SdesItemType::Cname as u8, text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub items: Vec<SdesItem>,
}

impl SdesChunk {
    fn raw_len(&self) -> usize {
        4 + self.items.iter().map(|i| 2 + i.text.len()).sum::<usize>() + 1 // +1 terminator
    }

    fn padded_len(&self) -> usize {
        pad4(self.raw_len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceDescription {
    pub chunks: Vec<SdesChunk>,
}

impl MarshalSize for SourceDescription {
    fn marshal_size(&self) -> usize {
        4 + self.chunks.iter().map(SdesChunk::padded_len).sum::<usize>()
    }
}

impl Marshal for SourceDescription {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let need = self.marshal_size();
        if buf.len() < need {
            return Err(Error::WrongMarshalSize { need, have: buf.len() });
        }
        let body_len = need - 4;
        let mut tmp = bytes::BytesMut::with_capacity(need);
        put_header(&mut tmp, packet_type::SOURCE_DESCRIPTION, self.chunks.len() as u8, body_len);
        for chunk in &self.chunks {
            let start = tmp.len();
            tmp.put_u32(chunk.ssrc);
            for item in &chunk.items {
                tmp.put_u8(item.item_type);
                tmp.put_u8(item.text.len() as u8);
                tmp.put_slice(&item.text);
            }
            tmp.put_u8(0); // terminator
            let written = tmp.len() - start;
            let padded = pad4(written);
            for _ in written..padded {
                tmp.put_u8(0);
            }
        }
        buf[..need].copy_from_slice(&tmp);
        Ok(need)
    }
}

impl Unmarshal for SourceDescription {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = RtcpHeader::unmarshal(buf)?;
        if header.packet_type != packet_type::SOURCE_DESCRIPTION {
            return Err(Error::InvalidFraming { field: "sdes_packet_type" });
        }
        let mut remaining = header.length_bytes;
        let mut chunks = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            if remaining < 4 || buf.remaining() < 4 {
                return Err(Error::short("sdes_chunk"));
            }
            let chunk_start = buf.remaining();
            let ssrc = buf.get_u32();
            let mut items = Vec::new();
            loop {
                if buf.remaining() == 0 {
                    return Err(Error::short("sdes_item"));
                }
                let t = buf.get_u8();
                if t == 0 {
                    break;
                }
                let item_type = SdesItemType::from_u8(t)
                    .map(|_| t)
                    .ok_or(Error::Unsupported("sdes_item_type"))?;
                if buf.remaining() == 0 {
                    return Err(Error::short("sdes_item_len"));
                }
                let len = buf.get_u8() as usize;
                if buf.remaining() < len {
                    return Err(Error::short("sdes_item_text"));
                }
                let text = buf.copy_to_bytes(len);
                items.push(SdesItem { item_type, text });
            }
            let consumed = chunk_start - buf.remaining();
            let padded = pad4(consumed);
            let pad = padded - consumed;
            if buf.remaining() < pad {
                return Err(Error::short("sdes_chunk_pad"));
            }
            buf.advance(pad);
            remaining = remaining.saturating_sub(padded);
            chunks.push(SdesChunk { ssrc, items });
        }
        Ok(SourceDescription { chunks })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_with_cname() {
        let sdes = SourceDescription {
            chunks: vec![SdesChunk {
                ssrc: 7,
                items: vec![SdesItem::cname(Bytes::from_static(b"abc"))],
            }],
        };
        let buf = sdes.marshal().unwrap();
        let mut b = &buf[..];
        assert_eq!(SourceDescription::unmarshal(&mut b).unwrap(), sdes);
    }

    #[test]
    fn round_trip_multiple_chunks() {
        let sdes = SourceDescription {
            chunks: vec![
                SdesChunk { ssrc: 1, items: vec![SdesItem::cname(Bytes::from_static(b"x"))] },
                SdesChunk {
                    ssrc: 2,
                    items: vec![
                        SdesItem::cname(Bytes::from_static(b"longer-cname-value")),
                        SdesItem { item_type: SdesItemType::Tool as u8, text: Bytes::from_static(b"rtc") },
                    ],
                },
            ],
        };
        let buf = sdes.marshal().unwrap();
        let mut b = &buf[..];
        assert_eq!(SourceDescription::unmarshal(&mut b).unwrap(), sdes);
    }
}
