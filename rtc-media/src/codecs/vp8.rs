//! VP8 RTP payload descriptor and packetizer (RFC 7741).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{require, Marshal, MarshalSize, Unmarshal};

use super::PACKET_MAX;

/// RFC 7741 §4.2 payload descriptor. `picture_id`'s width (7 vs 15 bit) is
/// chosen by the encoder from its magnitude and recovered verbatim on
/// parse, so `parse(serialize(d)) == d` holds for any value this
/// packetizer itself produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vp8PayloadDescriptor {
    pub non_reference: bool,
    pub start_of_partition: bool,
    pub partition_index: u8,
    pub picture_id: Option<u16>,
    pub tl0_pic_idx: Option<u8>,
    /// `(temporal layer index, layer-sync bit)`.
    pub tid: Option<(u8, bool)>,
    pub key_idx: Option<u8>,
}

impl Vp8PayloadDescriptor {
    fn has_extension(&self) -> bool {
        self.picture_id.is_some() || self.tl0_pic_idx.is_some() || self.tid.is_some() || self.key_idx.is_some()
    }

    fn picture_id_is_extended(&self) -> bool {
        matches!(self.picture_id, Some(id) if id > 0x7f)
    }
}

impl MarshalSize for Vp8PayloadDescriptor {
    fn marshal_size(&self) -> usize {
        let mut size = 1;
        if self.has_extension() {
            size += 1;
            if self.picture_id.is_some() {
                size += if self.picture_id_is_extended() { 2 } else { 1 };
            }
            if self.tl0_pic_idx.is_some() {
                size += 1;
            }
            if self.tid.is_some() || self.key_idx.is_some() {
                size += 1;
            }
        }
        size
    }
}

impl Marshal for Vp8PayloadDescriptor {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.len() < size {
            return Err(Error::WrongMarshalSize { need: size, have: buf.len() });
        }
        let x = self.has_extension() as u8;
        let n = self.non_reference as u8;
        let s = self.start_of_partition as u8;
        buf.put_u8((x << 7) | (n << 5) | (s << 4) | (self.partition_index & 0x0f));

        if x == 1 {
            let i = self.picture_id.is_some() as u8;
            let l = self.tl0_pic_idx.is_some() as u8;
            let t = self.tid.is_some() as u8;
            let k = self.key_idx.is_some() as u8;
            buf.put_u8((i << 7) | (l << 6) | (t << 5) | (k << 4));

            if let Some(id) = self.picture_id {
                if self.picture_id_is_extended() {
                    buf.put_u16(0x8000 | id);
                } else {
                    buf.put_u8((id & 0x7f) as u8);
                }
            }
            if let Some(idx) = self.tl0_pic_idx {
                buf.put_u8(idx);
            }
            if let Some((tid, y)) = self.tid {
                buf.put_u8(((tid & 0x3) << 6) | ((y as u8) << 5));
            } else if let Some(key_idx) = self.key_idx {
                buf.put_u8(key_idx & 0x1f);
            }
        }
        Ok(size)
    }
}

impl Unmarshal for Vp8PayloadDescriptor {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        require(buf.remaining(), 1, "vp8_descriptor_byte0")?;
        let b0 = buf.get_u8();
        let x = b0 & 0x80 != 0;
        let mut descriptor = Vp8PayloadDescriptor {
            non_reference: b0 & 0x20 != 0,
            start_of_partition: b0 & 0x10 != 0,
            partition_index: b0 & 0x0f,
            ..Default::default()
        };

        if x {
            require(buf.remaining(), 1, "vp8_descriptor_ext_byte")?;
            let b1 = buf.get_u8();
            let i = b1 & 0x80 != 0;
            let l = b1 & 0x40 != 0;
            let t = b1 & 0x20 != 0;
            let k = b1 & 0x10 != 0;

            if i {
                require(buf.remaining(), 1, "vp8_picture_id")?;
                let first = buf.get_u8();
                if first & 0x80 != 0 {
                    require(buf.remaining(), 1, "vp8_picture_id_ext")?;
                    let second = buf.get_u8();
                    descriptor.picture_id = Some((((first & 0x7f) as u16) << 8) | second as u16);
                } else {
                    descriptor.picture_id = Some((first & 0x7f) as u16);
                }
            }
            if l {
                require(buf.remaining(), 1, "vp8_tl0_pic_idx")?;
                descriptor.tl0_pic_idx = Some(buf.get_u8());
            }
            if t || k {
                require(buf.remaining(), 1, "vp8_tid_key_idx")?;
                let b = buf.get_u8();
                if t {
                    descriptor.tid = Some(((b >> 6) & 0x3, b & 0x20 != 0));
                }
                if k {
                    descriptor.key_idx = Some(b & 0x1f);
                }
            }
        }

        Ok(descriptor)
    }
}

/// Splits successive VP8 frames into descriptor-prefixed RTP payloads,
/// incrementing `picture_id` once per frame, wrapping at 2^15. The first
/// packet of every frame has `S=1`, `PID=0` as required.
pub struct Vp8Packetizer {
    picture_id: u16,
    use_picture_id: bool,
}

impl Vp8Packetizer {
    pub fn new(use_picture_id: bool) -> Self {
        Vp8Packetizer { picture_id: 0, use_picture_id }
    }

    pub fn packetize(&mut self, frame: &[u8]) -> Result<Vec<Bytes>> {
        let picture_id = self.use_picture_id.then_some(self.picture_id);
        self.picture_id = (self.picture_id + 1) & 0x7fff;

        let mut payloads = Vec::new();
        if frame.is_empty() {
            return Ok(payloads);
        }
        let mut offset = 0;
        let mut first = true;
        while offset < frame.len() {
            let descriptor = Vp8PayloadDescriptor {
                non_reference: false,
                start_of_partition: first,
                partition_index: 0,
                picture_id,
                tl0_pic_idx: None,
                tid: None,
                key_idx: None,
            };
            let header = descriptor.marshal()?;
            let budget = PACKET_MAX.saturating_sub(header.len()).max(1);
            let end = (offset + budget).min(frame.len());

            let mut payload = BytesMut::with_capacity(header.len() + (end - offset));
            payload.extend_from_slice(&header);
            payload.extend_from_slice(&frame[offset..end]);
            payloads.push(payload.freeze());

            offset = end;
            first = false;
        }
        Ok(payloads)
    }
}

/// Strips one packet's VP8 descriptor, returning it alongside the
/// remaining media bytes.
pub fn depacketize(payload: &[u8]) -> Result<(Vp8PayloadDescriptor, Bytes)> {
    let mut buf = Bytes::copy_from_slice(payload);
    let descriptor = Vp8PayloadDescriptor::unmarshal(&mut buf)?;
    Ok((descriptor, buf))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn descriptor_round_trips_without_extension() {
        let d = Vp8PayloadDescriptor { start_of_partition: true, partition_index: 3, ..Default::default() };
        let buf = d.marshal().unwrap();
        let mut b = Bytes::copy_from_slice(&buf);
        assert_eq!(Vp8PayloadDescriptor::unmarshal(&mut b).unwrap(), d);
    }

    #[test]
    fn descriptor_round_trips_with_7bit_picture_id() {
        let d = Vp8PayloadDescriptor { picture_id: Some(42), ..Default::default() };
        let buf = d.marshal().unwrap();
        assert_eq!(buf.len(), 3);
        let mut b = Bytes::copy_from_slice(&buf);
        assert_eq!(Vp8PayloadDescriptor::unmarshal(&mut b).unwrap(), d);
    }

    #[test]
    fn descriptor_round_trips_with_15bit_picture_id_and_tl0() {
        let d = Vp8PayloadDescriptor {
            picture_id: Some(0x1234),
            tl0_pic_idx: Some(7),
            tid: Some((2, true)),
            ..Default::default()
        };
        let buf = d.marshal().unwrap();
        let mut b = Bytes::copy_from_slice(&buf);
        assert_eq!(Vp8PayloadDescriptor::unmarshal(&mut b).unwrap(), d);
    }

    #[test]
    fn first_packet_of_frame_has_start_bit_and_zero_partition() {
        let mut packetizer = Vp8Packetizer::new(true);
        let frame = vec![0xABu8; 10];
        let payloads = packetizer.packetize(&frame).unwrap();
        let (descriptor, _) = depacketize(&payloads[0]).unwrap();
        assert!(descriptor.start_of_partition);
        assert_eq!(descriptor.partition_index, 0);
    }

    #[test]
    fn picture_id_increments_once_per_frame_and_wraps() {
        let mut packetizer = Vp8Packetizer::new(true);
        packetizer.picture_id = 0x7ffe;
        let first = packetizer.packetize(&[1, 2, 3]).unwrap();
        let second = packetizer.packetize(&[4, 5, 6]).unwrap();
        let (d1, _) = depacketize(&first[0]).unwrap();
        let (d2, _) = depacketize(&second[0]).unwrap();
        assert_eq!(d1.picture_id, Some(0x7ffe));
        assert_eq!(d2.picture_id, Some(0x7fff));
    }

    #[test]
    fn large_frame_splits_into_multiple_packets() {
        let mut packetizer = Vp8Packetizer::new(false);
        let frame = vec![0x42u8; PACKET_MAX * 3];
        let payloads = packetizer.packetize(&frame).unwrap();
        assert!(payloads.len() >= 3);
        let mut reassembled = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let (descriptor, chunk) = depacketize(payload).unwrap();
            assert_eq!(descriptor.start_of_partition, i == 0);
            reassembled.extend_from_slice(&chunk);
        }
        assert_eq!(reassembled, frame);
    }
}
