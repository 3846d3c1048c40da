//! VP9 RTP payload descriptor and packetizer (RFC 9628).
//!
//! The scalability-structure block (`V` bit) describes SVC layer geometry
//! beyond the flat temporal/spatial layer-index descriptor this core
//! exposes; parsing a payload that sets it is out of scope and is reported
//! as [`Error::Unsupported`] rather than silently misparsed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{require, Marshal, MarshalSize, Unmarshal};

use super::PACKET_MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vp9Layer {
    pub temporal_id: u8,
    pub switching_up: bool,
    pub spatial_id: u8,
    pub inter_layer_dependency: bool,
    /// Present iff the descriptor has layer indices and is not in flexible
    /// mode (`L && !F`).
    pub tl0_pic_idx: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vp9PayloadDescriptor {
    pub picture_id: Option<u16>,
    /// `P`: false for a keyframe, true for every inter-predicted frame.
    pub inter_picture_predicted: bool,
    pub layer: Option<Vp9Layer>,
    pub flexible_mode: bool,
    pub begin_frame: bool,
    pub end_frame: bool,
    pub not_reference: bool,
}

impl Vp9PayloadDescriptor {
    fn picture_id_is_extended(&self) -> bool {
        matches!(self.picture_id, Some(id) if id > 0x7f)
    }
}

impl MarshalSize for Vp9PayloadDescriptor {
    fn marshal_size(&self) -> usize {
        let mut size = 1;
        if self.picture_id.is_some() {
            size += if self.picture_id_is_extended() { 2 } else { 1 };
        }
        if let Some(layer) = self.layer {
            size += 1;
            if layer.tl0_pic_idx.is_some() {
                size += 1;
            }
        }
        size
    }
}

impl Marshal for Vp9PayloadDescriptor {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.len() < size {
            return Err(Error::WrongMarshalSize { need: size, have: buf.len() });
        }
        let i = self.picture_id.is_some() as u8;
        let p = self.inter_picture_predicted as u8;
        let l = self.layer.is_some() as u8;
        let f = self.flexible_mode as u8;
        let b = self.begin_frame as u8;
        let e = self.end_frame as u8;
        let z = self.not_reference as u8;
        buf.put_u8((i << 7) | (p << 6) | (l << 5) | (f << 4) | (b << 3) | (e << 2) | z);

        if let Some(id) = self.picture_id {
            if self.picture_id_is_extended() {
                buf.put_u16(0x8000 | id);
            } else {
                buf.put_u8((id & 0x7f) as u8);
            }
        }
        if let Some(layer) = self.layer {
            buf.put_u8(
                ((layer.temporal_id & 0x7) << 5)
                    | ((layer.switching_up as u8) << 4)
                    | ((layer.spatial_id & 0x7) << 1)
                    | (layer.inter_layer_dependency as u8),
            );
            if let Some(idx) = layer.tl0_pic_idx {
                buf.put_u8(idx);
            }
        }
        Ok(size)
    }
}

impl Unmarshal for Vp9PayloadDescriptor {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        require(buf.remaining(), 1, "vp9_descriptor_byte0")?;
        let b0 = buf.get_u8();
        if b0 & 0x02 != 0 {
            return Err(Error::Unsupported("vp9_scalability_structure"));
        }
        let i = b0 & 0x80 != 0;
        let l = b0 & 0x20 != 0;
        let f = b0 & 0x10 != 0;

        let mut descriptor = Vp9PayloadDescriptor {
            inter_picture_predicted: b0 & 0x40 != 0,
            flexible_mode: f,
            begin_frame: b0 & 0x08 != 0,
            end_frame: b0 & 0x04 != 0,
            not_reference: b0 & 0x01 != 0,
            ..Default::default()
        };

        if i {
            require(buf.remaining(), 1, "vp9_picture_id")?;
            let first = buf.get_u8();
            if first & 0x80 != 0 {
                require(buf.remaining(), 1, "vp9_picture_id_ext")?;
                let second = buf.get_u8();
                descriptor.picture_id = Some((((first & 0x7f) as u16) << 8) | second as u16);
            } else {
                descriptor.picture_id = Some((first & 0x7f) as u16);
            }
        }
        if l {
            require(buf.remaining(), 1, "vp9_layer_byte")?;
            let b = buf.get_u8();
            let tl0_pic_idx = if !f {
                require(buf.remaining(), 1, "vp9_tl0_pic_idx")?;
                Some(buf.get_u8())
            } else {
                None
            };
            descriptor.layer = Some(Vp9Layer {
                temporal_id: (b >> 5) & 0x7,
                switching_up: b & 0x10 != 0,
                spatial_id: (b >> 1) & 0x7,
                inter_layer_dependency: b & 0x01 != 0,
                tl0_pic_idx,
            });
        }

        Ok(descriptor)
    }
}

/// Fragments VP9 frames into descriptor-prefixed RTP payloads, tracking the
/// `P` (inter-picture-predicted) flag across frames: it is false only for
/// the very next frame after construction or after [`Self::force_keyframe`]
/// is called.
pub struct Vp9Packetizer {
    picture_id: u16,
    use_picture_id: bool,
    next_is_keyframe: bool,
}

impl Vp9Packetizer {
    pub fn new(use_picture_id: bool) -> Self {
        Vp9Packetizer { picture_id: 0, use_picture_id, next_is_keyframe: true }
    }

    pub fn force_keyframe(&mut self) {
        self.next_is_keyframe = true;
    }

    pub fn packetize(&mut self, frame: &[u8]) -> Result<Vec<Bytes>> {
        let picture_id = self.use_picture_id.then_some(self.picture_id);
        self.picture_id = (self.picture_id + 1) & 0x7fff;
        let inter_picture_predicted = !self.next_is_keyframe;
        self.next_is_keyframe = false;

        let mut payloads = Vec::new();
        if frame.is_empty() {
            return Ok(payloads);
        }
        let mut offset = 0;
        while offset < frame.len() {
            let descriptor = Vp9PayloadDescriptor {
                picture_id,
                inter_picture_predicted,
                layer: None,
                flexible_mode: false,
                begin_frame: offset == 0,
                end_frame: false,
                not_reference: false,
            };
            let header_size = descriptor.marshal_size();
            let budget = PACKET_MAX.saturating_sub(header_size).max(1);
            let end = (offset + budget).min(frame.len());
            let descriptor = Vp9PayloadDescriptor { end_frame: end == frame.len(), ..descriptor };
            let header = descriptor.marshal()?;

            let mut payload = BytesMut::with_capacity(header.len() + (end - offset));
            payload.extend_from_slice(&header);
            payload.extend_from_slice(&frame[offset..end]);
            payloads.push(payload.freeze());
            offset = end;
        }
        Ok(payloads)
    }
}

pub fn depacketize(payload: &[u8]) -> Result<(Vp9PayloadDescriptor, Bytes)> {
    let mut buf = Bytes::copy_from_slice(payload);
    let descriptor = Vp9PayloadDescriptor::unmarshal(&mut buf)?;
    Ok((descriptor, buf))
}
