use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};

/// Number of bytes a type will occupy on the wire.
pub trait MarshalSize {
    fn marshal_size(&self) -> usize;
}

/// Serializes a type into a caller-supplied buffer.
pub trait Marshal: MarshalSize {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize>;

    fn marshal(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::zeroed(self.marshal_size());
        let n = self.marshal_to(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// Parses a type out of a `bytes::Buf`.
pub trait Unmarshal {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf;
}

pub fn require(buf_remaining: usize, need: usize, field: &'static str) -> Result<()> {
    if buf_remaining < need {
        Err(Error::short(field))
    } else {
        Ok(())
    }
}

/// Pads `len` up to the next multiple of 4, as required by RTCP/SCTP framing.
pub fn pad4(len: usize) -> usize {
    len.div_ceil(4) * 4
}
