//! Data Channel Establishment Protocol (RFC 8832), carried as PPID 50
//! messages over the data channel's own stream.

use bytes::{Buf, BufMut};
use rtc_shared::error::{Error, Result};
use rtc_shared::marshal::{Marshal, MarshalSize, Unmarshal};

const MESSAGE_TYPE_LEN: usize = 1;

mod message_type {
    pub const DATA_CHANNEL_ACK: u8 = 2;
    pub const DATA_CHANNEL_OPEN: u8 = 3;
}

/// `channel_type` byte of a DATA_CHANNEL_OPEN message (RFC 8832 §8.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Reliable,
    ReliableUnordered,
    PartialReliableRexmit,
    PartialReliableRexmitUnordered,
    PartialReliableTimed,
    PartialReliableTimedUnordered,
}

impl ChannelType {
    fn to_byte(self) -> u8 {
        match self {
            ChannelType::Reliable => 0x00,
            ChannelType::ReliableUnordered => 0x80,
            ChannelType::PartialReliableRexmit => 0x01,
            ChannelType::PartialReliableRexmitUnordered => 0x81,
            ChannelType::PartialReliableTimed => 0x02,
            ChannelType::PartialReliableTimedUnordered => 0x82,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0x00 => ChannelType::Reliable,
            0x80 => ChannelType::ReliableUnordered,
            0x01 => ChannelType::PartialReliableRexmit,
            0x81 => ChannelType::PartialReliableRexmitUnordered,
            0x02 => ChannelType::PartialReliableTimed,
            0x82 => ChannelType::PartialReliableTimedUnordered,
            _ => return Err(Error::Unsupported("dcep_channel_type")),
        })
    }

    pub fn ordered(self) -> bool {
        !matches!(
            self,
            ChannelType::ReliableUnordered | ChannelType::PartialReliableRexmitUnordered | ChannelType::PartialReliableTimedUnordered
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelOpen {
    pub channel_type: ChannelType,
    pub priority: u16,
    pub reliability_parameter: u32,
    pub label: String,
    pub protocol: String,
}

impl MarshalSize for DataChannelOpen {
    fn marshal_size(&self) -> usize {
        MESSAGE_TYPE_LEN + 1 + 2 + 4 + 2 + 2 + self.label.len() + self.protocol.len()
    }
}

impl Marshal for DataChannelOpen {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.len() < size {
            return Err(Error::WrongMarshalSize { need: size, have: buf.len() });
        }
        buf.put_u8(message_type::DATA_CHANNEL_OPEN);
        buf.put_u8(self.channel_type.to_byte());
        buf.put_u16(self.priority);
        buf.put_u32(self.reliability_parameter);
        buf.put_u16(self.label.len() as u16);
        buf.put_u16(self.protocol.len() as u16);
        buf.put_slice(self.label.as_bytes());
        buf.put_slice(self.protocol.as_bytes());
        Ok(size)
    }
}

impl DataChannelOpen {
    fn parse_body<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 11 {
            return Err(Error::short("dcep_open_header"));
        }
        let channel_type = ChannelType::from_byte(buf.get_u8())?;
        let priority = buf.get_u16();
        let reliability_parameter = buf.get_u32();
        let label_len = buf.get_u16() as usize;
        let protocol_len = buf.get_u16() as usize;
        if buf.remaining() < label_len + protocol_len {
            return Err(Error::short("dcep_open_strings"));
        }
        let mut label_bytes = vec![0u8; label_len];
        buf.copy_to_slice(&mut label_bytes);
        let mut protocol_bytes = vec![0u8; protocol_len];
        buf.copy_to_slice(&mut protocol_bytes);
        let label = String::from_utf8(label_bytes).map_err(|_| Error::short("dcep_open_label_utf8"))?;
        let protocol = String::from_utf8(protocol_bytes).map_err(|_| Error::short("dcep_open_protocol_utf8"))?;
        Ok(DataChannelOpen { channel_type, priority, reliability_parameter, label, protocol })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChannelAck;

impl MarshalSize for DataChannelAck {
    fn marshal_size(&self) -> usize {
        MESSAGE_TYPE_LEN
    }
}

impl Marshal for DataChannelAck {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.len() < MESSAGE_TYPE_LEN {
            return Err(Error::WrongMarshalSize { need: MESSAGE_TYPE_LEN, have: buf.len() });
        }
        buf.put_u8(message_type::DATA_CHANNEL_ACK);
        Ok(MESSAGE_TYPE_LEN)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Open(DataChannelOpen),
    Ack,
}

impl Unmarshal for Message {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < MESSAGE_TYPE_LEN {
            return Err(Error::short("dcep_message_type"));
        }
        match buf.get_u8() {
            message_type::DATA_CHANNEL_OPEN => Ok(Message::Open(DataChannelOpen::parse_body(buf)?)),
            message_type::DATA_CHANNEL_ACK => Ok(Message::Ack),
            _ => Err(Error::Unsupported("dcep_message_type")),
        }
    }
}

impl Message {
    pub fn marshal(&self) -> Result<bytes::BytesMut> {
        match self {
            Message::Open(open) => open.marshal(),
            Message::Ack => DataChannelAck.marshal(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_round_trips() {
        let open = DataChannelOpen {
            channel_type: ChannelType::Reliable,
            priority: 0,
            reliability_parameter: 0,
            label: "chat".to_string(),
            protocol: String::new(),
        };
        let mut buf = open.marshal().unwrap();
        let parsed = Message::unmarshal(&mut buf).unwrap();
        assert_eq!(parsed, Message::Open(open));
    }

    #[test]
    fn ack_round_trips() {
        let mut buf = Message::Ack.marshal().unwrap();
        assert_eq!(Message::unmarshal(&mut buf).unwrap(), Message::Ack);
    }

    #[test]
    fn unordered_partial_reliable_rexmit_byte() {
        assert_eq!(ChannelType::PartialReliableRexmitUnordered.to_byte(), 0x81);
        assert!(!ChannelType::PartialReliableRexmitUnordered.ordered());
    }
}
