// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::base::{DecodePacket, EncodePacket, PacketId};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};

/// Per-topic-filter grant or failure in a SubAck packet [MQTT-3.9.3].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscribeAck {
    QoS0,
    QoS1,
    QoS2,
    Failure,
}

impl From<SubscribeAck> for u8 {
    fn from(ack: SubscribeAck) -> u8 {
        match ack {
            SubscribeAck::QoS0 => 0,
            SubscribeAck::QoS1 => 1,
            SubscribeAck::QoS2 => 2,
            SubscribeAck::Failure => 0x80,
        }
    }
}

impl TryFrom<u8> for SubscribeAck {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<SubscribeAck, Self::Error> {
        match v {
            0 => Ok(SubscribeAck::QoS0),
            1 => Ok(SubscribeAck::QoS1),
            2 => Ok(SubscribeAck::QoS2),
            0x80 => Ok(SubscribeAck::Failure),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubscribeAckPacket {
    pub packet_id: PacketId,
    pub acks: Vec<SubscribeAck>,
}

impl SubscribeAckPacket {
    pub fn new(packet_id: PacketId, acks: Vec<SubscribeAck>) -> Self {
        SubscribeAckPacket { packet_id, acks }
    }
}

impl DecodePacket for SubscribeAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::SubscribeAck {
            return Err(DecodeError::UnknownPacketType);
        }
        let packet_id = ba.read_u16()?;
        let ack_count = (fixed_header.remaining_length() as usize).saturating_sub(2);
        let mut acks = Vec::with_capacity(ack_count);
        for _ in 0..ack_count {
            acks.push(SubscribeAck::try_from(ba.read_byte()?)?);
        }
        Ok(SubscribeAckPacket { packet_id, acks })
    }
}

impl EncodePacket for SubscribeAckPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&self.packet_id.to_be_bytes());
        for ack in &self.acks {
            payload.push((*ack).into());
        }
        let fixed_header = FixedHeader::new(PacketType::SubscribeAck, payload.len())
            .map_err(|_| EncodeError::PayloadTooLong)?;
        let header_len = fixed_header.encode(v)?;
        v.extend_from_slice(&payload);
        Ok(header_len + payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_acks() {
        let packet = SubscribeAckPacket::new(
            8,
            vec![SubscribeAck::QoS1, SubscribeAck::Failure, SubscribeAck::QoS2],
        );
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(SubscribeAckPacket::decode(&mut ba).unwrap(), packet);
    }
}
