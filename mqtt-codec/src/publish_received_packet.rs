// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::base::{DecodePacket, EncodePacket, PacketId};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};

/// First half of the QoS 2 handshake: Publisher to Receiver [MQTT-3.5].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PublishReceivedPacket {
    pub packet_id: PacketId,
}

impl PublishReceivedPacket {
    pub fn new(packet_id: PacketId) -> Self {
        PublishReceivedPacket { packet_id }
    }
}

impl DecodePacket for PublishReceivedPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::PublishReceived {
            return Err(DecodeError::UnknownPacketType);
        }
        Ok(PublishReceivedPacket {
            packet_id: ba.read_u16()?,
        })
    }
}

impl EncodePacket for PublishReceivedPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let fixed_header = FixedHeader::new(PacketType::PublishReceived, 2)
            .map_err(|_| EncodeError::PayloadTooLong)?;
        let header_len = fixed_header.encode(v)?;
        v.extend_from_slice(&self.packet_id.to_be_bytes());
        Ok(header_len + 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let packet = PublishReceivedPacket::new(9);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(PublishReceivedPacket::decode(&mut ba).unwrap(), packet);
    }
}
