// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::base::{DecodePacket, EncodePacket, PacketId};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};

/// Second half of the QoS 2 handshake: Receiver to Publisher [MQTT-3.6].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PublishReleasePacket {
    pub packet_id: PacketId,
}

impl PublishReleasePacket {
    pub fn new(packet_id: PacketId) -> Self {
        PublishReleasePacket { packet_id }
    }
}

impl DecodePacket for PublishReleasePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::PublishRelease {
            return Err(DecodeError::UnknownPacketType);
        }
        Ok(PublishReleasePacket {
            packet_id: ba.read_u16()?,
        })
    }
}

impl EncodePacket for PublishReleasePacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let fixed_header = FixedHeader::new(PacketType::PublishRelease, 2)
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
        let packet = PublishReleasePacket::new(11);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(PublishReleasePacket::decode(&mut ba).unwrap(), packet);
    }

    #[test]
    fn fixed_header_carries_mandatory_flag_bits() {
        let packet = PublishReleasePacket::new(1);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0b0110_0010);
    }
}
