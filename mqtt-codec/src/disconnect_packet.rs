// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::base::{DecodePacket, EncodePacket};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};

/// Graceful client disconnect; no Will message is published afterward
/// [MQTT-3.14.4-3].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DisconnectPacket;

impl DecodePacket for DisconnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Disconnect {
            return Err(DecodeError::UnknownPacketType);
        }
        Ok(DisconnectPacket)
    }
}

impl EncodePacket for DisconnectPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let fixed_header = FixedHeader::new(PacketType::Disconnect, 0)
            .map_err(|_| EncodeError::PayloadTooLong)?;
        fixed_header.encode(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut buf = Vec::new();
        DisconnectPacket.encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0xE0, 0x00]);
        let mut ba = ByteArray::new(&buf);
        assert_eq!(DisconnectPacket::decode(&mut ba).unwrap(), DisconnectPacket);
    }
}
