// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::base::{DecodePacket, EncodePacket, PacketId, QoS};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};
use crate::topic::Topic;
use crate::utils;

#[derive(Clone, Debug, PartialEq)]
pub struct PublishPacket {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// `None` for QoS 0, where no packet identifier is present on the wire
    /// [MQTT-2.3.1-5].
    pub packet_id: Option<PacketId>,
    pub payload: Vec<u8>,
}

impl PublishPacket {
    pub fn new(topic: &str, qos: QoS, payload: Vec<u8>) -> Result<Self, EncodeError> {
        Topic::validate_pub_topic(topic).map_err(|_| EncodeError::InvalidUtf8String)?;
        Ok(PublishPacket {
            dup: false,
            qos,
            retain: false,
            topic: topic.to_string(),
            packet_id: None,
            payload,
        })
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        let (dup, qos, retain) = match fixed_header.packet_type() {
            PacketType::Publish { dup, qos, retain } => (dup, qos, retain),
            _ => return Err(DecodeError::UnknownPacketType),
        };

        let remaining_before = ba.remaining_bytes();
        let topic_len = ba.read_u16()? as usize;
        let topic = ba.read_string(topic_len)?;
        Topic::validate_pub_topic(&topic)?;

        // Packet Identifier field only present for QoS 1/2 [MQTT-2.3.1-1].
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(ba.read_u16()?)
        };

        let consumed = remaining_before - ba.remaining_bytes();
        let payload_len = (fixed_header.remaining_length() as usize)
            .checked_sub(consumed)
            .ok_or(DecodeError::InvalidRemainingLength)?;
        let payload = ba.read_bytes(payload_len)?.to_vec();

        Ok(PublishPacket {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        utils::validate_two_bytes_data(self.topic.as_bytes())?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&(self.topic.len() as u16).to_be_bytes());
        payload.extend_from_slice(self.topic.as_bytes());
        if self.qos != QoS::AtMostOnce {
            let packet_id = self.packet_id.ok_or(EncodeError::InvalidUtf8String)?;
            payload.extend_from_slice(&packet_id.to_be_bytes());
        }
        payload.extend_from_slice(&self.payload);

        let packet_type = PacketType::Publish {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
        };
        let fixed_header =
            FixedHeader::new(packet_type, payload.len()).map_err(|_| EncodeError::PayloadTooLong)?;
        let header_len = fixed_header.encode(v)?;
        v.extend_from_slice(&payload);
        Ok(header_len + payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_qos0_without_packet_id() {
        let packet = PublishPacket::new("a/b", QoS::AtMostOnce, b"hi".to_vec()).unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.packet_id, None);
        assert_eq!(decoded.payload, b"hi");
    }

    #[test]
    fn round_trips_qos1_with_packet_id() {
        let mut packet = PublishPacket::new("a/b", QoS::AtLeastOnce, b"hi".to_vec()).unwrap();
        packet.packet_id = Some(42);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.packet_id, Some(42));
    }

    #[test]
    fn publish_topic_with_wildcard_rejected_on_construction() {
        assert!(PublishPacket::new("a/+", QoS::AtMostOnce, vec![]).is_err());
    }
}
