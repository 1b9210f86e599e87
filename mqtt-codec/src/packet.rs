// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::base::{DecodePacket, EncodePacket};
use crate::byte_array::ByteArray;
use crate::connect_ack_packet::ConnectAckPacket;
use crate::connect_packet::ConnectPacket;
use crate::disconnect_packet::DisconnectPacket;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType, MAX_REMAINING_LENGTH};
use crate::ping_request_packet::PingRequestPacket;
use crate::ping_response_packet::PingResponsePacket;
use crate::publish_ack_packet::PublishAckPacket;
use crate::publish_complete_packet::PublishCompletePacket;
use crate::publish_packet::PublishPacket;
use crate::publish_received_packet::PublishReceivedPacket;
use crate::publish_release_packet::PublishReleasePacket;
use crate::subscribe_ack_packet::SubscribeAckPacket;
use crate::subscribe_packet::SubscribePacket;
use crate::unsubscribe_ack_packet::UnsubscribeAckPacket;
use crate::unsubscribe_packet::UnsubscribePacket;

/// Union of every MQTT 3.1.1 control packet this crate understands.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    Subscribe(SubscribePacket),
    SubscribeAck(SubscribeAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingRequest(PingRequestPacket),
    PingResponse(PingResponsePacket),
    Disconnect(DisconnectPacket),
}

impl Packet {
    /// Decode one complete packet from the front of `data`. Unlike the
    /// individual packet types' `decode`, the fixed header is peeked first
    /// so the right variant's decoder can be dispatched to.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut peek = ByteArray::new(data);
        let fixed_header = FixedHeader::decode(&mut peek)?;

        let mut ba = ByteArray::new(data);
        Ok(match fixed_header.packet_type() {
            PacketType::Connect => Packet::Connect(ConnectPacket::decode(&mut ba)?),
            PacketType::ConnectAck => Packet::ConnectAck(ConnectAckPacket::decode(&mut ba)?),
            PacketType::Publish { .. } => Packet::Publish(PublishPacket::decode(&mut ba)?),
            PacketType::PublishAck => Packet::PublishAck(PublishAckPacket::decode(&mut ba)?),
            PacketType::PublishReceived => {
                Packet::PublishReceived(PublishReceivedPacket::decode(&mut ba)?)
            }
            PacketType::PublishRelease => {
                Packet::PublishRelease(PublishReleasePacket::decode(&mut ba)?)
            }
            PacketType::PublishComplete => {
                Packet::PublishComplete(PublishCompletePacket::decode(&mut ba)?)
            }
            PacketType::Subscribe => Packet::Subscribe(SubscribePacket::decode(&mut ba)?),
            PacketType::SubscribeAck => Packet::SubscribeAck(SubscribeAckPacket::decode(&mut ba)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(UnsubscribePacket::decode(&mut ba)?),
            PacketType::UnsubscribeAck => {
                Packet::UnsubscribeAck(UnsubscribeAckPacket::decode(&mut ba)?)
            }
            PacketType::PingRequest => Packet::PingRequest(PingRequestPacket::decode(&mut ba)?),
            PacketType::PingResponse => Packet::PingResponse(PingResponsePacket::decode(&mut ba)?),
            PacketType::Disconnect => Packet::Disconnect(DisconnectPacket::decode(&mut ba)?),
        })
    }

    pub fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Packet::Connect(p) => p.encode(v),
            Packet::ConnectAck(p) => p.encode(v),
            Packet::Publish(p) => p.encode(v),
            Packet::PublishAck(p) => p.encode(v),
            Packet::PublishReceived(p) => p.encode(v),
            Packet::PublishRelease(p) => p.encode(v),
            Packet::PublishComplete(p) => p.encode(v),
            Packet::Subscribe(p) => p.encode(v),
            Packet::SubscribeAck(p) => p.encode(v),
            Packet::Unsubscribe(p) => p.encode(v),
            Packet::UnsubscribeAck(p) => p.encode(v),
            Packet::PingRequest(p) => p.encode(v),
            Packet::PingResponse(p) => p.encode(v),
            Packet::Disconnect(p) => p.encode(v),
        }
    }
}

/// Accumulates bytes off the wire and slices out complete packets.
///
/// Wraps the raw `Remaining Length` parsing so callers that read from a
/// stream (not a pre-framed buffer) don't need to re-implement the varint
/// peek themselves. `next_frame` enforces `max_packet_size` itself rather
/// than waiting for `Packet::decode` to do it, so an oversized frame is
/// rejected before the rest of its (possibly huge) payload has even
/// arrived.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Framer { buf: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame's bytes, if the buffer holds one,
    /// draining them (and the header) from the internal buffer.
    pub fn next_frame(&mut self, max_packet_size: u32) -> Result<Option<Vec<u8>>, DecodeError> {
        let mut ba = ByteArray::new(&self.buf);
        let fixed_header = match FixedHeader::decode(&mut ba) {
            Ok(header) => header,
            Err(DecodeError::BufferUnderflow) => return Ok(None),
            Err(e) => return Err(e),
        };

        let remaining_length = fixed_header.remaining_length();
        let cap = max_packet_size.min(MAX_REMAINING_LENGTH);
        if remaining_length > cap {
            return Err(DecodeError::RemainingLengthExceeded);
        }

        let header_len = ba.offset();
        let frame_len = header_len + remaining_length as usize;
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let frame = self.buf[..frame_len].to_vec();
        self.buf.drain(..frame_len);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::QoS;

    #[test]
    fn packet_enum_round_trips_publish() {
        let publish = PublishPacket::new("a/b", QoS::AtMostOnce, b"hi".to_vec()).unwrap();
        let packet = Packet::Publish(publish);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(Packet::decode(&buf).unwrap(), packet);
    }

    #[test]
    fn framer_waits_for_a_complete_frame() {
        let mut framer = Framer::new();
        framer.push(&[0xC0]);
        assert!(framer.next_frame(1024).unwrap().is_none());
        framer.push(&[0x00]);
        let frame = framer.next_frame(1024).unwrap().unwrap();
        assert_eq!(frame, vec![0xC0, 0x00]);
    }

    #[test]
    fn framer_rejects_oversized_frame_before_buffering_payload() {
        let mut framer = Framer::new();
        // Publish with remaining length 200 but max_packet_size capped at 10.
        framer.push(&[0x30, 0xC8, 0x01]);
        assert_eq!(
            framer.next_frame(10),
            Err(DecodeError::RemainingLengthExceeded)
        );
    }

    #[test]
    fn malformed_connack_rejects_out_of_range_return_code() {
        let buf = [0x20, 0x02, 0x00, 0xFF];
        assert!(matches!(
            Packet::decode(&buf),
            Err(DecodeError::InvalidReturnCode)
        ));
    }
}
