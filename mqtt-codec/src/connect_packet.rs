// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::base::{DecodePacket, EncodePacket, ProtocolLevel, QoS};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};
use crate::topic::Topic;
use crate::utils;

const PROTOCOL_NAME: &str = "MQTT";

/// Connect flags byte, bit 0 is reserved and must be 0 [MQTT-3.1.2-3].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnectFlags {
    pub username: bool,
    pub password: bool,
    pub will_retain: bool,
    pub will_qos: QoS,
    pub will: bool,
    pub clean_session: bool,
}

impl DecodePacket for ConnectFlags {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flags = ba.read_byte()?;
        if flags & 0b0000_0001 != 0 {
            return Err(DecodeError::InvalidConnectFlag);
        }
        let will = flags & 0b0000_0100 != 0;
        let will_qos = QoS::try_from((flags & 0b0001_1000) >> 3)?;
        let will_retain = flags & 0b0010_0000 != 0;
        let password = flags & 0b0100_0000 != 0;
        let username = flags & 0b1000_0000 != 0;
        let clean_session = flags & 0b0000_0010 != 0;

        // Will Retain/QoS MUST be 0 if Will flag is 0 [MQTT-3.1.2-11].
        if !will && (will_retain || will_qos != QoS::AtMostOnce) {
            return Err(DecodeError::InvalidConnectFlag);
        }
        // Password flag MUST be 0 if Username flag is 0 [MQTT-3.1.2-22].
        if password && !username {
            return Err(DecodeError::InvalidConnectFlag);
        }

        Ok(ConnectFlags {
            username,
            password,
            will_retain,
            will_qos,
            will,
            clean_session,
        })
    }
}

impl EncodePacket for ConnectFlags {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let mut flags: u8 = 0;
        if self.clean_session {
            flags |= 0b0000_0010;
        }
        if self.will {
            flags |= 0b0000_0100;
        }
        flags |= (self.will_qos as u8) << 3;
        if self.will_retain {
            flags |= 0b0010_0000;
        }
        if self.password {
            flags |= 0b0100_0000;
        }
        if self.username {
            flags |= 0b1000_0000;
        }
        v.push(flags);
        Ok(1)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectPacket {
    pub protocol_level: u8,
    pub connect_flags: ConnectFlags,
    pub keep_alive: u16,
    pub client_id: String,
    pub will_topic: Option<String>,
    pub will_message: Option<Vec<u8>>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl ConnectPacket {
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        utils::validate_client_id(client_id).map_err(|_| EncodeError::InvalidClientId)?;
        Ok(ConnectPacket {
            protocol_level: 4,
            connect_flags: ConnectFlags {
                clean_session: true,
                ..ConnectFlags::default()
            },
            keep_alive: 60,
            client_id: client_id.to_string(),
            will_topic: None,
            will_message: None,
            username: None,
            password: None,
        })
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::UnknownPacketType);
        }

        let protocol_name_len = ba.read_u16()? as usize;
        let protocol_name = ba.read_string(protocol_name_len)?;
        if protocol_name != PROTOCOL_NAME {
            return Err(DecodeError::BadProtocolName);
        }

        let protocol_level = ba.read_byte()?;
        let _ = ProtocolLevel::try_from(protocol_level)?;

        let connect_flags = ConnectFlags::decode(ba)?;
        let keep_alive = ba.read_u16()?;

        let client_id_len = ba.read_u16()? as usize;
        let client_id = ba.read_string(client_id_len)?;
        // Zero-byte client_id is only valid when clean_session is set
        // [MQTT-3.1.3-7].
        if client_id.is_empty() && !connect_flags.clean_session {
            return Err(DecodeError::InvalidClientId);
        }
        utils::validate_client_id(&client_id)?;

        let mut will_topic = None;
        let mut will_message = None;
        if connect_flags.will {
            let topic_len = ba.read_u16()? as usize;
            let topic = ba.read_string(topic_len)?;
            Topic::validate_pub_topic(&topic)?;
            will_topic = Some(topic);

            let message_len = ba.read_u16()? as usize;
            will_message = Some(ba.read_bytes(message_len)?.to_vec());
        }

        let mut username = None;
        if connect_flags.username {
            let len = ba.read_u16()? as usize;
            username = Some(ba.read_string(len)?);
        }

        let mut password = None;
        if connect_flags.password {
            let len = ba.read_u16()? as usize;
            password = Some(ba.read_bytes(len)?.to_vec());
        }

        Ok(ConnectPacket {
            protocol_level,
            connect_flags,
            keep_alive,
            client_id,
            will_topic,
            will_message,
            username,
            password,
        })
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        utils::validate_two_bytes_data(self.client_id.as_bytes())?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&(PROTOCOL_NAME.len() as u16).to_be_bytes());
        payload.extend_from_slice(PROTOCOL_NAME.as_bytes());
        payload.push(self.protocol_level);
        self.connect_flags.encode(&mut payload)?;
        payload.extend_from_slice(&self.keep_alive.to_be_bytes());
        payload.extend_from_slice(&(self.client_id.len() as u16).to_be_bytes());
        payload.extend_from_slice(self.client_id.as_bytes());

        if self.connect_flags.will {
            let topic = self.will_topic.as_deref().unwrap_or_default();
            payload.extend_from_slice(&(topic.len() as u16).to_be_bytes());
            payload.extend_from_slice(topic.as_bytes());
            let message = self.will_message.as_deref().unwrap_or_default();
            payload.extend_from_slice(&(message.len() as u16).to_be_bytes());
            payload.extend_from_slice(message);
        }
        if let Some(username) = &self.username {
            payload.extend_from_slice(&(username.len() as u16).to_be_bytes());
            payload.extend_from_slice(username.as_bytes());
        }
        if let Some(password) = &self.password {
            payload.extend_from_slice(&(password.len() as u16).to_be_bytes());
            payload.extend_from_slice(password);
        }

        let fixed_header = FixedHeader::new(PacketType::Connect, payload.len())
            .map_err(|_| EncodeError::PayloadTooLong)?;
        let header_len = fixed_header.encode(v)?;
        v.extend_from_slice(&payload);
        Ok(header_len + payload.len())
    }
}
