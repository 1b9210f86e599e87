// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! `MqttSessionSettings`, the sole knob surface of this crate.
//!
//! Parsing a settings file from disk is the embedding application's job
//! (config-file parsing is out of scope, `spec.md` §1); this struct is
//! just the `serde`-deserializable contract, mirroring how `hebo`'s
//! `config` module shapes its own section structs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one `ClientSession` or `ServerSession`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSessionSettings {
    /// Frame-size cap shared with the codec's `Framer`; violations fail
    /// the event flow with `DecodeError::RemainingLengthExceeded`.
    pub max_packet_size: u32,

    /// Bound on the outbound byte channel on the client side.
    pub client_send_buffer_size: usize,

    /// Bound on the outbound byte channel on the server side, and on the
    /// `watch_client_sessions()` termination broadcast.
    pub server_send_buffer_size: usize,

    /// Concurrency bound on in-flight application Commands; realized as
    /// the capacity of the command channel (`spec.md` §5, `commandParallelism`
    /// requires `>= 2`).
    pub command_parallelism: usize,

    /// Concurrency bound on in-flight application Events.
    pub event_parallelism: usize,

    /// Reply timeout for intra-engine asks.
    pub actor_mqtt_session_timeout: Duration,

    /// QoS 1/2 Producer timeout waiting for `PubAck`/`PubRec`.
    pub producer_pub_ack_rec_timeout: Duration,

    /// QoS 2 Producer timeout waiting for `PubComp`.
    pub producer_pub_comp_timeout: Duration,

    /// QoS 1/2 Consumer timeout waiting for the application to ack.
    pub consumer_pub_ack_rec_timeout: Duration,

    /// QoS 2 Consumer timeout waiting for `PubRel`.
    pub consumer_pub_rel_timeout: Duration,

    /// QoS 2 Consumer timeout waiting for the application's local
    /// `PubComp`.
    pub consumer_pub_comp_timeout: Duration,

    /// Server-side deadline for receiving `Connect` after transport
    /// accept.
    pub receive_connect_timeout: Duration,

    /// Client-side deadline for receiving `ConnAck` after sending
    /// `Connect`.
    pub receive_connack_timeout: Duration,

    /// Capacity of each `watch_client_sessions()` subscriber queue; once
    /// full, the *newest* `ClientSessionTerminated` notice is dropped
    /// (`spec.md` §9 Open Question, resolved in `DESIGN.md`).
    pub client_termination_watcher_buffer_size: usize,

    /// Maximum DUP retransmit attempts before a Producer exchange gives
    /// up and signals `ExchangeAbandoned` (`spec.md` §4.3).
    pub max_retransmit_attempts: u32,
}

impl MqttSessionSettings {
    fn default_max_packet_size() -> u32 {
        mqtt_codec::MAX_REMAINING_LENGTH
    }
}

impl Default for MqttSessionSettings {
    fn default() -> Self {
        MqttSessionSettings {
            max_packet_size: Self::default_max_packet_size(),
            client_send_buffer_size: 16,
            server_send_buffer_size: 64,
            command_parallelism: 4,
            event_parallelism: 4,
            actor_mqtt_session_timeout: Duration::from_secs(5),
            producer_pub_ack_rec_timeout: Duration::from_secs(10),
            producer_pub_comp_timeout: Duration::from_secs(10),
            consumer_pub_ack_rec_timeout: Duration::from_secs(20),
            consumer_pub_rel_timeout: Duration::from_secs(20),
            consumer_pub_comp_timeout: Duration::from_secs(20),
            receive_connect_timeout: Duration::from_secs(10),
            receive_connack_timeout: Duration::from_secs(10),
            client_termination_watcher_buffer_size: 32,
            max_retransmit_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parallelism_default_satisfies_the_minimum() {
        assert!(MqttSessionSettings::default().command_parallelism >= 2);
    }

    #[test]
    fn max_packet_size_defaults_to_the_protocol_ceiling() {
        assert_eq!(
            MqttSessionSettings::default().max_packet_size,
            mqtt_codec::MAX_REMAINING_LENGTH
        );
    }
}
