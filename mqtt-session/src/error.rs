// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt;

use mqtt_codec::{DecodeError, EncodeError};

/// Represents the types of errors the session engine raises.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Packet decode error surfaced to the application on the event flow.
    DecodeError,

    /// Packet encode error, e.g. a reserved flag or oversized payload.
    EncodeError,

    /// No packet id is currently free in `1..=65535` [`spec.md` §4.2].
    NoPacketIdsAvailable,

    /// A remote-allocated packet id collided with one already in flight.
    DuplicateRemotePacketId,

    /// An ack referenced a packet id with no matching exchange.
    UnknownPacketId,

    /// A command was submitted while the connector is not in a state that
    /// accepts it (e.g. `Publish` before `Connect`/`ConnAck`).
    IllegalCommand,

    /// A packet arrived that the role never expects to receive (e.g. a
    /// client receiving a Connect, or a server receiving a ConnAck).
    IllegalProtocolEvent,

    /// ConnAck carried a return code other than `Accepted`.
    ConnectionRefused,

    /// No PingResp arrived within the keep-alive grace period.
    PingFailed,

    /// An intra-engine ask did not receive a reply within
    /// `actor_mqtt_session_timeout`.
    AskTimeout,

    /// The transport (or its owning task) went away.
    ConnectionLost,

    /// `Session::shutdown()` was called; the session rejects new commands.
    ShuttingDown,
}

#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::new(ErrorKind::DecodeError, err.to_string())
    }
}

impl From<EncodeError> for Error {
    fn from(err: EncodeError) -> Self {
        Error::new(ErrorKind::EncodeError, err.to_string())
    }
}
