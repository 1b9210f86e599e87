// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use tokio::time::{Duration, Instant};

use mqtt_codec::ConnectReturnCode;

use crate::error::{Error, ErrorKind};

/// Client-side connection lifecycle (`spec.md` §4.4 `ClientConnector`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientConnectorState {
    Disconnected,
    ConnectSent,
    Connected,
    Disconnecting,
}

pub struct ClientConnector {
    pub state: ClientConnectorState,
    pub clean_session: bool,
    keepalive: Duration,
    last_send_at: Instant,
    ping_outstanding: bool,
    connack_deadline: Option<Instant>,
    ping_deadline: Option<Instant>,
}

impl ClientConnector {
    pub fn new() -> Self {
        ClientConnector {
            state: ClientConnectorState::Disconnected,
            clean_session: true,
            keepalive: Duration::from_secs(60),
            last_send_at: Instant::now(),
            ping_outstanding: false,
            connack_deadline: None,
            ping_deadline: None,
        }
    }

    /// `Connect` command accepted; starts the ConnAck deadline.
    pub fn on_connect_sent(
        &mut self,
        clean_session: bool,
        keepalive_seconds: u16,
        connack_timeout: Duration,
    ) -> Result<(), Error> {
        if self.state != ClientConnectorState::Disconnected {
            return Err(Error::new(
                ErrorKind::IllegalCommand,
                "Connect may only be sent while Disconnected",
            ));
        }
        self.clean_session = clean_session;
        self.keepalive = if keepalive_seconds == 0 {
            Duration::from_secs(0)
        } else {
            Duration::from_secs(u64::from(keepalive_seconds))
        };
        self.state = ClientConnectorState::ConnectSent;
        self.last_send_at = Instant::now();
        self.connack_deadline = Some(Instant::now() + connack_timeout);
        Ok(())
    }

    /// `ConnAck` arrived. `Ok(())` enters `Connected`; `Err` carries the
    /// refusal return code and the connector returns to `Disconnected`.
    pub fn on_conn_ack(&mut self, return_code: ConnectReturnCode) -> Result<(), Error> {
        if self.state != ClientConnectorState::ConnectSent {
            return Err(Error::new(
                ErrorKind::IllegalProtocolEvent,
                "ConnAck received outside of ConnectSent",
            ));
        }
        self.connack_deadline = None;
        if return_code == ConnectReturnCode::Accepted {
            self.state = ClientConnectorState::Connected;
            Ok(())
        } else {
            self.state = ClientConnectorState::Disconnected;
            Err(Error::new(
                ErrorKind::ConnectionRefused,
                format!("server refused connection: {return_code:?}"),
            ))
        }
    }

    pub fn note_outbound_sent(&mut self) {
        self.last_send_at = Instant::now();
    }

    /// `true` once `keepalive` has elapsed with no outbound traffic; the
    /// caller should then send `PingReq` and call `on_ping_sent`.
    pub fn should_ping(&self) -> bool {
        self.state == ClientConnectorState::Connected
            && !self.keepalive.is_zero()
            && !self.ping_outstanding
            && self.last_send_at.elapsed() >= self.keepalive
    }

    pub fn next_keepalive_deadline(&self) -> Option<Instant> {
        if self.state != ClientConnectorState::Connected || self.keepalive.is_zero() {
            return None;
        }
        Some(self.last_send_at + self.keepalive)
    }

    pub fn on_ping_sent(&mut self, ping_resp_timeout: Duration) {
        self.ping_outstanding = true;
        self.ping_deadline = Some(Instant::now() + ping_resp_timeout);
        self.note_outbound_sent();
    }

    pub fn on_ping_resp(&mut self) -> Result<(), Error> {
        if !self.ping_outstanding {
            return Err(Error::new(
                ErrorKind::IllegalProtocolEvent,
                "PingResp received without an outstanding PingReq",
            ));
        }
        self.ping_outstanding = false;
        self.ping_deadline = None;
        Ok(())
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_outstanding
    }

    pub fn ping_deadline(&self) -> Option<Instant> {
        self.ping_deadline
    }

    /// `true` once `ping_deadline` has elapsed with no `PingResp`
    /// (`spec.md` §4.4 `PingFailed`).
    pub fn is_ping_failed(&self) -> bool {
        self.ping_deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn on_disconnect_sent(&mut self) {
        self.state = ClientConnectorState::Disconnecting;
    }

    /// Transport loss detected (`ConnectionLost`, `spec.md` §4.4). Returns
    /// `true` if the caller should discard in-flight exchanges (clean
    /// session), `false` if they should be retained for the next
    /// transport.
    pub fn on_connection_lost(&mut self) -> bool {
        self.state = ClientConnectorState::Disconnected;
        self.ping_outstanding = false;
        self.connack_deadline = None;
        self.ping_deadline = None;
        self.clean_session
    }
}

impl Default for ClientConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_connack_enters_connected() {
        let mut connector = ClientConnector::new();
        connector
            .on_connect_sent(true, 60, Duration::from_secs(5))
            .unwrap();
        connector.on_conn_ack(ConnectReturnCode::Accepted).unwrap();
        assert_eq!(connector.state, ClientConnectorState::Connected);
    }

    #[test]
    fn refused_connack_returns_to_disconnected_with_error() {
        let mut connector = ClientConnector::new();
        connector
            .on_connect_sent(true, 60, Duration::from_secs(5))
            .unwrap();
        let err = connector
            .on_conn_ack(ConnectReturnCode::NotAuthorized)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
        assert_eq!(connector.state, ClientConnectorState::Disconnected);
    }

    #[test]
    fn clean_session_connection_lost_signals_discard() {
        let mut connector = ClientConnector::new();
        connector
            .on_connect_sent(true, 60, Duration::from_secs(5))
            .unwrap();
        connector.on_conn_ack(ConnectReturnCode::Accepted).unwrap();
        assert!(connector.on_connection_lost());
    }

    #[test]
    fn non_clean_session_connection_lost_signals_retain() {
        let mut connector = ClientConnector::new();
        connector
            .on_connect_sent(false, 60, Duration::from_secs(5))
            .unwrap();
        connector.on_conn_ack(ConnectReturnCode::Accepted).unwrap();
        assert!(!connector.on_connection_lost());
    }
}
