// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use super::{ClientId, ConnectionId};

/// Per-connection bookkeeping the server side keeps for an accepted
/// transport (`spec.md` §3 `Connection`).
struct ClientConnectionState {
    client_id: ClientId,
    keepalive: Duration,
    last_rx_at: Instant,
    clean_session: bool,
}

/// `ServerConnector` (`spec.md` §4.4): maintains `connection_id ->
/// ClientConnection` and performs session takeover (MQTT 3.1.4) when a
/// second `Connect` arrives for a `client_id` that already has a live
/// connection.
pub struct ServerConnector {
    connections: HashMap<ConnectionId, ClientConnectionState>,
    by_client_id: HashMap<ClientId, ConnectionId>,
}

impl ServerConnector {
    pub fn new() -> Self {
        ServerConnector {
            connections: HashMap::new(),
            by_client_id: HashMap::new(),
        }
    }

    /// Register a just-accepted `Connect` for `connection_id`. Returns the
    /// `ConnectionId` of a prior connection for the same `client_id` that
    /// must now be disconnected (session takeover), if any.
    pub fn on_connect(
        &mut self,
        connection_id: ConnectionId,
        client_id: ClientId,
        keepalive_seconds: u16,
        clean_session: bool,
    ) -> Option<ConnectionId> {
        let keepalive = if keepalive_seconds == 0 {
            Duration::from_secs(0)
        } else {
            // Allow one and half times the keep alive period to elapse
            // before treating the client as timed out, matching the MQTT
            // 3.1.1 [MQTT-3.1.2-24] recommendation.
            Duration::from_millis(u64::from(keepalive_seconds) * 1500)
        };

        let previous = self.by_client_id.insert(client_id.clone(), connection_id);
        if let Some(previous_connection_id) = previous {
            if previous_connection_id != connection_id {
                self.connections.remove(&previous_connection_id);
            }
        }

        self.connections.insert(
            connection_id,
            ClientConnectionState {
                client_id,
                keepalive,
                last_rx_at: Instant::now(),
                clean_session,
            },
        );

        previous.filter(|id| *id != connection_id)
    }

    pub fn note_rx(&mut self, connection_id: ConnectionId) {
        if let Some(state) = self.connections.get_mut(&connection_id) {
            state.last_rx_at = Instant::now();
        }
    }

    pub fn is_keepalive_expired(&self, connection_id: ConnectionId) -> bool {
        self.connections.get(&connection_id).is_some_and(|state| {
            !state.keepalive.is_zero() && state.last_rx_at.elapsed() > state.keepalive
        })
    }

    /// Wakeup instant at which `is_keepalive_expired` will start returning
    /// `true`, so a run loop can `sleep_until` it instead of polling.
    pub fn keepalive_deadline(&self, connection_id: ConnectionId) -> Option<Instant> {
        self.connections.get(&connection_id).and_then(|state| {
            if state.keepalive.is_zero() {
                None
            } else {
                Some(state.last_rx_at + state.keepalive)
            }
        })
    }

    pub fn clean_session(&self, connection_id: ConnectionId) -> Option<bool> {
        self.connections.get(&connection_id).map(|s| s.clean_session)
    }

    pub fn client_id(&self, connection_id: ConnectionId) -> Option<&ClientId> {
        self.connections.get(&connection_id).map(|s| &s.client_id)
    }

    /// Transport loss or `Disconnect`: drop the connection's bookkeeping.
    /// Returns the `client_id` so the caller can emit
    /// `ClientSessionTerminated`.
    pub fn on_connection_closed(&mut self, connection_id: ConnectionId) -> Option<ClientId> {
        let state = self.connections.remove(&connection_id)?;
        if self.by_client_id.get(&state.client_id) == Some(&connection_id) {
            self.by_client_id.remove(&state.client_id);
        }
        Some(state.client_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for ServerConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_connect_for_same_client_id_evicts_first_connection() {
        let mut connector = ServerConnector::new();
        assert!(connector
            .on_connect(1, "c".to_string(), 60, true)
            .is_none());
        let evicted = connector.on_connect(2, "c".to_string(), 60, true);
        assert_eq!(evicted, Some(1));
        assert_eq!(connector.connection_count(), 1);
    }

    #[test]
    fn distinct_client_ids_do_not_evict_each_other() {
        let mut connector = ServerConnector::new();
        connector.on_connect(1, "a".to_string(), 60, true);
        let evicted = connector.on_connect(2, "b".to_string(), 60, true);
        assert!(evicted.is_none());
        assert_eq!(connector.connection_count(), 2);
    }

    #[test]
    fn connection_closed_reports_client_id_for_termination_event() {
        let mut connector = ServerConnector::new();
        connector.on_connect(1, "c".to_string(), 60, true);
        assert_eq!(
            connector.on_connection_closed(1),
            Some("c".to_string())
        );
    }
}
