// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A second `Connect` for a `client_id` that already has a live connection
//! evicts the first one (MQTT 3.1.4), and the eviction is observable on
//! `watch_client_sessions()`.

use std::time::Duration;

use mqtt_codec::{ConnectPacket, Packet};
use mqtt_session::{MqttSessionSettings, ServerSession};

#[tokio::test]
async fn second_connect_for_same_client_id_evicts_the_first_connection() {
    let server = ServerSession::new(MqttSessionSettings::default());
    let mut terminations = server.watch_client_sessions();

    let mut first = server.accept::<&'static str>(1);
    let connect = ConnectPacket::new("shared-client").unwrap();
    let mut buf = Vec::new();
    Packet::Connect(connect.clone()).encode(&mut buf).unwrap();
    first.inbound_tx.send(buf).await.unwrap();
    first.event_rx.recv().await.unwrap().unwrap();
    assert_eq!(server.connection_count(), 1);

    let mut second = server.accept::<&'static str>(2);
    let mut buf = Vec::new();
    Packet::Connect(connect).encode(&mut buf).unwrap();
    second.inbound_tx.send(buf).await.unwrap();
    second.event_rx.recv().await.unwrap().unwrap();

    let terminated = tokio::time::timeout(Duration::from_secs(1), terminations.recv())
        .await
        .expect("the evicted connection's session must be reported terminated")
        .unwrap();
    assert_eq!(terminated.client_id, "shared-client");

    // Give the evicted worker task a moment to unwind after the eviction
    // signal reaches it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.connection_count(), 1);
    assert!(first.event_rx.recv().await.is_none());
}
