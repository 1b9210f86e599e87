// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! An idle connection sends `PingReq` once its keep-alive elapses; if no
//! `PingResp` follows within the grace period, the session ends with a
//! `PingFailed` error on the event flow.

use std::time::Duration;

use mqtt_codec::{ConnectAckPacket, ConnectPacket, ConnectReturnCode, Packet};
use mqtt_session::{ClientSession, Command, ErrorKind, MqttSessionSettings};

#[tokio::test]
async fn unanswered_ping_fails_the_session() {
    let mut settings = MqttSessionSettings::default();
    settings.actor_mqtt_session_timeout = Duration::from_millis(150);

    let (session, mut handle) = ClientSession::<&'static str>::new(settings);
    tokio::spawn(session.run());

    let mut connect = ConnectPacket::new("test-client").unwrap();
    connect.keep_alive = 1;
    handle
        .command_tx
        .send(Command::new(Packet::Connect(connect), "login"))
        .await
        .unwrap();
    handle.outbound_rx.recv().await.unwrap();

    let ack = ConnectAckPacket::new(false, ConnectReturnCode::Accepted);
    let mut buf = Vec::new();
    Packet::ConnectAck(ack).encode(&mut buf).unwrap();
    handle.inbound_tx.send(buf).await.unwrap();
    handle.event_rx.recv().await.unwrap().unwrap();

    let ping = tokio::time::timeout(Duration::from_secs(3), handle.outbound_rx.recv())
        .await
        .expect("PingReq must be sent once keep-alive elapses")
        .unwrap();
    assert!(matches!(Packet::decode(&ping).unwrap(), Packet::PingRequest(_)));

    // Never answer with a PingResp: the session should report PingFailed.
    let event = tokio::time::timeout(Duration::from_secs(3), handle.event_rx.recv())
        .await
        .expect("session must report a failure once the ping grace period elapses")
        .unwrap();
    let err = event.expect_err("expected a PingFailed error, not an Event");
    assert_eq!(err.kind(), ErrorKind::PingFailed);
}
