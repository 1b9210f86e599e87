// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A `clean_session=false` connection that loses its transport with an
//! outstanding QoS 1 Producer exchange carries that exchange's state into
//! the next transport (`spec.md` §4.4, §8 boundary behavior) and
//! retransmits it there with `DUP=1`, without the application resubmitting
//! the `Publish` command.

use std::time::Duration;

use mqtt_codec::{ConnectAckPacket, ConnectPacket, ConnectReturnCode, Packet, PublishPacket, QoS};
use mqtt_session::{ClientSession, Command, MqttSessionSettings};

#[tokio::test]
async fn clean_session_false_reconnect_retransmits_outstanding_publish_with_dup() {
    let mut settings = MqttSessionSettings::default();
    settings.producer_pub_ack_rec_timeout = Duration::from_millis(1);

    let (session, mut handle) = ClientSession::<&'static str>::new(settings.clone());

    let mut connect = ConnectPacket::new("test-client").unwrap();
    connect.connect_flags.clean_session = false;
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

    let publish = PublishPacket::new("alerts/offline", QoS::AtLeastOnce, b"down".to_vec()).unwrap();
    handle
        .command_tx
        .send(Command::new(Packet::Publish(publish), "pub-1"))
        .await
        .unwrap();
    let first = handle.outbound_rx.recv().await.unwrap();
    let packet_id = match Packet::decode(&first).unwrap() {
        Packet::Publish(packet) => {
            assert!(!packet.dup);
            packet.packet_id.expect("QoS 1 publish carries a packet id")
        }
        other => panic!("expected Publish on the wire, got {other:?}"),
    };

    // Let the producer's ack deadline elapse before the transport is lost,
    // so it is already overdue once its state resumes on the next one.
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Simulate transport loss: drop every channel the application held.
    // `command_rx`/`inbound_rx` both close, so `run()` exits on its next
    // poll without ever reaching the (already overdue) retransmit sweep.
    drop(handle);
    let preserved = tokio::spawn(session.run())
        .await
        .unwrap()
        .expect("clean_session=false must preserve the outstanding Producer exchange");

    // New transport: resume with the preserved packet-id state.
    let (session, mut handle) = ClientSession::<&'static str>::resume(settings, Some(preserved));
    tokio::spawn(session.run());

    let mut connect = ConnectPacket::new("test-client").unwrap();
    connect.connect_flags.clean_session = false;
    handle
        .command_tx
        .send(Command::new(Packet::Connect(connect), "login-2"))
        .await
        .unwrap();
    let wire = handle.outbound_rx.recv().await.unwrap();
    assert!(matches!(Packet::decode(&wire).unwrap(), Packet::Connect(_)));

    let ack = ConnectAckPacket::new(true, ConnectReturnCode::Accepted);
    let mut buf = Vec::new();
    Packet::ConnectAck(ack).encode(&mut buf).unwrap();
    handle.inbound_tx.send(buf).await.unwrap();
    handle.event_rx.recv().await.unwrap().unwrap();

    let retransmit = tokio::time::timeout(Duration::from_secs(1), handle.outbound_rx.recv())
        .await
        .expect("the resumed Producer exchange must retransmit once reconnected")
        .unwrap();
    match Packet::decode(&retransmit).unwrap() {
        Packet::Publish(packet) => {
            assert!(packet.dup, "retransmit on the new transport must set DUP=1");
            assert_eq!(packet.packet_id, Some(packet_id));
        }
        other => panic!("expected a retransmitted Publish, got {other:?}"),
    }
}
