// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A QoS 2 `Publish` that receives no `PubRec` within its deadline is
//! retransmitted with `dup` set, then completes the four-way handshake
//! once the peer catches up.

use std::time::Duration;

use mqtt_codec::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, Packet, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, QoS,
};
use mqtt_session::{ClientSession, Command, MqttSessionSettings};

async fn connect(handle: &mut mqtt_session::ClientSessionHandle<&'static str>) {
    let connect = ConnectPacket::new("test-client").unwrap();
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
}

#[tokio::test]
async fn qos2_publish_retransmits_then_completes() {
    let mut settings = MqttSessionSettings::default();
    settings.producer_pub_ack_rec_timeout = Duration::from_millis(80);
    settings.producer_pub_comp_timeout = Duration::from_millis(80);
    settings.max_retransmit_attempts = 5;

    let (session, mut handle) = ClientSession::<&'static str>::new(settings);
    tokio::spawn(session.run());
    connect(&mut handle).await;

    let publish = PublishPacket::new("alerts/fire", QoS::ExactOnce, b"smoke".to_vec()).unwrap();
    handle
        .command_tx
        .send(Command::new(Packet::Publish(publish), "pub-2"))
        .await
        .unwrap();

    let first = handle.outbound_rx.recv().await.unwrap();
    let packet_id = match Packet::decode(&first).unwrap() {
        Packet::Publish(packet) => {
            assert!(!packet.dup);
            packet.packet_id.expect("QoS 2 publish carries a packet id")
        }
        other => panic!("expected Publish on the wire, got {other:?}"),
    };

    // No PubRec arrives: the producer exchange must retransmit with dup set.
    let retransmit = handle.outbound_rx.recv().await.unwrap();
    match Packet::decode(&retransmit).unwrap() {
        Packet::Publish(packet) => {
            assert!(packet.dup);
            assert_eq!(packet.packet_id, Some(packet_id));
        }
        other => panic!("expected retransmitted Publish, got {other:?}"),
    }

    let mut buf = Vec::new();
    Packet::PublishReceived(PublishReceivedPacket::new(packet_id))
        .encode(&mut buf)
        .unwrap();
    handle.inbound_tx.send(buf).await.unwrap();

    let pub_rel = handle.outbound_rx.recv().await.unwrap();
    match Packet::decode(&pub_rel).unwrap() {
        Packet::PublishRelease(rel) => assert_eq!(rel.packet_id, packet_id),
        other => panic!("expected PublishRelease on the wire, got {other:?}"),
    }

    let mut buf = Vec::new();
    Packet::PublishComplete(PublishCompletePacket::new(packet_id))
        .encode(&mut buf)
        .unwrap();
    handle.inbound_tx.send(buf).await.unwrap();

    let event = handle.event_rx.recv().await.unwrap().unwrap();
    assert_eq!(event.carry, Some("pub-2"));
    match event.packet {
        Packet::PublishComplete(ack) => assert_eq!(ack.packet_id, packet_id),
        other => panic!("expected PublishComplete event, got {other:?}"),
    }
}
