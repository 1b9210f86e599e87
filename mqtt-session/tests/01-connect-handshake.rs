// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A `ClientSession` sends `Connect` on the wire and surfaces the matching
//! `ConnAck` as an `Event` carrying the command's correlation token.

use mqtt_codec::{ConnectAckPacket, ConnectPacket, ConnectReturnCode, Packet};
use mqtt_session::{ClientSession, Command, MqttSessionSettings};

#[tokio::test]
async fn connect_command_round_trips_to_a_connack_event() {
    let (session, mut handle) = ClientSession::<&'static str>::new(MqttSessionSettings::default());
    tokio::spawn(session.run());

    let connect = ConnectPacket::new("test-client").unwrap();
    handle
        .command_tx
        .send(Command::new(Packet::Connect(connect), "login"))
        .await
        .unwrap();

    let wire = handle.outbound_rx.recv().await.unwrap();
    match Packet::decode(&wire).unwrap() {
        Packet::Connect(packet) => {
            assert_eq!(packet.client_id, "test-client");
            assert!(packet.connect_flags.clean_session);
            assert_eq!(packet.keep_alive, 60);
        }
        other => panic!("expected Connect on the wire, got {other:?}"),
    }

    let ack = ConnectAckPacket::new(false, ConnectReturnCode::Accepted);
    let mut buf = Vec::new();
    Packet::ConnectAck(ack).encode(&mut buf).unwrap();
    handle.inbound_tx.send(buf).await.unwrap();

    let event = handle.event_rx.recv().await.unwrap().unwrap();
    assert_eq!(event.carry, Some("login"));
    match event.packet {
        Packet::ConnectAck(ack) => {
            assert_eq!(ack.return_code, ConnectReturnCode::Accepted);
            assert!(!ack.session_present);
        }
        other => panic!("expected ConnectAck event, got {other:?}"),
    }
}
