// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A malformed inbound frame is surfaced on the event flow as a
//! `DecodeError`, not a panic, and ends the session.

use mqtt_session::{ClientSession, ErrorKind, MqttSessionSettings};

#[tokio::test]
async fn malformed_connack_surfaces_as_a_decode_error() {
    let (session, mut handle) = ClientSession::<&'static str>::new(MqttSessionSettings::default());
    tokio::spawn(session.run());

    // `20 02 00 FF`: a well-formed ConnAck fixed header and ack flags, but
    // 0xFF is not one of the six return codes MQTT 3.1.1 defines.
    let malformed = vec![0x20, 0x02, 0x00, 0xFF];
    handle.inbound_tx.send(malformed).await.unwrap();

    let event = handle.event_rx.recv().await.unwrap();
    let err = event.expect_err("expected a DecodeError, not an Event");
    assert_eq!(err.kind(), ErrorKind::DecodeError);
}
