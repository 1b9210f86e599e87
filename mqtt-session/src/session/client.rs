// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Client-side `Session` (`spec.md` §4.5).
//!
//! `ClientSession` *is* the actor: it owns the packet-id routers, the
//! connector and the framer, and is driven to completion by `run()`,
//! meant to be `tokio::spawn`-ed. The two duplex pipes of `spec.md` §4.5
//! (`commandFlow`/`eventFlow`) are realized as four `mpsc` channels handed
//! to the caller in a `ClientSessionHandle`; the embedding application
//! owns the transport and is responsible for pumping bytes between the
//! socket and `inbound_tx`/`outbound_rx`.

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};

use mqtt_codec::{
    Framer, Packet, PacketId, PingRequestPacket, PublishAckPacket, PublishCompletePacket,
    PublishPacket, PublishReceivedPacket, PublishReleasePacket, QoS,
};

use crate::command::{Command, Event};
use crate::config::MqttSessionSettings;
use crate::connector::{ClientConnector, ClientConnectorState};
use crate::error::{Error, ErrorKind};
use crate::exchange::{AckExchange, ConsumerExchange, Exchange, ProducerExchange, ProducerState};
use crate::packet_id::{LocalPacketIdRouter, RemotePacketIdRouter};

/// The four channels an embedding application holds to drive one
/// `ClientSession`.
pub struct ClientSessionHandle<A> {
    /// Submit application Commands here (`CommandFlow` input).
    pub command_tx: mpsc::Sender<Command<A>>,
    /// Feed bytes read off the transport here.
    pub inbound_tx: mpsc::Sender<Vec<u8>>,
    /// Bytes to write to the transport, in submission order.
    pub outbound_rx: mpsc::Receiver<Vec<u8>>,
    /// Application-facing Events (`EventFlow` output), or a terminal
    /// decode/protocol error.
    pub event_rx: mpsc::Receiver<Result<Event<A>, Error>>,
}

/// Packet-id state worth carrying into the next transport when the
/// connection was opened with `clean_session=false` (`spec.md` §9).
pub struct PreservedState<A> {
    local: LocalPacketIdRouter<Exchange<A>>,
    remote: RemotePacketIdRouter<Exchange<A>>,
}

enum ConsumerAckKind {
    PubAck,
    PubRec,
    PubComp,
}

enum ProducerAckKind {
    PubAck,
    PubRec,
    PubComp,
}

pub struct ClientSession<A> {
    settings: MqttSessionSettings,
    connector: ClientConnector,
    local: LocalPacketIdRouter<Exchange<A>>,
    remote: RemotePacketIdRouter<Exchange<A>>,
    framer: Framer,
    pending_connect_carry: Option<A>,
    command_rx: mpsc::Receiver<Command<A>>,
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    event_tx: mpsc::Sender<Result<Event<A>, Error>>,
}

impl<A: Send + 'static> ClientSession<A> {
    pub fn new(settings: MqttSessionSettings) -> (Self, ClientSessionHandle<A>) {
        Self::resume(settings, None)
    }

    /// Like `new`, but seeded with packet-id state carried over from a
    /// prior transport (`spec.md` §4.4 reconnect-with-`cleanSession=false`).
    pub fn resume(
        settings: MqttSessionSettings,
        preserved: Option<PreservedState<A>>,
    ) -> (Self, ClientSessionHandle<A>) {
        let (command_tx, command_rx) = mpsc::channel(settings.command_parallelism.max(2));
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.client_send_buffer_size.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.client_send_buffer_size.max(1));
        let (event_tx, event_rx) = mpsc::channel(settings.event_parallelism.max(1));
        let (local, remote) = match preserved {
            Some(p) => (p.local, p.remote),
            None => (LocalPacketIdRouter::new(), RemotePacketIdRouter::new()),
        };
        let session = ClientSession {
            settings,
            connector: ClientConnector::new(),
            local,
            remote,
            framer: Framer::new(),
            pending_connect_carry: None,
            command_rx,
            inbound_rx,
            outbound_tx,
            event_tx,
        };
        let handle = ClientSessionHandle {
            command_tx,
            inbound_tx,
            outbound_rx,
            event_rx,
        };
        (session, handle)
    }

    /// Consume the session, returning packet-id state to carry into the
    /// next transport if it is worth keeping (`clean_session=false`).
    /// `run()` calls this itself on exit; exposed separately so a caller
    /// driving the session without `tokio::spawn` can extract it too.
    #[must_use]
    pub fn into_preserved_state(self) -> Option<PreservedState<A>> {
        if self.connector.clean_session {
            None
        } else {
            Some(PreservedState {
                local: self.local,
                remote: self.remote,
            })
        }
    }

    /// Drive the session until both the command and inbound-byte channels
    /// close, or a fatal protocol/decode/ping error ends the connection.
    /// Meant to be `tokio::spawn`-ed; the returned `PreservedState` (if
    /// any) is what the caller should pass to `ClientSession::resume()`
    /// to carry outstanding exchanges onto the next transport
    /// (`spec.md` §4.4, `cleanSession=false`).
    pub async fn run(mut self) -> Option<PreservedState<A>> {
        loop {
            let wakeup = self.next_wakeup();
            let outcome = tokio::select! {
                biased;
                cmd = self.command_rx.recv() => self.on_command_slot(cmd).await,
                bytes = self.inbound_rx.recv() => self.on_inbound_slot(bytes).await,
                () = sleep_until(wakeup) => self.handle_timers().await.map(|()| true),
            };
            match outcome {
                Ok(true) => continue,
                Ok(false) | Err(_) => break,
            }
        }
        self.connector.on_connection_lost();
        self.into_preserved_state()
    }

    async fn on_command_slot(&mut self, cmd: Option<Command<A>>) -> Result<bool, Error> {
        match cmd {
            Some(cmd) => {
                if let Err(err) = self.handle_command(cmd).await {
                    log::warn!("mqtt-session: command rejected: {err}");
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn on_inbound_slot(&mut self, bytes: Option<Vec<u8>>) -> Result<bool, Error> {
        match bytes {
            Some(bytes) => {
                self.handle_inbound(bytes).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn next_wakeup(&mut self) -> Instant {
        let mut deadline = Instant::now() + Duration::from_secs(3600);
        if let Some(d) = self.connector.next_keepalive_deadline() {
            deadline = deadline.min(d);
        }
        if let Some(d) = self.connector.ping_deadline() {
            deadline = deadline.min(d);
        }
        for (_, exchange) in self.local.iter_mut() {
            deadline = deadline.min(exchange.deadline());
        }
        for (_, exchange) in self.remote.iter_mut() {
            deadline = deadline.min(exchange.deadline());
        }
        deadline
    }

    async fn send_bytes(&mut self, buf: Vec<u8>) -> Result<(), Error> {
        self.connector.note_outbound_sent();
        self.outbound_tx
            .send(buf)
            .await
            .map_err(|_| Error::new(ErrorKind::ConnectionLost, "outbound channel closed"))
    }

    async fn send_packet(&mut self, packet: Packet) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.send_bytes(buf).await
    }

    async fn emit(&mut self, event: Event<A>) -> Result<(), Error> {
        self.event_tx
            .send(Ok(event))
            .await
            .map_err(|_| Error::new(ErrorKind::ConnectionLost, "event channel closed"))
    }

    async fn emit_err(&mut self, err: Error) {
        let _ = self.event_tx.send(Err(err)).await;
    }

    async fn handle_command(&mut self, cmd: Command<A>) -> Result<(), Error> {
        match cmd.packet {
            Packet::Connect(packet) => {
                self.connector.on_connect_sent(
                    packet.connect_flags.clean_session,
                    packet.keep_alive,
                    self.settings.receive_connack_timeout,
                )?;
                self.pending_connect_carry = Some(cmd.carry);
                self.send_packet(Packet::Connect(packet)).await
            }
            Packet::Publish(mut packet) => {
                if self.connector.state != ClientConnectorState::Connected {
                    return Err(Error::new(
                        ErrorKind::IllegalCommand,
                        "Publish submitted outside of Connected state",
                    ));
                }
                if packet.qos == QoS::AtMostOnce {
                    self.send_packet(Packet::Publish(packet)).await
                } else {
                    let timeout = self.settings.producer_pub_ack_rec_timeout;
                    let id = self
                        .local
                        .register(Exchange::Producer(ProducerExchange::new(
                            packet.clone(),
                            cmd.carry,
                            timeout,
                        )))?;
                    packet.packet_id = Some(id);
                    if let Some(Exchange::Producer(stored)) = self.local.get_mut(id) {
                        stored.packet.packet_id = Some(id);
                    }
                    self.send_packet(Packet::Publish(packet)).await
                }
            }
            Packet::PublishAck(ack) => {
                self.handle_local_consumer_ack(ack.packet_id, ConsumerAckKind::PubAck)
                    .await
            }
            Packet::PublishReceived(ack) => {
                self.handle_local_consumer_ack(ack.packet_id, ConsumerAckKind::PubRec)
                    .await
            }
            Packet::PublishComplete(ack) => {
                self.handle_local_consumer_ack(ack.packet_id, ConsumerAckKind::PubComp)
                    .await
            }
            Packet::Subscribe(mut packet) => {
                let timeout = self.settings.actor_mqtt_session_timeout;
                let id = self
                    .local
                    .register(Exchange::Subscriber(AckExchange::new(cmd.carry, timeout)))?;
                packet.packet_id = id;
                self.send_packet(Packet::Subscribe(packet)).await
            }
            Packet::Unsubscribe(mut packet) => {
                let timeout = self.settings.actor_mqtt_session_timeout;
                let id = self
                    .local
                    .register(Exchange::Unsubscriber(AckExchange::new(cmd.carry, timeout)))?;
                packet.packet_id = id;
                self.send_packet(Packet::Unsubscribe(packet)).await
            }
            Packet::Disconnect(packet) => {
                // Idempotent: a second Disconnect command yields one
                // Disconnect on the wire (`spec.md` §8).
                if self.connector.state == ClientConnectorState::Disconnecting {
                    return Ok(());
                }
                self.connector.on_disconnect_sent();
                self.send_packet(Packet::Disconnect(packet)).await
            }
            _ => Err(Error::new(
                ErrorKind::IllegalCommand,
                "client does not accept this command packet type",
            )),
        }
    }

    async fn handle_local_consumer_ack(
        &mut self,
        id: PacketId,
        kind: ConsumerAckKind,
    ) -> Result<(), Error> {
        let ok = match self.remote.get_mut(id) {
            Some(Exchange::Consumer(consumer)) => match kind {
                ConsumerAckKind::PubAck => consumer.on_local_pub_ack(),
                ConsumerAckKind::PubRec => {
                    consumer.on_local_pub_rec(self.settings.consumer_pub_rel_timeout)
                }
                ConsumerAckKind::PubComp => consumer.on_local_pub_comp(),
            },
            Some(_) => {
                return Err(Error::new(
                    ErrorKind::IllegalCommand,
                    format!("packet id {id} is not a Consumer exchange"),
                ))
            }
            None => {
                return Err(Error::new(
                    ErrorKind::UnknownPacketId,
                    format!("no Consumer exchange for packet id {id}"),
                ))
            }
        };
        if !ok {
            return Err(Error::new(
                ErrorKind::IllegalCommand,
                format!("ack not expected by Consumer exchange {id} in its current state"),
            ));
        }
        let terminal = matches!(
            self.remote.get_mut(id),
            Some(Exchange::Consumer(c)) if c.is_terminal()
        );
        let packet = match kind {
            ConsumerAckKind::PubAck => Packet::PublishAck(PublishAckPacket::new(id)),
            ConsumerAckKind::PubRec => Packet::PublishReceived(PublishReceivedPacket::new(id)),
            ConsumerAckKind::PubComp => Packet::PublishComplete(PublishCompletePacket::new(id)),
        };
        self.send_packet(packet).await?;
        if terminal {
            self.remote.deregister(id);
        }
        Ok(())
    }

    async fn handle_inbound(&mut self, bytes: Vec<u8>) -> Result<(), Error> {
        self.framer.push(&bytes);
        loop {
            let frame = match self.framer.next_frame(self.settings.max_packet_size) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(err) => {
                    self.emit_err(err.into()).await;
                    return Err(Error::new(ErrorKind::DecodeError, "frame exceeded max_packet_size"));
                }
            };
            match Packet::decode(&frame) {
                Ok(packet) => self.handle_inbound_packet(packet).await?,
                Err(err) => {
                    self.emit_err(err.into()).await;
                    return Err(Error::new(ErrorKind::DecodeError, "malformed inbound packet"));
                }
            }
        }
    }

    async fn handle_inbound_packet(&mut self, packet: Packet) -> Result<(), Error> {
        match packet {
            Packet::ConnectAck(ack) => {
                let carry = self.pending_connect_carry.take();
                let return_code = ack.return_code;
                let ack_result = self.connector.on_conn_ack(return_code);
                self.emit(Event::new(Packet::ConnectAck(ack), carry)).await?;
                ack_result
            }
            Packet::PublishAck(ack) => {
                self.handle_producer_ack(ack.packet_id, ProducerAckKind::PubAck).await
            }
            Packet::PublishReceived(ack) => {
                self.handle_producer_ack(ack.packet_id, ProducerAckKind::PubRec).await
            }
            Packet::PublishComplete(ack) => {
                self.handle_producer_ack(ack.packet_id, ProducerAckKind::PubComp).await
            }
            Packet::SubscribeAck(ack) => {
                let id = ack.packet_id;
                self.handle_ack_exchange(id, true, Packet::SubscribeAck(ack)).await
            }
            Packet::UnsubscribeAck(ack) => {
                let id = ack.packet_id;
                self.handle_ack_exchange(id, false, Packet::UnsubscribeAck(ack)).await
            }
            Packet::PublishRelease(rel) => {
                let id = rel.packet_id;
                match self.remote.get_mut(id) {
                    Some(Exchange::Consumer(consumer)) => {
                        consumer.on_pub_rel(self.settings.consumer_pub_comp_timeout);
                    }
                    _ => {
                        log::warn!(
                            "mqtt-session: PublishRelease for unknown packet id {id}, dropped"
                        );
                    }
                }
                Ok(())
            }
            Packet::Publish(packet) => self.handle_inbound_publish(packet).await,
            Packet::PingResponse(_) => {
                if let Err(err) = self.connector.on_ping_resp() {
                    log::warn!("mqtt-session: {err}");
                }
                Ok(())
            }
            Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingRequest(_)
            | Packet::Disconnect(_) => Err(Error::new(
                ErrorKind::IllegalProtocolEvent,
                "client received a server-only packet type",
            )),
        }
    }

    async fn handle_producer_ack(&mut self, id: PacketId, kind: ProducerAckKind) -> Result<(), Error> {
        let advanced = match self.local.get_mut(id) {
            Some(Exchange::Producer(producer)) => match kind {
                ProducerAckKind::PubAck => producer.on_pub_ack(),
                ProducerAckKind::PubRec => {
                    producer.on_pub_rec(self.settings.producer_pub_comp_timeout)
                }
                ProducerAckKind::PubComp => producer.on_pub_comp(),
            },
            Some(_) => {
                log::warn!("mqtt-session: packet id {id} is not a Producer exchange, dropped");
                return Ok(());
            }
            None => {
                log::warn!("mqtt-session: unknown packet id {id} for producer ack, dropped");
                return Ok(());
            }
        };
        if !advanced {
            return Ok(());
        }
        match kind {
            ProducerAckKind::PubAck => {
                if let Some(Exchange::Producer(p)) = self.local.deregister(id) {
                    self.emit(Event::new(Packet::PublishAck(PublishAckPacket::new(id)), Some(p.carry)))
                        .await?;
                }
            }
            ProducerAckKind::PubRec => {
                self.send_packet(Packet::PublishRelease(PublishReleasePacket::new(id)))
                    .await?;
            }
            ProducerAckKind::PubComp => {
                if let Some(Exchange::Producer(p)) = self.local.deregister(id) {
                    self.emit(Event::new(
                        Packet::PublishComplete(PublishCompletePacket::new(id)),
                        Some(p.carry),
                    ))
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_ack_exchange(
        &mut self,
        id: PacketId,
        is_subscribe: bool,
        packet: Packet,
    ) -> Result<(), Error> {
        let ok = match self.local.get_mut(id) {
            Some(Exchange::Subscriber(e)) if is_subscribe => e.on_ack(),
            Some(Exchange::Unsubscriber(e)) if !is_subscribe => e.on_ack(),
            Some(_) => {
                log::warn!("mqtt-session: packet id {id} ack kind mismatch, dropped");
                return Ok(());
            }
            None => {
                log::warn!("mqtt-session: unknown packet id {id} for ack, dropped");
                return Ok(());
            }
        };
        if !ok {
            return Ok(());
        }
        let carry = match self.local.deregister(id) {
            Some(Exchange::Subscriber(e)) | Some(Exchange::Unsubscriber(e)) => Some(e.carry),
            _ => None,
        };
        self.emit(Event::new(packet, carry)).await
    }

    async fn handle_inbound_publish(&mut self, packet: PublishPacket) -> Result<(), Error> {
        if packet.qos == QoS::AtMostOnce {
            return self.emit(Event::unsolicited(Packet::Publish(packet))).await;
        }
        let id = packet
            .packet_id
            .ok_or_else(|| Error::new(ErrorKind::DecodeError, "QoS >= 1 publish missing packet id"))?;
        let exchange = if packet.qos == QoS::AtLeastOnce {
            Exchange::Consumer(ConsumerExchange::new_qos1(self.settings.consumer_pub_ack_rec_timeout))
        } else {
            Exchange::Consumer(ConsumerExchange::new_qos2(self.settings.consumer_pub_ack_rec_timeout))
        };
        let is_new = self.remote.register(id, exchange, Exchange::is_terminal).is_ok();
        if is_new {
            self.emit(Event::unsolicited(Packet::Publish(packet))).await
        } else {
            // Duplicate delivery of an in-flight QoS 1/2 exchange: dropped,
            // not re-delivered to the application (`spec.md` §8).
            log::debug!("mqtt-session: duplicate publish for packet id {id}, dropped");
            Ok(())
        }
    }

    async fn handle_timers(&mut self) -> Result<(), Error> {
        if self.connector.is_ping_failed() {
            self.emit_err(Error::new(ErrorKind::PingFailed, "no PingResp within timeout"))
                .await;
            return Err(Error::new(ErrorKind::PingFailed, "ping failed"));
        }
        if self.connector.should_ping() {
            self.send_packet(Packet::PingRequest(PingRequestPacket)).await?;
            self.connector.on_ping_sent(self.settings.actor_mqtt_session_timeout);
        }

        let now = Instant::now();
        let retransmits = self.sweep_producers(now);
        self.sweep_consumers(now);
        for (id, mut packet) in retransmits {
            packet.packet_id = Some(id);
            self.send_packet(Packet::Publish(packet)).await?;
        }
        Ok(())
    }

    fn sweep_producers(&mut self, now: Instant) -> Vec<(PacketId, PublishPacket)> {
        let mut retransmits = Vec::new();
        let mut abandoned = Vec::new();
        for (id, exchange) in self.local.iter_mut() {
            if now < exchange.deadline() {
                continue;
            }
            match exchange {
                Exchange::Producer(p) => {
                    let timeout = if p.state == ProducerState::AwaitingPubComp {
                        self.settings.producer_pub_comp_timeout
                    } else {
                        self.settings.producer_pub_ack_rec_timeout
                    };
                    if p.on_timeout(timeout, self.settings.max_retransmit_attempts) {
                        retransmits.push((*id, p.packet.clone()));
                    } else {
                        log::warn!(
                            "mqtt-session: Producer exchange {id} abandoned after max retransmit attempts"
                        );
                        abandoned.push(*id);
                    }
                }
                Exchange::Subscriber(_) | Exchange::Unsubscriber(_) => {
                    log::warn!("mqtt-session: ack exchange {id} timed out, abandoning");
                    abandoned.push(*id);
                }
                _ => {}
            }
        }
        for id in abandoned {
            self.local.deregister(id);
        }
        retransmits
    }

    fn sweep_consumers(&mut self, now: Instant) {
        let mut abandoned = Vec::new();
        for (id, exchange) in self.remote.iter_mut() {
            if now < exchange.deadline() {
                continue;
            }
            if let Exchange::Consumer(_) = exchange {
                log::warn!("mqtt-session: Consumer exchange {id} timed out, abandoning");
                abandoned.push(*id);
            }
        }
        for id in abandoned {
            self.remote.deregister(id);
        }
    }
}
