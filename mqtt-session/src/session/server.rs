// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Server-side `Session` (`spec.md` §4.5): one `ServerSession` handle
//! multiplexes many connections, each served by its own worker task. State
//! that must be visible across connections — session takeover bookkeeping
//! and the termination broadcast — lives behind a `std::sync::Mutex` rather
//! than a dedicated actor, for the same reason `packet_id`'s routers aren't
//! actors either: every access is a short, synchronous critical section, so
//! a blocking mutex held across no `.await` point is simpler than routing
//! it through a mailbox (Open Question, recorded in `DESIGN.md`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};

use mqtt_codec::{
    Framer, Packet, PacketId, PingResponsePacket, PublishAckPacket, PublishCompletePacket,
    PublishPacket, PublishReceivedPacket, PublishReleasePacket, QoS,
};

use crate::command::{Command, Event};
use crate::config::MqttSessionSettings;
use crate::connector::{ClientId, ConnectionId, ServerConnector};
use crate::error::{Error, ErrorKind};
use crate::exchange::{AckExchange, ConsumerExchange, Exchange, ProducerExchange, ProducerState};
use crate::packet_id::{LocalPacketIdRouter, RemotePacketIdRouter};
use crate::termination::{ClientSessionTerminated, TerminationWatcher};

struct Shared {
    connector: Mutex<ServerConnector>,
    termination: Mutex<TerminationWatcher>,
    evictors: Mutex<HashMap<ConnectionId, mpsc::Sender<()>>>,
}

/// Multiplexes every accepted connection for one broker-side role
/// (`spec.md` §4.5 `ServerSession`). Cheap to clone: every clone shares the
/// same takeover bookkeeping and termination broadcast.
#[derive(Clone)]
pub struct ServerSession {
    settings: MqttSessionSettings,
    shared: Arc<Shared>,
}

/// The four channels an embedding application holds to drive one accepted
/// connection, plus the `connection_id` it was registered under.
pub struct ServerConnectionHandle<A> {
    pub connection_id: ConnectionId,
    pub command_tx: mpsc::Sender<Command<A>>,
    pub inbound_tx: mpsc::Sender<Vec<u8>>,
    pub outbound_rx: mpsc::Receiver<Vec<u8>>,
    pub event_rx: mpsc::Receiver<Result<Event<A>, Error>>,
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

impl ServerSession {
    pub fn new(settings: MqttSessionSettings) -> Self {
        let shared = Arc::new(Shared {
            connector: Mutex::new(ServerConnector::new()),
            termination: Mutex::new(TerminationWatcher::new(settings_buffer(&settings))),
            evictors: Mutex::new(HashMap::new()),
        });
        ServerSession { settings, shared }
    }

    /// `watchClientSessions()` (`spec.md` §4.5, §5): a stream of every
    /// client's session ending, including takeovers (`spec.md` §8 scenario
    /// 5).
    pub fn watch_client_sessions(&self) -> mpsc::Receiver<ClientSessionTerminated> {
        self.shared.termination.lock().unwrap().subscribe()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connector.lock().unwrap().connection_count()
    }

    /// Register a just-accepted transport and spawn the worker task that
    /// drives it to completion. The caller mints `connection_id` (this
    /// engine never allocates one itself, `spec.md` §3).
    pub fn accept<A: Send + 'static>(&self, connection_id: ConnectionId) -> ServerConnectionHandle<A> {
        let (command_tx, command_rx) = mpsc::channel(self.settings.command_parallelism.max(2));
        let (inbound_tx, inbound_rx) = mpsc::channel(self.settings.server_send_buffer_size.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(self.settings.server_send_buffer_size.max(1));
        let (event_tx, event_rx) = mpsc::channel(self.settings.event_parallelism.max(1));
        let (evict_tx, evict_rx) = mpsc::channel(1);
        self.shared
            .evictors
            .lock()
            .unwrap()
            .insert(connection_id, evict_tx);

        let worker = ServerConnectionWorker {
            connection_id,
            settings: self.settings.clone(),
            shared: self.shared.clone(),
            client_id: None,
            connect_received: false,
            disconnect_requested: false,
            local: LocalPacketIdRouter::new(),
            remote: RemotePacketIdRouter::new(),
            framer: Framer::new(),
            command_rx,
            inbound_rx,
            outbound_tx,
            event_tx,
            evict_rx,
        };
        tokio::spawn(worker.run());

        ServerConnectionHandle {
            connection_id,
            command_tx,
            inbound_tx,
            outbound_rx,
            event_rx,
        }
    }
}

fn settings_buffer(settings: &MqttSessionSettings) -> usize {
    settings.client_termination_watcher_buffer_size
}

struct ServerConnectionWorker<A> {
    connection_id: ConnectionId,
    settings: MqttSessionSettings,
    shared: Arc<Shared>,
    client_id: Option<ClientId>,
    connect_received: bool,
    disconnect_requested: bool,
    local: LocalPacketIdRouter<Exchange<A>>,
    remote: RemotePacketIdRouter<Exchange<A>>,
    framer: Framer,
    command_rx: mpsc::Receiver<Command<A>>,
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    event_tx: mpsc::Sender<Result<Event<A>, Error>>,
    evict_rx: mpsc::Receiver<()>,
}

impl<A: Send + 'static> ServerConnectionWorker<A> {
    async fn run(mut self) {
        loop {
            let wakeup = self.next_wakeup();
            let keep_going = tokio::select! {
                biased;
                _ = self.evict_rx.recv() => false,
                cmd = self.command_rx.recv() => self.on_command_slot(cmd).await,
                bytes = self.inbound_rx.recv() => self.on_inbound_slot(bytes).await,
                () = sleep_until(wakeup) => self.handle_timers().await,
            };
            if !keep_going || self.disconnect_requested {
                break;
            }
        }
        self.shared.evictors.lock().unwrap().remove(&self.connection_id);
        let closed_client_id = self
            .shared
            .connector
            .lock()
            .unwrap()
            .on_connection_closed(self.connection_id);
        if let Some(client_id) = closed_client_id {
            self.shared
                .termination
                .lock()
                .unwrap()
                .publish(ClientSessionTerminated { client_id });
        }
    }

    async fn on_command_slot(&mut self, cmd: Option<Command<A>>) -> bool {
        match cmd {
            Some(cmd) => {
                if let Err(err) = self.handle_command(cmd).await {
                    log::warn!("mqtt-session: command rejected: {err}");
                }
                true
            }
            None => false,
        }
    }

    async fn on_inbound_slot(&mut self, bytes: Option<Vec<u8>>) -> bool {
        match bytes {
            Some(bytes) => self.handle_inbound(bytes).await.is_ok(),
            None => false,
        }
    }

    /// Returns `false` (stop the loop) on keep-alive expiry, matching how a
    /// `PingFailed` ends a `ClientSession`.
    async fn handle_timers(&mut self) -> bool {
        if self
            .shared
            .connector
            .lock()
            .unwrap()
            .is_keepalive_expired(self.connection_id)
        {
            log::debug!(
                "mqtt-session: connection {} keep-alive expired",
                self.connection_id
            );
            return false;
        }
        let now = Instant::now();
        let retransmits = self.sweep_producers(now);
        self.sweep_remote(now);
        for (id, mut packet) in retransmits {
            packet.packet_id = Some(id);
            if self.send_packet(Packet::Publish(packet)).await.is_err() {
                return false;
            }
        }
        true
    }

    fn next_wakeup(&mut self) -> Instant {
        let mut deadline = Instant::now() + Duration::from_secs(3600);
        if let Some(d) = self
            .shared
            .connector
            .lock()
            .unwrap()
            .keepalive_deadline(self.connection_id)
        {
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
        if !self.connect_received && !matches!(cmd.packet, Packet::ConnectAck(_)) {
            return Err(Error::new(
                ErrorKind::IllegalCommand,
                "command submitted before Connect was received",
            ));
        }
        match cmd.packet {
            Packet::ConnectAck(ack) => self.send_packet(Packet::ConnectAck(ack)).await,
            Packet::Publish(mut packet) => {
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
            Packet::SubscribeAck(ack) => {
                let id = ack.packet_id;
                self.ack_remote_exchange(id, true, Packet::SubscribeAck(ack)).await
            }
            Packet::UnsubscribeAck(ack) => {
                let id = ack.packet_id;
                self.ack_remote_exchange(id, false, Packet::UnsubscribeAck(ack)).await
            }
            _ => Err(Error::new(
                ErrorKind::IllegalCommand,
                "server does not accept this command packet type",
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

    /// Application handed back its granted-QoS / unsubscribe decision for
    /// an inbound Subscribe/Unsubscribe: clear the waiting `Publisher` /
    /// `Unpublisher` exchange and send the wire ack.
    async fn ack_remote_exchange(
        &mut self,
        id: PacketId,
        is_subscribe: bool,
        packet: Packet,
    ) -> Result<(), Error> {
        let ok = match self.remote.get_mut(id) {
            Some(Exchange::Publisher(e)) if is_subscribe => e.on_ack(),
            Some(Exchange::Unpublisher(e)) if !is_subscribe => e.on_ack(),
            Some(_) => {
                return Err(Error::new(
                    ErrorKind::IllegalCommand,
                    format!("packet id {id} ack kind mismatch"),
                ))
            }
            None => {
                return Err(Error::new(
                    ErrorKind::UnknownPacketId,
                    format!("no pending ack exchange for packet id {id}"),
                ))
            }
        };
        if !ok {
            return Ok(());
        }
        self.remote.deregister(id);
        self.send_packet(packet).await
    }

    async fn handle_inbound(&mut self, bytes: Vec<u8>) -> Result<(), Error> {
        self.framer.push(&bytes);
        loop {
            if self.disconnect_requested {
                return Ok(());
            }
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
        self.shared.connector.lock().unwrap().note_rx(self.connection_id);
        match packet {
            Packet::Connect(connect) => {
                if self.connect_received {
                    return Err(Error::new(
                        ErrorKind::IllegalProtocolEvent,
                        "duplicate Connect on one connection",
                    ));
                }
                self.connect_received = true;
                let client_id = if connect.client_id.is_empty() {
                    format!("anon-{}", self.connection_id)
                } else {
                    connect.client_id.clone()
                };
                self.client_id = Some(client_id.clone());
                let evicted = self.shared.connector.lock().unwrap().on_connect(
                    self.connection_id,
                    client_id.clone(),
                    connect.keep_alive,
                    connect.connect_flags.clean_session,
                );
                if let Some(evicted_id) = evicted {
                    self.shared
                        .termination
                        .lock()
                        .unwrap()
                        .publish(ClientSessionTerminated {
                            client_id: client_id.clone(),
                        });
                    if let Some(tx) = self.shared.evictors.lock().unwrap().get(&evicted_id) {
                        let _ = tx.try_send(());
                    }
                }
                self.emit(Event::unsolicited(Packet::Connect(connect))).await
            }
            Packet::Publish(packet) => self.handle_inbound_publish(packet).await,
            Packet::PublishAck(ack) => {
                self.handle_producer_ack(ack.packet_id, ProducerAckKind::PubAck).await
            }
            Packet::PublishReceived(ack) => {
                self.handle_producer_ack(ack.packet_id, ProducerAckKind::PubRec).await
            }
            Packet::PublishComplete(ack) => {
                self.handle_producer_ack(ack.packet_id, ProducerAckKind::PubComp).await
            }
            Packet::PublishRelease(rel) => {
                let id = rel.packet_id;
                match self.remote.get_mut(id) {
                    Some(Exchange::Consumer(consumer)) => {
                        consumer.on_pub_rel(self.settings.consumer_pub_comp_timeout);
                    }
                    _ => log::warn!(
                        "mqtt-session: PublishRelease for unknown packet id {id}, dropped"
                    ),
                }
                Ok(())
            }
            Packet::Subscribe(sub) => {
                let timeout = self.settings.actor_mqtt_session_timeout;
                self.remote.register(
                    sub.packet_id,
                    Exchange::Publisher(AckExchange::new((), timeout)),
                    Exchange::is_terminal,
                )?;
                self.emit(Event::unsolicited(Packet::Subscribe(sub))).await
            }
            Packet::Unsubscribe(unsub) => {
                let timeout = self.settings.actor_mqtt_session_timeout;
                self.remote.register(
                    unsub.packet_id,
                    Exchange::Unpublisher(AckExchange::new((), timeout)),
                    Exchange::is_terminal,
                )?;
                self.emit(Event::unsolicited(Packet::Unsubscribe(unsub))).await
            }
            Packet::PingRequest(_) => {
                self.send_packet(Packet::PingResponse(PingResponsePacket)).await
            }
            Packet::Disconnect(_) => {
                self.disconnect_requested = true;
                Ok(())
            }
            Packet::ConnectAck(_)
            | Packet::SubscribeAck(_)
            | Packet::UnsubscribeAck(_)
            | Packet::PingResponse(_) => Err(Error::new(
                ErrorKind::IllegalProtocolEvent,
                "server received a client-only packet type",
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
            log::debug!("mqtt-session: duplicate publish for packet id {id}, dropped");
            Ok(())
        }
    }

    fn sweep_producers(&mut self, now: Instant) -> Vec<(PacketId, PublishPacket)> {
        let mut retransmits = Vec::new();
        let mut abandoned = Vec::new();
        for (id, exchange) in self.local.iter_mut() {
            if now < exchange.deadline() {
                continue;
            }
            if let Exchange::Producer(p) = exchange {
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
        }
        for id in abandoned {
            self.local.deregister(id);
        }
        retransmits
    }

    fn sweep_remote(&mut self, now: Instant) {
        let mut abandoned = Vec::new();
        for (id, exchange) in self.remote.iter_mut() {
            if now < exchange.deadline() {
                continue;
            }
            match exchange {
                Exchange::Consumer(_) | Exchange::Publisher(_) | Exchange::Unpublisher(_) => {
                    log::warn!("mqtt-session: exchange {id} timed out, abandoning");
                    abandoned.push(*id);
                }
                _ => {}
            }
        }
        for id in abandoned {
            self.remote.deregister(id);
        }
    }
}
