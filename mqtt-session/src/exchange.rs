// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Per-packet-id exchange state machines (`spec.md` §4.3).

use tokio::time::{Duration, Instant};

use mqtt_codec::{PacketId, PublishPacket};

/// Outcome of feeding a wire event to an exchange: whether to keep it
/// around, retransmit a frame, or drop it from its router (terminal).
#[derive(Debug)]
pub enum Advance {
    /// Exchange is still live; wire `bytes` (if any) should be sent.
    Continue(Option<Vec<u8>>),
    /// Exchange reached `Terminated`; caller must deregister the packet
    /// id. Carries the bytes (if any) to send as the last action.
    Done(Option<Vec<u8>>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProducerState {
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,
    Terminated,
}

/// Outgoing Publish exchange, QoS 1 or 2 (`spec.md` §4.3 Producer).
pub struct ProducerExchange<A> {
    pub state: ProducerState,
    pub packet: PublishPacket,
    pub carry: A,
    pub attempts: u32,
    pub deadline: Instant,
}

impl<A> ProducerExchange<A> {
    pub fn new(packet: PublishPacket, carry: A, timeout: Duration) -> Self {
        let state = if packet.qos == mqtt_codec::QoS::AtLeastOnce {
            ProducerState::AwaitingPubAck
        } else {
            ProducerState::AwaitingPubRec
        };
        ProducerExchange {
            state,
            packet,
            carry,
            attempts: 0,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == ProducerState::Terminated
    }

    /// `PubAck` arrived (QoS 1 path). Returns `true` if this terminates
    /// the exchange, `false` if the ack was unexpected (ignored, left
    /// in-flight).
    pub fn on_pub_ack(&mut self) -> bool {
        if self.state == ProducerState::AwaitingPubAck {
            self.state = ProducerState::Terminated;
            true
        } else {
            false
        }
    }

    /// `PubRec` arrived (QoS 2 path). Returns the `PubRel` packet id to
    /// send, or `None` if unexpected.
    pub fn on_pub_rec(&mut self, pub_comp_timeout: Duration) -> bool {
        if self.state == ProducerState::AwaitingPubRec {
            self.state = ProducerState::AwaitingPubComp;
            self.attempts = 0;
            self.deadline = Instant::now() + pub_comp_timeout;
            true
        } else {
            false
        }
    }

    pub fn on_pub_comp(&mut self) -> bool {
        if self.state == ProducerState::AwaitingPubComp {
            self.state = ProducerState::Terminated;
            true
        } else {
            false
        }
    }

    /// Deadline elapsed: bump the attempt counter and set the DUP flag for
    /// retransmission, or give up (`ExchangeAbandoned`) past
    /// `max_retransmit_attempts`.
    pub fn on_timeout(&mut self, timeout: Duration, max_attempts: u32) -> bool {
        self.attempts += 1;
        if self.attempts > max_attempts {
            self.state = ProducerState::Terminated;
            return false;
        }
        self.packet.dup = true;
        self.deadline = Instant::now() + timeout;
        true
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConsumerState {
    AwaitingLocalPubAck,
    AwaitingLocalPubRec,
    AwaitingPubRel,
    AwaitingLocalPubComp,
    Terminated,
}

/// Incoming Publish exchange, QoS 1 or 2 (`spec.md` §4.3 Consumer).
pub struct ConsumerExchange {
    pub state: ConsumerState,
    pub deadline: Instant,
}

impl ConsumerExchange {
    pub fn new_qos1(timeout: Duration) -> Self {
        ConsumerExchange {
            state: ConsumerState::AwaitingLocalPubAck,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn new_qos2(timeout: Duration) -> Self {
        ConsumerExchange {
            state: ConsumerState::AwaitingLocalPubRec,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == ConsumerState::Terminated
    }

    /// Application submitted a local `PubAck` command (QoS 1).
    pub fn on_local_pub_ack(&mut self) -> bool {
        if self.state == ConsumerState::AwaitingLocalPubAck {
            self.state = ConsumerState::Terminated;
            true
        } else {
            false
        }
    }

    /// Application submitted a local `PubRec` command (QoS 2).
    pub fn on_local_pub_rec(&mut self, pub_rel_timeout: Duration) -> bool {
        if self.state == ConsumerState::AwaitingLocalPubRec {
            self.state = ConsumerState::AwaitingPubRel;
            self.deadline = Instant::now() + pub_rel_timeout;
            true
        } else {
            false
        }
    }

    /// Peer's `PubRel` arrived.
    pub fn on_pub_rel(&mut self, pub_comp_timeout: Duration) -> bool {
        if self.state == ConsumerState::AwaitingPubRel {
            self.state = ConsumerState::AwaitingLocalPubComp;
            self.deadline = Instant::now() + pub_comp_timeout;
            true
        } else {
            false
        }
    }

    /// Application submitted a local `PubComp` command (QoS 2).
    pub fn on_local_pub_comp(&mut self) -> bool {
        if self.state == ConsumerState::AwaitingLocalPubComp {
            self.state = ConsumerState::Terminated;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckState {
    Pending,
    AwaitingAck,
    Terminated,
}

/// Subscriber / Unsubscriber (client side) and Publisher / Unpublisher
/// (server side) all share this shape: one round trip awaiting a single
/// ack (`spec.md` §4.3).
pub struct AckExchange<A> {
    pub state: AckState,
    pub carry: A,
    pub deadline: Instant,
}

impl<A> AckExchange<A> {
    pub fn new(carry: A, timeout: Duration) -> Self {
        AckExchange {
            state: AckState::AwaitingAck,
            carry,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == AckState::Terminated
    }

    pub fn on_ack(&mut self) -> bool {
        if self.state == AckState::AwaitingAck {
            self.state = AckState::Terminated;
            true
        } else {
            false
        }
    }
}

/// One in-flight exchange of any of the six kinds named in `spec.md` §4.3,
/// unified so both packet-id routers can store a single entry type.
pub enum Exchange<A> {
    Producer(ProducerExchange<A>),
    Consumer(ConsumerExchange),
    Subscriber(AckExchange<A>),
    Unsubscriber(AckExchange<A>),
    Publisher(AckExchange<()>),
    Unpublisher(AckExchange<()>),
}

impl<A> Exchange<A> {
    pub fn is_terminal(&self) -> bool {
        match self {
            Exchange::Producer(e) => e.is_terminal(),
            Exchange::Consumer(e) => e.is_terminal(),
            Exchange::Subscriber(e) | Exchange::Unsubscriber(e) => e.is_terminal(),
            Exchange::Publisher(e) | Exchange::Unpublisher(e) => e.is_terminal(),
        }
    }

    pub fn deadline(&self) -> Instant {
        match self {
            Exchange::Producer(e) => e.deadline,
            Exchange::Consumer(e) => e.deadline,
            Exchange::Subscriber(e) | Exchange::Unsubscriber(e) => e.deadline,
            Exchange::Publisher(e) | Exchange::Unpublisher(e) => e.deadline,
        }
    }
}

/// A packet id whose exchange just reached terminal state; used by the
/// session loop to decide which router entry to free.
pub type TerminatedId = PacketId;
