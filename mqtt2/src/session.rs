//! Session state machine.
//!
//! Owns the connection state and every open QoS 2 exchange. The session never
//! touches the network: callers feed it decoded packets and act on the
//! returned [`Reaction`]. It is kept behind a synchronous lock that is never
//! held across an `.await`.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{Error, PublishPhase, Result};
use crate::packet_id::PacketIdAllocator;
use crate::protocol::{
    Ack, ConnAck, Packet, Properties, PubReasonCode, Publish, SubAck, Subscribe, SubscribeFilter,
    SubscribeReasonCode,
};
use crate::types::{Message, QoS, Subscription};

/// Completion slot of a caller waiting on an exchange.
pub(crate) type Completion<T> = oneshot::Sender<Result<T>>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Step of an outbound QoS 2 exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundPhase {
    AwaitingPubRec,
    AwaitingPubComp,
}

struct OutboundExchange {
    phase: OutboundPhase,
    resp: Completion<()>,
}

struct PendingSubscribe {
    filter: String,
    qos: QoS,
    resp: Completion<()>,
}

/// Opening packet of a new exchange.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub epoch: u64,
    pub pkid: u16,
    pub packet: Packet,
}

/// What the caller must do after feeding a packet to the session.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Reaction {
    /// Packet to send back to the broker.
    pub reply: Option<Packet>,
    /// Message released to listeners.
    pub deliver: Option<Message>,
    /// The broker ended the connection.
    pub close: bool,
}

pub(crate) struct Session {
    state: ConnectionState,
    epoch: u64,
    clean_start: bool,
    packet_ids: PacketIdAllocator,
    outbound: HashMap<u16, OutboundExchange>,
    /// Inbound messages held until the broker releases them.
    inbound: HashMap<u16, Message>,
    subscribes: HashMap<u16, PendingSubscribe>,
    subscriptions: Vec<Subscription>,
}

impl Session {
    pub fn new(clean_start: bool) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
            clean_start,
            packet_ids: PacketIdAllocator::new(),
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            subscribes: HashMap::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Enter `Connecting` and open a new epoch.
    pub fn start_connect(&mut self) -> u64 {
        self.state = ConnectionState::Connecting;
        self.epoch += 1;
        self.epoch
    }

    /// Apply the broker's CONNACK.
    pub fn on_connack(&mut self, epoch: u64, connack: &ConnAck) -> Result<()> {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            return Err(Error::ConnectionLost);
        }

        if !connack.code.is_success() {
            self.state = ConnectionState::Disconnected;
            return Err(Error::ConnectRejected {
                code: connack.code,
                reason: connack.properties.reason_string.clone(),
            });
        }

        if !connack.session_present {
            if !self.inbound.is_empty() {
                debug!(
                    "Broker has no session, dropping {} unreleased messages",
                    self.inbound.len()
                );
            }
            self.inbound.clear();
            self.subscriptions.clear();
        }

        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// The connect attempt of `epoch` failed before CONNACK.
    pub fn connect_failed(&mut self, epoch: u64) {
        if epoch == self.epoch && self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Enter `Disconnecting`. Returns false when there is nothing to close.
    pub fn begin_disconnect(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        self.state = ConnectionState::Disconnecting;
        true
    }

    /// Tear down the connection of `epoch` and fail every pending operation
    /// with [`Error::ConnectionLost`].
    ///
    /// Returns false if `epoch` is stale or already closed.
    pub fn close(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.state == ConnectionState::Disconnected {
            return false;
        }
        self.state = ConnectionState::Disconnected;

        let failed = self.outbound.len() + self.subscribes.len();
        for (_, exchange) in self.outbound.drain() {
            let _ = exchange.resp.send(Err(Error::ConnectionLost));
        }
        for (_, pending) in self.subscribes.drain() {
            let _ = pending.resp.send(Err(Error::ConnectionLost));
        }
        self.packet_ids.clear();

        if self.clean_start {
            self.inbound.clear();
        }

        if failed > 0 {
            debug!("Failed {} pending operations after connection close", failed);
        }
        true
    }

    // ========================================================================
    // Outbound operations
    // ========================================================================

    /// Open an outbound exchange for `msg`.
    pub fn begin_publish(&mut self, msg: &Message, resp: Completion<()>) -> Result<Outgoing> {
        if self.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let pkid = self.packet_ids.allocate().ok_or(Error::PacketIdsExhausted)?;

        self.outbound.insert(
            pkid,
            OutboundExchange {
                phase: OutboundPhase::AwaitingPubRec,
                resp,
            },
        );

        let packet = Packet::Publish(Publish {
            topic: msg.topic.clone(),
            payload: msg.payload.clone(),
            qos: QoS::ExactlyOnce,
            dup: false,
            retain: false,
            pkid,
            properties: Properties::default(),
        });
        Ok(Outgoing {
            epoch: self.epoch,
            pkid,
            packet,
        })
    }

    /// Open a SUBSCRIBE exchange for `filter` at QoS 2.
    pub fn begin_subscribe(&mut self, filter: &str, resp: Completion<()>) -> Result<Outgoing> {
        if self.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let pkid = self.packet_ids.allocate().ok_or(Error::PacketIdsExhausted)?;

        self.subscribes.insert(
            pkid,
            PendingSubscribe {
                filter: filter.to_string(),
                qos: QoS::ExactlyOnce,
                resp,
            },
        );

        let packet = Packet::Subscribe(Subscribe {
            pkid,
            filters: vec![SubscribeFilter {
                path: filter.to_string(),
                qos: QoS::ExactlyOnce,
            }],
            properties: Properties::default(),
        });
        Ok(Outgoing {
            epoch: self.epoch,
            pkid,
            packet,
        })
    }

    /// Drop an exchange whose opening packet could not be encoded.
    pub fn abandon(&mut self, pkid: u16) {
        self.outbound.remove(&pkid);
        self.subscribes.remove(&pkid);
        self.packet_ids.release(pkid);
    }

    // ========================================================================
    // Inbound packets
    // ========================================================================

    /// Advance the state machine with a packet from the broker.
    pub fn handle(&mut self, packet: Packet) -> Reaction {
        match packet {
            Packet::Publish(publish) => self.on_publish(publish),
            Packet::PubRel(ack) => self.on_pubrel(ack),
            Packet::PubRec(ack) => self.on_pubrec(ack),
            Packet::PubComp(ack) => self.on_pubcomp(ack),
            Packet::SubAck(ack) => {
                self.on_suback(ack);
                Reaction::default()
            }
            Packet::PingResp => {
                trace!("Received PingResp");
                Reaction::default()
            }
            Packet::Disconnect(disconnect) => {
                warn!(
                    "Broker sent DISCONNECT: {:?}{}",
                    disconnect.reason_code,
                    disconnect
                        .properties
                        .reason_string
                        .map(|r| format!(" ({})", r))
                        .unwrap_or_default()
                );
                Reaction {
                    close: true,
                    ..Default::default()
                }
            }
            other => {
                trace!("Ignoring packet: {:?}", other.packet_type());
                Reaction::default()
            }
        }
    }

    fn on_publish(&mut self, publish: Publish) -> Reaction {
        let pkid = publish.pkid;
        let msg = Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
        };

        match msg.qos {
            QoS::AtMostOnce => Reaction {
                deliver: Some(msg),
                ..Default::default()
            },
            QoS::AtLeastOnce => Reaction {
                reply: Some(Packet::PubAck(Ack::new(pkid, PubReasonCode::Success))),
                deliver: Some(msg),
                ..Default::default()
            },
            QoS::ExactlyOnce => {
                if self.inbound.contains_key(&pkid) {
                    trace!("Retransmitted PUBLISH pkid={}, answering PUBREC again", pkid);
                } else {
                    trace!("Holding message on {} until PUBREL (pkid={})", msg.topic, pkid);
                    self.inbound.insert(pkid, msg);
                }
                Reaction {
                    reply: Some(Packet::PubRec(Ack::new(pkid, PubReasonCode::Success))),
                    ..Default::default()
                }
            }
        }
    }

    fn on_pubrel(&mut self, ack: Ack) -> Reaction {
        match self.inbound.remove(&ack.pkid) {
            Some(msg) => Reaction {
                reply: Some(Packet::PubComp(Ack::new(ack.pkid, PubReasonCode::Success))),
                deliver: Some(msg),
                ..Default::default()
            },
            None => {
                debug!("PUBREL for unknown pkid={}", ack.pkid);
                Reaction {
                    reply: Some(Packet::PubComp(Ack::new(
                        ack.pkid,
                        PubReasonCode::PacketIdentifierNotFound,
                    ))),
                    ..Default::default()
                }
            }
        }
    }

    fn on_pubrec(&mut self, ack: Ack) -> Reaction {
        let Some(exchange) = self.outbound.get_mut(&ack.pkid) else {
            trace!("Discarding PUBREC for closed pkid={}", ack.pkid);
            return Reaction::default();
        };

        if exchange.phase == OutboundPhase::AwaitingPubComp {
            trace!("Duplicate PUBREC pkid={}, re-sending PUBREL", ack.pkid);
            return Reaction {
                reply: Some(Packet::PubRel(Ack::new(ack.pkid, PubReasonCode::Success))),
                ..Default::default()
            };
        }

        if !ack.code.is_success() {
            self.finish_publish(
                ack.pkid,
                Err(Error::PublishRejected {
                    phase: PublishPhase::PubRec,
                    code: ack.code,
                    reason: ack.properties.reason_string,
                }),
            );
            return Reaction::default();
        }

        exchange.phase = OutboundPhase::AwaitingPubComp;
        Reaction {
            reply: Some(Packet::PubRel(Ack::new(ack.pkid, PubReasonCode::Success))),
            ..Default::default()
        }
    }

    fn on_pubcomp(&mut self, ack: Ack) -> Reaction {
        match self.outbound.get(&ack.pkid).map(|e| e.phase) {
            Some(OutboundPhase::AwaitingPubComp) => {
                let result = if ack.code.is_success() {
                    Ok(())
                } else {
                    Err(Error::PublishRejected {
                        phase: PublishPhase::PubComp,
                        code: ack.code,
                        reason: ack.properties.reason_string,
                    })
                };
                self.finish_publish(ack.pkid, result);
            }
            Some(OutboundPhase::AwaitingPubRec) => {
                warn!("PUBCOMP before PUBREC for pkid={}, ignoring", ack.pkid);
            }
            None => trace!("Discarding PUBCOMP for closed pkid={}", ack.pkid),
        }
        Reaction::default()
    }

    fn finish_publish(&mut self, pkid: u16, result: Result<()>) {
        if let Some(exchange) = self.outbound.remove(&pkid) {
            self.packet_ids.release(pkid);
            trace!("Publish pkid={} finished: {:?}", pkid, result.as_ref().err());
            let _ = exchange.resp.send(result);
        }
    }

    fn on_suback(&mut self, ack: SubAck) {
        let Some(pending) = self.subscribes.remove(&ack.pkid) else {
            trace!("Discarding SUBACK for closed pkid={}", ack.pkid);
            return;
        };
        self.packet_ids.release(ack.pkid);
        debug!("Received SubAck for pkid={}: {:?}", ack.pkid, ack.return_codes);

        let result = match ack.return_codes.first() {
            Some(SubscribeReasonCode::Success(granted)) => {
                self.subscriptions.retain(|s| s.filter != pending.filter);
                self.subscriptions.push(Subscription {
                    filter: pending.filter.clone(),
                    qos: *granted,
                });
                if *granted < pending.qos {
                    Err(Error::QosDowngraded {
                        filter: pending.filter,
                        granted: *granted,
                    })
                } else {
                    Ok(())
                }
            }
            Some(code) => Err(Error::SubscribeRejected {
                filter: pending.filter,
                code: *code,
            }),
            None => Err(Error::MalformedPacket("SUBACK without reason codes".into())),
        };
        let _ = pending.resp.send(result);
    }

    #[cfg(test)]
    fn open_exchanges(&self) -> usize {
        self.outbound.len() + self.subscribes.len()
    }
}
