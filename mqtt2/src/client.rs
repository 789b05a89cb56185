//! Exactly-once MQTT 5 client.
//!
//! A [`Client`] is a cheap handle around shared connection state. Every
//! operation may be called concurrently from any task. One reader task per
//! connection feeds inbound packets to the session, resolves completions and
//! pushes released messages to listeners.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{ClientConfig, MqttConnection};
use crate::error::{Error, Result};
use crate::protocol::codec::malformed;
use crate::protocol::{Disconnect, DisconnectReasonCode, Packet, Properties};
use crate::session::{ConnectionState, Session};
use crate::stream::MessageStream;
use crate::topic;
use crate::transport::{Transport, TransportReader, TransportWriter};
use crate::types::{Handler, Message, Subscription};

/// Write half of the live connection, tagged with its epoch.
struct Connection {
    epoch: u64,
    writer: TransportWriter,
}

struct Listener {
    filter: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort(&mut self) {
        if let Some(task) = self.reader.take() {
            task.abort();
        }
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
    }
}

struct Shared {
    config: ClientConfig,
    session: Mutex<Session>,
    /// Single writer; frames never interleave.
    conn: tokio::sync::Mutex<Option<Connection>>,
    /// Serializes connect and disconnect.
    connecting: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<Listener>>,
    tasks: Mutex<Tasks>,
}

/// Exactly-once MQTT 5 client.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Create a client. Does not connect.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let session = Session::new(config.clean_start);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                session: Mutex::new(session),
                conn: tokio::sync::Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                tasks: Mutex::new(Tasks::default()),
            }),
        })
    }

    /// Create a client with a persistent session from a connection section.
    pub fn from_connection(client_id: impl Into<String>, conn: &MqttConnection) -> Result<Self> {
        Self::new(conn.client_config(client_id))
    }

    /// Get the client ID.
    pub fn client_id(&self) -> &str {
        &self.shared.config.client_id
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.session.lock().state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscriptions acknowledged by the broker.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.session.lock().subscriptions().to_vec()
    }

    /// Connect to the broker.
    ///
    /// Returns immediately if already connected. Concurrent callers share a
    /// single attempt.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let _guard = self.shared.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.shared.establish().await
    }

    /// Publish a payload exactly once.
    ///
    /// Connects first if needed. Completes when the broker acknowledges with
    /// a successful PUBCOMP.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_message(Message::new(topic, payload)).await
    }

    /// Publish a text payload exactly once.
    pub async fn publish_str(&self, topic: &str, text: &str) -> Result<()> {
        self.publish(topic, Bytes::copy_from_slice(text.as_bytes())).await
    }

    /// Publish a message exactly once. The message QoS is ignored.
    pub async fn publish_message(&self, msg: Message) -> Result<()> {
        msg.validate()?;
        self.connect().await?;

        let (tx, rx) = oneshot::channel();
        let out = self.shared.session.lock().begin_publish(&msg, tx)?;
        trace!(
            "Publishing to {} ({} bytes, pkid={})",
            msg.topic,
            msg.payload.len(),
            out.pkid
        );

        if let Err(e) = self.shared.send(out.epoch, &out.packet).await {
            // Connection errors already failed the exchange.
            if !e.is_connection_error() {
                self.shared.session.lock().abandon(out.pkid);
                return Err(e);
            }
        }

        self.shared.wait(rx, "PUBCOMP").await
    }

    /// Subscribe to a topic filter at QoS 2.
    ///
    /// Fails with [`Error::SubscribeRejected`] on a failure reason code and
    /// with [`Error::QosDowngraded`] when the broker grants less than QoS 2.
    pub async fn subscribe(&self, filter: &str) -> Result<()> {
        topic::validate_topic_filter(filter)?;
        self.connect().await?;

        let (tx, rx) = oneshot::channel();
        let out = self.shared.session.lock().begin_subscribe(filter, tx)?;
        debug!("Subscribing to {} with pkid={}", filter, out.pkid);

        if let Err(e) = self.shared.send(out.epoch, &out.packet).await {
            if !e.is_connection_error() {
                self.shared.session.lock().abandon(out.pkid);
                return Err(e);
            }
        }

        self.shared.wait(rx, "SUBACK").await
    }

    /// Subscribe and return a stream of the messages matching `filter`.
    pub async fn subscribe_stream(&self, filter: &str) -> Result<MessageStream> {
        topic::validate_topic_filter(filter)?;
        let stream = self.shared.listen(Some(filter.to_string()));
        self.subscribe(filter).await?;
        Ok(stream)
    }

    /// A new reader of every inbound message.
    pub fn messages(&self) -> MessageStream {
        self.shared.listen(None)
    }

    /// Invoke `handler` for every inbound message on a background task.
    ///
    /// The task ends when the client is dropped.
    pub fn on_message<H>(&self, handler: H) -> JoinHandle<()>
    where
        H: Handler + 'static,
    {
        let mut stream = self.messages();
        tokio::spawn(async move {
            while let Some(msg) = stream.recv().await {
                handler.handle(&msg);
            }
        })
    }

    /// Disconnect gracefully.
    ///
    /// Pending operations fail with [`Error::ConnectionLost`].
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.shared.connecting.lock().await;

        let epoch = {
            let mut session = self.shared.session.lock();
            if !session.begin_disconnect() {
                return Ok(());
            }
            session.epoch()
        };
        debug!("Disconnecting");

        let conn = self.shared.conn.lock().await.take();
        if let Some(mut conn) = conn {
            let packet = Packet::Disconnect(Disconnect::default());
            if let Err(e) = conn.writer.send_packet(&packet).await {
                debug!("DISCONNECT not sent: {}", e);
            }
            conn.writer.close().await;
        }

        self.shared.session.lock().close(epoch);
        self.shared.tasks.lock().abort();
        info!("Disconnected from {}", self.shared.config.addr());
        Ok(())
    }
}

impl Shared {
    async fn establish(self: &Arc<Self>) -> Result<()> {
        let epoch = self.session.lock().start_connect();
        info!(
            "Connecting to {} as {}",
            self.config.addr(),
            self.config.client_id
        );

        let result = self.handshake(epoch).await;
        if let Err(e) = &result {
            self.session.lock().connect_failed(epoch);
            warn!("Connect to {} failed: {}", self.config.addr(), e);
        }
        result
    }

    async fn handshake(self: &Arc<Self>, epoch: u64) -> Result<()> {
        let deadline = Instant::now() + self.config.connect_timeout;

        let transport = Transport::connect(&self.config).await?;
        let (mut reader, mut writer) = transport.split(self.config.max_packet_size);

        let connect = Packet::Connect(self.config.connect_packet());
        writer.send_packet(&connect).await.map_err(|e| match e {
            Error::Io(e) => Error::Connection(e),
            other => other,
        })?;

        let packet = tokio::time::timeout_at(deadline, reader.next_packet())
            .await
            .map_err(|_| Error::Timeout("CONNACK"))??;
        let connack = match packet {
            Packet::ConnAck(connack) => connack,
            other => {
                return Err(malformed(format!(
                    "expected CONNACK, got {:?}",
                    other.packet_type()
                )));
            }
        };

        {
            let mut conn = self.conn.lock().await;
            self.session.lock().on_connack(epoch, &connack)?;
            *conn = Some(Connection { epoch, writer });
        }
        info!(
            "Connected to {}, session_present={}",
            self.config.addr(),
            connack.session_present
        );

        let keep_alive = connack
            .properties
            .server_keep_alive
            .unwrap_or(self.config.keep_alive);

        let mut tasks = self.tasks.lock();
        tasks.abort();
        tasks.reader = Some(tokio::spawn(read_loop(
            Arc::downgrade(self),
            epoch,
            reader,
        )));
        if self.config.auto_keepalive && keep_alive > 0 {
            let interval = Duration::from_secs(keep_alive as u64) / 2;
            tasks.keepalive = Some(tokio::spawn(keepalive_loop(
                Arc::downgrade(self),
                epoch,
                interval,
            )));
            debug!("Started auto keepalive task (interval={:?})", interval);
        }
        Ok(())
    }

    /// Encode and write one packet on the connection of `epoch`.
    ///
    /// A write failure tears the connection down.
    async fn send(&self, epoch: u64, packet: &Packet) -> Result<()> {
        let frame = packet.to_bytes()?;

        let result = {
            let mut conn = self.conn.lock().await;
            match conn.as_mut() {
                Some(c) if c.epoch == epoch => c.writer.send(&frame).await,
                _ => return Err(Error::NotConnected),
            }
        };

        if let Err(e) = &result {
            warn!("Write to {} failed: {}", self.config.addr(), e);
            self.fail_connection(epoch).await;
        }
        result
    }

    async fn wait(&self, rx: oneshot::Receiver<Result<()>>, what: &'static str) -> Result<()> {
        match tokio::time::timeout(self.config.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                warn!("Timed out waiting for {}", what);
                Err(Error::Timeout(what))
            }
        }
    }

    async fn handle_packet(&self, epoch: u64, packet: Packet) -> Result<()> {
        let reaction = {
            let mut session = self.session.lock();
            if session.epoch() != epoch {
                return Ok(());
            }
            session.handle(packet)
        };

        let sent = match &reaction.reply {
            Some(reply) => self.send(epoch, reply).await,
            None => Ok(()),
        };

        // A released message is delivered even if its PUBCOMP was lost.
        if let Some(msg) = reaction.deliver {
            self.dispatch(msg);
        }

        sent?;
        if reaction.close {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Tear down the connection of `epoch` if it is still the live one.
    async fn fail_connection(&self, epoch: u64) {
        if !self.session.lock().close(epoch) {
            return;
        }
        warn!("Connection to {} lost", self.config.addr());

        let conn = {
            let mut guard = self.conn.lock().await;
            if guard.as_ref().is_some_and(|c| c.epoch == epoch) {
                guard.take()
            } else {
                None
            }
        };
        if let Some(mut conn) = conn {
            conn.writer.close().await;
        }

        // Last, as this may abort the calling task.
        self.tasks.lock().abort();
    }

    fn listen(&self, filter: Option<String>) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(Listener { filter, tx });
        MessageStream::new(rx)
    }

    fn dispatch(&self, msg: Message) {
        let mut listeners = self.listeners.lock();
        let mut delivered = 0;
        listeners.retain(|l| {
            let wanted = l
                .filter
                .as_deref()
                .is_none_or(|f| topic::matches(f, &msg.topic));
            if !wanted {
                return !l.tx.is_closed();
            }
            let ok = l.tx.send(msg.clone()).is_ok();
            if ok {
                delivered += 1;
            }
            ok
        });
        trace!("Delivered message on {} to {} listeners", msg.topic, delivered);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.tasks.get_mut().abort();

        let Some(mut conn) = self.conn.get_mut().take() else {
            return;
        };
        debug!("Client {} dropped, closing connection", self.config.client_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let packet = Packet::Disconnect(Disconnect::default());
                let _ = conn.writer.send_packet(&packet).await;
                conn.writer.close().await;
            });
        }
    }
}

async fn read_loop(weak: Weak<Shared>, epoch: u64, mut reader: TransportReader) {
    loop {
        let result = reader.next_packet().await;
        let Some(shared) = weak.upgrade() else {
            return;
        };

        let result = match result {
            Ok(packet) => shared.handle_packet(epoch, packet).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            match &e {
                Error::ConnectionClosed => debug!("Connection closed by broker"),
                Error::MalformedPacket(_) | Error::PacketTooLarge { .. } => {
                    warn!("Protocol violation from broker: {}", e);
                    let code = if matches!(e, Error::PacketTooLarge { .. }) {
                        DisconnectReasonCode::PacketTooLarge
                    } else {
                        DisconnectReasonCode::MalformedPacket
                    };
                    let packet = Packet::Disconnect(Disconnect {
                        reason_code: code,
                        properties: Properties::default(),
                    });
                    let _ = shared.send(epoch, &packet).await;
                }
                _ => warn!("Read loop stopped: {}", e),
            }
            shared.fail_connection(epoch).await;
            return;
        }
    }
}

async fn keepalive_loop(weak: Weak<Shared>, epoch: u64, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let Some(shared) = weak.upgrade() else {
            trace!("Keepalive task stopping");
            return;
        };

        if let Err(e) = shared.send(epoch, &Packet::PingReq).await {
            warn!("Keepalive ping failed: {}", e);
            return;
        }
        trace!("Keepalive ping sent");
    }
}
