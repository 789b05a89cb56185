//! Integration tests for mqtt2.
//!
//! The client runs against a small in-process broker built on the crate's
//! own codec. The broker routes QoS 2 messages between connections and can
//! be scripted to misbehave (reject, stay silent, duplicate acks, drop the
//! connection).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::{
    Ack, ConnAck, ConnectReasonCode, Disconnect, DisconnectReasonCode, Packet, Properties,
    PubReasonCode, Publish, SubAck, SubscribeReasonCode, MAX_PACKET_SIZE,
};
use crate::topic;
use crate::transport::{Transport, TransportWriter};
use crate::{Client, ClientConfig, ConnectionState, Error, Message, PublishPhase, QoS};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ============================================================================
// Test broker
// ============================================================================

/// How the test broker deviates from a well-behaved broker.
#[derive(Clone)]
struct Script {
    connack_code: ConnectReasonCode,
    /// Never answer CONNECT.
    silent_connack: bool,
    /// Send DISCONNECT right after CONNACK.
    disconnect_after_connack: bool,
    pubrec_code: PubReasonCode,
    pubcomp_code: PubReasonCode,
    /// Never answer PUBLISH.
    swallow_publish: bool,
    /// Close the socket on the first PUBLISH of the broker's lifetime.
    drop_first_publish: bool,
    /// Send another PUBREC after PUBCOMP.
    duplicate_pubrec: bool,
    /// Send every delivery twice before waiting for PUBREC.
    resend_deliveries: bool,
    suback_code: SubscribeReasonCode,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            connack_code: ConnectReasonCode::Success,
            silent_connack: false,
            disconnect_after_connack: false,
            pubrec_code: PubReasonCode::Success,
            pubcomp_code: PubReasonCode::Success,
            swallow_publish: false,
            drop_first_publish: false,
            duplicate_pubrec: false,
            resend_deliveries: false,
            suback_code: SubscribeReasonCode::Success(QoS::ExactlyOnce),
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    connects: Vec<String>,
    publishes: usize,
    /// PUBLISH packets reusing an identifier that was still open.
    reused_ids: usize,
    max_in_flight: usize,
    pings: usize,
}

struct Route {
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<Message>,
}

struct BrokerShared {
    script: Script,
    stats: Mutex<Stats>,
    routes: Mutex<HashMap<u64, Route>>,
    dropped: AtomicBool,
}

impl BrokerShared {
    fn route(&self, msg: &Message) {
        for route in self.routes.lock().values() {
            if route.filters.iter().any(|f| topic::matches(f, &msg.topic)) {
                let _ = route.tx.send(msg.clone());
            }
        }
    }
}

struct TestBroker {
    port: u16,
    shared: Arc<BrokerShared>,
    task: JoinHandle<()>,
}

impl TestBroker {
    async fn start(script: Script) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(BrokerShared {
            script,
            stats: Mutex::new(Stats::default()),
            routes: Mutex::new(HashMap::new()),
            dropped: AtomicBool::new(false),
        });

        let accept_shared = shared.clone();
        let task = tokio::spawn(async move {
            let next_id = AtomicU64::new(1);
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let id = next_id.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, id, accept_shared.clone()));
            }
        });

        Self { port, shared, task }
    }

    fn config(&self, client_id: &str) -> ClientConfig {
        ClientConfig::new("127.0.0.1", client_id)
            .with_port(self.port)
            .with_connect_timeout(Duration::from_secs(2))
            .with_ack_timeout(Duration::from_secs(2))
            .with_auto_keepalive(false)
    }

    fn client(&self, client_id: &str) -> Client {
        Client::new(self.config(client_id)).unwrap()
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct BrokerConn {
    id: u64,
    shared: Arc<BrokerShared>,
    writer: TransportWriter,
    inbound: HashMap<u16, Message>,
    next_pkid: u16,
}

async fn serve(stream: TcpStream, id: u64, shared: Arc<BrokerShared>) {
    let (mut reader, writer) = Transport::Tcp(stream).split(MAX_PACKET_SIZE);

    let Ok(Packet::Connect(connect)) = reader.next_packet().await else {
        return;
    };
    shared.stats.lock().connects.push(connect.client_id);

    let mut conn = BrokerConn {
        id,
        shared: shared.clone(),
        writer,
        inbound: HashMap::new(),
        next_pkid: 0,
    };

    if shared.script.silent_connack {
        let _ = reader.next_packet().await;
        return;
    }

    let code = shared.script.connack_code;
    let connack = Packet::ConnAck(ConnAck {
        session_present: false,
        code,
        properties: Properties::default(),
    });
    if !conn.send(connack).await || !code.is_success() {
        return;
    }

    if shared.script.disconnect_after_connack {
        conn.send(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::ServerShuttingDown,
            properties: Properties::default(),
        }))
        .await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    shared.routes.lock().insert(
        id,
        Route {
            filters: Vec::new(),
            tx,
        },
    );

    loop {
        tokio::select! {
            packet = reader.next_packet() => {
                match packet {
                    Ok(packet) => {
                        if !conn.on_packet(packet).await {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            Some(msg) = rx.recv() => {
                if !conn.deliver(msg).await {
                    break;
                }
            }
        }
    }

    shared.routes.lock().remove(&id);
}

impl BrokerConn {
    async fn send(&mut self, packet: Packet) -> bool {
        self.writer.send_packet(&packet).await.is_ok()
    }

    async fn deliver(&mut self, msg: Message) -> bool {
        self.next_pkid = self.next_pkid.checked_add(1).unwrap_or(1);
        let mut publish = Publish {
            topic: msg.topic,
            payload: msg.payload,
            qos: QoS::ExactlyOnce,
            dup: false,
            retain: false,
            pkid: self.next_pkid,
            properties: Properties::default(),
        };
        if !self.send(Packet::Publish(publish.clone())).await {
            return false;
        }
        if self.shared.script.resend_deliveries {
            publish.dup = true;
            return self.send(Packet::Publish(publish)).await;
        }
        true
    }

    async fn on_packet(&mut self, packet: Packet) -> bool {
        let script = self.shared.script.clone();
        match packet {
            Packet::Publish(p) => {
                if script.drop_first_publish && !self.shared.dropped.swap(true, Ordering::SeqCst) {
                    return false;
                }
                if script.swallow_publish {
                    return true;
                }

                {
                    let mut stats = self.shared.stats.lock();
                    stats.publishes += 1;
                    if self.inbound.contains_key(&p.pkid) && !p.dup {
                        stats.reused_ids += 1;
                    }
                }

                if script.pubrec_code.is_success() {
                    self.inbound.insert(
                        p.pkid,
                        Message {
                            topic: p.topic,
                            payload: p.payload,
                            qos: p.qos,
                        },
                    );
                    let mut stats = self.shared.stats.lock();
                    stats.max_in_flight = stats.max_in_flight.max(self.inbound.len());
                }
                self.send(Packet::PubRec(Ack::new(p.pkid, script.pubrec_code)))
                    .await
            }
            Packet::PubRel(ack) => {
                let msg = self.inbound.remove(&ack.pkid);
                let code = match &msg {
                    Some(_) => script.pubcomp_code,
                    None => PubReasonCode::PacketIdentifierNotFound,
                };
                if let Some(msg) = &msg {
                    if code.is_success() {
                        self.shared.route(msg);
                    }
                }
                if !self.send(Packet::PubComp(Ack::new(ack.pkid, code))).await {
                    return false;
                }
                if script.duplicate_pubrec {
                    return self
                        .send(Packet::PubRec(Ack::new(ack.pkid, PubReasonCode::Success)))
                        .await;
                }
                true
            }
            Packet::PubRec(ack) => {
                self.send(Packet::PubRel(Ack::new(ack.pkid, PubReasonCode::Success)))
                    .await
            }
            Packet::PubComp(_) => true,
            Packet::Subscribe(sub) => {
                let code = script.suback_code;
                if matches!(code, SubscribeReasonCode::Success(_)) {
                    if let Some(route) = self.shared.routes.lock().get_mut(&self.id) {
                        route
                            .filters
                            .extend(sub.filters.iter().map(|f| f.path.clone()));
                    }
                }
                self.send(Packet::SubAck(SubAck {
                    pkid: sub.pkid,
                    return_codes: vec![code; sub.filters.len()],
                    properties: Properties::default(),
                }))
                .await
            }
            Packet::PingReq => {
                self.shared.stats.lock().pings += 1;
                self.send(Packet::PingResp).await
            }
            Packet::Disconnect(_) => false,
            _ => true,
        }
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
async fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ============================================================================
// Tests: connection lifecycle
// ============================================================================

mod connect_tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let broker = TestBroker::start(Script::default()).await;
        let client = broker.client("t1");

        client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        // Idempotent.
        client.connect().await.unwrap();
        assert_eq!(broker.shared.stats.lock().connects, vec!["t1".to_string()]);

        client.disconnect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let broker = TestBroker::start(Script::default()).await;
        let client = broker.client("t1");

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.connect().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(broker.shared.stats.lock().connects.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_within_timeout() {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = Client::new(
            ClientConfig::new("127.0.0.1", "t1")
                .with_port(port)
                .with_connect_timeout(Duration::from_millis(500)),
        )
        .unwrap();

        let start = Instant::now();
        let result = client.connect().await;
        assert!(matches!(result, Err(Error::Connection(_))), "{:?}", result);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_silent_broker_times_out() {
        let broker = TestBroker::start(Script {
            silent_connack: true,
            ..Default::default()
        })
        .await;
        let client = Client::new(
            broker
                .config("t1")
                .with_connect_timeout(Duration::from_millis(300)),
        )
        .unwrap();

        let start = Instant::now();
        let result = client.connect().await;
        assert!(matches!(result, Err(Error::Timeout("CONNACK"))), "{:?}", result);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let broker = TestBroker::start(Script {
            connack_code: ConnectReasonCode::BadUserNameOrPassword,
            ..Default::default()
        })
        .await;
        let client = broker.client("t1");

        let result = client.connect().await;
        assert!(
            matches!(
                result,
                Err(Error::ConnectRejected {
                    code: ConnectReasonCode::BadUserNameOrPassword,
                    ..
                })
            ),
            "{:?}",
            result
        );
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_broker_disconnect_is_connection_loss() {
        let broker = TestBroker::start(Script {
            disconnect_after_connack: true,
            ..Default::default()
        })
        .await;
        let client = broker.client("t1");

        client.connect().await.unwrap();
        assert!(
            wait_until(Duration::from_secs(2), || client.state()
                == ConnectionState::Disconnected)
            .await
        );
    }

    #[tokio::test]
    async fn test_keepalive_pings() {
        let broker = TestBroker::start(Script::default()).await;
        let client = Client::new(
            broker
                .config("t1")
                .with_keep_alive(1)
                .with_auto_keepalive(true),
        )
        .unwrap();

        client.connect().await.unwrap();
        assert!(
            wait_until(Duration::from_secs(3), || broker.shared.stats.lock().pings >= 2).await
        );
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_drop_closes_connection() {
        let broker = TestBroker::start(Script::default()).await;
        let client = broker.client("t1");
        client.connect().await.unwrap();
        assert!(wait_until(Duration::from_secs(1), || broker.shared.routes.lock().len() == 1).await);

        drop(client);
        assert!(wait_until(Duration::from_secs(2), || broker.shared.routes.lock().is_empty()).await);
    }
}

// ============================================================================
// Tests: exactly-once publish
// ============================================================================

mod publish_tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_completes() {
        let broker = TestBroker::start(Script::default()).await;
        let client = broker.client("t1");

        // Auto-connects.
        client.publish("a/b", "hello").await.unwrap();
        assert!(client.is_connected());
        assert_eq!(broker.shared.stats.lock().publishes, 1);
    }

    #[tokio::test]
    async fn test_scenario_two_clients() {
        let broker = TestBroker::start(Script::default()).await;

        let subscriber = broker.client("t2");
        let mut stream = subscriber.subscribe_stream("a/b").await.unwrap();

        let publisher = broker.client("t1");
        publisher.publish("a/b", "hello").await.unwrap();

        let msg = stream.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(msg.topic, "a/b");
        assert_eq!(msg.payload_str(), Some("hello"));
        assert_eq!(msg.qos, QoS::ExactlyOnce);

        assert!(stream.recv_timeout(Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn test_round_trip_on_same_client() {
        let broker = TestBroker::start(Script::default()).await;
        let client = broker.client("t1");

        let mut stream = client.subscribe_stream("echo/#").await.unwrap();
        let payloads = ["", "x", "hello world", "ünïcödé"];
        for (i, payload) in payloads.iter().enumerate() {
            let topic = format!("echo/{}", i);
            client.publish_str(&topic, payload).await.unwrap();

            let msg = stream.recv_timeout(Duration::from_secs(2)).await.unwrap();
            assert_eq!(msg.topic, topic);
            assert_eq!(msg.payload_str(), Some(*payload));
        }

        assert!(stream.recv_timeout(Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_publishes_use_distinct_ids() {
        let broker = TestBroker::start(Script::default()).await;
        let client = broker.client("t1");
        client.connect().await.unwrap();

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move { client.publish(&format!("load/{}", i), "x").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stats = broker.shared.stats.lock();
        assert_eq!(stats.publishes, 50);
        assert_eq!(stats.reused_ids, 0);
    }

    #[tokio::test]
    async fn test_pubrec_rejection() {
        let broker = TestBroker::start(Script {
            pubrec_code: PubReasonCode::NotAuthorized,
            ..Default::default()
        })
        .await;
        let client = broker.client("t1");

        let result = client.publish("a/b", "hello").await;
        assert!(
            matches!(
                result,
                Err(Error::PublishRejected {
                    phase: PublishPhase::PubRec,
                    code: PubReasonCode::NotAuthorized,
                    ..
                })
            ),
            "{:?}",
            result
        );
        // The connection survives a rejected publish.
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_pubcomp_rejection() {
        let broker = TestBroker::start(Script {
            pubcomp_code: PubReasonCode::PacketIdentifierNotFound,
            ..Default::default()
        })
        .await;
        let client = broker.client("t1");

        let result = client.publish("a/b", "hello").await;
        assert!(
            matches!(
                result,
                Err(Error::PublishRejected {
                    phase: PublishPhase::PubComp,
                    ..
                })
            ),
            "{:?}",
            result
        );
    }

    #[tokio::test]
    async fn test_duplicate_pubrec_is_discarded() {
        let broker = TestBroker::start(Script {
            duplicate_pubrec: true,
            ..Default::default()
        })
        .await;
        let client = broker.client("t1");
        let mut messages = client.messages();

        client.publish("a/b", "one").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.state(), ConnectionState::Connected);

        client.publish("a/b", "two").await.unwrap();
        assert_eq!(broker.shared.stats.lock().publishes, 2);
        assert!(messages.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_ack_timeout() {
        let broker = TestBroker::start(Script {
            swallow_publish: true,
            ..Default::default()
        })
        .await;
        let client = Client::new(
            broker
                .config("t1")
                .with_ack_timeout(Duration::from_millis(200)),
        )
        .unwrap();

        let result = client.publish("a/b", "hello").await;
        assert!(matches!(result, Err(Error::Timeout("PUBCOMP"))), "{:?}", result);
    }

    #[tokio::test]
    async fn test_disconnect_fails_in_flight() {
        let broker = TestBroker::start(Script {
            swallow_publish: true,
            ..Default::default()
        })
        .await;
        let client = broker.client("t1");
        client.connect().await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move { client.publish(&format!("a/{}", i), "x").await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(200)).await;

        client.disconnect().await.unwrap();

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(Error::ConnectionLost)), "{:?}", result);
        }
    }

    #[tokio::test]
    async fn test_connection_drop_fails_in_flight_then_reconnects() {
        let broker = TestBroker::start(Script {
            drop_first_publish: true,
            ..Default::default()
        })
        .await;
        let client = broker.client("t1");

        let result = client.publish("a/b", "lost").await;
        assert!(matches!(result, Err(Error::ConnectionLost)), "{:?}", result);
        assert!(
            wait_until(Duration::from_secs(1), || client.state()
                == ConnectionState::Disconnected)
            .await
        );

        client.publish("a/b", "again").await.unwrap();
        assert_eq!(broker.shared.stats.lock().connects.len(), 2);
    }
}

// ============================================================================
// Tests: exactly-once receive
// ============================================================================

mod subscribe_tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_records_subscription() {
        let broker = TestBroker::start(Script::default()).await;
        let client = broker.client("t1");

        client.subscribe("a/+").await.unwrap();
        let subs = client.subscriptions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].filter, "a/+");
        assert_eq!(subs[0].qos, QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_subscribe_rejected() {
        let broker = TestBroker::start(Script {
            suback_code: SubscribeReasonCode::NotAuthorized,
            ..Default::default()
        })
        .await;
        let client = broker.client("t1");

        let result = client.subscribe("a/b").await;
        assert!(
            matches!(
                result,
                Err(Error::SubscribeRejected {
                    code: SubscribeReasonCode::NotAuthorized,
                    ..
                })
            ),
            "{:?}",
            result
        );
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_downgraded() {
        let broker = TestBroker::start(Script {
            suback_code: SubscribeReasonCode::Success(QoS::AtLeastOnce),
            ..Default::default()
        })
        .await;
        let client = broker.client("t1");

        let result = client.subscribe("a/b").await;
        assert!(
            matches!(
                result,
                Err(Error::QosDowngraded {
                    granted: QoS::AtLeastOnce,
                    ..
                })
            ),
            "{:?}",
            result
        );
    }

    #[tokio::test]
    async fn test_retransmitted_delivery_is_delivered_once() {
        let broker = TestBroker::start(Script {
            resend_deliveries: true,
            ..Default::default()
        })
        .await;

        let subscriber = broker.client("t2");
        let mut stream = subscriber.subscribe_stream("a/b").await.unwrap();

        let publisher = broker.client("t1");
        publisher.publish("a/b", "hello").await.unwrap();

        let msg = stream.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(msg.payload_str(), Some("hello"));
        assert!(stream.recv_timeout(Duration::from_millis(300)).await.is_none());
        assert!(subscriber.is_connected());
    }

    #[tokio::test]
    async fn test_filtered_streams_and_handler() {
        let broker = TestBroker::start(Script::default()).await;
        let client = broker.client("t1");

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let _task = client.on_message(move |msg: &Message| {
            sink.lock().push(msg.topic.clone());
        });

        let mut sensors = client.subscribe_stream("sensor/+").await.unwrap();
        let mut alarms = client.subscribe_stream("alarm/#").await.unwrap();

        client.publish("sensor/temp", "21").await.unwrap();
        client.publish("alarm/fire/kitchen", "!").await.unwrap();

        let msg = sensors.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(msg.topic, "sensor/temp");
        let msg = alarms.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(msg.topic, "alarm/fire/kitchen");

        assert!(sensors.try_recv().is_none());
        assert!(alarms.try_recv().is_none());

        assert!(wait_until(Duration::from_secs(2), || received.lock().len() == 2).await);
        assert_eq!(
            *received.lock(),
            vec!["sensor/temp".to_string(), "alarm/fire/kitchen".to_string()]
        );
    }
}
