//! Exactly-once (QoS 2) MQTT 5 client core.
//!
//! This crate provides a native MQTT 5 client that publishes and subscribes
//! at QoS 2 over a single persistent connection:
//!
//! - **Connect**: CONNECT / CONNACK with bounded waits
//! - **Publish**: PUBLISH → PUBREC → PUBREL → PUBCOMP, completing only on a
//!   successful PUBCOMP
//! - **Receive**: PUBLISH → PUBREC → PUBREL → PUBCOMP, delivering each message
//!   exactly once after PUBREL
//!
//! ## Components
//!
//! - [`Client`]: cloneable client handle
//! - [`ClientConfig`] / [`MqttConnection`]: configuration
//! - [`MessageStream`]: inbound message reader
//! - [`protocol`]: MQTT 5 packet codec
//! - [`transport`]: TCP / TLS byte stream
//!
//! ## Example
//!
//! ```no_run
//! use mqtt2::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> mqtt2::Result<()> {
//!     let client = Client::new(ClientConfig::new("127.0.0.1", "robot-1"))?;
//!
//!     let mut stream = client.subscribe_stream("robot/cmd").await?;
//!     client.publish("robot/status", "ready").await?;
//!
//!     while let Some(msg) = stream.recv().await {
//!         println!("{}: {:?}", msg.topic, msg.payload_str());
//!     }
//!
//!     client.disconnect().await
//! }
//! ```

mod client;
mod config;
mod error;
mod packet_id;
pub mod protocol;
mod session;
mod stream;
pub mod topic;
pub mod transport;
mod types;

pub use client::Client;
pub use config::{ClientConfig, MqttConnection, DEFAULT_PORT, DEFAULT_TLS_PORT};
pub use error::{Error, PublishPhase, Result};
pub use session::ConnectionState;
pub use stream::MessageStream;
pub use types::{Handler, Message, QoS, Subscription};

#[cfg(feature = "tls")]
pub use transport::tls::TlsConfig;

#[cfg(test)]
mod tests;
