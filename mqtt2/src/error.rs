//! Error types for mqtt2.

use std::io;

use crate::protocol::{ConnectReasonCode, PubReasonCode, SubscribeReasonCode};
use crate::types::QoS;

/// Result type alias for mqtt2.
pub type Result<T> = std::result::Result<T, Error>;

/// Handshake step at which a QoS 2 publish was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPhase {
    /// The broker answered PUBLISH with a failing PUBREC.
    PubRec,
    /// The broker answered PUBREL with a failing PUBCOMP.
    PubComp,
}

impl std::fmt::Display for PublishPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishPhase::PubRec => write!(f, "PUBREC"),
            PublishPhase::PubComp => write!(f, "PUBCOMP"),
        }
    }
}

/// Error type for mqtt2 operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The byte stream to the broker could not be established.
    #[error("connection failed: {0}")]
    Connection(#[source] io::Error),

    /// The broker answered CONNECT with a failure reason code.
    #[error("connection refused: {code:?}{}", fmt_reason(.reason))]
    ConnectRejected {
        code: ConnectReasonCode,
        reason: Option<String>,
    },

    /// The broker rejected or aborted a QoS 2 exchange.
    #[error("publish rejected at {phase}: {code:?}{}", fmt_reason(.reason))]
    PublishRejected {
        phase: PublishPhase,
        code: PubReasonCode,
        reason: Option<String>,
    },

    /// The broker refused a subscription.
    #[error("subscribe to {filter} rejected: {code:?}")]
    SubscribeRejected {
        filter: String,
        code: SubscribeReasonCode,
    },

    /// The broker granted a lower QoS than requested.
    #[error("subscribe to {filter} downgraded: granted {granted:?}")]
    QosDowngraded { filter: String, granted: QoS },

    /// A received frame violates the wire format.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A frame exceeds the configured maximum size.
    #[error("packet too large: {size} > {max}")]
    PacketTooLarge { size: usize, max: usize },

    /// The established session dropped while the operation was pending.
    #[error("connection lost")]
    ConnectionLost,

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// No connection is established.
    #[error("not connected")]
    NotConnected,

    /// IO error on an established stream.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An acknowledgment did not arrive in time.
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    /// Every packet identifier is held by an open exchange.
    #[error("no free packet identifier")]
    PacketIdsExhausted,

    /// Topic name or topic filter is not valid.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Connection section could not be parsed.
    #[error("config parse error: {0}")]
    Config(#[from] serde_yaml::Error),
}

fn fmt_reason(reason: &Option<String>) -> String {
    match reason {
        Some(r) => format!(" ({})", r),
        None => String::new(),
    }
}

impl Error {
    /// Whether the error means the connection is gone and a reconnect may help.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::ConnectionLost
                | Error::ConnectionClosed
                | Error::NotConnected
                | Error::Io(_)
        )
    }
}
