//! Common types for mqtt2.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::topic;

/// Quality of Service level.
///
/// Outbound traffic always uses [`QoS::ExactlyOnce`]; the lower levels exist
/// because the broker may deliver or grant them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery.
    AtMostOnce = 0,
    /// At least once delivery.
    AtLeastOnce = 1,
    /// Exactly once delivery.
    #[default]
    ExactlyOnce = 2,
}

impl QoS {
    /// Parse the two QoS bits.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// MQTT application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Delivery QoS.
    pub qos: QoS,
}

impl Message {
    /// Create a new exactly-once message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::ExactlyOnce,
        }
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Check that the topic can be published to.
    pub fn validate(&self) -> Result<()> {
        topic::validate_topic_name(&self.topic)
    }
}

/// A topic filter the session is subscribed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic filter, may contain `+` and `#`.
    pub filter: String,
    /// Granted QoS.
    pub qos: QoS,
}

/// Message handler trait.
pub trait Handler: Send + Sync {
    /// Handle an incoming message.
    fn handle(&self, msg: &Message);
}

/// Function-based handler.
impl<F> Handler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle(&self, msg: &Message) {
        self(msg)
    }
}

pub(crate) fn invalid_topic(topic: &str, why: &str) -> Error {
    Error::InvalidTopic(format!("{:?}: {}", topic, why))
}
