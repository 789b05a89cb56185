//! MQTT 5.0 wire protocol.
//!
//! - `codec`: variable byte integers, strings, and a frame body reader
//! - `packet`: control packets and the buffering frame decoder
//! - `properties`: MQTT 5.0 property blocks
//! - `reason`: reason code enums

pub mod codec;
mod packet;
mod properties;
mod reason;

pub use packet::{
    decode, Ack, ConnAck, Connect, Disconnect, Packet, PacketType, Publish, SubAck, Subscribe,
    SubscribeFilter,
};
pub use properties::Properties;
pub use reason::{ConnectReasonCode, DisconnectReasonCode, PubReasonCode, SubscribeReasonCode};

/// Protocol name carried in CONNECT.
pub const PROTOCOL_NAME: &[u8] = b"MQTT";

/// Protocol level for MQTT 5.0.
pub const PROTOCOL_LEVEL: u8 = 5;

/// Largest frame the wire format can describe.
pub const MAX_PACKET_SIZE: usize = 1 + 4 + codec::MAX_VARIABLE_INT as usize;
