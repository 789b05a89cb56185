//! MQTT 5.0 properties.
//!
//! Only the properties this client acts on are kept. Every other valid
//! property is skipped according to its wire type.

use bytes::{BufMut, BytesMut};

use super::codec::{malformed, write_string, write_variable_int, Reader};
use crate::error::Result;
use crate::types::QoS;

/// MQTT 5.0 property identifiers.
mod property_id {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
    pub const CONTENT_TYPE: u8 = 0x03;
    pub const RESPONSE_TOPIC: u8 = 0x08;
    pub const CORRELATION_DATA: u8 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const AUTHENTICATION_METHOD: u8 = 0x15;
    pub const AUTHENTICATION_DATA: u8 = 0x16;
    pub const REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
    pub const WILL_DELAY_INTERVAL: u8 = 0x18;
    pub const REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
    pub const RESPONSE_INFORMATION: u8 = 0x1A;
    pub const SERVER_REFERENCE: u8 = 0x1C;
    pub const REASON_STRING: u8 = 0x1F;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
    pub const TOPIC_ALIAS: u8 = 0x23;
    pub const MAXIMUM_QOS: u8 = 0x24;
    pub const RETAIN_AVAILABLE: u8 = 0x25;
    pub const USER_PROPERTY: u8 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 0x28;
    pub const SUBSCRIPTION_IDENTIFIER_AVAILABLE: u8 = 0x29;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 0x2A;
}

use property_id::*;

/// Property set of a packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: Option<u16>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub reason_string: Option<String>,
    pub maximum_qos: Option<QoS>,
    pub user_properties: Vec<(String, String)>,
}

impl Properties {
    pub fn is_empty(&self) -> bool {
        *self == Properties::default()
    }

    /// Read a property length followed by the properties.
    pub fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let len = reader.read_variable_int()? as usize;
        let mut props = Reader::new(reader.take(len)?);
        let mut out = Properties::default();

        while !props.is_empty() {
            let id = props.read_u8()?;
            match id {
                SESSION_EXPIRY_INTERVAL => out.session_expiry_interval = Some(props.read_u32()?),
                RECEIVE_MAXIMUM => {
                    let value = props.read_u16()?;
                    if value == 0 {
                        return Err(malformed("receive maximum of zero"));
                    }
                    out.receive_maximum = Some(value);
                }
                MAXIMUM_PACKET_SIZE => out.maximum_packet_size = Some(props.read_u32()?),
                TOPIC_ALIAS_MAXIMUM => out.topic_alias_maximum = Some(props.read_u16()?),
                ASSIGNED_CLIENT_IDENTIFIER => {
                    out.assigned_client_identifier = Some(props.read_string()?)
                }
                SERVER_KEEP_ALIVE => out.server_keep_alive = Some(props.read_u16()?),
                REASON_STRING => out.reason_string = Some(props.read_string()?),
                MAXIMUM_QOS => {
                    let value = props.read_u8()?;
                    let qos = QoS::from_u8(value)
                        .filter(|q| *q != QoS::ExactlyOnce)
                        .ok_or_else(|| malformed(format!("invalid maximum QoS {}", value)))?;
                    out.maximum_qos = Some(qos);
                }
                USER_PROPERTY => {
                    let key = props.read_string()?;
                    let value = props.read_string()?;
                    out.user_properties.push((key, value));
                }
                PAYLOAD_FORMAT_INDICATOR
                | REQUEST_PROBLEM_INFORMATION
                | REQUEST_RESPONSE_INFORMATION
                | RETAIN_AVAILABLE
                | WILDCARD_SUBSCRIPTION_AVAILABLE
                | SUBSCRIPTION_IDENTIFIER_AVAILABLE
                | SHARED_SUBSCRIPTION_AVAILABLE => {
                    props.read_u8()?;
                }
                TOPIC_ALIAS => {
                    props.read_u16()?;
                }
                MESSAGE_EXPIRY_INTERVAL | WILL_DELAY_INTERVAL => {
                    props.read_u32()?;
                }
                SUBSCRIPTION_IDENTIFIER => {
                    props.read_variable_int()?;
                }
                CONTENT_TYPE | RESPONSE_TOPIC | AUTHENTICATION_METHOD | RESPONSE_INFORMATION
                | SERVER_REFERENCE => {
                    props.read_string()?;
                }
                CORRELATION_DATA | AUTHENTICATION_DATA => {
                    props.read_binary()?;
                }
                other => return Err(malformed(format!("unknown property id 0x{:02X}", other))),
            }
        }

        Ok(out)
    }

    /// Write the property length followed by the properties.
    pub fn write(&self, buf: &mut BytesMut) -> Result<()> {
        let mut props = BytesMut::new();

        if let Some(v) = self.session_expiry_interval {
            props.put_u8(SESSION_EXPIRY_INTERVAL);
            props.put_u32(v);
        }
        if let Some(v) = self.receive_maximum {
            props.put_u8(RECEIVE_MAXIMUM);
            props.put_u16(v);
        }
        if let Some(v) = self.maximum_packet_size {
            props.put_u8(MAXIMUM_PACKET_SIZE);
            props.put_u32(v);
        }
        if let Some(v) = self.topic_alias_maximum {
            props.put_u8(TOPIC_ALIAS_MAXIMUM);
            props.put_u16(v);
        }
        if let Some(v) = &self.assigned_client_identifier {
            props.put_u8(ASSIGNED_CLIENT_IDENTIFIER);
            write_string(&mut props, v)?;
        }
        if let Some(v) = self.server_keep_alive {
            props.put_u8(SERVER_KEEP_ALIVE);
            props.put_u16(v);
        }
        if let Some(v) = &self.reason_string {
            props.put_u8(REASON_STRING);
            write_string(&mut props, v)?;
        }
        if let Some(v) = self.maximum_qos {
            props.put_u8(MAXIMUM_QOS);
            props.put_u8(v as u8);
        }
        for (key, value) in &self.user_properties {
            props.put_u8(USER_PROPERTY);
            write_string(&mut props, key)?;
            write_string(&mut props, value)?;
        }

        write_variable_int(buf, props.len() as u32)?;
        buf.put_slice(&props);
        Ok(())
    }
}
