//! MQTT 5.0 control packets.

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{
    malformed, read_variable_int, string_len, variable_int_len, write_binary, write_string,
    write_variable_int, Reader,
};
use super::properties::Properties;
use super::reason::{ConnectReasonCode, DisconnectReasonCode, PubReasonCode, SubscribeReasonCode};
use super::{PROTOCOL_LEVEL, PROTOCOL_NAME};
use crate::error::{Error, Result};
use crate::types::QoS;

/// Control packet type, the high nibble of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Publish,
            4 => Self::PubAck,
            5 => Self::PubRec,
            6 => Self::PubRel,
            7 => Self::PubComp,
            8 => Self::Subscribe,
            9 => Self::SubAck,
            12 => Self::PingReq,
            13 => Self::PingResp,
            14 => Self::Disconnect,
            _ => return None,
        })
    }

    /// Flags every packet but PUBLISH must carry.
    fn required_flags(self) -> u8 {
        match self {
            Self::PubRel | Self::Subscribe => 0x02,
            _ => 0x00,
        }
    }
}

/// MQTT 5.0 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(Ack),
    PubRec(Ack),
    PubRel(Ack),
    PubComp(Ack),
    Subscribe(Subscribe),
    SubAck(SubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_start: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub properties: Properties,
}

/// CONNACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReasonCode,
    pub properties: Properties,
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
    /// Zero for QoS 0.
    pub pkid: u16,
    pub properties: Properties,
}

/// Body of PUBACK, PUBREC, PUBREL and PUBCOMP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub pkid: u16,
    pub code: PubReasonCode,
    pub properties: Properties,
}

impl Ack {
    pub fn new(pkid: u16, code: PubReasonCode) -> Self {
        Self {
            pkid,
            code,
            properties: Properties::default(),
        }
    }
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
    pub properties: Properties,
}

/// Subscribe filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReasonCode>,
    pub properties: Properties,
}

/// DISCONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub reason_code: DisconnectReasonCode,
    pub properties: Properties,
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode one packet from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched until the remaining length
/// declares a complete frame. On success exactly one frame is consumed.
pub fn decode(buf: &mut BytesMut, max_size: usize) -> Result<Option<Packet>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let first = buf[0];
    let Some((remaining_length, var_len)) = read_variable_int(&buf[1..])? else {
        return Ok(None);
    };

    let total_len = 1 + var_len + remaining_length as usize;
    if total_len > max_size {
        return Err(Error::PacketTooLarge {
            size: total_len,
            max: max_size,
        });
    }

    if buf.len() < total_len {
        buf.reserve(total_len - buf.len());
        return Ok(None);
    }

    let frame = buf.split_to(total_len).freeze();
    let packet = decode_frame(first, &frame[1 + var_len..])?;
    Ok(Some(packet))
}

fn decode_frame(first: u8, body: &[u8]) -> Result<Packet> {
    let type_byte = first >> 4;
    let flags = first & 0x0F;

    let packet_type = PacketType::from_u8(type_byte)
        .ok_or_else(|| malformed(format!("invalid packet type {}", type_byte)))?;

    if packet_type != PacketType::Publish && flags != packet_type.required_flags() {
        return Err(malformed(format!(
            "invalid flags 0x{:X} for {:?}",
            flags, packet_type
        )));
    }

    let mut reader = Reader::new(body);
    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(Connect::read(&mut reader)?),
        PacketType::ConnAck => Packet::ConnAck(ConnAck::read(&mut reader)?),
        PacketType::Publish => Packet::Publish(Publish::read(flags, &mut reader)?),
        PacketType::PubAck => Packet::PubAck(Ack::read(&mut reader)?),
        PacketType::PubRec => Packet::PubRec(Ack::read(&mut reader)?),
        PacketType::PubRel => Packet::PubRel(Ack::read(&mut reader)?),
        PacketType::PubComp => Packet::PubComp(Ack::read(&mut reader)?),
        PacketType::Subscribe => Packet::Subscribe(Subscribe::read(&mut reader)?),
        PacketType::SubAck => Packet::SubAck(SubAck::read(&mut reader)?),
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect(Disconnect::read(&mut reader)?),
    };

    if !reader.is_empty() {
        return Err(malformed(format!(
            "{} trailing bytes after {:?}",
            reader.remaining(),
            packet_type
        )));
    }

    Ok(packet)
}

impl Connect {
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let name = reader.read_binary()?;
        if name != PROTOCOL_NAME {
            return Err(malformed("invalid protocol name"));
        }

        let level = reader.read_u8()?;
        if level != PROTOCOL_LEVEL {
            return Err(malformed(format!("unsupported protocol level {}", level)));
        }

        let flags = reader.read_u8()?;
        if flags & 0x01 != 0 {
            return Err(malformed("reserved connect flag set"));
        }
        let clean_start = flags & 0x02 != 0;
        let will = flags & 0x04 != 0;
        let has_password = flags & 0x40 != 0;
        let has_username = flags & 0x80 != 0;

        let keep_alive = reader.read_u16()?;
        let properties = Properties::read(reader)?;
        let client_id = reader.read_string()?;

        // Wills are not supported; their fields are consumed and dropped.
        if will {
            Properties::read(reader)?;
            reader.read_string()?;
            reader.read_binary()?;
        }

        let username = if has_username {
            Some(reader.read_string()?)
        } else {
            None
        };

        let password = if has_password {
            Some(Bytes::copy_from_slice(reader.read_binary()?))
        } else {
            None
        };

        Ok(Connect {
            client_id,
            keep_alive,
            clean_start,
            username,
            password,
            properties,
        })
    }
}

impl ConnAck {
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let ack_flags = reader.read_u8()?;
        if ack_flags & 0xFE != 0 {
            return Err(malformed("reserved connack flags set"));
        }

        let code_byte = reader.read_u8()?;
        let code = ConnectReasonCode::from_u8(code_byte)
            .ok_or_else(|| malformed(format!("invalid connack reason 0x{:02X}", code_byte)))?;

        let properties = Properties::read(reader)?;

        Ok(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            code,
            properties,
        })
    }
}

impl Publish {
    fn read(flags: u8, reader: &mut Reader<'_>) -> Result<Self> {
        let dup = flags & 0x08 != 0;
        let retain = flags & 0x01 != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or_else(|| malformed("invalid QoS 3 in publish"))?;

        if qos == QoS::AtMostOnce && dup {
            return Err(malformed("DUP set on QoS 0 publish"));
        }

        let topic = reader.read_string()?;

        let pkid = if qos != QoS::AtMostOnce {
            let id = reader.read_u16()?;
            if id == 0 {
                return Err(malformed("zero packet identifier"));
            }
            id
        } else {
            0
        };

        let properties = Properties::read(reader)?;
        let payload = Bytes::copy_from_slice(reader.rest());

        Ok(Publish {
            topic,
            payload,
            qos,
            dup,
            retain,
            pkid,
            properties,
        })
    }
}

impl Ack {
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let pkid = reader.read_u16()?;
        if pkid == 0 {
            return Err(malformed("zero packet identifier"));
        }

        if reader.is_empty() {
            return Ok(Ack::new(pkid, PubReasonCode::Success));
        }

        let code_byte = reader.read_u8()?;
        let code = PubReasonCode::from_u8(code_byte)
            .ok_or_else(|| malformed(format!("invalid ack reason 0x{:02X}", code_byte)))?;

        let properties = if reader.is_empty() {
            Properties::default()
        } else {
            Properties::read(reader)?
        };

        Ok(Ack {
            pkid,
            code,
            properties,
        })
    }
}

impl Subscribe {
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let pkid = reader.read_u16()?;
        if pkid == 0 {
            return Err(malformed("zero packet identifier"));
        }

        let properties = Properties::read(reader)?;

        let mut filters = Vec::new();
        while !reader.is_empty() {
            let path = reader.read_string()?;
            let options = reader.read_u8()?;
            if options & 0xC0 != 0 || (options >> 4) & 0x03 == 3 {
                return Err(malformed("invalid subscription options"));
            }
            let qos = QoS::from_u8(options & 0x03)
                .ok_or_else(|| malformed("invalid QoS 3 in subscription"))?;
            filters.push(SubscribeFilter { path, qos });
        }

        if filters.is_empty() {
            return Err(malformed("subscribe without topic filters"));
        }

        Ok(Subscribe {
            pkid,
            filters,
            properties,
        })
    }
}

impl SubAck {
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let pkid = reader.read_u16()?;
        let properties = Properties::read(reader)?;

        let return_codes = reader
            .rest()
            .iter()
            .map(|&b| {
                SubscribeReasonCode::from_u8(b)
                    .ok_or_else(|| malformed(format!("invalid suback reason 0x{:02X}", b)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SubAck {
            pkid,
            return_codes,
            properties,
        })
    }
}

impl Disconnect {
    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        if reader.is_empty() {
            return Ok(Disconnect::default());
        }

        let code_byte = reader.read_u8()?;
        let reason_code = DisconnectReasonCode::from_u8(code_byte)
            .ok_or_else(|| malformed(format!("invalid disconnect reason 0x{:02X}", code_byte)))?;

        let properties = if reader.is_empty() {
            Properties::default()
        } else {
            Properties::read(reader)?
        };

        Ok(Disconnect {
            reason_code,
            properties,
        })
    }
}

// ============================================================================
// Encoding
// ============================================================================

impl Packet {
    /// Packet type of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect(_) => PacketType::Disconnect,
        }
    }

    /// Append the encoded packet to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        let flags = match self {
            Packet::Connect(p) => {
                p.write(&mut body)?;
                0
            }
            Packet::ConnAck(p) => {
                p.write(&mut body)?;
                0
            }
            Packet::Publish(p) => {
                p.write(&mut body)?;
                p.flags()
            }
            Packet::PubAck(p) | Packet::PubRec(p) | Packet::PubComp(p) => {
                p.write(&mut body)?;
                0
            }
            Packet::PubRel(p) => {
                p.write(&mut body)?;
                0x02
            }
            Packet::Subscribe(p) => {
                p.write(&mut body)?;
                0x02
            }
            Packet::SubAck(p) => {
                p.write(&mut body)?;
                0
            }
            Packet::PingReq | Packet::PingResp => 0,
            Packet::Disconnect(p) => {
                p.write(&mut body)?;
                0
            }
        };

        let remaining = body.len() as u32;
        buf.reserve(1 + variable_int_len(remaining) + body.len());
        buf.put_u8(((self.packet_type() as u8) << 4) | flags);
        write_variable_int(buf, remaining)?;
        buf.put_slice(&body);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

impl Connect {
    fn write(&self, body: &mut BytesMut) -> Result<()> {
        write_binary(body, PROTOCOL_NAME)?;
        body.put_u8(PROTOCOL_LEVEL);

        let mut flags = 0u8;
        if self.clean_start {
            flags |= 0x02;
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        body.put_u8(flags);
        body.put_u16(self.keep_alive);

        self.properties.write(body)?;
        write_string(body, &self.client_id)?;
        if let Some(username) = &self.username {
            write_string(body, username)?;
        }
        if let Some(password) = &self.password {
            write_binary(body, password)?;
        }
        Ok(())
    }
}

impl ConnAck {
    fn write(&self, body: &mut BytesMut) -> Result<()> {
        body.put_u8(self.session_present as u8);
        body.put_u8(self.code as u8);
        self.properties.write(body)
    }
}

impl Publish {
    fn flags(&self) -> u8 {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }
        flags
    }

    fn write(&self, body: &mut BytesMut) -> Result<()> {
        body.reserve(string_len(&self.topic) + 2 + 1 + self.payload.len());
        write_string(body, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            body.put_u16(self.pkid);
        }
        self.properties.write(body)?;
        body.put_slice(&self.payload);
        Ok(())
    }
}

impl Ack {
    fn write(&self, body: &mut BytesMut) -> Result<()> {
        body.put_u16(self.pkid);
        body.put_u8(self.code as u8);
        if !self.properties.is_empty() {
            self.properties.write(body)?;
        }
        Ok(())
    }
}

impl Subscribe {
    fn write(&self, body: &mut BytesMut) -> Result<()> {
        body.put_u16(self.pkid);
        self.properties.write(body)?;
        for filter in &self.filters {
            write_string(body, &filter.path)?;
            body.put_u8(filter.qos as u8);
        }
        Ok(())
    }
}

impl SubAck {
    fn write(&self, body: &mut BytesMut) -> Result<()> {
        body.put_u16(self.pkid);
        self.properties.write(body)?;
        for code in &self.return_codes {
            body.put_u8(code.to_u8());
        }
        Ok(())
    }
}

impl Disconnect {
    fn write(&self, body: &mut BytesMut) -> Result<()> {
        if self.reason_code == DisconnectReasonCode::NormalDisconnection
            && self.properties.is_empty()
        {
            return Ok(());
        }
        body.put_u8(self.reason_code as u8);
        if !self.properties.is_empty() {
            self.properties.write(body)?;
        }
        Ok(())
    }
}
