//! MQTT wire primitives.
//!
//! Low-level encoding and decoding of variable byte integers, big-endian
//! integers, length-prefixed strings and binary data.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// Largest value a variable byte integer can carry.
pub const MAX_VARIABLE_INT: u32 = 268_435_455;

/// Read a variable byte integer.
///
/// Returns `Ok(None)` if more bytes are needed, `(value, bytes_consumed)`
/// otherwise. More than four bytes is malformed.
pub fn read_variable_int(buf: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut multiplier = 1u32;
    let mut value = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(malformed("variable byte integer longer than 4 bytes"));
        }

        value += (byte & 0x7F) as u32 * multiplier;

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(malformed("variable byte integer longer than 4 bytes"));
    }
    Ok(None)
}

/// Write a variable byte integer.
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<()> {
    if value > MAX_VARIABLE_INT {
        return Err(malformed("variable byte integer out of range"));
    }

    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;

        if value > 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);

        if value == 0 {
            return Ok(());
        }
    }
}

/// Calculate the number of bytes needed for a variable byte integer.
pub const fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

/// Write a UTF-8 string (2-byte length prefix + data).
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    write_binary(buf, s.as_bytes())
}

/// Write binary data (2-byte length prefix + data).
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    if data.len() > u16::MAX as usize {
        return Err(malformed("string or binary field longer than 65535 bytes"));
    }
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}

/// Encoded size of a length-prefixed string or binary field.
pub fn string_len(s: &str) -> usize {
    2 + s.len()
}

/// Cursor over the body of a complete frame.
///
/// Running out of bytes inside a frame whose length was already declared is a
/// malformed packet, not a partial read.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| malformed("unexpected end of packet"))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_variable_int(&mut self) -> Result<u32> {
        match read_variable_int(&self.buf[self.pos..])? {
            Some((value, len)) => {
                self.pos += len;
                Ok(value)
            }
            None => Err(malformed("unexpected end of packet")),
        }
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_binary()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("invalid UTF-8 string"))
    }

    pub fn read_binary(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    /// Take exactly `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(malformed("unexpected end of packet"));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Take everything that is left.
    pub fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.pos..];
        self.pos = self.buf.len();
        bytes
    }
}

pub(crate) fn malformed(what: impl Into<String>) -> Error {
    Error::MalformedPacket(what.into())
}
