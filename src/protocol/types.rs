//! AMQP primitive types: field tables, field values and the argument codec.
//!
//! Method arguments and content properties are built from a handful of
//! primitives: octets, big-endian integers, short strings (u8 length),
//! long strings (u32 length), packed bits and field tables. [`Decoder`]
//! reads them from a frame payload and returns an error instead of
//! panicking on truncated input; [`AmqpBufMut`] writes them into a
//! `BytesMut`.
//!
//! Field value tags follow RabbitMQ's table grammar:
//!
//! | Tag | Type | Tag | Type |
//! |-----|------|-----|------|
//! | `t` | bool | `l` | i64 |
//! | `b` | i8 | `f` | f32 |
//! | `B` | u8 | `d` | f64 |
//! | `s` | i16 | `D` | decimal |
//! | `u` | u16 | `S` | long string |
//! | `I` | i32 | `A` | array |
//! | `i` | u32 | `T` | timestamp |
//! | `F` | table | `V` | void |
//! | `x` | byte array | | |

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Field table: string keys to tagged values, ordered for stable encoding.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// A tagged value inside a field table or array.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// `t`
    Bool(bool),
    /// `b`
    I8(i8),
    /// `B`
    U8(u8),
    /// `s`
    I16(i16),
    /// `u`
    U16(u16),
    /// `I`
    I32(i32),
    /// `i`
    U32(u32),
    /// `l`
    I64(i64),
    /// `f`
    F32(f32),
    /// `d`
    F64(f64),
    /// `D`: value / 10^scale.
    Decimal {
        /// Number of decimal digits.
        scale: u8,
        /// Unscaled value.
        value: u32,
    },
    /// `S`. Non UTF-8 long strings decode as [`FieldValue::Bytes`].
    LongString(String),
    /// `A`
    Array(Vec<FieldValue>),
    /// `T`: seconds since the Unix epoch.
    Timestamp(u64),
    /// `F`
    Table(FieldTable),
    /// `V`
    Void,
    /// `x`
    Bytes(Bytes),
}

impl FieldValue {
    /// Wire tag of this value.
    pub fn tag(&self) -> u8 {
        match self {
            FieldValue::Bool(_) => b't',
            FieldValue::I8(_) => b'b',
            FieldValue::U8(_) => b'B',
            FieldValue::I16(_) => b's',
            FieldValue::U16(_) => b'u',
            FieldValue::I32(_) => b'I',
            FieldValue::U32(_) => b'i',
            FieldValue::I64(_) => b'l',
            FieldValue::F32(_) => b'f',
            FieldValue::F64(_) => b'd',
            FieldValue::Decimal { .. } => b'D',
            FieldValue::LongString(_) => b'S',
            FieldValue::Array(_) => b'A',
            FieldValue::Timestamp(_) => b'T',
            FieldValue::Table(_) => b'F',
            FieldValue::Void => b'V',
            FieldValue::Bytes(_) => b'x',
        }
    }

    /// String content, for `S` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::LongString(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content widened to `i64`, for any integer tag.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::I8(v) => Some(v.into()),
            FieldValue::U8(v) => Some(v.into()),
            FieldValue::I16(v) => Some(v.into()),
            FieldValue::U16(v) => Some(v.into()),
            FieldValue::I32(v) => Some(v.into()),
            FieldValue::U32(v) => Some(v.into()),
            FieldValue::I64(v) => Some(v),
            FieldValue::Timestamp(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::LongString(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::LongString(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::I32(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::I64(value)
    }
}

impl From<FieldTable> for FieldValue {
    fn from(value: FieldTable) -> Self {
        FieldValue::Table(value)
    }
}

fn truncated(what: &str) -> TransportError {
    TransportError::ProtocolViolation(format!("Truncated {}", what))
}

/// Cursor over a frame payload.
#[derive(Debug, Clone)]
pub struct Decoder {
    buf: Bytes,
}

impl Decoder {
    /// Start decoding `buf`.
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(truncated(what));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1, "octet")?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.need(2, "short")?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4, "long")?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8, "long long")?;
        Ok(self.buf.get_u64())
    }

    /// Packed bits: `N` booleans from one octet, least significant first.
    pub fn bits<const N: usize>(&mut self) -> Result<[bool; N]> {
        let octet = self.u8()?;
        let mut out = [false; N];
        for (i, bit) in out.iter_mut().enumerate() {
            *bit = octet & (1 << i) != 0;
        }
        Ok(out)
    }

    /// Raw bytes of a known length.
    pub fn bytes(&mut self, len: usize) -> Result<Bytes> {
        self.need(len, "byte sequence")?;
        Ok(self.buf.split_to(len))
    }

    /// Short string (u8 length prefix).
    pub fn short_str(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| TransportError::ProtocolViolation("Short string is not UTF-8".into()))
    }

    /// Long string (u32 length prefix), raw.
    pub fn long_bytes(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    /// Long string decoded as UTF-8 (lossy).
    pub fn long_str(&mut self) -> Result<String> {
        let raw = self.long_bytes()?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Field table (u32 byte length, then name/value pairs).
    pub fn table(&mut self) -> Result<FieldTable> {
        let len = self.u32()? as usize;
        let mut inner = Decoder::new(self.bytes(len)?);
        let mut table = FieldTable::new();
        while inner.remaining() > 0 {
            let key = inner.short_str()?;
            let value = inner.field_value()?;
            table.insert(key, value);
        }
        Ok(table)
    }

    /// One tagged field value.
    pub fn field_value(&mut self) -> Result<FieldValue> {
        let tag = self.u8()?;
        let value = match tag {
            b't' => FieldValue::Bool(self.u8()? != 0),
            b'b' => FieldValue::I8(self.u8()? as i8),
            b'B' => FieldValue::U8(self.u8()?),
            b's' => FieldValue::I16(self.u16()? as i16),
            b'u' => FieldValue::U16(self.u16()?),
            b'I' => FieldValue::I32(self.u32()? as i32),
            b'i' => FieldValue::U32(self.u32()?),
            b'l' => FieldValue::I64(self.u64()? as i64),
            b'f' => FieldValue::F32(f32::from_bits(self.u32()?)),
            b'd' => FieldValue::F64(f64::from_bits(self.u64()?)),
            b'D' => FieldValue::Decimal {
                scale: self.u8()?,
                value: self.u32()?,
            },
            b'S' => {
                let raw = self.long_bytes()?;
                match std::str::from_utf8(&raw) {
                    Ok(s) => FieldValue::LongString(s.to_string()),
                    Err(_) => FieldValue::Bytes(raw),
                }
            }
            b'A' => {
                let len = self.u32()? as usize;
                let mut inner = Decoder::new(self.bytes(len)?);
                let mut items = Vec::new();
                while inner.remaining() > 0 {
                    items.push(inner.field_value()?);
                }
                FieldValue::Array(items)
            }
            b'T' => FieldValue::Timestamp(self.u64()?),
            b'F' => FieldValue::Table(self.table()?),
            b'V' => FieldValue::Void,
            b'x' => FieldValue::Bytes(self.long_bytes()?),
            other => {
                return Err(TransportError::ProtocolViolation(format!(
                    "Unknown field value tag 0x{:02X}",
                    other
                )))
            }
        };
        Ok(value)
    }
}

/// Writers for AMQP primitives on top of `BytesMut`.
pub trait AmqpBufMut {
    /// Short string; fails above 255 bytes.
    fn put_short_str(&mut self, value: &str) -> Result<()>;
    /// Long string.
    fn put_long_str(&mut self, value: &[u8]);
    /// Packed bits, least significant first.
    fn put_bits(&mut self, bits: &[bool]);
    /// Field table with its u32 length prefix.
    fn put_table(&mut self, table: &FieldTable) -> Result<()>;
    /// One tagged field value.
    fn put_field_value(&mut self, value: &FieldValue) -> Result<()>;
}

impl AmqpBufMut for BytesMut {
    fn put_short_str(&mut self, value: &str) -> Result<()> {
        let len = u8::try_from(value.len()).map_err(|_| {
            TransportError::ProtocolViolation(format!(
                "Short string of {} bytes exceeds 255",
                value.len()
            ))
        })?;
        self.put_u8(len);
        self.put_slice(value.as_bytes());
        Ok(())
    }

    fn put_long_str(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.put_slice(value);
    }

    fn put_bits(&mut self, bits: &[bool]) {
        let octet = bits
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, bit)| if *bit { acc | (1 << i) } else { acc });
        self.put_u8(octet);
    }

    fn put_table(&mut self, table: &FieldTable) -> Result<()> {
        let start = self.len();
        self.put_u32(0);
        for (key, value) in table {
            self.put_short_str(key)?;
            self.put_field_value(value)?;
        }
        patch_len(self, start);
        Ok(())
    }

    fn put_field_value(&mut self, value: &FieldValue) -> Result<()> {
        self.put_u8(value.tag());
        match value {
            FieldValue::Bool(v) => self.put_u8(u8::from(*v)),
            FieldValue::I8(v) => self.put_i8(*v),
            FieldValue::U8(v) => self.put_u8(*v),
            FieldValue::I16(v) => self.put_i16(*v),
            FieldValue::U16(v) => self.put_u16(*v),
            FieldValue::I32(v) => self.put_i32(*v),
            FieldValue::U32(v) => self.put_u32(*v),
            FieldValue::I64(v) => self.put_i64(*v),
            FieldValue::F32(v) => self.put_f32(*v),
            FieldValue::F64(v) => self.put_f64(*v),
            FieldValue::Decimal { scale, value } => {
                self.put_u8(*scale);
                self.put_u32(*value);
            }
            FieldValue::LongString(s) => self.put_long_str(s.as_bytes()),
            FieldValue::Array(items) => {
                let start = self.len();
                self.put_u32(0);
                for item in items {
                    self.put_field_value(item)?;
                }
                patch_len(self, start);
            }
            FieldValue::Timestamp(v) => self.put_u64(*v),
            FieldValue::Table(t) => self.put_table(t)?,
            FieldValue::Void => {}
            FieldValue::Bytes(b) => self.put_long_str(b),
        }
        Ok(())
    }
}

/// Overwrite the u32 placeholder at `start` with the length written after it.
fn patch_len(buf: &mut BytesMut, start: usize) {
    let len = (buf.len() - start - 4) as u32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}
