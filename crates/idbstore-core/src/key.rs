//! IndexedDB keys and their order-preserving byte encoding
//!
//! Keys are persisted as BLOBs whose bytewise (`memcmp`) ordering matches the
//! IndexedDB key comparison rules, so SQLite can range-scan and sort them
//! without understanding the key model:
//!
//! - keys of different types order by type: number < date < string < binary < array
//! - numbers and dates compare numerically
//! - strings compare by UTF-16 code unit, binaries bytewise, a prefix sorting first
//! - arrays compare element-wise, a prefix sorting first

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const TAG_NUMBER: u8 = 0x10;
const TAG_DATE: u8 = 0x20;
const TAG_STRING: u8 = 0x30;
const TAG_BINARY: u8 = 0x40;
const TAG_ARRAY: u8 = 0x50;

/// Ends strings, binaries and arrays. Sorts below every tag byte.
const TERMINATOR: u8 = 0x00;
/// Follows a literal zero byte inside strings and binaries.
const ESCAPED_ZERO: u8 = 0xFF;

const SIGN_BIT: u64 = 1 << 63;

/// A valid IndexedDB key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Key {
    Number(f64),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    /// UTF-16 code units, not necessarily well-formed.
    String(Vec<u16>),
    Binary(Vec<u8>),
    Array(Vec<Key>),
}

impl Key {
    /// Whether the key can be stored. `NaN` is not a valid key, at any depth.
    pub fn is_valid(&self) -> bool {
        match self {
            Key::Number(n) | Key::Date(n) => !n.is_nan(),
            Key::String(_) | Key::Binary(_) => true,
            Key::Array(items) => items.iter().all(Key::is_valid),
        }
    }

    /// Encode into the sortable byte form.
    pub fn encode(&self) -> Vec<u8> {
        encode_sortable_key(self)
    }

    /// A string key from raw code units. Unpaired surrogates are allowed.
    pub fn from_code_units(units: Vec<u16>) -> Self {
        Key::String(units)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) => write!(f, "{}", n),
            Key::Date(ms) => write!(f, "Date({})", ms),
            Key::String(units) => write!(f, "{:?}", String::from_utf16_lossy(units)),
            Key::Binary(b) => write!(f, "Binary({} bytes)", b.len()),
            Key::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Self {
        Key::Number(n)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(f64::from(n))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.encode_utf16().collect())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::from(s.as_str())
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Array(items)
    }
}

/// Errors decoding a stored key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("encoded key ends unexpectedly")]
    UnexpectedEnd,

    #[error("unknown key type tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("{0} trailing bytes after encoded key")]
    TrailingBytes(usize),

    #[error("string key has an odd number of bytes")]
    OddStringLength,
}

/// Encode a key so that byte order equals key order.
pub fn encode_sortable_key(key: &Key) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    encode_into(key, &mut out);
    out
}

/// Decode bytes produced by [`encode_sortable_key`].
pub fn decode_sortable_key(bytes: &[u8]) -> Result<Key, DecodeError> {
    let mut reader = Reader { bytes, pos: 0 };
    let key = reader.read_key()?;
    let remaining = bytes.len() - reader.pos;
    if remaining != 0 {
        return Err(DecodeError::TrailingBytes(remaining));
    }
    Ok(key)
}

fn encode_into(key: &Key, out: &mut Vec<u8>) {
    match key {
        Key::Number(n) => {
            out.push(TAG_NUMBER);
            encode_double(*n, out);
        }
        Key::Date(ms) => {
            out.push(TAG_DATE);
            encode_double(*ms, out);
        }
        Key::String(units) => {
            out.push(TAG_STRING);
            // Big-endian so byte order is code unit order
            let bytes: Vec<u8> = units.iter().flat_map(|unit| unit.to_be_bytes()).collect();
            encode_escaped(&bytes, out);
        }
        Key::Binary(b) => {
            out.push(TAG_BINARY);
            encode_escaped(b, out);
        }
        Key::Array(items) => {
            out.push(TAG_ARRAY);
            for item in items {
                encode_into(item, out);
            }
            out.push(TERMINATOR);
        }
    }
}

fn encode_double(value: f64, out: &mut Vec<u8>) {
    // -0.0 and 0.0 are the same key
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    let mapped = if bits & SIGN_BIT != 0 {
        !bits
    } else {
        bits ^ SIGN_BIT
    };
    out.extend_from_slice(&mapped.to_be_bytes());
}

fn encode_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        if b == 0 {
            out.push(0);
            out.push(ESCAPED_ZERO);
        } else {
            out.push(b);
        }
    }
    out.push(TERMINATOR);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn next(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(b)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn read_key(&mut self) -> Result<Key, DecodeError> {
        match self.next()? {
            TAG_NUMBER => Ok(Key::Number(self.read_double()?)),
            TAG_DATE => Ok(Key::Date(self.read_double()?)),
            TAG_STRING => {
                let bytes = self.read_escaped()?;
                if bytes.len() % 2 != 0 {
                    return Err(DecodeError::OddStringLength);
                }
                Ok(Key::String(
                    bytes
                        .chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                        .collect(),
                ))
            }
            TAG_BINARY => Ok(Key::Binary(self.read_escaped()?)),
            TAG_ARRAY => {
                let mut items = Vec::new();
                loop {
                    match self.peek() {
                        None => return Err(DecodeError::UnexpectedEnd),
                        Some(TERMINATOR) => {
                            self.pos += 1;
                            return Ok(Key::Array(items));
                        }
                        Some(_) => items.push(self.read_key()?),
                    }
                }
            }
            tag => Err(DecodeError::UnknownTag(tag)),
        }
    }

    fn read_double(&mut self) -> Result<f64, DecodeError> {
        let end = self.pos + 8;
        let raw = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::UnexpectedEnd)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        self.pos = end;
        let mapped = u64::from_be_bytes(buf);
        let bits = if mapped & SIGN_BIT != 0 {
            mapped ^ SIGN_BIT
        } else {
            !mapped
        };
        Ok(f64::from_bits(bits))
    }

    fn read_escaped(&mut self) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::new();
        loop {
            match self.next()? {
                0 if self.peek() == Some(ESCAPED_ZERO) => {
                    self.pos += 1;
                    out.push(0);
                }
                TERMINATOR => return Ok(out),
                b => out.push(b),
            }
        }
    }
}
