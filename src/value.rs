use std::{
  fmt,
  io::{Read, Write},
  ops,
};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use num_bigint::BigInt;
use tracing::error;

use crate::error::{Error, Result};

/// Type and compression bits stored next to every value on the server.
///
/// The layout is shared with other clients of the same cache cluster:
/// bit 0 marks a serialized structure, bit 1 a 32-bit integer, bit 2 a big
/// integer and bit 3 a zlib-compressed payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags(u32);

impl Flags {
  pub const SERIALIZED: Flags = Flags(1 << 0);
  pub const INTEGER: Flags = Flags(1 << 1);
  pub const BIGINT: Flags = Flags(1 << 2);
  pub const COMPRESSED: Flags = Flags(1 << 3);

  pub const fn empty() -> Self {
    Self(0)
  }

  pub const fn from_bits(bits: u32) -> Self {
    Self(bits)
  }

  pub const fn bits(self) -> u32 {
    self.0
  }

  pub const fn is_empty(self) -> bool {
    self.0 == 0
  }

  pub const fn contains(self, other: Flags) -> bool {
    self.0 & other.0 == other.0
  }

  pub fn insert(&mut self, other: Flags) {
    self.0 |= other.0;
  }

  pub fn remove(&mut self, other: Flags) {
    self.0 &= !other.0;
  }
}

impl ops::BitOr for Flags {
  type Output = Flags;

  fn bitor(self, rhs: Self) -> Self::Output {
    Flags(self.0 | rhs.0)
  }
}

impl fmt::Display for Flags {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// An application value as stored in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Text(String),
  Bytes(Vec<u8>),
  Int(i32),
  BigInt(BigInt),
  Structured(serde_json::Value),
}

impl Value {
  pub fn as_text(&self) -> Option<&str> {
    match self {
      Self::Text(s) => Some(s.as_str()),
      _ => None,
    }
  }

  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self {
      Self::Text(s) => Some(s.as_bytes()),
      Self::Bytes(b) => Some(b.as_slice()),
      _ => None,
    }
  }

  pub fn as_integer(&self) -> Option<BigInt> {
    match self {
      Self::Int(v) => Some(BigInt::from(*v)),
      Self::BigInt(v) => Some(v.clone()),
      _ => None,
    }
  }

  pub fn as_structured(&self) -> Option<&serde_json::Value> {
    match self {
      Self::Structured(v) => Some(v),
      _ => None,
    }
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Text(s) => write!(f, "{s}"),
      Self::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
      Self::Int(v) => write!(f, "{v}"),
      Self::BigInt(v) => write!(f, "{v}"),
      Self::Structured(v) => write!(f, "{v}"),
    }
  }
}

impl From<&str> for Value {
  fn from(value: &str) -> Self {
    Self::Text(value.to_string())
  }
}

impl From<String> for Value {
  fn from(value: String) -> Self {
    Self::Text(value)
  }
}

impl From<Vec<u8>> for Value {
  fn from(value: Vec<u8>) -> Self {
    Self::Bytes(value)
  }
}

impl From<&[u8]> for Value {
  fn from(value: &[u8]) -> Self {
    Self::Bytes(value.to_vec())
  }
}

impl From<i32> for Value {
  fn from(value: i32) -> Self {
    Self::Int(value)
  }
}

/// Integers that fit in 32 bits become [`Value::Int`], anything wider a
/// [`Value::BigInt`].
impl From<BigInt> for Value {
  fn from(value: BigInt) -> Self {
    match i32::try_from(&value) {
      Ok(v) => Self::Int(v),
      Err(_) => Self::BigInt(value),
    }
  }
}

impl From<i64> for Value {
  fn from(value: i64) -> Self {
    BigInt::from(value).into()
  }
}

impl From<u64> for Value {
  fn from(value: u64) -> Self {
    BigInt::from(value).into()
  }
}

impl From<i128> for Value {
  fn from(value: i128) -> Self {
    BigInt::from(value).into()
  }
}

impl From<serde_json::Value> for Value {
  fn from(value: serde_json::Value) -> Self {
    Self::Structured(value)
  }
}

/// Encodes `value` into its wire flags and payload.
///
/// A positive `compression_threshold` enables zlib compression for payloads
/// longer than the threshold, kept only when it actually shrinks the payload.
/// Text and 32-bit integers always encode with a threshold of 0, which leaves
/// them uncompressed.
pub fn encode(value: &Value, compression_threshold: usize) -> Result<(Flags, Vec<u8>)> {
  let (mut flags, payload, threshold) = match value {
    Value::Text(s) => (Flags::empty(), s.as_bytes().to_vec(), 0),
    Value::Bytes(b) => (Flags::empty(), b.clone(), compression_threshold),
    Value::Int(v) => (Flags::INTEGER, v.to_string().into_bytes(), 0),
    Value::BigInt(v) => (Flags::BIGINT, v.to_string().into_bytes(), compression_threshold),
    Value::Structured(v) => {
      let payload = serde_json::to_vec(v).map_err(|err| Error::Encode(err.to_string()))?;
      (Flags::SERIALIZED, payload, compression_threshold)
    }
  };

  if threshold > 0 && payload.len() > threshold {
    let compressed = compress(&payload).map_err(|err| Error::Encode(err.to_string()))?;
    if compressed.len() < payload.len() {
      flags.insert(Flags::COMPRESSED);
      return Ok((flags, compressed));
    }
  }

  Ok((flags, payload))
}

/// Decodes a payload read from the server.
///
/// Returns `None` for flag combinations this client does not know and for
/// payloads that fail to decode; the latter are reported through `tracing`.
pub fn decode(flags: Flags, payload: &[u8]) -> Option<Value> {
  let mut flags = flags;
  let decompressed;
  let payload = if flags.contains(Flags::COMPRESSED) {
    flags.remove(Flags::COMPRESSED);
    decompressed = match decompress(payload) {
      Ok(v) => v,
      Err(err) => {
        error!(%err, "failed to decompress value");
        return None;
      }
    };
    decompressed.as_slice()
  } else {
    payload
  };

  if flags.is_empty() {
    return Some(match String::from_utf8(payload.to_vec()) {
      Ok(s) => Value::Text(s),
      Err(err) => Value::Bytes(err.into_bytes()),
    });
  }

  if flags.contains(Flags::INTEGER) {
    return parse_decimal(payload).map(Value::Int);
  }

  if flags.contains(Flags::BIGINT) {
    return parse_decimal(payload).map(Value::BigInt);
  }

  if flags.contains(Flags::SERIALIZED) {
    return match serde_json::from_slice(payload) {
      Ok(v) => Some(Value::Structured(v)),
      Err(err) => {
        error!(%err, "failed to deserialize value");
        None
      }
    };
  }

  None
}

fn parse_decimal<T: std::str::FromStr>(payload: &[u8]) -> Option<T>
where
  T::Err: fmt::Display,
{
  let parsed = std::str::from_utf8(payload)
    .map_err(|err| err.to_string())
    .and_then(|s| s.trim().parse::<T>().map_err(|err| err.to_string()));
  match parsed {
    Ok(v) => Some(v),
    Err(err) => {
      error!(%err, "failed to parse integer value");
      None
    }
  }
}

fn compress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut encoder = ZlibEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::default());
  encoder.write_all(payload)?;
  encoder.finish()
}

fn decompress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut buffer = Vec::with_capacity(payload.len() * 2);
  ZlibDecoder::new(payload).read_to_end(&mut buffer)?;
  Ok(buffer)
}
