//! Key and value encoding.
//!
//! Values cross the fabric as opaque byte objects with an explicit length.
//! Text is taken as its UTF-8 bytes; nothing on the way treats a value as a
//! NUL-terminated string, so embedded zero bytes survive the round trip.

use crate::error::{FoehnError, Result};

/// Longest key a fabric accepts.
pub const MAX_KEY_LEN: usize = 511;

/// A key or value as supplied by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
  Text(&'a str),
  Raw(&'a [u8]),
}

impl<'a> Value<'a> {
  pub fn as_bytes(&self) -> &'a [u8] {
    match self {
      Value::Text(text) => text.as_bytes(),
      Value::Raw(bytes) => bytes,
    }
  }

  pub fn len(&self) -> usize {
    self.as_bytes().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<'a> From<&'a str> for Value<'a> {
  fn from(value: &'a str) -> Self {
    Value::Text(value)
  }
}

impl<'a> From<&'a String> for Value<'a> {
  fn from(value: &'a String) -> Self {
    Value::Text(value.as_str())
  }
}

impl<'a> From<&'a [u8]> for Value<'a> {
  fn from(value: &'a [u8]) -> Self {
    Value::Raw(value)
  }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Value<'a> {
  fn from(value: &'a [u8; N]) -> Self {
    Value::Raw(value.as_slice())
  }
}

impl<'a> From<&'a Vec<u8>> for Value<'a> {
  fn from(value: &'a Vec<u8>) -> Self {
    Value::Raw(value.as_slice())
  }
}

/// Normalize a caller value to owned bytes.
pub fn to_bytes(value: Value<'_>) -> Vec<u8> {
  value.as_bytes().to_vec()
}

/// Copy exactly `bytes.len()` bytes into a caller-owned buffer.
pub fn from_bytes(bytes: &[u8]) -> Vec<u8> {
  bytes.to_vec()
}

/// Validate a key and return it as fabric text.
pub fn encode_key(key: Value<'_>) -> Result<String> {
  let bytes = key.as_bytes();
  if bytes.is_empty() {
    return Err(FoehnError::Encoding("key must not be empty".to_string()));
  }
  if bytes.len() > MAX_KEY_LEN {
    return Err(FoehnError::Encoding(format!(
      "key longer than {MAX_KEY_LEN} bytes: {}",
      bytes.len()
    )));
  }
  if bytes.contains(&0) {
    return Err(FoehnError::Encoding("key contains a NUL byte".to_string()));
  }

  match key {
    Value::Text(text) => Ok(text.to_string()),
    Value::Raw(raw) => std::str::from_utf8(raw)
      .map(str::to_string)
      .map_err(|error| FoehnError::Encoding(format!("key is not valid UTF-8: {error}"))),
  }
}

/// Validate a value and return its bytes.
pub fn encode_value(value: Value<'_>) -> Result<Vec<u8>> {
  if value.is_empty() {
    return Err(FoehnError::Encoding("value must not be empty".to_string()));
  }
  Ok(to_bytes(value))
}
