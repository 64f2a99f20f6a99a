//! Request/response frames for the TCP fabric.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! magic "FHN1" | op u8 | payload_len u32 | payload | crc32(payload) u32
//! ```
//!
//! Strings and byte objects inside payloads are `u32` length-prefixed.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{FabricStatus, FabricValue};
use crate::error::{FoehnError, Result};
use crate::identity::RankSelector;

const FRAME_MAGIC: &[u8; 4] = b"FHN1";
const FRAME_HEADER_BYTES: usize = 9;
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

const OP_INIT: u8 = 0x01;
const OP_COMMIT: u8 = 0x02;
const OP_GET: u8 = 0x03;
const OP_FINALIZE: u8 = 0x04;

const OP_IDENTITY: u8 = 0x81;
const OP_DONE: u8 = 0x82;
const OP_VALUE: u8 = 0x83;
const OP_STATUS: u8 = 0x84;

const VALUE_NONE: u8 = 0;
const VALUE_BYTES: u8 = 1;
const VALUE_STRING: u8 = 2;
const VALUE_U32: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
  Init {
    rank_hint: Option<u32>,
  },
  Commit {
    entries: Vec<(String, FabricValue)>,
  },
  Get {
    namespace: String,
    key: String,
    target: RankSelector,
    wait: bool,
    timeout_ms: Option<u64>,
  },
  Finalize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
  Identity { namespace: String, rank: u32 },
  Done,
  Value(Option<FabricValue>),
  Status(FabricStatus),
}

pub fn write_request(writer: &mut impl Write, request: &Request) -> Result<()> {
  let mut payload = Vec::new();
  let op = match request {
    Request::Init { rank_hint } => {
      put_opt_u32(&mut payload, *rank_hint)?;
      OP_INIT
    }
    Request::Commit { entries } => {
      let count = len_u32(entries.len(), "commit entry count")?;
      payload.write_u32::<LittleEndian>(count)?;
      for (key, value) in entries {
        put_bytes(&mut payload, key.as_bytes())?;
        put_value(&mut payload, Some(value))?;
      }
      OP_COMMIT
    }
    Request::Get {
      namespace,
      key,
      target,
      wait,
      timeout_ms,
    } => {
      put_bytes(&mut payload, namespace.as_bytes())?;
      put_bytes(&mut payload, key.as_bytes())?;
      payload.write_u32::<LittleEndian>(target.raw())?;
      payload.write_u8(u8::from(*wait))?;
      match timeout_ms {
        Some(ms) => {
          payload.write_u8(1)?;
          payload.write_u64::<LittleEndian>(*ms)?;
        }
        None => payload.write_u8(0)?,
      }
      OP_GET
    }
    Request::Finalize => OP_FINALIZE,
  };
  write_frame(writer, op, &payload)
}

pub fn read_request(reader: &mut impl Read) -> Result<Request> {
  let (op, payload) = read_frame(reader)?;
  let mut cursor = Cursor::new(payload.as_slice());

  let request = match op {
    OP_INIT => Request::Init {
      rank_hint: get_opt_u32(&mut cursor)?,
    },
    OP_COMMIT => {
      let count = cursor.read_u32::<LittleEndian>()? as usize;
      let mut entries = Vec::with_capacity(count.min(1024));
      for _ in 0..count {
        let key = get_string(&mut cursor)?;
        let value = get_value(&mut cursor)?
          .ok_or_else(|| FoehnError::InvalidFrame("commit entry without value".to_string()))?;
        entries.push((key, value));
      }
      Request::Commit { entries }
    }
    OP_GET => {
      let namespace = get_string(&mut cursor)?;
      let key = get_string(&mut cursor)?;
      let raw_target = cursor.read_u32::<LittleEndian>()?;
      let target = RankSelector::from_raw(raw_target)
        .ok_or_else(|| FoehnError::InvalidFrame(format!("invalid rank selector {raw_target}")))?;
      let wait = get_bool(&mut cursor)?;
      let timeout_ms = match cursor.read_u8()? {
        0 => None,
        1 => Some(cursor.read_u64::<LittleEndian>()?),
        tag => return Err(FoehnError::InvalidFrame(format!("invalid timeout tag {tag}"))),
      };
      Request::Get {
        namespace,
        key,
        target,
        wait,
        timeout_ms,
      }
    }
    OP_FINALIZE => Request::Finalize,
    other => {
      return Err(FoehnError::InvalidFrame(format!(
        "unknown request op 0x{other:02x}"
      )))
    }
  };

  ensure_consumed(&cursor)?;
  Ok(request)
}

pub fn write_response(writer: &mut impl Write, response: &Response) -> Result<()> {
  let mut payload = Vec::new();
  let op = match response {
    Response::Identity { namespace, rank } => {
      put_bytes(&mut payload, namespace.as_bytes())?;
      payload.write_u32::<LittleEndian>(*rank)?;
      OP_IDENTITY
    }
    Response::Done => OP_DONE,
    Response::Value(value) => {
      put_value(&mut payload, value.as_ref())?;
      OP_VALUE
    }
    Response::Status(status) => {
      payload.write_i32::<LittleEndian>(status.code())?;
      OP_STATUS
    }
  };
  write_frame(writer, op, &payload)
}

pub fn read_response(reader: &mut impl Read) -> Result<Response> {
  let (op, payload) = read_frame(reader)?;
  let mut cursor = Cursor::new(payload.as_slice());

  let response = match op {
    OP_IDENTITY => Response::Identity {
      namespace: get_string(&mut cursor)?,
      rank: cursor.read_u32::<LittleEndian>()?,
    },
    OP_DONE => Response::Done,
    OP_VALUE => Response::Value(get_value(&mut cursor)?),
    OP_STATUS => Response::Status(FabricStatus::from_code(
      cursor.read_i32::<LittleEndian>()?,
    )),
    other => {
      return Err(FoehnError::InvalidFrame(format!(
        "unknown response op 0x{other:02x}"
      )))
    }
  };

  ensure_consumed(&cursor)?;
  Ok(response)
}

fn write_frame(writer: &mut impl Write, op: u8, payload: &[u8]) -> Result<()> {
  if payload.len() > MAX_FRAME_PAYLOAD {
    return Err(FoehnError::InvalidFrame(format!(
      "frame payload too large: {}",
      payload.len()
    )));
  }

  let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len() + 4);
  frame.extend_from_slice(FRAME_MAGIC);
  frame.write_u8(op)?;
  frame.write_u32::<LittleEndian>(payload.len() as u32)?;
  frame.extend_from_slice(payload);
  frame.write_u32::<LittleEndian>(crc32fast::hash(payload))?;

  writer.write_all(&frame)?;
  writer.flush()?;
  Ok(())
}

fn read_frame(reader: &mut impl Read) -> Result<(u8, Vec<u8>)> {
  let mut header = [0u8; FRAME_HEADER_BYTES];
  reader.read_exact(&mut header)?;

  if &header[..4] != FRAME_MAGIC {
    return Err(FoehnError::InvalidFrame("frame has invalid magic".to_string()));
  }

  let op = header[4];
  let mut cursor = Cursor::new(&header[5..]);
  let payload_len = cursor.read_u32::<LittleEndian>()? as usize;
  if payload_len > MAX_FRAME_PAYLOAD {
    return Err(FoehnError::InvalidFrame(format!(
      "frame payload too large: {payload_len}"
    )));
  }

  let mut payload = vec![0; payload_len];
  reader
    .read_exact(&mut payload)
    .map_err(|_| FoehnError::InvalidFrame("frame payload truncated".to_string()))?;

  let expected = reader
    .read_u32::<LittleEndian>()
    .map_err(|_| FoehnError::InvalidFrame("frame checksum truncated".to_string()))?;
  let actual = crc32fast::hash(&payload);
  if expected != actual {
    return Err(FoehnError::InvalidFrame(format!(
      "frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
    )));
  }

  Ok((op, payload))
}

fn len_u32(len: usize, what: &str) -> Result<u32> {
  u32::try_from(len).map_err(|_| FoehnError::InvalidFrame(format!("{what} too large: {len}")))
}

fn put_bytes(payload: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
  payload.write_u32::<LittleEndian>(len_u32(bytes.len(), "field")?)?;
  payload.extend_from_slice(bytes);
  Ok(())
}

fn put_opt_u32(payload: &mut Vec<u8>, value: Option<u32>) -> Result<()> {
  match value {
    Some(value) => {
      payload.write_u8(1)?;
      payload.write_u32::<LittleEndian>(value)?;
    }
    None => payload.write_u8(0)?,
  }
  Ok(())
}

fn put_value(payload: &mut Vec<u8>, value: Option<&FabricValue>) -> Result<()> {
  match value {
    None => payload.write_u8(VALUE_NONE)?,
    Some(FabricValue::Bytes(bytes)) => {
      payload.write_u8(VALUE_BYTES)?;
      put_bytes(payload, bytes)?;
    }
    Some(FabricValue::String(text)) => {
      payload.write_u8(VALUE_STRING)?;
      put_bytes(payload, text.as_bytes())?;
    }
    Some(FabricValue::U32(value)) => {
      payload.write_u8(VALUE_U32)?;
      payload.write_u32::<LittleEndian>(*value)?;
    }
  }
  Ok(())
}

fn get_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
  let len = cursor.read_u32::<LittleEndian>()? as usize;
  let remaining = cursor.get_ref().len() - cursor.position() as usize;
  if len > remaining {
    return Err(FoehnError::InvalidFrame(format!(
      "field length {len} exceeds remaining {remaining} bytes"
    )));
  }
  let mut bytes = vec![0; len];
  cursor.read_exact(&mut bytes)?;
  Ok(bytes)
}

fn get_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
  String::from_utf8(get_bytes(cursor)?)
    .map_err(|error| FoehnError::InvalidFrame(format!("field is not valid UTF-8: {error}")))
}

fn get_bool(cursor: &mut Cursor<&[u8]>) -> Result<bool> {
  match cursor.read_u8()? {
    0 => Ok(false),
    1 => Ok(true),
    other => Err(FoehnError::InvalidFrame(format!("invalid bool {other}"))),
  }
}

fn get_opt_u32(cursor: &mut Cursor<&[u8]>) -> Result<Option<u32>> {
  match cursor.read_u8()? {
    0 => Ok(None),
    1 => Ok(Some(cursor.read_u32::<LittleEndian>()?)),
    tag => Err(FoehnError::InvalidFrame(format!("invalid option tag {tag}"))),
  }
}

fn get_value(cursor: &mut Cursor<&[u8]>) -> Result<Option<FabricValue>> {
  match cursor.read_u8()? {
    VALUE_NONE => Ok(None),
    VALUE_BYTES => Ok(Some(FabricValue::Bytes(get_bytes(cursor)?))),
    VALUE_STRING => Ok(Some(FabricValue::String(get_string(cursor)?))),
    VALUE_U32 => Ok(Some(FabricValue::U32(cursor.read_u32::<LittleEndian>()?))),
    tag => Err(FoehnError::InvalidFrame(format!("invalid value tag {tag}"))),
  }
}

fn ensure_consumed(cursor: &Cursor<&[u8]>) -> Result<()> {
  if cursor.position() as usize != cursor.get_ref().len() {
    return Err(FoehnError::InvalidFrame(
      "frame contains unexpected trailing bytes".to_string(),
    ));
  }
  Ok(())
}
