//! Error types for the rendezvous client.

use thiserror::Error;

use crate::fabric::FabricStatus;

#[derive(Debug, Error)]
pub enum FoehnError {
  #[error("fabric already registered in this process")]
  AlreadyRegistered,

  #[error("failed to initialize fabric: {0}")]
  FabricUnavailable(FabricStatus),

  #[error("fabric not initialized")]
  NotInitialized,

  #[error("invalid value type: expected str or bytes, got {0}")]
  InvalidValueType(String),

  #[error("encoding error: {0}")]
  Encoding(String),

  #[error("failed to publish key '{key}': {status}")]
  PublishFailed { key: String, status: FabricStatus },

  #[error("failed to commit key '{key}': {status}")]
  CommitFailed { key: String, status: FabricStatus },

  #[error("timed out waiting for key '{key}'")]
  Timeout { key: String },

  #[error("key '{key}' holds {found}, expected a byte object")]
  TypeMismatch { key: String, found: &'static str },

  #[error("fabric returned no payload for key '{key}'")]
  NullValue { key: String },

  #[error("failed to get key '{key}': {status}")]
  FetchFailed { key: String, status: FabricStatus },

  #[error("invalid frame: {0}")]
  InvalidFrame(String),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

impl FoehnError {
  /// True when a bounded wait expired; callers commonly poll again.
  pub fn is_timeout(&self) -> bool {
    matches!(self, FoehnError::Timeout { .. })
  }

  /// The key an operation failed on, when there is one.
  pub fn key(&self) -> Option<&str> {
    match self {
      FoehnError::PublishFailed { key, .. }
      | FoehnError::CommitFailed { key, .. }
      | FoehnError::Timeout { key }
      | FoehnError::TypeMismatch { key, .. }
      | FoehnError::NullValue { key }
      | FoehnError::FetchFailed { key, .. } => Some(key),
      _ => None,
    }
  }
}

pub type Result<T> = std::result::Result<T, FoehnError>;
