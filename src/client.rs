//! Status-mapping client over a [`Fabric`].
//!
//! Every fabric call made by the rendezvous store goes through here. The
//! client translates fabric status codes into [`FoehnError`] and guarantees
//! that a value handle obtained from `get` is released exactly once, whatever
//! path the fetch takes.

use std::fmt;
use std::sync::Arc;

use crate::codec;
use crate::error::{FoehnError, Result};
use crate::fabric::{Fabric, FabricStatus, FabricValue, FetchOptions, Scope, ValueHandle, JOB_SIZE_KEY};
use crate::identity::{Namespace, ProcessIdentity, RankSelector, GROUP_SIZE_UNKNOWN};

/// Releases a fabric handle when dropped.
struct Lease<'a> {
  fabric: &'a dyn Fabric,
  handle: Option<ValueHandle>,
}

impl<'a> Lease<'a> {
  fn new(fabric: &'a dyn Fabric, handle: ValueHandle) -> Self {
    Self {
      fabric,
      handle: Some(handle),
    }
  }

  fn value(&self) -> Option<&FabricValue> {
    self.handle.as_ref().and_then(ValueHandle::value)
  }
}

impl Drop for Lease<'_> {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      self.fabric.release(handle);
    }
  }
}

#[derive(Clone)]
pub struct FabricClient {
  fabric: Arc<dyn Fabric>,
}

impl fmt::Debug for FabricClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FabricClient").finish_non_exhaustive()
  }
}

impl FabricClient {
  pub fn new(fabric: Arc<dyn Fabric>) -> Self {
    Self { fabric }
  }

  pub fn initialize(&self) -> Result<ProcessIdentity> {
    self
      .fabric
      .initialize()
      .map_err(FoehnError::FabricUnavailable)
  }

  pub fn finalize(&self) -> std::result::Result<(), FabricStatus> {
    self.fabric.finalize()
  }

  /// Stage `bytes` under `key` for global visibility.
  pub fn publish(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
    tracing::debug!(key, len = bytes.len(), "publish");
    self
      .fabric
      .put(Scope::Global, key, FabricValue::Bytes(bytes))
      .map_err(|status| FoehnError::PublishFailed {
        key: key.to_string(),
        status,
      })
  }

  /// Make staged records visible. `key` names the write that triggered the
  /// commit and is only used for diagnostics.
  pub fn commit(&self, key: &str) -> Result<()> {
    tracing::debug!(key, "commit");
    self
      .fabric
      .commit()
      .map_err(|status| FoehnError::CommitFailed {
        key: key.to_string(),
        status,
      })
  }

  /// Fetch the byte object stored under `key`.
  pub fn fetch(&self, namespace: &Namespace, key: &str, options: &FetchOptions) -> Result<Vec<u8>> {
    let lease = self.lease(namespace, key, options)?;
    match lease.value() {
      None => Err(FoehnError::NullValue {
        key: key.to_string(),
      }),
      Some(FabricValue::Bytes(bytes)) if bytes.is_empty() => Err(FoehnError::NullValue {
        key: key.to_string(),
      }),
      Some(FabricValue::Bytes(bytes)) => Ok(codec::from_bytes(bytes)),
      Some(other) => Err(FoehnError::TypeMismatch {
        key: key.to_string(),
        found: other.type_name(),
      }),
    }
  }

  /// Block until `key` exists; the value itself is discarded.
  pub fn await_key(&self, namespace: &Namespace, key: &str, options: &FetchOptions) -> Result<()> {
    self.lease(namespace, key, options).map(drop)
  }

  /// Size of the job, or [`GROUP_SIZE_UNKNOWN`] when the fabric cannot say.
  pub fn query_group_size(&self, namespace: &Namespace) -> u32 {
    let options = FetchOptions::new().target(RankSelector::Wildcard);
    match self.lease(namespace, JOB_SIZE_KEY, &options) {
      Ok(lease) => match lease.value() {
        Some(FabricValue::U32(size)) => *size,
        other => {
          tracing::debug!(?other, "job size record is not a uint32");
          GROUP_SIZE_UNKNOWN
        }
      },
      Err(error) => {
        tracing::debug!(%error, "job size unavailable");
        GROUP_SIZE_UNKNOWN
      }
    }
  }

  fn lease(&self, namespace: &Namespace, key: &str, options: &FetchOptions) -> Result<Lease<'_>> {
    tracing::debug!(
      key,
      wait = options.wait,
      timeout = ?options.timeout,
      target = %options.target,
      "fetch"
    );
    match self.fabric.get(namespace, key, options) {
      Ok(handle) => Ok(Lease::new(self.fabric.as_ref(), handle)),
      Err(FabricStatus::Timeout) => Err(FoehnError::Timeout {
        key: key.to_string(),
      }),
      Err(status) => Err(FoehnError::FetchFailed {
        key: key.to_string(),
        status,
      }),
    }
  }
}
