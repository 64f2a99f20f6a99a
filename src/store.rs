//! Rendezvous key-value store.
//!
//! The public handle used by the processes of a job to exchange small values:
//! publish a key once, let peers block on it, learn rank and group size.
//!
//! ```no_run
//! use std::sync::Arc;
//! use foehn::{LifecycleGuard, RendezvousStore, StoreOptions, TcpFabric};
//!
//! # fn main() -> foehn::Result<()> {
//! let fabric = Arc::new(TcpFabric::from_env()?);
//! let store = RendezvousStore::open(LifecycleGuard::global(), fabric, StoreOptions::from_env()?)?;
//!
//! let rank = store.rank()?;
//! store.put(format!("addr/{rank}").as_str(), "10.0.0.7:29500")?;
//! let peer = store.get("addr/0")?;
//! # let _ = peer;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::codec::{self, Value};
use crate::config::StoreOptions;
use crate::error::Result;
use crate::fabric::{Fabric, FetchOptions};
use crate::identity::{ProcessIdentity, GROUP_SIZE_UNKNOWN};
use crate::lifecycle::LifecycleGuard;

#[derive(Debug, Clone)]
pub struct RendezvousStore {
  lifecycle: Arc<LifecycleGuard>,
  timeout: Option<Duration>,
}

impl RendezvousStore {
  /// Register through `lifecycle` and return a handle bound to it.
  pub fn open(
    lifecycle: Arc<LifecycleGuard>,
    fabric: Arc<dyn Fabric>,
    options: StoreOptions,
  ) -> Result<Self> {
    lifecycle.register(fabric, options.timeout)?;
    Ok(Self {
      lifecycle,
      timeout: Some(options.timeout),
    })
  }

  /// A handle on an existing guard, registered or not. Operations fail with
  /// `NotInitialized` until the guard is ready.
  pub fn attach(lifecycle: Arc<LifecycleGuard>) -> Self {
    Self {
      lifecycle,
      timeout: None,
    }
  }

  /// Override the wait bound for this handle.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn lifecycle(&self) -> &Arc<LifecycleGuard> {
    &self.lifecycle
  }

  /// The handle's wait bound, falling back to the registration default.
  pub fn timeout(&self) -> Result<Duration> {
    match self.timeout {
      Some(timeout) => Ok(timeout),
      None => Ok(self.lifecycle.session()?.timeout),
    }
  }

  pub fn identity(&self) -> Result<ProcessIdentity> {
    Ok(self.lifecycle.session()?.identity.clone())
  }

  pub fn rank(&self) -> Result<u32> {
    Ok(self.lifecycle.session()?.identity.rank())
  }

  /// Number of processes in the job, or [`GROUP_SIZE_UNKNOWN`].
  pub fn group_size(&self) -> u32 {
    match self.lifecycle.session() {
      Ok(session) => session
        .client
        .query_group_size(session.identity.namespace()),
      Err(_) => GROUP_SIZE_UNKNOWN,
    }
  }

  /// Publish `value` under `key` and commit it immediately.
  pub fn put<'k, 'v>(&self, key: impl Into<Value<'k>>, value: impl Into<Value<'v>>) -> Result<()> {
    let session = self.lifecycle.session()?;
    let key = codec::encode_key(key.into())?;
    let value = codec::encode_value(value.into())?;

    session.client.publish(&key, value)?;
    session.client.commit(&key)
  }

  /// Publish every entry, then commit once so peers observe them together.
  ///
  /// All entries are validated before anything reaches the fabric.
  pub fn put_many<'a, I, K, V>(&self, entries: I) -> Result<()>
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<Value<'a>>,
    V: Into<Value<'a>>,
  {
    let session = self.lifecycle.session()?;
    let encoded = entries
      .into_iter()
      .map(|(key, value)| {
        Ok((
          codec::encode_key(key.into())?,
          codec::encode_value(value.into())?,
        ))
      })
      .collect::<Result<Vec<_>>>()?;

    let Some((last_key, _)) = encoded.last() else {
      return Ok(());
    };
    let last_key = last_key.clone();

    for (key, value) in encoded {
      session.client.publish(&key, value)?;
    }
    session.client.commit(&last_key)
  }

  /// Block until `key` is visible and return its bytes.
  pub fn get<'k>(&self, key: impl Into<Value<'k>>) -> Result<Vec<u8>> {
    let session = self.lifecycle.session()?;
    let key = codec::encode_key(key.into())?;
    let timeout = self.timeout.unwrap_or(session.timeout);

    session.client.fetch(
      session.identity.namespace(),
      &key,
      &FetchOptions::blocking(timeout),
    )
  }

  /// Block until every key exists, in order, each bounded by the handle's
  /// timeout. Stops at the first key that fails.
  pub fn wait_for_keys<'k, I, K>(&self, keys: I) -> Result<()>
  where
    I: IntoIterator<Item = K>,
    K: Into<Value<'k>>,
  {
    let timeout = self.timeout()?;
    self.wait_for_keys_within(keys, timeout)
  }

  /// Like [`Self::wait_for_keys`] with an explicit per-key timeout. The wait
  /// is sequential, so the worst case is `timeout` times the number of keys.
  pub fn wait_for_keys_within<'k, I, K>(&self, keys: I, timeout: Duration) -> Result<()>
  where
    I: IntoIterator<Item = K>,
    K: Into<Value<'k>>,
  {
    let session = self.lifecycle.session()?;
    let options = FetchOptions::blocking(timeout);

    for key in keys {
      let key = codec::encode_key(key.into())?;
      session
        .client
        .await_key(session.identity.namespace(), &key, &options)?;
    }
    Ok(())
  }
}
