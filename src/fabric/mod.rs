//! The coordination fabric seen from the client side.
//!
//! A fabric provides group membership and a key-value exchange between the
//! processes of one job. The client only ever talks to it through [`Fabric`],
//! a narrow request/response surface. Values returned by `get` stay owned by
//! the fabric until they are handed back through [`Fabric::release`].

pub mod memory;
pub mod server;
pub mod tcp;
pub mod wire;

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::identity::{Namespace, ProcessIdentity, RankSelector};

pub use memory::{CallCounts, MemoryCluster, MemoryFabric};
pub use server::{FabricServer, ServerHandle};
pub use tcp::TcpFabric;

/// Well-known key holding the number of processes in the job.
pub const JOB_SIZE_KEY: &str = "fabric.job.size";

/// Status codes reported by a fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum FabricStatus {
  #[error("general error")]
  Error,
  #[error("operation timed out")]
  Timeout,
  #[error("fabric unreachable")]
  Unreachable,
  #[error("bad parameter")]
  BadParam,
  #[error("out of resources")]
  OutOfResource,
  #[error("fabric initialization failed")]
  Init,
  #[error("not found")]
  NotFound,
  #[error("not supported")]
  NotSupported,
  #[error("unknown fabric status {0}")]
  Other(i32),
}

impl FabricStatus {
  pub const fn code(self) -> i32 {
    match self {
      FabricStatus::Error => -1,
      FabricStatus::Timeout => -24,
      FabricStatus::Unreachable => -25,
      FabricStatus::BadParam => -27,
      FabricStatus::OutOfResource => -29,
      FabricStatus::Init => -31,
      FabricStatus::NotFound => -46,
      FabricStatus::NotSupported => -47,
      FabricStatus::Other(code) => code,
    }
  }

  pub const fn from_code(code: i32) -> Self {
    match code {
      -1 => FabricStatus::Error,
      -24 => FabricStatus::Timeout,
      -25 => FabricStatus::Unreachable,
      -27 => FabricStatus::BadParam,
      -29 => FabricStatus::OutOfResource,
      -31 => FabricStatus::Init,
      -46 => FabricStatus::NotFound,
      -47 => FabricStatus::NotSupported,
      other => FabricStatus::Other(other),
    }
  }
}

/// A typed record held by the fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricValue {
  Bytes(Vec<u8>),
  String(String),
  U32(u32),
}

impl FabricValue {
  pub fn type_name(&self) -> &'static str {
    match self {
      FabricValue::Bytes(_) => "byte object",
      FabricValue::String(_) => "string",
      FabricValue::U32(_) => "uint32",
    }
  }
}

/// Visibility of a published record. Only global publication is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
  #[default]
  Global,
}

/// Fabric operations, used to address fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FabricOp {
  Initialize,
  Finalize,
  Put,
  Commit,
  Get,
}

impl fmt::Display for FabricOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = match self {
      FabricOp::Initialize => "initialize",
      FabricOp::Finalize => "finalize",
      FabricOp::Put => "put",
      FabricOp::Commit => "commit",
      FabricOp::Get => "get",
    };
    write!(f, "{value}")
  }
}

/// Options attached to a `get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchOptions {
  /// Block until the key is visible or `timeout` elapses.
  pub wait: bool,
  /// Upper bound on the wait; `None` waits indefinitely.
  pub timeout: Option<Duration>,
  pub target: RankSelector,
}

impl FetchOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn wait(mut self, value: bool) -> Self {
    self.wait = value;
    self
  }

  pub fn timeout(mut self, value: Duration) -> Self {
    self.timeout = Some(value);
    self
  }

  pub fn target(mut self, value: RankSelector) -> Self {
    self.target = value;
    self
  }

  /// Blocking lookup of an ordinary key, bounded by `timeout`.
  pub fn blocking(timeout: Duration) -> Self {
    Self::new()
      .wait(true)
      .timeout(timeout)
      .target(RankSelector::Undefined)
  }
}

/// A fabric-owned value returned by `get`.
///
/// The holder must pass it back to [`Fabric::release`] exactly once.
#[derive(Debug)]
pub struct ValueHandle {
  id: u64,
  value: Option<FabricValue>,
}

impl ValueHandle {
  pub fn new(id: u64, value: Option<FabricValue>) -> Self {
    Self { id, value }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn value(&self) -> Option<&FabricValue> {
    self.value.as_ref()
  }
}

/// Request/response surface of a coordination fabric.
///
/// Implementations are shared between threads; blocking `get` calls are
/// expected to run concurrently with `put`/`commit` from other threads.
pub trait Fabric: Send + Sync {
  /// Join the job and learn this process's identity.
  fn initialize(&self) -> Result<ProcessIdentity, FabricStatus>;

  /// Leave the job.
  fn finalize(&self) -> Result<(), FabricStatus>;

  /// Stage a record; it is not visible to peers until `commit`.
  fn put(&self, scope: Scope, key: &str, value: FabricValue) -> Result<(), FabricStatus>;

  /// Make every staged record visible to the namespace.
  fn commit(&self) -> Result<(), FabricStatus>;

  /// Look up `key`, optionally waiting for it to appear.
  fn get(
    &self,
    namespace: &Namespace,
    key: &str,
    options: &FetchOptions,
  ) -> Result<ValueHandle, FabricStatus>;

  /// Hand a value returned by `get` back to the fabric.
  fn release(&self, handle: ValueHandle);
}
