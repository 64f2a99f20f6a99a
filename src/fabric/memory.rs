//! In-process fabric.
//!
//! A [`MemoryCluster`] is the shared record table of one namespace. Each
//! [`MemoryFabric`] joined to it plays the part of one process: it stages its
//! own puts, makes them visible on commit, and blocks in `get` on a condition
//! variable until a peer commits the key or the deadline passes. Members also
//! keep call counts, track the handles they hand out, and accept one-shot
//! injected faults, so tests can observe exactly what the client did.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};

use super::{
  Fabric, FabricOp, FabricStatus, FabricValue, FetchOptions, Scope, ValueHandle, JOB_SIZE_KEY,
};
use crate::identity::{Namespace, ProcessIdentity};

#[derive(Debug, Default)]
struct ClusterState {
  records: HashMap<String, Option<FabricValue>>,
  members: HashSet<u32>,
}

/// Shared state of one namespace.
#[derive(Debug)]
pub struct MemoryCluster {
  namespace: Namespace,
  world_size: Option<u32>,
  state: Mutex<ClusterState>,
  published: Condvar,
}

impl MemoryCluster {
  pub fn new(namespace: Namespace) -> Self {
    Self {
      namespace,
      world_size: None,
      state: Mutex::new(ClusterState::default()),
      published: Condvar::new(),
    }
  }

  /// Advertise a job size; without one, size lookups report `NotFound`.
  pub fn with_world_size(mut self, world_size: u32) -> Self {
    self.world_size = Some(world_size);
    self
  }

  pub fn namespace(&self) -> &Namespace {
    &self.namespace
  }

  pub fn world_size(&self) -> Option<u32> {
    self.world_size
  }

  /// A new member that takes the lowest free rank on `initialize`.
  pub fn join(self: &Arc<Self>) -> MemoryFabric {
    MemoryFabric::new(Arc::clone(self), None)
  }

  /// A new member that asks for a specific rank on `initialize`.
  pub fn join_as(self: &Arc<Self>, rank: u32) -> MemoryFabric {
    MemoryFabric::new(Arc::clone(self), Some(rank))
  }

  /// Ranks currently initialized.
  pub fn members(&self) -> Vec<u32> {
    let mut members: Vec<u32> = self.state.lock().members.iter().copied().collect();
    members.sort_unstable();
    members
  }

  pub fn record_count(&self) -> usize {
    self.state.lock().records.len()
  }

  /// Test helper: place a record directly, bypassing put/commit.
  ///
  /// `None` models a record the fabric reports as present but without payload.
  pub fn insert_record_for_testing(&self, key: &str, value: Option<FabricValue>) {
    self.state.lock().records.insert(key.to_string(), value);
    self.published.notify_all();
  }

  fn claim_rank(&self, requested: Option<u32>) -> Result<u32, FabricStatus> {
    let mut state = self.state.lock();
    let rank = match requested {
      Some(rank) if state.members.contains(&rank) => return Err(FabricStatus::BadParam),
      Some(rank) => rank,
      None => (0..u32::MAX)
        .find(|rank| !state.members.contains(rank))
        .ok_or(FabricStatus::OutOfResource)?,
    };

    if let Some(world_size) = self.world_size {
      if rank >= world_size {
        return Err(FabricStatus::OutOfResource);
      }
    }

    state.members.insert(rank);
    Ok(rank)
  }

  fn leave(&self, rank: u32) {
    self.state.lock().members.remove(&rank);
  }

  fn publish(&self, staged: Vec<(String, FabricValue)>) {
    if staged.is_empty() {
      return;
    }
    let mut state = self.state.lock();
    for (key, value) in staged {
      state.records.insert(key, Some(value));
    }
    drop(state);
    self.published.notify_all();
  }

  /// Read a committed record, waiting per `options`. A timeout too large to
  /// form a deadline waits indefinitely.
  pub(super) fn lookup(
    &self,
    key: &str,
    options: &FetchOptions,
  ) -> Result<Option<FabricValue>, FabricStatus> {
    if key == JOB_SIZE_KEY {
      return self
        .world_size
        .map(|size| Some(FabricValue::U32(size)))
        .ok_or(FabricStatus::NotFound);
    }

    let deadline = options
      .timeout
      .and_then(|timeout| Instant::now().checked_add(timeout));
    let mut state = self.state.lock();
    loop {
      if let Some(value) = state.records.get(key) {
        return Ok(value.clone());
      }
      if !options.wait {
        return Err(FabricStatus::NotFound);
      }

      match deadline {
        Some(deadline) => {
          if Instant::now() >= deadline {
            return Err(FabricStatus::Timeout);
          }
          let _ = self.published.wait_until(&mut state, deadline);
        }
        None => self.published.wait(&mut state),
      }
    }
  }
}

/// Snapshot of how many times each fabric call was made on a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCounts {
  pub initialize: usize,
  pub finalize: usize,
  pub put: usize,
  pub commit: usize,
  pub get: usize,
  pub release: usize,
  pub double_release: usize,
}

impl CallCounts {
  /// Calls that reach the fabric, releases excluded.
  pub fn requests(&self) -> usize {
    self.initialize + self.finalize + self.put + self.commit + self.get
  }
}

#[derive(Debug, Default)]
struct Counters {
  initialize: AtomicUsize,
  finalize: AtomicUsize,
  put: AtomicUsize,
  commit: AtomicUsize,
  get: AtomicUsize,
  release: AtomicUsize,
  double_release: AtomicUsize,
}

impl Counters {
  fn bump(&self, op: FabricOp) {
    let counter = match op {
      FabricOp::Initialize => &self.initialize,
      FabricOp::Finalize => &self.finalize,
      FabricOp::Put => &self.put,
      FabricOp::Commit => &self.commit,
      FabricOp::Get => &self.get,
    };
    counter.fetch_add(1, Ordering::Relaxed);
  }

  fn snapshot(&self) -> CallCounts {
    CallCounts {
      initialize: self.initialize.load(Ordering::Relaxed),
      finalize: self.finalize.load(Ordering::Relaxed),
      put: self.put.load(Ordering::Relaxed),
      commit: self.commit.load(Ordering::Relaxed),
      get: self.get.load(Ordering::Relaxed),
      release: self.release.load(Ordering::Relaxed),
      double_release: self.double_release.load(Ordering::Relaxed),
    }
  }
}

/// One process's view of a [`MemoryCluster`].
#[derive(Debug)]
pub struct MemoryFabric {
  cluster: Arc<MemoryCluster>,
  requested_rank: Option<u32>,
  rank: Mutex<Option<u32>>,
  staged: Mutex<Vec<(String, FabricValue)>>,
  handles: Mutex<HashSet<u64>>,
  next_handle: AtomicU64,
  faults: Mutex<HashMap<FabricOp, FabricStatus>>,
  counters: Counters,
}

impl MemoryFabric {
  fn new(cluster: Arc<MemoryCluster>, requested_rank: Option<u32>) -> Self {
    Self {
      cluster,
      requested_rank,
      rank: Mutex::new(None),
      staged: Mutex::new(Vec::new()),
      handles: Mutex::new(HashSet::new()),
      next_handle: AtomicU64::new(1),
      faults: Mutex::new(HashMap::new()),
      counters: Counters::default(),
    }
  }

  pub fn cluster(&self) -> &Arc<MemoryCluster> {
    &self.cluster
  }

  pub fn rank(&self) -> Option<u32> {
    *self.rank.lock()
  }

  pub fn calls(&self) -> CallCounts {
    self.counters.snapshot()
  }

  /// Handles returned by `get` and not yet released.
  pub fn outstanding_handles(&self) -> usize {
    self.handles.lock().len()
  }

  /// Records staged by `put` and not yet committed.
  pub fn staged_len(&self) -> usize {
    self.staged.lock().len()
  }

  /// Make the next call of `op` fail with `status`.
  pub fn fail_next(&self, op: FabricOp, status: FabricStatus) {
    self.faults.lock().insert(op, status);
  }

  fn enter(&self, op: FabricOp) -> Result<(), FabricStatus> {
    self.counters.bump(op);
    match self.faults.lock().remove(&op) {
      Some(status) => Err(status),
      None => Ok(()),
    }
  }

  fn require_rank(&self) -> Result<u32, FabricStatus> {
    self.rank.lock().ok_or(FabricStatus::Init)
  }

  fn lease(&self, value: Option<FabricValue>) -> ValueHandle {
    let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
    self.handles.lock().insert(id);
    ValueHandle::new(id, value)
  }
}

impl Fabric for MemoryFabric {
  fn initialize(&self) -> Result<ProcessIdentity, FabricStatus> {
    self.enter(FabricOp::Initialize)?;

    let mut rank = self.rank.lock();
    if rank.is_some() {
      return Err(FabricStatus::Init);
    }

    let claimed = self.cluster.claim_rank(self.requested_rank)?;
    let identity = match ProcessIdentity::new(self.cluster.namespace.clone(), claimed) {
      Ok(identity) => identity,
      Err(_) => {
        self.cluster.leave(claimed);
        return Err(FabricStatus::BadParam);
      }
    };
    *rank = Some(claimed);
    Ok(identity)
  }

  fn finalize(&self) -> Result<(), FabricStatus> {
    self.enter(FabricOp::Finalize)?;

    let rank = self.rank.lock().take().ok_or(FabricStatus::Init)?;
    self.staged.lock().clear();
    self.cluster.leave(rank);
    Ok(())
  }

  fn put(&self, scope: Scope, key: &str, value: FabricValue) -> Result<(), FabricStatus> {
    self.enter(FabricOp::Put)?;
    self.require_rank()?;

    match scope {
      Scope::Global => self.staged.lock().push((key.to_string(), value)),
    }
    Ok(())
  }

  fn commit(&self) -> Result<(), FabricStatus> {
    self.enter(FabricOp::Commit)?;
    self.require_rank()?;

    let staged = std::mem::take(&mut *self.staged.lock());
    self.cluster.publish(staged);
    Ok(())
  }

  fn get(
    &self,
    namespace: &Namespace,
    key: &str,
    options: &FetchOptions,
  ) -> Result<ValueHandle, FabricStatus> {
    self.enter(FabricOp::Get)?;
    self.require_rank()?;

    if namespace != &self.cluster.namespace {
      return Err(FabricStatus::BadParam);
    }

    let value = self.cluster.lookup(key, options)?;
    Ok(self.lease(value))
  }

  fn release(&self, handle: ValueHandle) {
    self.counters.release.fetch_add(1, Ordering::Relaxed);
    if !self.handles.lock().remove(&handle.id()) {
      self.counters.double_release.fetch_add(1, Ordering::Relaxed);
      tracing::warn!(handle = handle.id(), "released a handle the fabric does not own");
    }
  }
}
