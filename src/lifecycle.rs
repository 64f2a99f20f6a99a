//! Registration lifecycle.
//!
//! A process registers with the fabric at most once. [`LifecycleGuard`] owns
//! that transition and the matching teardown:
//!
//! ```text
//! Uninit --register ok--> Ready --finalize--> Finalized
//!    \
//!     `--register err--> Failed
//! ```
//!
//! Transitions are serialized, so concurrent registrations produce exactly one
//! Ready state and `AlreadyRegistered` for everyone else. `Failed` and
//! `Finalized` are terminal.

use std::fmt;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::client::FabricClient;
use crate::error::{FoehnError, Result};
use crate::fabric::{Fabric, FabricStatus};
use crate::identity::ProcessIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
  Uninit,
  Ready,
  Failed,
  Finalized,
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = match self {
      LifecycleState::Uninit => "uninit",
      LifecycleState::Ready => "ready",
      LifecycleState::Failed => "failed",
      LifecycleState::Finalized => "finalized",
    };
    write!(f, "{value}")
  }
}

/// Everything an operation needs once registration succeeded.
#[derive(Debug)]
pub(crate) struct Session {
  pub(crate) client: FabricClient,
  pub(crate) identity: ProcessIdentity,
  pub(crate) timeout: Duration,
}

#[derive(Debug)]
enum Slot {
  Uninit,
  Ready(Arc<Session>),
  Failed(FabricStatus),
  Finalized,
}

#[derive(Debug)]
pub struct LifecycleGuard {
  slot: Mutex<Slot>,
}

static GLOBAL: OnceLock<Arc<LifecycleGuard>> = OnceLock::new();
static EXIT_HOOK: Once = Once::new();

impl Default for LifecycleGuard {
  fn default() -> Self {
    Self::new()
  }
}

impl LifecycleGuard {
  pub fn new() -> Self {
    Self {
      slot: Mutex::new(Slot::Uninit),
    }
  }

  /// The process-wide guard. The first call arranges for `finalize` to run
  /// when the process exits.
  pub fn global() -> Arc<LifecycleGuard> {
    let guard = GLOBAL.get_or_init(|| Arc::new(LifecycleGuard::new()));
    EXIT_HOOK.call_once(install_exit_hook);
    Arc::clone(guard)
  }

  /// Register with `fabric`; `timeout` becomes the default wait bound of
  /// handles attached to this guard.
  pub fn register(&self, fabric: Arc<dyn Fabric>, timeout: Duration) -> Result<ProcessIdentity> {
    let mut slot = self.slot.lock();
    match &*slot {
      Slot::Ready(_) | Slot::Finalized => return Err(FoehnError::AlreadyRegistered),
      Slot::Failed(status) => return Err(FoehnError::FabricUnavailable(*status)),
      Slot::Uninit => {}
    }

    let client = FabricClient::new(fabric);
    match client.initialize() {
      Ok(identity) => {
        tracing::info!(%identity, ?timeout, "registered with fabric");
        *slot = Slot::Ready(Arc::new(Session {
          client,
          identity: identity.clone(),
          timeout,
        }));
        Ok(identity)
      }
      Err(error) => {
        tracing::warn!(%error, "fabric registration failed");
        if let FoehnError::FabricUnavailable(status) = &error {
          *slot = Slot::Failed(*status);
        }
        Err(error)
      }
    }
  }

  /// Leave the fabric. Only the first call after a successful registration
  /// reaches the fabric; every other call is a no-op. Never fails.
  pub fn finalize(&self) {
    let mut slot = self.slot.lock();
    let session = match &*slot {
      Slot::Ready(session) => Arc::clone(session),
      _ => return,
    };
    *slot = Slot::Finalized;

    match session.client.finalize() {
      Ok(()) => tracing::info!(identity = %session.identity, "finalized fabric"),
      Err(status) => tracing::warn!(%status, "fabric finalize failed"),
    }
  }

  pub fn state(&self) -> LifecycleState {
    match &*self.slot.lock() {
      Slot::Uninit => LifecycleState::Uninit,
      Slot::Ready(_) => LifecycleState::Ready,
      Slot::Failed(_) => LifecycleState::Failed,
      Slot::Finalized => LifecycleState::Finalized,
    }
  }

  pub fn identity(&self) -> Option<ProcessIdentity> {
    match &*self.slot.lock() {
      Slot::Ready(session) => Some(session.identity.clone()),
      _ => None,
    }
  }

  pub(crate) fn session(&self) -> Result<Arc<Session>> {
    match &*self.slot.lock() {
      Slot::Ready(session) => Ok(Arc::clone(session)),
      _ => Err(FoehnError::NotInitialized),
    }
  }
}

impl Drop for LifecycleGuard {
  fn drop(&mut self) {
    self.finalize();
  }
}

#[cfg(unix)]
fn install_exit_hook() {
  extern "C" fn finalize_at_exit() {
    if let Some(guard) = GLOBAL.get() {
      guard.finalize();
    }
  }

  // SAFETY: `finalize_at_exit` is a plain function that only touches statics
  // which stay valid for the whole process lifetime.
  let rc = unsafe { libc::atexit(finalize_at_exit) };
  if rc != 0 {
    tracing::warn!(rc, "failed to install fabric finalize exit hook");
  }
}

#[cfg(not(unix))]
fn install_exit_hook() {
  tracing::debug!("no exit hook on this platform; call finalize explicitly");
}
