//! Foehn - rendezvous key-value exchange for the processes of a parallel job.
//!
//! Cooperating processes (for example distributed training workers) register
//! once with a coordination fabric, then publish small binary values under
//! text keys and block until their peers' values appear.
//!
//! # Module Organization
//!
//! - [`store`] - [`RendezvousStore`], the handle applications use
//! - [`lifecycle`] - one registration per process, finalize once at exit
//! - [`client`] - fabric calls and status mapping
//! - [`codec`] - key and value encoding
//! - [`identity`] - namespace, rank and rank selectors
//! - [`fabric`] - the fabric trait plus in-memory and TCP fabrics
//! - [`config`] - option builders and environment settings
//! - [`error`] - error taxonomy

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod fabric;
pub mod identity;
pub mod lifecycle;
pub mod store;

#[cfg(feature = "python")]
pub mod pyo3_bindings;

pub use client::FabricClient;
pub use codec::Value;
pub use config::{ServerOptions, StoreOptions, TcpFabricOptions};
pub use error::{FoehnError, Result};
pub use fabric::{
  Fabric, FabricServer, FabricStatus, FabricValue, FetchOptions, MemoryCluster, MemoryFabric,
  TcpFabric,
};
pub use identity::{Namespace, ProcessIdentity, RankSelector, GROUP_SIZE_UNKNOWN};
pub use lifecycle::{LifecycleGuard, LifecycleState};
pub use store::RendezvousStore;
