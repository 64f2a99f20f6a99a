//! Process identity within a coordinated job.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FoehnError, Result};

/// Maximum namespace length accepted by fabrics.
pub const MAX_NAMESPACE_LEN: usize = 255;

/// Returned by group-size lookups when the fabric cannot answer.
///
/// Hosts that expose sizes as signed integers conventionally read this as -1.
pub const GROUP_SIZE_UNKNOWN: u32 = u32::MAX;

/// Raw rank value meaning "fabric decides".
pub const RANK_UNDEF: u32 = u32::MAX;
/// Raw rank value meaning "any rank in the namespace".
pub const RANK_WILDCARD: u32 = u32::MAX - 1;

/// Fabric-assigned identifier grouping all processes of one job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace(String);

impl Namespace {
  pub fn new(raw: impl Into<String>) -> Result<Self> {
    let raw = raw.into();
    if raw.is_empty() {
      return Err(FoehnError::Encoding("namespace must not be empty".to_string()));
    }
    if raw.len() > MAX_NAMESPACE_LEN {
      return Err(FoehnError::Encoding(format!(
        "namespace longer than {MAX_NAMESPACE_LEN} bytes: {}",
        raw.len()
      )));
    }
    if raw.as_bytes().contains(&0) {
      return Err(FoehnError::Encoding(
        "namespace contains a NUL byte".to_string(),
      ));
    }
    Ok(Self(raw))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Namespace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Identity of the local process, populated once at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
  namespace: Namespace,
  rank: u32,
}

impl ProcessIdentity {
  pub fn new(namespace: Namespace, rank: u32) -> Result<Self> {
    if rank >= RANK_WILDCARD {
      return Err(FoehnError::Encoding(format!(
        "rank {rank} collides with a reserved selector value"
      )));
    }
    Ok(Self { namespace, rank })
  }

  pub fn namespace(&self) -> &Namespace {
    &self.namespace
  }

  pub fn rank(&self) -> u32 {
    self.rank
  }
}

impl fmt::Display for ProcessIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.namespace, self.rank)
  }
}

/// Rank target of a fetch. Callers never address a fixed peer rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RankSelector {
  /// Any rank in the namespace; used for job-level records such as the size.
  Wildcard,
  /// Let the fabric resolve the owner of the key.
  #[default]
  Undefined,
}

impl RankSelector {
  pub const fn raw(self) -> u32 {
    match self {
      RankSelector::Wildcard => RANK_WILDCARD,
      RankSelector::Undefined => RANK_UNDEF,
    }
  }

  pub fn from_raw(raw: u32) -> Option<Self> {
    match raw {
      RANK_WILDCARD => Some(Self::Wildcard),
      RANK_UNDEF => Some(Self::Undefined),
      _ => None,
    }
  }
}

impl fmt::Display for RankSelector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = match self {
      RankSelector::Wildcard => "wildcard",
      RankSelector::Undefined => "undef",
    };
    write!(f, "{value}")
  }
}
