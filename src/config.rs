//! Options for stores, fabric clients and the fabric server.
//!
//! Every options type has a builder-style API and a `from_env` constructor
//! reading the variables launchers export to each process:
//!
//! | variable                  | used by            | default            |
//! |---------------------------|--------------------|--------------------|
//! | `FOEHN_TIMEOUT`           | `StoreOptions`     | `30` (seconds)     |
//! | `FOEHN_FABRIC_ADDR`       | `TcpFabricOptions` | required           |
//! | `FOEHN_RANK`              | `TcpFabricOptions` | assigned by fabric |
//! | `FOEHN_CONNECT_TIMEOUT_MS`| `TcpFabricOptions` | `5000`             |
//! | `FOEHN_LISTEN`            | `ServerOptions`    | `127.0.0.1:7411`   |
//! | `FOEHN_NAMESPACE`         | `ServerOptions`    | `foehn`            |
//! | `FOEHN_WORLD_SIZE`        | `ServerOptions`    | unset              |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FoehnError, Result};

pub const ENV_TIMEOUT: &str = "FOEHN_TIMEOUT";
pub const ENV_FABRIC_ADDR: &str = "FOEHN_FABRIC_ADDR";
pub const ENV_RANK: &str = "FOEHN_RANK";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "FOEHN_CONNECT_TIMEOUT_MS";
pub const ENV_LISTEN: &str = "FOEHN_LISTEN";
pub const ENV_NAMESPACE: &str = "FOEHN_NAMESPACE";
pub const ENV_WORLD_SIZE: &str = "FOEHN_WORLD_SIZE";

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7411";
pub const DEFAULT_NAMESPACE: &str = "foehn";

/// Options for a [`crate::RendezvousStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
  /// Bound on every blocking fetch made through the handle.
  pub timeout: Duration,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
    }
  }
}

impl StoreOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn timeout(mut self, value: Duration) -> Self {
    self.timeout = value;
    self
  }

  /// Timeout in whole seconds, the unit hosts configure it in.
  pub fn timeout_secs(self, secs: u64) -> Self {
    self.timeout(Duration::from_secs(secs))
  }

  pub fn from_env() -> Result<Self> {
    let mut options = Self::new();
    if let Some(secs) = env_parse::<u64>(ENV_TIMEOUT)? {
      options = options.timeout_secs(secs);
    }
    Ok(options)
  }
}

/// Options for a [`crate::fabric::TcpFabric`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFabricOptions {
  pub address: String,
  /// Rank to ask for; the server assigns the lowest free rank otherwise.
  pub rank_hint: Option<u32>,
  pub connect_timeout: Duration,
}

impl TcpFabricOptions {
  pub fn new(address: impl Into<String>) -> Self {
    Self {
      address: address.into(),
      rank_hint: None,
      connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
    }
  }

  pub fn rank_hint(mut self, rank: u32) -> Self {
    self.rank_hint = Some(rank);
    self
  }

  pub fn connect_timeout(mut self, value: Duration) -> Self {
    self.connect_timeout = value;
    self
  }

  pub fn from_env() -> Result<Self> {
    let address = env_string(ENV_FABRIC_ADDR)
      .ok_or_else(|| FoehnError::Config(format!("{ENV_FABRIC_ADDR} is not set")))?;

    let mut options = Self::new(address);
    if let Some(rank) = env_parse::<u32>(ENV_RANK)? {
      options = options.rank_hint(rank);
    }
    if let Some(ms) = env_parse::<u64>(ENV_CONNECT_TIMEOUT_MS)? {
      options = options.connect_timeout(Duration::from_millis(ms));
    }
    Ok(options)
  }
}

/// Options for the `foehn-fabric` server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerOptions {
  pub listen: String,
  pub namespace: String,
  pub world_size: Option<u32>,
}

impl Default for ServerOptions {
  fn default() -> Self {
    Self {
      listen: DEFAULT_LISTEN.to_string(),
      namespace: DEFAULT_NAMESPACE.to_string(),
      world_size: None,
    }
  }
}

impl ServerOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn listen(mut self, value: impl Into<String>) -> Self {
    self.listen = value.into();
    self
  }

  pub fn namespace(mut self, value: impl Into<String>) -> Self {
    self.namespace = value.into();
    self
  }

  pub fn world_size(mut self, value: u32) -> Self {
    self.world_size = Some(value);
    self
  }

  pub fn from_env() -> Result<Self> {
    let mut options = Self::new();
    if let Some(listen) = env_string(ENV_LISTEN) {
      options = options.listen(listen);
    }
    if let Some(namespace) = env_string(ENV_NAMESPACE) {
      options = options.namespace(namespace);
    }
    if let Some(size) = env_parse::<u32>(ENV_WORLD_SIZE)? {
      options = options.world_size(size);
    }
    Ok(options)
  }
}

fn env_string(name: &str) -> Option<String> {
  std::env::var(name)
    .ok()
    .map(|value| value.trim().to_string())
    .filter(|value| !value.is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  env_string(name)
    .map(|raw| parse_setting(name, &raw))
    .transpose()
}

fn parse_setting<T>(name: &str, raw: &str) -> Result<T>
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  raw
    .parse::<T>()
    .map_err(|error| FoehnError::Config(format!("invalid {name} '{raw}': {error}")))
}
