//! Fabric client speaking the wire protocol to a [`super::FabricServer`].

use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::wire::{read_response, write_request, Request, Response};
use super::{Fabric, FabricStatus, FabricValue, FetchOptions, Scope, ValueHandle};
use crate::config::TcpFabricOptions;
use crate::error::{FoehnError, Result};
use crate::identity::{Namespace, ProcessIdentity};

/// A fabric reached over TCP.
///
/// The control connection carries `Init`, `Commit` and `Finalize` and is the
/// process's membership in the job. Puts are staged locally and shipped in a
/// single request on commit. Gets run on separate lookup connections drawn
/// from a pool, so a blocking get never holds up puts, commits or finalize
/// on other threads. The server enforces get timeouts, so sockets have no
/// read timeout of their own.
#[derive(Debug)]
pub struct TcpFabric {
  options: TcpFabricOptions,
  control: Mutex<Option<TcpStream>>,
  lookups: Mutex<Vec<TcpStream>>,
  joined: AtomicBool,
  staged: Mutex<Vec<(String, FabricValue)>>,
  next_handle: AtomicU64,
}

impl TcpFabric {
  pub fn new(options: TcpFabricOptions) -> Self {
    Self {
      options,
      control: Mutex::new(None),
      lookups: Mutex::new(Vec::new()),
      joined: AtomicBool::new(false),
      staged: Mutex::new(Vec::new()),
      next_handle: AtomicU64::new(1),
    }
  }

  /// Build from `FOEHN_FABRIC_ADDR` and friends.
  pub fn from_env() -> Result<Self> {
    Ok(Self::new(TcpFabricOptions::from_env()?))
  }

  pub fn options(&self) -> &TcpFabricOptions {
    &self.options
  }

  fn connect(&self) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = self.options.address.to_socket_addrs()?.collect();
    let mut last_error = None;
    for addr in addrs {
      match TcpStream::connect_timeout(&addr, self.options.connect_timeout) {
        Ok(stream) => {
          stream.set_nodelay(true)?;
          return Ok(stream);
        }
        Err(error) => last_error = Some(error),
      }
    }
    Err(match last_error {
      Some(error) => FoehnError::Io(error),
      None => FoehnError::Config(format!(
        "fabric address resolved to nothing: {}",
        self.options.address
      )),
    })
  }

  /// Round trip on the control connection. Control requests are short, so
  /// serializing them behind one lock is fine.
  fn call(&self, request: &Request) -> std::result::Result<Response, FabricStatus> {
    let mut control = self.control.lock();
    let stream = control.as_mut().ok_or(FabricStatus::Init)?;
    let result = write_request(stream, request).and_then(|()| read_response(stream));
    match result {
      Ok(Response::Status(status)) => Err(status),
      Ok(response) => Ok(response),
      Err(error) => {
        tracing::warn!(%error, "fabric connection failed");
        *control = None;
        self.joined.store(false, Ordering::Release);
        Err(FabricStatus::Unreachable)
      }
    }
  }

  /// Round trip on a lookup connection, reusing an idle one when possible.
  /// The pool lock is only held to take or return a connection.
  fn lookup(&self, request: &Request) -> std::result::Result<Response, FabricStatus> {
    let pooled = self.lookups.lock().pop();
    let mut stream = match pooled {
      Some(stream) => stream,
      None => self.connect().map_err(|error| {
        tracing::warn!(address = %self.options.address, %error, "cannot open lookup connection");
        FabricStatus::Unreachable
      })?,
    };

    match write_request(&mut stream, request).and_then(|()| read_response(&mut stream)) {
      Ok(response) => {
        if self.joined.load(Ordering::Acquire) {
          self.lookups.lock().push(stream);
        }
        match response {
          Response::Status(status) => Err(status),
          response => Ok(response),
        }
      }
      Err(error) => {
        tracing::warn!(%error, "fabric lookup connection failed");
        Err(FabricStatus::Unreachable)
      }
    }
  }
}

fn unexpected(response: Response) -> FabricStatus {
  tracing::warn!(?response, "unexpected fabric response");
  FabricStatus::Error
}

impl Fabric for TcpFabric {
  fn initialize(&self) -> std::result::Result<ProcessIdentity, FabricStatus> {
    let mut control = self.control.lock();
    if control.is_some() {
      return Err(FabricStatus::Init);
    }

    let mut stream = self.connect().map_err(|error| {
      tracing::warn!(address = %self.options.address, %error, "cannot reach fabric");
      FabricStatus::Unreachable
    })?;

    let request = Request::Init {
      rank_hint: self.options.rank_hint,
    };
    let response = write_request(&mut stream, &request)
      .and_then(|()| read_response(&mut stream))
      .map_err(|_| FabricStatus::Unreachable)?;

    match response {
      Response::Identity { namespace, rank } => {
        let namespace = Namespace::new(namespace).map_err(|_| FabricStatus::BadParam)?;
        let identity = ProcessIdentity::new(namespace, rank).map_err(|_| FabricStatus::BadParam)?;
        *control = Some(stream);
        self.joined.store(true, Ordering::Release);
        Ok(identity)
      }
      Response::Status(status) => Err(status),
      other => Err(unexpected(other)),
    }
  }

  /// Leaves the job without waiting for gets in flight on other threads;
  /// their lookup connections are closed when those gets return.
  fn finalize(&self) -> std::result::Result<(), FabricStatus> {
    self.joined.store(false, Ordering::Release);
    let outcome = self.call(&Request::Finalize);
    self.staged.lock().clear();
    if let Some(stream) = self.control.lock().take() {
      let _ = stream.shutdown(Shutdown::Both);
    }
    for stream in self.lookups.lock().drain(..) {
      let _ = stream.shutdown(Shutdown::Both);
    }
    match outcome? {
      Response::Done => Ok(()),
      other => Err(unexpected(other)),
    }
  }

  fn put(&self, scope: Scope, key: &str, value: FabricValue) -> std::result::Result<(), FabricStatus> {
    if !self.joined.load(Ordering::Acquire) {
      return Err(FabricStatus::Init);
    }
    match scope {
      Scope::Global => self.staged.lock().push((key.to_string(), value)),
    }
    Ok(())
  }

  fn commit(&self) -> std::result::Result<(), FabricStatus> {
    let entries = std::mem::take(&mut *self.staged.lock());
    match self.call(&Request::Commit { entries })? {
      Response::Done => Ok(()),
      other => Err(unexpected(other)),
    }
  }

  fn get(
    &self,
    namespace: &Namespace,
    key: &str,
    options: &FetchOptions,
  ) -> std::result::Result<ValueHandle, FabricStatus> {
    if !self.joined.load(Ordering::Acquire) {
      return Err(FabricStatus::Init);
    }

    let request = Request::Get {
      namespace: namespace.as_str().to_string(),
      key: key.to_string(),
      target: options.target,
      wait: options.wait,
      timeout_ms: options
        .timeout
        .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
    };

    match self.lookup(&request)? {
      Response::Value(value) => {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        Ok(ValueHandle::new(id, value))
      }
      other => Err(unexpected(other)),
    }
  }

  fn release(&self, handle: ValueHandle) {
    // The value was already copied off the socket; dropping it frees it.
    drop(handle);
  }
}
