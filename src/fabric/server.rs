//! Reference fabric server.
//!
//! Hosts one [`MemoryCluster`] and serves it over TCP, one thread per
//! connection. A connection that sends `Init` is one member of the job: it
//! joins then and leaves on `Finalize` or when the socket closes. Any
//! connection may issue gets.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::memory::{MemoryCluster, MemoryFabric};
use super::wire::{read_request, write_response, Request, Response};
use super::{Fabric, FabricStatus, FabricValue, FetchOptions, Scope};
use crate::error::{FoehnError, Result};
use crate::identity::Namespace;

/// How often a blocked get checks whether its peer is still connected.
const HANGUP_CHECK_INTERVAL: Duration = Duration::from_millis(200);

pub struct FabricServer {
  listener: TcpListener,
  cluster: Arc<MemoryCluster>,
}

impl FabricServer {
  pub fn bind(addr: impl ToSocketAddrs, cluster: Arc<MemoryCluster>) -> Result<Self> {
    let listener = TcpListener::bind(addr)?;
    Ok(Self { listener, cluster })
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  pub fn cluster(&self) -> &Arc<MemoryCluster> {
    &self.cluster
  }

  /// Serve on the calling thread until the listener fails.
  pub fn serve(self) -> Result<()> {
    let stop = AtomicBool::new(false);
    accept_loop(&self.listener, &self.cluster, &stop);
    Ok(())
  }

  /// Serve on a background thread.
  pub fn spawn(self) -> Result<ServerHandle> {
    let local_addr = self.local_addr()?;
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let thread = std::thread::Builder::new()
      .name("foehn-fabric-accept".to_string())
      .spawn(move || accept_loop(&self.listener, &self.cluster, &thread_stop))?;

    Ok(ServerHandle {
      local_addr,
      stop,
      thread: Some(thread),
    })
  }
}

/// Running server started by [`FabricServer::spawn`]. Stops on drop.
pub struct ServerHandle {
  local_addr: SocketAddr,
  stop: Arc<AtomicBool>,
  thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Stop accepting connections. Connections already open keep running
  /// until their peers hang up.
  pub fn shutdown(mut self) {
    self.stop_accepting();
  }

  fn stop_accepting(&mut self) {
    let Some(thread) = self.thread.take() else {
      return;
    };
    self.stop.store(true, Ordering::SeqCst);
    // Wake the blocking accept.
    let _ = TcpStream::connect_timeout(&self.local_addr, Duration::from_secs(1));
    if thread.join().is_err() {
      tracing::warn!("fabric accept thread panicked");
    }
  }
}

impl Drop for ServerHandle {
  fn drop(&mut self) {
    self.stop_accepting();
  }
}

fn accept_loop(listener: &TcpListener, cluster: &Arc<MemoryCluster>, stop: &AtomicBool) {
  tracing::info!(
    namespace = %cluster.namespace(),
    world_size = ?cluster.world_size(),
    "fabric server accepting connections"
  );

  for stream in listener.incoming() {
    if stop.load(Ordering::SeqCst) {
      break;
    }
    match stream {
      Ok(stream) => {
        let cluster = Arc::clone(cluster);
        let spawned = std::thread::Builder::new()
          .name("foehn-fabric-conn".to_string())
          .spawn(move || serve_connection(cluster, stream));
        if let Err(error) = spawned {
          tracing::warn!(%error, "failed to spawn connection thread");
        }
      }
      Err(error) => tracing::warn!(%error, "accept failed"),
    }
  }
}

fn serve_connection(cluster: Arc<MemoryCluster>, mut stream: TcpStream) {
  let peer = stream.peer_addr().ok();
  let _ = stream.set_nodelay(true);
  let mut member: Option<MemoryFabric> = None;

  loop {
    let request = match read_request(&mut stream) {
      Ok(request) => request,
      Err(FoehnError::Io(error)) if error.kind() == ErrorKind::UnexpectedEof => break,
      Err(error) => {
        tracing::warn!(?peer, %error, "dropping connection after bad request");
        break;
      }
    };

    let finalizing = matches!(request, Request::Finalize);
    let response = handle_request(&cluster, &stream, &mut member, request);
    if let Err(error) = write_response(&mut stream, &response) {
      tracing::warn!(?peer, %error, "failed to answer request");
      break;
    }
    if finalizing {
      break;
    }
  }

  if let Some(member) = member.take() {
    tracing::debug!(?peer, rank = ?member.rank(), "member disconnected without finalize");
    let _ = member.finalize();
  }
}

/// Gets are answered straight from the cluster, so connections that never
/// sent `Init` may issue them; [`super::TcpFabric`] uses such connections
/// for its lookups.
fn handle_request(
  cluster: &Arc<MemoryCluster>,
  stream: &TcpStream,
  member: &mut Option<MemoryFabric>,
  request: Request,
) -> Response {
  match request {
    Request::Init { rank_hint } => {
      if member.is_some() {
        return Response::Status(FabricStatus::Init);
      }
      let fabric = match rank_hint {
        Some(rank) => cluster.join_as(rank),
        None => cluster.join(),
      };
      match fabric.initialize() {
        Ok(identity) => {
          tracing::debug!(%identity, "member joined");
          *member = Some(fabric);
          Response::Identity {
            namespace: identity.namespace().as_str().to_string(),
            rank: identity.rank(),
          }
        }
        Err(status) => Response::Status(status),
      }
    }
    Request::Commit { entries } => {
      let Some(fabric) = member.as_ref() else {
        return Response::Status(FabricStatus::Init);
      };
      for (key, value) in entries {
        if let Err(status) = fabric.put(Scope::Global, &key, value) {
          return Response::Status(status);
        }
      }
      match fabric.commit() {
        Ok(()) => Response::Done,
        Err(status) => Response::Status(status),
      }
    }
    Request::Get {
      namespace,
      key,
      wait,
      timeout_ms,
      ..
    } => {
      match Namespace::new(namespace) {
        Ok(namespace) if &namespace == cluster.namespace() => {}
        _ => return Response::Status(FabricStatus::BadParam),
      }
      let timeout = timeout_ms.map(Duration::from_millis);
      match wait_for_record(cluster, stream, &key, wait, timeout) {
        Ok(value) => Response::Value(value),
        Err(status) => Response::Status(status),
      }
    }
    Request::Finalize => match member.take() {
      Some(fabric) => match fabric.finalize() {
        Ok(()) => Response::Done,
        Err(status) => Response::Status(status),
      },
      None => Response::Status(FabricStatus::Init),
    },
  }
}

/// Block on the cluster in slices, checking between slices whether the peer
/// hung up so an abandoned wait does not pin its connection thread.
fn wait_for_record(
  cluster: &MemoryCluster,
  stream: &TcpStream,
  key: &str,
  wait: bool,
  timeout: Option<Duration>,
) -> std::result::Result<Option<FabricValue>, FabricStatus> {
  if !wait {
    return cluster.lookup(key, &FetchOptions::new());
  }

  let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
  loop {
    let slice = match deadline {
      Some(deadline) => deadline
        .saturating_duration_since(Instant::now())
        .min(HANGUP_CHECK_INTERVAL),
      None => HANGUP_CHECK_INTERVAL,
    };
    match cluster.lookup(key, &FetchOptions::blocking(slice)) {
      Err(FabricStatus::Timeout) => {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
          return Err(FabricStatus::Timeout);
        }
        if peer_hung_up(stream) {
          tracing::debug!(key, "peer hung up while waiting");
          return Err(FabricStatus::Unreachable);
        }
      }
      other => return other,
    }
  }
}

fn peer_hung_up(stream: &TcpStream) -> bool {
  if stream.set_nonblocking(true).is_err() {
    return true;
  }
  let mut buf = [0u8; 1];
  let closed = match stream.peek(&mut buf) {
    Ok(0) => true,
    Ok(_) => false,
    Err(error) => error.kind() != ErrorKind::WouldBlock,
  };
  stream.set_nonblocking(false).is_err() || closed
}
