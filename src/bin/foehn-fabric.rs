//! Reference fabric server.
//!
//! Serves one namespace over TCP. Configure with `FOEHN_LISTEN`,
//! `FOEHN_NAMESPACE` and `FOEHN_WORLD_SIZE`; log verbosity follows `RUST_LOG`.
//! On startup a single JSON line describing the endpoint is printed to stdout
//! so launchers can pick up the bound address.

use std::process::ExitCode;
use std::sync::Arc;

use foehn::{FabricServer, MemoryCluster, Namespace, ServerOptions};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  match run() {
    Ok(()) => ExitCode::SUCCESS,
    Err(error) => {
      tracing::error!(%error, "fabric server stopped");
      ExitCode::FAILURE
    }
  }
}

fn run() -> foehn::Result<()> {
  let options = ServerOptions::from_env()?;
  let namespace = Namespace::new(options.namespace.clone())?;

  let mut cluster = MemoryCluster::new(namespace);
  if let Some(world_size) = options.world_size {
    cluster = cluster.with_world_size(world_size);
  }

  let server = FabricServer::bind(options.listen.as_str(), Arc::new(cluster))?;
  let local_addr = server.local_addr()?;
  println!(
    "{}",
    json!({
      "address": local_addr.to_string(),
      "namespace": options.namespace,
      "world_size": options.world_size,
    })
  );

  server.serve()
}
