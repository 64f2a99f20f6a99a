use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use foehn::fabric::ServerHandle;
use foehn::{
  Fabric, FabricServer, FoehnError, LifecycleGuard, MemoryCluster, Namespace, RendezvousStore,
  StoreOptions, TcpFabric, TcpFabricOptions, GROUP_SIZE_UNKNOWN,
};

fn start_server(world_size: Option<u32>) -> (ServerHandle, Arc<MemoryCluster>) {
  let mut cluster = MemoryCluster::new(Namespace::new("tcp-job").expect("namespace"));
  if let Some(size) = world_size {
    cluster = cluster.with_world_size(size);
  }
  let cluster = Arc::new(cluster);
  let server = FabricServer::bind("127.0.0.1:0", Arc::clone(&cluster)).expect("bind");
  (server.spawn().expect("spawn"), cluster)
}

fn connect(handle: &ServerHandle, timeout: Duration) -> RendezvousStore {
  let options = TcpFabricOptions::new(handle.local_addr().to_string())
    .connect_timeout(Duration::from_secs(2));
  RendezvousStore::open(
    Arc::new(LifecycleGuard::new()),
    Arc::new(TcpFabric::new(options)),
    StoreOptions::new().timeout(timeout),
  )
  .expect("open store")
}

#[test]
fn values_roundtrip_over_tcp() {
  let (server, _cluster) = start_server(None);
  let store = connect(&server, Duration::from_secs(2));

  store.put("greeting", "hello").expect("put text");
  store
    .put("blob", &[0u8, 7, 0, 9])
    .expect("put raw");

  assert_eq!(store.get("greeting").expect("get text"), b"hello");
  assert_eq!(store.get("blob").expect("get raw"), vec![0u8, 7, 0, 9]);
  assert_eq!(store.identity().expect("identity").namespace().as_str(), "tcp-job");
}

#[test]
fn get_times_out_over_tcp() {
  let (server, _cluster) = start_server(None);
  let store = connect(&server, Duration::from_millis(300));

  let started = Instant::now();
  let err = store.get("absent").expect_err("timeout");
  assert!(err.is_timeout(), "unexpected error: {err}");
  assert!(started.elapsed() >= Duration::from_millis(250));

  // The connection stays usable after a timed out wait.
  store.put("after", "ok").expect("put after timeout");
  assert_eq!(store.get("after").expect("get"), b"ok");
}

#[test]
fn group_size_over_tcp() {
  let (server, _cluster) = start_server(Some(3));
  let store = connect(&server, Duration::from_secs(1));
  assert_eq!(store.group_size(), 3);

  let (server, _cluster) = start_server(None);
  let store = connect(&server, Duration::from_secs(1));
  assert_eq!(store.group_size(), GROUP_SIZE_UNKNOWN);
}

#[test]
fn rank_hint_is_honored() {
  let (server, cluster) = start_server(Some(8));
  let options = TcpFabricOptions::new(server.local_addr().to_string()).rank_hint(5);
  let store = RendezvousStore::open(
    Arc::new(LifecycleGuard::new()),
    Arc::new(TcpFabric::new(options)),
    StoreOptions::new(),
  )
  .expect("open");

  assert_eq!(store.rank().expect("rank"), 5);
  assert_eq!(cluster.members(), vec![5]);
}

#[test]
fn unreachable_fabric_fails_registration() {
  // Bind then drop to get a port nobody listens on.
  let addr = std::net::TcpListener::bind("127.0.0.1:0")
    .expect("bind")
    .local_addr()
    .expect("addr");
  let options =
    TcpFabricOptions::new(addr.to_string()).connect_timeout(Duration::from_millis(200));
  let lifecycle = Arc::new(LifecycleGuard::new());

  let err = RendezvousStore::open(
    lifecycle.clone(),
    Arc::new(TcpFabric::new(options)),
    StoreOptions::new(),
  )
  .expect_err("nothing listening");
  assert!(matches!(err, FoehnError::FabricUnavailable(_)));
  assert!(matches!(
    RendezvousStore::attach(lifecycle).get("k"),
    Err(FoehnError::NotInitialized)
  ));
}

#[test]
fn finalize_leaves_the_cluster() {
  let (server, cluster) = start_server(None);
  let store = connect(&server, Duration::from_secs(1));
  assert_eq!(cluster.members(), vec![0]);

  store.lifecycle().finalize();
  // The server drops the member once it has answered the finalize.
  let deadline = Instant::now() + Duration::from_secs(2);
  while !cluster.members().is_empty() && Instant::now() < deadline {
    std::thread::sleep(Duration::from_millis(10));
  }
  assert!(cluster.members().is_empty());
}

#[test]
fn raw_fabric_reports_init_before_initialize() {
  let (server, _cluster) = start_server(None);
  let fabric = TcpFabric::new(TcpFabricOptions::new(server.local_addr().to_string()));
  assert!(fabric.commit().is_err());
  assert!(fabric.finalize().is_err());
}

#[test]
fn ranks_exchange_over_tcp() {
  let world = 4u32;
  let (server, _cluster) = start_server(Some(world));
  let addr = server.local_addr().to_string();
  let barrier = Arc::new(Barrier::new(world as usize));

  let workers: Vec<_> = (0..world)
    .map(|_| {
      let addr = addr.clone();
      let barrier = Arc::clone(&barrier);
      std::thread::spawn(move || {
        let store = RendezvousStore::open(
          Arc::new(LifecycleGuard::new()),
          Arc::new(TcpFabric::new(TcpFabricOptions::new(addr))),
          StoreOptions::new().timeout(Duration::from_secs(5)),
        )
        .expect("open");
        let rank = store.rank().expect("rank");
        barrier.wait();

        store
          .put(format!("endpoint/{rank}").as_str(), format!("node-{rank}").as_str())
          .expect("publish");
        let keys: Vec<String> = (0..world).map(|peer| format!("endpoint/{peer}")).collect();
        store.wait_for_keys(keys.iter()).expect("wait all");

        keys
          .iter()
          .map(|key| String::from_utf8(store.get(key).expect("get")).expect("utf8"))
          .collect::<Vec<_>>()
      })
    })
    .collect();

  let expected: Vec<String> = (0..world).map(|peer| format!("node-{peer}")).collect();
  for worker in workers {
    assert_eq!(worker.join().expect("join"), expected);
  }
}

#[test]
fn put_from_another_thread_is_not_held_up_by_blocking_get() {
  let (server, _cluster) = start_server(None);
  let store = connect(&server, Duration::from_secs(3));

  let reader = store.clone();
  let waiter = std::thread::spawn(move || {
    let started = Instant::now();
    (reader.get("late"), started.elapsed())
  });

  std::thread::sleep(Duration::from_millis(100));
  let started = Instant::now();
  store.put("late", "v").expect("put while get is blocked");
  let put_took = started.elapsed();

  let (value, get_took) = waiter.join().expect("join");
  assert!(put_took < Duration::from_secs(1), "put took {put_took:?}");
  assert_eq!(value.expect("get sees own put"), b"v");
  assert!(get_took < Duration::from_secs(2), "get took {get_took:?}");
}

#[test]
fn finalize_is_not_held_up_by_blocking_get() {
  let (server, cluster) = start_server(None);
  let store = connect(&server, Duration::from_secs(2));

  let reader = store.clone();
  let waiter = std::thread::spawn(move || reader.get("never"));

  std::thread::sleep(Duration::from_millis(100));
  let started = Instant::now();
  store.lifecycle().finalize();
  assert!(
    started.elapsed() < Duration::from_secs(1),
    "finalize took {:?}",
    started.elapsed()
  );

  assert!(waiter.join().expect("join").is_err());
  let deadline = Instant::now() + Duration::from_secs(2);
  while !cluster.members().is_empty() && Instant::now() < deadline {
    std::thread::sleep(Duration::from_millis(10));
  }
  assert!(cluster.members().is_empty());
}

#[test]
fn concurrent_gets_use_separate_lookup_connections() {
  let (server, _cluster) = start_server(None);
  let store = connect(&server, Duration::from_secs(3));

  let waiters: Vec<_> = ["a", "b", "c"]
    .into_iter()
    .map(|key| {
      let reader = store.clone();
      std::thread::spawn(move || reader.get(key))
    })
    .collect();

  std::thread::sleep(Duration::from_millis(100));
  store
    .put_many([("a", "1"), ("b", "2"), ("c", "3")])
    .expect("put many");

  let values: Vec<Vec<u8>> = waiters
    .into_iter()
    .map(|waiter| waiter.join().expect("join").expect("get"))
    .collect();
  assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
}
