use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use foehn::fabric::FabricOp;
use foehn::{
  FabricStatus, FoehnError, LifecycleGuard, LifecycleState, MemoryCluster, MemoryFabric, Namespace,
  RendezvousStore, StoreOptions, GROUP_SIZE_UNKNOWN,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn cluster(world_size: Option<u32>) -> Arc<MemoryCluster> {
  let cluster = MemoryCluster::new(Namespace::new("store-job").expect("namespace"));
  Arc::new(match world_size {
    Some(size) => cluster.with_world_size(size),
    None => cluster,
  })
}

fn open_store(
  cluster: &Arc<MemoryCluster>,
  timeout: Duration,
) -> (Arc<MemoryFabric>, RendezvousStore) {
  let fabric = Arc::new(cluster.join());
  let store = RendezvousStore::open(
    Arc::new(LifecycleGuard::new()),
    fabric.clone(),
    StoreOptions::new().timeout(timeout),
  )
  .expect("open store");
  (fabric, store)
}

#[test]
fn second_registration_fails_without_disturbing_the_first() {
  let cluster = cluster(Some(2));
  let lifecycle = Arc::new(LifecycleGuard::new());
  let fabric = Arc::new(cluster.join());

  let store = RendezvousStore::open(lifecycle.clone(), fabric.clone(), StoreOptions::new())
    .expect("first open");
  let err = RendezvousStore::open(lifecycle.clone(), fabric.clone(), StoreOptions::new())
    .expect_err("second open");
  assert!(matches!(err, FoehnError::AlreadyRegistered));

  assert_eq!(lifecycle.state(), LifecycleState::Ready);
  assert_eq!(store.rank().expect("rank"), 0);
  store.put("still", "works").expect("put after rejected register");
  assert_eq!(fabric.calls().initialize, 1);
}

#[test]
fn put_then_get_roundtrips_text_and_raw_bytes() {
  let cluster = cluster(None);
  let (_fabric, store) = open_store(&cluster, Duration::from_secs(2));

  store.put("text", "hello wörld").expect("put text");
  assert_eq!(store.get("text").expect("get text"), "hello wörld".as_bytes());

  let raw = vec![0u8, 1, 0, 0, 255, 0];
  store.put("raw", &raw).expect("put raw");
  assert_eq!(store.get("raw").expect("get raw"), raw);

  store.put(b"raw-key".as_slice(), "v").expect("put bytes key");
  assert_eq!(store.get("raw-key").expect("get by text key"), b"v");
}

#[test]
fn random_binary_payloads_survive_exactly() {
  let cluster = cluster(None);
  let (fabric, store) = open_store(&cluster, Duration::from_secs(2));
  let mut rng = StdRng::seed_from_u64(0x0f0e_d0d0);

  for i in 0..200 {
    let len = rng.gen_range(1..512);
    let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    let key = format!("blob/{i}");
    store.put(key.as_str(), &payload).expect("put");
    assert_eq!(store.get(key.as_str()).expect("get"), payload);
  }
  assert_eq!(fabric.outstanding_handles(), 0);
}

#[test]
fn every_put_is_committed_immediately() {
  let cluster = cluster(None);
  let (fabric, store) = open_store(&cluster, Duration::from_secs(1));

  store.put("a", "1").expect("put a");
  store.put("b", "2").expect("put b");

  let calls = fabric.calls();
  assert_eq!(calls.put, 2);
  assert_eq!(calls.commit, 2);
  assert_eq!(fabric.staged_len(), 0);
}

#[test]
fn get_of_unpublished_key_times_out_after_the_bound() {
  let cluster = cluster(None);
  let (fabric, store) = open_store(&cluster, Duration::from_secs(1));

  let started = Instant::now();
  let err = store.get("never-published").expect_err("timeout");
  let elapsed = started.elapsed();

  assert!(
    matches!(&err, FoehnError::Timeout { key } if key == "never-published"),
    "unexpected error: {err}"
  );
  assert!(elapsed >= Duration::from_millis(900), "returned too early: {elapsed:?}");
  assert!(elapsed < Duration::from_secs(5), "waited too long: {elapsed:?}");
  assert_eq!(fabric.outstanding_handles(), 0);
}

#[test]
fn wait_for_keys_short_circuits_on_first_missing_key() {
  let cluster = cluster(None);
  let (fabric, store) = open_store(&cluster, Duration::from_millis(200));

  store.put("k1", "one").expect("put k1");
  store.put("k3", "three").expect("put k3");
  let gets_before = fabric.calls().get;

  let err = store
    .wait_for_keys(["k1", "k2", "k3"])
    .expect_err("k2 missing");
  assert_eq!(err.key(), Some("k2"));
  assert!(err.is_timeout());

  // k1 and k2 were fetched; k3 never was.
  assert_eq!(fabric.calls().get - gets_before, 2);
  assert_eq!(fabric.outstanding_handles(), 0);
}

#[test]
fn wait_for_keys_succeeds_once_all_exist() {
  let cluster = cluster(None);
  let (_fabric, store) = open_store(&cluster, Duration::from_secs(1));

  store
    .put_many([("w/0", "a"), ("w/1", "b"), ("w/2", "c")])
    .expect("put many");
  store
    .wait_for_keys(vec!["w/0".to_string(), "w/1".to_string(), "w/2".to_string()].iter())
    .expect("all present");
}

#[test]
fn per_call_wait_timeout_overrides_the_handle() {
  let cluster = cluster(None);
  let (_fabric, store) = open_store(&cluster, Duration::from_secs(30));

  let started = Instant::now();
  let err = store
    .wait_for_keys_within(["missing"], Duration::from_millis(100))
    .expect_err("timeout");
  assert!(err.is_timeout());
  assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn put_many_commits_once_after_all_publishes() {
  let cluster = cluster(None);
  let (fabric, store) = open_store(&cluster, Duration::from_secs(1));

  store
    .put_many([("m/a", "1"), ("m/b", "2"), ("m/c", "3")])
    .expect("put many");
  let calls = fabric.calls();
  assert_eq!(calls.put, 3);
  assert_eq!(calls.commit, 1);

  let err = store
    .put_many([("ok", "1"), ("", "2")])
    .expect_err("empty key");
  assert!(matches!(err, FoehnError::Encoding(_)));
  assert_eq!(fabric.calls().put, 3, "nothing published when validation fails");
}

#[test]
fn group_size_reports_size_or_sentinel() {
  let sized = cluster(Some(4));
  let (_fabric, store) = open_store(&sized, Duration::from_secs(1));
  assert_eq!(store.group_size(), 4);

  let unsized_cluster = cluster(None);
  let (_fabric, store) = open_store(&unsized_cluster, Duration::from_secs(1));
  assert_eq!(store.group_size(), GROUP_SIZE_UNKNOWN);
}

#[test]
fn operations_before_registration_never_reach_the_fabric() {
  let cluster = cluster(Some(2));
  let fabric = cluster.join();
  let lifecycle = Arc::new(LifecycleGuard::new());
  let store = RendezvousStore::attach(lifecycle);

  assert!(matches!(
    store.put("k", "v"),
    Err(FoehnError::NotInitialized)
  ));
  assert!(matches!(store.get("k"), Err(FoehnError::NotInitialized)));
  assert!(matches!(
    store.wait_for_keys(["k"]),
    Err(FoehnError::NotInitialized)
  ));
  assert!(matches!(store.rank(), Err(FoehnError::NotInitialized)));
  assert_eq!(store.group_size(), GROUP_SIZE_UNKNOWN);

  assert_eq!(fabric.calls().requests(), 0);
}

#[test]
fn operations_after_failed_registration_fail_fast() {
  let cluster = cluster(None);
  let fabric = Arc::new(cluster.join());
  fabric.fail_next(FabricOp::Initialize, FabricStatus::Unreachable);
  let lifecycle = Arc::new(LifecycleGuard::new());

  let err = RendezvousStore::open(lifecycle.clone(), fabric.clone(), StoreOptions::new())
    .expect_err("unreachable");
  assert!(matches!(err, FoehnError::FabricUnavailable(_)));

  let store = RendezvousStore::attach(lifecycle.clone());
  assert!(matches!(store.get("k"), Err(FoehnError::NotInitialized)));
  assert_eq!(fabric.calls().requests(), 1);
}

#[test]
fn invalid_keys_and_values_are_rejected_locally() {
  let cluster = cluster(None);
  let (fabric, store) = open_store(&cluster, Duration::from_secs(1));

  assert!(matches!(store.put("", "v"), Err(FoehnError::Encoding(_))));
  assert!(matches!(store.put("k", ""), Err(FoehnError::Encoding(_))));
  assert!(matches!(
    store.put("k", b"".as_slice()),
    Err(FoehnError::Encoding(_))
  ));
  assert!(matches!(store.get(""), Err(FoehnError::Encoding(_))));
  assert_eq!(fabric.calls().put, 0);
  assert_eq!(fabric.calls().get, 0);
}

#[test]
fn publish_and_commit_failures_propagate() {
  let cluster = cluster(None);
  let (fabric, store) = open_store(&cluster, Duration::from_secs(1));

  fabric.fail_next(FabricOp::Put, FabricStatus::OutOfResource);
  let err = store.put("k", "v").expect_err("publish");
  assert!(matches!(err, FoehnError::PublishFailed { .. }));
  assert_eq!(fabric.calls().commit, 0, "no commit after failed publish");

  fabric.fail_next(FabricOp::Commit, FabricStatus::Error);
  let err = store.put("k", "v").expect_err("commit");
  assert!(matches!(err, FoehnError::CommitFailed { .. }));
  assert!(err.to_string().contains("'k'"), "{err}");
}

#[test]
fn finalize_twice_reaches_fabric_once() {
  let cluster = cluster(None);
  let (fabric, store) = open_store(&cluster, Duration::from_secs(1));

  store.lifecycle().finalize();
  store.lifecycle().finalize();
  assert_eq!(fabric.calls().finalize, 1);
  assert!(matches!(store.get("k"), Err(FoehnError::NotInitialized)));

  drop(store);
  assert_eq!(fabric.calls().finalize, 1);
}

#[test]
fn attached_handle_shares_registration() {
  let cluster = cluster(None);
  let (_fabric, store) = open_store(&cluster, Duration::from_millis(300));
  let attached = RendezvousStore::attach(store.lifecycle().clone());

  assert_eq!(attached.timeout().expect("timeout"), Duration::from_millis(300));
  store.put("shared", "yes").expect("put");
  assert_eq!(attached.get("shared").expect("get"), b"yes");
  assert_eq!(attached.rank().expect("rank"), store.rank().expect("rank"));
}

#[test]
fn ranks_exchange_addresses_through_one_cluster() {
  let world = 4u32;
  let cluster = cluster(Some(world));
  let barrier = Arc::new(Barrier::new(world as usize));

  let handles: Vec<_> = (0..world)
    .map(|_| {
      let cluster = Arc::clone(&cluster);
      let barrier = Arc::clone(&barrier);
      std::thread::spawn(move || {
        let (_fabric, store) = open_store(&cluster, Duration::from_secs(5));
        let rank = store.rank().expect("rank");
        assert_eq!(store.group_size(), world);
        barrier.wait();

        store
          .put(format!("addr/{rank}").as_str(), format!("10.0.0.{rank}:29500").as_str())
          .expect("publish address");

        let keys: Vec<String> = (0..world).map(|peer| format!("addr/{peer}")).collect();
        store.wait_for_keys(keys.iter()).expect("all addresses");

        let mut peers = Vec::new();
        for key in &keys {
          peers.push(String::from_utf8(store.get(key).expect("get")).expect("utf8"));
        }
        (rank, peers)
      })
    })
    .collect();

  let mut ranks = Vec::new();
  for handle in handles {
    let (rank, peers) = handle.join().expect("join");
    let expected: Vec<String> = (0..world).map(|peer| format!("10.0.0.{peer}:29500")).collect();
    assert_eq!(peers, expected);
    ranks.push(rank);
  }
  ranks.sort_unstable();
  assert_eq!(ranks, vec![0, 1, 2, 3]);
}

#[test]
fn unrepresentable_timeout_still_roundtrips() {
  let cluster = cluster(None);
  let fabric = Arc::new(cluster.join());
  let store = RendezvousStore::open(
    Arc::new(LifecycleGuard::new()),
    fabric,
    StoreOptions::new().timeout_secs(u64::MAX),
  )
  .expect("open store");

  store.put("k", "v").expect("put");
  assert_eq!(store.get("k").expect("get"), b"v");
  store
    .wait_for_keys_within(["k"], Duration::MAX)
    .expect("wait");
}
