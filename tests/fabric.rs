//! End-to-end fabric scenarios: a real tracker and real peers on loopback
//! sockets, exercising dispatch, caching, confidential execution, custody,
//! ownership recovery and liveness.

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use weft::proto::{PeerAddr, Request, Response, TaskSpec};
use weft::value::Value;
use weft::{Config, Peer, PeerClient, Tracker, TrackerClient, WeftError};

async fn start_tracker(
    state_dir: &Path,
    peer_timeout: Duration,
    sweep: Duration,
) -> (std::net::SocketAddr, JoinHandle<()>) {
    let mut tracker = Tracker::bind(("127.0.0.1", 0), state_dir).await.unwrap();
    tracker.peer_timeout(peer_timeout).sweep_interval(sweep);
    let addr = tracker.local_addr();

    let handle = tokio::spawn(async move {
        let _ = tracker.up().await;
    });

    // Give the accept loop a beat.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, handle)
}

fn peer_config(dir: &TempDir, name: &str, tracker: std::net::SocketAddr) -> Config {
    let mut config = Config::default();
    config.peer.port = 0;
    config.tracker.host = "127.0.0.1".to_string();
    config.tracker.port = tracker.port();
    config.peer.storage_dir = dir.path().join(name).join("public");
    config.peer.owned_storage_dir = dir.path().join(name).join("owned");
    config.peer.state_dir = dir.path().join(name).join("state");
    config
}

fn task(task_id: &str, program: &str, function: &str, args: Vec<Value>) -> TaskSpec {
    TaskSpec {
        task_id: task_id.to_string(),
        program: program.to_string(),
        function: function.to_string(),
        args,
        confidential: false,
        priority: 0,
        max_retries: 0,
        timeout: Some(10),
        estimated_burst: None,
        source_peer: None,
    }
}

#[tokio::test]
async fn dispatch_runs_task_on_fabric_peer() {
    let dir = TempDir::new().unwrap();
    let (tracker, _guard) = start_tracker(
        &dir.path().join("tracker"),
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await;

    let alpha = Peer::start(peer_config(&dir, "alpha", tracker), "127.0.0.1")
        .await
        .unwrap();
    let beta = Peer::start(peer_config(&dir, "beta", tracker), "127.0.0.1")
        .await
        .unwrap();

    let result = alpha
        .submit_task(task(
            "E1",
            "def main(n): return n*n",
            "main",
            vec![Value::Int(7)],
        ))
        .await
        .unwrap();

    assert_eq!(result.result, Value::Int(49));
    assert_eq!(result.error, None);

    let executed_by = result.executed_by.unwrap();
    assert!(
        executed_by == alpha.addr().to_string() || executed_by == beta.addr().to_string(),
        "executed on an unexpected node: {}",
        executed_by
    );
}

#[tokio::test]
async fn resubmission_is_served_from_cache() {
    let dir = TempDir::new().unwrap();
    let (tracker, _guard) = start_tracker(
        &dir.path().join("tracker"),
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await;

    let peer = Peer::start(peer_config(&dir, "solo", tracker), "127.0.0.1")
        .await
        .unwrap();
    let client = PeerClient::new("127.0.0.1", peer.addr().port);

    let spec = task(
        "E2a",
        "def main(n): return n + 1",
        "main",
        vec![Value::Int(41)],
    );
    assert_eq!(
        client.submit_task(&spec).await.unwrap().result,
        Value::Int(42)
    );

    let mut again = spec;
    again.task_id = "E2b".to_string();
    assert_eq!(
        client.submit_task(&again).await.unwrap().result,
        Value::Int(42)
    );

    // The second run never touched the executor: cache hits moved instead.
    match client.status().await.unwrap() {
        Response::Status { data, .. } => {
            let cache = data.get("cache").unwrap().as_map().unwrap();
            assert_eq!(cache.get("hits").unwrap().as_int(), Some(1));
            let executor = data.get("executor").unwrap().as_map().unwrap();
            assert_eq!(executor.get("execution_count").unwrap().as_int(), Some(1));
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn confidential_tasks_never_leave_the_submitter() {
    let dir = TempDir::new().unwrap();
    let (tracker, _guard) = start_tracker(
        &dir.path().join("tracker"),
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await;

    let alpha = Peer::start(peer_config(&dir, "alpha", tracker), "127.0.0.1")
        .await
        .unwrap();
    let _beta = Peer::start(peer_config(&dir, "beta", tracker), "127.0.0.1")
        .await
        .unwrap();

    let mut secret = task(
        "E3",
        "def main(n): return n - 5",
        "main",
        vec![Value::Int(12)],
    );
    secret.confidential = true;

    let result = alpha.submit_task(secret).await.unwrap();
    assert_eq!(result.result, Value::Int(7));
    assert_eq!(result.executed_by.unwrap(), alpha.addr().to_string());
}

#[tokio::test]
async fn batch_tasks_return_individual_results() {
    let dir = TempDir::new().unwrap();
    let (tracker, _guard) = start_tracker(
        &dir.path().join("tracker"),
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await;

    let peer = Peer::start(peer_config(&dir, "solo", tracker), "127.0.0.1")
        .await
        .unwrap();
    let client = PeerClient::new("127.0.0.1", peer.addr().port);

    let results = client
        .batch(vec![
            task("B1", "def f(n): return n * 2", "f", vec![Value::Int(3)]),
            task("B2", "def f(): return 1 / 0", "f", vec![]),
        ])
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].result, Value::Int(6));
    assert!(results[1].error.as_ref().unwrap().contains("EXECUTION_ERROR"));
}

#[tokio::test]
async fn owned_file_custody_round_trip() {
    let dir = TempDir::new().unwrap();
    let (tracker, _guard) = start_tracker(
        &dir.path().join("tracker"),
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await;

    let owner = Peer::start(peer_config(&dir, "owner", tracker), "127.0.0.1")
        .await
        .unwrap();
    let storage = Peer::start(peer_config(&dir, "storage", tracker), "127.0.0.1")
        .await
        .unwrap();

    let (placed, errors) = owner
        .upload_owned_file("notes.txt", b"hello", &[storage.addr().clone()], 1)
        .await
        .unwrap();
    assert_eq!(placed, vec![storage.addr().clone()]);
    assert!(errors.is_empty());

    // Ciphertext landed in the owner-keyed directory, and it is not the
    // plaintext.
    let stored_path = dir
        .path()
        .join("storage")
        .join("owned")
        .join(format!("127.0.0.1_{}", owner.addr().port))
        .join("notes.txt");
    let on_disk = std::fs::read(&stored_path).unwrap();
    assert_ne!(on_disk, b"hello".to_vec());

    // The owner reads it back decrypted.
    let roundtrip = owner.download_owned_file("notes.txt").await.unwrap();
    assert_eq!(roundtrip, b"hello".to_vec());

    // The public path refuses it on the storage peer.
    let client = PeerClient::new("127.0.0.1", storage.addr().port);
    match client.get_file("notes.txt").await {
        Err(WeftError::OwnedFileForbidden) => {}
        other => panic!("expected forbidden, got {:?}", other),
    }

    // Enumeration and deletion are owner-scoped.
    let listed = owner.list_owned_files().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0, "notes.txt");

    let held_by = owner.delete_owned_file("notes.txt").await.unwrap();
    assert_eq!(held_by, vec![storage.addr().clone()]);
    assert!(owner.list_owned_files().await.unwrap().is_empty());
}

#[tokio::test]
async fn owner_address_change_recovers_ownership() {
    let dir = TempDir::new().unwrap();
    let (tracker, _guard) = start_tracker(
        &dir.path().join("tracker"),
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await;

    let client = TrackerClient::new("127.0.0.1", tracker.port());
    let old_owner = PeerAddr::new("10.0.0.1", 9001);
    let storage = PeerAddr::new("10.0.0.3", 9003);

    client
        .register(&old_owner.ip, old_owner.port, 0.0, Some("durable-x"), None)
        .await
        .unwrap();
    client
        .register(&storage.ip, storage.port, 0.0, None, None)
        .await
        .unwrap();
    client
        .register_owned_file("f.bin", &old_owner, Some("durable-x"), &storage)
        .await
        .unwrap();

    // Same durable id and port, new IP.
    let new_owner = PeerAddr::new("10.0.0.9", 9001);
    client
        .register(
            &new_owner.ip,
            new_owner.port,
            0.0,
            Some("durable-x"),
            Some(&old_owner.ip),
        )
        .await
        .unwrap();

    let location = client
        .find_owned_file("f.bin", &new_owner, Some("durable-x"))
        .await
        .unwrap();

    assert_eq!(location.owner, new_owner);
    assert_eq!(location.storage, vec![storage]);
}

#[tokio::test]
async fn ownership_survives_tracker_restart() {
    let dir = TempDir::new().unwrap();
    let state_dir = dir.path().join("tracker");

    let owner = PeerAddr::new("10.0.0.1", 9001);
    let storage = PeerAddr::new("10.0.0.3", 9003);

    let first_state;
    {
        let (tracker, guard) = start_tracker(
            &state_dir,
            Duration::from_secs(30),
            Duration::from_secs(10),
        )
        .await;
        let client = TrackerClient::new("127.0.0.1", tracker.port());

        client
            .register(&owner.ip, owner.port, 0.0, Some("durable-x"), None)
            .await
            .unwrap();
        client
            .register(&storage.ip, storage.port, 0.0, None, None)
            .await
            .unwrap();
        client
            .register_owned_file("f.bin", &owner, Some("durable-x"), &storage)
            .await
            .unwrap();

        first_state = std::fs::read_to_string(state_dir.join("owned_files.json")).unwrap();
        assert!(first_state.contains("f.bin"));

        guard.abort();
    }

    // A fresh tracker over the same state dir reloads the entry untouched.
    let (tracker, _guard) = start_tracker(
        &state_dir,
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await;
    let client = TrackerClient::new("127.0.0.1", tracker.port());

    assert_eq!(
        std::fs::read_to_string(state_dir.join("owned_files.json")).unwrap(),
        first_state
    );

    // Storage must heartbeat again before the entry is servable.
    client
        .register(&storage.ip, storage.port, 0.0, None, None)
        .await
        .unwrap();

    let location = client
        .find_owned_file("f.bin", &owner, Some("durable-x"))
        .await
        .unwrap();
    assert_eq!(location.storage, vec![storage]);
}

#[tokio::test]
async fn dead_peers_are_evicted_from_dispatch_and_index() {
    let dir = TempDir::new().unwrap();
    let (tracker, _guard) = start_tracker(
        &dir.path().join("tracker"),
        Duration::from_millis(300),
        Duration::from_millis(100),
    )
    .await;
    let client = TrackerClient::new("127.0.0.1", tracker.port());

    client
        .register("10.0.0.1", 9001, 0.2, None, None)
        .await
        .unwrap();
    client
        .register_file("shared.txt", "10.0.0.1", 9001)
        .await
        .unwrap();

    let (best, _) = client.request_cpu().await.unwrap();
    assert_eq!(best, PeerAddr::new("10.0.0.1", 9001));
    assert_eq!(
        client.find_file("shared.txt").await.unwrap(),
        vec![PeerAddr::new("10.0.0.1", 9001)]
    );

    // No heartbeats: past the timeout the peer is gone from dispatch and
    // from every replica entry.
    tokio::time::sleep(Duration::from_millis(700)).await;

    match client.request_cpu().await {
        Err(WeftError::NoPeersAvailable) => {}
        other => panic!("expected no peers, got {:?}", other),
    }
    assert!(client.find_file("shared.txt").await.unwrap().is_empty());
}

#[tokio::test]
async fn public_files_travel_via_tracker_discovery() {
    let dir = TempDir::new().unwrap();
    let (tracker, _guard) = start_tracker(
        &dir.path().join("tracker"),
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await;

    let alpha = Peer::start(peer_config(&dir, "alpha", tracker), "127.0.0.1")
        .await
        .unwrap();
    let beta = Peer::start(peer_config(&dir, "beta", tracker), "127.0.0.1")
        .await
        .unwrap();

    let client = PeerClient::new("127.0.0.1", alpha.addr().port);
    client.put_file("report.txt", b"q3 numbers").await.unwrap();

    // Beta discovers and fetches it through the tracker.
    let fetched = beta.download_file_from_network("report.txt").await.unwrap();
    assert_eq!(fetched, b"q3 numbers".to_vec());
}

#[tokio::test]
async fn wire_rejects_malformed_type() {
    use weft::codec::MessageStream;

    let dir = TempDir::new().unwrap();
    let (tracker, _guard) = start_tracker(
        &dir.path().join("tracker"),
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await;

    let stream = tokio::net::TcpStream::connect(tracker).await.unwrap();
    let mut stream = MessageStream::new(stream);

    // A frame with an unknown type tag gets an ERROR reply, not a hangup.
    let body: serde_json::Value = serde_json::json!({"type": "NO_SUCH_OP"});
    stream.send(&body).await.unwrap();

    let reply: Response = stream.recv().await.unwrap().unwrap();
    match reply {
        Response::Error { error } => assert!(error.contains("UNKNOWN_MESSAGE_TYPE")),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn remote_memory_round_trip_between_peers() {
    let dir = TempDir::new().unwrap();
    let (tracker, _guard) = start_tracker(
        &dir.path().join("tracker"),
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await;

    let alpha = Peer::start(peer_config(&dir, "alpha", tracker), "127.0.0.1")
        .await
        .unwrap();
    let beta = Peer::start(peer_config(&dir, "beta", tracker), "127.0.0.1")
        .await
        .unwrap();

    alpha
        .set_remote_memory(beta.addr(), "shared", Value::from("payload"))
        .await
        .unwrap();

    assert_eq!(
        alpha
            .get_remote_memory(beta.addr(), "shared")
            .await
            .unwrap(),
        Some(Value::from("payload"))
    );
    // And it genuinely lives on beta.
    let client = PeerClient::new("127.0.0.1", beta.addr().port);
    assert_eq!(client.get_mem("shared").await.unwrap(), Some(Value::from("payload")));
}

#[tokio::test]
async fn wire_request_dispatch_order_is_unaffected_by_cancel_of_missing_task() {
    let dir = TempDir::new().unwrap();
    let (tracker, _guard) = start_tracker(
        &dir.path().join("tracker"),
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await;

    let peer = Peer::start(peer_config(&dir, "solo", tracker), "127.0.0.1")
        .await
        .unwrap();
    let client = PeerClient::new("127.0.0.1", peer.addr().port);

    match client.cancel_task("ghost").await {
        Err(WeftError::NotFound(_)) => {}
        other => panic!("expected not-found, got {:?}", other),
    }

    // The peer keeps serving afterwards.
    let result = client
        .submit_task(&task("after", "def f(): return 5", "f", vec![]))
        .await
        .unwrap();
    assert_eq!(result.result, Value::Int(5));
}

#[tokio::test]
async fn scheduler_swap_over_the_wire() {
    let dir = TempDir::new().unwrap();
    let (tracker, _guard) = start_tracker(
        &dir.path().join("tracker"),
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await;

    let peer = Peer::start(peer_config(&dir, "solo", tracker), "127.0.0.1")
        .await
        .unwrap();
    let client = PeerClient::new("127.0.0.1", peer.addr().port);

    client.set_scheduler("PRIORITY").await.unwrap();

    let result = client
        .submit_task(&task("T", "def f(n): return n", "f", vec![Value::Int(11)]))
        .await
        .unwrap();
    assert_eq!(result.result, Value::Int(11));

    match client.status().await.unwrap() {
        Response::Status { data, .. } => {
            let scheduler = data.get("scheduler").unwrap().as_map().unwrap();
            assert_eq!(
                scheduler.get("type").unwrap().as_str(),
                Some("advanced")
            );
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn tracker_plane_request_on_peer_is_unknown() {
    let dir = TempDir::new().unwrap();
    let (tracker, _guard) = start_tracker(
        &dir.path().join("tracker"),
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
    .await;

    let peer = Peer::start(peer_config(&dir, "solo", tracker), "127.0.0.1")
        .await
        .unwrap();
    let client = PeerClient::new("127.0.0.1", peer.addr().port);

    match client.request(&Request::RequestCpu).await {
        Err(WeftError::UnknownMessageType(_)) => {}
        other => panic!("expected unknown-message-type, got {:?}", other),
    }
}
