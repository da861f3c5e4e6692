//! Multi-node cluster tests: join, replication, snapshot catch-up,
//! restart with a changed address, and self-destruction.

mod common;

use std::time::Duration;

use common::*;
use skiff::Node;
use tempfile::TempDir;

#[tokio::test]
async fn bootstrap_and_join_replicate_entries() {
    let (raft1, api1) = next_ports();
    let ports2 = next_ports();

    let fsm1 = TestFsm::default();
    let node1 = Node::start(
        bootstrap_builder(1, (raft1, api1)).build().expect("config"),
        fsm1.clone(),
    )
    .await
    .expect("start node1");
    assert!(wait_for_leader(&node1, Duration::from_secs(10)).await);

    let fsm2 = TestFsm::default();
    let node2 = Node::start(
        join_builder(2, ports2, api1).build().expect("config"),
        fsm2.clone(),
    )
    .await
    .expect("start node2");

    // Membership converges on both replicas.
    assert!(
        wait_until(Duration::from_secs(10), || {
            node1.members().len() == 2 && node2.members().len() == 2
        })
        .await,
        "peer maps should converge: {:?} / {:?}",
        node1.members(),
        node2.members()
    );

    // The HTTP surface agrees, with decimal-string ids.
    let body: serde_json::Value =
        reqwest::get(format!("http://127.0.0.1:{}/cluster/members", ports2.1))
            .await
            .expect("get members")
            .json()
            .await
            .expect("parse members");
    assert!(body["peers"]["1"].is_object(), "body: {}", body);
    assert!(body["peers"]["2"].is_object(), "body: {}", body);

    // A proposal on the leader applies exactly once on every replica.
    node1.propose(b"hello".to_vec()).await.expect("propose");
    assert!(
        wait_until(Duration::from_secs(10), || {
            fsm1.entries() == ["hello"] && fsm2.entries() == ["hello"]
        })
        .await,
        "replicated apply: {:?} / {:?}",
        fsm1.entries(),
        fsm2.entries()
    );

    node2.stop().await.expect("stop node2");
    node1.stop().await.expect("stop node1");
}

#[tokio::test]
async fn late_joiner_catches_up_via_snapshot() {
    let dir1 = TempDir::new().expect("temp dir");
    let (raft1, api1) = next_ports();
    let ports3 = next_ports();

    let fsm1 = TestFsm::default();
    let node1 = Node::start(
        bootstrap_builder(1, (raft1, api1))
            .data_dir(dir1.path())
            .snapshot_interval(Duration::from_millis(300))
            .build()
            .expect("config"),
        fsm1.clone(),
    )
    .await
    .expect("start node1");
    assert!(wait_for_leader(&node1, Duration::from_secs(10)).await);

    let expected: Vec<String> = (0..120).map(|i| format!("entry-{}", i)).collect();
    for payload in &expected {
        node1
            .propose(payload.as_bytes().to_vec())
            .await
            .expect("propose");
    }
    assert!(
        wait_until(Duration::from_secs(15), || fsm1.entries().len() == expected.len()).await,
        "leader should apply everything, got {}",
        fsm1.entries().len()
    );
    assert!(
        wait_for_compaction(&node1, Duration::from_secs(5)).await,
        "leader log should be compacted"
    );

    // The late joiner can only catch up through a snapshot install.
    let fsm3 = TestFsm::default();
    let node3 = Node::start(
        join_builder(3, ports3, api1).build().expect("config"),
        fsm3.clone(),
    )
    .await
    .expect("start node3");

    assert!(
        wait_until(Duration::from_secs(20), || fsm3.entries() == fsm1.entries()).await,
        "joiner should converge, has {} entries",
        fsm3.entries().len()
    );
    assert!(
        fsm3.restores() >= 1,
        "catch-up should have gone through a snapshot install"
    );

    node3.stop().await.expect("stop node3");
    node1.stop().await.expect("stop node1");
}

#[tokio::test]
async fn restarted_member_rejoins_with_new_address() {
    let (raft1, api1) = next_ports();
    let dir2 = TempDir::new().expect("temp dir");

    let fsm1 = TestFsm::default();
    let node1 = Node::start(
        bootstrap_builder(1, (raft1, api1)).build().expect("config"),
        fsm1.clone(),
    )
    .await
    .expect("start node1");
    assert!(wait_for_leader(&node1, Duration::from_secs(10)).await);

    let fsm2 = TestFsm::default();
    let node2 = Node::start(
        join_builder(2, next_ports(), api1)
            .data_dir(dir2.path())
            .snapshot_interval(Duration::from_secs(60))
            .build()
            .expect("config"),
        fsm2.clone(),
    )
    .await
    .expect("start node2");

    node1.propose(b"one".to_vec()).await.expect("propose");
    assert!(
        wait_until(Duration::from_secs(10), || {
            fsm1.entries() == ["one"] && fsm2.entries() == ["one"]
        })
        .await
    );

    node2.stop().await.expect("stop node2");

    // Restart from the same data dir on fresh ports: rejoin mode plus an
    // address refresh through the rejoin endpoint. (In a two-member
    // cluster nothing commits while the peer is down, so new entries wait
    // for the rejoin.)
    let fsm2b = TestFsm::default();
    let node2b = Node::start(
        join_builder(2, next_ports(), api1)
            .data_dir(dir2.path())
            .snapshot_interval(Duration::from_secs(60))
            .build()
            .expect("config"),
        fsm2b.clone(),
    )
    .await
    .expect("restart node2");

    assert!(
        wait_until(Duration::from_secs(15), || fsm2b.entries() == ["one"]).await,
        "rejoined member should recover its state exactly once, got {:?}",
        fsm2b.entries()
    );

    // Proposals submitted through the rejoined member replicate
    // everywhere, continuing after the recovered prefix.
    assert!(wait_for_known_leader(&node2b, Duration::from_secs(10)).await);
    node2b.propose(b"two".to_vec()).await.expect("propose");
    assert!(
        wait_until(Duration::from_secs(15), || {
            fsm1.entries() == ["one", "two"] && fsm2b.entries() == ["one", "two"]
        })
        .await,
        "{:?} / {:?}",
        fsm1.entries(),
        fsm2b.entries()
    );

    node2b.stop().await.expect("stop node2b");
    node1.stop().await.expect("stop node1");
}

#[tokio::test]
async fn destroy_removes_member_and_local_state() {
    let dir1 = TempDir::new().expect("temp dir");
    let dir2 = TempDir::new().expect("temp dir");
    let (raft1, api1) = next_ports();
    let ports2 = next_ports();

    let fsm1 = TestFsm::default();
    let node1 = Node::start(
        bootstrap_builder(1, (raft1, api1))
            .data_dir(dir1.path())
            .snapshot_interval(Duration::from_secs(60))
            .build()
            .expect("config"),
        fsm1.clone(),
    )
    .await
    .expect("start node1");
    assert!(wait_for_leader(&node1, Duration::from_secs(10)).await);

    let node2 = Node::start(
        join_builder(2, ports2, api1)
            .data_dir(dir2.path())
            .snapshot_interval(Duration::from_secs(60))
            .build()
            .expect("config"),
        TestFsm::default(),
    )
    .await
    .expect("start node2");

    assert!(
        wait_until(Duration::from_secs(10), || {
            node1.members().len() == 2 && node2.members().len() == 2
        })
        .await
    );

    node2.destroy().await.expect("destroy node2");

    assert!(
        node2.was_removed(),
        "the ready loop should have exited with the removal sentinel"
    );
    assert!(
        !dir2.path().join("wal").exists() && !dir2.path().join("snap").exists(),
        "durable state should be wiped"
    );
    assert!(
        wait_until(Duration::from_secs(10), || node1.members().len() == 1).await,
        "survivor should drop the destroyed member: {:?}",
        node1.members()
    );
    assert!(!node1.members().contains(2));

    node1.stop().await.expect("stop node1");
}
