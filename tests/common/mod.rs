//! Common test utilities for skiff integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skiff::{BackoffConfig, FsmError, Node, NodeConfig, NodeConfigBuilder, StateMachine};

/// Atomic counter for allocating unique port pairs.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(21000);

/// Allocate a unique `(raft_port, api_port)` pair.
pub fn next_ports() -> (u16, u16) {
    let base = PORT_COUNTER.fetch_add(2, Ordering::SeqCst);
    (base, base + 1)
}

#[derive(Debug, Default)]
struct FsmInner {
    entries: Vec<String>,
    restores: usize,
}

/// A deterministic state machine recording every applied payload.
///
/// Clones share state, so a test can keep one handle for inspection while
/// the node owns the other.
#[derive(Clone, Default)]
pub struct TestFsm {
    inner: Arc<Mutex<FsmInner>>,
}

impl TestFsm {
    pub fn entries(&self) -> Vec<String> {
        self.inner.lock().expect("fsm lock").entries.clone()
    }

    /// How many times `restore` ran, i.e. how many snapshots were
    /// installed.
    pub fn restores(&self) -> usize {
        self.inner.lock().expect("fsm lock").restores
    }
}

impl StateMachine for TestFsm {
    fn apply(&mut self, entry: &[u8]) -> Result<(), FsmError> {
        let mut inner = self.inner.lock().expect("fsm lock");
        inner
            .entries
            .push(String::from_utf8_lossy(entry).into_owned());
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, FsmError> {
        let inner = self.inner.lock().expect("fsm lock");
        Ok(serde_json::to_vec(&inner.entries)?)
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), FsmError> {
        let entries: Vec<String> = serde_json::from_slice(snapshot)?;
        let mut inner = self.inner.lock().expect("fsm lock");
        inner.entries = entries;
        inner.restores += 1;
        Ok(())
    }
}

/// Backoff tight enough for tests; joins normally succeed on the first
/// attempt.
pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_interval_ms: 100,
        multiplier: 1.5,
        randomization_factor: 0.2,
        max_interval_ms: 500,
        max_elapsed_ms: 10_000,
    }
}

/// Config builder for a cluster-seeding node.
pub fn bootstrap_builder(id: u64, ports: (u16, u16)) -> NodeConfigBuilder {
    NodeConfig::builder()
        .id(id)
        .raft_port(ports.0)
        .api_port(ports.1)
        .bootstrap_node(true)
        .backoff(fast_backoff())
}

/// Config builder for a node joining through `peer_api_port`.
pub fn join_builder(id: u64, ports: (u16, u16), peer_api_port: u16) -> NodeConfigBuilder {
    NodeConfig::builder()
        .id(id)
        .raft_port(ports.0)
        .api_port(ports.1)
        .bootstrap_peer(format!("127.0.0.1:{}", peer_api_port))
        .backoff(fast_backoff())
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait until the node reports itself leader.
pub async fn wait_for_leader(node: &Node, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(status) = node.status().await {
            if status.is_leader {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait until the node knows some leader (itself or a peer).
pub async fn wait_for_known_leader(node: &Node, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(status) = node.status().await {
            if status.leader_id != 0 {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait until the node's log has been compacted behind a snapshot.
pub async fn wait_for_compaction(node: &Node, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(status) = node.status().await {
            if status.first_index > 1 {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
