//! The replicated-node orchestrator.
//!
//! [`Node`] binds the raft engine to the durable store, the peer
//! transport, the membership discovery service, and the user state
//! machine. Startup sequences recovery (or bootstrap), spawns the Ready
//! loop and both listeners, then runs the discovery handshake; shutdown
//! unwinds the same pieces in reverse.

mod apply;
mod handle;
mod membership;
mod ready;

pub use handle::NodeStatus;
pub(crate) use handle::NodeHandle;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use raft::eraftpb::ConfChange;
use raft::RawNode;
use slog::o;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{raft_params, NodeConfig};
use crate::discovery::{self, DiscoveryClient, ExponentialBackoff};
use crate::error::{NodeError, Result};
use crate::fsm::StateMachine;
use crate::observer::{Observer, ObserverRegistry};
use crate::storage::{self, DurableStore, LogStore, StartMode};
use crate::transport::{self, Transport};
use crate::types::{JoinRequest, PeerMap, PeerRecord, SnapshotEnvelope};

/// Lifecycle of a node. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum NodeState {
    Unstarted = 0,
    /// Background loops are alive and raft is ticking.
    Initialized = 1,
    /// Cluster membership has been established.
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

pub(crate) struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn new() -> Lifecycle {
        Lifecycle(AtomicU8::new(NodeState::Unstarted as u8))
    }

    pub fn get(&self) -> NodeState {
        match self.0.load(Ordering::Acquire) {
            0 => NodeState::Unstarted,
            1 => NodeState::Initialized,
            2 => NodeState::Running,
            3 => NodeState::Stopping,
            _ => NodeState::Stopped,
        }
    }

    /// Move forward to `state`; backward transitions are ignored.
    pub fn advance(&self, state: NodeState) {
        self.0.fetch_max(state as u8, Ordering::AcqRel);
    }
}

/// State shared between the Ready loop, the listeners, and the public
/// surface. The Ready loop is the sole writer of `peers`; everything else
/// reads snapshots.
pub(crate) struct Shared {
    pub id: u64,
    pub cluster_id: u64,
    pub self_record: PeerRecord,
    pub lifecycle: Lifecycle,
    pub peers: RwLock<PeerMap>,
    pub observers: ObserverRegistry,
    pub transport: Arc<Transport>,
    /// Ready loop liveness; cleared when it exits for any reason.
    pub alive: AtomicBool,
    /// Set when this node saw its own id in a committed `RemoveNode`.
    pub removed: AtomicBool,
    pub exit_error: Mutex<Option<NodeError>>,
}

/// A replicated node.
pub struct Node {
    shared: Arc<Shared>,
    handle: NodeHandle,
    config: NodeConfig,
    stop_tx: watch::Sender<bool>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    api_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    raft_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Node {
    /// Start a node: recover or bootstrap raft state, spawn the Ready
    /// loop and both listeners, then run the join/rejoin handshake.
    ///
    /// On a handshake failure the spawned pieces are stopped before the
    /// error is returned.
    pub async fn start(mut config: NodeConfig, fsm: impl StateMachine) -> Result<Node> {
        config.normalize();
        config.validate().map_err(NodeError::Config)?;

        let mut fsm: Box<dyn StateMachine> = Box::new(fsm);

        let self_record = PeerRecord {
            ip: config.advertise_host.clone(),
            raft_port: config.raft_port,
            api_port: config.api_port,
        };
        let transport = Arc::new(Transport::new(
            config.id,
            config.cluster_id,
            self_record.raft_url(),
        ));

        let log_store = LogStore::new();
        let mut durable = None;
        let mut initial_peers = PeerMap::new();
        let mut applied = 0u64;
        let mut mode = StartMode::Fresh;

        if let Some(root) = &config.data_dir {
            mode = storage::detect_mode(root)?;
            let (store, recovered) = DurableStore::open(root)?;
            durable = Some(store);

            if mode == StartMode::Rejoin {
                if let Some(snapshot) = recovered.snapshot {
                    applied = snapshot.get_metadata().get_index();
                    if !snapshot.get_data().is_empty() {
                        let envelope: SnapshotEnvelope =
                            serde_json::from_slice(snapshot.get_data())?;
                        for (&id, record) in envelope.metadata.peers.iter() {
                            if id != config.id {
                                transport.add_peer(id, record.raft_url());
                            }
                        }
                        initial_peers = envelope.metadata.peers.clone();
                        fsm.restore(&envelope.data).map_err(NodeError::Fsm)?;
                    }
                    log_store
                        .apply_snapshot(snapshot)
                        .map_err(|e| NodeError::Storage(e.to_string()))?;
                }
                if let Some(mut hard_state) = recovered.hard_state {
                    // Commit advances are not always WAL-persisted; the
                    // snapshot proves everything up to its index committed.
                    if hard_state.get_commit() < applied {
                        hard_state.set_commit(applied);
                    }
                    log_store.set_hard_state(hard_state);
                }
                log_store
                    .append(&recovered.entries)
                    .map_err(|e| NodeError::Storage(e.to_string()))?;
                info!(
                    id = config.id,
                    snapshot_index = applied,
                    wal_entries = recovered.entries.len(),
                    "rejoining with recovered state"
                );
            }
        }

        if mode == StartMode::Fresh {
            if config.bootstrap_node {
                log_store.initialize_with_conf_state(vec![config.id]);
                applied = 1;
            } else if config.bootstrap_peers.is_empty() {
                return Err(NodeError::Config(
                    "a non-bootstrap fresh node needs bootstrap_peers to join a cluster"
                        .to_string(),
                ));
            }
        }

        let raft_config = raft::Config {
            id: config.id,
            election_tick: raft_params::ELECTION_TICK,
            heartbeat_tick: raft_params::HEARTBEAT_TICK,
            max_size_per_msg: raft_params::MAX_SIZE_PER_MSG,
            max_inflight_msgs: raft_params::MAX_INFLIGHT_MSGS,
            check_quorum: true,
            applied,
            ..Default::default()
        };
        raft_config.validate()?;

        // The engine logs through slog; this runtime uses tracing, so the
        // engine gets a discard sink.
        let logger = slog::Logger::root(slog::Discard, o!());
        let mut raw = RawNode::new(&raft_config, log_store.clone(), &logger)?;

        // Leave the node one tick short of an election so a cold cluster
        // elects quickly instead of idling a full timeout.
        for _ in 0..raft_params::ELECTION_TICK - 1 {
            raw.tick();
        }

        initial_peers.insert(config.id, self_record.clone());

        let shared = Arc::new(Shared {
            id: config.id,
            cluster_id: config.cluster_id,
            self_record: self_record.clone(),
            lifecycle: Lifecycle::new(),
            peers: RwLock::new(initial_peers),
            observers: ObserverRegistry::new(),
            transport: transport.clone(),
            alive: AtomicBool::new(true),
            removed: AtomicBool::new(false),
            exit_error: Mutex::new(None),
        });

        let (request_tx, request_rx) = mpsc::channel(1024);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = NodeHandle::new(shared.clone(), request_tx);

        let initial_conf_state = log_store.conf_state();
        let ready_loop = ready::ReadyLoop {
            raw,
            log_store,
            durable,
            fsm,
            shared: shared.clone(),
            last_conf_state: initial_conf_state,
            applied,
            snapshot_policy: config.snapshot.clone(),
            requests: request_rx,
            stop: stop_rx,
        };

        // Bind both listeners before the loop task exists so a port clash
        // leaves nothing running behind the returned error.
        let raft_shutdown =
            transport::start_server(config.raft_port, transport.clone(), handle.clone()).await?;
        let api_shutdown = match discovery::start_server(config.api_port, handle.clone()).await {
            Ok(shutdown) => shutdown,
            Err(e) => {
                let _ = raft_shutdown.send(());
                return Err(e);
            }
        };

        shared.lifecycle.advance(NodeState::Initialized);
        let loop_task = tokio::spawn(ready_loop.run());

        let node = Node {
            shared,
            handle,
            config,
            stop_tx,
            loop_task: Mutex::new(Some(loop_task)),
            api_shutdown: Mutex::new(Some(api_shutdown)),
            raft_shutdown: Mutex::new(Some(raft_shutdown)),
        };

        if let Err(e) = node.run_handshake(mode).await {
            warn!(error = %e, "discovery handshake failed, stopping node");
            let _ = node.stop().await;
            return Err(e);
        }

        node.shared.lifecycle.advance(NodeState::Running);
        info!(
            id = node.shared.id,
            raft_port = node.config.raft_port,
            api_port = node.config.api_port,
            "node running"
        );
        Ok(node)
    }

    async fn run_handshake(&self, mode: StartMode) -> Result<()> {
        let request = JoinRequest {
            id: self.shared.id,
            ip: self.config.advertise_host.clone(),
            raft_port: self.config.raft_port,
            api_port: self.config.api_port,
        };
        let client = DiscoveryClient::new(self.config.init_backoff.clone());

        match mode {
            StartMode::Rejoin => {
                // Known members (from the recovered peer map) come first;
                // configured bootstrap peers are the fallback.
                let mut targets: Vec<String> = self
                    .shared
                    .peers
                    .read()
                    .iter()
                    .filter(|(&id, _)| id != self.shared.id)
                    .map(|(_, record)| format!("{}:{}", record.ip, record.api_port))
                    .collect();
                targets.extend(self.config.bootstrap_peers.iter().cloned());

                if targets.is_empty() {
                    // A single-member cluster has nobody to notify.
                    info!("rejoining without peers to notify");
                    return Ok(());
                }

                let members = client.rejoin(&targets, &request).await?;
                for (&id, record) in members.peers.iter() {
                    if id != self.shared.id {
                        self.shared.transport.add_peer(id, record.raft_url());
                    }
                }
                Ok(())
            }
            StartMode::Fresh if !self.config.bootstrap_node => {
                client.join(&self.config.bootstrap_peers, &request).await
            }
            // A bootstrap node has nobody to ask, but its own record must
            // still enter the log as a context-carrying membership entry so
            // later joiners learn its address; propose it locally, retrying
            // until the first election has produced a leader.
            StartMode::Fresh => self.add_self_locally().await,
        }
    }

    async fn add_self_locally(&self) -> Result<()> {
        let mut backoff = ExponentialBackoff::new(&self.config.init_backoff);
        loop {
            match self
                .handle
                .propose_member_add(self.shared.id, &self.shared.self_record)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => match backoff.next_interval() {
                    Some(wait) => {
                        warn!(error = %e, retry_in = ?wait, "couldn't record own membership, trying again");
                        tokio::time::sleep(wait).await;
                    }
                    None => {
                        return Err(NodeError::Membership(format!(
                            "bootstrap self-addition failed within the backoff budget: {}",
                            e
                        )));
                    }
                },
            }
        }
    }

    /// This node's id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.shared.lifecycle.get()
    }

    /// Whether the node is `Running` with a live Ready loop.
    pub fn is_running(&self) -> bool {
        self.shared.lifecycle.get() == NodeState::Running
            && self.shared.alive.load(Ordering::Acquire)
    }

    /// Whether this node has been removed from the cluster.
    pub fn was_removed(&self) -> bool {
        self.shared.removed.load(Ordering::Acquire)
    }

    /// Message of the error that terminated the Ready loop, if any.
    pub fn exit_error(&self) -> Option<String> {
        self.shared.exit_error.lock().as_ref().map(|e| e.to_string())
    }

    /// Submit an opaque entry for replication. Returns once enqueued with
    /// the raft engine; register an observer first for commit
    /// confirmation.
    pub async fn propose(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.handle.propose(data.into()).await
    }

    /// Propose a raw conf-change. Most callers want the membership HTTP
    /// API instead.
    pub async fn propose_conf_change(&self, cc: ConfChange) -> Result<()> {
        self.handle.propose_conf_change(cc).await
    }

    /// Deliver an inbound raft message (the transport's upcall).
    pub async fn process(&self, message: raft::eraftpb::Message) -> Result<()> {
        self.handle.step(message).await
    }

    /// Register an observer for subsequently applied entries.
    pub fn register_observer(&self, observer: Observer) -> u64 {
        self.shared.observers.register(observer)
    }

    pub fn unregister_observer(&self, observer_id: u64) {
        self.shared.observers.unregister(observer_id);
    }

    /// Snapshot of the committed peer map.
    pub fn members(&self) -> PeerMap {
        self.shared.peers.read().clone()
    }

    /// Point-in-time raft status.
    pub async fn status(&self) -> Result<NodeStatus> {
        self.handle.status().await
    }

    /// Stop the node: signal the Ready loop, shut both listeners down,
    /// and wait for the loop to exit. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if self.shared.lifecycle.get() >= NodeState::Stopping {
            self.join_loop().await;
            return Ok(());
        }
        self.shared.lifecycle.advance(NodeState::Stopping);
        info!(id = self.shared.id, "stopping node");

        let _ = self.stop_tx.send(true);
        if let Some(tx) = self.raft_shutdown.lock().take() {
            let _ = tx.send(());
        }
        if let Some(tx) = self.api_shutdown.lock().take() {
            let _ = tx.send(());
        }
        self.join_loop().await;

        self.shared.lifecycle.advance(NodeState::Stopped);
        Ok(())
    }

    /// Leave the cluster for good, then stop and delete all durable
    /// state. The removal proposal is retried under the configured
    /// backoff budget; a node that never became a member skips it and
    /// only wipes local state.
    pub async fn destroy(&self) -> Result<()> {
        if self.is_running() && !self.was_removed() {
            let mut backoff = ExponentialBackoff::new(&self.config.init_backoff);
            loop {
                match self.handle.propose_member_remove_once(self.shared.id).await {
                    Ok(()) => break,
                    // The loop already exited with the removal sentinel.
                    Err(NodeError::Stopped) if self.was_removed() => break,
                    Err(e) => match backoff.next_interval() {
                        Some(wait) => {
                            warn!(error = %e, retry_in = ?wait, "couldn't remove self from cluster, trying again");
                            tokio::time::sleep(wait).await;
                        }
                        None => {
                            return Err(NodeError::Membership(format!(
                                "self-removal failed within the backoff budget: {}",
                                e
                            )));
                        }
                    },
                }
            }
        }

        self.stop().await?;

        if let Some(root) = &self.config.data_dir {
            storage::destroy(root)?;
        }
        Ok(())
    }

    async fn join_loop(&self) {
        let task = self.loop_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Best-effort teardown when the caller never stopped explicitly.
        let _ = self.stop_tx.send(true);
        if let Some(tx) = self.raft_shutdown.lock().take() {
            let _ = tx.send(());
        }
        if let Some(tx) = self.api_shutdown.lock().take() {
            let _ = tx.send(());
        }
    }
}

