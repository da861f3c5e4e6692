//! The Ready loop: the single task that drives the raft engine.
//!
//! It multiplexes the heartbeat tick, the snapshot tick, inbound requests,
//! and the stop signal, then drains the engine's `Ready` batches. It is
//! the sole writer of the in-memory log, the WAL and snapshot files, the
//! peer map, the transport peer set, and the user state machine.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use raft::eraftpb::{ConfState, Snapshot};
use raft::RawNode;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use super::apply::ApplyOps;
use super::handle::{NodeRequest, NodeStatus};
use super::Shared;
use crate::config::raft_params::TICK_INTERVAL;
use crate::config::SnapshotPolicy;
use crate::error::{NodeError, Result};
use crate::fsm::StateMachine;
use crate::storage::{DurableStore, LogStore};

pub(crate) struct ReadyLoop {
    pub(crate) raw: RawNode<LogStore>,
    pub(crate) log_store: LogStore,
    pub(crate) durable: Option<DurableStore>,
    pub(crate) fsm: Box<dyn StateMachine>,
    pub(crate) shared: Arc<Shared>,
    /// Conf state captured from the last applied conf-change; stamped into
    /// every snapshot this node creates.
    pub(crate) last_conf_state: ConfState,
    /// Index of the last entry handed to the state machine (or covered by
    /// an installed snapshot).
    pub(crate) applied: u64,
    pub(crate) snapshot_policy: SnapshotPolicy,
    pub(crate) requests: mpsc::Receiver<NodeRequest>,
    pub(crate) stop: watch::Receiver<bool>,
}

impl ReadyLoop {
    /// Drive the loop to completion and publish the exit condition.
    pub(crate) async fn run(mut self) {
        let result = self.drive().await;

        // The WAL closes last, after every durable write of this loop.
        if let Some(store) = self.durable.as_mut() {
            if let Err(e) = store.close() {
                error!(error = %e, "closing wal failed");
            }
        }

        self.shared.alive.store(false, Ordering::Release);
        match result {
            Ok(()) => info!("ready loop stopped"),
            Err(NodeError::RemovedFromCluster) => {
                info!("removed from cluster, ready loop exiting");
                self.shared.removed.store(true, Ordering::Release);
                *self.shared.exit_error.lock() = Some(NodeError::RemovedFromCluster);
            }
            Err(e) => {
                error!(error = %e, "ready loop failed");
                *self.shared.exit_error.lock() = Some(e);
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let mut tick = interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // With snapshotting disabled the ticker exists but never fires.
        let snapshot_interval = self.snapshot_policy.interval();
        let snapshots_enabled = snapshot_interval.is_some();
        let mut snapshot_tick =
            interval(snapshot_interval.unwrap_or(Duration::from_secs(24 * 60 * 60)));
        snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        snapshot_tick.reset();

        // Make sure a snapshot exists as soon as there is anything to
        // snapshot, so slow followers can always be served one.
        self.snapshot_and_compact(true)?;

        loop {
            tokio::select! {
                _ = self.stop.changed() => {
                    return Ok(());
                }
                _ = tick.tick() => {
                    self.raw.tick();
                }
                _ = snapshot_tick.tick(), if snapshots_enabled => {
                    self.snapshot_and_compact(false)?;
                }
                request = self.requests.recv() => {
                    match request {
                        Some(request) => self.handle_request(request),
                        // Every handle dropped: nothing can reach us again.
                        None => return Ok(()),
                    }
                }
            }

            self.process_ready()?;
        }
    }

    fn handle_request(&mut self, request: NodeRequest) {
        match request {
            NodeRequest::Propose { data, reply } => {
                let outcome = self.raw.propose(Vec::new(), data).map_err(NodeError::from);
                let _ = reply.send(outcome);
            }
            NodeRequest::ProposeConfChange { cc, reply } => {
                let outcome = self
                    .raw
                    .propose_conf_change(Vec::new(), cc)
                    .map_err(NodeError::from);
                let _ = reply.send(outcome);
            }
            NodeRequest::Step(message) => {
                if let Err(e) = self.raw.step(message) {
                    debug!(error = %e, "raft rejected inbound message");
                }
            }
            NodeRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn status(&self) -> NodeStatus {
        let raft = &self.raw.raft;
        NodeStatus {
            id: self.shared.id,
            leader_id: raft.leader_id,
            term: raft.term,
            applied: self.applied,
            committed: self.log_store.hard_state().get_commit(),
            first_index: self.log_store.first_index_value(),
            last_index: self.log_store.last_index_value(),
            is_leader: raft.state == raft::StateRole::Leader,
        }
    }

    /// Drain one `Ready` batch. The order is load-bearing: snapshot
    /// adoption, WAL persistence, in-memory append, outbound messages
    /// (the persisted batch only after the WAL save), and only then the
    /// committed entries.
    fn process_ready(&mut self) -> Result<()> {
        if !self.raw.has_ready() {
            return Ok(());
        }
        let mut ready = self.raw.ready();

        if !ready.messages().is_empty() {
            self.shared.transport.send(ready.take_messages());
        }

        if *ready.snapshot() != Snapshot::default() {
            let snapshot = ready.snapshot().clone();
            self.install_snapshot(snapshot)?;
        }

        // Durability before transport: the WAL holds the batch before any
        // message referencing it is handed to a peer.
        let entries = ready.take_entries();
        if let Some(store) = self.durable.as_mut() {
            store.save(ready.hs(), &entries)?;
        }
        if !entries.is_empty() {
            self.log_store.append(&entries)?;
        }
        if let Some(hard_state) = ready.hs() {
            self.log_store.set_hard_state(hard_state.clone());
        }

        if !ready.persisted_messages().is_empty() {
            self.shared.transport.send(ready.take_persisted_messages());
        }

        // Messages go out before committed entries are applied: a
        // committed removal must still reach the node it removes, so the
        // transport may only forget a peer after this batch is sent.
        let committed = ready.take_committed_entries();
        self.apply_committed(committed)?;

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.log_store.set_commit(commit);
        }
        if !light.messages().is_empty() {
            self.shared.transport.send(light.take_messages());
        }
        let committed = light.take_committed_entries();
        self.apply_committed(committed)?;
        self.raw.advance_apply();

        Ok(())
    }
}
