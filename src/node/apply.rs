//! Application of committed entries, snapshot adoption, and snapshot
//! creation.

use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, ConfChangeType, Entry, EntryType, Snapshot};
use tracing::{debug, info, warn};

use super::ready::ReadyLoop;
use crate::error::{NodeError, Result};
use crate::observer::Observation;
use crate::types::{EnvelopeMetadata, LogEntry, PeerRecord, SnapshotEnvelope};

pub(crate) trait ApplyOps {
    /// Apply committed entries in log order, fanning each one out to the
    /// observer registry.
    fn apply_committed(&mut self, entries: Vec<Entry>) -> Result<()>;

    /// Adopt a snapshot received from the leader: transport peers from the
    /// envelope, then the state machine, then durable and in-memory state.
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()>;

    /// Snapshot the state machine and compact the log. `force` skips the
    /// freshness checks (used once at startup so a snapshot always
    /// exists); with nothing new applied this is a no-op either way.
    fn snapshot_and_compact(&mut self, force: bool) -> Result<()>;
}

impl ApplyOps for ReadyLoop {
    fn apply_committed(&mut self, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            match entry.get_entry_type() {
                EntryType::EntryNormal => {
                    // Empty normal entries are raft's leader-election
                    // no-ops; nothing to hand to the state machine.
                    if !entry.get_data().is_empty() {
                        self.fsm.apply(entry.get_data()).map_err(NodeError::Fsm)?;
                    }
                }
                EntryType::EntryConfChange => {
                    let cc = ConfChange::parse_from_bytes(entry.get_data())?;
                    self.apply_conf_change(&entry, cc)?;
                }
                EntryType::EntryConfChangeV2 => {
                    // This runtime only ever proposes v1 changes.
                    warn!(index = entry.get_index(), "ignoring unexpected v2 conf change");
                }
            }

            self.applied = entry.get_index();
            self.shared
                .observers
                .observe(&Observation::Committed(LogEntry::from_raft(&entry)));
        }
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        info!(
            index = meta.get_index(),
            term = meta.get_term(),
            "installing snapshot"
        );

        if !snapshot.get_data().is_empty() {
            let envelope: SnapshotEnvelope = serde_json::from_slice(snapshot.get_data())?;

            // Transport first: the restored node must be able to talk to
            // the membership the snapshot describes.
            for (&id, record) in envelope.metadata.peers.iter() {
                if id != self.shared.id {
                    self.shared.transport.add_peer(id, record.raft_url());
                }
            }
            *self.shared.peers.write() = envelope.metadata.peers;

            self.fsm.restore(&envelope.data).map_err(NodeError::Fsm)?;
        }

        if let Some(store) = self.durable.as_mut() {
            store.persist_snapshot(&snapshot)?;
        }
        self.last_conf_state = meta.get_conf_state().clone();
        self.applied = meta.get_index();
        self.log_store
            .apply_snapshot(snapshot)
            .map_err(|e| NodeError::Storage(e.to_string()))?;
        Ok(())
    }

    fn snapshot_and_compact(&mut self, force: bool) -> Result<()> {
        let applied = self.applied;
        let last_snapshot = self.log_store.snapshot_index();
        if applied <= last_snapshot {
            return Ok(());
        }
        if !force && applied - last_snapshot < self.snapshot_policy.min_committed_logs {
            return Ok(());
        }

        let data = self.fsm.snapshot().map_err(NodeError::Fsm)?;
        let envelope = SnapshotEnvelope {
            metadata: EnvelopeMetadata {
                peers: self.shared.peers.read().clone(),
            },
            data,
        };
        let payload = serde_json::to_vec(&envelope)?;

        let snapshot = self
            .log_store
            .create_snapshot(applied, self.last_conf_state.clone(), payload)
            .map_err(|e| NodeError::Storage(e.to_string()))?;
        if let Some(store) = self.durable.as_mut() {
            store.persist_snapshot(&snapshot)?;
        }
        // Entries up to the snapshot are now redundant.
        self.log_store
            .compact(applied + 1)
            .map_err(|e| NodeError::Storage(e.to_string()))?;

        info!(index = applied, "created snapshot and compacted log");
        Ok(())
    }
}

impl ReadyLoop {
    fn apply_conf_change(&mut self, entry: &Entry, cc: ConfChange) -> Result<()> {
        // The engine learns of the change exactly here; snapshots created
        // later carry the updated conf state. Re-adding an existing member
        // (the rejoin path) or removing one twice (removal retries) leaves
        // the raft state untouched, but the peer bookkeeping below still
        // runs so refreshed addresses take effect.
        match self.raw.apply_conf_change(&cc) {
            Ok(conf_state) => self.last_conf_state = conf_state,
            Err(e) => debug!(
                node = cc.get_node_id(),
                error = %e,
                "conf change left raft state unchanged"
            ),
        }

        match cc.get_change_type() {
            ConfChangeType::AddNode => {
                if !cc.get_context().is_empty() {
                    let record: PeerRecord = serde_json::from_slice(cc.get_context())?;
                    info!(node = cc.get_node_id(), ip = %record.ip, "member added");
                    if cc.get_node_id() != self.shared.id {
                        self.shared
                            .transport
                            .add_peer(cc.get_node_id(), record.raft_url());
                    }
                    self.shared.peers.write().insert(cc.get_node_id(), record);
                }
            }
            ConfChangeType::RemoveNode => {
                if cc.get_node_id() == self.shared.id {
                    // Let a local waiter observe its own removal commit
                    // before the loop winds down.
                    self.shared
                        .observers
                        .observe(&Observation::Committed(LogEntry::from_raft(entry)));
                    return Err(NodeError::RemovedFromCluster);
                }
                info!(node = cc.get_node_id(), "member removed");
                self.shared.transport.remove_peer(cc.get_node_id());
                self.shared.peers.write().remove(cc.get_node_id());
            }
            ConfChangeType::AddLearnerNode => {
                debug!(node = cc.get_node_id(), "learner changes are not used");
            }
        }
        Ok(())
    }
}
