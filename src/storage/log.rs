//! In-memory raft log.
//!
//! Backs the raft engine's [`Storage`] trait with a compactable entry
//! segment plus the hard state and latest snapshot metadata. Invariants:
//!
//! - `snapshot.index <= first_index - 1 <= last_index`
//! - entries are contiguous; `compact` may advance `first_index` up to
//!   `snapshot.index + 1`
//!
//! The Ready loop is the only writer; the raft engine reads through the
//! shared handle.

use std::cmp;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot, SnapshotMetadata};
use raft::util::limit_size;
use raft::{Error as RaftError, GetEntriesContext, RaftState, Storage, StorageError};

/// Shared handle to the in-memory log. Cheap to clone; the raft engine
/// holds one and the Ready loop another.
#[derive(Clone, Default)]
pub struct LogStore {
    core: Arc<RwLock<LogStoreCore>>,
}

/// The log state proper.
pub struct LogStoreCore {
    raft_state: RaftState,
    /// Contiguous entries `[first_index, last_index]`.
    entries: Vec<Entry>,
    /// Metadata of the most recent snapshot.
    snapshot_metadata: SnapshotMetadata,
    /// Payload of the most recent snapshot, served to slow followers.
    snapshot_data: Vec<u8>,
}

impl Default for LogStoreCore {
    fn default() -> LogStoreCore {
        LogStoreCore {
            raft_state: RaftState::new(HardState::default(), ConfState::default()),
            entries: Vec::new(),
            snapshot_metadata: SnapshotMetadata::default(),
            snapshot_data: Vec::new(),
        }
    }
}

impl LogStoreCore {
    fn first_index(&self) -> u64 {
        match self.entries.first() {
            Some(e) => e.get_index(),
            None => self.snapshot_metadata.get_index() + 1,
        }
    }

    fn last_index(&self) -> u64 {
        match self.entries.last() {
            Some(e) => e.get_index(),
            None => self.snapshot_metadata.get_index(),
        }
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        if idx == self.snapshot_metadata.get_index() {
            return Ok(self.snapshot_metadata.get_term());
        }
        if idx < self.first_index() {
            return Err(RaftError::Store(StorageError::Compacted));
        }
        if idx > self.last_index() {
            return Err(RaftError::Store(StorageError::Unavailable));
        }
        let offset = self.entries[0].get_index();
        Ok(self.entries[(idx - offset) as usize].get_term())
    }

    fn append(&mut self, ents: &[Entry]) -> raft::Result<()> {
        if ents.is_empty() {
            return Ok(());
        }
        if self.first_index() > ents[0].get_index() {
            return Err(RaftError::Store(StorageError::Other(
                format!(
                    "overwriting compacted entries: first {}, append {}",
                    self.first_index(),
                    ents[0].get_index()
                )
                .into(),
            )));
        }
        if self.last_index() + 1 < ents[0].get_index() {
            return Err(RaftError::Store(StorageError::Other(
                format!(
                    "log gap: last {}, append {}",
                    self.last_index(),
                    ents[0].get_index()
                )
                .into(),
            )));
        }
        // Conflicting suffix is replaced by the new entries.
        if let Some(first_existing) = self.entries.first().map(|e| e.get_index()) {
            let keep = (ents[0].get_index() - first_existing) as usize;
            self.entries.truncate(keep);
        }
        self.entries.extend_from_slice(ents);
        Ok(())
    }

    fn apply_snapshot(&mut self, mut snapshot: Snapshot) -> raft::Result<()> {
        let meta = snapshot.get_metadata().clone();
        if meta.get_index() <= self.snapshot_metadata.get_index() {
            return Err(RaftError::Store(StorageError::SnapshotOutOfDate));
        }

        self.raft_state.hard_state.set_commit(meta.get_index());
        let term = cmp::max(self.raft_state.hard_state.get_term(), meta.get_term());
        self.raft_state.hard_state.set_term(term);
        self.raft_state.conf_state = meta.get_conf_state().clone();

        self.snapshot_data = snapshot.take_data().to_vec();
        self.snapshot_metadata = meta;
        self.entries.clear();
        Ok(())
    }

    fn create_snapshot(
        &mut self,
        index: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> raft::Result<Snapshot> {
        if index <= self.snapshot_metadata.get_index() {
            return Err(RaftError::Store(StorageError::SnapshotOutOfDate));
        }
        if index > self.last_index() {
            return Err(RaftError::Store(StorageError::Unavailable));
        }
        let term = self.term(index)?;

        let mut snapshot = Snapshot::default();
        {
            let meta = snapshot.mut_metadata();
            meta.set_index(index);
            meta.set_term(term);
            meta.set_conf_state(conf_state);
        }
        snapshot.set_data(data.into());

        self.snapshot_metadata = snapshot.get_metadata().clone();
        self.snapshot_data = snapshot.get_data().to_vec();
        Ok(snapshot)
    }

    fn compact(&mut self, compact_index: u64) -> raft::Result<()> {
        if compact_index <= self.first_index() {
            return Ok(());
        }
        if compact_index > self.last_index() + 1 {
            return Err(RaftError::Store(StorageError::Other(
                format!(
                    "compact {} beyond last index {}",
                    compact_index,
                    self.last_index()
                )
                .into(),
            )));
        }
        if let Some(first) = self.entries.first().map(|e| e.get_index()) {
            let offset = (compact_index - first) as usize;
            self.entries.drain(..offset);
        }
        Ok(())
    }

    fn build_snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.set_metadata(self.snapshot_metadata.clone());
        snapshot.set_data(self.snapshot_data.clone().into());
        snapshot
    }
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rl(&self) -> RwLockReadGuard<'_, LogStoreCore> {
        self.core.read()
    }

    fn wl(&self) -> RwLockWriteGuard<'_, LogStoreCore> {
        self.core.write()
    }

    /// Seed the log with an initial voter set, faking a committed snapshot
    /// at index 1 so the membership is in effect from the start. Only valid
    /// on a pristine store.
    pub fn initialize_with_conf_state(&self, voters: Vec<u64>) {
        let mut core = self.wl();
        assert!(
            core.entries.is_empty() && core.snapshot_metadata.get_index() == 0,
            "initial conf state on a non-pristine log"
        );
        core.snapshot_metadata.set_index(1);
        core.snapshot_metadata.set_term(1);
        core.raft_state.hard_state.set_commit(1);
        core.raft_state.hard_state.set_term(1);
        let mut cs = ConfState::default();
        cs.set_voters(voters);
        core.raft_state.conf_state = cs;
    }

    pub fn append(&self, entries: &[Entry]) -> raft::Result<()> {
        self.wl().append(entries)
    }

    pub fn apply_snapshot(&self, snapshot: Snapshot) -> raft::Result<()> {
        self.wl().apply_snapshot(snapshot)
    }

    pub fn create_snapshot(
        &self,
        index: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> raft::Result<Snapshot> {
        self.wl().create_snapshot(index, conf_state, data)
    }

    pub fn compact(&self, compact_index: u64) -> raft::Result<()> {
        self.wl().compact(compact_index)
    }

    pub fn set_hard_state(&self, hard_state: HardState) {
        self.wl().raft_state.hard_state = hard_state;
    }

    pub fn set_commit(&self, commit: u64) {
        self.wl().raft_state.hard_state.set_commit(commit);
    }

    pub fn hard_state(&self) -> HardState {
        self.rl().raft_state.hard_state.clone()
    }

    pub fn conf_state(&self) -> ConfState {
        self.rl().raft_state.conf_state.clone()
    }

    /// Index of the current snapshot (0 when none exists yet).
    pub fn snapshot_index(&self) -> u64 {
        self.rl().snapshot_metadata.get_index()
    }

    pub fn first_index_value(&self) -> u64 {
        self.rl().first_index()
    }

    pub fn last_index_value(&self) -> u64 {
        self.rl().last_index()
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        Ok(self.rl().raft_state.clone())
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        if low == high {
            return Ok(Vec::new());
        }
        let core = self.rl();
        if low < core.first_index() {
            return Err(RaftError::Store(StorageError::Compacted));
        }
        if high > core.last_index() + 1 {
            return Err(RaftError::Store(StorageError::Unavailable));
        }
        let offset = core.entries[0].get_index();
        let lo = (low - offset) as usize;
        let hi = (high - offset) as usize;
        let mut entries = core.entries[lo..hi].to_vec();
        limit_size(&mut entries, max_size.into());
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.rl().term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.rl().first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.rl().last_index())
    }

    fn snapshot(&self, _request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let core = self.rl();
        if core.snapshot_metadata.get_index() == 0 {
            // No snapshot has been created yet; the caller retries later.
            return Err(RaftError::Store(StorageError::SnapshotTemporarilyUnavailable));
        }
        // The served snapshot may trail the requested index; the follower
        // installs it and catches up from entries afterwards.
        Ok(core.build_snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.set_index(index);
        e.set_term(term);
        e
    }

    fn store_with(entries: &[Entry]) -> LogStore {
        let store = LogStore::new();
        store.append(entries).expect("seed entries");
        store
    }

    #[test]
    fn empty_store_bounds() {
        let store = LogStore::new();
        assert_eq!(store.first_index_value(), 1);
        assert_eq!(store.last_index_value(), 0);
        assert_eq!(store.term(0).expect("term of index 0"), 0);
    }

    #[test]
    fn append_and_read_back() {
        let store = store_with(&[entry(1, 1), entry(2, 1), entry(3, 2)]);
        assert_eq!(store.first_index_value(), 1);
        assert_eq!(store.last_index_value(), 3);
        assert_eq!(store.term(3).expect("term"), 2);

        let got = store
            .entries(1, 4, None, GetEntriesContext::empty(false))
            .expect("entries");
        assert_eq!(got.len(), 3);
        assert_eq!(got[2].get_index(), 3);
    }

    #[test]
    fn append_truncates_conflicting_suffix() {
        let store = store_with(&[entry(1, 1), entry(2, 1), entry(3, 1)]);
        store.append(&[entry(2, 2), entry(3, 2)]).expect("rewrite");

        assert_eq!(store.last_index_value(), 3);
        assert_eq!(store.term(2).expect("term"), 2);
        assert_eq!(store.term(3).expect("term"), 2);
    }

    #[test]
    fn append_gap_rejected() {
        let store = store_with(&[entry(1, 1)]);
        assert!(store.append(&[entry(5, 1)]).is_err());
    }

    #[test]
    fn entries_honor_max_size() {
        let mut big = entry(1, 1);
        big.set_data(vec![0u8; 64].into());
        let mut big2 = entry(2, 1);
        big2.set_data(vec![0u8; 64].into());
        let store = store_with(&[big, big2]);

        // max_size of one byte still yields at least one entry.
        let got = store
            .entries(1, 3, 1, GetEntriesContext::empty(false))
            .expect("entries");
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn create_snapshot_then_compact() {
        let store = store_with(&[entry(1, 1), entry(2, 1), entry(3, 2), entry(4, 2)]);
        let mut cs = ConfState::default();
        cs.set_voters(vec![1]);

        let snap = store
            .create_snapshot(3, cs, b"state".to_vec())
            .expect("snapshot");
        assert_eq!(snap.get_metadata().get_index(), 3);
        assert_eq!(snap.get_metadata().get_term(), 2);

        store.compact(4).expect("compact");
        assert_eq!(store.first_index_value(), 4);
        assert!(matches!(
            store.entries(2, 4, None, GetEntriesContext::empty(false)),
            Err(RaftError::Store(StorageError::Compacted))
        ));
        // The snapshot still answers for the compacted prefix.
        assert_eq!(store.term(3).expect("snapshot term"), 2);
    }

    #[test]
    fn stale_snapshot_rejected() {
        let store = store_with(&[entry(1, 1), entry(2, 1)]);
        let cs = ConfState::default();
        store
            .create_snapshot(2, cs.clone(), Vec::new())
            .expect("snapshot");
        assert!(matches!(
            store.create_snapshot(1, cs, Vec::new()),
            Err(RaftError::Store(StorageError::SnapshotOutOfDate))
        ));
    }

    #[test]
    fn apply_snapshot_resets_log() {
        let store = store_with(&[entry(1, 1), entry(2, 1)]);

        let mut snapshot = Snapshot::default();
        {
            let meta = snapshot.mut_metadata();
            meta.set_index(10);
            meta.set_term(3);
            let mut cs = ConfState::default();
            cs.set_voters(vec![1, 2]);
            meta.set_conf_state(cs);
        }
        snapshot.set_data(b"payload".to_vec().into());

        store.apply_snapshot(snapshot).expect("apply");
        assert_eq!(store.first_index_value(), 11);
        assert_eq!(store.last_index_value(), 10);
        assert_eq!(store.snapshot_index(), 10);
        assert_eq!(store.hard_state().get_commit(), 10);
        assert_eq!(store.conf_state().get_voters(), &[1, 2]);

        let served = store.snapshot(0, 0).expect("serve snapshot");
        assert_eq!(served.get_data(), b"payload");
    }

    #[test]
    fn snapshot_unavailable_before_first_snapshot() {
        let store = store_with(&[entry(1, 1)]);
        assert!(matches!(
            store.snapshot(1, 0),
            Err(RaftError::Store(StorageError::SnapshotTemporarilyUnavailable))
        ));
    }

    #[test]
    fn initial_conf_state_is_committed() {
        let store = LogStore::new();
        store.initialize_with_conf_state(vec![7]);
        assert_eq!(store.conf_state().get_voters(), &[7]);
        assert_eq!(store.hard_state().get_commit(), 1);
        assert_eq!(store.first_index_value(), 2);
    }
}
