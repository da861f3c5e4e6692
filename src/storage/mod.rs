//! Durable state: write-ahead log + snapshot directory.
//!
//! Both live under the caller's data root (`<root>/wal`, `<root>/snap`) and
//! are managed in lockstep: a root where only one of the two directories
//! exists was half-destroyed or hand-edited, and refusing to guess is the
//! only safe startup behaviour.

mod log;
mod snap;
mod wal;

pub use log::LogStore;
pub use snap::SnapStore;
pub use wal::{Wal, WalRecovery};

use std::fs;
use std::path::{Path, PathBuf};

use raft::eraftpb::{Entry, HardState, Snapshot};
use tracing::info;

use crate::error::{NodeError, Result};

const WAL_DIR: &str = "wal";
const SNAP_DIR: &str = "snap";

/// How the node should come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// No prior WAL segments: construct a brand new raft instance.
    Fresh,
    /// WAL segments found: rebuild state and rejoin the cluster.
    Rejoin,
}

/// Durable state recovered at startup.
pub struct Recovered {
    pub snapshot: Option<Snapshot>,
    pub hard_state: Option<HardState>,
    /// Entries strictly after the snapshot, in index order.
    pub entries: Vec<Entry>,
}

/// The WAL/snapshot pair for one node.
pub struct DurableStore {
    wal: Wal,
    snap: SnapStore,
}

pub fn wal_dir(root: &Path) -> PathBuf {
    root.join(WAL_DIR)
}

pub fn snap_dir(root: &Path) -> PathBuf {
    root.join(SNAP_DIR)
}

/// Decide fresh vs rejoin for `root`, enforcing the lockstep invariant.
pub fn detect_mode(root: &Path) -> Result<StartMode> {
    let wal = wal_dir(root);
    let snap = snap_dir(root);
    if wal.exists() != snap.exists() {
        return Err(NodeError::Config(format!(
            "inconsistent data dir {}: wal and snap directories must both exist or both be absent",
            root.display()
        )));
    }
    if Wal::exists(&wal) {
        Ok(StartMode::Rejoin)
    } else {
        Ok(StartMode::Fresh)
    }
}

impl DurableStore {
    /// Open (creating if needed) the store under `root` and recover
    /// whatever it holds: the newest snapshot, the last hard state, and
    /// every entry the WAL has beyond the snapshot.
    pub fn open(root: &Path) -> Result<(DurableStore, Recovered)> {
        let snap = SnapStore::open(&snap_dir(root))?;
        let snapshot = snap.load()?;
        let since = snapshot
            .as_ref()
            .map(|s| s.get_metadata().get_index())
            .unwrap_or(0);

        let (wal, recovery) = Wal::open(&wal_dir(root), since)?;

        if since > 0 || !recovery.entries.is_empty() {
            info!(
                snapshot_index = since,
                wal_entries = recovery.entries.len(),
                "recovered durable state"
            );
        }

        Ok((
            DurableStore { wal, snap },
            Recovered {
                snapshot,
                hard_state: recovery.hard_state,
                entries: recovery.entries,
            },
        ))
    }

    /// Durably append a `(hard_state, entries)` pair.
    pub fn save(&mut self, hard_state: Option<&HardState>, entries: &[Entry]) -> Result<()> {
        self.wal.save(hard_state, entries)
    }

    /// Persist a snapshot file and record it in the WAL, releasing WAL
    /// segments the snapshot supersedes.
    pub fn persist_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.snap.save(snapshot)?;
        let meta = snapshot.get_metadata();
        self.wal.mark_snapshot(meta.get_index(), meta.get_term())
    }

    /// Flush the WAL. Called as the last step of the Ready loop's exit.
    pub fn close(&mut self) -> Result<()> {
        self.wal.close()
    }
}

/// Recursively delete both durable directories under `root`.
///
/// Only called after the node has left the cluster and its loop has
/// exited; the data is unrecoverable afterwards.
pub fn destroy(root: &Path) -> Result<()> {
    for dir in [wal_dir(root), snap_dir(root)] {
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
    }
    info!(root = %root.display(), "removed durable state");
    Ok(())
}
