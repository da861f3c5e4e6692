//! Snapshot files.
//!
//! One file per snapshot, named `<term>-<index>.snap`, containing a CRC32
//! followed by the protobuf-encoded raft snapshot (whose payload is the
//! peer-map envelope). Writes go through a temp file and an atomic rename,
//! so a reader never sees a partially written snapshot. Corrupt files are
//! set aside and the next-newest one is used instead.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use protobuf::Message as PbMessage;
use raft::eraftpb::Snapshot;
use tracing::{debug, warn};

use crate::error::{NodeError, Result};

const SNAP_EXT: &str = "snap";
/// Older snapshots kept around as a fallback for the newest one.
const KEEP_SNAPSHOTS: usize = 2;

/// Snapshot directory handle.
pub struct SnapStore {
    dir: PathBuf,
}

impl SnapStore {
    pub fn open(dir: &Path) -> Result<SnapStore> {
        fs::create_dir_all(dir)?;
        Ok(SnapStore {
            dir: dir.to_path_buf(),
        })
    }

    /// Atomically persist a snapshot, then prune superseded files.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        let name = snap_name(meta.get_term(), meta.get_index());
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{}.tmp", name));

        let body = snapshot.write_to_bytes()?;
        let mut framed = Vec::with_capacity(4 + body.len());
        let mut crc = [0u8; 4];
        LittleEndian::write_u32(&mut crc, crc32fast::hash(&body));
        framed.extend_from_slice(&crc);
        framed.extend_from_slice(&body);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&framed)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;

        debug!(snapshot = %path.display(), index = meta.get_index(), "persisted snapshot");

        self.prune()?;
        Ok(())
    }

    /// Load the newest valid snapshot, if any.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        for (_, _, path) in self.list()?.into_iter().rev() {
            match read_snapshot(&path) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => {
                    warn!(snapshot = %path.display(), error = %e, "setting aside unreadable snapshot");
                    let broken = path.with_extension("broken");
                    let _ = fs::rename(&path, broken);
                }
            }
        }
        Ok(None)
    }

    /// Snapshot files sorted oldest-first by `(index, term)`.
    fn list(&self) -> Result<Vec<(u64, u64, PathBuf)>> {
        let mut found = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAP_EXT) {
                continue;
            }
            if let Some((term, index)) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(parse_snap_name)
            {
                found.push((index, term, path));
            }
        }
        found.sort_by_key(|(index, term, _)| (*index, *term));
        Ok(found)
    }

    fn prune(&self) -> Result<()> {
        let files = self.list()?;
        if files.len() <= KEEP_SNAPSHOTS {
            return Ok(());
        }
        for (_, _, path) in &files[..files.len() - KEEP_SNAPSHOTS] {
            debug!(snapshot = %path.display(), "pruning superseded snapshot");
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn snap_name(term: u64, index: u64) -> String {
    format!("{:016x}-{:016x}.{}", term, index, SNAP_EXT)
}

fn parse_snap_name(stem: &str) -> Option<(u64, u64)> {
    let (term, index) = stem.split_once('-')?;
    Some((
        u64::from_str_radix(term, 16).ok()?,
        u64::from_str_radix(index, 16).ok()?,
    ))
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let data = fs::read(path)?;
    if data.len() < 4 {
        return Err(NodeError::Storage("snapshot file too short".to_string()));
    }
    let crc = LittleEndian::read_u32(&data[..4]);
    let body = &data[4..];
    if crc32fast::hash(body) != crc {
        return Err(NodeError::Storage("snapshot crc mismatch".to_string()));
    }
    Ok(Snapshot::parse_from_bytes(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(index: u64, term: u64, data: &[u8]) -> Snapshot {
        let mut snap = Snapshot::default();
        {
            let meta = snap.mut_metadata();
            meta.set_index(index);
            meta.set_term(term);
        }
        snap.set_data(data.to_vec().into());
        snap
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let store = SnapStore::open(dir.path()).expect("open");

        store.save(&snapshot(5, 2, b"state")).expect("save");
        let loaded = store.load().expect("load").expect("snapshot present");
        assert_eq!(loaded.get_metadata().get_index(), 5);
        assert_eq!(loaded.get_data(), b"state");
    }

    #[test]
    fn newest_snapshot_wins() {
        let dir = TempDir::new().expect("temp dir");
        let store = SnapStore::open(dir.path()).expect("open");

        store.save(&snapshot(5, 2, b"old")).expect("save");
        store.save(&snapshot(9, 2, b"new")).expect("save");

        let loaded = store.load().expect("load").expect("snapshot present");
        assert_eq!(loaded.get_metadata().get_index(), 9);
        assert_eq!(loaded.get_data(), b"new");
    }

    #[test]
    fn corrupt_snapshot_is_skipped() {
        let dir = TempDir::new().expect("temp dir");
        let store = SnapStore::open(dir.path()).expect("open");

        store.save(&snapshot(5, 2, b"good")).expect("save");
        store.save(&snapshot(9, 2, b"newer")).expect("save");

        // Corrupt the newest file.
        let newest = dir.path().join(snap_name(2, 9));
        let mut data = fs::read(&newest).expect("read");
        data[6] ^= 0xFF;
        fs::write(&newest, &data).expect("rewrite");

        let loaded = store.load().expect("load").expect("fallback snapshot");
        assert_eq!(loaded.get_metadata().get_index(), 5);
        assert!(!newest.exists(), "corrupt file should be set aside");
    }

    #[test]
    fn empty_dir_loads_none() {
        let dir = TempDir::new().expect("temp dir");
        let store = SnapStore::open(dir.path()).expect("open");
        assert!(store.load().expect("load").is_none());
    }

    #[test]
    fn old_snapshots_are_pruned() {
        let dir = TempDir::new().expect("temp dir");
        let store = SnapStore::open(dir.path()).expect("open");

        for i in 1..=5 {
            store.save(&snapshot(i * 10, 1, b"s")).expect("save");
        }

        let remaining = store.list().expect("list");
        assert_eq!(remaining.len(), KEEP_SNAPSHOTS);
        assert_eq!(remaining.last().expect("newest").0, 50);
    }
}
