//! Write-ahead log.
//!
//! Every `(HardState, entries)` pair the Ready loop is about to act on is
//! appended here and fsynced before any message referencing it leaves the
//! node. Restart replays the segments to rebuild the raft log.
//!
//! # Record format
//!
//! ```text
//! ┌─────────┬────────┬───────┬─────────┐
//! │ Length  │ CRC32  │ Type  │ Payload │
//! │ (4 B)   │ (4 B)  │ (1 B) │ (var)   │
//! └─────────┴────────┴───────┴─────────┘
//! ```
//!
//! Length counts type + payload; the CRC covers the same bytes. A record
//! that fails either check marks the end of the log: a torn tail from a
//! crash mid-append is expected and replay stops cleanly there. Corruption
//! anywhere before the tail is an error.
//!
//! Segments rotate at a size threshold and are named by sequence number;
//! segments made obsolete by a persisted snapshot are deleted.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use fs2::FileExt;
use protobuf::Message as PbMessage;
use raft::eraftpb::{Entry, HardState};
use tracing::{debug, warn};

use crate::error::{NodeError, Result};

const SEGMENT_EXT: &str = "wal";
const DEFAULT_SEGMENT_MAX_BYTES: u64 = 64 * 1024 * 1024;
/// Length + CRC framing ahead of every record.
const RECORD_HEADER: usize = 8;
/// Upper bound accepted for one record; anything larger is corruption.
const MAX_RECORD_BYTES: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Entries = 1,
    HardState = 2,
    SnapshotMark = 3,
}

impl TryFrom<u8> for RecordType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            1 => Ok(RecordType::Entries),
            2 => Ok(RecordType::HardState),
            3 => Ok(RecordType::SnapshotMark),
            _ => Err(()),
        }
    }
}

/// State rebuilt from the segments at open time.
#[derive(Debug, Default)]
pub struct WalRecovery {
    /// The last hard state persisted, if any.
    pub hard_state: Option<HardState>,
    /// Entries strictly after the caller's snapshot index, with later
    /// appends overriding conflicting suffixes, in index order.
    pub entries: Vec<Entry>,
}

struct ClosedSegment {
    path: PathBuf,
    /// Highest entry index written up to the moment the segment closed.
    last_index: u64,
}

/// Append-side handle. Owned by the Ready loop; closed last on shutdown.
pub struct Wal {
    dir: PathBuf,
    active: BufWriter<File>,
    active_seq: u64,
    active_size: u64,
    closed: Vec<ClosedSegment>,
    /// Highest entry index ever written.
    last_index: u64,
    segment_max_bytes: u64,
}

impl Wal {
    /// Whether `dir` holds WAL segments, i.e. the node should rejoin.
    pub fn exists(dir: &Path) -> bool {
        list_segments(dir).map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Open the log in `dir`, replaying every valid record. Entries at or
    /// below `since_index` (covered by the snapshot the caller already
    /// loaded) are dropped from the recovery.
    pub fn open(dir: &Path, since_index: u64) -> Result<(Wal, WalRecovery)> {
        fs::create_dir_all(dir)?;

        let segments = list_segments(dir)?;
        let mut replay = Replay::new(since_index);

        for (pos, (_seq, path)) in segments.iter().enumerate() {
            let is_last = pos + 1 == segments.len();
            let valid_len = replay.read_segment(path, is_last)?;
            if is_last {
                // A torn tail is dropped so the next append starts clean.
                let actual = fs::metadata(path)?.len();
                if valid_len < actual {
                    warn!(
                        segment = %path.display(),
                        valid = valid_len,
                        actual,
                        "truncating torn tail"
                    );
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(valid_len)?;
                    file.sync_data()?;
                }
            } else {
                replay.close_segment(path.clone());
            }
        }

        let (active_seq, active_path) = match segments.last() {
            Some((seq, path)) => (*seq, path.clone()),
            None => {
                let seq = 0;
                (seq, segment_path(dir, seq))
            }
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;
        file.try_lock_exclusive().map_err(|e| {
            NodeError::Storage(format!(
                "wal segment {} is locked by another process: {}",
                active_path.display(),
                e
            ))
        })?;
        let active_size = file.metadata()?.len();

        let wal = Wal {
            dir: dir.to_path_buf(),
            active: BufWriter::new(file),
            active_seq,
            active_size,
            closed: replay.closed,
            last_index: replay.last_index,
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
        };

        Ok((
            wal,
            WalRecovery {
                hard_state: replay.hard_state,
                entries: replay.entries,
            },
        ))
    }

    #[cfg(test)]
    fn with_segment_max_bytes(mut self, bytes: u64) -> Self {
        self.segment_max_bytes = bytes;
        self
    }

    /// Durably append a `(hard_state, entries)` pair.
    ///
    /// Returns only after the record is flushed and fsynced; the caller may
    /// then hand dependent messages to the transport.
    pub fn save(&mut self, hard_state: Option<&HardState>, entries: &[Entry]) -> Result<()> {
        if hard_state.is_none() && entries.is_empty() {
            return Ok(());
        }

        if !entries.is_empty() {
            let mut payload = Vec::new();
            payload.write_u32::<LittleEndian>(entries.len() as u32)?;
            for entry in entries {
                let bytes = entry.write_to_bytes()?;
                payload.write_u32::<LittleEndian>(bytes.len() as u32)?;
                payload.extend_from_slice(&bytes);
            }
            self.append_record(RecordType::Entries, &payload)?;
            self.last_index = entries.last().map(|e| e.get_index()).unwrap_or(self.last_index);
        }

        if let Some(hs) = hard_state {
            let payload = hs.write_to_bytes()?;
            self.append_record(RecordType::HardState, &payload)?;
        }

        self.sync()?;
        self.maybe_rotate()?;
        Ok(())
    }

    /// Record that a snapshot at `(index, term)` has been persisted, then
    /// drop segments it makes obsolete.
    pub fn mark_snapshot(&mut self, index: u64, term: u64) -> Result<()> {
        let mut payload = [0u8; 16];
        LittleEndian::write_u64(&mut payload[..8], index);
        LittleEndian::write_u64(&mut payload[8..], term);
        self.append_record(RecordType::SnapshotMark, &payload)?;
        self.sync()?;

        self.maybe_rotate()?;
        self.compact(index)?;
        Ok(())
    }

    /// Flush buffered records to disk.
    pub fn close(&mut self) -> Result<()> {
        self.sync()
    }

    fn append_record(&mut self, record_type: RecordType, payload: &[u8]) -> Result<()> {
        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(record_type as u8);
        body.extend_from_slice(payload);

        self.active.write_u32::<LittleEndian>(body.len() as u32)?;
        self.active
            .write_u32::<LittleEndian>(crc32fast::hash(&body))?;
        self.active.write_all(&body)?;
        self.active_size += (RECORD_HEADER + body.len()) as u64;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.active.flush()?;
        self.active.get_ref().sync_data()?;
        Ok(())
    }

    fn maybe_rotate(&mut self) -> Result<()> {
        if self.active_size < self.segment_max_bytes {
            return Ok(());
        }
        self.sync()?;

        let old_path = segment_path(&self.dir, self.active_seq);
        let new_seq = self.active_seq + 1;
        let new_path = segment_path(&self.dir, new_seq);
        let file = OpenOptions::new().create_new(true).append(true).open(&new_path)?;
        file.try_lock_exclusive()
            .map_err(|e| NodeError::Storage(format!("lock {}: {}", new_path.display(), e)))?;

        debug!(segment = %new_path.display(), "rotating wal segment");

        // Dropping the previous writer releases its lock.
        self.active = BufWriter::new(file);
        self.closed.push(ClosedSegment {
            path: old_path,
            last_index: self.last_index,
        });
        self.active_seq = new_seq;
        self.active_size = 0;
        Ok(())
    }

    /// Delete closed segments fully covered by the snapshot at `index`.
    fn compact(&mut self, index: u64) -> Result<()> {
        let mut kept = Vec::new();
        for segment in self.closed.drain(..) {
            if segment.last_index <= index {
                debug!(segment = %segment.path.display(), "removing compacted wal segment");
                fs::remove_file(&segment.path)?;
            } else {
                kept.push(segment);
            }
        }
        self.closed = kept;
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{:016}.{}", seq, SEGMENT_EXT))
}

fn list_segments(dir: &Path) -> std::io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for dirent in fs::read_dir(dir)? {
        let path = dirent?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        if let Some(seq) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            segments.push((seq, path));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Replay state accumulated over the segment files.
struct Replay {
    since_index: u64,
    hard_state: Option<HardState>,
    entries: Vec<Entry>,
    closed: Vec<ClosedSegment>,
    last_index: u64,
}

impl Replay {
    fn new(since_index: u64) -> Self {
        Replay {
            since_index,
            hard_state: None,
            entries: Vec::new(),
            closed: Vec::new(),
            last_index: 0,
        }
    }

    /// Read one segment, returning the length of its valid prefix.
    fn read_segment(&mut self, path: &Path, is_last: bool) -> Result<u64> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut offset = 0usize;
        loop {
            if data.len() - offset < RECORD_HEADER {
                break;
            }
            let len = LittleEndian::read_u32(&data[offset..offset + 4]);
            let crc = LittleEndian::read_u32(&data[offset + 4..offset + 8]);
            if len == 0 || len > MAX_RECORD_BYTES {
                return self.tail(path, is_last, offset, "bad record length");
            }
            let body_start = offset + RECORD_HEADER;
            let body_end = body_start + len as usize;
            if body_end > data.len() {
                return self.tail(path, is_last, offset, "record past end of segment");
            }
            let body = &data[body_start..body_end];
            if crc32fast::hash(body) != crc {
                return self.tail(path, is_last, offset, "crc mismatch");
            }
            self.apply_record(body)?;
            offset = body_end;
        }

        if offset < data.len() {
            return self.tail(path, is_last, offset, "trailing partial record");
        }
        Ok(offset as u64)
    }

    /// A decode failure is tolerable only as the tail of the final segment.
    fn tail(&self, path: &Path, is_last: bool, offset: usize, reason: &str) -> Result<u64> {
        if is_last {
            warn!(segment = %path.display(), offset, reason, "stopping wal replay at torn tail");
            Ok(offset as u64)
        } else {
            Err(NodeError::Storage(format!(
                "corrupt wal segment {} at offset {}: {}",
                path.display(),
                offset,
                reason
            )))
        }
    }

    fn apply_record(&mut self, body: &[u8]) -> Result<()> {
        let record_type = RecordType::try_from(body[0])
            .map_err(|_| NodeError::Storage(format!("unknown wal record type {}", body[0])))?;
        let payload = &body[1..];

        match record_type {
            RecordType::Entries => {
                if payload.len() < 4 {
                    return Err(NodeError::Storage("short entries record".to_string()));
                }
                let count = LittleEndian::read_u32(&payload[..4]) as usize;
                let mut offset = 4usize;
                let mut batch = Vec::with_capacity(count);
                for _ in 0..count {
                    if payload.len() - offset < 4 {
                        return Err(NodeError::Storage("short entries record".to_string()));
                    }
                    let len = LittleEndian::read_u32(&payload[offset..offset + 4]) as usize;
                    offset += 4;
                    if payload.len() - offset < len {
                        return Err(NodeError::Storage("short entries record".to_string()));
                    }
                    let entry = Entry::parse_from_bytes(&payload[offset..offset + len])?;
                    offset += len;
                    batch.push(entry);
                }
                self.absorb_entries(batch);
            }
            RecordType::HardState => {
                self.hard_state = Some(HardState::parse_from_bytes(payload)?);
            }
            RecordType::SnapshotMark => {
                if payload.len() != 16 {
                    return Err(NodeError::Storage("short snapshot mark".to_string()));
                }
                let index = LittleEndian::read_u64(&payload[..8]);
                self.since_index = self.since_index.max(index);
                self.entries.retain(|e| e.get_index() > index);
            }
        }
        Ok(())
    }

    /// Later appends override any conflicting suffix, matching the append
    /// semantics of the in-memory log.
    fn absorb_entries(&mut self, batch: Vec<Entry>) {
        let Some(first_new) = batch.first().map(|e| e.get_index()) else {
            return;
        };
        if let Some(pos) = self.entries.iter().position(|e| e.get_index() >= first_new) {
            self.entries.truncate(pos);
        }
        for entry in batch {
            self.last_index = self.last_index.max(entry.get_index());
            if entry.get_index() > self.since_index {
                self.entries.push(entry);
            }
        }
    }

    fn close_segment(&mut self, path: PathBuf) {
        self.closed.push(ClosedSegment {
            path,
            last_index: self.last_index,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.set_index(index);
        e.set_term(term);
        e.set_data(data.to_vec().into());
        e
    }

    fn hard_state(term: u64, commit: u64) -> HardState {
        let mut hs = HardState::default();
        hs.set_term(term);
        hs.set_commit(commit);
        hs
    }

    #[test]
    fn save_and_replay_round_trip() {
        let dir = TempDir::new().expect("temp dir");

        {
            let (mut wal, recovery) = Wal::open(dir.path(), 0).expect("open");
            assert!(recovery.entries.is_empty());
            wal.save(
                Some(&hard_state(1, 0)),
                &[entry(1, 1, b"a"), entry(2, 1, b"b")],
            )
            .expect("save");
            wal.save(Some(&hard_state(1, 2)), &[entry(3, 1, b"c")])
                .expect("save");
        }

        let (_wal, recovery) = Wal::open(dir.path(), 0).expect("reopen");
        assert_eq!(recovery.entries.len(), 3);
        assert_eq!(recovery.entries[2].get_data(), b"c");
        assert_eq!(recovery.hard_state.expect("hard state").get_commit(), 2);
    }

    #[test]
    fn replay_skips_entries_covered_by_snapshot() {
        let dir = TempDir::new().expect("temp dir");

        {
            let (mut wal, _) = Wal::open(dir.path(), 0).expect("open");
            wal.save(None, &[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
                .expect("save");
        }

        let (_wal, recovery) = Wal::open(dir.path(), 2).expect("reopen");
        assert_eq!(recovery.entries.len(), 1);
        assert_eq!(recovery.entries[0].get_index(), 3);
    }

    #[test]
    fn later_append_overrides_conflicting_suffix() {
        let dir = TempDir::new().expect("temp dir");

        {
            let (mut wal, _) = Wal::open(dir.path(), 0).expect("open");
            wal.save(None, &[entry(1, 1, b"a"), entry(2, 1, b"b")])
                .expect("save");
            // A new leader rewrites index 2.
            wal.save(None, &[entry(2, 2, b"b2")]).expect("save");
        }

        let (_wal, recovery) = Wal::open(dir.path(), 0).expect("reopen");
        assert_eq!(recovery.entries.len(), 2);
        assert_eq!(recovery.entries[1].get_term(), 2);
        assert_eq!(recovery.entries[1].get_data(), b"b2");
    }

    #[test]
    fn torn_tail_is_tolerated() {
        let dir = TempDir::new().expect("temp dir");

        {
            let (mut wal, _) = Wal::open(dir.path(), 0).expect("open");
            wal.save(None, &[entry(1, 1, b"a")]).expect("save");
        }

        // Simulate a crash mid-append.
        let segment = segment_path(dir.path(), 0);
        let mut file = OpenOptions::new().append(true).open(&segment).expect("open segment");
        file.write_all(&[0x42, 0x00, 0x00]).expect("garbage");
        drop(file);

        let (_wal, recovery) = Wal::open(dir.path(), 0).expect("reopen");
        assert_eq!(recovery.entries.len(), 1);
    }

    #[test]
    fn crc_corruption_ends_replay() {
        let dir = TempDir::new().expect("temp dir");

        {
            let (mut wal, _) = Wal::open(dir.path(), 0).expect("open");
            wal.save(None, &[entry(1, 1, b"aaaa")]).expect("save");
            wal.save(None, &[entry(2, 1, b"bbbb")]).expect("save");
        }

        let segment = segment_path(dir.path(), 0);
        let mut data = fs::read(&segment).expect("read");
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&segment, &data).expect("rewrite");

        let (_wal, recovery) = Wal::open(dir.path(), 0).expect("reopen");
        assert_eq!(recovery.entries.len(), 1, "replay stops at the corrupt record");
    }

    #[test]
    fn snapshot_mark_compacts_closed_segments() {
        let dir = TempDir::new().expect("temp dir");

        {
            let (wal, _) = Wal::open(dir.path(), 0).expect("open");
            let mut wal = wal.with_segment_max_bytes(64);
            for i in 1..=20 {
                wal.save(None, &[entry(i, 1, b"payload-payload")]).expect("save");
            }
            assert!(list_segments(dir.path()).expect("list").len() > 1);
            wal.mark_snapshot(20, 1).expect("mark");
            // Only the active segment remains.
            assert_eq!(list_segments(dir.path()).expect("list").len(), 1);
        }

        let (_wal, recovery) = Wal::open(dir.path(), 20).expect("reopen");
        assert!(recovery.entries.is_empty());
    }

    #[test]
    fn exists_detects_segments() {
        let dir = TempDir::new().expect("temp dir");
        assert!(!Wal::exists(dir.path()));
        let _wal = Wal::open(dir.path(), 0).expect("open");
        assert!(Wal::exists(dir.path()));
    }
}
