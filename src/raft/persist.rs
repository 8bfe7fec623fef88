use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::state::{LogEntry, RaftState};

/// Durable storage for a peer's hard state and latest snapshot.
///
/// Both blobs are opaque to the persister. `save_state_and_snapshot` must not
/// leave a state newer than its snapshot visible after a crash.
pub trait Persister: Send + Sync {
    fn save_raft_state(&self, state: &[u8]) -> Result<()>;

    fn save_state_and_snapshot(&self, state: &[u8], snapshot: &[u8]) -> Result<()>;

    fn read_raft_state(&self) -> Result<Option<Vec<u8>>>;

    fn read_snapshot(&self) -> Result<Option<Vec<u8>>>;

    /// Size in bytes of the last saved hard state.
    fn raft_state_size(&self) -> usize;
}

#[derive(Serialize)]
struct HardStateRef<'a> {
    current_term: u64,
    voted_for: Option<u64>,
    log: &'a [LogEntry],
}

#[derive(Deserialize)]
struct HardState {
    current_term: u64,
    voted_for: Option<u64>,
    log: Vec<LogEntry>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    last_included_index: u64,
    last_included_term: u64,
    data: Vec<u8>,
}

pub fn encode_hard_state(state: &RaftState) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&HardStateRef {
        current_term: state.current_term,
        voted_for: state.voted_for,
        log: &state.log,
    })?)
}

pub fn encode_snapshot(state: &RaftState) -> Result<Option<Vec<u8>>> {
    let Some(data) = &state.snapshot else {
        return Ok(None);
    };
    Ok(Some(serde_json::to_vec(&SnapshotRecord {
        last_included_index: state.snapshot_last_index,
        last_included_term: state.snapshot_last_term,
        data: data.clone(),
    })?))
}

/// Rebuild a peer's state from whatever the persister holds.
///
/// Log entries already covered by the snapshot are dropped, and `commit_index`
/// starts at the snapshot boundary. An empty persister yields a fresh state.
pub fn restore(persister: &dyn Persister) -> Result<RaftState> {
    let mut state = RaftState::new();

    if let Some(bytes) = persister.read_raft_state()? {
        let hard: HardState = serde_json::from_slice(&bytes)?;
        state.current_term = hard.current_term;
        state.voted_for = hard.voted_for;
        state.log = hard.log;
    }

    if let Some(bytes) = persister.read_snapshot()? {
        let record: SnapshotRecord = serde_json::from_slice(&bytes)?;
        // The saved log may or may not be trimmed yet; keep only the suffix
        state
            .log
            .retain(|entry| entry.index > record.last_included_index);
        state.snapshot_last_index = record.last_included_index;
        state.snapshot_last_term = record.last_included_term;
        state.snapshot = Some(record.data);
        state.commit_index = record.last_included_index;
    }

    if let Some(first) = state.log.first() {
        if first.index != state.snapshot_last_index + 1 {
            return Err(RaftError::Codec(format!(
                "persisted log starts at {} but snapshot ends at {}",
                first.index, state.snapshot_last_index
            )));
        }
    }

    state.take_persist_needs();
    Ok(state)
}

#[derive(Debug, Default)]
struct MemoryInner {
    raft_state: Option<Vec<u8>>,
    snapshot: Option<Vec<u8>>,
    fail_writes: bool,
}

/// In-memory persister. Clones share storage, so a test can drop a node and
/// restart a new one on the same handle to simulate a crash.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersister {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_writes = fail;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| RaftError::Persistence("memory persister lock poisoned".to_string()))
    }
}

impl Persister for MemoryPersister {
    fn save_raft_state(&self, state: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            return Err(RaftError::Persistence("injected write failure".to_string()));
        }
        inner.raft_state = Some(state.to_vec());
        Ok(())
    }

    fn save_state_and_snapshot(&self, state: &[u8], snapshot: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            return Err(RaftError::Persistence("injected write failure".to_string()));
        }
        inner.raft_state = Some(state.to_vec());
        inner.snapshot = Some(snapshot.to_vec());
        Ok(())
    }

    fn read_raft_state(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.raft_state.clone())
    }

    fn read_snapshot(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.snapshot.clone())
    }

    fn raft_state_size(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.raft_state.as_ref().map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

/// File-backed persister storing `raft_state.json` and `snapshot.json` in a
/// directory. Every write goes to a temp file that is fsynced and renamed.
#[derive(Debug)]
pub struct FilePersister {
    dir: PathBuf,
}

impl FilePersister {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("raft_state.json")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");
        let write = || -> io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&temp_path, path)?;
            File::open(&self.dir)?.sync_all()
        };
        write().map_err(|e| RaftError::Persistence(format!("{}: {}", path.display(), e)))
    }

    fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RaftError::Persistence(format!("{}: {}", path.display(), e))),
        }
    }
}

impl Persister for FilePersister {
    fn save_raft_state(&self, state: &[u8]) -> Result<()> {
        self.write_atomic(&self.state_path(), state)
    }

    fn save_state_and_snapshot(&self, state: &[u8], snapshot: &[u8]) -> Result<()> {
        // Snapshot first: a crash in between leaves an older state whose
        // covered prefix is trimmed on restore.
        self.write_atomic(&self.snapshot_path(), snapshot)?;
        self.write_atomic(&self.state_path(), state)
    }

    fn read_raft_state(&self) -> Result<Option<Vec<u8>>> {
        Self::read_optional(&self.state_path())
    }

    fn read_snapshot(&self) -> Result<Option<Vec<u8>>> {
        Self::read_optional(&self.snapshot_path())
    }

    fn raft_state_size(&self) -> usize {
        fs::metadata(self.state_path()).map_or(0, |m| m.len() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn state_with_log(term: u64, n: u64) -> RaftState {
        let mut state = RaftState::new();
        state.current_term = term;
        state.voted_for = Some(2);
        for i in 1..=n {
            state.log.push(LogEntry {
                index: i,
                term,
                command: vec![i as u8],
            });
        }
        state
    }

    #[test]
    fn empty_persister_restores_fresh_state() {
        let persister = MemoryPersister::new();
        let state = restore(&persister).unwrap();
        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, None);
        assert!(state.log.is_empty());
        assert_eq!(persister.raft_state_size(), 0);
    }

    #[test]
    fn memory_persister_restores_hard_state() {
        let persister = MemoryPersister::new();
        let state = state_with_log(3, 4);
        persister
            .save_raft_state(&encode_hard_state(&state).unwrap())
            .unwrap();

        let restored = restore(&persister).unwrap();
        assert_eq!(restored.current_term, 3);
        assert_eq!(restored.voted_for, Some(2));
        assert_eq!(restored.log, state.log);
        assert!(persister.raft_state_size() > 0);
    }

    #[test]
    fn restore_trims_prefix_covered_by_snapshot() {
        let persister = MemoryPersister::new();
        let full = state_with_log(1, 6);
        let full_bytes = encode_hard_state(&full).unwrap();

        let mut compacted = state_with_log(1, 6);
        compacted.compact_to(4, 1, b"snap".to_vec());
        let snap_bytes = encode_snapshot(&compacted).unwrap().unwrap();

        // Snapshot landed but the crash happened before the trimmed state
        persister
            .save_state_and_snapshot(&full_bytes, &snap_bytes)
            .unwrap();

        let restored = restore(&persister).unwrap();
        assert_eq!(restored.snapshot_last_index, 4);
        assert_eq!(restored.snapshot.as_deref(), Some(&b"snap"[..]));
        assert_eq!(restored.log.len(), 2);
        assert_eq!(restored.log[0].index, 5);
        assert_eq!(restored.commit_index, 4);
        assert_eq!(restored.last_applied, 0);
        assert!(!restored.persist_needs.any());
    }

    #[test]
    fn restore_keeps_entries_after_snapshot() {
        let persister = MemoryPersister::new();
        let mut state = state_with_log(1, 5);
        state.compact_to(3, 1, b"snap".to_vec());
        persister
            .save_state_and_snapshot(
                &encode_hard_state(&state).unwrap(),
                &encode_snapshot(&state).unwrap().unwrap(),
            )
            .unwrap();

        let restored = restore(&persister).unwrap();
        assert_eq!(restored.snapshot_last_index, 3);
        assert_eq!(restored.snapshot_last_term, 1);
        assert_eq!(restored.last_log_index(), 5);
        let indices: Vec<u64> = restored.log.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![4, 5]);
        assert_eq!(restored.get_entry(5).map(|e| e.command.clone()), Some(vec![5]));
        assert_eq!(restored.commit_index, 3);
    }

    #[test]
    fn injected_failure_surfaces_as_persistence_error() {
        let persister = MemoryPersister::new();
        persister.set_fail_writes(true);
        let err = persister.save_raft_state(b"x").unwrap_err();
        assert!(matches!(err, RaftError::Persistence(_)));
    }

    #[test]
    fn file_persister_survives_restart() {
        let dir = tempdir().unwrap();
        let mut state = state_with_log(2, 5);
        state.compact_to(3, 2, b"kv".to_vec());

        {
            let persister = FilePersister::new(dir.path()).unwrap();
            persister
                .save_state_and_snapshot(
                    &encode_hard_state(&state).unwrap(),
                    &encode_snapshot(&state).unwrap().unwrap(),
                )
                .unwrap();
        }

        let persister = FilePersister::new(dir.path()).unwrap();
        let restored = restore(&persister).unwrap();
        assert_eq!(restored.current_term, 2);
        assert_eq!(restored.snapshot_last_index, 3);
        assert_eq!(restored.last_log_index(), 5);
        assert_eq!(restored.log, state.log);
        assert_eq!(restored.term_at(4), Some(2));
        assert!(persister.raft_state_size() > 0);
        assert!(!dir.path().join("raft_state.tmp").exists());
    }

    #[test]
    fn file_persister_missing_files_read_as_none() {
        let dir = tempdir().unwrap();
        let persister = FilePersister::new(dir.path().join("nested")).unwrap();
        assert!(persister.read_raft_state().unwrap().is_none());
        assert!(persister.read_snapshot().unwrap().is_none());
        assert_eq!(persister.raft_state_size(), 0);
    }
}
