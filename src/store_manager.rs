use crate::error::PersistError;
use crate::storage::{Completion, ExecutionRecord};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::SystemTime;
use tempfile::NamedTempFile;

/// Identifies one saved version of a snapshot. Two reads returning the same
/// revision saw the same content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision {
    len: u64,
    modified: Option<SystemTime>,
    inode: u64,
}

/// Keeps other writers out while held; released on drop.
pub struct SnapshotLock {
    _file: Option<File>,
}

impl SnapshotLock {
    /// A lock with nothing to hold, for backends only this process can reach.
    pub fn in_process() -> Self {
        Self { _file: None }
    }
}

/// Durable save/load of a whole keyed collection.
pub trait SnapshotBackend<T>: Send + Sync {
    /// Every persisted entry; an empty map when nothing was saved yet.
    fn load_all(&self) -> Result<BTreeMap<String, T>, PersistError>;

    /// Replaces the durable state with `entries`.
    fn save_all(&self, entries: &BTreeMap<String, T>) -> Result<(), PersistError>;

    /// The current durable version, `None` when nothing was saved yet.
    fn revision(&self) -> Result<Option<Revision>, PersistError>;

    /// Blocks until no other writer, in this process or another, holds the
    /// snapshot.
    fn lock(&self) -> Result<SnapshotLock, PersistError>;
}

/// A JSON object keyed by id, replaced atomically on every save.
///
/// Writers serialize on an advisory lock of a sibling `.lock` file.
pub struct JsonSnapshotFile {
    path: PathBuf,
}

impl JsonSnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn write_error(&self, source: io::Error) -> PersistError {
        PersistError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

impl<T> SnapshotBackend<T> for JsonSnapshotFile
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn load_all(&self) -> Result<BTreeMap<String, T>, PersistError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(PersistError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&content).map_err(|source| PersistError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save_all(&self, entries: &BTreeMap<String, T>) -> Result<(), PersistError> {
        let dir = self.dir();
        fs::create_dir_all(&dir).map_err(|e| self.write_error(e))?;

        let data = serde_json::to_vec_pretty(entries).map_err(PersistError::Serialize)?;

        // Write next to the target so the rename stays on one filesystem
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| self.write_error(e))?;
        tmp.write_all(&data).map_err(|e| self.write_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.write_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.write_error(e.error))?;
        Ok(())
    }

    fn revision(&self) -> Result<Option<Revision>, PersistError> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        // Every save renames a fresh file into place, so the inode moves too
        #[cfg(unix)]
        let inode = std::os::unix::fs::MetadataExt::ino(&meta);
        #[cfg(not(unix))]
        let inode = 0;

        Ok(Some(Revision {
            len: meta.len(),
            modified: meta.modified().ok(),
            inode,
        }))
    }

    fn lock(&self) -> Result<SnapshotLock, PersistError> {
        let mut lock_path = self.path.clone();
        lock_path.set_extension("lock");
        let lock_error = |source: io::Error| PersistError::Lock {
            path: lock_path.clone(),
            source,
        };

        fs::create_dir_all(self.dir()).map_err(lock_error)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(lock_error)?;
        file.lock_exclusive().map_err(lock_error)?;
        Ok(SnapshotLock { _file: Some(file) })
    }
}

struct Snapshot<T> {
    entries: BTreeMap<String, T>,
    /// Durable version `entries` was last loaded from or saved as.
    revision: Option<Revision>,
}

/// An in-memory keyed collection that saves a full snapshot after every
/// mutation.
///
/// Other processes may write the same snapshot. Every access first reloads
/// the map if the durable revision moved since this store last saw it, and
/// every mutation runs its reload, change and save under the backend lock,
/// so a change always applies to the latest saved state.
///
/// A failed save leaves the change in memory only. It is written by the next
/// successful save, or dropped if another writer saves first.
pub struct SnapshotStore<T> {
    state: Mutex<Snapshot<T>>,
    backend: Box<dyn SnapshotBackend<T>>,
}

impl<T: Clone> SnapshotStore<T> {
    pub fn open(backend: Box<dyn SnapshotBackend<T>>) -> Result<Self, PersistError> {
        let revision = backend.revision()?;
        let entries = backend.load_all()?;
        Ok(Self {
            state: Mutex::new(Snapshot { entries, revision }),
            backend,
        })
    }

    /// Applies `f` to the latest state. When it cannot be reloaded the
    /// cached one is used.
    pub fn read<R>(&self, f: impl FnOnce(&BTreeMap<String, T>) -> R) -> R {
        let mut state = self.state.lock();
        if let Err(e) = self.refresh(&mut state) {
            log::warn!("using cached snapshot: {}", e);
        }
        f(&state.entries)
    }

    /// Applies `f` and, when it reports a change, saves the result.
    ///
    /// `f` returns its value together with whether it changed the map. A
    /// failed lock, reload or save is returned to the caller; the in-memory
    /// change stays.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, T>) -> (R, bool),
    ) -> Result<R, PersistError> {
        let mut state = self.state.lock();
        let guard = self.backend.lock();
        let synced = match &guard {
            Ok(_) => self.refresh(&mut state),
            Err(_) => Ok(()),
        };

        let (value, changed) = f(&mut state.entries);
        if !changed {
            return Ok(value);
        }

        let _guard = guard?;
        // Never overwrite a snapshot this store could not read
        synced?;
        self.backend.save_all(&state.entries)?;
        state.revision = self.backend.revision().unwrap_or_else(|e| {
            log::warn!("saved snapshot but could not stat it: {}", e);
            None
        });
        Ok(value)
    }

    fn refresh(&self, state: &mut Snapshot<T>) -> Result<(), PersistError> {
        let revision = self.backend.revision()?;
        if revision == state.revision {
            return Ok(());
        }
        state.entries = self.backend.load_all()?;
        state.revision = revision;
        log::debug!("reloaded snapshot written by another process");
        Ok(())
    }
}

/// Authoritative id -> execution record mapping.
pub struct ExecutionStore {
    records: SnapshotStore<ExecutionRecord>,
}

impl ExecutionStore {
    pub fn open(backend: Box<dyn SnapshotBackend<ExecutionRecord>>) -> Result<Self, PersistError> {
        let store = Self {
            records: SnapshotStore::open(backend)?,
        };
        log::info!("loaded {} execution records", store.len());
        Ok(store)
    }

    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self, PersistError> {
        Self::open(Box::new(JsonSnapshotFile::new(path)))
    }

    pub fn insert(&self, record: ExecutionRecord) -> Result<(), PersistError> {
        self.records.update(|entries| {
            entries.insert(record.id.clone(), record);
            ((), true)
        })
    }

    pub fn get(&self, id: &str) -> Option<ExecutionRecord> {
        self.records.read(|entries| entries.get(id).cloned())
    }

    /// All records, most recently started first; equal start times fall back
    /// to ascending id.
    pub fn list_all(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> =
            self.records.read(|entries| entries.values().cloned().collect());
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn len(&self) -> usize {
        self.records.read(|entries| entries.len())
    }

    /// Applies the terminal transition of a running record.
    ///
    /// Returns `false` when the record was deleted meanwhile or is already
    /// terminal; a deleted record is never re-created.
    pub fn complete(&self, id: &str, completion: Completion) -> Result<bool, PersistError> {
        self.records.update(|entries| match entries.get_mut(id) {
            Some(record) => {
                let applied = record.finish(completion);
                (applied, applied)
            }
            None => (false, false),
        })
    }

    pub fn remove(&self, id: &str) -> Result<bool, PersistError> {
        self.records.update(|entries| {
            let existed = entries.remove(id).is_some();
            (existed, existed)
        })
    }

    /// Drops every record and saves the empty set, even if it was already
    /// empty.
    pub fn clear(&self) -> Result<(), PersistError> {
        self.records.update(|entries| {
            entries.clear();
            ((), true)
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryBackend;
    use super::*;
    use crate::storage::ExecutionStatus;
    use anyhow::Result;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn record(id: &str, started_secs: i64) -> ExecutionRecord {
        ExecutionRecord {
            id: id.to_string(),
            command_id: None,
            name: None,
            working_dir: "/tmp".to_string(),
            command: "true".to_string(),
            status: ExecutionStatus::Running,
            output: String::new(),
            exit_code: None,
            executed_by: None,
            started_at: Utc.timestamp_opt(1_700_000_000 + started_secs, 0).unwrap(),
            ended_at: None,
            duration: None,
        }
    }

    fn finished(mut rec: ExecutionRecord) -> ExecutionRecord {
        let ended_at = rec.started_at + Duration::milliseconds(250);
        rec.finish(Completion {
            status: ExecutionStatus::Success,
            exit_code: 0,
            output: "hello\n".to_string(),
            ended_at,
        });
        rec
    }

    #[test]
    fn test_missing_file_loads_empty() -> Result<()> {
        let dir = TempDir::new()?;
        let store = ExecutionStore::open_file(dir.path().join("executions.json"))?;
        assert_eq!(store.len(), 0);
        assert!(store.list_all().is_empty());
        Ok(())
    }

    #[test]
    fn test_empty_file_loads_empty() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("executions.json");
        fs::write(&path, "")?;
        let store = ExecutionStore::open_file(&path)?;
        assert_eq!(store.len(), 0);
        Ok(())
    }

    #[test]
    fn test_corrupt_file_is_an_error() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("executions.json");
        fs::write(&path, "{not json")?;
        let err = ExecutionStore::open_file(&path).err();
        assert!(matches!(err, Some(PersistError::Parse { .. })));
        Ok(())
    }

    #[test]
    fn test_round_trip_keeps_optional_fields() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("executions.json");

        let mut linked = finished(record("linked", 1));
        linked.command_id = Some("tpl-1".to_string());
        linked.name = Some("deploy".to_string());
        linked.executed_by = Some("alice".to_string());
        let ad_hoc = record("ad-hoc", 2);

        {
            let store = ExecutionStore::open_file(&path)?;
            store.insert(linked.clone())?;
            store.insert(ad_hoc.clone())?;
        }

        let raw = fs::read_to_string(&path)?;
        let json: serde_json::Value = serde_json::from_str(&raw)?;
        assert!(json["ad-hoc"].get("command_id").is_none());
        assert!(json["ad-hoc"].get("exit_code").is_none());
        assert_eq!(json["linked"]["workdir"], "/tmp");

        let reloaded = ExecutionStore::open_file(&path)?;
        assert_eq!(reloaded.get("linked"), Some(linked));
        let ad_hoc_loaded = reloaded.get("ad-hoc").unwrap();
        assert_eq!(ad_hoc_loaded.command_id, None);
        assert_eq!(ad_hoc_loaded.ended_at, None);
        assert_eq!(ad_hoc_loaded, ad_hoc);
        Ok(())
    }

    #[test]
    fn test_save_leaves_no_temp_files() -> Result<()> {
        let dir = TempDir::new()?;
        let store = ExecutionStore::open_file(dir.path().join("executions.json"))?;
        store.insert(record("a", 1))?;
        store.insert(record("b", 2))?;
        store.remove("a")?;

        let mut names: Vec<String> = fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["executions.json", "executions.lock"]);
        Ok(())
    }

    #[test]
    fn test_list_all_newest_first() -> Result<()> {
        let store = ExecutionStore::open(Box::new(MemoryBackend::<ExecutionRecord>::new()))?;
        store.insert(record("t2", 2))?;
        store.insert(record("t1", 1))?;
        store.insert(record("t3", 3))?;

        let ids: Vec<String> = store.list_all().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["t3", "t2", "t1"]);
        Ok(())
    }

    #[test]
    fn test_equal_start_times_order_by_id() -> Result<()> {
        let store = ExecutionStore::open(Box::new(MemoryBackend::<ExecutionRecord>::new()))?;
        store.insert(record("b", 5))?;
        store.insert(record("a", 5))?;
        store.insert(record("c", 5))?;

        let ids: Vec<String> = store.list_all().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        Ok(())
    }

    #[test]
    fn test_remove_unknown_does_not_save() -> Result<()> {
        let backend = MemoryBackend::<ExecutionRecord>::new();
        let store = ExecutionStore::open(Box::new(backend.clone()))?;
        store.insert(record("a", 1))?;
        let saves = backend.saves();

        assert!(!store.remove("missing")?);
        assert_eq!(backend.saves(), saves);
        assert_eq!(store.len(), 1);

        assert!(store.remove("a")?);
        assert!(store.get("a").is_none());
        assert!(backend.saved.lock().is_empty());
        Ok(())
    }

    #[test]
    fn test_clear_saves_empty_set() -> Result<()> {
        let backend = MemoryBackend::<ExecutionRecord>::new();
        let store = ExecutionStore::open(Box::new(backend.clone()))?;
        store.clear()?;
        assert_eq!(backend.saves(), 1);

        store.insert(record("a", 1))?;
        store.insert(record("b", 2))?;
        store.clear()?;
        assert!(store.list_all().is_empty());
        assert!(backend.saved.lock().is_empty());
        Ok(())
    }

    #[test]
    fn test_complete_after_delete_does_not_resurrect() -> Result<()> {
        let store = ExecutionStore::open(Box::new(MemoryBackend::<ExecutionRecord>::new()))?;
        store.insert(record("gone", 1))?;
        store.remove("gone")?;

        let applied = store.complete(
            "gone",
            Completion {
                status: ExecutionStatus::Success,
                exit_code: 0,
                output: String::new(),
                ended_at: Utc::now(),
            },
        )?;
        assert!(!applied);
        assert!(store.get("gone").is_none());
        Ok(())
    }

    #[test]
    fn test_failed_save_keeps_memory_state() -> Result<()> {
        let backend = MemoryBackend::<ExecutionRecord>::new();
        let store = ExecutionStore::open(Box::new(backend.clone()))?;
        store.insert(record("a", 1))?;
        store.insert(record("b", 2))?;

        backend.set_failing(true);
        let err = store.remove("a");
        assert!(matches!(err, Err(PersistError::Write { .. })));

        // Memory moved on, durable state did not
        assert!(store.get("a").is_none());
        assert!(backend.saved.lock().contains_key("a"));

        backend.set_failing(false);
        store.clear()?;
        assert!(backend.saved.lock().is_empty());
        Ok(())
    }

    fn success() -> Completion {
        Completion {
            status: ExecutionStatus::Success,
            exit_code: 0,
            output: String::new(),
            ended_at: Utc::now(),
        }
    }

    #[test]
    fn test_two_stores_on_one_file_keep_each_others_changes() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("executions.json");
        let first = ExecutionStore::open_file(&path)?;
        let second = ExecutionStore::open_file(&path)?;

        first.insert(record("a", 1))?;
        second.insert(record("b", 2))?;
        assert!(first.complete("a", success())?);
        assert!(first.get("b").is_some());
        assert!(second.complete("b", success())?);

        let reloaded = ExecutionStore::open_file(&path)?;
        for id in ["a", "b"] {
            let rec = reloaded.get(id).unwrap();
            assert_eq!(rec.status, ExecutionStatus::Success, "record {}", id);
        }
        assert_eq!(second.get("a").map(|r| r.status), Some(ExecutionStatus::Success));
        Ok(())
    }

    #[test]
    fn test_delete_from_another_store_is_not_undone() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("executions.json");
        let runner = ExecutionStore::open_file(&path)?;
        runner.insert(record("a", 1))?;
        runner.insert(record("keep", 2))?;

        let other = ExecutionStore::open_file(&path)?;
        assert!(other.remove("a")?);

        assert!(!runner.complete("a", success())?);
        assert!(runner.complete("keep", success())?);

        let reloaded = ExecutionStore::open_file(&path)?;
        assert!(reloaded.get("a").is_none());
        assert_eq!(
            reloaded.get("keep").map(|r| r.status),
            Some(ExecutionStatus::Success)
        );
        Ok(())
    }

    #[test]
    fn test_clear_from_another_store_is_seen() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("executions.json");
        let first = ExecutionStore::open_file(&path)?;
        first.insert(record("a", 1))?;

        ExecutionStore::open_file(&path)?.clear()?;
        assert_eq!(first.len(), 0);
        assert!(first.list_all().is_empty());
        Ok(())
    }

    #[test]
    fn test_running_record_stays_running_after_reload() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("executions.json");
        {
            let store = ExecutionStore::open_file(&path)?;
            store.insert(record("abandoned", 1))?;
        }
        let reloaded = ExecutionStore::open_file(&path)?;
        let rec = reloaded.get("abandoned").unwrap();
        assert_eq!(rec.status, ExecutionStatus::Running);
        assert_eq!(rec.exit_code, None);
        Ok(())
    }
}
