// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::keys::range_scan_prefix;
use crate::{PrimaryCheckpoint, RangeCheckpoint, StoreError};
use ddtail_common::MutexExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const SNAPSHOT_FILE: &str = "checkpoints.db";
const SNAPSHOT_TMP: &str = "checkpoints.db.tmp";
const LOCK_FILE: &str = "LOCK";

/// Entries visited between budget checks during an incremental scan.
const SCAN_STRIDE: usize = 64;

#[derive(Debug, Clone, Copy)]
pub enum ScanMode {
    /// Visit every key, ignoring any time budget.
    Full,
    /// Resume from the persisted cursor and stop once the budget is spent.
    Incremental { budget: Duration },
}

#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    cursor: Option<Vec<u8>>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug)]
struct Inner {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    cursor: Option<Vec<u8>>,
    gc_marks: HashMap<Vec<u8>, Instant>,
}

/// Ordered byte-keyed store backing primary and range checkpoints.
///
/// The whole image lives in memory; every mutating batch is persisted as a
/// snapshot written to a temp file and atomically renamed into place, which
/// is what makes `batch_put`/`batch_delete` all-or-nothing across a crash.
/// The store is opened exclusively through a pid lock file; a lock left by a
/// dead process is reclaimed.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl CheckpointStore {
    pub fn open(dir: &Path) -> Result<CheckpointStore, StoreError> {
        fs::create_dir_all(dir)?;
        acquire_lock(dir)?;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let snapshot = match fs::read(&snapshot_path) {
            Ok(bytes) => match bincode::deserialize::<Snapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    // A torn snapshot cannot happen through the rename path;
                    // treat anything unreadable as a lost store and degrade.
                    warn!(path = %snapshot_path.display(), error = %e,
                          "corrupt checkpoint snapshot, starting empty");
                    Snapshot::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(StoreError::Unavailable(e)),
        };

        let map: BTreeMap<Vec<u8>, Vec<u8>> = snapshot.entries.into_iter().collect();
        info!(entries = map.len(), dir = %dir.display(), "checkpoint store opened");
        Ok(CheckpointStore {
            dir: dir.to_owned(),
            inner: Mutex::new(Inner {
                map,
                cursor: snapshot.cursor,
                gc_marks: HashMap::new(),
            }),
        })
    }

    /// Read a value. Reading also rescues the key from the deferred-delete
    /// list: a reader re-opened during a config reload takes its checkpoint
    /// back before the GC grace period expires.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock_or_panic();
        inner.gc_marks.remove(key);
        inner.map.get(key).cloned()
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        self.batch_put(vec![(key, value)]).map(|_| ())
    }

    /// Atomically insert every entry. Returns the time spent persisting.
    pub fn batch_put(
        &self,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<Duration, StoreError> {
        let started = Instant::now();
        let mut inner = self.inner.lock_or_panic();
        for (key, value) in entries {
            inner.map.insert(key, value);
        }
        self.persist(&inner)?;
        Ok(started.elapsed())
    }

    /// Atomically delete every key. Returns the time spent persisting.
    pub fn batch_delete(&self, keys: Vec<Vec<u8>>) -> Result<Duration, StoreError> {
        let started = Instant::now();
        let mut inner = self.inner.lock_or_panic();
        for key in keys {
            inner.map.remove(&key);
            inner.gc_marks.remove(&key);
        }
        self.persist(&inner)?;
        Ok(started.elapsed())
    }

    /// Scan entries. Incremental mode resumes after the persisted cursor and
    /// leaves the cursor on the last visited key (cleared once the end of the
    /// keyspace is reached, so the next pass wraps around).
    pub fn scan(&self, mode: ScanMode) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut guard = self.inner.lock_or_panic();
        let inner = &mut *guard;
        match mode {
            ScanMode::Full => inner
                .map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ScanMode::Incremental { budget } => {
                let started = Instant::now();
                let start = match inner.cursor.take() {
                    Some(cursor) => Bound::Excluded(cursor),
                    None => Bound::Unbounded,
                };
                let mut out = Vec::new();
                let mut exhausted = true;
                for (k, v) in inner.map.range((start, Bound::Unbounded)) {
                    out.push((k.clone(), v.clone()));
                    if out.len() % SCAN_STRIDE == 0 && started.elapsed() >= budget {
                        exhausted = false;
                        break;
                    }
                }
                inner.cursor = if exhausted {
                    None
                } else {
                    out.last().map(|(k, _)| k.clone())
                };
                out
            }
        }
    }

    /// Add `primary_key` to the deferred-delete list. Actual deletion happens
    /// in the GC worker after the grace period, unless a `get` rescues it.
    pub fn mark_gc(&self, primary_key: &[u8]) {
        let mut inner = self.inner.lock_or_panic();
        if !inner.gc_marks.contains_key(primary_key) {
            inner.gc_marks.insert(primary_key.to_vec(), Instant::now());
        }
    }

    pub fn unmark_gc(&self, primary_key: &[u8]) {
        self.inner.lock_or_panic().gc_marks.remove(primary_key);
    }

    /// Keys that have sat in the deferred-delete list longer than `grace`.
    pub fn gc_marked(&self, grace: Duration) -> Vec<Vec<u8>> {
        let inner = self.inner.lock_or_panic();
        inner
            .gc_marks
            .iter()
            .filter(|(_, marked)| marked.elapsed() >= grace)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock_or_panic().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Typed helpers.

    pub fn get_primary(&self, key: &[u8]) -> Result<Option<PrimaryCheckpoint>, StoreError> {
        match self.get(key) {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| corrupt(key, e)),
        }
    }

    pub fn put_primary(
        &self,
        key: Vec<u8>,
        checkpoint: &PrimaryCheckpoint,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_vec(checkpoint).map_err(|e| corrupt(&key, e))?;
        self.put(key, value)
    }

    pub fn get_range(&self, key: &[u8]) -> Result<Option<RangeCheckpoint>, StoreError> {
        match self.get(key) {
            None => Ok(None),
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| corrupt(key, e)),
        }
    }

    pub fn put_range(&self, key: Vec<u8>, range: &RangeCheckpoint) -> Result<(), StoreError> {
        let value = bincode::serialize(range).map_err(|e| corrupt(&key, e))?;
        self.put(key, value)
    }

    /// Every range checkpoint belonging to `primary_key`, in index order.
    /// Corrupt entries are skipped with a warning rather than failing the
    /// whole lookup.
    pub fn ranges_of(&self, primary_key: &[u8]) -> Vec<(u32, RangeCheckpoint)> {
        let prefix = range_scan_prefix(primary_key);
        let inner = self.inner.lock_or_panic();
        let mut out: Vec<(u32, RangeCheckpoint)> = inner
            .map
            .range((Bound::Included(prefix.clone()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, v)| {
                let (_, index) = crate::keys::split_range_key(k)?;
                match bincode::deserialize::<RangeCheckpoint>(v) {
                    Ok(range) => Some((index, range)),
                    Err(e) => {
                        warn!(key = %String::from_utf8_lossy(k), error = %e,
                              "skipping corrupt range checkpoint");
                        None
                    }
                }
            })
            .collect();
        out.sort_by_key(|(index, _)| *index);
        out
    }

    fn persist(&self, inner: &Inner) -> Result<(), StoreError> {
        let snapshot = Snapshot {
            cursor: inner.cursor.clone(),
            entries: inner
                .map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let bytes = bincode::serialize(&snapshot).map_err(|e| StoreError::Corrupt {
            key: String::new(),
            message: e.to_string(),
        })?;
        let tmp = self.dir.join(SNAPSHOT_TMP);
        fs::write(&tmp, &bytes)?;
        let file = fs::File::open(&tmp)?;
        file.sync_all()?;
        fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;
        Ok(())
    }
}

impl Drop for CheckpointStore {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.dir.join(LOCK_FILE));
    }
}

fn corrupt(key: &[u8], err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        message: err.to_string(),
    }
}

fn acquire_lock(dir: &Path) -> Result<(), StoreError> {
    let lock_path = dir.join(LOCK_FILE);
    if let Ok(contents) = fs::read_to_string(&lock_path) {
        if let Ok(pid) = contents.trim().parse::<u32>() {
            if pid_alive(pid) && pid != std::process::id() {
                return Err(StoreError::Locked(pid));
            }
            info!(pid, "reclaiming stale checkpoint store lock");
        }
        fs::remove_file(&lock_path)?;
    }
    fs::write(&lock_path, std::process::id().to_string())?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    // Without procfs we cannot tell; treat the lock as stale rather than
    // refusing to start after a crash.
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{primary_key, range_key};
    use crate::RangeStatus;

    fn open(dir: &Path) -> CheckpointStore {
        CheckpointStore::open(dir).unwrap()
    }

    #[test]
    fn test_batch_put_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store
                .batch_put(vec![
                    (b"P:a:/x".to_vec(), b"one".to_vec()),
                    (b"P:b:/y".to_vec(), b"two".to_vec()),
                ])
                .unwrap();
        }
        let store = open(dir.path());
        assert_eq!(store.get(b"P:a:/x"), Some(b"one".to_vec()));
        assert_eq!(store.get(b"P:b:/y"), Some(b"two".to_vec()));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_batch_delete_is_atomic_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store
                .batch_put(vec![
                    (b"P:a:/x".to_vec(), b"one".to_vec()),
                    (b"P:b:/y".to_vec(), b"two".to_vec()),
                ])
                .unwrap();
            store
                .batch_delete(vec![b"P:a:/x".to_vec(), b"P:b:/y".to_vec()])
                .unwrap();
        }
        let store = open(dir.path());
        assert!(store.is_empty());
    }

    #[test]
    fn test_lock_blocks_second_opener() {
        let dir = tempfile::tempdir().unwrap();
        let _store = open(dir.path());
        match CheckpointStore::open(dir.path()) {
            Err(StoreError::Locked(pid)) => assert_eq!(pid, std::process::id()),
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        // A pid that cannot be alive: pid_max on Linux tops out below 2^22.
        fs::write(dir.path().join(LOCK_FILE), "4194999").unwrap();
        let store = open(dir.path());
        assert!(store.is_empty());
    }

    #[test]
    fn test_incremental_scan_resumes_from_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let entries: Vec<_> = (0..200)
            .map(|i| (format!("P:s:/f{i:03}").into_bytes(), vec![i as u8]))
            .collect();
        store.batch_put(entries).unwrap();

        // A zero budget stops at the first stride check.
        let mut seen = std::collections::BTreeSet::new();
        let first = store.scan(ScanMode::Incremental {
            budget: Duration::ZERO,
        });
        assert_eq!(first.len(), 64);
        seen.extend(first.into_iter().map(|(k, _)| k));

        // Later passes resume after the cursor and never repeat a key until
        // the whole keyspace has been visited.
        while seen.len() < 200 {
            let chunk = store.scan(ScanMode::Incremental {
                budget: Duration::ZERO,
            });
            assert!(!chunk.is_empty(), "scan stalled at {} entries", seen.len());
            for (k, _) in chunk {
                assert!(seen.insert(k), "key visited twice before wraparound");
            }
        }
        assert_eq!(seen.len(), 200);

        // The cursor wrapped; the next pass starts over from the beginning.
        let wrapped = store.scan(ScanMode::Incremental {
            budget: Duration::ZERO,
        });
        assert_eq!(wrapped.len(), 64);
        assert!(seen.contains(&wrapped[0].0));
    }

    #[test]
    fn test_full_scan_ignores_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store
            .batch_put(vec![
                (b"P:a:/x".to_vec(), b"1".to_vec()),
                (b"P:b:/y".to_vec(), b"2".to_vec()),
            ])
            .unwrap();
        let _ = store.scan(ScanMode::Incremental {
            budget: Duration::ZERO,
        });
        assert_eq!(store.scan(ScanMode::Full).len(), 2);
    }

    #[test]
    fn test_get_rescues_gc_mark() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let key = primary_key("app", Path::new("/logs/a.log"));
        store.put(key.clone(), b"v".to_vec()).unwrap();
        store.mark_gc(&key);
        assert_eq!(store.gc_marked(Duration::ZERO).len(), 1);
        let _ = store.get(&key);
        assert!(store.gc_marked(Duration::ZERO).is_empty());
    }

    #[test]
    fn test_ranges_of_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let pk = primary_key("app", Path::new("/logs/a.log"));
        for (idx, begin) in [(2u32, 200u64), (0, 0), (1, 100)] {
            let range = RangeCheckpoint {
                begin,
                end: begin + 100,
                status: RangeStatus::Ready,
                sequence: 0,
                updated_at: 0,
            };
            store.put_range(range_key(&pk, idx), &range).unwrap();
        }
        let ranges = store.ranges_of(&pk);
        assert_eq!(ranges.len(), 3);
        assert_eq!(
            ranges.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(ranges[2].1.begin, 200);
    }

    #[test]
    fn test_typed_primary_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let key = primary_key("app", Path::new("/logs/a.log"));
        let cpt = PrimaryCheckpoint {
            source: "app".into(),
            logical_path: "/logs/a.log".into(),
            real_path: "/logs/a.log".into(),
            device: 1,
            inode: 2,
            signature: vec![3; 32],
            signature_size: 1024,
            read_offset: 4096,
            created_at: 100,
            last_read_at: 200,
            range_concurrency: 0,
        };
        store.put_primary(key.clone(), &cpt).unwrap();
        assert_eq!(store.get_primary(&key).unwrap(), Some(cpt));
        assert_eq!(store.get_primary(b"P:missing:/f").unwrap(), None);
    }
}
