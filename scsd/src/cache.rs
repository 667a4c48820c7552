//! Content-addressed compile cache with an append-only on-disk log.
//!
//! Two maps are kept in memory:
//!
//! * request hash -> data hash
//! * data hash -> compiled bytes
//!
//! Identical outputs from different requests share one blob. Every insert
//! queues log records in memory; only the maintenance task appends them to
//! `Cache.dat` (see [`CompileCache::flush_pending`]), so connection tasks
//! never touch the disk.
//!
//! Log record layout (little-endian):
//!
//! ```text
//! magic u32 | size u32 | flags u32 | hash [u8; 16] | size bytes
//! ```
//!
//! `flags == 0` is a blob record (`hash` = data hash, body = bytes);
//! `flags == 1` is a reference record (`hash` = request hash, body = the
//! 16-byte data hash).

use scs_common::Hash128;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CACHE_FILE: &str = "Cache.dat";
pub const BACKUP_FILE: &str = "Cache.dat.bak";
pub const OLDER_BACKUP_FILE: &str = "Cache.dat.bak2";

const RECORD_MAGIC: u32 = 0x3143_4353; // "SCC1"
const HEADER_LEN: usize = 4 + 4 + 4 + Hash128::LEN;
const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

const FLAG_BLOB: u32 = 0;
const FLAG_REFERENCE: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Outcome of replaying a cache log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Reference records applied.
    pub entries: usize,
    /// Blob records applied.
    pub blobs: usize,
    /// Replay stopped early on a malformed or dangling record.
    pub corrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub blobs: usize,
    pub stored_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub pending_records: usize,
}

#[derive(Default)]
struct CacheInner {
    requests: HashMap<Hash128, Hash128>,
    blobs: HashMap<Hash128, Arc<Vec<u8>>>,
    stored_bytes: u64,
    hits: u64,
    misses: u64,
    pending: Vec<u8>,
    pending_records: usize,
}

impl CacheInner {
    fn clear(&mut self) {
        self.requests.clear();
        self.blobs.clear();
        self.stored_bytes = 0;
        self.pending.clear();
        self.pending_records = 0;
    }

    fn put_blob(&mut self, data_hash: Hash128, bytes: Arc<Vec<u8>>) -> bool {
        if self.blobs.contains_key(&data_hash) {
            return false;
        }
        self.stored_bytes += bytes.len() as u64;
        self.blobs.insert(data_hash, bytes);
        true
    }
}

fn encode_record(out: &mut Vec<u8>, flags: u32, hash: &Hash128, body: &[u8]) {
    out.reserve(HEADER_LEN + body.len());
    out.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(hash.as_bytes());
    out.extend_from_slice(body);
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_hash(bytes: &[u8]) -> Hash128 {
    let mut buf = [0u8; Hash128::LEN];
    buf.copy_from_slice(&bytes[..Hash128::LEN]);
    Hash128(buf)
}

/// Thread-safe compile cache.
pub struct CompileCache {
    inner: Mutex<CacheInner>,
    /// Log file receiving flushed records; memory-only when `None`.
    log_path: Option<PathBuf>,
}

/// Append `bytes` through `out` and sync `file`. A failed write is cut back
/// to the previous end of file so replay never meets a partial record.
fn append_records(file: &File, mut out: impl Write, bytes: &[u8]) -> io::Result<()> {
    let start = file.metadata()?.len();
    let result = out.write_all(bytes).and_then(|()| file.sync_data());
    if result.is_err()
        && let Err(err) = file.set_len(start)
    {
        warn!(len = start, "could not truncate partial cache write: {err}");
    }
    result
}

impl CompileCache {
    /// A cache that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            log_path: None,
        }
    }

    fn with_log(path: PathBuf) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            log_path: Some(path),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Open the cache in `dir`, recovering from a damaged log.
    ///
    /// * healthy `Cache.dat`: loaded, then `.bak` is moved to `.bak2` and
    ///   `Cache.dat` copied to `.bak`;
    /// * damaged `Cache.dat`: replaced by `.bak` when that loads cleanly;
    /// * both damaged: every cache file is removed and the cache starts cold.
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let primary = dir.join(CACHE_FILE);
        let backup = dir.join(BACKUP_FILE);
        let older = dir.join(OLDER_BACKUP_FILE);
        let cache = Self::with_log(primary.clone());

        if !primary.exists() {
            info!(path = %primary.display(), "no cache log, starting cold");
            return Ok(cache);
        }

        let report = cache.replay_or_corrupt(&primary);
        if !report.corrupted {
            info!(
                entries = report.entries,
                blobs = report.blobs,
                "cache log loaded"
            );
            if backup.exists() {
                fs::rename(&backup, &older).map_err(io_err(&older))?;
            }
            fs::copy(&primary, &backup).map_err(io_err(&backup))?;
            return Ok(cache);
        }

        warn!(
            path = %primary.display(),
            entries = report.entries,
            blobs = report.blobs,
            "cache log corrupted, trying backup"
        );
        cache.lock().clear();

        if backup.exists() {
            let report = cache.replay_or_corrupt(&backup);
            if !report.corrupted {
                fs::copy(&backup, &primary).map_err(io_err(&primary))?;
                info!(
                    entries = report.entries,
                    blobs = report.blobs,
                    "cache restored from backup"
                );
                return Ok(cache);
            }
            warn!(path = %backup.display(), "cache backup corrupted too");
            cache.lock().clear();
        }

        for path in [&primary, &backup, &older] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_err(path)(err)),
            }
        }
        warn!(dir = %dir.display(), "cache wiped, starting cold");
        Ok(cache)
    }

    /// Unreadable files count as corrupted.
    fn replay_or_corrupt(&self, path: &Path) -> LoadReport {
        match self.load_from_disk(path) {
            Ok(report) => report,
            Err(err) => {
                warn!("cannot read cache log: {err}");
                LoadReport {
                    corrupted: true,
                    ..LoadReport::default()
                }
            }
        }
    }

    /// Replay a log file into this cache.
    ///
    /// Records before the first bad one stay loaded; the bad record and
    /// everything after it are skipped and `corrupted` is set.
    pub fn load_from_disk(&self, path: &Path) -> Result<LoadReport, CacheError> {
        let bytes = fs::read(path).map_err(io_err(path))?;
        let mut report = LoadReport::default();
        let mut inner = self.lock();
        let mut offset = 0usize;

        while offset < bytes.len() {
            let rest = &bytes[offset..];
            if rest.len() < HEADER_LEN {
                debug!(offset, "truncated record header");
                report.corrupted = true;
                break;
            }
            let magic = read_u32(rest);
            let size = read_u32(&rest[4..]) as usize;
            let flags = read_u32(&rest[8..]);
            let hash = read_hash(&rest[12..]);
            if magic != RECORD_MAGIC || size > MAX_RECORD_SIZE {
                debug!(offset, magic, size, "bad record header");
                report.corrupted = true;
                break;
            }
            let Some(body) = rest.get(HEADER_LEN..HEADER_LEN + size) else {
                debug!(offset, size, "truncated record body");
                report.corrupted = true;
                break;
            };

            match flags {
                FLAG_BLOB => {
                    if Hash128::of(body) != hash {
                        debug!(offset, %hash, "blob content does not match its hash");
                        report.corrupted = true;
                        break;
                    }
                    inner.put_blob(hash, Arc::new(body.to_vec()));
                    report.blobs += 1;
                }
                FLAG_REFERENCE if size == Hash128::LEN => {
                    let data_hash = read_hash(body);
                    if !inner.blobs.contains_key(&data_hash) {
                        debug!(offset, %hash, %data_hash, "reference to unknown blob");
                        report.corrupted = true;
                        break;
                    }
                    inner.requests.insert(hash, data_hash);
                    report.entries += 1;
                }
                _ => {
                    debug!(offset, flags, size, "unknown record kind");
                    report.corrupted = true;
                    break;
                }
            }
            offset += HEADER_LEN + size;
        }

        Ok(report)
    }

    /// Cached bytes for `request_hash`.
    pub fn lookup(&self, request_hash: &Hash128) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.lock();
        let found = inner
            .requests
            .get(request_hash)
            .and_then(|data| inner.blobs.get(data))
            .cloned();
        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Record the compiled bytes for `request_hash`.
    pub fn insert(&self, request_hash: Hash128, bytes: Vec<u8>) {
        let data_hash = Hash128::of(&bytes);
        let persist = self.log_path.is_some();
        let mut inner = self.lock();
        let bytes = Arc::new(bytes);
        if inner.put_blob(data_hash, bytes.clone()) && persist {
            let CacheInner {
                pending,
                pending_records,
                ..
            } = &mut *inner;
            encode_record(pending, FLAG_BLOB, &data_hash, &bytes);
            *pending_records += 1;
        }
        inner.requests.insert(request_hash, data_hash);
        if persist {
            let CacheInner {
                pending,
                pending_records,
                ..
            } = &mut *inner;
            encode_record(pending, FLAG_REFERENCE, &request_hash, data_hash.as_bytes());
            *pending_records += 1;
        }
    }

    /// Append queued records to the log. Returns the number written.
    ///
    /// On failure the records are queued again ahead of newer ones.
    pub fn flush_pending(&self) -> Result<usize, CacheError> {
        let Some(path) = self.log_path.as_deref() else {
            return Ok(0);
        };
        let (bytes, records) = {
            let mut inner = self.lock();
            if inner.pending_records == 0 {
                return Ok(0);
            }
            let records = std::mem::take(&mut inner.pending_records);
            (std::mem::take(&mut inner.pending), records)
        };

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|file| append_records(&file, &file, &bytes));

        match result {
            Ok(()) => {
                debug!(records, bytes = bytes.len(), "cache records flushed");
                Ok(records)
            }
            Err(err) => {
                let mut inner = self.lock();
                let newer = std::mem::replace(&mut inner.pending, bytes);
                inner.pending.extend_from_slice(&newer);
                inner.pending_records += records;
                Err(io_err(path)(err))
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.requests.len(),
            blobs: inner.blobs.len(),
            stored_bytes: inner.stored_bytes,
            hits: inner.hits,
            misses: inner.misses,
            pending_records: inner.pending_records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(n: u8) -> Hash128 {
        Hash128::of(&[n])
    }

    fn populated(dir: &Path) -> CompileCache {
        let cache = CompileCache::open(dir).unwrap();
        cache.insert(key(1), b"bytecode-one".to_vec());
        cache.insert(key(2), b"bytecode-two".to_vec());
        cache.flush_pending().unwrap();
        cache
    }

    #[test]
    fn lookup_counts_hits_and_misses() {
        let _guard = scs_common::test_guard!();
        let cache = CompileCache::in_memory();
        assert!(cache.lookup(&key(1)).is_none());
        cache.insert(key(1), b"abc".to_vec());
        assert_eq!(cache.lookup(&key(1)).unwrap().as_slice(), b"abc");
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.pending_records, 0);
    }

    #[test]
    fn identical_outputs_share_one_blob() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        let cache = CompileCache::open(dir.path()).unwrap();
        cache.insert(key(1), b"same".to_vec());
        cache.insert(key(2), b"same".to_vec());
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.blobs, 1);
        // one blob record, two reference records
        assert_eq!(stats.pending_records, 3);
        assert_eq!(stats.stored_bytes, 4);
    }

    #[test]
    fn flushed_log_round_trips() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        let written = populated(dir.path());
        assert_eq!(written.stats().pending_records, 0);

        let fresh = CompileCache::in_memory();
        let report = fresh.load_from_disk(&dir.path().join(CACHE_FILE)).unwrap();
        assert_eq!(
            report,
            LoadReport {
                entries: 2,
                blobs: 2,
                corrupted: false
            }
        );
        assert_eq!(fresh.lookup(&key(2)).unwrap().as_slice(), b"bytecode-two");
    }

    #[test]
    fn truncated_tail_keeps_prior_records() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        populated(dir.path());
        let path = dir.path().join(CACHE_FILE);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let cache = CompileCache::in_memory();
        let report = cache.load_from_disk(&path).unwrap();
        assert!(report.corrupted);
        assert_eq!(report.entries, 1);
        assert!(cache.lookup(&key(1)).is_some());
        assert!(cache.lookup(&key(2)).is_none());
    }

    #[test]
    fn garbled_final_blob_is_detected() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE);
        let mut log = Vec::new();
        let good = Hash128::of(b"good");
        encode_record(&mut log, FLAG_BLOB, &good, b"good");
        encode_record(&mut log, FLAG_REFERENCE, &key(1), good.as_bytes());
        encode_record(&mut log, FLAG_BLOB, &Hash128::of(b"orig"), b"orig");
        let last = log.len() - 1;
        log[last] ^= 0xff;
        fs::write(&path, &log).unwrap();

        let cache = CompileCache::in_memory();
        let report = cache.load_from_disk(&path).unwrap();
        assert!(report.corrupted);
        assert_eq!((report.entries, report.blobs), (1, 1));
    }

    #[test]
    fn dangling_reference_is_corruption() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE);
        let mut log = Vec::new();
        encode_record(&mut log, FLAG_REFERENCE, &key(1), key(9).as_bytes());
        fs::write(&path, &log).unwrap();
        let report = CompileCache::in_memory().load_from_disk(&path).unwrap();
        assert!(report.corrupted);
        assert_eq!(report.entries, 0);
    }

    #[test]
    fn healthy_open_rotates_backups() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        populated(dir.path());
        fs::write(dir.path().join(BACKUP_FILE), b"previous").unwrap();

        let cache = CompileCache::open(dir.path()).unwrap();
        assert_eq!(cache.stats().entries, 2);
        assert_eq!(fs::read(dir.path().join(OLDER_BACKUP_FILE)).unwrap(), b"previous");
        assert_eq!(
            fs::read(dir.path().join(BACKUP_FILE)).unwrap(),
            fs::read(dir.path().join(CACHE_FILE)).unwrap()
        );
    }

    #[test]
    fn corrupted_log_is_restored_from_backup() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        populated(dir.path());
        // second open copies the healthy log to .bak
        drop(CompileCache::open(dir.path()).unwrap());
        fs::write(dir.path().join(CACHE_FILE), b"garbage garbage garbage garbage").unwrap();

        let cache = CompileCache::open(dir.path()).unwrap();
        assert_eq!(cache.stats().entries, 2);
        assert_eq!(cache.lookup(&key(1)).unwrap().as_slice(), b"bytecode-one");
        assert_eq!(
            fs::read(dir.path().join(CACHE_FILE)).unwrap(),
            fs::read(dir.path().join(BACKUP_FILE)).unwrap()
        );
    }

    #[test]
    fn double_corruption_wipes_and_runs_cold() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CACHE_FILE), b"not a cache log at all....").unwrap();
        fs::write(dir.path().join(BACKUP_FILE), b"also not a cache log.......").unwrap();

        let cache = CompileCache::open(dir.path()).unwrap();
        assert_eq!(cache.stats().entries, 0);
        assert!(!dir.path().join(CACHE_FILE).exists());
        assert!(!dir.path().join(BACKUP_FILE).exists());

        cache.insert(key(3), b"fresh".to_vec());
        assert_eq!(cache.flush_pending().unwrap(), 2);
        assert!(dir.path().join(CACHE_FILE).exists());
    }

    /// Writes `budget` bytes to the file, then reports a full disk.
    struct ShortWrite<'a> {
        file: &'a File,
        budget: usize,
    }

    impl Write for ShortWrite<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::from(io::ErrorKind::StorageFull));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            let mut file = self.file;
            file.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_append_leaves_no_partial_record() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        drop(populated(dir.path()));
        let path = dir.path().join(CACHE_FILE);
        let before = fs::metadata(&path).unwrap().len();

        let data = b"bytecode-three";
        let data_hash = Hash128::of(data);
        let mut records = Vec::new();
        encode_record(&mut records, FLAG_BLOB, &data_hash, data);
        encode_record(&mut records, FLAG_REFERENCE, &key(3), data_hash.as_bytes());

        let file = OpenOptions::new().append(true).open(&path).unwrap();
        let short = ShortWrite {
            file: &file,
            budget: HEADER_LEN + 3,
        };
        let err = append_records(&file, short, &records).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);
        assert_eq!(fs::metadata(&path).unwrap().len(), before);

        append_records(&file, &file, &records).unwrap();
        drop(file);

        let cache = CompileCache::in_memory();
        let report = cache.load_from_disk(&path).unwrap();
        assert!(!report.corrupted);
        assert_eq!(report.entries, 3);
        assert_eq!(cache.lookup(&key(3)).unwrap().as_slice(), data);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn trailing_garbage_keeps_valid_prefix(
            tail in prop::collection::vec(any::<u8>(), 1..256)
        ) {
            let dir = tempfile::tempdir().unwrap();
            drop(populated(dir.path()));
            let path = dir.path().join(CACHE_FILE);
            let mut bytes = fs::read(&path).unwrap();
            bytes.extend_from_slice(&tail);
            fs::write(&path, &bytes).unwrap();

            let cache = CompileCache::in_memory();
            let report = cache.load_from_disk(&path).unwrap();
            prop_assert!(report.corrupted);
            prop_assert_eq!(report.entries, 2);
            let hit = cache.lookup(&key(2)).unwrap();
            prop_assert_eq!(hit.as_slice(), b"bytecode-two");
        }
    }
}
