//! Disk tier: one JSON file per key, written by a dedicated I/O thread.
//!
//! Each key maps to `<dir>/<sha256(key)>.json` holding
//! `{key, value, created_at, ttl_ms}`. Callers never touch the filesystem
//! directly. Operations are queued to a worker thread and replies are
//! awaited with a timeout. Any timeout, write failure, or dead worker flips
//! the tier into degraded mode, after which every operation is a no-op and
//! the owning cache behaves as memory-only.
//!
//! Multiple processes sharing one directory is not supported.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::memory::is_expired;

/// Sweeps walk the whole directory, so they get a longer leash than
/// single-file operations before the caller gives up waiting.
const SWEEP_TIMEOUT_FACTOR: u32 = 20;

/// On-disk record layout.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DiskRecord<V> {
    pub key: String,
    pub value: V,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: Option<u64>,
}

impl<V> DiskRecord<V> {
    pub(crate) fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

/// The value-independent part of a record, enough to decide expiry.
#[derive(Debug, Deserialize)]
struct DiskHeader {
    key: String,
    created_at: DateTime<Utc>,
    ttl_ms: Option<u64>,
}

enum DiskOp {
    Write { file: String, bytes: Vec<u8> },
    Read { file: String, reply: Sender<Option<Vec<u8>>> },
    Remove { file: String },
    Clear { reply: Sender<usize> },
    Sweep { reply: Sender<Vec<String>> },
    Flush { reply: Sender<()> },
    #[cfg(test)]
    Stall(Duration),
}

/// Handle to the on-disk tier.
#[derive(Debug)]
pub struct DiskTier {
    dir: PathBuf,
    tx: Option<Sender<DiskOp>>,
    worker: Option<JoinHandle<()>>,
    degraded: Arc<AtomicBool>,
    timeout: Duration,
}

impl DiskTier {
    /// Open (creating if needed) a disk tier rooted at `dir`.
    ///
    /// Never fails: a directory that cannot be created or a worker that
    /// cannot be spawned yields a tier that starts out degraded.
    pub fn open(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        let dir = dir.into();
        let degraded = Arc::new(AtomicBool::new(false));
        let mut tier = Self {
            dir: dir.clone(),
            tx: None,
            worker: None,
            degraded: degraded.clone(),
            timeout,
        };

        if let Err(e) = std::fs::create_dir_all(&dir) {
            tier.degrade(&format!("cannot create {}: {}", dir.display(), e));
            return tier;
        }

        let (tx, rx) = mpsc::channel();
        let worker_dir = dir.clone();
        let spawned = std::thread::Builder::new()
            .name("mnemo-cache-io".to_string())
            .spawn(move || run_worker(worker_dir, rx, degraded));
        match spawned {
            Ok(handle) => {
                tier.tx = Some(tx);
                tier.worker = Some(handle);
                info!(dir = %dir.display(), "Disk cache tier opened");
            }
            Err(e) => tier.degrade(&format!("cannot spawn I/O worker: {e}")),
        }
        tier
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn degrade(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                dir = %self.dir.display(),
                reason,
                "Disk cache tier degraded; continuing memory-only"
            );
        }
    }

    /// Queue an operation. Returns false if the tier is degraded or the
    /// worker is gone.
    fn send(&self, op: DiskOp) -> bool {
        if self.is_degraded() {
            return false;
        }
        let Some(tx) = &self.tx else {
            return false;
        };
        if tx.send(op).is_err() {
            self.degrade("I/O worker is not running");
            return false;
        }
        true
    }

    fn await_reply<T>(&self, rx: Receiver<T>, timeout: Duration, what: &str) -> Option<T> {
        match rx.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout) => {
                self.degrade(&format!("{what} timed out after {timeout:?}"));
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.degrade("I/O worker is not running");
                None
            }
        }
    }

    /// Queue a write of pre-serialized record bytes. Fire-and-forget.
    pub fn write(&self, key: &str, bytes: Vec<u8>) {
        self.send(DiskOp::Write {
            file: file_name(key),
            bytes,
        });
    }

    /// Raw record bytes for `key`, or `None` on miss, error, or timeout.
    pub fn read(&self, key: &str) -> Option<Vec<u8>> {
        let (reply, rx) = mpsc::channel();
        if !self.send(DiskOp::Read {
            file: file_name(key),
            reply,
        }) {
            return None;
        }
        self.await_reply(rx, self.timeout, "read").flatten()
    }

    pub fn remove(&self, key: &str) {
        self.send(DiskOp::Remove {
            file: file_name(key),
        });
    }

    /// Remove every record file. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let (reply, rx) = mpsc::channel();
        if !self.send(DiskOp::Clear { reply }) {
            return 0;
        }
        self.await_reply(rx, self.timeout * SWEEP_TIMEOUT_FACTOR, "clear")
            .unwrap_or(0)
    }

    /// Remove expired and corrupt record files. Returns the keys of the
    /// expired records removed.
    pub fn sweep(&self) -> Vec<String> {
        let (reply, rx) = mpsc::channel();
        if !self.send(DiskOp::Sweep { reply }) {
            return Vec::new();
        }
        self.await_reply(rx, self.timeout * SWEEP_TIMEOUT_FACTOR, "sweep")
            .unwrap_or_default()
    }

    /// Wait until every queued operation has been executed. Returns false
    /// if the tier is (or becomes) degraded.
    pub fn flush(&self) -> bool {
        let (reply, rx) = mpsc::channel();
        if !self.send(DiskOp::Flush { reply }) {
            return false;
        }
        self.await_reply(rx, self.timeout, "flush").is_some()
    }

    #[cfg(test)]
    fn stall(&self, duration: Duration) {
        self.send(DiskOp::Stall(duration));
    }
}

impl Drop for DiskTier {
    fn drop(&mut self) {
        // Give queued writes a bounded chance to land. A worker that does
        // not answer in time is left detached rather than joined.
        let flushed = self.flush();
        self.tx = None;
        if let Some(handle) = self.worker.take() {
            if flushed {
                let _ = handle.join();
            }
        }
    }
}

/// `<sha256(key)>.json`
pub fn file_name(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{}.json", hex::encode(digest))
}

fn is_record_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

fn run_worker(dir: PathBuf, rx: Receiver<DiskOp>, degraded: Arc<AtomicBool>) {
    for op in rx {
        match op {
            DiskOp::Write { file, bytes } => {
                if let Err(e) = write_atomic(&dir.join(&file), &bytes) {
                    if !degraded.swap(true, Ordering::Relaxed) {
                        warn!(
                            dir = %dir.display(),
                            file = %file,
                            error = %e,
                            "Disk cache write failed; continuing memory-only"
                        );
                    }
                }
            }
            DiskOp::Read { file, reply } => {
                let path = dir.join(&file);
                let bytes = match std::fs::read(&path) {
                    Ok(bytes) => Some(bytes),
                    Err(e) if e.kind() == ErrorKind::NotFound => None,
                    Err(e) => {
                        debug!(file = %file, error = %e, "Unreadable cache file removed");
                        let _ = std::fs::remove_file(&path);
                        None
                    }
                };
                let _ = reply.send(bytes);
            }
            DiskOp::Remove { file } => {
                let _ = std::fs::remove_file(dir.join(file));
            }
            DiskOp::Clear { reply } => {
                let _ = reply.send(clear_dir(&dir));
            }
            DiskOp::Sweep { reply } => {
                let _ = reply.send(sweep_dir(&dir));
            }
            DiskOp::Flush { reply } => {
                let _ = reply.send(());
            }
            #[cfg(test)]
            DiskOp::Stall(duration) => std::thread::sleep(duration),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn record_files(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_record_file(p))
            .collect(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot list disk cache directory");
            Vec::new()
        }
    }
}

fn clear_dir(dir: &Path) -> usize {
    record_files(dir)
        .into_iter()
        .filter(|p| std::fs::remove_file(p).is_ok())
        .count()
}

fn sweep_dir(dir: &Path) -> Vec<String> {
    let now = Utc::now();
    let mut expired = Vec::new();
    for path in record_files(dir) {
        let header = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<DiskHeader>(&bytes).ok());
        match header {
            Some(h) => {
                let ttl = h.ttl_ms.map(Duration::from_millis);
                if is_expired(h.created_at, ttl, now) && std::fs::remove_file(&path).is_ok() {
                    expired.push(h.key);
                }
            }
            None => {
                debug!(file = %path.display(), "Corrupt cache file removed");
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn record_bytes(key: &str, value: &str, created_at: DateTime<Utc>, ttl_ms: Option<u64>) -> Vec<u8> {
        serde_json::to_vec(&DiskRecord {
            key: key.to_string(),
            value: value.to_string(),
            created_at,
            ttl_ms,
        })
        .unwrap()
    }

    #[test]
    fn test_file_name_is_stable_hex() {
        let name = file_name("alpha");
        assert_eq!(name, file_name("alpha"));
        assert_ne!(name, file_name("beta"));
        assert_eq!(name.len(), 64 + ".json".len());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path(), Duration::from_secs(2));
        tier.write("k", record_bytes("k", "v", Utc::now(), None));
        let bytes = tier.read("k").unwrap();
        let record: DiskRecord<String> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record.key, "k");
        assert_eq!(record.value, "v");
        assert!(dir.path().join(file_name("k")).exists());
        assert!(tier.read("missing").is_none());
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path(), Duration::from_secs(2));
        for key in ["a", "b", "c"] {
            tier.write(key, record_bytes(key, "v", Utc::now(), None));
        }
        tier.remove("a");
        assert!(tier.read("a").is_none());
        assert_eq!(tier.clear(), 2);
        assert!(tier.read("b").is_none());
    }

    #[test]
    fn test_sweep_removes_expired_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path(), Duration::from_secs(2));
        let old = Utc::now() - chrono::Duration::hours(1);
        tier.write("stale", record_bytes("stale", "v", old, Some(1_000)));
        tier.write("fresh", record_bytes("fresh", "v", Utc::now(), Some(3_600_000)));
        tier.write("corrupt", b"{ not json".to_vec());

        let expired = tier.sweep();
        assert_eq!(expired, vec!["stale".to_string()]);
        assert!(tier.read("fresh").is_some());
        assert!(tier.read("corrupt").is_none());
        assert!(!dir.path().join(file_name("corrupt")).exists());
    }

    #[test]
    fn test_unusable_directory_starts_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let tier = DiskTier::open(blocker.join("cache"), Duration::from_millis(100));
        assert!(tier.is_degraded());
        tier.write("k", b"{}".to_vec());
        assert!(tier.read("k").is_none());
        assert!(!tier.flush());
    }

    #[test]
    fn test_write_failure_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let tier = DiskTier::open(&cache_dir, Duration::from_secs(2));
        std::fs::remove_dir_all(&cache_dir).unwrap();
        std::fs::write(&cache_dir, b"now a file").unwrap();

        tier.write("k", record_bytes("k", "v", Utc::now(), None));
        // The flush reply comes after the failed write has been processed.
        tier.flush();
        assert!(tier.is_degraded());
    }

    #[test]
    fn test_read_timeout_degrades_without_hanging() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path(), Duration::from_millis(50));
        tier.stall(Duration::from_millis(500));

        let start = Instant::now();
        assert!(tier.read("k").is_none());
        assert!(start.elapsed() < Duration::from_millis(400));
        assert!(tier.is_degraded());
    }
}
