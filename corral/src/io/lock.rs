//! Advisory, timeout-bounded exclusive locks over record paths.
//!
//! Two strategies with the same external contract:
//!
//! - **Native**: `flock`-style advisory locks via `fs2`. The OS releases the
//!   lock when the holder dies, so no staleness handling is needed during
//!   acquisition.
//! - **Marker**: lock-file-existence protocol for network filesystems where
//!   native advisory locks are unreliable. A crashed holder leaves the
//!   marker behind; acquisition clears markers older than the configured
//!   staleness threshold, and [`sweep_stale_locks`] does the same as an
//!   explicit operator operation.
//!
//! Acquisition polls at a fixed cadence until the timeout elapses. There is
//! no unbounded wait anywhere.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoordError, CoordResult};

/// Locking mechanism selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategy {
    Native,
    Marker,
}

/// Resolved lock parameters (from `[lock]` in the configuration).
#[derive(Debug, Clone)]
pub struct LockSettings {
    pub timeout: Duration,
    pub poll: Duration,
    pub stale_after: Duration,
    pub strategy: LockStrategy,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            poll: Duration::from_millis(50),
            stale_after: Duration::from_secs(600),
            strategy: LockStrategy::Native,
        }
    }
}

/// Owner metadata recorded next to (native) or inside (marker) the lock
/// file. Staleness decisions use `acquired_at`, not file mtime, so copying a
/// tree around does not resurrect locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockMeta {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

impl LockMeta {
    fn now() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }
}

/// Lock file path for a record: `record.json` -> `record.json.lock`.
pub fn lock_path_for(record_path: &Path) -> PathBuf {
    let mut name = record_path
        .file_name()
        .map_or_else(|| "record".into(), |n| n.to_os_string());
    name.push(".lock");
    record_path.with_file_name(name)
}

/// A held exclusive lock. Released explicitly or on drop; release is
/// idempotent.
#[derive(Debug)]
pub struct LockHandle {
    lock_path: PathBuf,
    strategy: LockStrategy,
    // Kept open to hold the native advisory lock.
    file: Option<File>,
    released: bool,
}

impl LockHandle {
    /// Release the lock. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.strategy {
            LockStrategy::Native => {
                if let Some(file) = self.file.take() {
                    if let Err(err) = fs2::FileExt::unlock(&file) {
                        warn!(path = %self.lock_path.display(), %err, "failed to unlock record lock");
                    }
                }
                // The lock file itself stays behind (unlinking it would race
                // concurrent acquirers holding the old inode); only the owner
                // metadata is cleared.
                let _ = fs::remove_file(meta_path(&self.lock_path));
            }
            LockStrategy::Marker => {
                if let Err(err) = fs::remove_file(&self.lock_path) {
                    if err.kind() != ErrorKind::NotFound {
                        warn!(path = %self.lock_path.display(), %err, "failed to remove lock marker");
                    }
                }
            }
        }
        debug!(path = %self.lock_path.display(), "lock released");
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquire an exclusive lock for `record_path`, polling until
/// `settings.timeout` elapses.
pub fn acquire(record_path: &Path, settings: &LockSettings) -> CoordResult<LockHandle> {
    let lock_path = lock_path_for(record_path);
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create lock directory {}", parent.display()))?;
    }

    let start = Instant::now();
    loop {
        let attempt = match settings.strategy {
            LockStrategy::Native => try_acquire_native(&lock_path)?,
            LockStrategy::Marker => try_acquire_marker(&lock_path, settings.stale_after)?,
        };
        if let Some(handle) = attempt {
            debug!(path = %lock_path.display(), waited_ms = start.elapsed().as_millis() as u64, "lock acquired");
            return Ok(handle);
        }
        if start.elapsed() >= settings.timeout {
            return Err(CoordError::LockTimeout {
                path: lock_path,
                waited_ms: start.elapsed().as_millis() as u64,
            });
        }
        std::thread::sleep(settings.poll.min(remaining(settings.timeout, start)));
    }
}

/// Acquire for a non-critical read. On timeout, logs a warning and returns
/// `None` so the caller may proceed lockless. Never used for writes.
pub fn acquire_fail_open(record_path: &Path, settings: &LockSettings) -> CoordResult<Option<LockHandle>> {
    match acquire(record_path, settings) {
        Ok(handle) => Ok(Some(handle)),
        Err(CoordError::LockTimeout { path, waited_ms }) => {
            warn!(path = %path.display(), waited_ms, "proceeding without lock (fail-open read)");
            Ok(None)
        }
        Err(other) => Err(other),
    }
}

fn remaining(timeout: Duration, start: Instant) -> Duration {
    timeout.saturating_sub(start.elapsed()).max(Duration::from_millis(1))
}

fn try_acquire_native(lock_path: &Path) -> CoordResult<Option<LockHandle>> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("open lock file {}", lock_path.display()))?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            write_meta_sidecar(lock_path);
            Ok(Some(LockHandle {
                lock_path: lock_path.to_path_buf(),
                strategy: LockStrategy::Native,
                file: Some(file),
                released: false,
            }))
        }
        Err(_) => Ok(None),
    }
}

fn try_acquire_marker(lock_path: &Path, stale_after: Duration) -> CoordResult<Option<LockHandle>> {
    match OpenOptions::new().write(true).create_new(true).open(lock_path) {
        Ok(file) => {
            let meta = LockMeta::now();
            let payload = serde_json::to_string(&meta).context("serialize lock metadata")?;
            std::io::Write::write_all(&mut &file, payload.as_bytes())
                .with_context(|| format!("write lock marker {}", lock_path.display()))?;
            Ok(Some(LockHandle {
                lock_path: lock_path.to_path_buf(),
                strategy: LockStrategy::Marker,
                file: None,
                released: false,
            }))
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            if lock_age(lock_path).is_some_and(|age| age > stale_after) {
                clear_stale_marker(lock_path, stale_after);
            }
            Ok(None)
        }
        Err(err) => Err(CoordError::Storage(
            anyhow::Error::new(err)
                .context(format!("create lock marker {}", lock_path.display())),
        )),
    }
}

static RETIRE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Retire a marker judged stale. The marker is renamed to a unique name
/// first and re-checked there: two clearers cannot both unlink (the loser's
/// rename finds nothing), and a fresh marker that replaced the stale one
/// between the age check and the rename is put back instead of deleted.
fn clear_stale_marker(lock_path: &Path, stale_after: Duration) {
    let mut name = lock_path
        .file_name()
        .map_or_else(|| "lock".into(), |n| n.to_os_string());
    name.push(format!(
        ".stale.{}.{}",
        std::process::id(),
        RETIRE_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let retired = lock_path.with_file_name(name);

    match fs::rename(lock_path, &retired) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return,
        Err(err) => {
            warn!(path = %lock_path.display(), %err, "failed to retire stale lock marker");
            return;
        }
    }
    if lock_age(&retired).is_some_and(|age| age > stale_after) {
        warn!(path = %lock_path.display(), "cleared stale lock marker");
        let _ = fs::remove_file(&retired);
        return;
    }
    // The retired marker was live after all; restore it without clobbering
    // an even newer one.
    match fs::hard_link(&retired, lock_path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            warn!(path = %lock_path.display(), "displaced a live lock marker while clearing");
        }
        Err(err) => {
            warn!(path = %lock_path.display(), %err, "failed to restore live lock marker");
        }
    }
    let _ = fs::remove_file(&retired);
}

fn meta_path(lock_path: &Path) -> PathBuf {
    let mut name = lock_path
        .file_name()
        .map_or_else(|| "lock".into(), |n| n.to_os_string());
    name.push(".meta");
    lock_path.with_file_name(name)
}

fn write_meta_sidecar(lock_path: &Path) {
    let meta = LockMeta::now();
    let Ok(payload) = serde_json::to_string(&meta) else {
        return;
    };
    // Best-effort: the sidecar only informs staleness sweeps and operators.
    if let Err(err) = fs::write(meta_path(lock_path), payload) {
        debug!(path = %lock_path.display(), %err, "failed to write lock metadata sidecar");
    }
}

/// Age of a lock, preferring the recorded acquisition timestamp and falling
/// back to file mtime when the metadata is unreadable.
fn lock_age(lock_path: &Path) -> Option<Duration> {
    let recorded = fs::read_to_string(lock_path)
        .ok()
        .and_then(|raw| serde_json::from_str::<LockMeta>(&raw).ok())
        .or_else(|| {
            fs::read_to_string(meta_path(lock_path))
                .ok()
                .and_then(|raw| serde_json::from_str::<LockMeta>(&raw).ok())
        });
    if let Some(meta) = recorded {
        let age = Utc::now().signed_duration_since(meta.acquired_at);
        return age.to_std().ok();
    }
    let modified = fs::metadata(lock_path).ok()?.modified().ok()?;
    modified.elapsed().ok()
}

/// Remove lock files (and metadata sidecars) older than `max_age` anywhere
/// under `root`. Explicit, operator-invoked recovery for holders that died
/// between rename and release; never run automatically.
pub fn sweep_stale_locks(root: &Path, max_age: Duration) -> CoordResult<Vec<PathBuf>> {
    let mut removed = Vec::new();
    sweep_dir(root, max_age, &mut removed)?;
    Ok(removed)
}

fn sweep_dir(dir: &Path, max_age: Duration, removed: &mut Vec<PathBuf>) -> CoordResult<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let entries =
        fs::read_dir(dir).with_context(|| format!("read lock sweep dir {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read dir entry in {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            sweep_dir(&path, max_age, removed)?;
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.ends_with(".lock") && !name.ends_with(".lock.meta") {
            continue;
        }
        if lock_age(&path).is_some_and(|age| age > max_age) {
            if name.ends_with(".lock") && is_actively_held(&path) {
                debug!(path = %path.display(), "keeping old lock still held by a live process");
                continue;
            }
            warn!(path = %path.display(), "removing stale lock");
            let _ = fs::remove_file(&path);
            removed.push(path);
        }
    }
    Ok(())
}

/// A native lock file whose advisory lock is still held belongs to a live
/// holder regardless of its recorded age; probe with a non-blocking
/// attempt. Marker files carry no advisory lock and always probe free, so
/// their recorded age stays the only criterion.
fn is_actively_held(lock_path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(lock_path) else {
        return false;
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            if let Err(err) = fs2::FileExt::unlock(&file) {
                debug!(path = %lock_path.display(), %err, "failed to release sweep probe lock");
            }
            false
        }
        Err(_) => true,
    }
}
