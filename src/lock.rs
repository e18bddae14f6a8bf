//! Cross-process mutual exclusion built on lock sidecar files.
//!
//! A lock is a small JSON file (`{holder_id, acquired_at}`) created next to
//! the file it protects with create-if-absent semantics. Whoever manages to
//! create the sidecar owns the lock until the sidecar is removed. A sidecar
//! older than the configured staleness threshold is presumed abandoned by a
//! crashed holder and may be reclaimed.
//!
//! Acquisition hands back a [`LockGuard`]; dropping the guard releases the
//! lock, so every exit path of the caller gives the lock back.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Extension used for lock sidecars (`<item_id>.json` -> `<item_id>.lock`).
pub const LOCK_EXTENSION: &str = "lock";

/// Upper bound on stale reclaims within a single acquisition attempt.
const STALE_RECLAIM_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockConfig {
    /// Total time to wait for a live lock before giving up.
    pub timeout: Duration,
    /// Sleep between acquisition attempts while a live lock is held.
    pub poll_interval: Duration,
    /// Age after which a sidecar is considered abandoned.
    pub stale_after: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            stale_after: Duration::from_secs(300),
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<(), LockError> {
        if self.timeout.is_zero() {
            return Err(LockError::InvalidConfig("timeout must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(LockError::InvalidConfig("poll_interval must be positive"));
        }
        if self.stale_after.is_zero() {
            return Err(LockError::InvalidConfig("stale_after must be positive"));
        }
        Ok(())
    }
}

/// Contents of a lock sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn new(holder_id: &str) -> Self {
        Self {
            holder_id: holder_id.to_string(),
            acquired_at: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {}", path.display())]
    Timeout { path: PathBuf, waited: Duration },
    #[error("invalid lock configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("io error on lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Sidecar path guarding `target`.
pub fn sidecar_path(target: &Path) -> PathBuf {
    target.with_extension(LOCK_EXTENSION)
}

/// Unique holder id: process id plus a random suffix, so two locks taken by
/// the same process are still distinguishable.
pub fn new_holder_id() -> String {
    format!("{}-{}", std::process::id(), Uuid::new_v4().simple())
}

/// Observed state of an existing sidecar.
#[derive(Debug, Clone)]
pub struct SidecarStatus {
    /// Parsed record; `None` when the sidecar is empty or half-written.
    pub record: Option<LockRecord>,
    pub age: Duration,
    pub stale: bool,
}

/// Inspect the sidecar at `path`. Returns `Ok(None)` if there is no sidecar.
///
/// The age comes from `acquired_at` when the record parses, otherwise from
/// the file's modification time.
pub fn inspect_sidecar(path: &Path, stale_after: Duration) -> io::Result<Option<SidecarStatus>> {
    let record = match read_record(path) {
        Ok(record) => record,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let age = match &record {
        Some(record) => record.age(),
        None => match fs::metadata(path) {
            Ok(meta) => meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .unwrap_or_default(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        },
    };
    Ok(Some(SidecarStatus {
        record,
        age,
        stale: age > stale_after,
    }))
}

fn read_record(path: &Path) -> io::Result<Option<LockRecord>> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw).ok())
}

/// A lock on one sidecar path.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    config: LockConfig,
    holder_id: String,
}

impl FileLock {
    pub fn new(sidecar: impl Into<PathBuf>, config: LockConfig) -> Self {
        Self {
            path: sidecar.into(),
            config,
            holder_id: new_holder_id(),
        }
    }

    /// Lock guarding `target` through its derived sidecar.
    pub fn for_target(target: &Path, config: LockConfig) -> Self {
        Self::new(sidecar_path(target), config)
    }

    pub fn with_holder(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Wait for the lock, polling every `poll_interval` until `timeout`.
    pub async fn acquire(&self) -> Result<LockGuard, LockError> {
        self.config.validate()?;
        let start = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            let waited = start.elapsed();
            if waited >= self.config.timeout {
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                    waited,
                });
            }
            let remaining = self.config.timeout - waited;
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }

    /// Single acquisition attempt. Stale sidecars are reclaimed on the spot;
    /// `Ok(None)` means a live holder owns the lock.
    pub fn try_acquire(&self) -> Result<Option<LockGuard>, LockError> {
        let mut reclaims = 0;
        loop {
            match self.create_sidecar() {
                Ok(record) => {
                    return Ok(Some(LockGuard {
                        path: self.path.clone(),
                        record,
                        released: false,
                    }))
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if reclaims >= STALE_RECLAIM_ATTEMPTS {
                        return Ok(None);
                    }
                    let status = inspect_sidecar(&self.path, self.config.stale_after)
                        .map_err(|e| LockError::io(&self.path, e))?;
                    match status {
                        // Released between our create and inspect: try again.
                        None => reclaims += 1,
                        Some(status) if status.stale => {
                            reclaims += 1;
                            reclaim(&self.path, &status)?;
                        }
                        Some(_) => return Ok(None),
                    }
                }
                Err(e) => return Err(LockError::io(&self.path, e)),
            }
        }
    }

    fn create_sidecar(&self) -> io::Result<LockRecord> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        let record = LockRecord::new(&self.holder_id);
        let body = serde_json::to_vec(&record).map_err(io::Error::other)?;
        if let Err(e) = file.write_all(&body).and_then(|_| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }
        Ok(record)
    }
}

/// Remove a stale sidecar, but only if it still holds the record judged
/// stale. A competing process may already have reclaimed it and written a
/// fresh record, which must survive.
///
/// The re-read and the `remove_file` are two steps, not one. If another
/// waiter reclaims the same stale sidecar and creates its own between them,
/// this call deletes the newcomer's fresh lock and two holders can overlap.
/// The window is a few syscalls wide and only opens once a holder has
/// already exceeded `stale_after`; closing it needs an atomic
/// compare-and-delete that plain files do not offer.
fn reclaim(path: &Path, status: &SidecarStatus) -> Result<(), LockError> {
    let current = match read_record(path) {
        Ok(record) => record,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(LockError::io(path, e)),
    };
    if current != status.record {
        return Ok(());
    }
    tracing::warn!(
        lock = %path.display(),
        holder = status.record.as_ref().map(|r| r.holder_id.as_str()).unwrap_or("unknown"),
        age_secs = status.age.as_secs_f64(),
        "reclaiming stale lock"
    );
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LockError::io(path, e)),
    }
}

/// Remove the sidecar at `path` if it is stale. Returns whether it was stale.
pub fn remove_if_stale(path: &Path, stale_after: Duration) -> Result<bool, LockError> {
    match inspect_sidecar(path, stale_after).map_err(|e| LockError::io(path, e))? {
        Some(status) if status.stale => {
            reclaim(path, &status)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Proof of lock ownership. Releases the sidecar on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    record: LockRecord,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Release explicitly, surfacing io errors that `Drop` can only log.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        release_sidecar(&self.path, &self.record.holder_id)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = release_sidecar(&self.path, &self.record.holder_id) {
            tracing::warn!(error = %e, "failed to release lock");
        }
    }
}

/// Delete the sidecar if `holder_id` still owns it. Missing sidecars and
/// sidecars now owned by someone else are left alone.
fn release_sidecar(path: &Path, holder_id: &str) -> Result<(), LockError> {
    match read_record(path) {
        Ok(Some(record)) if record.holder_id == holder_id => {}
        Ok(_) => {
            tracing::debug!(lock = %path.display(), "lock no longer ours; leaving it in place");
            return Ok(());
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(LockError::io(path, e)),
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LockError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_replaces_result_extension() {
        let p = sidecar_path(Path::new("/tmp/out/abc.json"));
        assert_eq!(p, PathBuf::from("/tmp/out/abc.lock"));
    }

    #[test]
    fn zero_durations_are_rejected() {
        let cfg = LockConfig {
            poll_interval: Duration::ZERO,
            ..LockConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(LockError::InvalidConfig(_))));
    }

    #[test]
    fn try_acquire_is_exclusive_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("item.lock");
        let first = FileLock::new(&path, LockConfig::default());
        let second = FileLock::new(&path, LockConfig::default());

        let guard = first.try_acquire().unwrap().unwrap();
        assert!(second.try_acquire().unwrap().is_none());

        guard.release().unwrap();
        assert!(!path.exists());
        assert!(second.try_acquire().unwrap().is_some());
    }

    #[test]
    fn reclaim_spares_a_sidecar_rewritten_since_inspection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("item.lock");
        let old = LockRecord {
            holder_id: "crashed".into(),
            acquired_at: Utc::now() - chrono::Duration::hours(1),
        };
        fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();
        let status = inspect_sidecar(&path, Duration::from_secs(60)).unwrap().unwrap();
        assert!(status.stale);

        // Another waiter reclaimed it first and now holds a fresh lock.
        fs::write(&path, serde_json::to_vec(&LockRecord::new("newcomer")).unwrap()).unwrap();
        reclaim(&path, &status).unwrap();
        assert_eq!(read_record(&path).unwrap().unwrap().holder_id, "newcomer");

        // Unchanged stale record is removed.
        fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();
        reclaim(&path, &status).unwrap();
        assert!(!path.exists());
    }
}
