// # Advisory State Lock
//
// Exactly one run may write to a state store at a time. The file store
// links a fully written `<state>.lock` into place and records who holds it;
// the memory store keeps the same information in-process.
//
// ## Stale locks
//
// A process that crashes leaves its lock file behind. A lock whose
// `acquired_at` is older than the caller's `stale_after` is overridden with
// a warning. An unreadable lock file counts as held until its mtime is
// older than `stale_after`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::Error;

/// Who holds a lock, and since when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder: String,
    pub pid: u32,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

impl LockInfo {
    fn new(holder: &str) -> Self {
        Self {
            holder: holder.to_string(),
            pid: std::process::id(),
            acquired_at: chrono::Utc::now(),
        }
    }

    fn is_stale(&self, stale_after: Duration) -> bool {
        let max_age = chrono::Duration::from_std(stale_after)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        chrono::Utc::now().signed_duration_since(self.acquired_at) > max_age
    }

    fn locked_error(&self) -> Error {
        Error::StateLocked {
            holder: format!("{} (pid {})", self.holder, self.pid),
            since: self.acquired_at.to_rfc3339(),
        }
    }
}

pub(crate) type MemoryLockSlot = Arc<Mutex<Option<LockInfo>>>;

#[derive(Debug)]
enum Release {
    File(PathBuf),
    Memory(MemoryLockSlot),
}

/// Guard for the advisory lock; released on drop
#[derive(Debug)]
pub struct StateLock {
    info: LockInfo,
    release: Release,
}

impl StateLock {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        match &self.release {
            Release::File(path) => {
                // Only remove the file if it is still ours; a stale-lock
                // override by another process must not be undone here.
                let ours = std::fs::read_to_string(path)
                    .ok()
                    .and_then(|s| serde_json::from_str::<LockInfo>(&s).ok())
                    .is_some_and(|current| current == self.info);
                if ours {
                    if let Err(e) = std::fs::remove_file(path) {
                        tracing::warn!("Failed to release state lock {}: {}", path.display(), e);
                    }
                }
            }
            Release::Memory(slot) => {
                let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
                if guard.as_ref() == Some(&self.info) {
                    *guard = None;
                }
            }
        }
        tracing::debug!("State lock released by {}", self.info.holder);
    }
}

/// Acquire the lock file at `path`
///
/// The lock document is written to a private staging file and hard-linked
/// into place, so `path` never exists half-written and only one linker can
/// win.
pub(crate) async fn acquire_file(
    path: &Path,
    holder: &str,
    stale_after: Duration,
) -> Result<StateLock, Error> {
    let info = LockInfo::new(holder);
    let staged = private_path(path, "new");
    let written = write_staged(&staged, &info).await;
    let result = match written {
        Ok(()) => link_or_override(path, &staged, stale_after).await,
        Err(e) => Err(e),
    };
    remove_quietly(&staged).await;
    result?;

    tracing::debug!("State lock acquired: {}", path.display());
    Ok(StateLock {
        info,
        release: Release::File(path.to_path_buf()),
    })
}

/// A lock file found in place
struct ExistingLock {
    raw: String,
    info: Option<LockInfo>,
    modified: Option<SystemTime>,
}

impl ExistingLock {
    fn new(raw: String, modified: Option<SystemTime>) -> Self {
        let info = serde_json::from_str::<LockInfo>(&raw).ok();
        Self {
            raw,
            info,
            modified,
        }
    }

    /// A readable lock ages by `acquired_at`, an unreadable one by mtime
    fn is_stale(&self, stale_after: Duration) -> bool {
        match &self.info {
            Some(info) => info.is_stale(stale_after),
            None => self
                .modified
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age > stale_after),
        }
    }

    fn locked_error(&self) -> Error {
        match &self.info {
            Some(info) => info.locked_error(),
            None => Error::StateLocked {
                holder: "unknown holder (unreadable lock file)".to_string(),
                since: self
                    .modified
                    .map(|m| chrono::DateTime::<chrono::Utc>::from(m).to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string()),
            },
        }
    }

    fn describe(&self) -> String {
        match &self.info {
            Some(info) => format!("{} (pid {}) since {}", info.holder, info.pid, info.acquired_at),
            None => "an unreadable holder".to_string(),
        }
    }
}

async fn link_or_override(path: &Path, staged: &Path, stale_after: Duration) -> Result<(), Error> {
    // Each pass takes the lock, reports it held, or clears one stale lock
    for _ in 0..3 {
        match fs::hard_link(staged, path).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(Error::state_store(format!(
                    "Failed to create lock {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        let Some(existing) = read_existing(path).await? else {
            continue;
        };
        if !existing.is_stale(stale_after) {
            return Err(existing.locked_error());
        }
        tracing::warn!(
            "Overriding stale state lock {} held by {}",
            path.display(),
            existing.describe()
        );
        clear_stale(path, &existing).await?;
    }

    Err(Error::state_store(format!(
        "Lost the race for {} after overriding a stale lock",
        path.display()
    )))
}

async fn read_existing(path: &Path) -> Result<Option<ExistingLock>, Error> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::state_store(format!(
                "Failed to read lock {}: {}",
                path.display(),
                e
            )));
        }
    };
    let modified = fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok());
    Ok(Some(ExistingLock::new(raw, modified)))
}

/// Move the stale lock aside, unless another run replaced it meanwhile
///
/// The rename is atomic, so exactly one contender moves any given file. A
/// contender that finds it moved a lock other than the stale one it judged
/// links that lock back and reports it held.
async fn clear_stale(path: &Path, stale: &ExistingLock) -> Result<(), Error> {
    let aside = private_path(path, "stale");
    match fs::rename(path, &aside).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(Error::state_store(format!(
                "Failed to remove stale lock {}: {}",
                path.display(),
                e
            )));
        }
    }

    let moved = fs::read_to_string(&aside).await.unwrap_or_default();
    if moved != stale.raw {
        if let Err(e) = fs::hard_link(&aside, path).await {
            tracing::warn!("Failed to restore state lock {}: {}", path.display(), e);
        }
        remove_quietly(&aside).await;
        return Err(ExistingLock::new(moved, Some(SystemTime::now())).locked_error());
    }

    remove_quietly(&aside).await;
    Ok(())
}

async fn write_staged(staged: &Path, info: &LockInfo) -> Result<(), Error> {
    let json = serde_json::to_vec(info)?;
    let mut file = fs::File::create(staged).await.map_err(|e| {
        Error::state_store(format!("Failed to stage lock {}: {}", staged.display(), e))
    })?;
    file.write_all(&json).await.map_err(|e| {
        Error::state_store(format!("Failed to write lock {}: {}", staged.display(), e))
    })?;
    file.sync_all().await.map_err(|e| {
        Error::state_store(format!("Failed to sync lock {}: {}", staged.display(), e))
    })
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// `state.json.lock` -> `state.json.lock.<pid>.<n>.<tag>`, unique per call
fn private_path(path: &Path, tag: &str) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let mut name = path.as_os_str().to_owned();
    name.push(format!(
        ".{}.{}.{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed),
        tag
    ));
    PathBuf::from(name)
}

/// Acquire the in-process lock held in `slot`
pub(crate) fn acquire_memory(
    slot: &MemoryLockSlot,
    holder: &str,
    stale_after: Duration,
) -> Result<StateLock, Error> {
    let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(current) = guard.as_ref() {
        if !current.is_stale(stale_after) {
            return Err(current.locked_error());
        }
        tracing::warn!(
            "Overriding stale in-memory state lock held by {}",
            current.holder
        );
    }

    let info = LockInfo::new(holder);
    *guard = Some(info.clone());
    Ok(StateLock {
        info,
        release: Release::Memory(Arc::clone(slot)),
    })
}
