//! Advisory cross-process locking for the results file.
//!
//! A sibling `{name}.lock` file is flocked rather than the data file itself,
//! so readers that do not participate in locking can still open the data.
//! The guard releases the OS lock when dropped. Exclusive holders leave a
//! `{name}.lock.info` sidecar naming the owning process, which helps debug a
//! stuck lock from another terminal.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock is held by another process: {0}")]
    Locked(String),

    #[error("Timed out waiting for lock: {0}")]
    Timeout(String),

    #[error("Failed to create lock file '{path}': {source}")]
    CreateFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to acquire lock '{path}': {source}")]
    AcquireFailed {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Holds an advisory lock until dropped.
#[derive(Debug)]
pub struct FileLockGuard {
    _file: File,
    lock_path: PathBuf,
    sidecar_path: Option<PathBuf>,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Some(sidecar) = &self.sidecar_path {
            let _ = std::fs::remove_file(sidecar);
        }
        // the flock itself is released when _file closes
    }
}

/// Lock file protecting `target`: a sibling named `{file_name}.lock`.
pub fn lock_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "results".to_string());
    target.with_file_name(format!("{name}.lock"))
}

/// Single non-blocking attempt at an exclusive lock.
pub fn try_lock_exclusive(target: &Path) -> Result<FileLockGuard, LockError> {
    attempt(target, LockMode::Exclusive)
}

/// Exclusive lock, polling until `timeout` elapses.
pub fn lock_exclusive_timeout(
    target: &Path,
    timeout: Duration,
) -> Result<FileLockGuard, LockError> {
    acquire_with_timeout(target, LockMode::Exclusive, timeout)
}

/// Shared lock, polling until `timeout` elapses.
pub fn lock_shared_timeout(target: &Path, timeout: Duration) -> Result<FileLockGuard, LockError> {
    acquire_with_timeout(target, LockMode::Shared, timeout)
}

fn acquire_with_timeout(
    target: &Path,
    mode: LockMode,
    timeout: Duration,
) -> Result<FileLockGuard, LockError> {
    let deadline = Instant::now() + timeout;
    loop {
        match attempt(target, mode) {
            Ok(guard) => return Ok(guard),
            Err(LockError::Locked(path)) => {
                if Instant::now() >= deadline {
                    return Err(LockError::Timeout(path));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(other) => return Err(other),
        }
    }
}

fn attempt(target: &Path, mode: LockMode) -> Result<FileLockGuard, LockError> {
    let lock_path = lock_path_for(target);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|source| LockError::CreateFailed {
            path: lock_path.display().to_string(),
            source,
        })?;
    let locked = match mode {
        LockMode::Exclusive => fs2::FileExt::try_lock_exclusive(&file),
        LockMode::Shared => fs2::FileExt::try_lock_shared(&file),
    };
    match locked {
        Ok(()) => {
            let sidecar_path = match mode {
                LockMode::Exclusive => write_owner_sidecar(&lock_path),
                LockMode::Shared => None,
            };
            debug!("Acquired {:?} lock: {}", mode, lock_path.display());
            Ok(FileLockGuard {
                _file: file,
                lock_path,
                sidecar_path,
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            Err(LockError::Locked(lock_path.display().to_string()))
        }
        Err(source) => Err(LockError::AcquireFailed {
            path: lock_path.display().to_string(),
            source,
        }),
    }
}

// Best effort: a lock without a sidecar is still a valid lock.
fn write_owner_sidecar(lock_path: &Path) -> Option<PathBuf> {
    let mut name = lock_path.file_name()?.to_os_string();
    name.push(".info");
    let sidecar = lock_path.with_file_name(name);
    let info = serde_json::json!({
        "pid": std::process::id(),
        "exe": std::env::current_exe()
            .ok()
            .map(|p| p.display().to_string()),
        "acquired": chrono::Utc::now().to_rfc3339(),
    });
    let mut file = File::create(&sidecar).ok()?;
    file.write_all(info.to_string().as_bytes()).ok()?;
    Some(sidecar)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_lock_blocks_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("results.yaml");
        let guard = try_lock_exclusive(&target).unwrap();
        assert!(guard.path().ends_with("results.yaml.lock"));
        match try_lock_exclusive(&target) {
            Err(LockError::Locked(_)) => {}
            other => panic!("expected Locked, got {other:?}"),
        }
        drop(guard);
        try_lock_exclusive(&target).unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("results.yaml");
        let a = lock_shared_timeout(&target, Duration::from_millis(100)).unwrap();
        let _b = lock_shared_timeout(&target, Duration::from_millis(100)).unwrap();
        drop(a);
    }

    #[test]
    fn waiting_for_a_held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("results.yaml");
        let _held = try_lock_exclusive(&target).unwrap();
        let started = Instant::now();
        match lock_exclusive_timeout(&target, Duration::from_millis(120)) {
            Err(LockError::Timeout(_)) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn sidecar_written_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("results.yaml");
        let sidecar = dir.path().join("results.yaml.lock.info");
        let guard = try_lock_exclusive(&target).unwrap();
        assert!(sidecar.exists());
        let content = std::fs::read_to_string(&sidecar).unwrap();
        assert!(content.contains("pid"));
        drop(guard);
        assert!(!sidecar.exists());
    }
}
