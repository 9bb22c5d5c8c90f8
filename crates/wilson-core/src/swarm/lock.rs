//! Cross-process advisory lock.
//!
//! A single coarse lock serializes every read-modify-write on the swarm
//! files. The lock is a file created with exclusive semantics containing the
//! owner's decimal pid; a dead owner is detected with a zero-signal probe
//! and the stale file reclaimed within one acquisition cycle.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::process::pid_alive;

const BACKOFF: Duration = Duration::from_millis(50);
const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out acquiring swarm lock at {0} after {1:?}")]
    Timeout(PathBuf, Duration),

    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct SwarmLock {
    path: PathBuf,
}

impl SwarmLock {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Spin with backoff until the lock is ours or the hard timeout expires.
    /// Timeout surfaces as an error; there is no silent override.
    pub async fn acquire(&self) -> Result<LockGuard, LockError> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    return Ok(LockGuard {
                        path: self.path.clone(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.reclaim_if_stale() {
                        continue;
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(LockError::Timeout(self.path.clone(), TIMEOUT));
            }
            tokio::time::sleep(BACKOFF).await;
        }
    }

    /// Probe the recorded owner; remove the file if the pid is gone.
    fn reclaim_if_stale(&self) -> bool {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            // Lost a race with the owner's release.
            return true;
        };
        let Ok(pid) = contents.trim().parse::<u32>() else {
            // Owner may still be mid-write; let the backoff retry.
            return false;
        };
        if pid_alive(pid) {
            return false;
        }
        tracing::warn!(pid, path = %self.path.display(), "reclaiming stale swarm lock");
        std::fs::remove_file(&self.path).is_ok()
    }
}

/// Held lock; releasing deletes the file.
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::error!(path = %self.path.display(), "failed to release swarm lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SwarmLock::new(dir.path().join("lock"));

        let guard = lock.acquire().await.unwrap();
        let recorded = std::fs::read_to_string(dir.path().join("lock")).unwrap();
        assert_eq!(recorded.trim(), std::process::id().to_string());

        drop(guard);
        assert!(!dir.path().join("lock").exists());
    }

    #[tokio::test]
    async fn sequential_acquires_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SwarmLock::new(dir.path().join("lock"));
        for _ in 0..3 {
            let guard = lock.acquire().await.unwrap();
            drop(guard);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        // A spawned-and-reaped child gives us a pid that is certainly dead.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, dead_pid.to_string()).unwrap();

        let lock = SwarmLock::new(path.clone());
        let start = std::time::Instant::now();
        let guard = lock.acquire().await.unwrap();
        // Reclaimed within one acquisition cycle, nowhere near the timeout.
        assert!(start.elapsed() < Duration::from_secs(1));

        drop(guard);
    }

    #[tokio::test(start_paused = true)]
    async fn live_owner_forces_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        // Our own pid is definitely alive.
        std::fs::write(&path, std::process::id().to_string()).unwrap();

        let lock = SwarmLock::new(path);
        let result = lock.acquire().await;
        assert!(matches!(result, Err(LockError::Timeout(..))));
    }
}
