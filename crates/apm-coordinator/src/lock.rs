//! Single-instance lock.
//!
//! Two coordinators running against the same configuration would race every
//! invariant the registry maintains, so startup takes an exclusive-create
//! lock file keyed on the configuration path. The file records the owning
//! PID; a file left behind by a dead process is reclaimed.

use agent_pm_coordinator_core::home;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum LockError {
    #[error(
        "another coordinator is already running for this configuration \
         (pid {pid}, lock file {path})"
    )]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("failed to acquire coordinator lock at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not resolve a lock directory: {0}")]
    NoLockDir(String),
}

/// JSON payload stored in the lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockPayload {
    pid: u32,
}

/// Holds the lock for the lifetime of `run()`; released on drop and on every
/// exit path.
#[derive(Debug)]
pub struct CoordinatorLock {
    path: PathBuf,
    held: bool,
}

/// Compute the lock file path for a configuration identity.
///
/// The name combines a readable sanitized stem with a digest prefix so
/// distinct identities never collide:
/// `<data_dir>/agent-pm-coordinator/locks/<stem>-<digest8>.lock`.
pub fn lock_path_for(identity: &str) -> Result<PathBuf, LockError> {
    let data_dir = home::get_data_dir().map_err(|e| LockError::NoLockDir(e.to_string()))?;
    let digest = Sha256::digest(identity.as_bytes());
    let digest_hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    Ok(data_dir
        .join("agent-pm-coordinator")
        .join("locks")
        .join(format!("{}-{}.lock", sanitize(identity), digest_hex)))
}

fn sanitize(identity: &str) -> String {
    let cleaned: String = identity
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '-',
        })
        .collect();
    let collapsed: String = cleaned
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let mut stem = collapsed;
    if stem.is_empty() {
        stem = "default".to_string();
    }
    stem.truncate(40);
    stem
}

impl CoordinatorLock {
    /// Acquire the lock for `identity` (the configuration path string, or
    /// `default`).
    ///
    /// # Errors
    ///
    /// [`LockError::AlreadyRunning`] when a live process holds the lock,
    /// the one fatal startup condition (coordinator exit code 1).
    pub fn acquire(identity: &str) -> Result<Self, LockError> {
        let path = lock_path_for(identity)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }

        let payload = LockPayload {
            pid: std::process::id(),
        };
        let contents =
            serde_json::to_string(&payload).unwrap_or_else(|_| format!("{{\"pid\":{}}}", payload.pid));

        // Exclusive create; one retry after reclaiming a stale file.
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    if let Err(source) = file.write_all(contents.as_bytes()) {
                        let _ = std::fs::remove_file(&path);
                        return Err(LockError::Io { path, source });
                    }
                    info!(path = %path.display(), "acquired coordinator lock");
                    return Ok(Self { path, held: true });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(pid) = live_lock_pid(&path) {
                        return Err(LockError::AlreadyRunning { pid, path });
                    }
                    // Stale or malformed lock from a dead process.
                    debug!(path = %path.display(), "reclaiming stale lock file");
                    let _ = std::fs::remove_file(&path);
                }
                Err(source) => return Err(LockError::Io { path, source }),
            }
        }

        // Lost the reclaim race to another starting coordinator.
        Err(LockError::AlreadyRunning { pid: 0, path })
    }

    /// Release the lock. Safe to call more than once; also runs on drop.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "released coordinator lock"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove lock file"),
        }
    }
}

impl Drop for CoordinatorLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// The PID recorded in an existing lock file, if that process is alive.
/// Malformed files read as stale.
fn live_lock_pid(path: &std::path::Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    let payload: LockPayload = serde_json::from_str(&contents).ok()?;
    is_pid_alive(payload.pid).then_some(payload.pid)
}

#[cfg(unix)]
fn is_pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 only checks existence; nothing is delivered.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Without a portable liveness check, an existing lock is assumed live;
/// stale files there need manual cleanup rather than risking a steal.
#[cfg(not(unix))]
fn is_pid_alive(_pid: u32) -> bool {
    true
}
