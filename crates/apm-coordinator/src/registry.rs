//! In-memory registry of running agent instances.
//!
//! The registry enforces the structural invariants only: at most one record
//! per key, insertion-order iteration for reaping, and the teardown sequence
//! that releases every resource a record owns exactly once. What to do with
//! an exited child is the control loop's business.

use chrono::{DateTime, Local};
use indexmap::IndexMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL during teardown.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// The unit of orchestration: one agent on one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub agent_id: String,
    pub project_id: String,
}

impl InstanceKey {
    pub fn new(agent_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            project_id: project_id.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.project_id)
    }
}

/// One running child process and everything it owns.
///
/// The log file handle is opened before the child starts so stdout/stderr
/// target it from the first byte, and stays open for the child's lifetime.
/// Temp files (MCP config, prompt) live exactly as long as the record.
#[derive(Debug)]
pub struct InstanceRecord {
    pub key: InstanceKey,
    pub child: Child,
    pub working_directory: PathBuf,
    pub provider: String,
    pub model: Option<String>,
    pub started_at: DateTime<Local>,
    pub log_file: Option<std::fs::File>,
    pub task_id: Option<String>,
    pub log_file_path: Option<PathBuf>,
    pub mcp_config_file: Option<PathBuf>,
    pub prompt_file: Option<PathBuf>,
    pub execution_log_id: Option<String>,
}

impl InstanceRecord {
    /// Close the log handle and unlink temp files. Idempotent: each resource
    /// is taken out of the record before it is released.
    pub fn release_resources(&mut self) {
        if let Some(handle) = self.log_file.take() {
            drop(handle);
        }
        for temp in [self.mcp_config_file.take(), self.prompt_file.take()]
            .into_iter()
            .flatten()
        {
            match std::fs::remove_file(&temp) {
                Ok(()) => debug!(path = %temp.display(), "removed temp file"),
                Err(e) => warn!(path = %temp.display(), error = %e, "failed to remove temp file"),
            }
        }
    }

    /// Send the child a graceful terminate signal (SIGTERM on Unix). The
    /// caller decides how long to wait before force-killing.
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: kill() with SIGTERM on a pid we spawned.
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if rc != 0 {
                    warn!(key = %self.key, pid, "failed to signal child");
                }
                return;
            }
        }
        // Already reaped, or no SIGTERM on this platform: fall back to kill.
        if let Err(e) = self.child.start_kill() {
            debug!(key = %self.key, error = %e, "start_kill failed (child likely exited)");
        }
    }

    /// Full teardown: terminate, wait up to [`TERMINATE_GRACE`], force-kill
    /// on timeout, then release owned resources.
    pub async fn teardown(mut self) {
        self.terminate();
        match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(key = %self.key, status = %status, "child terminated"),
            Ok(Err(e)) => warn!(key = %self.key, error = %e, "error waiting for child"),
            Err(_) => {
                warn!(key = %self.key, "child did not terminate in time, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(key = %self.key, error = %e, "failed to kill child");
                }
            }
        }
        self.release_resources();
    }
}

/// Map from key to running record, iterated in insertion order.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: IndexMap<InstanceKey, InstanceRecord>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn contains(&self, key: &InstanceKey) -> bool {
        self.instances.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &InstanceKey> {
        self.instances.keys()
    }

    /// Insert a record. Returns the record back unchanged when one is
    /// already running for the key, preserving the at-most-one invariant.
    pub fn insert(&mut self, record: InstanceRecord) -> Result<(), InstanceRecord> {
        if self.instances.contains_key(&record.key) {
            return Err(record);
        }
        self.instances.insert(record.key.clone(), record);
        Ok(())
    }

    pub fn remove(&mut self, key: &InstanceKey) -> Option<InstanceRecord> {
        // shift_remove keeps insertion order for the remaining records.
        self.instances.shift_remove(key)
    }

    /// Poll every child and take out those that have exited, in insertion
    /// order, paired with their exit codes (-1 when killed by a signal).
    pub fn take_exited(&mut self) -> Vec<(InstanceRecord, i32)> {
        let exited: Vec<(InstanceKey, i32)> = self
            .instances
            .iter_mut()
            .filter_map(|(key, record)| match record.child.try_wait() {
                Ok(Some(status)) => Some((key.clone(), status.code().unwrap_or(-1))),
                Ok(None) => None,
                Err(e) => {
                    warn!(%key, error = %e, "failed to poll child");
                    None
                }
            })
            .collect();

        exited
            .into_iter()
            .filter_map(|(key, code)| {
                self.instances
                    .shift_remove(&key)
                    .map(|record| (record, code))
            })
            .collect()
    }

    /// Drain every record for shutdown.
    pub fn drain(&mut self) -> Vec<InstanceRecord> {
        self.instances.drain(..).map(|(_, record)| record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::process::Command;

    fn test_record(key: InstanceKey, child: Child) -> InstanceRecord {
        InstanceRecord {
            key,
            child,
            working_directory: PathBuf::from("/tmp"),
            provider: "claude".to_string(),
            model: None,
            started_at: Local::now(),
            log_file: None,
            task_id: None,
            log_file_path: None,
            mcp_config_file: None,
            prompt_file: None,
            execution_log_id: None,
        }
    }

    fn spawn_sleep(seconds: u32) -> Child {
        Command::new("sleep")
            .arg(seconds.to_string())
            .spawn()
            .expect("sleep must spawn")
    }

    fn spawn_exit(code: i32) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(format!("exit {code}"))
            .spawn()
            .expect("sh must spawn")
    }

    #[tokio::test]
    async fn rejects_duplicate_keys() {
        let mut registry = InstanceRegistry::new();
        let key = InstanceKey::new("agt_a", "prj_1");
        registry
            .insert(test_record(key.clone(), spawn_sleep(30)))
            .unwrap();

        let rejected = registry.insert(test_record(key.clone(), spawn_sleep(30)));
        assert!(rejected.is_err());
        assert_eq!(registry.len(), 1);

        if let Err(rejected) = rejected {
            rejected.teardown().await;
        }
        registry.remove(&key).unwrap().teardown().await;
    }

    #[tokio::test]
    async fn take_exited_returns_codes_in_insertion_order() {
        let mut registry = InstanceRegistry::new();
        let first = InstanceKey::new("agt_a", "prj_1");
        let second = InstanceKey::new("agt_b", "prj_1");
        registry
            .insert(test_record(first.clone(), spawn_exit(0)))
            .unwrap();
        registry
            .insert(test_record(second.clone(), spawn_exit(3)))
            .unwrap();

        // Give both shells a moment to exit.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let exited = registry.take_exited();
        assert_eq!(exited.len(), 2);
        assert_eq!(exited[0].0.key, first);
        assert_eq!(exited[0].1, 0);
        assert_eq!(exited[1].0.key, second);
        assert_eq!(exited[1].1, 3);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn running_children_stay_registered() {
        let mut registry = InstanceRegistry::new();
        let key = InstanceKey::new("agt_a", "prj_1");
        registry
            .insert(test_record(key.clone(), spawn_sleep(30)))
            .unwrap();

        assert!(registry.take_exited().is_empty());
        assert!(registry.contains(&key));

        registry.remove(&key).unwrap().teardown().await;
    }

    #[tokio::test]
    async fn teardown_terminates_and_releases_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let mcp_path = dir.path().join("mcp_config.json");
        let prompt_path = dir.path().join("prompt.txt");
        std::fs::File::create(&mcp_path)
            .unwrap()
            .write_all(b"{}")
            .unwrap();
        std::fs::File::create(&prompt_path)
            .unwrap()
            .write_all(b"prompt")
            .unwrap();

        let mut record = test_record(InstanceKey::new("agt_a", "prj_1"), spawn_sleep(30));
        record.mcp_config_file = Some(mcp_path.clone());
        record.prompt_file = Some(prompt_path.clone());

        let start = std::time::Instant::now();
        record.teardown().await;

        // SIGTERM kills sleep immediately; the 5s grace must not be needed.
        assert!(start.elapsed() < TERMINATE_GRACE);
        assert!(!mcp_path.exists());
        assert!(!prompt_path.exists());
    }

    #[test]
    fn release_resources_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("mcp_config.json");
        std::fs::write(&temp, "{}").unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let mut record = test_record(InstanceKey::new("agt_a", "prj_1"), spawn_exit(0));
        record.mcp_config_file = Some(temp.clone());

        record.release_resources();
        assert!(!temp.exists());
        // A second call has nothing left to release and must not error.
        record.release_resources();
    }
}
