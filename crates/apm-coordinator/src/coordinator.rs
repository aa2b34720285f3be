//! The polling control loop.
//!
//! One tick: check server health, fetch the project inventory, reap exited
//! children (in insertion order, running the full exit sequence per child),
//! then reconcile desired-vs-running for every `(agent, project)` pair the
//! inventory names. All shared state (registry, cooldown table, pending
//! uploads) is owned here and touched only between awaits of this loop;
//! detached upload tasks remove just their own pending entry.

use crate::cooldown::{CooldownKind, CooldownTable};
use crate::quota::QuotaErrorDetector;
use crate::registry::{InstanceKey, InstanceRegistry};
use crate::spawn::{self, SpawnRequest};
use crate::uploader::LogUploader;
use agent_pm_coordinator_core::config::CoordinatorConfig;
use agent_pm_coordinator_mcp::{AgentAction, McpClient, ProjectWithAgents};
use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Patterns (matched case-insensitively) that mark a log line as the error
/// worth reporting upstream.
const ERROR_PATTERNS: &[&str] = &[
    "[api error:",
    "error:",
    "quota",
    "rate limit",
    "exhausted",
    "unauthorized",
    "authentication failed",
];

/// How many trailing log lines are searched for an error line.
const ERROR_TAIL_LINES: usize = 50;

/// Extract the most recent error-looking line from a child's log tail.
pub fn extract_error_from_log(log_file_path: &Path) -> Option<String> {
    let contents = match std::fs::read_to_string(log_file_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %log_file_path.display(), error = %e, "failed to read log file");
            return None;
        }
    };
    let lines: Vec<&str> = contents.lines().collect();
    let tail = &lines[lines.len().saturating_sub(ERROR_TAIL_LINES)..];
    for line in tail.iter().rev() {
        let lower = line.to_ascii_lowercase();
        if ERROR_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
            return Some(line.trim().to_string());
        }
    }
    None
}

fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}

/// A point-in-time snapshot of the coordinator's supervision state.
#[derive(Debug, Clone)]
pub struct CoordinatorStatus {
    pub running: Vec<InstanceKey>,
    pub cooldowns: Vec<(InstanceKey, CooldownKind, f64)>,
    pub pending_uploads: usize,
}

/// Single orchestrator that manages all agent instances.
pub struct Coordinator {
    config: CoordinatorConfig,
    client: McpClient,
    registry: InstanceRegistry,
    cooldowns: Option<CooldownTable>,
    quota_detector: Option<QuotaErrorDetector>,
    uploader: Option<LogUploader>,
    /// At most one upload task per execution-log id; each task removes its
    /// own entry when it concludes.
    pending_uploads: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl Coordinator {
    /// Build a coordinator from a loaded configuration.
    ///
    /// # Errors
    ///
    /// Fails when no MCP connection is configured (possible only on Windows,
    /// where there is no default socket path).
    pub fn new(config: CoordinatorConfig) -> anyhow::Result<Self> {
        let connection = config
            .mcp_socket_path
            .clone()
            .context("mcp_socket_path is required; on Windows configure an HTTP URL")?;
        let client = McpClient::new(&connection, config.coordinator_token.clone());

        let uploader = (config.log_upload.enabled && config.log_upload.endpoint.is_some())
            .then(|| {
                info!(
                    endpoint = config.log_upload.endpoint.as_deref().unwrap_or_default(),
                    "log uploader enabled"
                );
                LogUploader::new(
                    config.log_upload.clone(),
                    config.coordinator_token.clone().unwrap_or_default(),
                )
            });

        let (cooldowns, quota_detector) = if config.error_protection.enabled {
            let protection = &config.error_protection;
            info!(
                default_cooldown_seconds = protection.default_cooldown_seconds,
                max_cooldown_seconds = protection.max_cooldown_seconds,
                quota_detection = protection.quota_detection_enabled,
                "error protection enabled"
            );
            (
                Some(CooldownTable::new(
                    protection.default_cooldown_seconds,
                    protection.max_cooldown_seconds,
                )),
                protection.quota_detection_enabled.then(|| {
                    QuotaErrorDetector::new(
                        protection.max_cooldown_seconds,
                        protection.quota_margin_percent,
                    )
                }),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            config,
            client,
            registry: InstanceRegistry::new(),
            cooldowns,
            quota_detector,
            uploader,
            pending_uploads: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Snapshot the running instances, active cooldowns, and pending uploads.
    pub fn status(&self) -> CoordinatorStatus {
        let cooldowns = self
            .cooldowns
            .as_ref()
            .map(|table| {
                table
                    .active()
                    .map(|(key, entry)| {
                        (key.clone(), entry.kind, table.remaining_seconds(key))
                    })
                    .collect()
            })
            .unwrap_or_default();
        CoordinatorStatus {
            running: self.registry.keys().cloned().collect(),
            cooldowns,
            pending_uploads: self.pending_uploads.lock().unwrap().len(),
        }
    }

    /// Run the polling loop until `cancel` fires, then tear everything down.
    ///
    /// Ticks never overlap: a tick runs to completion before the next timer
    /// firing is observed, and missed firings are skipped rather than
    /// bursted.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            polling_interval = self.config.polling_interval,
            max_concurrent = self.config.max_concurrent,
            "starting coordinator"
        );
        info!(
            agents = ?self.config.agents.keys().collect::<Vec<_>>(),
            "configured agents"
        );
        if let Some(root) = &self.config.root_agent_id {
            info!(root_agent_id = %root, "multi-device mode");
        }

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.polling_interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }

        self.shutdown_all().await;
    }

    /// One polling tick: health, inventory, reap, reconcile.
    ///
    /// Transport failures in the health or inventory steps abort the tick;
    /// per-key failures during reconcile are logged and that key is skipped.
    pub async fn run_once(&mut self) {
        let health = match self.client.health_check().await {
            Ok(health) => health,
            Err(e) => {
                error!(error = %e, "MCP server not available");
                return;
            }
        };
        if !health.is_ok() {
            warn!(status = %health.status, "MCP server unhealthy, skipping tick");
            return;
        }

        let projects = match self
            .client
            .list_active_projects_with_agents(self.config.root_agent_id.as_deref())
            .await
        {
            Ok(projects) => projects,
            Err(e) => {
                error!(error = %e, "failed to list active projects");
                return;
            }
        };
        debug!(count = projects.len(), "found active projects");

        self.reap_finished().await;
        self.reconcile(projects).await;
    }

    /// Run the exit sequence for every child that has finished:
    /// release resources, register the log path, report an extracted error,
    /// invalidate the session, update cooldowns, detach the upload.
    async fn reap_finished(&mut self) {
        for (mut record, exit_code) in self.registry.take_exited() {
            let key = record.key.clone();
            info!(%key, exit_code, "agent instance finished");

            record.release_resources();

            if let (Some(task_id), Some(log_path)) =
                (record.task_id.clone(), record.log_file_path.clone())
            {
                match self
                    .client
                    .register_execution_log_file(
                        &key.agent_id,
                        &task_id,
                        &log_path.display().to_string(),
                    )
                    .await
                {
                    Ok(true) => info!(%key, path = %log_path.display(), "registered log file"),
                    Ok(false) => warn!(%key, "failed to register log file"),
                    Err(e) => error!(%key, error = %e, "error registering log file"),
                }
            }

            // Extracted once; also the cooldown reason below.
            let error_line = (exit_code != 0)
                .then(|| record.log_file_path.as_deref().and_then(extract_error_from_log))
                .flatten();

            if let Some(error_line) = &error_line {
                match self
                    .client
                    .report_agent_error(&key.agent_id, &key.project_id, error_line)
                    .await
                {
                    Ok(true) => {
                        info!(%key, error_line = %preview(error_line), "reported agent error");
                    }
                    Ok(false) => warn!(%key, "failed to report agent error"),
                    Err(e) => error!(%key, error = %e, "error reporting agent error"),
                }
            }

            match self
                .client
                .invalidate_session(&key.agent_id, &key.project_id)
                .await
            {
                Ok(true) => info!(%key, "invalidated session"),
                Ok(false) => warn!(%key, "failed to invalidate session"),
                Err(e) => error!(%key, error = %e, "error invalidating session"),
            }

            if let Some(cooldowns) = &mut self.cooldowns {
                if exit_code == 0 {
                    cooldowns.clear(&key);
                } else {
                    let error_line = error_line.clone();
                    let quota_wait = match (&self.quota_detector, record.log_file_path.as_deref())
                    {
                        (Some(detector), Some(path)) => detector.detect_from_file(path),
                        _ => None,
                    };
                    match quota_wait {
                        Some(seconds) => {
                            warn!(%key, seconds, "quota exhaustion detected, cooling down");
                            cooldowns.set_quota(
                                key.clone(),
                                seconds,
                                error_line
                                    .unwrap_or_else(|| format!("Quota error (exit code {exit_code})")),
                            );
                        }
                        None => {
                            warn!(%key, exit_code, "error exit, cooling down");
                            cooldowns.set_error(
                                key.clone(),
                                error_line.unwrap_or_else(|| {
                                    format!("Process exited with code {exit_code}")
                                }),
                            );
                        }
                    }
                }
            }

            if self.uploader.is_some()
                && let (Some(execution_log_id), Some(log_path), Some(task_id)) = (
                    record.execution_log_id.clone(),
                    record.log_file_path.clone(),
                    record.task_id.clone(),
                )
            {
                self.schedule_upload(&key, execution_log_id, log_path, task_id);
            }
        }
    }

    /// Reconcile desired state against the registry for every pair in the
    /// inventory.
    async fn reconcile(&mut self, projects: Vec<ProjectWithAgents>) {
        for project in projects {
            debug!(
                project_id = %project.project_id,
                agents = ?project.agents,
                "processing project"
            );
            for agent_id in &project.agents {
                let key = InstanceKey::new(agent_id.clone(), project.project_id.clone());

                let Some(passkey) = self.config.agent_passkey(agent_id).map(str::to_string)
                else {
                    debug!(%key, "no passkey configured, skipping");
                    continue;
                };

                if let Some(cooldowns) = &mut self.cooldowns
                    && cooldowns.check(&key).is_some()
                {
                    let remaining = cooldowns.remaining_seconds(&key);
                    debug!(%key, remaining = format!("{remaining:.0}s"), "in cooldown, skipping");
                    continue;
                }

                // A running instance is only ever checked for a stop action.
                if self.registry.contains(&key) {
                    match self
                        .client
                        .get_agent_action(&key.agent_id, &key.project_id)
                        .await
                    {
                        Ok(decision) if decision.action == AgentAction::Stop => {
                            info!(%key, reason = ?decision.reason, "stop action received");
                            self.stop_instance(&key).await;
                        }
                        Ok(_) => {}
                        Err(e) => error!(%key, error = %e, "failed to check stop action"),
                    }
                    continue;
                }

                if self.registry.len() >= self.config.max_concurrent {
                    debug!(
                        max_concurrent = self.config.max_concurrent,
                        "concurrency cap reached, deferring remaining agents"
                    );
                    break;
                }

                match self
                    .client
                    .get_agent_action(&key.agent_id, &key.project_id)
                    .await
                {
                    Ok(decision) if decision.action == AgentAction::Start => {
                        let provider = decision
                            .provider
                            .clone()
                            .unwrap_or_else(|| "claude".to_string());
                        let request = SpawnRequest {
                            agent_id: key.agent_id.clone(),
                            project_id: key.project_id.clone(),
                            passkey,
                            working_dir: project.working_directory.clone(),
                            provider,
                            model: decision.model,
                            kick_command: decision.kick_command,
                            task_id: decision.task_id,
                            execution_log_id: decision.execution_log_id,
                        };
                        match spawn::spawn_instance(&self.config, request) {
                            Ok(record) => {
                                if let Err(duplicate) = self.registry.insert(record) {
                                    warn!(key = %duplicate.key, "instance already registered");
                                    duplicate.teardown().await;
                                }
                            }
                            // No cooldown for spawn failures: cooldowns track
                            // child exits, and the next tick retries.
                            Err(e) => error!(%key, error = %e, "failed to spawn instance"),
                        }
                    }
                    Ok(decision) => {
                        debug!(
                            %key,
                            action = ?decision.action,
                            reason = ?decision.reason,
                            "no start"
                        );
                    }
                    Err(e) => error!(%key, error = %e, "failed to get agent action"),
                }
            }
        }
    }

    /// Stop and remove one running instance.
    async fn stop_instance(&mut self, key: &InstanceKey) {
        let Some(record) = self.registry.remove(key) else {
            warn!(%key, "instance not found in registry");
            return;
        };
        record.teardown().await;
        info!(%key, "instance stopped and removed");
    }

    /// Detach an upload task for a reaped instance's log.
    ///
    /// On upload success the local file is deleted; on permanent failure the
    /// local path is registered with the server instead. The pending map
    /// guarantees at most one task per execution-log id.
    fn schedule_upload(
        &self,
        key: &InstanceKey,
        execution_log_id: String,
        log_file_path: PathBuf,
        task_id: String,
    ) {
        let Some(uploader) = self.uploader.clone() else {
            return;
        };
        let client = self.client.clone();
        let agent_id = key.agent_id.clone();
        let project_id = key.project_id.clone();

        let mut pending = self.pending_uploads.lock().unwrap();
        if pending.contains_key(&execution_log_id) {
            warn!(execution_log_id = %execution_log_id, "upload already pending, not scheduling another");
            return;
        }

        let id_for_task = execution_log_id.clone();
        let pending_for_task = Arc::clone(&self.pending_uploads);
        let handle = tokio::spawn(async move {
            let uploaded = uploader
                .upload(&log_file_path, &id_for_task, &agent_id, &task_id, &project_id)
                .await;

            if uploaded {
                match tokio::fs::remove_file(&log_file_path).await {
                    Ok(()) => {
                        info!(execution_log_id = %id_for_task, "log uploaded, local file deleted");
                    }
                    Err(e) => {
                        warn!(
                            execution_log_id = %id_for_task,
                            error = %e,
                            "log uploaded but local file could not be deleted"
                        );
                    }
                }
            } else {
                warn!(
                    execution_log_id = %id_for_task,
                    "log upload failed, registering local path"
                );
                if let Err(e) = client
                    .register_execution_log_file(
                        &agent_id,
                        &task_id,
                        &log_file_path.display().to_string(),
                    )
                    .await
                {
                    error!(
                        execution_log_id = %id_for_task,
                        error = %e,
                        "failed to register local log path"
                    );
                }
            }

            pending_for_task.lock().unwrap().remove(&id_for_task);
        });
        pending.insert(execution_log_id, handle);
    }

    /// Terminate every running instance. In-flight uploads are abandoned.
    async fn shutdown_all(&mut self) {
        let records = self.registry.drain();
        if !records.is_empty() {
            info!(count = records.len(), "terminating running instances");
        }
        for record in records {
            info!(key = %record.key, "terminating instance");
            record.teardown().await;
        }
    }
}
