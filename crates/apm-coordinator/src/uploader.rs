//! Uploading completed execution logs.
//!
//! Each reaped instance that carries an execution-log id gets one detached
//! upload task. The uploader itself only knows how to move one file to the
//! remote endpoint; retry bookkeeping and the local-path fallback are driven
//! by the coordinator.

use agent_pm_coordinator_core::config::LogUploadConfig;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Uploads one log file per call to the configured HTTP endpoint.
#[derive(Debug, Clone)]
pub struct LogUploader {
    config: LogUploadConfig,
    coordinator_token: String,
    http: reqwest::Client,
}

impl LogUploader {
    pub fn new(config: LogUploadConfig, coordinator_token: String) -> Self {
        Self {
            config,
            coordinator_token,
            http: reqwest::Client::new(),
        }
    }

    /// Upload a log file, retrying with linear backoff.
    ///
    /// Returns `true` when the remote acknowledged with a 2xx status.
    /// Oversize and unreadable files return `false` immediately so the
    /// caller can fall back to local-path registration.
    pub async fn upload(
        &self,
        log_file_path: &Path,
        execution_log_id: &str,
        agent_id: &str,
        task_id: &str,
        project_id: &str,
    ) -> bool {
        let Some(endpoint) = self.config.endpoint.as_deref() else {
            return false;
        };

        let max_bytes = self.config.max_file_size_mb * 1024 * 1024;
        match tokio::fs::metadata(log_file_path).await {
            Ok(meta) if meta.len() > max_bytes => {
                warn!(
                    path = %log_file_path.display(),
                    size = meta.len(),
                    max = max_bytes,
                    "log exceeds upload size cap, skipping upload"
                );
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(path = %log_file_path.display(), error = %e, "cannot stat log file");
                return false;
            }
        }

        let body = match tokio::fs::read(log_file_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %log_file_path.display(), error = %e, "cannot read log file");
                return false;
            }
        };

        let url = format!(
            "{}/{}",
            endpoint.trim_end_matches('/'),
            execution_log_id
        );
        let attempts = self.config.retry_count.max(1);
        for attempt in 1..=attempts {
            let result = self
                .http
                .put(&url)
                .bearer_auth(&self.coordinator_token)
                .header("content-type", "text/plain; charset=utf-8")
                .header("x-agent-id", agent_id)
                .header("x-task-id", task_id)
                .header("x-project-id", project_id)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(execution_log_id, attempt, "log upload succeeded");
                    return true;
                }
                Ok(response) => {
                    warn!(
                        execution_log_id,
                        attempt,
                        status = %response.status(),
                        "log upload rejected"
                    );
                }
                Err(e) => {
                    warn!(execution_log_id, attempt, error = %e, "log upload failed");
                }
            }

            if attempt < attempts {
                let backoff = self.config.retry_delay_seconds * attempt as f64;
                tokio::time::sleep(Duration::from_secs_f64(backoff.max(0.0))).await;
            }
        }
        false
    }
}
