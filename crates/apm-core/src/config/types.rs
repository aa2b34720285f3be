//! Configuration types.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Complete coordinator configuration.
///
/// The coordinator is a single orchestrator that polls the task-management
/// server for active projects and their assigned agents, asks the server for
/// a per-pair action, and spawns or stops agent instances accordingly. One
/// configuration file describes everything it may launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Seconds between polling ticks. Must be positive.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,

    /// Cap on concurrently running agent instances. Must be positive.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Unix socket path or HTTP URL of the task-management server.
    /// Filled with the platform default when absent; tilde-expanded for
    /// socket paths.
    #[serde(default)]
    pub mcp_socket_path: Option<String>,

    /// Bearer token authorizing coordinator-only server calls.
    /// `${VAR}` values are expanded from the environment; when absent the
    /// `MCP_COORDINATOR_TOKEN` environment variable is consulted.
    #[serde(default)]
    pub coordinator_token: Option<String>,

    /// How to launch each AI provider. A default `claude` entry is injected
    /// when missing.
    #[serde(default)]
    pub ai_providers: BTreeMap<String, ProviderSpec>,

    /// Credentials for the agents this coordinator may launch.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentCredential>,

    /// Root directory for the coordinator's own logs.
    #[serde(default)]
    pub log_directory: Option<String>,

    /// Pass the provider-specific debug/verbose flag to each child.
    #[serde(default = "default_true")]
    pub debug_mode: bool,

    /// Multi-device: forwarded to `list_active_projects_with_agents` so the
    /// server resolves working directories for this device.
    #[serde(default)]
    pub root_agent_id: Option<String>,

    /// Log upload pipeline settings.
    #[serde(default)]
    pub log_upload: LogUploadConfig,

    /// Cooldown and quota-detection tuning.
    #[serde(default)]
    pub error_protection: ErrorProtectionConfig,

    /// Path the configuration was loaded from. Used as the single-instance
    /// lock identity; not part of the file format.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            polling_interval: default_polling_interval(),
            max_concurrent: default_max_concurrent(),
            mcp_socket_path: None,
            coordinator_token: None,
            ai_providers: BTreeMap::new(),
            agents: BTreeMap::new(),
            log_directory: None,
            debug_mode: true,
            root_agent_id: None,
            log_upload: LogUploadConfig::default(),
            error_protection: ErrorProtectionConfig::default(),
            config_path: None,
        }
    }
}

impl CoordinatorConfig {
    /// Look up a provider spec, falling back to the `claude` default.
    pub fn provider(&self, name: &str) -> ProviderSpec {
        self.ai_providers
            .get(name)
            .or_else(|| self.ai_providers.get("claude"))
            .cloned()
            .unwrap_or_else(ProviderSpec::default_claude)
    }

    /// Passkey for an agent, if one is configured.
    pub fn agent_passkey(&self, agent_id: &str) -> Option<&str> {
        self.agents.get(agent_id).map(|a| a.passkey.as_str())
    }

    /// The lock identity: the configuration path string, or `default`.
    pub fn lock_identity(&self) -> String {
        self.config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "default".to_string())
    }
}

/// How to launch one AI provider's CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Executable name or path.
    pub cli_command: String,
    /// Arguments always passed before the coordinator's own flags.
    /// Accepts either a YAML list or a whitespace-separated string.
    #[serde(default, deserialize_with = "args_list_or_string")]
    pub cli_args: Vec<String>,
}

impl ProviderSpec {
    /// The built-in `claude` spec used when no provider table entry matches.
    pub fn default_claude() -> Self {
        Self {
            cli_command: "claude".to_string(),
            cli_args: vec!["--dangerously-skip-permissions".to_string()],
        }
    }
}

/// Credentials for one agent. The passkey is opaque to the coordinator and
/// reaches the child only through its environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCredential {
    pub passkey: String,
}

/// Log uploader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogUploadConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Remote ingestion endpoint. Required when enabled.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Files larger than this skip upload and fall back to path registration.
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: f64,
}

impl Default for LogUploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            max_file_size_mb: default_max_file_size_mb(),
            retry_count: default_retry_count(),
            retry_delay_seconds: default_retry_delay_seconds(),
        }
    }
}

/// Cooldown and quota-detection tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorProtectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cooldown applied after an error exit.
    #[serde(default = "default_cooldown_seconds")]
    pub default_cooldown_seconds: u64,
    /// Upper bound on any cooldown, including quota-derived waits.
    #[serde(default = "default_max_cooldown_seconds")]
    pub max_cooldown_seconds: u64,
    #[serde(default = "default_true")]
    pub quota_detection_enabled: bool,
    /// Safety margin added when a quota error carries no retry hint.
    #[serde(default = "default_quota_margin_percent")]
    pub quota_margin_percent: u64,
}

impl Default for ErrorProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_cooldown_seconds: default_cooldown_seconds(),
            max_cooldown_seconds: default_max_cooldown_seconds(),
            quota_detection_enabled: true,
            quota_margin_percent: default_quota_margin_percent(),
        }
    }
}

fn default_polling_interval() -> u64 {
    10
}

fn default_max_concurrent() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_file_size_mb() -> u64 {
    10
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_seconds() -> f64 {
    1.0
}

fn default_cooldown_seconds() -> u64 {
    300
}

fn default_max_cooldown_seconds() -> u64 {
    3600
}

fn default_quota_margin_percent() -> u64 {
    10
}

/// Accept `cli_args` as either a list of strings or one whitespace-separated
/// string.
fn args_list_or_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrString {
        List(Vec<String>),
        One(String),
    }

    match ListOrString::deserialize(deserializer)? {
        ListOrString::List(args) => Ok(args),
        ListOrString::One(s) => Ok(s.split_whitespace().map(str::to_string).collect()),
    }
}
