//! Configuration loading, expansion, and validation.

use super::types::{CoordinatorConfig, ProviderSpec};
use crate::home;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading the coordinator configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Platform default location of the task-management server socket.
///
/// Windows has no Unix sockets; an HTTP `mcp_socket_path` must be configured
/// there, so the default is `None`.
pub fn default_socket_path() -> Option<String> {
    if cfg!(windows) {
        return None;
    }
    let data_dir = home::get_data_dir().ok()?;
    Some(
        data_dir
            .join("AIAgentPM")
            .join("mcp.sock")
            .display()
            .to_string(),
    )
}

/// Load and validate a coordinator configuration from a YAML file.
///
/// Applies `${VAR}` expansion to the coordinator token and agent passkeys,
/// fills platform defaults, and records the source path as the lock identity.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be read or parsed, or when a
/// value fails validation (`polling_interval`/`max_concurrent` must be
/// positive; an enabled log upload needs an endpoint).
pub fn load(path: &Path) -> Result<CoordinatorConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut config: CoordinatorConfig =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    config.config_path = Some(path.to_path_buf());
    finalize(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Apply environment expansion and platform defaults in place.
///
/// Also used by tests that build configs programmatically.
pub(crate) fn finalize(config: &mut CoordinatorConfig) {
    config.coordinator_token = config
        .coordinator_token
        .take()
        .map(|t| expand_env_ref(&t))
        .filter(|t| !t.is_empty())
        .or_else(|| std::env::var("MCP_COORDINATOR_TOKEN").ok());

    for agent in config.agents.values_mut() {
        agent.passkey = expand_env_ref(&agent.passkey);
    }

    config
        .ai_providers
        .entry("claude".to_string())
        .or_insert_with(ProviderSpec::default_claude);

    match config.mcp_socket_path.take() {
        Some(path) if path.starts_with("http://") || path.starts_with("https://") => {
            config.mcp_socket_path = Some(path);
        }
        Some(path) => {
            config.mcp_socket_path = Some(home::expand_tilde(&path).display().to_string());
        }
        None => {
            config.mcp_socket_path = default_socket_path();
        }
    }
}

fn validate(config: &CoordinatorConfig) -> Result<(), ConfigError> {
    if config.polling_interval == 0 {
        return Err(ConfigError::Invalid(
            "polling_interval must be positive".to_string(),
        ));
    }
    if config.max_concurrent == 0 {
        return Err(ConfigError::Invalid(
            "max_concurrent must be positive".to_string(),
        ));
    }
    if config.log_upload.enabled && config.log_upload.endpoint.is_none() {
        return Err(ConfigError::Invalid(
            "log_upload.endpoint is required when log_upload.enabled is true".to_string(),
        ));
    }
    Ok(())
}

/// Expand a `${VAR}` reference against the environment. Anything else is
/// returned unchanged; an unset variable expands to the empty string.
fn expand_env_ref(value: &str) -> String {
    if let Some(name) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        std::env::var(name).unwrap_or_default()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(yaml: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinator.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    #[serial]
    fn loads_full_config() {
        let (_dir, path) = write_config(
            r#"
polling_interval: 5
max_concurrent: 2
mcp_socket_path: /tmp/apm-test.sock
coordinator_token: secret-token
ai_providers:
  gemini:
    cli_command: gemini
    cli_args: ["--sandbox"]
agents:
  agt_developer:
    passkey: dev-secret
log_directory: /tmp/apm-logs
debug_mode: false
log_upload:
  enabled: true
  endpoint: https://pm.example.com/api/logs
  retry_count: 2
error_protection:
  default_cooldown_seconds: 60
"#,
        );

        let config = load(&path).unwrap();
        assert_eq!(config.polling_interval, 5);
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.mcp_socket_path.as_deref(), Some("/tmp/apm-test.sock"));
        assert_eq!(config.coordinator_token.as_deref(), Some("secret-token"));
        assert!(!config.debug_mode);
        assert_eq!(config.agent_passkey("agt_developer"), Some("dev-secret"));
        assert_eq!(config.agent_passkey("agt_unknown"), None);
        assert_eq!(config.log_upload.retry_count, 2);
        assert_eq!(config.log_upload.max_file_size_mb, 10);
        assert_eq!(config.error_protection.default_cooldown_seconds, 60);
        assert_eq!(config.error_protection.max_cooldown_seconds, 3600);
        assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    #[serial]
    fn injects_default_claude_provider() {
        let (_dir, path) = write_config("agents: {}\nmcp_socket_path: /tmp/a.sock\n");
        let config = load(&path).unwrap();
        let claude = config.provider("claude");
        assert_eq!(claude.cli_command, "claude");
        assert_eq!(claude.cli_args, vec!["--dangerously-skip-permissions"]);
        // Unknown providers fall back to claude.
        assert_eq!(config.provider("openai"), claude);
    }

    #[test]
    #[serial]
    fn cli_args_accepts_string_form() {
        let (_dir, path) = write_config(
            "mcp_socket_path: /tmp/a.sock\nai_providers:\n  gemini:\n    cli_command: gemini\n    cli_args: --sandbox --yolo\n",
        );
        let config = load(&path).unwrap();
        assert_eq!(config.provider("gemini").cli_args, vec!["--sandbox", "--yolo"]);
    }

    #[test]
    #[serial]
    fn expands_env_references() {
        // SAFETY: serialised by `#[serial]`.
        unsafe {
            std::env::set_var("APM_TEST_TOKEN", "tok-123");
            std::env::set_var("APM_TEST_PASSKEY", "pk-456");
        }
        let (_dir, path) = write_config(
            "mcp_socket_path: /tmp/a.sock\ncoordinator_token: ${APM_TEST_TOKEN}\nagents:\n  agt_dev:\n    passkey: ${APM_TEST_PASSKEY}\n",
        );
        let config = load(&path).unwrap();
        unsafe {
            std::env::remove_var("APM_TEST_TOKEN");
            std::env::remove_var("APM_TEST_PASSKEY");
        }
        assert_eq!(config.coordinator_token.as_deref(), Some("tok-123"));
        assert_eq!(config.agent_passkey("agt_dev"), Some("pk-456"));
    }

    #[test]
    #[serial]
    fn token_falls_back_to_environment() {
        unsafe { std::env::set_var("MCP_COORDINATOR_TOKEN", "env-token") };
        let (_dir, path) = write_config("mcp_socket_path: /tmp/a.sock\n");
        let config = load(&path).unwrap();
        unsafe { std::env::remove_var("MCP_COORDINATOR_TOKEN") };
        assert_eq!(config.coordinator_token.as_deref(), Some("env-token"));
    }

    #[test]
    #[serial]
    fn tilde_socket_path_is_expanded() {
        unsafe { std::env::set_var("APM_HOME", "/custom/home") };
        let (_dir, path) = write_config("mcp_socket_path: ~/run/mcp.sock\n");
        let config = load(&path).unwrap();
        unsafe { std::env::remove_var("APM_HOME") };
        assert_eq!(
            config.mcp_socket_path.as_deref(),
            Some("/custom/home/run/mcp.sock")
        );
    }

    #[test]
    #[serial]
    fn rejects_zero_polling_interval() {
        let (_dir, path) = write_config("polling_interval: 0\n");
        let err = load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    #[serial]
    fn rejects_zero_max_concurrent() {
        let (_dir, path) = write_config("max_concurrent: 0\n");
        assert!(matches!(load(&path).unwrap_err(), ConfigError::Invalid(_)));
    }

    #[test]
    #[serial]
    fn rejects_upload_without_endpoint() {
        let (_dir, path) = write_config("log_upload:\n  enabled: true\n");
        assert!(matches!(load(&path).unwrap_err(), ConfigError::Invalid(_)));
    }

    #[test]
    #[serial]
    fn effective_fields_round_trip() {
        let (_dir, path) = write_config(
            r#"
polling_interval: 7
max_concurrent: 4
mcp_socket_path: /tmp/apm-rt.sock
agents:
  agt_a:
    passkey: one
ai_providers:
  gemini:
    cli_command: gemini
    cli_args: ["-s"]
"#,
        );
        let config = load(&path).unwrap();

        let yaml = serde_yaml::to_string(&config).unwrap();
        let mut reparsed: CoordinatorConfig = serde_yaml::from_str(&yaml).unwrap();
        reparsed.config_path = config.config_path.clone();

        assert_eq!(reparsed.polling_interval, config.polling_interval);
        assert_eq!(reparsed.max_concurrent, config.max_concurrent);
        assert_eq!(reparsed.mcp_socket_path, config.mcp_socket_path);
        assert_eq!(reparsed.ai_providers, config.ai_providers);
        assert_eq!(reparsed.agents, config.agents);
        assert_eq!(reparsed.log_upload, config.log_upload);
        assert_eq!(reparsed.error_protection, config.error_protection);
    }
}
