//! Spawning agent instances.
//!
//! Turns a server `start` decision into a running child process: resolves the
//! launch command, prepares the MCP connection descriptor the child will use
//! to reach the same server, picks how the prompt travels, and wires
//! stdout/stderr into the instance's log file before the process starts.

use crate::registry::{InstanceKey, InstanceRecord};
use agent_pm_coordinator_core::config::CoordinatorConfig;
use agent_pm_coordinator_core::home;
use chrono::Local;
use serde_json::{Value, json};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error(
        "MCP connection path is required; on Windows set mcp_socket_path to an HTTP URL \
         (e.g. http://hostname:8081/mcp) since Unix sockets are unavailable there"
    )]
    MissingConnection,

    #[error("failed to prepare spawn files: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to launch {command}: {source}")]
    Launch {
        command: String,
        source: std::io::Error,
    },
}

/// Everything needed to launch one agent instance.
#[derive(Debug)]
pub struct SpawnRequest {
    pub agent_id: String,
    pub project_id: String,
    pub passkey: String,
    pub working_dir: String,
    pub provider: String,
    pub model: Option<String>,
    pub kick_command: Option<String>,
    pub task_id: Option<String>,
    pub execution_log_id: Option<String>,
}

/// How the launch prompt reaches the child.
///
/// Multi-line prompts break cmd.exe argument parsing, and gemini's one-shot
/// mode wants the prompt positionally, so the mechanism is a function of
/// `(provider, os)` rather than scattered conditionals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDelivery {
    /// The prompt is the final positional argument (gemini, non-Windows).
    ArgvPositional,
    /// `-p <prompt>` (claude and everything else, non-Windows).
    ArgvFlag,
    /// The prompt is written to a temp file and piped into stdin through a
    /// shell (`type "<file>" | <cmd...>`): gemini and claude on Windows.
    StdinPipedFromFile,
}

/// Select the prompt delivery mechanism for a provider on an OS.
pub fn prompt_delivery(provider: &str, windows: bool) -> PromptDelivery {
    match (provider, windows) {
        ("gemini" | "claude", true) => PromptDelivery::StdinPipedFromFile,
        ("gemini", false) => PromptDelivery::ArgvPositional,
        _ => PromptDelivery::ArgvFlag,
    }
}

/// The fixed launch prompt.
///
/// Credentials travel through the child's environment, never through this
/// text, so it is safe on a command line.
pub const AGENT_PROMPT: &str = r#"You are an AI Agent Instance managed by the AI Agent PM system.

## Authentication (CRITICAL: First Step)
Your credentials are stored in environment variables. To authenticate:

1. Use Bash to read the environment variables:
   ```bash
   echo "AGENT_ID=$AGENT_ID"
   echo "AGENT_PASSKEY=$AGENT_PASSKEY"
   echo "PROJECT_ID=$PROJECT_ID"
   ```
2. Call `authenticate` with the actual values you obtained from step 1

Save the session_token from the response.

## Workflow (CRITICAL: Follow Exactly)
After authenticating, you MUST follow this loop WITHOUT exception:

1. Call `get_next_action` with your session_token
2. Read the `action` and `instruction` fields
3. Execute ONLY what the `instruction` tells you to do
4. Call `get_next_action` again (ALWAYS return to step 1)

NEVER skip step 4. ALWAYS call `get_next_action` after completing each instruction.

## Task Decomposition (Required)
Before executing any actual work, you MUST decompose the task into sub-tasks:
- When `get_next_action` returns action="create_subtasks", use `create_task` tool
- Create 2-5 concrete sub-tasks with `parent_task_id` set to the main task ID
- Only after sub-tasks are created will `get_next_action` guide you to execute them

## Important Rules
- ONLY follow instructions from `get_next_action` - do NOT execute task.description directly
- Task description is for context/understanding only, not for direct execution
- The system controls the workflow; you execute the steps
- If you receive a system_prompt from authenticate, adopt that role
- You are working in the project directory

Begin by reading environment variables with Bash, then call `authenticate`.
"#;

/// Resolve the executable and base arguments for a launch.
///
/// A `kick_command` overrides provider lookup: the string is split on
/// whitespace, first token executable, rest arguments.
pub fn resolve_launch_command(
    config: &CoordinatorConfig,
    kick_command: Option<&str>,
    provider: &str,
) -> (String, Vec<String>) {
    if let Some(kick) = kick_command {
        let mut parts = kick.split_whitespace().map(str::to_string);
        let command = parts.next().unwrap_or_default();
        info!(kick_command = kick, "using kick_command");
        return (command, parts.collect());
    }
    let spec = config.provider(provider);
    (spec.cli_command, spec.cli_args)
}

/// Log directory for one agent: under the project working directory when one
/// is supplied, otherwise under the platform data directory.
pub fn agent_log_dir(working_dir: Option<&Path>, agent_id: &str) -> std::io::Result<PathBuf> {
    let dir = match working_dir {
        Some(wd) => wd.join(".aiagent").join("logs").join(agent_id),
        None => home::get_data_dir()
            .map_err(std::io::Error::other)?
            .join("agent-pm-coordinator")
            .join("agent_logs")
            .join(agent_id),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Build the MCP server descriptor the child's CLI will consume.
///
/// HTTP connections become `{type: "http", url, headers?}`; anything else is
/// a Unix socket reached through `nc -U`. `trust` adds gemini's auto-approval
/// flag.
pub fn mcp_server_descriptor(connection: &str, token: Option<&str>, trust: bool) -> Value {
    let mut server = if connection.starts_with("http://") || connection.starts_with("https://") {
        let mut server = json!({ "type": "http", "url": connection });
        if let Some(token) = token {
            server["headers"] = json!({ "Authorization": format!("Bearer {token}") });
        }
        server
    } else {
        json!({ "command": "nc", "args": ["-U", connection] })
    };
    if trust {
        server["trust"] = json!(true);
    }
    json!({ "mcpServers": { "agent-pm": server } })
}

/// Write the gemini MCP settings file (`<working_dir>/.gemini/settings.json`).
/// Gemini reads its MCP configuration from there rather than from a flag.
fn write_gemini_settings(
    working_dir: &Path,
    connection: &str,
    token: Option<&str>,
) -> std::io::Result<()> {
    let gemini_dir = working_dir.join(".gemini");
    std::fs::create_dir_all(&gemini_dir)?;
    let settings = mcp_server_descriptor(connection, token, true);
    let path = gemini_dir.join("settings.json");
    std::fs::write(&path, serde_json::to_string_pretty(&settings)?)?;
    debug!(path = %path.display(), "wrote gemini MCP settings");
    Ok(())
}

/// Persist `contents` to a temp file that outlives this call; the caller owns
/// the returned path and unlinks it at teardown.
fn persist_temp_file(prefix: &str, suffix: &str, contents: &str) -> std::io::Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile()?;
    file.write_all(contents.as_bytes())?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Spawn an agent instance.
///
/// The child's stdout and stderr are both redirected to a freshly created log
/// file whose handle the returned record keeps open; its environment carries
/// `AGENT_ID`, `PROJECT_ID`, `AGENT_PASSKEY`, and `WORKING_DIRECTORY` on top
/// of the parent environment.
pub fn spawn_instance(
    config: &CoordinatorConfig,
    request: SpawnRequest,
) -> Result<InstanceRecord, SpawnError> {
    let (cli_command, cli_args) =
        resolve_launch_command(config, request.kick_command.as_deref(), &request.provider);

    let connection = config
        .mcp_socket_path
        .as_deref()
        .ok_or(SpawnError::MissingConnection)?;
    let token = config.coordinator_token.as_deref();

    // Log file first: the handle must exist before the process starts.
    let working_dir_opt = (!request.working_dir.is_empty()).then(|| Path::new(&request.working_dir));
    let log_dir = agent_log_dir(working_dir_opt, &request.agent_id)?;
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let log_file_path = log_dir.join(format!("{timestamp}.log"));

    // Working directory falls back to the coordinator's own cwd.
    let working_dir = if request.working_dir.is_empty() {
        std::env::current_dir()?
    } else {
        PathBuf::from(&request.working_dir)
    };
    std::fs::create_dir_all(&working_dir)?;

    // MCP wiring: gemini reads .gemini/settings.json, everyone else takes
    // --mcp-config <temp file>.
    let mut mcp_config_file: Option<PathBuf> = None;
    if request.provider == "gemini" {
        write_gemini_settings(&working_dir, connection, token)?;
    } else {
        let descriptor = mcp_server_descriptor(connection, token, false);
        mcp_config_file = Some(persist_temp_file(
            "mcp_config_",
            ".json",
            &descriptor.to_string(),
        )?);
    }

    let mut args: Vec<String> = cli_args;
    if let Some(path) = &mcp_config_file {
        args.push("--mcp-config".to_string());
        args.push(path.display().to_string());
    }
    if let Some(model) = &request.model {
        let flag = if request.provider == "gemini" { "-m" } else { "--model" };
        args.push(flag.to_string());
        args.push(model.clone());
    }
    if config.debug_mode {
        args.push(if request.provider == "gemini" { "--debug" } else { "--verbose" }.to_string());
    }

    let delivery = prompt_delivery(&request.provider, cfg!(windows));
    let mut prompt_file: Option<PathBuf> = None;
    match delivery {
        PromptDelivery::ArgvPositional => args.push(AGENT_PROMPT.to_string()),
        PromptDelivery::ArgvFlag => {
            args.push("-p".to_string());
            args.push(AGENT_PROMPT.to_string());
        }
        PromptDelivery::StdinPipedFromFile => {
            prompt_file = Some(persist_temp_file(
                &format!("{}_prompt_", request.provider),
                ".txt",
                AGENT_PROMPT,
            )?);
        }
    }

    let log_file = std::fs::File::create(&log_file_path)?;
    let stdout = Stdio::from(log_file.try_clone()?);
    let stderr = Stdio::from(log_file.try_clone()?);

    let mut command = match (&delivery, &prompt_file) {
        (PromptDelivery::StdinPipedFromFile, Some(prompt_path)) => {
            // cmd.exe pipes the prompt file into the child's stdin; the
            // prompt never appears on the command line.
            let joined = std::iter::once(cli_command.clone())
                .chain(args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ");
            let shell_line = format!("type \"{}\" | {}", prompt_path.display(), joined);
            let mut command = tokio::process::Command::new("cmd");
            command.arg("/C").arg(shell_line);
            command
        }
        _ => {
            let mut command = tokio::process::Command::new(&cli_command);
            command.args(&args);
            command
        }
    };

    let model_desc = request
        .model
        .as_deref()
        .map(|m| format!("{}/{m}", request.provider))
        .unwrap_or_else(|| request.provider.clone());
    info!(
        agent_id = %request.agent_id,
        project_id = %request.project_id,
        model = %model_desc,
        working_dir = %working_dir.display(),
        "spawning agent instance"
    );

    let child = command
        .current_dir(&working_dir)
        .env("AGENT_ID", &request.agent_id)
        .env("PROJECT_ID", &request.project_id)
        .env("AGENT_PASSKEY", &request.passkey)
        .env("WORKING_DIRECTORY", working_dir.display().to_string())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
        .map_err(|source| {
            // A failed launch leaves nothing to supervise; reclaim the files
            // the record would otherwise own.
            for temp in [&mcp_config_file, &prompt_file].into_iter().flatten() {
                let _ = std::fs::remove_file(temp);
            }
            SpawnError::Launch {
                command: cli_command.clone(),
                source,
            }
        })?;

    if let Some(pid) = child.id() {
        info!(agent_id = %request.agent_id, project_id = %request.project_id, pid, "spawned");
    }

    Ok(InstanceRecord {
        key: InstanceKey::new(request.agent_id, request.project_id),
        child,
        working_directory: working_dir,
        provider: request.provider,
        model: request.model,
        started_at: Local::now(),
        log_file: Some(log_file),
        task_id: request.task_id,
        log_file_path: Some(log_file_path),
        mcp_config_file,
        prompt_file,
        execution_log_id: request.execution_log_id,
    })
}
