//! The MCP client: one `tools/call` per request, over Unix socket or HTTP.

use crate::error::McpError;
use crate::types::{ActionDecision, AgentAction, HealthStatus, ProjectWithAgents};
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::debug;

/// Operations that accept the coordinator bearer token. The token is injected
/// as the `coordinator_token` argument field (and as the `Authorization`
/// header on the HTTP transport); its absence is not a client-side error.
const PRIVILEGED_TOOLS: &[&str] = &[
    "health_check",
    "list_active_projects_with_agents",
    "get_agent_action",
    "should_start",
    "register_execution_log_file",
    "invalidate_session",
    "report_agent_error",
];

#[derive(Debug, Clone)]
enum Transport {
    /// Line-delimited JSON-RPC: one request line, one response line per
    /// connection.
    Unix { socket_path: PathBuf },
    /// The same request object as a single POST.
    Http { url: String, http: reqwest::Client },
}

/// Client for the agent-pm task-management server.
///
/// Cheap to clone; detached tasks (log-upload fallback registration) hold
/// their own copy.
#[derive(Debug, Clone)]
pub struct McpClient {
    transport: Transport,
    coordinator_token: Option<String>,
}

impl McpClient {
    /// Create a client for `connection`: an `http://`/`https://` URL selects
    /// the HTTP transport, anything else is treated as a Unix socket path.
    pub fn new(connection: &str, coordinator_token: Option<String>) -> Self {
        let transport = if connection.starts_with("http://") || connection.starts_with("https://") {
            Transport::Http {
                url: connection.to_string(),
                http: reqwest::Client::new(),
            }
        } else {
            Transport::Unix {
                socket_path: PathBuf::from(connection),
            }
        };
        Self {
            transport,
            coordinator_token,
        }
    }

    /// Call one named tool and return its decoded result object.
    async fn call_tool(&self, tool_name: &str, args: Value) -> Result<Value, McpError> {
        let request = self.build_request(tool_name, args);
        debug!(tool = tool_name, "calling MCP tool");

        let response = match &self.transport {
            Transport::Unix { socket_path } => call_unix(socket_path, &request).await?,
            Transport::Http { url, http } => {
                let mut req = http.post(url).json(&request);
                if let Some(token) = &self.coordinator_token {
                    req = req.bearer_auth(token);
                }
                req.send().await?.json::<Value>().await?
            }
        };

        decode_tool_response(response)
    }

    /// Build the JSON-RPC envelope, injecting the coordinator token into the
    /// arguments of privileged operations.
    fn build_request(&self, tool_name: &str, mut args: Value) -> Value {
        if PRIVILEGED_TOOLS.contains(&tool_name)
            && let Some(token) = &self.coordinator_token
            && let Some(map) = args.as_object_mut()
        {
            map.insert("coordinator_token".to_string(), json!(token));
        }
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": tool_name, "arguments": args },
        })
    }

    /// Check server health. Any transport failure means "not available".
    pub async fn health_check(&self) -> Result<HealthStatus, McpError> {
        let result = self.call_tool("health_check", json!({})).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// All active projects with their assigned agents.
    ///
    /// `root_agent_id` is the multi-device hint forwarded so the server
    /// resolves working directories for this device.
    pub async fn list_active_projects_with_agents(
        &self,
        root_agent_id: Option<&str>,
    ) -> Result<Vec<ProjectWithAgents>, McpError> {
        let mut args = json!({});
        if let Some(root) = root_agent_id {
            args["root_agent_id"] = json!(root);
        }
        let result = self
            .call_tool("list_active_projects_with_agents", args)
            .await?;

        if !result.get("success").and_then(Value::as_bool).unwrap_or(true) {
            return Err(McpError::Server(
                result
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("failed to list projects")
                    .to_string(),
            ));
        }

        let projects = result.get("projects").cloned().unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(projects)?)
    }

    /// The server's instruction for one `(agent, project)` pair.
    ///
    /// Falls back to the older `should_start` tool when the server does not
    /// know `get_agent_action`, mapping its boolean onto start/none.
    pub async fn get_agent_action(
        &self,
        agent_id: &str,
        project_id: &str,
    ) -> Result<ActionDecision, McpError> {
        let args = json!({ "agent_id": agent_id, "project_id": project_id });
        match self.call_tool("get_agent_action", args.clone()).await {
            Ok(result) => decode_action(result),
            Err(McpError::Server(message)) if is_unknown_tool(&message) => {
                debug!("get_agent_action unavailable, falling back to should_start");
                decode_action(self.call_tool("should_start", args).await?)
            }
            Err(e) => Err(e),
        }
    }

    /// Register the on-disk log path for a completed execution.
    pub async fn register_execution_log_file(
        &self,
        agent_id: &str,
        task_id: &str,
        log_file_path: &str,
    ) -> Result<bool, McpError> {
        let result = self
            .call_tool(
                "register_execution_log_file",
                json!({
                    "agent_id": agent_id,
                    "task_id": task_id,
                    "log_file_path": log_file_path,
                }),
            )
            .await?;
        Ok(success_of(&result))
    }

    /// Release the server-side session for a pair whose child has exited, so
    /// the next tick can be told to start again.
    pub async fn invalidate_session(
        &self,
        agent_id: &str,
        project_id: &str,
    ) -> Result<bool, McpError> {
        let result = self
            .call_tool(
                "invalidate_session",
                json!({ "agent_id": agent_id, "project_id": project_id }),
            )
            .await?;
        Ok(success_of(&result))
    }

    /// Round-trip a child's extracted error line to the server.
    pub async fn report_agent_error(
        &self,
        agent_id: &str,
        project_id: &str,
        error_message: &str,
    ) -> Result<bool, McpError> {
        let result = self
            .call_tool(
                "report_agent_error",
                json!({
                    "agent_id": agent_id,
                    "project_id": project_id,
                    "error_message": error_message,
                }),
            )
            .await?;
        Ok(success_of(&result))
    }
}

/// One request line out, one response line back, then the connection closes.
#[cfg(unix)]
async fn call_unix(socket_path: &std::path::Path, request: &Value) -> Result<Value, McpError> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|source| McpError::Connect {
            path: socket_path.display().to_string(),
            source,
        })?;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;
    write_half.flush().await?;

    let mut reader = BufReader::new(read_half);
    let mut response_line = String::new();
    let n = reader.read_line(&mut response_line).await?;
    if n == 0 {
        return Err(McpError::ClosedEarly);
    }
    Ok(serde_json::from_str::<Value>(response_line.trim())?)
}

/// Unix sockets do not exist on this platform; configure an HTTP URL instead.
#[cfg(not(unix))]
async fn call_unix(socket_path: &std::path::Path, _request: &Value) -> Result<Value, McpError> {
    Err(McpError::Connect {
        path: socket_path.display().to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Unix domain sockets are not available on this platform",
        ),
    })
}

fn success_of(result: &Value) -> bool {
    result.get("success").and_then(Value::as_bool).unwrap_or(false)
}

fn is_unknown_tool(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("unknown tool") || m.contains("method not found") || m.contains("tool not found")
}

/// Unwrap the MCP response envelope.
///
/// The server wraps results as
/// `{"result":{"content":[{"type":"text","text":"<JSON>"}]}}`; the first
/// `content` element's `text` is parsed and returned. Non-JSON text is
/// wrapped as `{"text": ...}`. A top-level `error` becomes
/// [`McpError::Server`].
fn decode_tool_response(data: Value) -> Result<Value, McpError> {
    if let Some(error) = data.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(McpError::Server(message));
    }

    let result = data.get("result").cloned().unwrap_or_else(|| json!({}));
    if let Some(first) = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|content| content.first())
        && first.get("type").and_then(Value::as_str) == Some("text")
    {
        let text = first.get("text").and_then(Value::as_str).unwrap_or("{}");
        return Ok(serde_json::from_str(text).unwrap_or_else(|_| json!({ "text": text })));
    }
    Ok(result)
}

/// Decode an action result, accepting both the current `action` shape and
/// the legacy `{should_start: bool}` shape.
fn decode_action(result: Value) -> Result<ActionDecision, McpError> {
    let legacy_flag = result
        .get("should_start")
        .and_then(Value::as_bool)
        .filter(|_| result.get("action").is_none());

    let mut decision: ActionDecision = serde_json::from_value(result)?;
    if let Some(flag) = legacy_flag {
        decision.action = if flag {
            AgentAction::Start
        } else {
            AgentAction::None
        };
    }
    Ok(decision)
}
