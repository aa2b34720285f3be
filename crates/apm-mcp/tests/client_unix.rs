//! Integration tests driving [`McpClient`] against an in-process Unix socket
//! server that speaks the line-delimited `tools/call` protocol.

#![cfg(unix)]

use agent_pm_coordinator_mcp::{AgentAction, McpClient, McpError};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

/// A scripted one-line-in/one-line-out server. Records every `(tool, args)`
/// pair it sees and answers from the responder closure.
struct ScriptedServer {
    socket_path: PathBuf,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    _dir: tempfile::TempDir,
}

impl ScriptedServer {
    fn start<F>(responder: F) -> Self
    where
        F: Fn(&str, &Value) -> Value + Send + Sync + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("mcp.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        let calls: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));

        let calls_for_task = Arc::clone(&calls);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    continue;
                }
                let request: Value = serde_json::from_str(line.trim()).unwrap();
                assert_eq!(request["jsonrpc"], "2.0");
                assert_eq!(request["method"], "tools/call");
                let tool = request["params"]["name"].as_str().unwrap().to_string();
                let args = request["params"]["arguments"].clone();
                let response = responder(&tool, &args);
                calls_for_task.lock().unwrap().push((tool, args));
                let mut out = response.to_string();
                out.push('\n');
                let _ = write_half.write_all(out.as_bytes()).await;
            }
        });

        Self {
            socket_path,
            calls,
            _dir: dir,
        }
    }

    fn client(&self, token: Option<&str>) -> McpClient {
        McpClient::new(
            self.socket_path.to_str().unwrap(),
            token.map(str::to_string),
        )
    }

    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

fn text_result(payload: &Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": { "content": [ { "type": "text", "text": payload.to_string() } ] },
    })
}

fn rpc_error(message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": { "code": -32601, "message": message },
    })
}

#[tokio::test]
async fn health_check_round_trip() {
    let server = ScriptedServer::start(|tool, _| {
        assert_eq!(tool, "health_check");
        text_result(&json!({ "status": "ok", "version": "2.1.0" }))
    });

    let health = server.client(None).health_check().await.unwrap();
    assert!(health.is_ok());
    assert_eq!(health.version.as_deref(), Some("2.1.0"));
}

#[tokio::test]
async fn coordinator_token_reaches_privileged_calls() {
    let server = ScriptedServer::start(|_, _| text_result(&json!({ "status": "ok" })));

    server
        .client(Some("secret"))
        .health_check()
        .await
        .unwrap();

    let calls = server.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1["coordinator_token"], json!("secret"));
}

#[tokio::test]
async fn list_projects_decodes_descriptors() {
    let server = ScriptedServer::start(|tool, args| {
        assert_eq!(tool, "list_active_projects_with_agents");
        assert_eq!(args["root_agent_id"], json!("agt_root"));
        text_result(&json!({
            "success": true,
            "projects": [
                {
                    "project_id": "prj_1",
                    "project_name": "Demo",
                    "working_directory": "/work/demo",
                    "agents": ["agt_dev", "agt_review"],
                },
                { "projectId": "prj_2", "workingDirectory": "/work/two" },
            ],
        }))
    });

    let projects = server
        .client(None)
        .list_active_projects_with_agents(Some("agt_root"))
        .await
        .unwrap();
    assert_eq!(projects.len(), 2);
    assert_eq!(projects[0].project_id, "prj_1");
    assert_eq!(projects[0].agents.len(), 2);
    assert_eq!(projects[1].project_id, "prj_2");
    assert_eq!(projects[1].working_directory, "/work/two");
}

#[tokio::test]
async fn list_projects_surfaces_server_failure() {
    let server = ScriptedServer::start(|_, _| {
        text_result(&json!({ "success": false, "error": "database offline" }))
    });

    let err = server
        .client(None)
        .list_active_projects_with_agents(None)
        .await
        .unwrap_err();
    match err {
        McpError::Server(message) => assert_eq!(message, "database offline"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn get_agent_action_decodes_start() {
    let server = ScriptedServer::start(|tool, args| {
        assert_eq!(tool, "get_agent_action");
        assert_eq!(args["agent_id"], json!("agt_dev"));
        assert_eq!(args["project_id"], json!("prj_1"));
        text_result(&json!({
            "action": "start",
            "provider": "claude",
            "model": "claude-sonnet-4-5",
            "task_id": "T42",
        }))
    });

    let decision = server
        .client(None)
        .get_agent_action("agt_dev", "prj_1")
        .await
        .unwrap();
    assert_eq!(decision.action, AgentAction::Start);
    assert_eq!(decision.model.as_deref(), Some("claude-sonnet-4-5"));
    assert_eq!(decision.task_id.as_deref(), Some("T42"));
}

#[tokio::test]
async fn get_agent_action_falls_back_to_should_start() {
    let server = ScriptedServer::start(|tool, _| match tool {
        "get_agent_action" => rpc_error("Unknown tool: get_agent_action"),
        "should_start" => text_result(&json!({ "should_start": true, "provider": "gemini" })),
        other => panic!("unexpected tool {other}"),
    });

    let decision = server
        .client(None)
        .get_agent_action("agt_dev", "prj_1")
        .await
        .unwrap();
    assert_eq!(decision.action, AgentAction::Start);
    assert_eq!(decision.provider.as_deref(), Some("gemini"));

    let tools: Vec<String> = server.calls().into_iter().map(|(tool, _)| tool).collect();
    assert_eq!(tools, vec!["get_agent_action", "should_start"]);
}

#[tokio::test]
async fn boolean_operations_report_success() {
    let server = ScriptedServer::start(|_, _| text_result(&json!({ "success": true })));
    let client = server.client(None);

    assert!(client
        .register_execution_log_file("agt_dev", "T42", "/tmp/run.log")
        .await
        .unwrap());
    assert!(client.invalidate_session("agt_dev", "prj_1").await.unwrap());
    assert!(client
        .report_agent_error("agt_dev", "prj_1", "ERROR: boom")
        .await
        .unwrap());

    let calls = server.calls();
    assert_eq!(calls[0].0, "register_execution_log_file");
    assert_eq!(calls[0].1["log_file_path"], json!("/tmp/run.log"));
    assert_eq!(calls[1].0, "invalidate_session");
    assert_eq!(calls[2].0, "report_agent_error");
    assert_eq!(calls[2].1["error_message"], json!("ERROR: boom"));
}

#[tokio::test]
async fn connection_refused_is_a_connect_error() {
    let dir = tempfile::tempdir().unwrap();
    let client = McpClient::new(dir.path().join("missing.sock").to_str().unwrap(), None);
    let err = client.health_check().await.unwrap_err();
    assert!(matches!(err, McpError::Connect { .. }));
}
