//! Typed results for the coordinator-facing server operations.

use serde::{Deserialize, Serialize};

/// Result of `health_check`.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    /// `"ok"` when the server is healthy. Missing means ok.
    #[serde(default = "default_status_ok")]
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

fn default_status_ok() -> String {
    "ok".to_string()
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// One active project with its assigned agents, from
/// `list_active_projects_with_agents`.
///
/// The server has emitted both snake_case and camelCase spellings over time;
/// both are accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectWithAgents {
    #[serde(alias = "projectId")]
    pub project_id: String,
    #[serde(default, alias = "projectName", alias = "name")]
    pub project_name: String,
    #[serde(default, alias = "workingDirectory")]
    pub working_directory: String,
    #[serde(default)]
    pub agents: Vec<String>,
}

/// The server's per-tick instruction for one `(agent, project)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentAction {
    Start,
    Stop,
    /// Do nothing this tick. Also the decode fallback for unknown actions.
    #[default]
    #[serde(other)]
    None,
}

/// Decoded result of `get_agent_action` (or the legacy `should_start`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionDecision {
    #[serde(default)]
    pub action: AgentAction,
    #[serde(default)]
    pub reason: Option<String>,
    /// AI provider to launch (`claude`, `gemini`, `openai`, `other`).
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Full command string overriding provider lookup, split on whitespace.
    #[serde(default, alias = "kickCommand")]
    pub kick_command: Option<String>,
    #[serde(default, alias = "taskId")]
    pub task_id: Option<String>,
    /// Execution-log identifier for upload correlation, when the server
    /// tracks one for this start.
    #[serde(default, alias = "executionLogId")]
    pub execution_log_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_accepts_camel_case_aliases() {
        let p: ProjectWithAgents = serde_json::from_str(
            r#"{"projectId":"prj_1","projectName":"Demo","workingDirectory":"/work","agents":["agt_a"]}"#,
        )
        .unwrap();
        assert_eq!(p.project_id, "prj_1");
        assert_eq!(p.project_name, "Demo");
        assert_eq!(p.working_directory, "/work");
        assert_eq!(p.agents, vec!["agt_a"]);
    }

    #[test]
    fn project_tolerates_missing_optionals() {
        let p: ProjectWithAgents = serde_json::from_str(r#"{"project_id":"prj_2"}"#).unwrap();
        assert_eq!(p.project_id, "prj_2");
        assert!(p.project_name.is_empty());
        assert!(p.agents.is_empty());
    }

    #[test]
    fn action_decision_decodes_start() {
        let d: ActionDecision = serde_json::from_str(
            r#"{"action":"start","provider":"claude","model":"claude-sonnet-4-5","task_id":"T1"}"#,
        )
        .unwrap();
        assert_eq!(d.action, AgentAction::Start);
        assert_eq!(d.provider.as_deref(), Some("claude"));
        assert_eq!(d.task_id.as_deref(), Some("T1"));
    }

    #[test]
    fn unknown_action_decodes_as_none() {
        let d: ActionDecision = serde_json::from_str(r#"{"action":"hold"}"#).unwrap();
        assert_eq!(d.action, AgentAction::None);
    }

    #[test]
    fn missing_action_defaults_to_none() {
        let d: ActionDecision = serde_json::from_str(r#"{"reason":"no work"}"#).unwrap();
        assert_eq!(d.action, AgentAction::None);
    }

    #[test]
    fn health_status_defaults_ok() {
        let h: HealthStatus = serde_json::from_str("{}").unwrap();
        assert!(h.is_ok());
        let h: HealthStatus = serde_json::from_str(r#"{"status":"degraded"}"#).unwrap();
        assert!(!h.is_ok());
    }
}
