//! MCP client for the agent-pm task-management server.
//!
//! The coordinator talks to the server through single-shot `tools/call`
//! requests: line-delimited JSON-RPC 2.0 over a Unix domain socket, or a
//! plain POST when the connection string is an HTTP URL. [`McpClient`] hides
//! the transport split and exposes the typed coordinator operations.

mod client;
mod error;
mod types;

pub use client::McpClient;
pub use error::McpError;
pub use types::{ActionDecision, AgentAction, HealthStatus, ProjectWithAgents};
