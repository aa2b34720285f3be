//! MCP client error type.

use thiserror::Error;

/// Errors raised by a single MCP call.
///
/// Every variant scopes to one request; callers log and skip the affected
/// step rather than tearing anything down.
#[derive(Error, Debug)]
pub enum McpError {
    #[error("cannot connect to MCP server at {path}: {source}")]
    Connect {
        path: String,
        source: std::io::Error,
    },

    #[error("I/O error talking to MCP server: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed server response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The server replied with a top-level `error` object or a
    /// `success: false` result.
    #[error("server error: {0}")]
    Server(String),

    #[error("connection closed before a response line was received")]
    ClosedEarly,
}
