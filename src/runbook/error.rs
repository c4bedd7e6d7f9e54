// SPDX-License-Identifier: MIT

//! Typed error handling for runbook-rs
//!
//! Structural validation problems are NOT errors — they are returned as
//! `Vec<ValidationIssue>` so an editor can show all of them at once. The
//! types here cover everything else: lookups, conflicts, IO, the runner.

use thiserror::Error;

/// Top-level error type for runbook-rs
#[derive(Debug, Error)]
pub enum RunbookError {
    /// A workflow id that does not exist in the store
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// A run id that does not exist in the store
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// An operation that is not valid in the run's current state
    /// (e.g. resuming a run that is not waiting for approval)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A required chain parameter the caller never supplied
    #[error("Missing required parameter '{0}'")]
    MissingParameter(String),

    /// A supplied chain parameter that fails its declared type
    #[error("Invalid parameter '{name}': {message}")]
    InvalidParameter { name: String, message: String },

    /// Graph-structure errors from editor operations
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The external action runner reported a transport-level problem
    #[error("Runner error: {0}")]
    Runner(String),

    /// Macro nesting exceeded the depth cap (definition cycle)
    #[error("Macro nesting exceeded depth {0}")]
    MacroDepth(usize),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Generic error wrapper for compatibility
    #[error("{0}")]
    Other(String),
}

/// Errors raised by graph editor operations
#[derive(Debug, Error)]
pub enum GraphError {
    /// Node id not present in the graph
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Edge id not present in the graph
    #[error("Unknown edge: {0}")]
    UnknownEdge(String),

    /// Nothing to undo/redo
    #[error("History exhausted: {0}")]
    HistoryExhausted(&'static str),
}

impl RunbookError {
    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a runner error
    pub fn runner(message: impl Into<String>) -> Self {
        Self::Runner(message.into())
    }

    /// Create from a generic message
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

impl From<&str> for RunbookError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}

impl From<String> for RunbookError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}
