use std::io;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, GatewayErr>;

#[derive(Error, Debug)]
pub enum GatewayErr {
    /// The SSE stream disconnected or errored out after the HTTP handshake
    /// succeeded but before the terminal event arrived.
    #[error("stream disconnected before completion: {0}")]
    Stream(String),

    #[error("no session with id: {0}")]
    SessionNotFound(String),

    #[error("session {0} already has a prompt in flight")]
    SessionBusy(String),

    #[error("session {0} is {1} and accepts no further prompts")]
    SessionClosed(String, &'static str),

    /// A streaming adapter stalled or a polling adapter exhausted its budget.
    #[error("timed out waiting for model output")]
    Timeout,

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Unexpected HTTP status code from a model backend.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// Retry limit exceeded.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    #[error("path escapes the workspace root: {0}")]
    PathEscapesWorkspace(String),

    #[error("{0}")]
    Sandbox(String),

    /// Subprocess (git, shell) failure with captured stderr.
    #[error("{context}: {stderr}")]
    Subprocess { context: String, stderr: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl GatewayErr {
    /// Stderr captured from a failed subprocess, when there is any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            GatewayErr::Subprocess { stderr, .. } if !stderr.is_empty() => Some(stderr),
            _ => None,
        }
    }
}
