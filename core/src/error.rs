use std::io;

use thiserror::Error;
use warden_policy::PolicyCompilerError;
use warden_protocol::error::SandboxErr;

pub type Result<T> = std::result::Result<T, WardenErr>;

/// Host-facing error type. Typed sandbox violations travel inside
/// [`WardenErr::Violation`] so callers can match on the exact kind that was
/// raised inside a worker.
#[derive(Error, Debug)]
pub enum WardenErr {
    #[error(transparent)]
    Violation(#[from] SandboxErr),

    #[error("invalid sandbox name: {0}")]
    InvalidName(String),

    /// The worker's control loop has exited and its inbox is closed.
    #[error("sandbox worker is not running")]
    WorkerGone,

    #[error("supervisor is shut down")]
    ShutDown,

    #[error("policy compile error: {0}")]
    Compile(#[from] PolicyCompilerError),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl WardenErr {
    /// The typed violation carried by this error, if any.
    pub fn violation(&self) -> Option<&SandboxErr> {
        match self {
            WardenErr::Violation(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WardenErr::Violation(SandboxErr::Timeout))
    }

    pub fn is_policy_auth(&self) -> bool {
        matches!(self, WardenErr::Violation(SandboxErr::PolicyAuth))
    }
}
