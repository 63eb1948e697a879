use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Typed sandbox violations.
///
/// These cross the worker outbox as values and re-raise on the caller side,
/// so they are serializable and comparable, unlike the host-facing error
/// type which wraps transport failures as well.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SandboxErr {
    /// Generic guest failure; anything that is not a more specific kind.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// A policy hook rejected an operation.
    #[error("policy violation: {0}")]
    Policy(String),

    /// A privileged operation was not properly authenticated.
    #[error("operation not authorized")]
    PolicyAuth,

    /// A receive or join wait expired.
    #[error("sandbox operation timed out")]
    Timeout,

    /// Peak memory passed the sandbox quota.
    #[error("memory quota exceeded")]
    MemoryExceeded,

    /// Cumulative CPU time passed the sandbox quota.
    #[error("cpu quota exceeded")]
    CpuExceeded,

    /// A moved value was used again (restricted-subset evaluator only).
    #[error("ownership violation: {0}")]
    Ownership(String),

    /// A checkpoint blob could not be produced or decoded.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl SandboxErr {
    /// Violations that fan out to alert subscribers.
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, SandboxErr::Policy(_))
    }
}
