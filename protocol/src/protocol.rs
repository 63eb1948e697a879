use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use strum_macros::IntoStaticStr;

use crate::config::SandboxConfig;
use crate::error::SandboxErr;

/// The guest value type. Guests exchange structured JSON values rather than
/// arbitrary objects.
pub type Value = serde_json::Value;
pub type Kwargs = serde_json::Map<String, Value>;

/// Inbox entry: one control message with a correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub op: Op,
}

/// Control messages accepted by a worker. Delivery is FIFO and at most one
/// message executes at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    /// Run a guest program; exactly one result is posted per program.
    Exec { program: Vec<Instr> },

    /// Invoke `module.func` from the vetted host-function table.
    Call {
        target: String,
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Kwargs,
    },

    /// Re-initialize the worker in place: counters, policy, importer set,
    /// resource group. Sent for both fresh spawns and warm-pool reuse so the
    /// worker always applies configuration from its own thread.
    Reset(Box<ResetRequest>),

    /// Drain the in-flight message and exit the control loop.
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRequest {
    pub config: SandboxConfig,
    /// Resource group the worker thread should attach itself to. Opaque to
    /// the protocol; the runtime treats it as a directory handle.
    pub group: Option<PathBuf>,
}

/// Outbox entry: a guest value or a typed violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultMsg {
    Value { value: Value },
    Error { error: SandboxErr },
}

/// One guest instruction. Programs are small opcode sequences executed by
/// vetted handlers; the policy hooks are branches inside those handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instr {
    /// Set the program's result value.
    Post { value: Value },
    /// Write `data` to `path`, creating the file when the prefix is allowed.
    WriteFile { path: String, data: String },
    ReadFile { path: String },
    /// Open a TCP connection to `host:port`.
    Connect { host: String, port: u16 },
    /// Make `module` available to subsequent `Call` dispatch.
    Import { module: String },
    /// Allocate and retain `bytes` of guest memory.
    Alloc { bytes: u64 },
    /// Burn CPU; runs forever when `iters` is absent. Interruptible by the
    /// cooperative quota check and the stop flag.
    Spin { iters: Option<u64> },
    Sleep { ms: u64 },
    /// Time-of-day read. Wrapped guests see a zero-performance-counter stub.
    Now,
}

impl Instr {
    pub fn post(value: Value) -> Self {
        Instr::Post { value }
    }

    pub fn write_file(path: impl Into<String>, data: impl Into<String>) -> Self {
        Instr::WriteFile {
            path: path.into(),
            data: data.into(),
        }
    }

    pub fn read_file(path: impl Into<String>) -> Self {
        Instr::ReadFile { path: path.into() }
    }

    pub fn connect(host: impl Into<String>, port: u16) -> Self {
        Instr::Connect {
            host: host.into(),
            port,
        }
    }

    pub fn import(module: impl Into<String>) -> Self {
        Instr::Import {
            module: module.into(),
        }
    }

    pub fn kind(&self) -> InstrKind {
        match self {
            Instr::Post { .. } => InstrKind::Post,
            Instr::WriteFile { .. } => InstrKind::WriteFile,
            Instr::ReadFile { .. } => InstrKind::ReadFile,
            Instr::Connect { .. } => InstrKind::Connect,
            Instr::Import { .. } => InstrKind::Import,
            Instr::Alloc { .. } => InstrKind::Alloc,
            Instr::Spin { .. } => InstrKind::Spin,
            Instr::Sleep { .. } => InstrKind::Sleep,
            Instr::Now => InstrKind::Now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstrKind {
    Post,
    WriteFile,
    ReadFile,
    Connect,
    Import,
    Alloc,
    Spin,
    Sleep,
    Now,
}

/// One recorded step in a worker's trace log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Exec { instrs: usize },
    Instr { kind: InstrKind },
    Call { target: String },
    Reset,
}

/// Resource sample consumed by the watchdog. Produced by an external
/// cgroup/eBPF sampler; the supervisor only exposes the channel it feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEvent {
    pub name: String,
    pub cpu_ms: u64,
    pub rss_bytes: u64,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn op_serialization_is_tagged() {
        let op = Op::Exec {
            program: vec![Instr::post(serde_json::json!("hi"))],
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "exec");
        assert_eq!(json["program"][0]["op"], "post");
    }

    #[test]
    fn instr_kind_names_are_snake_case() {
        assert_eq!(InstrKind::WriteFile.to_string(), "write_file");
        let name: &'static str = InstrKind::Spin.into();
        assert_eq!(name, "spin");
    }

    #[test]
    fn result_round_trips() {
        let msg = ResultMsg::Error {
            error: SandboxErr::Policy("open of /etc/passwd blocked".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ResultMsg = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }
}
