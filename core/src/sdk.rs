//! High-level helpers: one-shot sandboxed calls and sandboxed pipelines.

use std::time::Duration;

use warden_policy::CompiledPolicy;
use warden_protocol::protocol::Kwargs;
use warden_protocol::protocol::Value;

use crate::error::Result;
use crate::supervisor;
use crate::supervisor::SpawnOptions;

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Run one call to `module.func` inside a short-lived sandbox. The sandbox
/// is named after the function and closed on every exit path.
pub async fn run_sandboxed(target: &str, args: Vec<Value>) -> Result<Value> {
    run_stage(target, None, args).await
}

/// N sequential stages, each executing in its own short-lived worker.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

struct Stage {
    target: String,
    policy: Option<CompiledPolicy>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage by dotted function path, optionally sandboxed under
    /// `policy`.
    pub fn add_stage(mut self, target: impl Into<String>, policy: Option<CompiledPolicy>) -> Self {
        self.stages.push(Stage {
            target: target.into(),
            policy,
        });
        self
    }

    /// Feed `data` through all stages in order.
    pub async fn run(&self, data: Value) -> Result<Value> {
        let mut value = data;
        for stage in &self.stages {
            value = run_stage(&stage.target, stage.policy.clone(), vec![value]).await?;
        }
        Ok(value)
    }
}

async fn run_stage(
    target: &str,
    policy: Option<CompiledPolicy>,
    args: Vec<Value>,
) -> Result<Value> {
    let name = target.rsplit('.').next().unwrap_or(target);
    let handle = supervisor::spawn(
        name,
        SpawnOptions {
            policy,
            ..Default::default()
        },
    )
    .await?;
    let result = handle
        .call(target, args, Kwargs::new(), Some(CALL_TIMEOUT))
        .await;
    let _ = handle.close().await;
    result
}
