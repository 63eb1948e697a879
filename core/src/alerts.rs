// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::Mutex;

use tracing::error;
use warden_protocol::error::SandboxErr;

/// Subscriber invoked for each policy violation: `(sandbox name, error)`.
pub type AlertHandler = Arc<dyn Fn(&str, &SandboxErr) -> anyhow::Result<()> + Send + Sync>;

/// Fan-out of violation events to registered subscribers.
#[derive(Default)]
pub struct AlertManager {
    subs: Mutex<Vec<AlertHandler>>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, callback: F)
    where
        F: Fn(&str, &SandboxErr) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subs.lock().unwrap().push(Arc::new(callback));
    }

    /// Invoke every subscriber in registration order. A failing subscriber is
    /// logged and does not stop delivery to later subscribers; the collected
    /// failures are returned for inspection.
    pub fn notify(&self, sandbox: &str, violation: &SandboxErr) -> Vec<anyhow::Error> {
        let subs = self.subs.lock().unwrap().clone();
        let mut failures = Vec::new();
        for (idx, callback) in subs.iter().enumerate() {
            if let Err(err) = callback.as_ref()(sandbox, violation) {
                error!("alert subscriber #{idx} failed for sandbox {sandbox}: {err:#}");
                failures.push(err);
            }
        }
        failures
    }
}
