use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::warn;
use warden_protocol::config::SandboxConfig;
use warden_protocol::error::SandboxErr;
use warden_protocol::protocol::Instr;
use warden_protocol::protocol::Kwargs;
use warden_protocol::protocol::Op;
use warden_protocol::protocol::TraceEvent;
use warden_protocol::protocol::Value;
use warden_protocol::stats::Stats;

use crate::error::Result;
use crate::worker::Worker;

pub(crate) const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(200);

/// Caller-facing handle to one sandbox.
///
/// Handles returned by `spawn` own the worker: dropping one that is still
/// running logs a warning and best-effort stops the worker, so scoped use
/// closes on every exit path. Handles from `list_active` are borrowed views
/// and never close on drop.
pub struct Handle {
    worker: Arc<Worker>,
    name: String,
    closed: AtomicBool,
    owned: bool,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.name)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("owned", &self.owned)
            .finish()
    }
}

impl Handle {
    pub(crate) fn new(worker: Arc<Worker>, name: String, owned: bool) -> Self {
        Self {
            worker,
            name,
            closed: AtomicBool::new(false),
            owned,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a guest program. The result (or error) arrives via [`recv`].
    ///
    /// [`recv`]: Handle::recv
    pub async fn exec(&self, program: Vec<Instr>) -> Result<()> {
        self.worker.submit(Op::Exec { program }).await
    }

    /// Enqueue a single-instruction program.
    pub async fn exec_one(&self, instr: Instr) -> Result<()> {
        self.exec(vec![instr]).await
    }

    /// Invoke `module.func` inside the sandbox and wait for one result.
    /// Typed violations raised by the evaluation surface as-is.
    pub async fn call(
        &self,
        target: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.worker
            .submit(Op::Call {
                target: target.to_string(),
                args,
                kwargs,
            })
            .await?;
        self.recv(timeout).await
    }

    /// Pop one outbox item: a value returns, a typed error raises, an empty
    /// outbox raises `Timeout` after `timeout`.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Value> {
        self.worker.recv(timeout).await
    }

    /// Stop the worker and join it within the default timeout. Double-close
    /// is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.close_within(DEFAULT_CLOSE_TIMEOUT).await
    }

    pub async fn close_within(&self, timeout: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.worker.stop(timeout).await;
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.worker.is_alive()
    }

    pub fn stats(&self) -> Stats {
        self.worker.stats()
    }

    /// Alias for [`Handle::stats`], matching the profiling surface.
    pub fn profile(&self) -> Stats {
        self.worker.stats()
    }

    /// The sandbox's current configuration, suitable for checkpointing.
    pub fn snapshot(&self) -> SandboxConfig {
        self.worker.snapshot()
    }

    pub fn enable_tracing(&self) {
        self.worker.enable_tracing();
    }

    pub fn get_trace_log(&self) -> Vec<TraceEvent> {
        self.worker.trace_log()
    }

    /// Install a callback invoked synchronously for each policy violation,
    /// before the shared alert subscribers.
    pub fn on_violation<F>(&self, callback: F)
    where
        F: Fn(&str, &SandboxErr) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.worker.set_on_violation(Arc::new(callback));
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.owned && !self.closed.load(Ordering::SeqCst) && self.worker.is_alive() {
            warn!(
                "sandbox '{}' handle dropped while its worker is running; stopping it",
                self.name
            );
            self.worker.request_stop();
        }
    }
}
