// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_channel::Sender;
use subtle::ConstantTimeEq;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;
use warden_policy::CompiledPolicy;
use warden_protocol::config::SandboxConfig;
use warden_protocol::error::SandboxErr;
use warden_protocol::protocol::Op;
use warden_protocol::protocol::QuotaEvent;
use warden_protocol::protocol::ResetRequest;

use crate::alerts::AlertManager;
use crate::capability::Capability;
use crate::cgroup;
use crate::error::Result;
use crate::error::WardenErr;
use crate::handle::Handle;
use crate::policy_map::PolicyMap;
use crate::watchdog::Watchdog;
use crate::worker::QUEUE_BOUND;
use crate::worker::Worker;

const MAX_NAME_LEN: usize = 64;
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
const WATCHDOG_STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// Options accepted by [`Supervisor::spawn`].
#[derive(Default, Clone)]
pub struct SpawnOptions {
    pub policy: Option<CompiledPolicy>,
    pub cpu_ms: Option<u64>,
    pub mem_bytes: Option<u64>,
    pub allowed_imports: Option<BTreeSet<String>>,
    pub numa_node: Option<u32>,
}

/// Credential for privileged operations: a previously issued root
/// capability (checked by identity) or the configured shared secret
/// (compared in constant time).
#[derive(Clone, Copy)]
pub enum AuthToken<'a> {
    Capability(&'a Capability),
    Secret(&'a str),
}

pub(crate) struct SandboxRecord {
    pub(crate) worker: Arc<Worker>,
    pub(crate) group: Option<PathBuf>,
}

#[derive(Default)]
pub(crate) struct Inner {
    pub(crate) records: HashMap<String, SandboxRecord>,
    warm: Vec<Arc<Worker>>,
}

/// Process-scoped owner of every sandbox: registry, warm pool, watchdog,
/// alert subscribers, and the live ruleset map.
pub struct Supervisor {
    inner: Arc<Mutex<Inner>>,
    alerts: Arc<AlertManager>,
    policy_map: Arc<PolicyMap>,
    watchdog: Watchdog,
    quota_tx: Sender<QuotaEvent>,
    root: Capability,
    policy_token: Mutex<Option<String>>,
    down: AtomicBool,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Self::with_warm_pool(0)
    }

    /// Create a supervisor with `warm` pre-started workers. Warm workers are
    /// reset into the requested configuration when consumed by `spawn`.
    pub fn with_warm_pool(warm: usize) -> Arc<Self> {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let alerts = Arc::new(AlertManager::new());
        let policy_map = Arc::new(PolicyMap::new());
        let (quota_tx, quota_rx) = async_channel::bounded(QUEUE_BOUND);
        let watchdog = Watchdog::start(quota_rx, Arc::clone(&inner));

        let supervisor = Arc::new(Self {
            inner,
            alerts,
            policy_map,
            watchdog,
            quota_tx,
            root: Capability::new("root"),
            policy_token: Mutex::new(None),
            down: AtomicBool::new(false),
        });

        for _ in 0..warm {
            match supervisor.start_worker() {
                Ok(worker) => supervisor.inner.lock().unwrap().warm.push(worker),
                Err(err) => warn!("failed to pre-start warm worker: {err}"),
            }
        }
        supervisor
    }

    /// Create and start a sandbox. Reuses a warm worker when one is
    /// available; the worker applies the configuration from its own thread
    /// via a reset control message.
    pub async fn spawn(&self, name: &str, opts: SpawnOptions) -> Result<Handle> {
        if self.down.load(Ordering::Acquire) {
            return Err(WardenErr::ShutDown);
        }
        validate_name(name)?;
        {
            let mut inner = self.inner.lock().unwrap();
            cleanup_dead(&mut inner);
            if let Some(existing) = inner.records.get(name)
                && existing.worker.is_alive()
            {
                return Err(WardenErr::InvalidName(format!(
                    "sandbox name '{name}' is already active"
                )));
            }
        }

        // Best-effort resource group; failures are logged, never fatal.
        let group = cgroup::create(name, opts.cpu_ms, opts.mem_bytes);

        let worker = match self.pop_warm() {
            Some(worker) => worker,
            None => self.start_worker().map_err(WardenErr::Io)?,
        };

        let config = SandboxConfig {
            name: name.to_string(),
            policy: opts.policy,
            cpu_ms: opts.cpu_ms,
            mem_bytes: opts.mem_bytes,
            allowed_imports: opts.allowed_imports,
            numa_node: opts.numa_node,
        };
        worker
            .submit(Op::Reset(Box::new(ResetRequest {
                config,
                group: group.clone(),
            })))
            .await?;

        {
            let mut inner = self.inner.lock().unwrap();
            cleanup_dead(&mut inner);
            if let Some(existing) = inner.records.get(name)
                && existing.worker.is_alive()
            {
                // Unique names: stop the replacement worker we just reset.
                worker.request_stop();
                return Err(WardenErr::InvalidName(format!(
                    "sandbox name '{name}' is already active"
                )));
            }
            inner.records.insert(
                name.to_string(),
                SandboxRecord {
                    worker: Arc::clone(&worker),
                    group,
                },
            );
        }
        debug!("spawned sandbox '{name}'");
        Ok(Handle::new(worker, name.to_string(), true))
    }

    /// Currently live sandboxes as borrowed (non-owning) handles.
    pub fn list_active(&self) -> HashMap<String, Handle> {
        let mut inner = self.inner.lock().unwrap();
        cleanup_dead(&mut inner);
        inner
            .records
            .iter()
            .filter(|(_, record)| record.worker.is_alive())
            .map(|(name, record)| {
                (
                    name.clone(),
                    Handle::new(Arc::clone(&record.worker), name.clone(), false),
                )
            })
            .collect()
    }

    /// Swap the live ruleset map from a compiled-policy JSON file. Requires
    /// the root capability or the configured policy token.
    pub fn reload_policy(&self, path: &Path, token: AuthToken<'_>) -> Result<()> {
        self.check_auth(token)?;
        self.policy_map.load_file(path)
    }

    /// Install the shared secret accepted by non-capability reloads.
    pub fn set_policy_token(&self, secret: impl Into<String>) {
        *self.policy_token.lock().unwrap() = Some(secret.into());
    }

    pub fn register_alert_handler<F>(&self, callback: F)
    where
        F: Fn(&str, &SandboxErr) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.alerts.register(callback);
    }

    /// The canonical root capability for this supervisor instance.
    pub fn root_capability(&self) -> Capability {
        self.root.clone()
    }

    /// Sender feeding the watchdog; an external resource sampler pushes
    /// [`QuotaEvent`]s here.
    pub fn quota_events(&self) -> Sender<QuotaEvent> {
        self.quota_tx.clone()
    }

    /// The live-reloadable ruleset map consulted by workers that carry no
    /// policy of their own.
    pub fn ruleset(&self) -> Option<Arc<CompiledPolicy>> {
        self.policy_map.snapshot()
    }

    /// Stop the watchdog and every active and warm worker, joining each
    /// within a bounded timeout and releasing resource groups. Requires the
    /// canonical root capability; double-shutdown is a no-op.
    pub async fn shutdown(&self, cap: &Capability) -> Result<()> {
        if !cap.is(&self.root) {
            warn!("shutdown rejected: capability '{}' is not canonical", cap.name());
            return Err(SandboxErr::PolicyAuth.into());
        }
        if self.down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("supervisor shutting down");

        self.quota_tx.close();
        self.watchdog.stop(WATCHDOG_STOP_TIMEOUT).await;

        let (records, warm) = {
            let mut inner = self.inner.lock().unwrap();
            (
                inner.records.drain().collect::<Vec<_>>(),
                std::mem::take(&mut inner.warm),
            )
        };
        for (name, record) in records {
            record.worker.stop(SHUTDOWN_JOIN_TIMEOUT).await;
            cgroup::delete(record.group.as_deref());
            debug!("stopped sandbox '{name}'");
        }
        for worker in warm {
            worker.stop(SHUTDOWN_JOIN_TIMEOUT).await;
        }
        Ok(())
    }

    fn check_auth(&self, token: AuthToken<'_>) -> Result<()> {
        let authorized = match token {
            AuthToken::Capability(cap) => cap.is(&self.root),
            AuthToken::Secret(secret) => {
                let guard = self.policy_token.lock().unwrap();
                match guard.as_deref() {
                    Some(expected) => {
                        bool::from(expected.as_bytes().ct_eq(secret.as_bytes()))
                    }
                    None => false,
                }
            }
        };
        if authorized {
            Ok(())
        } else {
            warn!("policy reload rejected: invalid token");
            Err(SandboxErr::PolicyAuth.into())
        }
    }

    fn start_worker(&self) -> std::io::Result<Arc<Worker>> {
        let placeholder = format!("warm-{}", Uuid::new_v4());
        Ok(Arc::new(Worker::start(
            placeholder,
            Arc::clone(&self.alerts),
            Arc::clone(&self.policy_map),
        )?))
    }

    fn pop_warm(&self) -> Option<Arc<Worker>> {
        let mut inner = self.inner.lock().unwrap();
        while let Some(worker) = inner.warm.pop() {
            if worker.is_alive() {
                return Some(worker);
            }
            debug!("discarding dead warm worker");
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn warm_pool_len(&self) -> usize {
        self.inner.lock().unwrap().warm.len()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.quota_tx.close();
        self.watchdog.request_stop();
        let inner = self.inner.lock().unwrap();
        for record in inner.records.values() {
            record.worker.request_stop();
        }
        for worker in &inner.warm {
            worker.request_stop();
        }
    }
}

fn cleanup_dead(inner: &mut Inner) {
    let dead: Vec<String> = inner
        .records
        .iter()
        .filter(|(_, record)| !record.worker.is_alive())
        .map(|(name, _)| name.clone())
        .collect();
    for name in dead {
        if let Some(record) = inner.records.remove(&name) {
            cgroup::delete(record.group.as_deref());
            debug!("cleaned up dead sandbox '{name}'");
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(WardenErr::InvalidName("name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(WardenErr::InvalidName(format!(
            "name exceeds {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Process-wide current supervisor. Shutdown through the module-level
// `shutdown` replaces the slot with a fresh instance, so the public
// aliases below always operate on a usable supervisor.
// ---------------------------------------------------------------------

static CURRENT: LazyLock<RwLock<Arc<Supervisor>>> =
    LazyLock::new(|| RwLock::new(Supervisor::new()));

/// The current process-wide supervisor.
pub fn current() -> Arc<Supervisor> {
    CURRENT.read().unwrap().clone()
}

pub async fn spawn(name: &str, opts: SpawnOptions) -> Result<Handle> {
    current().spawn(name, opts).await
}

pub fn list_active() -> HashMap<String, Handle> {
    current().list_active()
}

pub fn reload_policy(path: &Path, token: AuthToken<'_>) -> Result<()> {
    current().reload_policy(path, token)
}

pub fn set_policy_token(secret: impl Into<String>) {
    current().set_policy_token(secret);
}

pub fn register_alert_handler<F>(callback: F)
where
    F: Fn(&str, &SandboxErr) -> anyhow::Result<()> + Send + Sync + 'static,
{
    current().register_alert_handler(callback);
}

pub fn root_capability() -> Capability {
    current().root_capability()
}

/// Shut down the current supervisor and replace it with a fresh instance.
/// An invalid capability leaves the current instance untouched.
pub async fn shutdown(cap: &Capability) -> Result<()> {
    let previous = current();
    previous.shutdown(cap).await?;
    *CURRENT.write().unwrap() = Supervisor::new();
    Ok(())
}
