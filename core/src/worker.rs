// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use async_channel::Receiver;
use async_channel::Sender;
use tracing::error;
use tracing::warn;
use warden_policy::FsRule;
use warden_policy::NetRule;
use warden_policy::SandboxRules;
use warden_policy::fs_rules_allow;
use warden_policy::net_rules_allow;
use warden_protocol::config::SandboxConfig;
use warden_protocol::error::SandboxErr;
use warden_protocol::protocol::Instr;
use warden_protocol::protocol::Kwargs;
use warden_protocol::protocol::Op;
use warden_protocol::protocol::ResetRequest;
use warden_protocol::protocol::ResultMsg;
use warden_protocol::protocol::Submission;
use warden_protocol::protocol::TraceEvent;
use warden_protocol::protocol::Value;
use warden_protocol::stats::Stats;

use crate::alerts::AlertHandler;
use crate::alerts::AlertManager;
use crate::cgroup;
use crate::error::Result;
use crate::error::WardenErr;
use crate::modules;
use crate::numa;
use crate::policy_map::PolicyMap;
use crate::util::thread_cpu_ms;

pub(crate) const QUEUE_BOUND: usize = 64;

/// Prefix blocked by the implicit fs rule when a sandbox has no explicit
/// fs rule set.
const SYSTEM_CONFIG_PREFIX: &str = "/etc";

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How often long-running handlers check the stop flag and the CPU quota.
const COOP_CHECK_INTERVAL: u64 = 4096;

/// One sandboxed execution context: a dedicated OS thread with a serial
/// inbox, an outbox of results, counters, and a bound policy.
pub(crate) struct Worker {
    shared: Arc<WorkerShared>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

pub(crate) struct WorkerShared {
    inbox_tx: Sender<Submission>,
    outbox_tx: Sender<ResultMsg>,
    outbox_rx: Receiver<ResultMsg>,
    stop: AtomicBool,
    alive: AtomicBool,
    next_id: AtomicU64,
    state: Mutex<WorkerState>,
    /// Wall-clock start of the in-flight message, for mid-op stat queries.
    in_flight: Mutex<Option<Instant>>,
    alerts: Arc<AlertManager>,
    policy_map: Arc<PolicyMap>,
}

struct WorkerState {
    config: SandboxConfig,
    /// Importer allow-set derived from the config (top-level components of
    /// `allowed_imports` merged with the policy's import list).
    effective_imports: Option<BTreeSet<String>>,
    group: Option<PathBuf>,
    stats: Stats,
    trace_enabled: bool,
    trace_log: Vec<TraceEvent>,
    on_violation: Option<AlertHandler>,
}

impl Worker {
    /// Start the worker thread. The worker idles until it receives its first
    /// `Op::Reset` carrying the real configuration.
    pub(crate) fn start(
        initial_name: String,
        alerts: Arc<AlertManager>,
        policy_map: Arc<PolicyMap>,
    ) -> io::Result<Self> {
        let (inbox_tx, inbox_rx) = async_channel::bounded(QUEUE_BOUND);
        let (outbox_tx, outbox_rx) = async_channel::bounded(QUEUE_BOUND);
        let shared = Arc::new(WorkerShared {
            inbox_tx,
            outbox_tx,
            outbox_rx,
            stop: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
            state: Mutex::new(WorkerState {
                config: SandboxConfig::named(initial_name),
                effective_imports: None,
                group: None,
                stats: Stats::default(),
                trace_enabled: false,
                trace_log: Vec::new(),
                on_violation: None,
            }),
            in_flight: Mutex::new(None),
            alerts,
            policy_map,
        });

        let thread_shared = Arc::clone(&shared);
        let join = std::thread::Builder::new()
            .name("warden-worker".to_string())
            .spawn(move || run_loop(thread_shared, inbox_rx))?;
        Ok(Self {
            shared,
            join: Mutex::new(Some(join)),
        })
    }

    pub(crate) async fn submit(&self, op: Op) -> Result<()> {
        let id = self
            .shared
            .next_id
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        self.shared
            .inbox_tx
            .send(Submission { id, op })
            .await
            .map_err(|_| WardenErr::WorkerGone)
    }

    /// Pop one outbox item: a value returns, a typed error re-raises. An
    /// empty outbox raises `Timeout` once `timeout` expires.
    pub(crate) async fn recv(&self, timeout: Option<Duration>) -> Result<Value> {
        let recv = self.shared.outbox_rx.recv();
        let msg = match timeout {
            Some(limit) => tokio::time::timeout(limit, recv)
                .await
                .map_err(|_| SandboxErr::Timeout)?,
            None => recv.await,
        }
        .map_err(|_| WardenErr::WorkerGone)?;
        match msg {
            ResultMsg::Value { value } => Ok(value),
            ResultMsg::Error { error } => Err(error.into()),
        }
    }

    /// Set the stop flag and nudge the control loop. Does not wait.
    pub(crate) fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let _ = self.shared.inbox_tx.try_send(Submission {
            id: "stop".to_string(),
            op: Op::Stop,
        });
    }

    pub(crate) async fn stop(&self, timeout: Duration) {
        self.request_stop();
        let deadline = Instant::now() + timeout;
        loop {
            if self.thread_finished() {
                self.reap();
                return;
            }
            if Instant::now() >= deadline {
                warn!("worker '{}' did not exit within {timeout:?}", self.name());
                return;
            }
            tokio::time::sleep(JOIN_POLL_INTERVAL).await;
        }
    }

    /// Synchronous variant for callers that own their own thread.
    pub(crate) fn stop_blocking(&self, timeout: Duration) {
        self.request_stop();
        let deadline = Instant::now() + timeout;
        loop {
            if self.thread_finished() {
                self.reap();
                return;
            }
            if Instant::now() >= deadline {
                warn!("worker '{}' did not exit within {timeout:?}", self.name());
                return;
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Push a terminal error into the outbox out of band (watchdog path).
    /// Never blocks; a full outbox drops the injection with a warning.
    pub(crate) fn inject_error(&self, error: SandboxErr) {
        if self
            .shared
            .outbox_tx
            .try_send(ResultMsg::Error { error })
            .is_err()
        {
            warn!("outbox of worker '{}' full; dropped injected error", self.name());
        }
    }

    pub(crate) fn stats(&self) -> Stats {
        let mut stats = self.shared.state.lock().unwrap().stats.clone();
        // A mid-op query charges the in-flight operation's wall time.
        if let Some(started) = *self.shared.in_flight.lock().unwrap() {
            stats.cpu_ms += started.elapsed().as_secs_f64() * 1e3;
        }
        stats
    }

    pub(crate) fn snapshot(&self) -> SandboxConfig {
        self.shared.state.lock().unwrap().config.clone()
    }

    pub(crate) fn name(&self) -> String {
        self.shared.state.lock().unwrap().config.name.clone()
    }

    pub(crate) fn quotas(&self) -> (Option<u64>, Option<u64>) {
        let state = self.shared.state.lock().unwrap();
        (state.config.cpu_ms, state.config.mem_bytes)
    }

    pub(crate) fn enable_tracing(&self) {
        self.shared.state.lock().unwrap().trace_enabled = true;
    }

    pub(crate) fn trace_log(&self) -> Vec<TraceEvent> {
        self.shared.state.lock().unwrap().trace_log.clone()
    }

    pub(crate) fn set_on_violation(&self, handler: AlertHandler) {
        self.shared.state.lock().unwrap().on_violation = Some(handler);
    }

    fn thread_finished(&self) -> bool {
        self.join
            .lock()
            .unwrap()
            .as_ref()
            .map(std::thread::JoinHandle::is_finished)
            .unwrap_or(true)
    }

    fn reap(&self) {
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// The worker control loop: strictly sequential, one message at a time.
fn run_loop(shared: Arc<WorkerShared>, inbox_rx: Receiver<Submission>) {
    let mut store = ValueStore::default();
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        let Ok(submission) = inbox_rx.recv_blocking() else {
            break;
        };
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        match submission.op {
            Op::Stop => break,
            Op::Reset(request) => shared.apply_reset(*request, &mut store),
            Op::Exec { program } => shared.run_message(Payload::Exec(program), &mut store),
            Op::Call {
                target,
                args,
                kwargs,
            } => shared.run_message(
                Payload::Call {
                    target,
                    args,
                    kwargs,
                },
                &mut store,
            ),
        }
    }
    shared.alive.store(false, Ordering::Release);
}

enum Payload {
    Exec(Vec<Instr>),
    Call {
        target: String,
        args: Vec<Value>,
        kwargs: Kwargs,
    },
}

impl WorkerShared {
    /// Re-initialize in place. Runs on the worker thread so the resource
    /// group attach and NUMA bind apply to the right thread.
    fn apply_reset(&self, request: ResetRequest, store: &mut ValueStore) {
        let ResetRequest { config, group } = request;
        let numa_node = config.numa_node;
        let old_group;
        {
            let mut state = self.state.lock().unwrap();
            old_group = state.group.take();
            state.effective_imports = effective_imports(&config);
            state.stats = Stats::default();
            state.trace_enabled = false;
            state.trace_log.clear();
            state.on_violation = None;
            state.group = group.clone();
            state.config = config;
        }
        store.clear();

        cgroup::attach_current(group.as_deref());
        if let Some(old) = old_group
            && Some(&old) != group.as_ref()
        {
            cgroup::delete(Some(&old));
        }
        if let Some(node) = numa_node {
            numa::bind_current_thread(node);
        }
    }

    fn run_message(&self, payload: Payload, store: &mut ValueStore) {
        let wall_start = Instant::now();
        let cpu_start = thread_cpu_ms();
        *self.in_flight.lock().unwrap() = Some(wall_start);

        let (ambient, cpu_quota_ms, mem_quota_bytes, cpu_base_ms, trace_enabled) = {
            let state = self.state.lock().unwrap();
            (
                compute_ambient(&state, &self.policy_map),
                state.config.cpu_ms,
                state.config.mem_bytes,
                state.stats.cpu_ms,
                state.trace_enabled,
            )
        };
        let quota = QuotaGuard {
            cpu_quota_ms,
            mem_quota_bytes,
            cpu_base_ms,
            cpu_start_ms: cpu_start,
            stop: &self.stop,
        };
        let mut trace = trace_enabled.then(Vec::new);

        let mut result = dispatch(payload, &ambient, &quota, store, trace.as_mut());

        let cpu_delta = (thread_cpu_ms() - cpu_start).max(0.0);
        *self.in_flight.lock().unwrap() = None;
        let elapsed_ms = wall_start.elapsed().as_secs_f64() * 1e3;

        let name;
        let on_violation;
        {
            let mut state = self.state.lock().unwrap();
            state.stats.cpu_ms += cpu_delta;
            state.stats.peak_mem_bytes = state.stats.peak_mem_bytes.max(store.peak_bytes());
            state.stats.operations += 1;

            if result.is_ok() {
                if let Some(quota_ms) = state.config.cpu_ms
                    && state.stats.cpu_ms > quota_ms as f64
                {
                    result = Err(SandboxErr::CpuExceeded);
                } else if let Some(quota_bytes) = state.config.mem_bytes
                    && state.stats.peak_mem_bytes > quota_bytes
                {
                    result = Err(SandboxErr::MemoryExceeded);
                }
            }
            if result.is_err() {
                state.stats.errors += 1;
            }
            state.stats.record_latency(elapsed_ms);
            if let Some(events) = trace {
                state.trace_log.extend(events);
            }
            name = state.config.name.clone();
            on_violation = state.on_violation.clone();
        }

        let msg = match result {
            Ok(value) => ResultMsg::Value { value },
            Err(violation) => {
                if violation.is_policy_violation() {
                    if let Some(callback) = on_violation
                        && let Err(err) = callback.as_ref()(&name, &violation)
                    {
                        error!("violation callback failed for sandbox {name}: {err:#}");
                    }
                    self.alerts.notify(&name, &violation);
                }
                ResultMsg::Error { error: violation }
            }
        };
        if self.outbox_tx.send_blocking(msg).is_err() {
            warn!("outbox closed; dropped result for sandbox {name}");
        }
    }
}

/// Importer allow-set for a configuration: top-level components of
/// `allowed_imports`, merged with the policy's import list when both are
/// provided. An empty policy import list places no restriction.
fn effective_imports(config: &SandboxConfig) -> Option<BTreeSet<String>> {
    let policy_imports: Option<BTreeSet<String>> = config
        .policy
        .as_ref()
        .and_then(|policy| policy.rules_for(&config.name))
        .map(|rules| {
            rules
                .imports
                .iter()
                .map(|name| top_level(name).to_string())
                .collect::<BTreeSet<_>>()
        })
        .filter(|set| !set.is_empty());
    let provided: Option<BTreeSet<String>> = config
        .allowed_imports
        .as_ref()
        .map(|set| set.iter().map(|name| top_level(name).to_string()).collect());

    match (provided, policy_imports) {
        (Some(mut provided), Some(from_policy)) => {
            provided.extend(from_policy);
            Some(provided)
        }
        (Some(provided), None) => Some(provided),
        (None, Some(from_policy)) => Some(from_policy),
        (None, None) => None,
    }
}

fn top_level(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

/// Per-message ambient policy, recomputed at message start and passed
/// explicitly to every handler. Never shared across threads.
struct Ambient {
    fs: FsAmbient,
    net: NetAmbient,
    imports: Option<BTreeSet<String>>,
}

enum FsAmbient {
    /// Explicit rule set: first match wins, no match denies.
    Explicit(Vec<FsRule>),
    /// Legacy default: everything but the system-config prefix.
    DenySystemConfig,
}

impl FsAmbient {
    fn allows(&self, path: &Path) -> bool {
        match self {
            FsAmbient::Explicit(rules) => fs_rules_allow(rules, path).unwrap_or(false),
            FsAmbient::DenySystemConfig => !path.starts_with(SYSTEM_CONFIG_PREFIX),
        }
    }
}

enum NetAmbient {
    /// No `net` section: every connect is allowed (legacy default).
    AllowAll,
    /// Explicit rule set, possibly empty: no match denies.
    Explicit(Vec<NetRule>),
}

impl NetAmbient {
    fn allows(&self, addr: &str) -> bool {
        match self {
            NetAmbient::AllowAll => true,
            NetAmbient::Explicit(rules) => net_rules_allow(rules, addr).unwrap_or(false),
        }
    }
}

fn compute_ambient(state: &WorkerState, policy_map: &PolicyMap) -> Ambient {
    let resolved: Option<SandboxRules> = match &state.config.policy {
        Some(policy) => policy.rules_for(&state.config.name).cloned(),
        // Workers without a captured policy fall back to the live-reloaded
        // shared ruleset map.
        None => policy_map
            .snapshot()
            .and_then(|policy| policy.rules_for(&state.config.name).cloned()),
    };
    let (fs, net) = match resolved {
        Some(rules) => (
            match rules.fs {
                Some(fs_rules) => FsAmbient::Explicit(fs_rules),
                None => FsAmbient::DenySystemConfig,
            },
            match rules.net {
                Some(net_rules) => NetAmbient::Explicit(net_rules),
                None => NetAmbient::AllowAll,
            },
        ),
        None => (FsAmbient::DenySystemConfig, NetAmbient::AllowAll),
    };
    Ambient {
        fs,
        net,
        imports: state.effective_imports.clone(),
    }
}

struct QuotaGuard<'a> {
    cpu_quota_ms: Option<u64>,
    mem_quota_bytes: Option<u64>,
    cpu_base_ms: f64,
    cpu_start_ms: f64,
    stop: &'a AtomicBool,
}

impl QuotaGuard<'_> {
    /// Cooperative CPU check for long-running handlers.
    fn check_cpu(&self) -> std::result::Result<(), SandboxErr> {
        if let Some(quota_ms) = self.cpu_quota_ms {
            let used = self.cpu_base_ms + (thread_cpu_ms() - self.cpu_start_ms).max(0.0);
            if used > quota_ms as f64 {
                return Err(SandboxErr::CpuExceeded);
            }
        }
        Ok(())
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// The guest value store: retained allocations accounted against the memory
/// quota. The peak is relative to the empty store captured at worker start
/// (or the last reset).
#[derive(Default)]
pub(crate) struct ValueStore {
    blobs: Vec<Vec<u8>>,
    current_bytes: u64,
    peak_bytes: u64,
}

impl ValueStore {
    fn note_peak(&mut self, bytes: u64) {
        self.peak_bytes = self.peak_bytes.max(bytes);
    }

    fn retain(&mut self, blob: Vec<u8>) {
        self.current_bytes += blob.len() as u64;
        self.blobs.push(blob);
    }

    pub(crate) fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }

    fn clear(&mut self) {
        self.blobs.clear();
        self.current_bytes = 0;
        self.peak_bytes = 0;
    }
}

fn dispatch(
    payload: Payload,
    ambient: &Ambient,
    quota: &QuotaGuard<'_>,
    store: &mut ValueStore,
    mut trace: Option<&mut Vec<TraceEvent>>,
) -> std::result::Result<Value, SandboxErr> {
    let mut ctx = CallCtx {
        ambient,
        quota,
        store,
    };
    match payload {
        Payload::Exec(program) => {
            if let Some(events) = trace.as_deref_mut() {
                events.push(TraceEvent::Exec {
                    instrs: program.len(),
                });
            }
            let mut posted = Value::Null;
            for instr in program {
                if let Some(events) = trace.as_deref_mut() {
                    events.push(TraceEvent::Instr { kind: instr.kind() });
                }
                if let Some(value) = ctx.run_instr(instr)? {
                    posted = value;
                }
            }
            Ok(posted)
        }
        Payload::Call {
            target,
            args,
            kwargs,
        } => {
            if let Some(events) = trace.as_deref_mut() {
                events.push(TraceEvent::Call {
                    target: target.clone(),
                });
            }
            ctx.call(&target, &args, &kwargs)
        }
    }
}

/// Mutable handler context for one in-flight message.
pub(crate) struct CallCtx<'a> {
    ambient: &'a Ambient,
    quota: &'a QuotaGuard<'a>,
    store: &'a mut ValueStore,
}

impl CallCtx<'_> {
    fn run_instr(&mut self, instr: Instr) -> std::result::Result<Option<Value>, SandboxErr> {
        match instr {
            Instr::Post { value } => Ok(Some(value)),
            Instr::WriteFile { path, data } => {
                self.write_file(&path, &data)?;
                Ok(None)
            }
            Instr::ReadFile { path } => {
                self.read_file(&path)?;
                Ok(None)
            }
            Instr::Connect { host, port } => {
                self.connect(&host, port)?;
                Ok(None)
            }
            Instr::Import { module } => {
                self.import(&module)?;
                Ok(None)
            }
            Instr::Alloc { bytes } => {
                self.alloc(bytes)?;
                Ok(None)
            }
            Instr::Spin { iters } => {
                self.spin(iters)?;
                Ok(None)
            }
            Instr::Sleep { ms } => {
                self.sleep(ms)?;
                Ok(None)
            }
            Instr::Now => Ok(None),
        }
    }

    /// `Call` dispatch: import the top-level module through the guarded
    /// importer, fetch the function directly from the vetted table, invoke.
    fn call(
        &mut self,
        target: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> std::result::Result<Value, SandboxErr> {
        let Some((module, func)) = target.rsplit_once('.') else {
            return Err(SandboxErr::Sandbox(format!(
                "invalid call target '{target}'"
            )));
        };
        self.import(module)?;
        let Some(host_fn) = modules::lookup(module, func) else {
            return Err(SandboxErr::Sandbox(format!(
                "no function '{func}' in module '{module}'"
            )));
        };
        host_fn(args, kwargs, self)
    }

    pub(crate) fn check_fs(&self, path: &str) -> std::result::Result<PathBuf, SandboxErr> {
        let resolved = std::path::absolute(path)
            .map_err(|err| SandboxErr::Sandbox(format!("cannot resolve path {path}: {err}")))?;
        if self.ambient.fs.allows(&resolved) {
            Ok(resolved)
        } else {
            Err(SandboxErr::Policy(format!(
                "open of {} blocked by policy",
                resolved.display()
            )))
        }
    }

    pub(crate) fn write_file(
        &mut self,
        path: &str,
        data: &str,
    ) -> std::result::Result<Value, SandboxErr> {
        let resolved = self.check_fs(path)?;
        fs::write(&resolved, data).map_err(|err| {
            SandboxErr::Sandbox(format!("write to {} failed: {err}", resolved.display()))
        })?;
        Ok(Value::from(data.len() as u64))
    }

    pub(crate) fn read_file(&mut self, path: &str) -> std::result::Result<Value, SandboxErr> {
        let resolved = self.check_fs(path)?;
        let contents = fs::read_to_string(&resolved).map_err(|err| {
            SandboxErr::Sandbox(format!("read of {} failed: {err}", resolved.display()))
        })?;
        Ok(Value::String(contents))
    }

    pub(crate) fn connect(
        &mut self,
        host: &str,
        port: u16,
    ) -> std::result::Result<Value, SandboxErr> {
        let addr = format!("{host}:{port}");
        if !self.ambient.net.allows(&addr) {
            return Err(SandboxErr::Policy(format!(
                "connect to {addr} blocked by policy"
            )));
        }
        let mut resolved = (host, port)
            .to_socket_addrs()
            .map_err(|err| SandboxErr::Sandbox(format!("cannot resolve {addr}: {err}")))?;
        let Some(sockaddr) = resolved.next() else {
            return Err(SandboxErr::Sandbox(format!("no address for {addr}")));
        };
        TcpStream::connect_timeout(&sockaddr, CONNECT_TIMEOUT)
            .map_err(|err| SandboxErr::Sandbox(format!("connect to {addr} failed: {err}")))?;
        Ok(Value::String(addr))
    }

    pub(crate) fn import(&self, module: &str) -> std::result::Result<Value, SandboxErr> {
        let top = top_level(module);
        if let Some(allowed) = &self.ambient.imports
            && !allowed.contains(top)
        {
            return Err(SandboxErr::Policy(format!(
                "import of '{module}' is not permitted"
            )));
        }
        if !modules::module_exists(top) {
            return Err(SandboxErr::Sandbox(format!("no module '{module}'")));
        }
        Ok(Value::String(module.to_string()))
    }

    /// The zero-performance-counter stub wrapped guests see for time-of-day
    /// reads.
    pub(crate) fn now(&self) -> Value {
        Value::from(0)
    }

    fn alloc(&mut self, bytes: u64) -> std::result::Result<Value, SandboxErr> {
        let projected = self.store.current_bytes + bytes;
        self.store.note_peak(projected);
        if let Some(quota_bytes) = self.quota.mem_quota_bytes
            && projected > quota_bytes
        {
            return Err(SandboxErr::MemoryExceeded);
        }
        self.store.retain(vec![0u8; bytes as usize]);
        Ok(Value::from(bytes))
    }

    fn spin(&self, iters: Option<u64>) -> std::result::Result<(), SandboxErr> {
        let mut count: u64 = 0;
        loop {
            if let Some(limit) = iters
                && count >= limit
            {
                return Ok(());
            }
            count = count.wrapping_add(1);
            if count % COOP_CHECK_INTERVAL == 0 {
                if self.quota.stopping() {
                    return Err(SandboxErr::Sandbox("worker stopping".to_string()));
                }
                self.quota.check_cpu()?;
            }
            std::hint::spin_loop();
        }
    }

    fn sleep(&self, ms: u64) -> std::result::Result<(), SandboxErr> {
        let deadline = Instant::now() + Duration::from_millis(ms);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            if self.quota.stopping() {
                return Err(SandboxErr::Sandbox("worker stopping".to_string()));
            }
            self.quota.check_cpu()?;
            std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_policy::CompiledPolicy;
    use warden_policy::SandboxRules;

    fn config_with(
        policy: Option<CompiledPolicy>,
        allowed: Option<&[&str]>,
    ) -> SandboxConfig {
        SandboxConfig {
            name: "t".to_string(),
            policy,
            allowed_imports: allowed
                .map(|names| names.iter().map(|n| n.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn imports_merge_when_both_sides_are_provided() {
        let policy = CompiledPolicy::single(SandboxRules::new().allow_import("strings"));
        let merged =
            effective_imports(&config_with(Some(policy), Some(&["math"]))).unwrap();
        assert!(merged.contains("math"));
        assert!(merged.contains("strings"));
    }

    #[test]
    fn policy_imports_alone_restrict() {
        let policy = CompiledPolicy::single(SandboxRules::new().allow_import("math"));
        let set = effective_imports(&config_with(Some(policy), None)).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains("math"));
    }

    #[test]
    fn empty_policy_imports_place_no_restriction() {
        let policy = CompiledPolicy::single(SandboxRules::new());
        assert!(effective_imports(&config_with(Some(policy), None)).is_none());
        assert!(effective_imports(&config_with(None, None)).is_none());
    }

    #[test]
    fn dotted_allow_entries_reduce_to_top_level() {
        let set = effective_imports(&config_with(None, Some(&["math.linalg"]))).unwrap();
        assert!(set.contains("math"));
    }

    #[test]
    fn default_fs_ambient_blocks_only_system_config() {
        let ambient = FsAmbient::DenySystemConfig;
        assert!(ambient.allows(Path::new("/tmp/anything")));
        assert!(!ambient.allows(Path::new("/etc/passwd")));
        // Component comparison: /etcetera is not under /etc.
        assert!(ambient.allows(Path::new("/etcetera")));
    }

    #[test]
    fn explicit_fs_ambient_denies_unmatched_paths() {
        let ambient = FsAmbient::Explicit(vec![FsRule {
            action: warden_policy::FsAction::Allow,
            path: "/tmp".to_string(),
        }]);
        assert!(ambient.allows(Path::new("/tmp/file")));
        assert!(!ambient.allows(Path::new("/var/file")));
    }

    #[test]
    fn net_ambient_defaults_to_allow_all() {
        assert!(NetAmbient::AllowAll.allows("10.1.2.3:443"));
        assert!(!NetAmbient::Explicit(Vec::new()).allows("10.1.2.3:443"));
    }
}
