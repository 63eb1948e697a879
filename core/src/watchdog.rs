// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use async_channel::Receiver;
use tracing::debug;
use tracing::error;
use tracing::info;
use warden_protocol::error::SandboxErr;
use warden_protocol::protocol::QuotaEvent;

use crate::supervisor::Inner;
use crate::worker::Worker;

const STOP_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Out-of-band quota monitor.
///
/// Consumes [`QuotaEvent`]s produced by an external resource sampler, looks
/// up the live worker by name, and forcibly terminates offenders after
/// injecting the matching typed error into their outbox. Runs on its own
/// thread so it never blocks the supervisor.
pub(crate) struct Watchdog {
    stop: Arc<AtomicBool>,
    events: Receiver<QuotaEvent>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Watchdog {
    pub(crate) fn start(events: Receiver<QuotaEvent>, registry: Arc<Mutex<Inner>>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let join = {
            let stop = Arc::clone(&stop);
            let events = events.clone();
            std::thread::Builder::new()
                .name("warden-watchdog".to_string())
                .spawn(move || run(stop, events, registry))
        };
        let join = match join {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!("failed to start watchdog thread: {err}");
                None
            }
        };
        Self {
            stop,
            events,
            join: Mutex::new(join),
        }
    }

    /// Flag the watchdog down without waiting for it.
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.events.close();
    }

    /// Stop and join within `timeout`.
    pub(crate) async fn stop(&self, timeout: Duration) {
        self.request_stop();
        let deadline = Instant::now() + timeout;
        loop {
            let finished = self
                .join
                .lock()
                .unwrap()
                .as_ref()
                .map(std::thread::JoinHandle::is_finished)
                .unwrap_or(true);
            if finished {
                if let Some(handle) = self.join.lock().unwrap().take() {
                    let _ = handle.join();
                }
                return;
            }
            if Instant::now() >= deadline {
                debug!("watchdog did not exit within {timeout:?}");
                return;
            }
            tokio::time::sleep(JOIN_POLL_INTERVAL).await;
        }
    }
}

fn run(stop: Arc<AtomicBool>, events: Receiver<QuotaEvent>, registry: Arc<Mutex<Inner>>) {
    while !stop.load(Ordering::Acquire) {
        let Ok(event) = events.recv_blocking() else {
            break;
        };
        if stop.load(Ordering::Acquire) {
            break;
        }
        let worker: Option<Arc<Worker>> = registry
            .lock()
            .unwrap()
            .records
            .get(&event.name)
            .map(|record| Arc::clone(&record.worker));
        let Some(worker) = worker else {
            continue;
        };
        if !worker.is_alive() {
            continue;
        }

        let (cpu_quota_ms, mem_quota_bytes) = worker.quotas();
        if let Some(quota_ms) = cpu_quota_ms
            && event.cpu_ms >= quota_ms
        {
            info!(
                "sandbox '{}' exceeded cpu quota ({} >= {quota_ms} ms); terminating",
                event.name, event.cpu_ms
            );
            worker.inject_error(SandboxErr::CpuExceeded);
            worker.stop_blocking(STOP_JOIN_TIMEOUT);
        } else if let Some(quota_bytes) = mem_quota_bytes
            && event.rss_bytes >= quota_bytes
        {
            info!(
                "sandbox '{}' exceeded memory quota ({} >= {quota_bytes} bytes); terminating",
                event.name, event.rss_bytes
            );
            worker.inject_error(SandboxErr::MemoryExceeded);
            worker.stop_blocking(STOP_JOIN_TIMEOUT);
        }
    }
    debug!("watchdog loop exited");
}
