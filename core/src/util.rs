use std::time::Duration;

use rand::Rng;

/// Default exponential back-off schedule: 200ms → 400ms → 800ms → 1600ms.
pub(crate) fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << (attempt - 1).min(8));
    let jitter = rand::rng().random_range(0.8..1.2);
    let delay_ms = (base_delay_ms as f64 * jitter) as u64;
    Duration::from_millis(delay_ms)
}

/// CPU time consumed by the calling thread, in milliseconds.
#[cfg(unix)]
pub(crate) fn thread_cpu_ms() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc == 0 {
        ts.tv_sec as f64 * 1e3 + ts.tv_nsec as f64 / 1e6
    } else {
        0.0
    }
}

/// Wall-clock fallback for platforms without a per-thread CPU clock.
#[cfg(not(unix))]
pub(crate) fn thread_cpu_ms() -> f64 {
    use std::sync::LazyLock;
    use std::time::Instant;

    static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);
    EPOCH.elapsed().as_secs_f64() * 1e3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempts() {
        let first = backoff(1);
        let fourth = backoff(4);
        assert!(first >= Duration::from_millis(160));
        assert!(fourth >= Duration::from_millis(1280));
    }

    #[test]
    fn thread_cpu_clock_is_monotonic() {
        let a = thread_cpu_ms();
        // Burn a little CPU so the clock has something to count.
        let mut x = 0u64;
        for i in 0..100_000u64 {
            x = x.wrapping_add(i);
        }
        std::hint::black_box(x);
        let b = thread_cpu_ms();
        assert!(b >= a);
    }
}
