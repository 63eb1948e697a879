//! NUMA affinity helpers. Binding is best-effort and logged-only.

use std::collections::BTreeSet;
use std::fs;

use tracing::debug;

/// CPU ids belonging to the given NUMA node, or empty when the node (or the
/// sysfs tree) does not exist.
pub fn numa_cpus(node: u32) -> BTreeSet<usize> {
    let path = format!("/sys/devices/system/node/node{node}/cpulist");
    match fs::read_to_string(&path) {
        Ok(text) => parse_cpu_list(&text),
        Err(_) => BTreeSet::new(),
    }
}

/// Parse the Linux cpulist format, e.g. `0-3,8`.
fn parse_cpu_list(text: &str) -> BTreeSet<usize> {
    let mut cpus = BTreeSet::new();
    for part in text.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                cpus.extend(start..=end);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            cpus.insert(cpu);
        }
    }
    cpus
}

/// Bind the current thread to the CPUs of `node`.
pub fn bind_current_thread(node: u32) {
    let cpus = numa_cpus(node);
    if cpus.is_empty() {
        debug!("no cpus found for numa node {node}; not binding");
        return;
    }

    #[cfg(target_os = "linux")]
    {
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for cpu in &cpus {
            unsafe { libc::CPU_SET(*cpu, &mut set) };
        }
        let rc = unsafe {
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            debug!("sched_setaffinity for numa node {node} failed");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        debug!("thread affinity unsupported here; ignoring numa node {node}");
    }
}
