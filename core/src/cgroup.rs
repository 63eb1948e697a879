//! Resource-group adapter over the cgroup-v2 filesystem.
//!
//! Everything here is best-effort: unprivileged hosts cannot write below
//! `/sys/fs/cgroup`, so failures are logged at debug level and never
//! propagate. Tests point `WARDEN_CGROUP_ROOT` at a scratch directory.

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

/// Overrides the base directory used by the resource-group adapter.
pub const CGROUP_ROOT_ENV_VAR: &str = "WARDEN_CGROUP_ROOT";

const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

fn base_dir() -> PathBuf {
    env::var_os(CGROUP_ROOT_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CGROUP_ROOT))
        .join("warden")
}

/// Create a resource group for `name` and apply the given limits. Returns
/// `None` when the group directory cannot be created.
pub fn create(name: &str, cpu_ms: Option<u64>, mem_bytes: Option<u64>) -> Option<PathBuf> {
    let path = base_dir().join(name);
    if let Err(err) = fs::create_dir_all(&path) {
        debug!("cannot create resource group {}: {err}", path.display());
        return None;
    }

    if let Some(cpu_ms) = cpu_ms {
        let quota_us = cpu_ms * 1000;
        write_control(&path.join("cpu.max"), &format!("{quota_us} 1000000"));
    }
    if let Some(mem_bytes) = mem_bytes {
        write_control(&path.join("memory.max"), &mem_bytes.to_string());
    }
    Some(path)
}

/// Move the current thread into the group.
pub fn attach_current(path: Option<&Path>) {
    let Some(path) = path else {
        return;
    };
    #[cfg(target_os = "linux")]
    {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) };
        write_control(&path.join("cgroup.threads"), &tid.to_string());
    }
    #[cfg(not(target_os = "linux"))]
    {
        debug!("resource groups unsupported here; not attaching to {}", path.display());
    }
}

/// Remove an empty group directory and its control files.
pub fn delete(path: Option<&Path>) {
    let Some(path) = path else {
        return;
    };
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            let _ = fs::remove_file(entry.path());
        }
    }
    if let Err(err) = fs::remove_dir(path) {
        debug!("cannot remove resource group {}: {err}", path.display());
    }
}

fn write_control(file: &Path, value: &str) {
    if let Err(err) = fs::write(file, value) {
        debug!("cannot write {}: {err}", file.display());
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn create_applies_limits_under_override_root() {
        let root = tempfile::tempdir().unwrap();
        // Safety: test-local env mutation; the adapter reads it on each call.
        unsafe { env::set_var(CGROUP_ROOT_ENV_VAR, root.path()) };

        let path = create("cg-limits", Some(50), Some(1 << 20)).unwrap();
        assert_eq!(fs::read_to_string(path.join("cpu.max")).unwrap(), "50000 1000000");
        assert_eq!(fs::read_to_string(path.join("memory.max")).unwrap(), "1048576");

        delete(Some(&path));
        assert!(!path.exists());
        unsafe { env::remove_var(CGROUP_ROOT_ENV_VAR) };
    }
}
