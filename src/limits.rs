//! Best-effort OS confinement for tenant processes: cgroup-v2 membership plus
//! POSIX resource ceilings.
//!
//! Limits are resolved from the environment at every terminal creation and
//! applied to the freshly spawned pid. Confinement is hardening, not a
//! correctness precondition: every failure in [`confine`] is logged at `warn`
//! and swallowed so terminal creation is never blocked.

use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Per-tenant cgroup ceilings, read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantLimits {
    pub memory_max_mb: Option<u64>,
    pub cpu_max_percent: Option<u32>,
    pub pids_max: Option<u32>,
}

impl TenantLimits {
    pub fn from_env() -> Self {
        Self {
            memory_max_mb: env_number("TENANT_MEMORY_MAX_MB"),
            cpu_max_percent: env_number("TENANT_CPU_MAX_PERCENT"),
            pids_max: env_number("TENANT_PIDS_MAX"),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.memory_max_mb.is_none() && self.cpu_max_percent.is_none() && self.pids_max.is_none()
    }
}

/// Per-process POSIX ceilings, read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rlimits {
    pub nofile: Option<u64>,
    pub nproc: Option<u64>,
    pub cpu_secs: Option<u64>,
    pub address_space_mb: Option<u64>,
}

impl Rlimits {
    pub fn from_env() -> Self {
        Self {
            nofile: env_number("RLIMIT_NOFILE"),
            nproc: env_number("RLIMIT_NPROC"),
            cpu_secs: env_number("RLIMIT_CPU_SECS"),
            address_space_mb: env_number("RLIMIT_AS_MB"),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.nofile.is_none()
            && self.nproc.is_none()
            && self.cpu_secs.is_none()
            && self.address_space_mb.is_none()
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = %name, value = %raw, "Ignoring unparseable limit variable");
            None
        }
    }
}

/// Cgroup v2 is usable when the unified hierarchy is mounted at the root.
pub fn is_cgroup_v2_supported(cgroup_root: &Path) -> bool {
    cgroup_root.join("cgroup.controllers").is_file()
}

/// Create (or reuse) the tenant's cgroup under `<root>/<parent>/<tenant>` and
/// write its limit files. Returns the cgroup directory.
pub fn ensure_tenant_cgroup(
    cgroup_root: &Path,
    parent: &str,
    tenant: &str,
    limits: &TenantLimits,
) -> io::Result<PathBuf> {
    let dir = cgroup_root.join(parent).join(tenant);
    fs::create_dir_all(&dir)?;

    if let Some(memory_mb) = limits.memory_max_mb {
        fs::write(dir.join("memory.max"), format!("{}", memory_mb * 1024 * 1024))?;
    }
    if let Some(cpu_percent) = limits.cpu_max_percent {
        // cpu.max is "$MAX $PERIOD"; quota/period = fraction of one CPU.
        let period_us: u64 = 100_000;
        let max_us = period_us * cpu_percent as u64 / 100;
        fs::write(dir.join("cpu.max"), format!("{} {}", max_us, period_us))?;
    }
    if let Some(pids) = limits.pids_max {
        fs::write(dir.join("pids.max"), format!("{}", pids))?;
    }

    Ok(dir)
}

/// Move a pid into the tenant's cgroup.
pub fn attach_pid(cgroup_dir: &Path, pid: u32) -> io::Result<()> {
    fs::write(cgroup_dir.join("cgroup.procs"), format!("{}", pid))
}

#[cfg(target_os = "linux")]
mod sys {
    use super::Rlimits;
    use std::io;

    #[cfg(target_env = "gnu")]
    type RlimitResource = libc::__rlimit_resource_t;
    #[cfg(not(target_env = "gnu"))]
    type RlimitResource = libc::c_int;

    fn set_prlimit(pid: u32, resource: RlimitResource, limit: u64) -> io::Result<()> {
        let rl = libc::rlimit {
            rlim_cur: limit as libc::rlim_t,
            rlim_max: limit as libc::rlim_t,
        };
        let ret = unsafe { libc::prlimit(pid as libc::pid_t, resource, &rl, std::ptr::null_mut()) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Apply every configured ceiling to the pid. Stops at the first failure.
    pub fn apply_rlimits(pid: u32, limits: &Rlimits) -> io::Result<()> {
        if let Some(nofile) = limits.nofile {
            set_prlimit(pid, libc::RLIMIT_NOFILE, nofile)?;
        }
        if let Some(nproc) = limits.nproc {
            set_prlimit(pid, libc::RLIMIT_NPROC, nproc)?;
        }
        if let Some(cpu_secs) = limits.cpu_secs {
            set_prlimit(pid, libc::RLIMIT_CPU, cpu_secs)?;
        }
        if let Some(as_mb) = limits.address_space_mb {
            set_prlimit(pid, libc::RLIMIT_AS, as_mb * 1024 * 1024)?;
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub fn apply_rlimits(pid: u32, limits: &Rlimits) -> io::Result<()> {
    sys::apply_rlimits(pid, limits)
}

#[cfg(not(target_os = "linux"))]
pub fn apply_rlimits(_pid: u32, limits: &Rlimits) -> io::Result<()> {
    if !limits.is_unrestricted() {
        debug!("Resource ceilings are not applied on this platform");
    }
    Ok(())
}

/// Best-effort confinement of a freshly spawned pid: cgroup membership when
/// v2 is supported, then rlimits. Every failure is logged and swallowed.
pub fn confine(config: &Config, tenant: &str, pid: u32) {
    let limits = TenantLimits::from_env();
    if is_cgroup_v2_supported(&config.cgroup_root) {
        match ensure_tenant_cgroup(&config.cgroup_root, &config.cgroup_parent, tenant, &limits) {
            Ok(dir) => {
                if let Err(e) = attach_pid(&dir, pid) {
                    warn!(tenant = %tenant, %pid, error = %e, "Failed to attach pid to tenant cgroup");
                } else {
                    debug!(tenant = %tenant, %pid, cgroup = %dir.display(), "Attached pid to tenant cgroup");
                }
            }
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Failed to ensure tenant cgroup");
            }
        }
    } else {
        debug!(root = %config.cgroup_root.display(), "Cgroup v2 unavailable, skipping cgroup confinement");
    }

    let rlimits = Rlimits::from_env();
    if rlimits.is_unrestricted() {
        return;
    }
    if let Err(e) = apply_rlimits(pid, &rlimits) {
        warn!(tenant = %tenant, %pid, error = %e, "Failed to apply resource ceilings");
    }
}
