//! Process bookkeeping: liveness, start-time fingerprints, resource usage
//! and process-group signalling.

mod resources;
mod tracker;

pub use resources::{clock_ticks_per_second, read_sample, start_fingerprint, ProcSample, ResourceUsage};
pub use tracker::{ProcessTracker, TrackedProcess};
pub(crate) use tracker::same_process_alive;

use crate::error::{validate_pid, validate_pid_for_check, Result};
use nix::sys::signal::{self, killpg, Signal};

/// True if a process with this PID exists and is not a zombie.
pub fn is_pid_alive(pid: u32) -> bool {
    let Some(nix_pid) = validate_pid_for_check(pid) else {
        return false;
    };
    if signal::kill(nix_pid, None).is_err() {
        return false;
    }
    match read_sample(pid) {
        Some(sample) => !sample.is_zombie(),
        None => true,
    }
}

/// Send `signal` to the process group led by `pid`, falling back to the
/// single process when the group cannot be signalled.
pub fn signal_group(pid: u32, signal: Signal, label: &str) -> Result<()> {
    let nix_pid = validate_pid(pid, label)?;
    let pgid = process_group_of(pid).unwrap_or(nix_pid);
    match killpg(pgid, signal) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(
                "killpg failed for PGID {} ({}): {}, trying individual PID",
                pgid.as_raw(),
                label,
                e
            );
            signal::kill(nix_pid, signal).map_err(|e| {
                crate::Error::Process(format!("Failed to send {} to PID {}: {}", signal, pid, e))
            })
        }
    }
}

#[cfg(unix)]
fn process_group_of(pid: u32) -> Option<nix::unistd::Pid> {
    let nix_pid = validate_pid_for_check(pid)?;
    match nix::unistd::getpgid(Some(nix_pid)) {
        Ok(pgid) if pgid.as_raw() > 1 => Some(pgid),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("Failed to get PGID for PID {}: {}", pid, e);
            None
        }
    }
}

#[cfg(not(unix))]
fn process_group_of(_pid: u32) -> Option<nix::unistd::Pid> {
    None
}
