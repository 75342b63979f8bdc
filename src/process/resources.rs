//! Reading per-process figures from the OS.
//!
//! Linux reads `/proc/<pid>/stat`. Other platforms report nothing, which
//! callers treat as "unknown" (liveness then falls back to the PID alone).

use serde::{Deserialize, Serialize};

/// Point-in-time resource figures for one process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU use over the last sampling window; may exceed 100 on multi-core hosts
    pub cpu_percent: f64,
    /// Resident set size
    pub memory_bytes: u64,
}

/// Raw figures from one read of `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcSample {
    pub state: char,
    /// utime + stime in clock ticks
    pub cpu_ticks: u64,
    /// Start time in clock ticks after boot
    pub start_ticks: u64,
    pub rss_bytes: u64,
}

impl ProcSample {
    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// Start-time fingerprint used to tell a live process apart from a later
/// process that reused its PID.
pub fn start_fingerprint(pid: u32) -> Option<u64> {
    read_sample(pid).map(|sample| sample.start_ticks)
}

#[cfg(target_os = "linux")]
pub fn read_sample(pid: u32) -> Option<ProcSample> {
    let content = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(&content, page_size())
}

#[cfg(not(target_os = "linux"))]
pub fn read_sample(_pid: u32) -> Option<ProcSample> {
    None
}

/// Parse the contents of `/proc/<pid>/stat`. The command name is wrapped in
/// parentheses and may itself contain spaces or `)`.
fn parse_stat(content: &str, page_size: u64) -> Option<ProcSample> {
    let close = content.rfind(')')?;
    let fields: Vec<&str> = content.get(close + 2..)?.split_whitespace().collect();
    // fields[0] is field 3 (state) of `man 5 proc`
    let state = fields.first()?.chars().next()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let start_ticks: u64 = fields.get(19)?.parse().ok()?;
    let rss_pages: u64 = fields.get(21)?.parse().ok()?;
    Some(ProcSample {
        state,
        cpu_ticks: utime + stime,
        start_ticks,
        rss_bytes: rss_pages * page_size,
    })
}

pub fn clock_ticks_per_second() -> f64 {
    #[cfg(unix)]
    {
        use nix::unistd::{sysconf, SysconfVar};
        if let Ok(Some(ticks)) = sysconf(SysconfVar::CLK_TCK) {
            if ticks > 0 {
                return ticks as f64;
            }
        }
    }
    100.0
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    use nix::unistd::{sysconf, SysconfVar};
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_with_spaces_in_comm() {
        let stat = "1234 (python main.py) S 1 1234 1234 0 -1 4194560 100 0 0 0 250 50 0 0 20 0 8 0 987654 123456789 2048 18446744073709551615";
        let sample = parse_stat(stat, 4096).unwrap();
        assert_eq!(sample.state, 'S');
        assert_eq!(sample.cpu_ticks, 300);
        assert_eq!(sample.start_ticks, 987654);
        assert_eq!(sample.rss_bytes, 2048 * 4096);
        assert!(!sample.is_zombie());
    }

    #[test]
    fn test_parse_stat_rejects_truncated() {
        assert!(parse_stat("1234 (x) S 1 2", 4096).is_none());
        assert!(parse_stat("garbage", 4096).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_own_fingerprint_is_stable() {
        let pid = std::process::id();
        let first = start_fingerprint(pid).unwrap();
        assert_eq!(start_fingerprint(pid), Some(first));
    }
}
