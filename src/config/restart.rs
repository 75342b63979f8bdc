//! Restart policy for supervised daemons.

use serde::{Deserialize, Serialize};

/// Upper bound on restart attempts regardless of policy, so a daemon that
/// crashes on every start cannot loop forever.
pub const MAX_RESTART_ATTEMPTS: u32 = 10;

/// What the daemon manager does when a daemon exits without being asked to.
///
/// ```yaml
/// restart_policy: no
/// restart_policy: always
/// restart_policy:
///   on-failure:
///     max_retries: 3
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart; a crash settles the daemon into `Stopped`
    #[default]
    No,
    /// Restart after every crash (still bounded by [`MAX_RESTART_ATTEMPTS`])
    Always,
    /// Restart up to `max_retries` times
    OnFailure { max_retries: Option<u32> },
}

impl RestartPolicy {
    /// Whether crash number `attempt` (1-based) may be followed by a restart.
    ///
    /// `max_retries = 3` allows restarts after crashes 1, 2 and 3 but not 4.
    pub fn allows_restart(&self, attempt: u32) -> bool {
        if attempt == 0 || attempt > MAX_RESTART_ATTEMPTS {
            return false;
        }
        match self {
            RestartPolicy::No => false,
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure { max_retries } => match max_retries {
                Some(max) => attempt <= *max,
                None => true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_never_restarts() {
        assert!(!RestartPolicy::No.allows_restart(1));
    }

    #[test]
    fn test_on_failure_counts_attempts() {
        let policy = RestartPolicy::OnFailure {
            max_retries: Some(2),
        };
        assert!(policy.allows_restart(1));
        assert!(policy.allows_restart(2));
        assert!(!policy.allows_restart(3));
    }

    #[test]
    fn test_always_is_capped() {
        assert!(RestartPolicy::Always.allows_restart(MAX_RESTART_ATTEMPTS));
        assert!(!RestartPolicy::Always.allows_restart(MAX_RESTART_ATTEMPTS + 1));
    }

    #[test]
    fn test_yaml_forms() {
        let p: RestartPolicy = serde_yaml::from_str("always").unwrap();
        assert_eq!(p, RestartPolicy::Always);
        let p: RestartPolicy = serde_yaml::from_str("on-failure:\n  max_retries: 3").unwrap();
        assert_eq!(
            p,
            RestartPolicy::OnFailure {
                max_retries: Some(3)
            }
        );
    }
}
