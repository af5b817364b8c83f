//! Process-wide OS ceilings.
//!
//! These are a coarse backstop shared by every call the process serves; the
//! per-call timeout is the primary control. The outcome of each ceiling is
//! recorded once and never changes afterwards.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// `[process]` config section. Absent fields leave the OS limit untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessLimitsConfig {
    /// Virtual address space ceiling in MiB
    pub address_space_mb: Option<u64>,
    /// Cumulative CPU time in seconds
    pub cpu_time_secs: Option<u64>,
    /// Open file descriptor ceiling
    pub open_files: Option<u64>,
}

/// What happened to one ceiling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LimitState {
    /// Soft and hard limits set to the requested value
    Applied { value: u64 },
    /// The hard limit was below the request; the soft limit was lowered to it
    Clamped { requested: u64, value: u64 },
    /// The OS refused the change
    Failed { error: String },
    /// Not configured
    Skipped,
    /// Not available on this platform
    Unsupported,
}

impl LimitState {
    /// Returns true if some ceiling is now in force
    pub fn is_enforced(&self) -> bool {
        matches!(self, Self::Applied { .. } | Self::Clamped { .. })
    }
}

/// Which ceilings the host actually permitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitStatus {
    pub address_space: LimitState,
    pub cpu_time: LimitState,
    pub open_files: LimitState,
}

impl ResourceLimitStatus {
    fn skipped() -> Self {
        Self {
            address_space: LimitState::Skipped,
            cpu_time: LimitState::Skipped,
            open_files: LimitState::Skipped,
        }
    }
}

static STATUS: OnceLock<ResourceLimitStatus> = OnceLock::new();

/// Apply the configured ceilings to this process.
///
/// Only the first call does anything; later calls return the recorded
/// status regardless of `config`.
pub fn apply_process_limits(config: &ProcessLimitsConfig) -> &'static ResourceLimitStatus {
    STATUS.get_or_init(|| {
        let status = apply(config);
        log_status(&status);
        status
    })
}

/// Status recorded by [`apply_process_limits`], if it has run
pub fn process_limit_status() -> Option<&'static ResourceLimitStatus> {
    STATUS.get()
}

fn log_status(status: &ResourceLimitStatus) {
    for (name, state) in [
        ("address_space", &status.address_space),
        ("cpu_time", &status.cpu_time),
        ("open_files", &status.open_files),
    ] {
        match state {
            LimitState::Applied { value } => {
                tracing::info!(limit = name, value, "process limit applied")
            }
            LimitState::Clamped { requested, value } => {
                tracing::warn!(limit = name, requested, value, "process limit clamped to hard limit")
            }
            LimitState::Failed { error } => {
                tracing::warn!(limit = name, %error, "process limit not applied")
            }
            LimitState::Unsupported => {
                tracing::warn!(limit = name, "process limit unsupported on this platform")
            }
            LimitState::Skipped => tracing::debug!(limit = name, "process limit not configured"),
        }
    }
}

#[cfg(target_os = "linux")]
fn apply(config: &ProcessLimitsConfig) -> ResourceLimitStatus {
    use nix::sys::resource::Resource;

    ResourceLimitStatus {
        address_space: config
            .address_space_mb
            .map_or(LimitState::Skipped, |mb| {
                set_ceiling(Resource::RLIMIT_AS, mb.saturating_mul(1024 * 1024))
            }),
        cpu_time: config
            .cpu_time_secs
            .map_or(LimitState::Skipped, |secs| set_ceiling(Resource::RLIMIT_CPU, secs)),
        open_files: config
            .open_files
            .map_or(LimitState::Skipped, |n| set_ceiling(Resource::RLIMIT_NOFILE, n)),
    }
}

#[cfg(not(target_os = "linux"))]
fn apply(config: &ProcessLimitsConfig) -> ResourceLimitStatus {
    let state = |value: Option<u64>| match value {
        Some(_) => LimitState::Unsupported,
        None => LimitState::Skipped,
    };
    ResourceLimitStatus {
        address_space: state(config.address_space_mb),
        cpu_time: state(config.cpu_time_secs),
        open_files: state(config.open_files),
    }
}

#[cfg(target_os = "linux")]
fn set_ceiling(resource: nix::sys::resource::Resource, requested: u64) -> LimitState {
    use nix::sys::resource::{getrlimit, setrlimit};

    let (_, hard) = match getrlimit(resource) {
        Ok(limits) => limits,
        Err(e) => {
            return LimitState::Failed {
                error: format!("getrlimit {resource:?}: {e}"),
            };
        }
    };

    if requested > hard {
        return match setrlimit(resource, hard, hard) {
            Ok(()) => LimitState::Clamped {
                requested,
                value: hard,
            },
            Err(e) => LimitState::Failed {
                error: format!("setrlimit {resource:?}: {e}"),
            },
        };
    }

    match setrlimit(resource, requested, requested) {
        Ok(()) => LimitState::Applied { value: requested },
        Err(e) => LimitState::Failed {
            error: format!("setrlimit {resource:?}: {e}"),
        },
    }
}

impl Default for ResourceLimitStatus {
    fn default() -> Self {
        Self::skipped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_configured_is_skipped() {
        let status = apply(&ProcessLimitsConfig::default());
        assert_eq!(status, ResourceLimitStatus::default());
        assert!(!status.cpu_time.is_enforced());
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let status = ResourceLimitStatus {
            address_space: LimitState::Applied { value: 1024 },
            cpu_time: LimitState::Clamped {
                requested: 10,
                value: 5,
            },
            open_files: LimitState::Failed {
                error: "EPERM".into(),
            },
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["address_space"]["state"], "applied");
        assert_eq!(json["cpu_time"]["value"], 5);
        assert_eq!(json["open_files"]["error"], "EPERM");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn open_files_at_the_hard_limit() {
        use nix::sys::resource::{Resource, getrlimit};

        let (_, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        let state = set_ceiling(Resource::RLIMIT_NOFILE, hard);
        assert_eq!(state, LimitState::Applied { value: hard });

        if hard < u64::MAX {
            let state = set_ceiling(Resource::RLIMIT_NOFILE, hard + 1);
            assert_eq!(
                state,
                LimitState::Clamped {
                    requested: hard + 1,
                    value: hard
                }
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn configured_limits_are_unsupported() {
        let status = apply(&ProcessLimitsConfig {
            open_files: Some(64),
            ..Default::default()
        });
        assert_eq!(status.open_files, LimitState::Unsupported);
    }
}
