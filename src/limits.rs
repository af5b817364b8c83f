use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-call resource limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeLimits {
    /// Timeout used when a request does not ask for one (default: 5s)
    pub default_timeout_ms: u64,
    /// Hard ceiling on any requested timeout (default: 30s)
    /// Requests asking for more are clamped to this value.
    pub max_timeout_ms: u64,
    /// Captured output ceiling in bytes (default: 64KB)
    pub max_output_bytes: usize,
    /// Serialized result value ceiling in bytes (default: 256KB)
    pub max_result_bytes: usize,
    /// Maximum nesting of script function calls (default: 64)
    pub max_call_depth: usize,
    /// Largest string a script may build (default: 1MB)
    pub max_string_bytes: usize,
    /// Largest list, tuple or dict a script may build (default: 100k entries)
    pub max_collection_len: usize,
    /// Per-operation ceiling for the `re` module (default: 250ms)
    pub pattern_timeout_ms: u64,
    /// Largest accepted script source (default: 64KB)
    pub max_source_bytes: usize,
    /// Name of the function invoked after the top level runs
    pub entry_point: String,
    /// Simultaneous calls served by one engine (default: 16)
    pub max_concurrent_calls: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            max_timeout_ms: 30_000,
            max_output_bytes: 64 * 1024,
            max_result_bytes: 256 * 1024,
            max_call_depth: 64,
            max_string_bytes: 1024 * 1024,
            max_collection_len: 100_000,
            pattern_timeout_ms: 250,
            max_source_bytes: 64 * 1024,
            entry_point: "main".to_string(),
            max_concurrent_calls: 16,
        }
    }
}

impl RuntimeLimits {
    /// Resolve the timeout for one call: the request's bound, or the default,
    /// never above `max_timeout_ms` and never zero.
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_timeout_ms)
            .min(self.max_timeout_ms)
            .max(1);
        Duration::from_millis(ms)
    }

    pub fn pattern_timeout(&self) -> Duration {
        Duration::from_millis(self.pattern_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_timeout_is_clamped() {
        let limits = RuntimeLimits::default();
        assert_eq!(limits.effective_timeout(None), Duration::from_secs(5));
        assert_eq!(
            limits.effective_timeout(Some(120_000)),
            Duration::from_secs(30)
        );
        assert_eq!(
            limits.effective_timeout(Some(0)),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let limits: RuntimeLimits = toml::from_str("max_output_bytes = 10").unwrap();
        assert_eq!(limits.max_output_bytes, 10);
        assert_eq!(limits.entry_point, "main");
    }
}
