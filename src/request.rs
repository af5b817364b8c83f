use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

use crate::secrets::SecretView;

/// One call into the engine.
///
/// `allowed_modules` and `allowed_hosts` are the caller's grants for this
/// call; the engine still refuses anything outside its own module table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutionRequest {
    pub source: String,
    /// Keyword arguments for the entry function
    pub arguments: Map<String, JsonValue>,
    pub allowed_modules: BTreeSet<String>,
    /// Outbound host patterns; `None` means no network access
    pub allowed_hosts: Option<BTreeSet<String>>,
    /// Requested timeout, clamped by the engine
    pub timeout_ms: Option<u64>,
    pub secrets: SecretView,
}

impl ExecutionRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Map<String, JsonValue>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn allow_module(mut self, name: impl Into<String>) -> Self {
        self.allowed_modules.insert(name.into());
        self
    }

    pub fn with_modules<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_modules = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn allow_host(mut self, pattern: impl Into<String>) -> Self {
        self.allowed_hosts
            .get_or_insert_with(BTreeSet::new)
            .insert(pattern.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_secrets(mut self, secrets: SecretView) -> Self {
        self.secrets = secrets;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder() {
        let req = ExecutionRequest::new("def main():\n    return 1\n")
            .with_argument("x", 5)
            .allow_module("math")
            .allow_host("api.example.com")
            .with_timeout_ms(100);
        assert_eq!(req.arguments["x"], json!(5));
        assert!(req.allowed_modules.contains("math"));
        assert!(req.allowed_hosts.unwrap().contains("api.example.com"));
        assert_eq!(req.timeout_ms, Some(100));
    }

    #[test]
    fn deserializes_with_defaults_and_hides_secrets() {
        let req: ExecutionRequest = serde_json::from_value(json!({
            "source": "x = 1",
            "secrets": {"TOKEN": "hunter2-secret"}
        }))
        .unwrap();
        assert!(req.allowed_modules.is_empty());
        assert!(req.allowed_hosts.is_none());
        assert!(!format!("{req:?}").contains("hunter2-secret"));
    }
}
