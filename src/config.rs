use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::limits::RuntimeLimits;
use crate::modules::ModuleTableConfig;
use crate::net::NetworkConfig;
use crate::process_limits::ProcessLimitsConfig;

/// Engine configuration, usually loaded from TOML.
///
/// Every field has a default, so `EngineConfig::default()` is a working
/// configuration.
///
/// ```toml
/// [limits]
/// default_timeout_ms = 2000
///
/// [process]
/// open_files = 1024
///
/// [network]
/// allow_private_ranges = ["10.1.0.0/16"]
///
/// [modules]
/// version = 3
/// allow.math = ["sqrt", "floor"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: RuntimeLimits,
    pub process: ProcessLimitsConfig,
    pub network: NetworkConfig,
    pub modules: ModuleTableConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("environment expansion failed: {0}")]
    Expand(String),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown module '{0}' in module table")]
    UnknownModule(String),

    #[error("module '{module}' has no attribute '{attribute}'")]
    UnknownAttribute { module: String, attribute: String },

    #[error("invalid address range '{0}'")]
    InvalidRange(String),

    #[error("address range '{0}' can never be permitted")]
    RangeNotPermittable(String),
}

impl EngineConfig {
    /// Read a TOML file, expanding `${VAR}` references from the environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let expanded = shellexpand::env(content).map_err(|e| ConfigError::Expand(e.to_string()))?;
        Ok(toml::from_str(&expanded)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_file_is_the_default() {
        assert_eq!(EngineConfig::from_toml("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[limits]
default_timeout_ms = 2000
entry_point = "run"

[process]
open_files = 512

[network]
max_response_bytes = 4096

[modules]
version = 7
allow.math = ["sqrt"]
"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.limits.default_timeout_ms, 2000);
        assert_eq!(config.limits.entry_point, "run");
        assert_eq!(config.limits.max_call_depth, 64);
        assert_eq!(config.process.open_files, Some(512));
        assert_eq!(config.process.cpu_time_secs, None);
        assert_eq!(config.network.max_response_bytes, 4096);
        assert_eq!(config.modules.version, Some(7));
        let allow = config.modules.allow.unwrap();
        assert_eq!(allow["math"], vec!["sqrt".to_string()]);
    }

    #[test]
    fn environment_expansion() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("TOOLCELL_TEST_UA", "toolcell-test/1.0") };
        let config = EngineConfig::from_toml("[network]\nuser_agent = \"${TOOLCELL_TEST_UA}\"\n")
            .unwrap();
        assert_eq!(config.network.user_agent, "toolcell-test/1.0");
    }

    #[test]
    fn missing_variable_is_an_error() {
        let err = EngineConfig::from_toml("[network]\nuser_agent = \"${TOOLCELL_UNSET_VAR_X}\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Expand(_)));
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn wrong_types_are_parse_errors() {
        let err = EngineConfig::from_toml("[limits]\nmax_call_depth = \"deep\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
