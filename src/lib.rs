//! Sandboxed execution of semi-trusted scripts
//!
//! Scripts are written in toolscript, a small Python-like language, and pass
//! through a fixed chain on every call: static validation, then a restricted
//! runtime with per-call module, host and secret grants, under a per-call
//! timeout and process-wide OS ceilings. Outbound requests go through an
//! SSRF-resistant client.

mod config;
mod engine;
mod error;
pub mod lang;
mod limits;
mod modules;
pub mod net;
mod output;
mod process_limits;
mod request;
mod result;
mod runtime;
mod secrets;
mod validator;

pub use config::{ConfigError, EngineConfig};
pub use engine::SandboxEngine;
pub use error::{EngineError, ErrorCategory, ErrorClass, ErrorDescriptor, GENERIC_MESSAGE};
pub use limits::RuntimeLimits;
pub use modules::{AllowedModuleTable, ModuleTableConfig};
pub use output::CapturedOutput;
pub use process_limits::{
    LimitState, ProcessLimitsConfig, ResourceLimitStatus, apply_process_limits,
    process_limit_status,
};
pub use request::ExecutionRequest;
pub use result::ExecutionResult;
pub use runtime::{ExcKind, Exception, RestrictedRuntime, Scope};
pub use secrets::{MIN_REDACTED_LEN, REDACTED, SecretView};
pub use validator::{
    FRAME_FIELDS, Pass, RuleId, SafetyValidator, Severity, ValidationFinding, WITHHELD_PRIMITIVES,
};
