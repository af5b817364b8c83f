use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::validator::ValidationFinding;

/// Errors returned instead of an [`ExecutionResult`](crate::ExecutionResult).
///
/// A request that fails here never reaches the runtime.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("script rejected by validation ({} finding(s))", .0.len())]
    ValidationRejected(Vec<ValidationFinding>),

    #[error("modules not permitted by this engine: {}", .0.join(", "))]
    ModulesNotPermitted(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ValidationRejected(_) | Self::ModulesNotPermitted(_) => {
                ErrorClass::ValidationRejected
            }
            Self::Config(_) => ErrorClass::InternalEngineError,
        }
    }

    /// Findings behind a validation rejection, empty for other errors
    pub fn findings(&self) -> &[ValidationFinding] {
        match self {
            Self::ValidationRejected(findings) => findings,
            _ => &[],
        }
    }
}

/// Classification of a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    // === Never executed ===
    /// Static validation rejected the script
    ValidationRejected,

    // === Limits ===
    /// The per-call timeout elapsed or the call was cancelled
    TimeoutExceeded,

    /// A process-level ceiling or engine capacity was hit
    ResourceExhausted,

    // === Script errors ===
    /// The script raised an exception it did not handle
    ScriptRaisedException,

    /// An outbound request failed the address checks
    NetworkDestinationRejected,

    // === Engine faults ===
    /// Unexpected engine failure, detail kept server-side
    InternalEngineError,
}

impl ErrorClass {
    /// Returns true if this represents a resource limit violation
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, Self::TimeoutExceeded | Self::ResourceExhausted)
    }

    /// Returns true if the script itself is at fault
    pub fn is_script_error(&self) -> bool {
        matches!(
            self,
            Self::ValidationRejected
                | Self::ScriptRaisedException
                | Self::NetworkDestinationRejected
        )
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Self::ValidationRejected => "Script was rejected by static validation",
            Self::TimeoutExceeded => "Script exceeded its time limit",
            Self::ResourceExhausted => "Engine resources are exhausted",
            Self::ScriptRaisedException => "Script raised an exception",
            Self::NetworkDestinationRejected => "Outbound destination was rejected",
            Self::InternalEngineError => "Internal engine error",
        }
    }

    /// Get an appropriate HTTP status code for the control plane
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ValidationRejected => 422,         // Unprocessable Entity
            Self::TimeoutExceeded => 504,            // Gateway Timeout
            Self::ResourceExhausted => 503,          // Service Unavailable
            Self::ScriptRaisedException => 500,      // Internal Server Error
            Self::NetworkDestinationRejected => 403, // Forbidden
            Self::InternalEngineError => 500,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Coarse grouping of exception types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Arithmetic,
    Lookup,
    Type,
    Value,
    Name,
    Attribute,
    Import,
    Assertion,
    Runtime,
    Resource,
    Timeout,
    Network,
    Generic,
}

/// Error part of a failed [`ExecutionResult`](crate::ExecutionResult)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub class: ErrorClass,
    /// Exception type name when the script raised
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
    pub category: ErrorCategory,
    pub message: String,
}

/// Message shown for failures whose detail stays server-side.
pub const GENERIC_MESSAGE: &str = "an internal error occurred";

impl ErrorDescriptor {
    pub fn new(class: ErrorClass, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            class,
            exception_type: None,
            category,
            message: message.into(),
        }
    }

    pub fn with_exception_type(mut self, name: impl Into<String>) -> Self {
        self.exception_type = Some(name.into());
        self
    }

    pub fn timeout(limit_ms: u128) -> Self {
        Self::new(
            ErrorClass::TimeoutExceeded,
            ErrorCategory::Timeout,
            format!("execution exceeded {limit_ms} ms"),
        )
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(
            ErrorClass::ResourceExhausted,
            ErrorCategory::Resource,
            message,
        )
    }

    pub fn internal() -> Self {
        Self::new(
            ErrorClass::InternalEngineError,
            ErrorCategory::Generic,
            GENERIC_MESSAGE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_helpers() {
        assert!(ErrorClass::TimeoutExceeded.is_limit_exceeded());
        assert!(!ErrorClass::ScriptRaisedException.is_limit_exceeded());
        assert!(ErrorClass::NetworkDestinationRejected.is_script_error());
        assert_eq!(ErrorClass::TimeoutExceeded.http_status(), 504);
    }

    #[test]
    fn descriptor_serializes_snake_case() {
        let d = ErrorDescriptor::new(
            ErrorClass::ScriptRaisedException,
            ErrorCategory::Arithmetic,
            "division by zero",
        )
        .with_exception_type("ZeroDivisionError");
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["class"], "script_raised_exception");
        assert_eq!(json["category"], "arithmetic");
        assert_eq!(json["exception_type"], "ZeroDivisionError");
    }

    #[test]
    fn modules_not_permitted_is_a_rejection() {
        let err = EngineError::ModulesNotPermitted(vec!["os".into()]);
        assert_eq!(err.class(), ErrorClass::ValidationRejected);
        assert!(err.to_string().contains("os"));
        assert!(err.findings().is_empty());
    }
}
