//! Two-stage static safety check run before any script executes.
//!
//! The lexical pass scans raw text and is cheap but bypassable. The
//! structural pass works on the syntax tree the runtime will execute, so it
//! cannot be fooled by string building or odd whitespace. Both always run
//! and their findings are merged.

mod lexical;
mod structural;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::lang::{self, Program, Span};
use crate::limits::RuntimeLimits;
use crate::modules::AllowedModuleTable;

/// Builtin names that are never bound in a scope.
pub const WITHHELD_PRIMITIVES: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "getattr",
    "setattr",
    "delattr",
    "hasattr",
    "vars",
    "dir",
    "globals",
    "locals",
    "type",
    "isinstance",
    "issubclass",
    "id",
    "object",
    "super",
    "memoryview",
    "input",
    "breakpoint",
    "help",
    "exit",
    "quit",
    "classmethod",
    "staticmethod",
    "property",
    "__import__",
];

/// Frame, generator and code object fields
pub const FRAME_FIELDS: &[&str] = &[
    "f_globals",
    "f_locals",
    "f_builtins",
    "f_back",
    "f_code",
    "gi_frame",
    "gi_code",
    "cr_frame",
    "cr_code",
    "ag_frame",
    "ag_code",
    "tb_frame",
    "tb_next",
    "co_code",
    "co_consts",
    "co_names",
];

pub(crate) fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

// ============================================================================
// Findings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleId {
    // === Lexical ===
    SourceTooLarge,
    DynamicCode,
    FilesystemAccess,
    DunderName,
    FrameIntrospection,

    // === Structural ===
    ParseError,
    ForbiddenAttribute,
    WithheldPrimitive,
    ModuleNotAllowed,
    StarImport,
    MissingEntryPoint,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceTooLarge => "source-too-large",
            Self::DynamicCode => "dynamic-code",
            Self::FilesystemAccess => "filesystem-access",
            Self::DunderName => "dunder-name",
            Self::FrameIntrospection => "frame-introspection",
            Self::ParseError => "parse-error",
            Self::ForbiddenAttribute => "forbidden-attribute",
            Self::WithheldPrimitive => "withheld-primitive",
            Self::ModuleNotAllowed => "module-not-allowed",
            Self::StarImport => "star-import",
            Self::MissingEntryPoint => "missing-entry-point",
        }
    }

    pub fn pass(&self) -> Pass {
        match self {
            Self::SourceTooLarge
            | Self::DynamicCode
            | Self::FilesystemAccess
            | Self::DunderName
            | Self::FrameIntrospection => Pass::Lexical,
            _ => Pass::Structural,
        }
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    Lexical,
    Structural,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Critical,
}

/// One reason a script was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub rule: RuleId,
    pub pass: Pass,
    pub location: Span,
    pub severity: Severity,
    pub message: String,
}

impl ValidationFinding {
    pub fn new(rule: RuleId, location: Span, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule,
            pass: rule.pass(),
            location,
            severity,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] {}", self.location, self.rule, self.message)
    }
}

// ============================================================================
// Validator
// ============================================================================

/// Static checker built over the engine's module table
#[derive(Debug, Clone)]
pub struct SafetyValidator {
    modules: Arc<AllowedModuleTable>,
    max_source_bytes: usize,
    entry_point: String,
}

impl SafetyValidator {
    pub fn new(modules: Arc<AllowedModuleTable>, limits: &RuntimeLimits) -> Self {
        Self {
            modules,
            max_source_bytes: limits.max_source_bytes,
            entry_point: limits.entry_point.clone(),
        }
    }

    /// Check `source` against every module in the engine's table.
    pub fn validate(&self, source: &str) -> Vec<ValidationFinding> {
        self.check(source, None).err().unwrap_or_default()
    }

    /// Check `source` against the modules granted to one call.
    pub fn validate_for(&self, source: &str, allowed: &BTreeSet<String>) -> Vec<ValidationFinding> {
        self.check(source, Some(allowed)).err().unwrap_or_default()
    }

    /// Run both passes; on success hand back the parsed program so it is not
    /// parsed twice.
    pub(crate) fn check(
        &self,
        source: &str,
        allowed: Option<&BTreeSet<String>>,
    ) -> Result<Program, Vec<ValidationFinding>> {
        let mut findings = Vec::new();
        if source.len() > self.max_source_bytes {
            findings.push(ValidationFinding::new(
                RuleId::SourceTooLarge,
                Span::new(1, 1),
                Severity::High,
                format!(
                    "source is {} bytes, the limit is {}",
                    source.len(),
                    self.max_source_bytes
                ),
            ));
            return Err(findings);
        }

        findings.extend(lexical::scan(source));

        let effective: BTreeSet<&str> = match allowed {
            Some(allowed) => allowed
                .iter()
                .map(String::as_str)
                .filter(|m| self.modules.contains(m))
                .collect(),
            None => self.modules.module_names().collect(),
        };

        let program = match lang::parse(source) {
            Ok(program) => Some(program),
            Err(e) => {
                findings.push(ValidationFinding::new(
                    RuleId::ParseError,
                    e.span,
                    Severity::High,
                    e.message,
                ));
                None
            }
        };
        if let Some(program) = &program {
            findings.extend(structural::inspect(program, &effective, &self.entry_point));
        }

        match program {
            Some(program) if findings.is_empty() => Ok(program),
            _ => {
                findings.sort_by(|a, b| {
                    (a.location, a.pass, a.rule).cmp(&(b.location, b.pass, b.rule))
                });
                findings.dedup();
                Err(findings)
            }
        }
    }
}
