use std::sync::LazyLock;

use regex::Regex;

use super::{RuleId, Severity, ValidationFinding};
use crate::lang::Span;

/// Dunder names that lead straight to interpreter internals
const CRITICAL_DUNDERS: &[&str] = &[
    "__class__",
    "__subclasses__",
    "__bases__",
    "__base__",
    "__mro__",
    "__globals__",
    "__builtins__",
    "__code__",
    "__closure__",
    "__dict__",
    "__func__",
    "__self__",
    "__getattribute__",
    "__import__",
    "__loader__",
    "__spec__",
    "__reduce__",
    "__reduce_ex__",
    "__init_subclass__",
];

const PATTERNS: &[(RuleId, &str)] = &[
    (RuleId::DynamicCode, r"(?:^|[^.\w])(eval|exec|compile)\s*\("),
    (RuleId::DynamicCode, r"(?:^|[^.\w])(__import__)\b"),
    (RuleId::FilesystemAccess, r"(?:^|[^.\w])(open)\s*\("),
    (RuleId::DunderName, r"\b(__[A-Za-z0-9][A-Za-z0-9_]*__)\b"),
    (
        RuleId::FrameIntrospection,
        r"\b(f_globals|f_locals|f_builtins|f_back|f_code|gi_frame|gi_code|cr_frame|cr_code|ag_frame|ag_code|tb_frame|tb_next|co_code|co_consts|co_names)\b",
    ),
];

struct Signature {
    rule: RuleId,
    regex: Regex,
}

// A pattern that fails to compile would silently disable its rule, so it
// stops the process instead.
static SIGNATURES: LazyLock<Vec<Signature>> = LazyLock::new(|| {
    PATTERNS
        .iter()
        .map(|(rule, pattern)| Signature {
            rule: *rule,
            regex: Regex::new(pattern).expect("built-in signature pattern compiles"),
        })
        .collect()
});

/// Scan raw text for signatures of forbidden constructs. Strings and
/// comments are scanned too.
pub(super) fn scan(source: &str) -> Vec<ValidationFinding> {
    let mut findings = Vec::new();
    for signature in SIGNATURES.iter() {
        for caps in signature.regex.captures_iter(source) {
            let Some(name) = caps.get(1) else { continue };
            let text = name.as_str();
            let (severity, message) = match signature.rule {
                RuleId::DynamicCode => (
                    Severity::Critical,
                    format!("dynamic code primitive '{text}'"),
                ),
                RuleId::FilesystemAccess => (
                    Severity::Critical,
                    "filesystem primitive 'open'".to_string(),
                ),
                RuleId::DunderName if CRITICAL_DUNDERS.contains(&text) => (
                    Severity::Critical,
                    format!("'{text}' exposes interpreter internals"),
                ),
                RuleId::DunderName => (Severity::High, format!("double-underscore name '{text}'")),
                _ => (
                    Severity::Critical,
                    format!("frame or code object field '{text}'"),
                ),
            };
            findings.push(ValidationFinding::new(
                signature.rule,
                position(source, name.start()),
                severity,
                message,
            ));
        }
    }
    findings
}

/// 1-based line and column of a byte offset
fn position(source: &str, offset: usize) -> Span {
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    let column = before[line_start..].chars().count() + 1;
    Span::new(
        u32::try_from(line).unwrap_or(u32::MAX),
        u32::try_from(column).unwrap_or(u32::MAX),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(source: &str) -> Vec<RuleId> {
        scan(source).into_iter().map(|f| f.rule).collect()
    }

    #[test]
    fn every_signature_compiles() {
        for (rule, pattern) in PATTERNS {
            assert!(Regex::new(pattern).is_ok(), "{rule:?}: {pattern}");
        }
        assert_eq!(SIGNATURES.len(), PATTERNS.len());
        for (signature, (rule, _)) in SIGNATURES.iter().zip(PATTERNS) {
            assert_eq!(signature.rule, *rule);
        }
    }

    #[test]
    fn dynamic_code_and_files() {
        assert_eq!(rules("x = eval ('1')"), vec![RuleId::DynamicCode]);
        assert_eq!(rules("f = open('/etc/passwd')"), vec![RuleId::FilesystemAccess]);
        assert!(rules("re.compile('x')").is_empty());
        assert!(rules("evaluate(1)").is_empty());
        assert!(rules("reopen(1)").is_empty());
    }

    #[test]
    fn dunder_severity() {
        let findings = scan("a.__class__\nb.__len__");
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[1].severity, Severity::High);
        assert_eq!(findings[1].location, Span::new(2, 3));
    }

    #[test]
    fn dunder_import_counts_twice() {
        let rules = rules("m = __import__('os')");
        assert!(rules.contains(&RuleId::DynamicCode));
        assert!(rules.contains(&RuleId::DunderName));
    }

    #[test]
    fn frame_fields() {
        assert_eq!(
            rules("x.tb_frame.f_back"),
            vec![RuleId::FrameIntrospection, RuleId::FrameIntrospection]
        );
    }

    #[test]
    fn single_underscore_names_pass() {
        assert!(rules("_private = 1\nx__y = 2").is_empty());
    }
}
