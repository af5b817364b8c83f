use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ErrorDescriptor;
use crate::output::CapturedOutput;

/// Result of one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Success or failure
    pub success: bool,
    /// Value returned by the entry function (on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
    /// Set when the serialized value exceeded its ceiling and was cut
    #[serde(default)]
    pub value_truncated: bool,
    /// Error descriptor (on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
    /// Output captured before the call finished
    pub output: CapturedOutput,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn ok(value: JsonValue, output: CapturedOutput, duration: Duration) -> Self {
        Self {
            success: true,
            value: Some(value),
            value_truncated: false,
            error: None,
            output,
            duration_ms: duration_ms(duration),
        }
    }

    pub fn err(error: ErrorDescriptor, output: CapturedOutput, duration: Duration) -> Self {
        Self {
            success: false,
            value: None,
            value_truncated: false,
            error: Some(error),
            output,
            duration_ms: duration_ms(duration),
        }
    }

    /// Enforce the result-size ceiling. An oversized value is replaced by
    /// its serialized text cut to `limit` bytes.
    pub(crate) fn enforce_value_limit(&mut self, limit: usize) {
        let Some(value) = &self.value else { return };
        let text = match serde_json::to_string(value) {
            Ok(text) => text,
            Err(_) => return,
        };
        if text.len() <= limit {
            return;
        }
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        self.value = Some(JsonValue::String(text[..end].to_string()));
        self.value_truncated = true;
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, ErrorClass};
    use serde_json::json;

    #[test]
    fn ok_result_serializes_without_error() {
        let r = ExecutionResult::ok(json!(3), CapturedOutput::default(), Duration::from_millis(7));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["value"], 3);
        assert_eq!(v["duration_ms"], 7);
        assert!(v.get("error").is_none());
    }

    #[test]
    fn err_result_has_no_value() {
        let r = ExecutionResult::err(
            ErrorDescriptor::new(ErrorClass::TimeoutExceeded, ErrorCategory::Timeout, "slow"),
            CapturedOutput::default(),
            Duration::ZERO,
        );
        assert!(!r.success);
        assert!(r.value.is_none());
    }

    #[test]
    fn oversized_value_is_cut() {
        let mut r = ExecutionResult::ok(
            json!({"data": "x".repeat(100)}),
            CapturedOutput::default(),
            Duration::ZERO,
        );
        r.enforce_value_limit(20);
        assert!(r.value_truncated);
        assert_eq!(r.value.as_ref().and_then(|v| v.as_str()).map(str::len), Some(20));

        let mut small = ExecutionResult::ok(json!([1, 2]), CapturedOutput::default(), Duration::ZERO);
        small.enforce_value_limit(20);
        assert!(!small.value_truncated);
        assert_eq!(small.value, Some(json!([1, 2])));
    }
}
