use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use toolcell::net::{Resolve, ResolveFuture, StaticResolver};
use toolcell::{
    EngineConfig, EngineError, ErrorCategory, ErrorClass, ExecutionRequest, RuleId,
    SandboxEngine, SecretView, Severity,
};

fn engine() -> SandboxEngine {
    SandboxEngine::new(EngineConfig::default()).unwrap()
}

fn secrets(pairs: &[(&str, &str)]) -> SecretView {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn rejected(engine: &SandboxEngine, source: &str) -> Vec<RuleId> {
    match engine.execute(ExecutionRequest::new(source)).await {
        Err(EngineError::ValidationRejected(findings)) => {
            assert!(findings.iter().any(|f| f.severity == Severity::Critical));
            findings.into_iter().map(|f| f.rule).collect()
        }
        other => panic!("expected a validation rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn dunder_access_is_rejected_in_every_form() {
    let engine = engine();

    let direct = "def main():\n    return ''.__class__.__mro__\n";
    assert!(rejected(&engine, direct).await.contains(&RuleId::ForbiddenAttribute));

    let constructed = "def main():\n    name = '__' + 'class' + '__'\n    return getattr('', name)\n";
    assert!(rejected(&engine, constructed).await.contains(&RuleId::WithheldPrimitive));

    let aliased = "def main():\n    look = getattr\n    return look('', 'x')\n";
    assert!(rejected(&engine, aliased).await.contains(&RuleId::WithheldPrimitive));

    let hidden = "def main():\n    return (''\n        .  __class__)\n";
    let rules = rejected(&engine, hidden).await;
    assert!(rules.contains(&RuleId::DunderName));
    assert!(rules.contains(&RuleId::ForbiddenAttribute));
}

#[tokio::test]
async fn denied_and_absent_attributes_look_the_same() {
    let config = EngineConfig::from_toml("[modules]\nallow.math = [\"sqrt\"]\n").unwrap();
    let engine = SandboxEngine::new(config).unwrap();

    let run = |attr: &str| {
        ExecutionRequest::new(format!(
            "import math\n\ndef main():\n    return math.{attr}(2.5)\n"
        ))
        .allow_module("math")
    };

    let denied = engine.execute(run("floor")).await.unwrap().error.unwrap();
    let absent = engine.execute(run("nosuch")).await.unwrap().error.unwrap();

    assert_eq!(denied.exception_type.as_deref(), Some("AttributeError"));
    assert_eq!(denied.exception_type, absent.exception_type);
    assert_eq!(denied.category, absent.category);
    assert_eq!(
        denied.message.replace("floor", "X"),
        absent.message.replace("nosuch", "X")
    );

    let allowed = engine.execute(run("sqrt")).await.unwrap();
    assert!(allowed.success);
}

#[tokio::test]
async fn division_by_zero_is_classified() {
    let request = ExecutionRequest::new("def main(x):\n    return x / 0\n").with_argument("x", 5);
    let result = engine().execute(request).await.unwrap();

    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.class, ErrorClass::ScriptRaisedException);
    assert_eq!(error.category, ErrorCategory::Arithmetic);
    assert_eq!(error.exception_type.as_deref(), Some("ZeroDivisionError"));
    assert!(result.output.text.is_empty());
}

#[tokio::test]
async fn imports_outside_the_grant_are_rejected() {
    let request = ExecutionRequest::new("import os\n\ndef main():\n    return 1\n")
        .allow_module("math");
    match engine().execute(request).await {
        Err(EngineError::ValidationRejected(findings)) => {
            assert_eq!(findings.len(), 1);
            assert_eq!(findings[0].rule, RuleId::ModuleNotAllowed);
            assert_eq!(findings[0].location.line, 1);
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    // Known module that was not granted to this call
    let request = ExecutionRequest::new("import json\n\ndef main():\n    return 1\n");
    assert!(matches!(
        engine().execute(request).await,
        Err(EngineError::ValidationRejected(_))
    ));
}

#[tokio::test]
async fn infinite_loop_times_out_with_partial_output() {
    let request = ExecutionRequest::new("def main():\n    while True:\n        print('tick')\n")
        .with_timeout_ms(200);
    let result = engine().execute(request).await.unwrap();

    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.class, ErrorClass::TimeoutExceeded);
    assert_eq!(error.category, ErrorCategory::Timeout);
    assert!(result.output.text.starts_with("tick\n"));
    assert!(result.duration_ms < 2_000);
}

#[tokio::test]
async fn concurrent_calls_never_see_each_others_secrets() {
    let engine = engine();
    let source = "\
def main(expected):
    value = secrets.get('api_key')
    print('key is', value)
    return {'mine': value == expected, 'value': value}
";
    let a = ExecutionRequest::new(source)
        .with_argument("expected", "alpha-key-1111")
        .with_secrets(secrets(&[("api_key", "alpha-key-1111")]));
    let b = ExecutionRequest::new(source)
        .with_argument("expected", "bravo-key-2222")
        .with_secrets(secrets(&[("api_key", "bravo-key-2222")]));

    let (a, b) = tokio::join!(engine.execute(a), engine.execute(b));
    let (a, b) = (a.unwrap(), b.unwrap());

    for (result, other) in [(&a, "bravo-key-2222"), (&b, "alpha-key-1111")] {
        assert!(result.success);
        let value = result.value.as_ref().unwrap();
        assert_eq!(value["mine"], json!(true));
        assert_eq!(value["value"], json!("[REDACTED]"));
        let serialized = serde_json::to_string(result).unwrap();
        assert!(!serialized.contains(other));
        assert!(!serialized.contains("alpha-key-1111"));
        assert!(!serialized.contains("bravo-key-2222"));
        assert_eq!(result.output.text, "key is [REDACTED]\n");
    }
}

#[tokio::test]
async fn secrets_are_redacted_from_error_messages() {
    let request = ExecutionRequest::new("def main():\n    raise ValueError('bad ' + secrets.get('token'))\n")
        .with_secrets(secrets(&[("token", "tok-98765")]));
    let result = engine().execute(request).await.unwrap();
    let error = result.error.unwrap();
    assert_eq!(error.exception_type.as_deref(), Some("ValueError"));
    assert_eq!(error.message, "bad [REDACTED]");
}

#[tokio::test]
async fn output_is_truncated_at_the_ceiling() {
    let config = EngineConfig::from_toml("[limits]\nmax_output_bytes = 16\n").unwrap();
    let engine = SandboxEngine::new(config).unwrap();
    let request = ExecutionRequest::new("def main():\n    print('x' * 100)\n    return 'done'\n");
    let result = engine.execute(request).await.unwrap();

    assert!(result.success);
    assert_eq!(result.value, Some(json!("done")));
    assert!(result.output.truncated);
    assert_eq!(result.output.bytes, 16);
    assert_eq!(result.output.text, "x".repeat(16));
}

#[tokio::test]
async fn secrets_cut_by_the_output_ceiling_stay_hidden() {
    let config = EngineConfig::from_toml("[limits]\nmax_output_bytes = 16\n").unwrap();
    let engine = SandboxEngine::new(config).unwrap();
    let request = ExecutionRequest::new("def main():\n    print('0123456789' + secrets.get('key'))\n")
        .with_secrets(secrets(&[("key", "TOPSECRETVALUE")]));
    let result = engine.execute(request).await.unwrap();

    assert!(result.success, "{:?}", result.error);
    assert!(result.output.truncated);
    assert_eq!(result.output.text, "0123456789[REDAC");
    assert!(!result.output.text.contains("TOPSEC"));
}

#[tokio::test]
async fn capacity_is_reported_as_resource_exhaustion() {
    let config = EngineConfig::from_toml("[limits]\nmax_concurrent_calls = 1\n").unwrap();
    let engine = SandboxEngine::new(config).unwrap();

    let busy = ExecutionRequest::new("def main():\n    while True:\n        pass\n")
        .with_timeout_ms(300);
    let quick = ExecutionRequest::new("def main():\n    return 1\n");
    let (busy, quick) = tokio::join!(engine.execute(busy), engine.execute(quick));

    assert_eq!(
        busy.unwrap().error.unwrap().class,
        ErrorClass::TimeoutExceeded
    );
    let quick = quick.unwrap();
    let error = quick.error.unwrap();
    assert_eq!(error.class, ErrorClass::ResourceExhausted);
    assert!(error.class.is_limit_exceeded());

    // The permit is released once the busy call ends
    let again = engine
        .execute(ExecutionRequest::new("def main():\n    return 2\n"))
        .await
        .unwrap();
    assert_eq!(again.value, Some(json!(2)));
}

/// Holds the call thread inside name resolution, where the deadline is not
/// observed.
#[derive(Debug)]
struct StallingResolver(Duration);

impl Resolve for StallingResolver {
    fn resolve(&self, host: &str, _port: u16) -> ResolveFuture<'_> {
        std::thread::sleep(self.0);
        let host = host.to_string();
        Box::pin(async move {
            Err(io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))
        })
    }
}

#[tokio::test]
async fn abandoned_calls_keep_their_capacity_until_they_exit() {
    let config = EngineConfig::from_toml("[limits]\nmax_concurrent_calls = 1\n").unwrap();
    let engine = SandboxEngine::new(config)
        .unwrap()
        .with_resolver(Arc::new(StallingResolver(Duration::from_millis(1500))));
    let quick = || ExecutionRequest::new("def main():\n    return 1\n");

    let stuck = ExecutionRequest::new("def main():\n    return http.get('http://slow.test/')\n")
        .allow_host("*")
        .with_timeout_ms(100);
    let result = engine.execute(stuck).await.unwrap();
    assert_eq!(result.error.unwrap().class, ErrorClass::TimeoutExceeded);

    // The stuck thread still owns the only slot
    let refused = engine.execute(quick()).await.unwrap();
    assert_eq!(refused.error.unwrap().class, ErrorClass::ResourceExhausted);

    let mut served = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let result = engine.execute(quick()).await.unwrap();
        if result.success {
            served = Some(result);
            break;
        }
    }
    assert_eq!(served.expect("slot freed once the thread exits").value, Some(json!(1)));
}

#[tokio::test]
async fn outbound_destinations_are_checked() {
    let resolver = StaticResolver::new()
        .with_host("metadata.test", ["169.254.169.254".parse().unwrap()])
        .with_host("internal.test", ["10.0.0.7".parse().unwrap()]);
    let engine = engine().with_resolver(Arc::new(resolver));
    let fetch = |url: &str| {
        ExecutionRequest::new(format!(
            "def main():\n    return http.get('{url}')['status']\n"
        ))
    };

    // No hosts granted at all
    let result = engine.execute(fetch("http://metadata.test/")).await.unwrap();
    assert_eq!(
        result.error.unwrap().class,
        ErrorClass::NetworkDestinationRejected
    );

    for url in ["http://metadata.test/latest", "http://internal.test/", "http://127.0.0.1/"] {
        let request = fetch(url).allow_host("*");
        let result = engine.execute(request).await.unwrap();
        let error = result.error.unwrap();
        assert_eq!(error.class, ErrorClass::NetworkDestinationRejected, "{url}");
        assert_eq!(error.category, ErrorCategory::Network);
    }
}

#[tokio::test]
async fn rejections_are_catchable_by_the_script() {
    let engine = engine();
    let source = "\
def main():
    try:
        http.get('http://blocked.test/')
    except NetworkDestinationRejected:
        return 'refused'
";
    let result = engine.execute(ExecutionRequest::new(source)).await.unwrap();
    assert_eq!(result.value, Some(json!("refused")));
}

#[tokio::test]
async fn arguments_and_results_round_trip_as_json() {
    let source = "\
import json

def main(items, scale=2):
    total = 0
    for item in items:
        total += item['n'] * scale
    return {'total': total, 'encoded': json.dumps({'t': total})}
";
    let mut arguments = serde_json::Map::new();
    arguments.insert("items".into(), json!([{"n": 1}, {"n": 2}, {"n": 3}]));
    let request = ExecutionRequest::new(source)
        .with_arguments(arguments)
        .allow_module("json");
    let result = engine().execute(request).await.unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.value,
        Some(json!({"total": 12, "encoded": "{\"t\":12}"}))
    );
}

#[tokio::test]
async fn results_serialize_for_the_control_plane() {
    let request = ExecutionRequest::new("def main():\n    print('hi')\n    return [1, 'two', None]\n");
    let result = engine().execute(request).await.unwrap();
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["success"], json!(true));
    assert_eq!(value["value"], json!([1, "two", null]));
    assert_eq!(value["output"]["text"], json!("hi\n"));
    assert!(value.get("error").is_none());

    let parsed: BTreeMap<String, serde_json::Value> = serde_json::from_value(value).unwrap();
    assert!(parsed.contains_key("duration_ms"));
}
