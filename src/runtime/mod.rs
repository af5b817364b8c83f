//! Restricted runtime: runs a validated program with only the names, modules
//! and hosts granted to the call.
//!
//! Each call gets a fresh interpreter on its own thread. The async side waits
//! for the outcome with a hard timeout, so a call can never hold the caller
//! past its deadline even if the interpreter stops checking.

pub(crate) mod args;
mod builtins;
mod exception;
mod interp;
mod methods;
pub(crate) mod ops;
mod value;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Map, Value as JsonValue};
use tokio::sync::{OwnedSemaphorePermit, oneshot};
use tracing::{debug, error, info, warn};

pub use exception::{ExcKind, Exception};
pub(crate) use value::{MatchData, ModuleFn, Value, from_json, to_json};

use crate::error::{EngineError, ErrorCategory, ErrorClass, ErrorDescriptor, GENERIC_MESSAGE};
use crate::lang::Program;
use crate::limits::RuntimeLimits;
use crate::modules::AllowedModuleTable;
use crate::net::{NetworkClientFactory, OutboundClient, Resolve};
use crate::output::{CapturedOutput, OutputBuffer};
use crate::request::ExecutionRequest;
use crate::result::ExecutionResult;
use crate::secrets::SecretView;
use interp::{Halt, Outcome};

/// Stack for the thread running a call. Evaluation recurses per nesting
/// level and per script call frame.
const CALL_STACK_BYTES: usize = 32 * 1024 * 1024;

/// Extra time the async side waits beyond the call's own deadline before
/// giving up on the interpreter thread.
const HALT_GRACE: Duration = Duration::from_millis(250);

pub(crate) fn check_str_len(limits: &RuntimeLimits, len: usize) -> Result<(), Exception> {
    if len > limits.max_string_bytes {
        return Err(Exception::memory(format!(
            "string of {len} bytes exceeds the {} byte limit",
            limits.max_string_bytes
        )));
    }
    Ok(())
}

pub(crate) fn check_len(limits: &RuntimeLimits, len: usize) -> Result<(), Exception> {
    if len > limits.max_collection_len {
        return Err(Exception::memory(format!(
            "collection of {len} items exceeds the {} item limit",
            limits.max_collection_len
        )));
    }
    Ok(())
}

/// Everything one call may touch. Built fresh for every call and moved onto
/// the call's thread; nothing in it is shared with another call except the
/// read-only module table.
pub struct Scope {
    pub(crate) program: Program,
    pub(crate) modules: Arc<AllowedModuleTable>,
    pub(crate) granted: BTreeSet<String>,
    pub(crate) arguments: Map<String, JsonValue>,
    pub(crate) secrets: SecretView,
    pub(crate) client: OutboundClient,
    pub(crate) limits: RuntimeLimits,
}

/// Sets the cancellation flag when the waiting future goes away, so an
/// abandoned call stops at its next check.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct RestrictedRuntime {
    modules: Arc<AllowedModuleTable>,
    network: NetworkClientFactory,
    limits: RuntimeLimits,
}

impl RestrictedRuntime {
    pub fn new(
        modules: Arc<AllowedModuleTable>,
        network: NetworkClientFactory,
        limits: RuntimeLimits,
    ) -> Self {
        Self {
            modules,
            network,
            limits,
        }
    }

    /// Resolve outbound names through `resolver` instead of the system.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.network = self.network.with_resolver(resolver);
        self
    }

    pub fn limits(&self) -> &RuntimeLimits {
        &self.limits
    }

    /// Fresh scope for one call. Modules outside the engine's table are
    /// refused here rather than at import time.
    pub fn build_scope(
        &self,
        program: Program,
        request: ExecutionRequest,
    ) -> Result<Scope, EngineError> {
        self.modules
            .check_subset(&request.allowed_modules)
            .map_err(EngineError::ModulesNotPermitted)?;
        let client = self.network.open_client(request.allowed_hosts.as_ref());
        Ok(Scope {
            program,
            modules: self.modules.clone(),
            granted: request.allowed_modules,
            arguments: request.arguments,
            secrets: request.secrets,
            client,
            limits: self.limits.clone(),
        })
    }

    /// Run a scope to completion or until `timeout` elapses.
    ///
    /// `permit` moves onto the call thread and is released when that thread
    /// finishes, even if the call was abandoned at its deadline.
    pub async fn run(
        &self,
        scope: Scope,
        timeout: Duration,
        permit: Option<OwnedSemaphorePermit>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let deadline = started + timeout;
        let secrets = scope.secrets.clone();
        let output = Arc::new(Mutex::new(OutputBuffer::new(self.limits.max_output_bytes)));
        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_guard = CancelOnDrop(cancel.clone());

        let (tx, rx) = oneshot::channel();
        let spawned = thread::Builder::new()
            .name("toolcell-call".to_string())
            .stack_size(CALL_STACK_BYTES)
            .spawn({
                let output = output.clone();
                let cancel = cancel.clone();
                move || {
                    let outcome = interp::execute(scope, output, deadline, cancel);
                    drop(permit);
                    let _ = tx.send(outcome);
                }
            });

        let outcome = match spawned {
            Err(e) => {
                warn!(error = %e, "could not start call thread");
                Outcome::Halted(Halt::ResourceExhausted(
                    "no capacity to start the call".to_string(),
                ))
            }
            Ok(_) => match tokio::time::timeout(timeout + HALT_GRACE, rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Outcome::Halted(Halt::Internal(
                    "call thread exited without a result".to_string(),
                )),
                Err(_) => {
                    cancel.store(true, Ordering::Relaxed);
                    warn!("call did not stop at its deadline; abandoning its thread");
                    Outcome::Halted(Halt::Timeout)
                }
            },
        };

        let captured = output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot();
        self.finish(outcome, captured, &secrets, timeout, started.elapsed())
    }

    fn finish(
        &self,
        outcome: Outcome,
        mut output: CapturedOutput,
        secrets: &SecretView,
        timeout: Duration,
        elapsed: Duration,
    ) -> ExecutionResult {
        if !secrets.is_empty() {
            output.text = secrets.redact(&output.text).into_owned();
        }
        output.enforce_limit(self.limits.max_output_bytes);

        let result = match outcome {
            Outcome::Returned(mut value) => {
                secrets.redact_json(&mut value);
                let mut result = ExecutionResult::ok(value, output, elapsed);
                result.enforce_value_limit(self.limits.max_result_bytes);
                result
            }
            Outcome::Raised(exc) => {
                ExecutionResult::err(describe_exception(&exc, secrets), output, elapsed)
            }
            Outcome::Halted(Halt::Timeout | Halt::Cancelled) => {
                ExecutionResult::err(ErrorDescriptor::timeout(timeout.as_millis()), output, elapsed)
            }
            Outcome::Halted(Halt::ResourceExhausted(message)) => {
                ExecutionResult::err(ErrorDescriptor::resource_exhausted(message), output, elapsed)
            }
            Outcome::Halted(Halt::Internal(detail)) => {
                error!(detail = %detail, "call failed inside the engine");
                ExecutionResult::err(ErrorDescriptor::internal(), output, elapsed)
            }
        };

        match &result.error {
            None => info!(duration_ms = result.duration_ms, "call succeeded"),
            Some(e) => info!(
                duration_ms = result.duration_ms,
                class = %e.class,
                category = ?e.category,
                "call failed"
            ),
        }
        result
    }
}

fn describe_exception(exc: &Exception, secrets: &SecretView) -> ErrorDescriptor {
    if exc.kind == ExcKind::NetworkDestinationRejected {
        return ErrorDescriptor::new(
            ErrorClass::NetworkDestinationRejected,
            ErrorCategory::Network,
            secrets.redact(&exc.message).into_owned(),
        )
        .with_exception_type(exc.kind.name());
    }
    let message = if exc.kind.is_message_safe() {
        secrets.redact(&exc.message).into_owned()
    } else {
        debug!(
            exception = exc.kind.name(),
            detail = %secrets.redact(&exc.message),
            "exception message withheld from caller"
        );
        GENERIC_MESSAGE.to_string()
    };
    ErrorDescriptor::new(ErrorClass::ScriptRaisedException, exc.kind.category(), message)
        .with_exception_type(exc.kind.name())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Run snippets through the interpreter without the engine around it.

    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use serde_json::Value as JsonValue;

    use super::interp::{Outcome, execute};
    use super::{CALL_STACK_BYTES, Exception, Scope};
    use crate::limits::RuntimeLimits;
    use crate::modules::AllowedModuleTable;
    use crate::net::{NetworkClientFactory, NetworkConfig};
    use crate::output::OutputBuffer;
    use crate::secrets::SecretView;

    pub(crate) fn outcome(source: &str) -> Outcome {
        let program = crate::lang::parse(source).expect("test source parses");
        let modules = Arc::new(AllowedModuleTable::builtin());
        let scope = Scope {
            program,
            granted: modules.module_names().map(str::to_string).collect(),
            modules,
            arguments: Default::default(),
            secrets: SecretView::from_iter([("token", "s3cr3t-value")]),
            client: NetworkClientFactory::new(NetworkConfig::default())
                .expect("default network config")
                .open_client(None),
            limits: RuntimeLimits::default(),
        };
        let output = Arc::new(Mutex::new(OutputBuffer::new(4096)));
        let deadline = Instant::now() + Duration::from_secs(5);
        std::thread::Builder::new()
            .stack_size(CALL_STACK_BYTES)
            .spawn(move || execute(scope, output, deadline, Default::default()))
            .expect("spawn test thread")
            .join()
            .expect("interpreter thread panicked")
    }

    /// Run a script defining `main` and return its value or exception.
    pub(crate) fn run(source: &str) -> Result<JsonValue, Exception> {
        match outcome(source) {
            Outcome::Returned(value) => Ok(value),
            Outcome::Raised(exc) => Err(exc),
            Outcome::Halted(halt) => panic!("unexpected halt: {halt:?}"),
        }
    }

    pub(crate) fn eval(expr: &str) -> JsonValue {
        run(&format!("def main():\n    return {expr}\n"))
            .unwrap_or_else(|exc| panic!("{expr} raised {exc}"))
    }

    pub(crate) fn eval_err(expr: &str) -> Exception {
        match run(&format!("def main():\n    return {expr}\n")) {
            Ok(value) => panic!("{expr} returned {value}"),
            Err(exc) => exc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{eval, eval_err, outcome, run};
    use super::*;
    use serde_json::json;

    #[test]
    fn arithmetic_and_control_flow() {
        let source = "\
def fib(n):
    a, b = 0, 1
    for _ in range(n):
        a, b = b, a + b
    return a

def main():
    total = 0
    i = 0
    while True:
        i += 1
        if i % 2 == 0:
            continue
        if i > 9:
            break
        total += i
    return [fib(10), total, 7 // -2, -7 % 3, 2 ** -1]
";
        assert_eq!(run(source).unwrap(), json!([55, 25, -4, 2, 0.5]));
    }

    #[test]
    fn exceptions_are_catchable_and_finally_runs() {
        let source = "\
def main():
    log = []
    try:
        try:
            {}['missing']
        except KeyError as e:
            log.append('caught ' + str(e))
            raise
        finally:
            log.append('inner finally')
    except LookupError:
        log.append('outer')
    else:
        log.append('never')
    return log
";
        assert_eq!(
            run(source).unwrap(),
            json!(["caught 'missing'", "inner finally", "outer"])
        );
    }

    #[test]
    fn unhandled_exception_reaches_the_caller() {
        let exc = eval_err("1 / 0");
        assert_eq!(exc.kind, ExcKind::ZeroDivisionError);
        let exc = run("def main():\n    raise ValueError('bad input')\n").unwrap_err();
        assert_eq!(exc.kind, ExcKind::ValueError);
        assert_eq!(exc.message, "bad input");
    }

    #[test]
    fn recursion_is_bounded() {
        let source = "def f(n):\n    return f(n + 1)\n\ndef main():\n    return f(0)\n";
        assert_eq!(run(source).unwrap_err().kind, ExcKind::RecursionError);
    }

    #[test]
    fn module_access_is_proxied() {
        let source = "\
import math
from json import dumps

def main():
    return [math.sqrt(16), dumps({'b': 1, 'a': 2})]
";
        assert_eq!(run(source).unwrap(), json!([4.0, "{\"a\":2,\"b\":1}"]));
        let exc = run("import math\ndef main():\n    return math.system\n").unwrap_err();
        assert_eq!(exc.kind, ExcKind::AttributeError);
    }

    #[test]
    fn ungranted_and_unknown_imports_fail_alike() {
        let unknown = run("import os\ndef main():\n    return 1\n").unwrap_err();
        assert_eq!(unknown.kind, ExcKind::ImportError);
        assert_eq!(unknown.message, "no module named 'os'");
    }

    #[test]
    fn secrets_are_readable_but_not_writable() {
        assert_eq!(eval("secrets['token']"), json!("s3cr3t-value"));
        assert_eq!(eval("[('token' in secrets), secrets.keys()]"), json!([true, ["token"]]));
        assert_eq!(eval_err("secrets['nope']").kind, ExcKind::KeyError);
        let exc = run("def main():\n    secrets['token'] = 'x'\n").unwrap_err();
        assert_eq!(exc.kind, ExcKind::TypeError);
    }

    #[test]
    fn network_is_denied_without_hosts() {
        let exc = eval_err("http.get('https://example.com/')");
        assert_eq!(exc.kind, ExcKind::NetworkDestinationRejected);
    }

    #[test]
    fn missing_entry_point_is_a_name_error() {
        assert_eq!(run("x = 1\n").unwrap_err().kind, ExcKind::NameError);
    }

    #[test]
    fn unserializable_result_is_a_type_error() {
        assert_eq!(eval_err("range(3)").kind, ExcKind::TypeError);
    }

    #[test]
    fn infinite_loop_hits_the_deadline() {
        let program = crate::lang::parse("def main():\n    while True:\n        pass\n").unwrap();
        let modules = Arc::new(AllowedModuleTable::builtin());
        let scope = Scope {
            program,
            modules,
            granted: BTreeSet::new(),
            arguments: Map::new(),
            secrets: SecretView::new(),
            client: NetworkClientFactory::new(Default::default())
                .unwrap()
                .open_client(None),
            limits: RuntimeLimits::default(),
        };
        let output = Arc::new(Mutex::new(OutputBuffer::new(64)));
        let deadline = Instant::now() + Duration::from_millis(50);
        let outcome = interp::execute(scope, output, deadline, Default::default());
        assert!(matches!(outcome, Outcome::Halted(Halt::Timeout)));
    }

    #[test]
    fn deeply_nested_values_do_not_overflow() {
        let source = "\
def main():
    x = []
    for _ in range(50000):
        x = [x]
    return len(x)
";
        assert!(matches!(outcome(source), Outcome::Returned(_)));
    }
}
