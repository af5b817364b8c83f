use std::sync::LazyLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use super::{ModuleContext, NativeModule, unknown_attribute};
use crate::runtime::args::bind;
use crate::runtime::{Exception, Value};

pub(crate) struct TimeModule;

const EXPORTS: &[&str] = &["time", "monotonic"];

static MONOTONIC_BASE: LazyLock<Instant> = LazyLock::new(Instant::now);

impl NativeModule for TimeModule {
    fn name(&self) -> &'static str {
        "time"
    }

    fn exports(&self) -> &'static [&'static str] {
        EXPORTS
    }

    fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        _cx: &mut ModuleContext<'_>,
    ) -> Result<Value, Exception> {
        bind(name, &[], 0, args, kwargs)?;
        match name {
            "time" => {
                let secs = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                Ok(Value::Float(secs))
            }
            "monotonic" => Ok(Value::Float(MONOTONIC_BASE.elapsed().as_secs_f64())),
            _ => Err(unknown_attribute(self.name(), name)),
        }
    }
}
