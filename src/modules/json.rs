use super::{ModuleContext, NativeModule, unknown_attribute};
use crate::runtime::args::{bind, expect_str, given, take};
use crate::runtime::{Exception, Value, check_str_len, from_json, to_json};

pub(crate) struct JsonModule;

const EXPORTS: &[&str] = &["dumps", "loads"];

impl NativeModule for JsonModule {
    fn name(&self) -> &'static str {
        "json"
    }

    fn exports(&self) -> &'static [&'static str] {
        EXPORTS
    }

    fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        cx: &mut ModuleContext<'_>,
    ) -> Result<Value, Exception> {
        match name {
            "dumps" => {
                let mut slots = bind(name, &["obj", "indent", "sort_keys"], 1, args, kwargs)?;
                let obj = take(&mut slots, 0);
                let pretty = given(slots[1].take()).is_some();
                // Object keys are always emitted sorted; `sort_keys` is accepted
                // for compatibility.
                let json = to_json(&obj, cx.limits)?;
                let text = if pretty {
                    serde_json::to_string_pretty(&json)
                } else {
                    serde_json::to_string(&json)
                }
                .map_err(|e| Exception::value_error(e.to_string()))?;
                check_str_len(cx.limits, text.len())?;
                Ok(Value::str(text))
            }
            "loads" => {
                let mut slots = bind(name, &["s"], 1, args, kwargs)?;
                let text = expect_str(&take(&mut slots, 0), name)?;
                let json: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|e| Exception::value_error(format!("invalid JSON: {e}")))?;
                Ok(from_json(&json))
            }
            _ => Err(unknown_attribute(self.name(), name)),
        }
    }
}
