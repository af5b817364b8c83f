use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};

use super::{ModuleContext, NativeModule, unknown_attribute};
use crate::runtime::args::{bind, expect_str, take};
use crate::runtime::{Exception, Value, check_str_len};

pub(crate) struct Base64Module;

const EXPORTS: &[&str] = &[
    "b64encode",
    "b64decode",
    "urlsafe_b64encode",
    "urlsafe_b64decode",
];

impl NativeModule for Base64Module {
    fn name(&self) -> &'static str {
        "base64"
    }

    fn exports(&self) -> &'static [&'static str] {
        EXPORTS
    }

    /// Strings go in and come out as UTF-8 text; decoding bytes that are
    /// not UTF-8 raises `ValueError`.
    fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        cx: &mut ModuleContext<'_>,
    ) -> Result<Value, Exception> {
        let mut slots = bind(name, &["s"], 1, args, kwargs)?;
        let input = expect_str(&take(&mut slots, 0), name)?;
        let engine = match name {
            "b64encode" | "b64decode" => &STANDARD,
            "urlsafe_b64encode" | "urlsafe_b64decode" => &URL_SAFE,
            _ => return Err(unknown_attribute(self.name(), name)),
        };

        if name.ends_with("encode") {
            let encoded = engine.encode(input.as_bytes());
            check_str_len(cx.limits, encoded.len())?;
            return Ok(Value::str(encoded));
        }

        let bytes = engine
            .decode(input.trim().as_bytes())
            .map_err(|e| Exception::value_error(format!("invalid base64 input: {e}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| Exception::value_error("decoded bytes are not valid UTF-8"))?;
        Ok(Value::str(text))
    }
}
