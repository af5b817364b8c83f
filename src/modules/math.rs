use std::f64::consts;

use super::{ModuleContext, NativeModule, unknown_attribute};
use crate::runtime::args::{bind, expect_float, given, take};
use crate::runtime::ops::float_to_int;
use crate::runtime::{ExcKind, Exception, Value};

pub(crate) struct MathModule;

const EXPORTS: &[&str] = &[
    "pi", "e", "inf", "sqrt", "floor", "ceil", "pow", "log", "exp", "fabs", "isfinite",
];

fn domain_error() -> Exception {
    Exception::value_error("math domain error")
}

fn range_error() -> Exception {
    Exception::new(ExcKind::OverflowError, "math range error")
}

fn one_arg(name: &str, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Result<Value, Exception> {
    let mut slots = bind(name, &["x"], 1, args, kwargs)?;
    Ok(take(&mut slots, 0))
}

impl NativeModule for MathModule {
    fn name(&self) -> &'static str {
        "math"
    }

    fn exports(&self) -> &'static [&'static str] {
        EXPORTS
    }

    fn constant(&self, name: &str) -> Option<Value> {
        match name {
            "pi" => Some(Value::Float(consts::PI)),
            "e" => Some(Value::Float(consts::E)),
            "inf" => Some(Value::Float(f64::INFINITY)),
            _ => None,
        }
    }

    fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        _cx: &mut ModuleContext<'_>,
    ) -> Result<Value, Exception> {
        match name {
            "sqrt" => {
                let x = expect_float(&one_arg(name, args, kwargs)?, name)?;
                if x < 0.0 {
                    return Err(domain_error());
                }
                Ok(Value::Float(x.sqrt()))
            }
            "floor" | "ceil" => {
                let x = one_arg(name, args, kwargs)?;
                if let Some(i) = x.as_int() {
                    return Ok(Value::Int(i));
                }
                let f = expect_float(&x, name)?;
                let rounded = if name == "floor" { f.floor() } else { f.ceil() };
                Ok(Value::Int(float_to_int(rounded)?))
            }
            "pow" => {
                let mut slots = bind(name, &["x", "y"], 2, args, kwargs)?;
                let x = expect_float(&take(&mut slots, 0), name)?;
                let y = expect_float(&take(&mut slots, 1), name)?;
                if x == 0.0 && y < 0.0 {
                    return Err(domain_error());
                }
                let r = x.powf(y);
                if r.is_nan() && !x.is_nan() && !y.is_nan() {
                    return Err(domain_error());
                }
                if r.is_infinite() && x.is_finite() && y.is_finite() {
                    return Err(range_error());
                }
                Ok(Value::Float(r))
            }
            "log" => {
                let mut slots = bind(name, &["x", "base"], 1, args, kwargs)?;
                let x = expect_float(&take(&mut slots, 0), name)?;
                if x <= 0.0 {
                    return Err(domain_error());
                }
                match given(slots[1].take()) {
                    None => Ok(Value::Float(x.ln())),
                    Some(base) => {
                        let base = expect_float(&base, name)?;
                        if base <= 0.0 || base == 1.0 {
                            return Err(domain_error());
                        }
                        Ok(Value::Float(x.ln() / base.ln()))
                    }
                }
            }
            "exp" => {
                let x = expect_float(&one_arg(name, args, kwargs)?, name)?;
                let r = x.exp();
                if r.is_infinite() && x.is_finite() {
                    return Err(range_error());
                }
                Ok(Value::Float(r))
            }
            "fabs" => {
                let x = expect_float(&one_arg(name, args, kwargs)?, name)?;
                Ok(Value::Float(x.abs()))
            }
            "isfinite" => {
                let x = expect_float(&one_arg(name, args, kwargs)?, name)?;
                Ok(Value::Bool(x.is_finite()))
            }
            _ => Err(unknown_attribute(self.name(), name)),
        }
    }
}
