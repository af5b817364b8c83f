use std::rc::Rc;

use super::exception::Exception;
use super::value::Value;

/// Match positional and keyword arguments against a fixed parameter list.
///
/// The first `required` parameters must be supplied; the rest come back as
/// `None` when absent.
pub(crate) fn bind(
    func: &str,
    params: &[&str],
    required: usize,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Vec<Option<Value>>, Exception> {
    if args.len() > params.len() {
        return Err(Exception::type_error(format!(
            "{func}() takes at most {} argument(s) ({} given)",
            params.len(),
            args.len()
        )));
    }
    let mut slots: Vec<Option<Value>> = vec![None; params.len()];
    for (slot, arg) in slots.iter_mut().zip(args) {
        *slot = Some(arg);
    }
    for (name, value) in kwargs {
        let Some(i) = params.iter().position(|p| *p == name) else {
            return Err(Exception::type_error(format!(
                "{func}() got an unexpected keyword argument '{name}'"
            )));
        };
        if slots[i].is_some() {
            return Err(Exception::type_error(format!(
                "{func}() got multiple values for argument '{name}'"
            )));
        }
        slots[i] = Some(value);
    }
    if let Some(missing) = slots[..required.min(params.len())]
        .iter()
        .position(Option::is_none)
    {
        return Err(Exception::type_error(format!(
            "{func}() missing required argument '{}'",
            params[missing]
        )));
    }
    Ok(slots)
}

/// Treat an explicit `None` the same as an omitted argument.
pub(crate) fn given(slot: Option<Value>) -> Option<Value> {
    match slot {
        Some(Value::None) | None => None,
        other => other,
    }
}

pub(crate) fn no_kwargs(func: &str, kwargs: &[(String, Value)]) -> Result<(), Exception> {
    match kwargs.first() {
        Some((name, _)) => Err(Exception::type_error(format!(
            "{func}() got an unexpected keyword argument '{name}'"
        ))),
        None => Ok(()),
    }
}

pub(crate) fn expect_str(value: &Value, func: &str) -> Result<Rc<str>, Exception> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(Exception::type_error(format!(
            "{func}() expected str, got {}",
            other.type_name()
        ))),
    }
}

pub(crate) fn expect_int(value: &Value, func: &str) -> Result<i64, Exception> {
    value.as_int().ok_or_else(|| {
        Exception::type_error(format!(
            "{func}() expected int, got {}",
            value.type_name()
        ))
    })
}

pub(crate) fn expect_float(value: &Value, func: &str) -> Result<f64, Exception> {
    value.as_float().ok_or_else(|| {
        Exception::type_error(format!(
            "{func}() expected a number, got {}",
            value.type_name()
        ))
    })
}

/// Pull an argument that `bind` already guaranteed is present.
pub(crate) fn take(slots: &mut [Option<Value>], index: usize) -> Value {
    slots
        .get_mut(index)
        .and_then(Option::take)
        .unwrap_or(Value::None)
}
