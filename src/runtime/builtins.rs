use std::cmp::Ordering;
use std::num::IntErrorKind;

use super::args::{bind, expect_int, given, no_kwargs, take};
use super::exception::{ExcKind, Exception};
use super::interp::{Flow, Interpreter};
use super::ops::{self, float_to_int};
use super::value::{
    Budget, Dict, Key, Range, Value, compare_values, sort_order, sortable_together,
};
use super::check_len;
use crate::lang::ast::BinOp;

/// Functions every script can call without importing anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Len,
    Range,
    Str,
    Repr,
    Int,
    Float,
    Bool,
    List,
    Tuple,
    Dict,
    Abs,
    Min,
    Max,
    Sum,
    Round,
    Sorted,
    Reversed,
    Enumerate,
    Zip,
    Any,
    All,
}

impl Builtin {
    pub const ALL: [Builtin; 22] = [
        Self::Print,
        Self::Len,
        Self::Range,
        Self::Str,
        Self::Repr,
        Self::Int,
        Self::Float,
        Self::Bool,
        Self::List,
        Self::Tuple,
        Self::Dict,
        Self::Abs,
        Self::Min,
        Self::Max,
        Self::Sum,
        Self::Round,
        Self::Sorted,
        Self::Reversed,
        Self::Enumerate,
        Self::Zip,
        Self::Any,
        Self::All,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Len => "len",
            Self::Range => "range",
            Self::Str => "str",
            Self::Repr => "repr",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Tuple => "tuple",
            Self::Dict => "dict",
            Self::Abs => "abs",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Round => "round",
            Self::Sorted => "sorted",
            Self::Reversed => "reversed",
            Self::Enumerate => "enumerate",
            Self::Zip => "zip",
            Self::Any => "any",
            Self::All => "all",
        }
    }

    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }
}

pub(crate) fn call(
    interp: &mut Interpreter,
    builtin: Builtin,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Flow<Value> {
    let name = builtin.name();
    let value = match builtin {
        Builtin::Print => {
            let mut sep = " ".to_string();
            let mut end = "\n".to_string();
            for (key, value) in kwargs {
                let text = match given(Some(value)) {
                    Some(Value::Str(s)) => Some(s.to_string()),
                    None => None,
                    Some(other) => {
                        return Err(Exception::type_error(format!(
                            "{key} must be None or a string, not {}",
                            other.type_name()
                        ))
                        .into());
                    }
                };
                match key.as_str() {
                    "sep" => sep = text.unwrap_or_else(|| " ".to_string()),
                    "end" => end = text.unwrap_or_else(|| "\n".to_string()),
                    _ => {
                        return Err(Exception::type_error(format!(
                            "print() got an unexpected keyword argument '{key}'"
                        ))
                        .into());
                    }
                }
            }
            let mut line = args
                .iter()
                .map(|arg| arg.try_to_str(interp.limits()))
                .collect::<Result<Vec<_>, _>>()?
                .join(&sep);
            line.push_str(&end);
            interp.write_output(&line);
            Value::None
        }
        Builtin::Len => {
            let mut slots = bind(name, &["obj"], 1, args, kwargs)?;
            let len = match take(&mut slots, 0) {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.borrow().len(),
                Value::Tuple(items) => items.len(),
                Value::Dict(dict) => dict.borrow().len(),
                Value::Range(range) => usize::try_from(range.len()).unwrap_or(usize::MAX),
                Value::Secrets => interp.secrets().len(),
                other => {
                    return Err(Exception::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    ))
                    .into());
                }
            };
            Value::Int(i64::try_from(len).map_err(|_| Exception::overflow())?)
        }
        Builtin::Range => {
            no_kwargs(name, &kwargs)?;
            let ints = args
                .iter()
                .map(|a| expect_int(a, name))
                .collect::<Result<Vec<_>, _>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => {
                    return Err(Exception::type_error(format!(
                        "range expected 1 to 3 arguments, got {}",
                        ints.len()
                    ))
                    .into());
                }
            };
            if step == 0 {
                return Err(Exception::value_error("range() arg 3 must not be zero").into());
            }
            Value::Range(Range { start, stop, step })
        }
        Builtin::Str => {
            let mut slots = bind(name, &["object"], 0, args, kwargs)?;
            match slots[0].take() {
                None => Value::str(""),
                Some(Value::Str(s)) => Value::Str(s),
                Some(other) => Value::str(other.try_to_str(interp.limits())?),
            }
        }
        Builtin::Repr => {
            let mut slots = bind(name, &["object"], 1, args, kwargs)?;
            Value::str(take(&mut slots, 0).try_repr(interp.limits())?)
        }
        Builtin::Int => {
            let mut slots = bind(name, &["x", "base"], 0, args, kwargs)?;
            let base = given(slots[1].take()).map(|b| expect_int(&b, name)).transpose()?;
            match (slots[0].take(), base) {
                (None, None) => Value::Int(0),
                (Some(Value::Str(s)), base) => Value::Int(parse_int(&s, base.unwrap_or(10))?),
                (Some(_), Some(_)) => {
                    return Err(Exception::type_error(
                        "int() can't convert non-string with explicit base",
                    )
                    .into());
                }
                (Some(Value::Float(f)), None) => Value::Int(float_to_int(f)?),
                (Some(other), None) => match other.as_int() {
                    Some(i) => Value::Int(i),
                    None => {
                        return Err(Exception::type_error(format!(
                            "int() argument must be a string or a number, not '{}'",
                            other.type_name()
                        ))
                        .into());
                    }
                },
                (None, Some(_)) => {
                    return Err(Exception::type_error("int() missing string argument").into());
                }
            }
        }
        Builtin::Float => {
            let mut slots = bind(name, &["x"], 0, args, kwargs)?;
            match slots[0].take() {
                None => Value::Float(0.0),
                Some(Value::Str(s)) => Value::Float(parse_float(&s)?),
                Some(other) => match other.as_float() {
                    Some(f) => Value::Float(f),
                    None => {
                        return Err(Exception::type_error(format!(
                            "float() argument must be a string or a number, not '{}'",
                            other.type_name()
                        ))
                        .into());
                    }
                },
            }
        }
        Builtin::Bool => {
            let mut slots = bind(name, &["x"], 0, args, kwargs)?;
            Value::Bool(slots[0].take().is_some_and(|v| v.truthy()))
        }
        Builtin::List => {
            let mut slots = bind(name, &["iterable"], 0, args, kwargs)?;
            match slots[0].take() {
                None => Value::list(Vec::new()),
                Some(v) => Value::list(interp.iterate(&v)?),
            }
        }
        Builtin::Tuple => {
            let mut slots = bind(name, &["iterable"], 0, args, kwargs)?;
            match slots[0].take() {
                None => Value::tuple(Vec::new()),
                Some(v) => Value::tuple(interp.iterate(&v)?),
            }
        }
        Builtin::Dict => {
            if args.len() > 1 {
                return Err(Exception::type_error(format!(
                    "dict expected at most 1 argument, got {}",
                    args.len()
                ))
                .into());
            }
            let mut dict = match args.into_iter().next() {
                None => Dict::default(),
                Some(Value::Dict(source)) => source.borrow().clone(),
                Some(pairs) => {
                    let mut dict = Dict::default();
                    for pair in interp.iterate(&pairs)? {
                        let items = interp.iterate(&pair)?;
                        let [key, value] = <[Value; 2]>::try_from(items).map_err(|_| {
                            Exception::value_error(
                                "dictionary update sequence element has wrong length",
                            )
                        })?;
                        dict.insert(Key::from_value(&key)?, value);
                    }
                    dict
                }
            };
            for (key, value) in kwargs {
                dict.insert(Key::Str(key.into()), value);
            }
            check_len(interp.limits(), dict.len())?;
            Value::dict(dict)
        }
        Builtin::Abs => {
            let mut slots = bind(name, &["x"], 1, args, kwargs)?;
            match take(&mut slots, 0) {
                Value::Float(f) => Value::Float(f.abs()),
                other => match other.as_int() {
                    Some(i) => Value::Int(i.checked_abs().ok_or_else(Exception::overflow)?),
                    None => {
                        return Err(Exception::type_error(format!(
                            "bad operand type for abs(): '{}'",
                            other.type_name()
                        ))
                        .into());
                    }
                },
            }
        }
        Builtin::Min | Builtin::Max => extremum(interp, builtin, args, kwargs)?,
        Builtin::Sum => {
            let mut slots = bind(name, &["iterable", "start"], 1, args, kwargs)?;
            let iterable = take(&mut slots, 0);
            let mut total = slots[1].take().unwrap_or(Value::Int(0));
            if matches!(total, Value::Str(_)) {
                return Err(Exception::type_error(
                    "sum() can't sum strings [use ''.join(seq) instead]",
                )
                .into());
            }
            for item in interp.iterate(&iterable)? {
                total = ops::binary(BinOp::Add, &total, &item, interp.limits())?;
            }
            total
        }
        Builtin::Round => {
            let mut slots = bind(name, &["number", "ndigits"], 1, args, kwargs)?;
            let number = take(&mut slots, 0);
            let ndigits = given(slots[1].take()).map(|n| expect_int(&n, name)).transpose()?;
            round(&number, ndigits)?
        }
        Builtin::Sorted => {
            let mut slots = bind(name, &["iterable", "key", "reverse"], 1, args, kwargs)?;
            let items = interp.iterate(&take(&mut slots, 0))?;
            let key = given(slots[1].take());
            let reverse = slots[2].take().is_some_and(|v| v.truthy());
            Value::list(sort_values(interp, items, key, reverse)?)
        }
        Builtin::Reversed => {
            let mut slots = bind(name, &["sequence"], 1, args, kwargs)?;
            let mut items = interp.iterate(&take(&mut slots, 0))?;
            items.reverse();
            Value::list(items)
        }
        Builtin::Enumerate => {
            let mut slots = bind(name, &["iterable", "start"], 1, args, kwargs)?;
            let items = interp.iterate(&take(&mut slots, 0))?;
            let start = given(slots[1].take()).map(|s| expect_int(&s, name)).transpose()?;
            let mut index = start.unwrap_or(0);
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Value::tuple(vec![Value::Int(index), item]));
                index = index.checked_add(1).ok_or_else(Exception::overflow)?;
            }
            Value::list(out)
        }
        Builtin::Zip => {
            no_kwargs(name, &kwargs)?;
            let columns = args
                .iter()
                .map(|a| interp.iterate(a))
                .collect::<Result<Vec<_>, _>>()?;
            let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
            let out = (0..rows)
                .map(|row| Value::tuple(columns.iter().map(|c| c[row].clone()).collect()))
                .collect();
            Value::list(out)
        }
        Builtin::Any => {
            let mut slots = bind(name, &["iterable"], 1, args, kwargs)?;
            Value::Bool(interp.iterate(&take(&mut slots, 0))?.iter().any(Value::truthy))
        }
        Builtin::All => {
            let mut slots = bind(name, &["iterable"], 1, args, kwargs)?;
            Value::Bool(interp.iterate(&take(&mut slots, 0))?.iter().all(Value::truthy))
        }
    };
    Ok(value)
}

/// Stable sort of `items`, by `key(item)` when a key function is given.
pub(crate) fn sort_values(
    interp: &mut Interpreter,
    items: Vec<Value>,
    key: Option<Value>,
    reverse: bool,
) -> Flow<Vec<Value>> {
    let keys = match &key {
        Some(function) => {
            let mut keys = Vec::with_capacity(items.len());
            for item in &items {
                keys.push(interp.call_value(function, vec![item.clone()], Vec::new())?);
            }
            keys
        }
        None => items.clone(),
    };
    if let Some(first) = keys.first() {
        if let Some(bad) = keys.iter().find(|k| !sortable_together(first, k)) {
            return Err(Exception::type_error(format!(
                "'<' not supported between instances of '{}' and '{}'",
                bad.type_name(),
                first.type_name()
            ))
            .into());
        }
    }

    let mut budget = Budget::new(interp.limits());
    let order = merge_sort(items.len(), |a, b| {
        let (a, b) = if reverse { (b, a) } else { (a, b) };
        sort_order(&keys[a], &keys[b], &mut budget)
    })?;
    let mut slots: Vec<Option<Value>> = items.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

/// Stable bottom-up merge sort of the indices `0..len`. The comparison may
/// fail part way, which `slice::sort_by` cannot express.
fn merge_sort(
    len: usize,
    mut cmp: impl FnMut(usize, usize) -> Result<Ordering, Exception>,
) -> Result<Vec<usize>, Exception> {
    let mut order: Vec<usize> = (0..len).collect();
    let mut merged = Vec::with_capacity(len);
    let mut width = 1;
    while width < len {
        merged.clear();
        for start in (0..len).step_by(2 * width) {
            let mid = (start + width).min(len);
            let end = (start + 2 * width).min(len);
            let (mut i, mut j) = (start, mid);
            while i < mid && j < end {
                if cmp(order[j], order[i])? == Ordering::Less {
                    merged.push(order[j]);
                    j += 1;
                } else {
                    merged.push(order[i]);
                    i += 1;
                }
            }
            merged.extend_from_slice(&order[i..mid]);
            merged.extend_from_slice(&order[j..end]);
        }
        std::mem::swap(&mut order, &mut merged);
        width *= 2;
    }
    Ok(order)
}

fn extremum(
    interp: &mut Interpreter,
    builtin: Builtin,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Flow<Value> {
    let name = builtin.name();
    let mut key = None;
    for (k, v) in kwargs {
        if k != "key" {
            return Err(Exception::type_error(format!(
                "{name}() got an unexpected keyword argument '{k}'"
            ))
            .into());
        }
        key = given(Some(v));
    }
    let items = match <[Value; 1]>::try_from(args) {
        Ok([single]) => interp.iterate(&single)?,
        Err(args) => args,
    };
    let want = if builtin == Builtin::Min {
        Ordering::Less
    } else {
        Ordering::Greater
    };

    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let rank = match &key {
            Some(function) => interp.call_value(function, vec![item.clone()], Vec::new())?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((best_rank, _)) => {
                compare_values(&rank, best_rank, interp.limits())? == Some(want)
            }
        };
        if replace {
            best = Some((rank, item));
        }
    }
    best.map(|(_, item)| item)
        .ok_or_else(|| Exception::value_error(format!("{name}() arg is an empty sequence")).into())
}

fn round(number: &Value, ndigits: Option<i64>) -> Result<Value, Exception> {
    match (number, ndigits) {
        (Value::Float(f), None) => Ok(Value::Int(float_to_int(f.round_ties_even())?)),
        (Value::Float(f), Some(n)) => {
            let scale = 10f64.powi(n.clamp(-308, 308) as i32);
            let scaled = f * scale;
            if !scaled.is_finite() {
                return Ok(Value::Float(*f));
            }
            Ok(Value::Float(scaled.round_ties_even() / scale))
        }
        (other, ndigits) => {
            let i = other.as_int().ok_or_else(|| {
                Exception::type_error(format!(
                    "type {} doesn't define __round__ method",
                    other.type_name()
                ))
            })?;
            match ndigits {
                Some(n) if n < 0 => {
                    let Some(scale) = u32::try_from(-n).ok().and_then(|e| 10i64.checked_pow(e))
                    else {
                        return Ok(Value::Int(0));
                    };
                    let rounded = (i as f64 / scale as f64).round_ties_even() as i64;
                    Ok(Value::Int(rounded.checked_mul(scale).ok_or_else(Exception::overflow)?))
                }
                _ => Ok(Value::Int(i)),
            }
        }
    }
}

/// `int(text, base)`: surrounding whitespace, a sign, underscores between
/// digits and a prefix matching the base are accepted.
fn parse_int(text: &str, base: i64) -> Result<i64, Exception> {
    let invalid =
        || Exception::value_error(format!("invalid literal for int() with base {base}: {text:?}"));
    if base != 0 && !(2..=36).contains(&base) {
        return Err(Exception::value_error("int() base must be >= 2 and <= 36, or 0"));
    }
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let lower = digits.to_ascii_lowercase();
    let (radix, body) = match (base, lower.get(..2)) {
        (0 | 16, Some("0x")) => (16, &lower[2..]),
        (0 | 8, Some("0o")) => (8, &lower[2..]),
        (0 | 2, Some("0b")) => (2, &lower[2..]),
        (0, _) => (10, lower.as_str()),
        (b, _) => (b as u32, lower.as_str()),
    };
    if body.is_empty() || body.starts_with('_') || body.ends_with('_') || body.contains("__") {
        return Err(invalid());
    }
    let cleaned: String = body.chars().filter(|c| *c != '_').collect();
    let signed = if negative {
        format!("-{cleaned}")
    } else {
        cleaned
    };
    i64::from_str_radix(&signed, radix).map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
            Exception::new(ExcKind::OverflowError, "int too large to represent")
        }
        _ => invalid(),
    })
}

fn parse_float(text: &str) -> Result<f64, Exception> {
    let trimmed = text.trim();
    let lower = trimmed.to_ascii_lowercase();
    let (sign, magnitude) = match lower.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, lower.strip_prefix('+').unwrap_or(&lower)),
    };
    match magnitude {
        "inf" | "infinity" => return Ok(sign * f64::INFINITY),
        "nan" => return Ok(f64::NAN),
        _ => {}
    }
    let valid = !magnitude.is_empty()
        && magnitude
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | '+' | '-'));
    if valid {
        if let Ok(f) = trimmed.parse::<f64>() {
            return Ok(f);
        }
    }
    Err(Exception::value_error(format!(
        "could not convert string to float: {text:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{eval, eval_err, run};
    use serde_json::json;

    #[test]
    fn lookup_by_name() {
        assert_eq!(Builtin::lookup("sorted"), Some(Builtin::Sorted));
        assert_eq!(Builtin::lookup("eval"), None);
        assert_eq!(Builtin::lookup("open"), None);
    }

    #[test]
    fn int_parsing() {
        assert_eq!(parse_int(" 42 ", 10).unwrap(), 42);
        assert_eq!(parse_int("-0x1f", 0).unwrap(), -31);
        assert_eq!(parse_int("ff", 16).unwrap(), 255);
        assert_eq!(parse_int("1_000", 10).unwrap(), 1000);
        assert!(parse_int("1__0", 10).is_err());
        assert!(parse_int("", 10).is_err());
        assert!(parse_int("12", 1).is_err());
        let err = parse_int("99999999999999999999", 10).unwrap_err();
        assert_eq!(err.kind, ExcKind::OverflowError);
    }

    #[test]
    fn float_parsing() {
        assert_eq!(parse_float("1.5").unwrap(), 1.5);
        assert_eq!(parse_float("-inf").unwrap(), f64::NEG_INFINITY);
        assert!(parse_float("nan").unwrap().is_nan());
        assert!(parse_float("1.5x").is_err());
        assert!(parse_float("").is_err());
    }

    #[test]
    fn rounding_is_half_even() {
        assert!(matches!(round(&Value::Float(2.5), None), Ok(Value::Int(2))));
        assert!(matches!(round(&Value::Float(3.5), None), Ok(Value::Int(4))));
        assert!(matches!(round(&Value::Int(1250), Some(-2)), Ok(Value::Int(1200))));
        assert!(round(&Value::Float(f64::NAN), None).is_err());
    }

    #[test]
    fn sorting_and_extremes() {
        assert_eq!(eval("sorted([3, 1, 2], reverse=True)"), json!([3, 2, 1]));
        assert_eq!(
            eval("sorted(['bb', 'a', 'ccc'], key=len)"),
            json!(["a", "bb", "ccc"])
        );
        assert_eq!(eval("min(4, 2, 8)"), json!(2));
        assert_eq!(eval("max(['a', 'abc'], key=len)"), json!("abc"));
        assert_eq!(eval_err("sorted([1, 'a'])").kind, ExcKind::TypeError);
        assert_eq!(eval_err("max([])").kind, ExcKind::ValueError);
    }

    #[test]
    fn conversions_and_aggregates() {
        assert_eq!(
            eval("[int('7'), int(3.9), float('2'), str(None), bool([])]"),
            json!([7, 3, 2.0, "None", false])
        );
        assert_eq!(eval("sum([1, 2, 3], 10)"), json!(16));
        assert_eq!(eval("list(enumerate(['a', 'b'], 1))"), json!([[1, "a"], [2, "b"]]));
        assert_eq!(eval("list(zip([1, 2, 3], 'ab'))"), json!([[1, "a"], [2, "b"]]));
        assert_eq!(eval("dict([('a', 1)], b=2)"), json!({"a": 1, "b": 2}));
        assert_eq!(eval("[any([0, 1]), all([])]"), json!([true, true]));
        assert_eq!(eval_err("sum(['a'], '')").kind, ExcKind::TypeError);
        assert_eq!(eval_err("range(1, 2, 0)").kind, ExcKind::ValueError);
    }

    #[test]
    fn huge_ranges_are_lazy_until_materialized() {
        assert_eq!(eval("len(range(10 ** 15))"), json!(1_000_000_000_000_000_i64));
        assert_eq!(eval("range(10 ** 15)[-1]"), json!(999_999_999_999_999_i64));
        assert_eq!(eval_err("list(range(10 ** 15))").kind, ExcKind::MemoryError);
        assert_eq!(eval("list(range(10 ** 18)[0:2])"), json!([0, 1]));
        assert_eq!(eval("range(10 ** 18)[2:10 ** 17] == range(2, 10 ** 17)"), json!(true));
        assert_eq!(eval("range(10 ** 18)[::-1][0]"), json!(999_999_999_999_999_999_i64));
        assert_eq!(eval("list(range(10)[::-3])"), json!([9, 6, 3, 0]));
    }

    #[test]
    fn shared_references_exhaust_walks() {
        for expr in [
            "str(a)",
            "repr(a)",
            "a == b",
            "a < b",
            "a in [b]",
            "[b].index(a)",
            "sorted([a, b])",
            "a",
        ] {
            let source = format!(
                "\
def main():
    a = [1]
    b = [1]
    for i in range(40):
        a = [a, a]
        b = [b, b]
    return {expr}
"
            );
            let err = run(&source).unwrap_err();
            assert_eq!(err.kind, ExcKind::MemoryError, "{expr}");
        }
    }
}
