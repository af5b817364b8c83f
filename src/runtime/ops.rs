//! Operator semantics. Integer arithmetic is checked; results that would
//! exceed the per-call size limits raise `MemoryError` before allocating.

use std::cmp::Ordering;

use super::exception::{ExcKind, Exception};
use super::value::{Budget, Key, Value, compare_values, equal_within, is_same, values_equal};
use super::{check_len, check_str_len};
use crate::lang::ast::{BinOp, CmpOp, UnaryOp};
use crate::limits::RuntimeLimits;

fn unsupported(op: &str, a: &Value, b: &Value) -> Exception {
    Exception::type_error(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        a.type_name(),
        b.type_name()
    ))
}

/// Both operands as integers, when neither is a float
fn ints(a: &Value, b: &Value) -> Option<(i64, i64)> {
    Some((a.as_int()?, b.as_int()?))
}

fn floats(a: &Value, b: &Value) -> Option<(f64, f64)> {
    Some((a.as_float()?, b.as_float()?))
}

fn repeat_count(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

/// Convert a float to an integer, truncating toward zero.
pub(crate) fn float_to_int(f: f64) -> Result<i64, Exception> {
    if f.is_nan() {
        return Err(Exception::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(Exception::new(
            ExcKind::OverflowError,
            "cannot convert float infinity to integer",
        ));
    }
    let t = f.trunc();
    if t >= 9_223_372_036_854_775_808.0 || t < -9_223_372_036_854_775_808.0 {
        return Err(Exception::overflow());
    }
    Ok(t as i64)
}

pub(crate) fn binary(
    op: BinOp,
    a: &Value,
    b: &Value,
    limits: &RuntimeLimits,
) -> Result<Value, Exception> {
    match op {
        BinOp::Add => add(a, b, limits),
        BinOp::Sub => {
            if let Some((x, y)) = ints(a, b) {
                return x.checked_sub(y).map(Value::Int).ok_or_else(Exception::overflow);
            }
            let (x, y) = floats(a, b).ok_or_else(|| unsupported("-", a, b))?;
            Ok(Value::Float(x - y))
        }
        BinOp::Mul => mul(a, b, limits),
        BinOp::Div => {
            let (x, y) = floats(a, b).ok_or_else(|| unsupported("/", a, b))?;
            if y == 0.0 {
                return Err(Exception::zero_division("division by zero"));
            }
            Ok(Value::Float(x / y))
        }
        BinOp::FloorDiv => {
            if let Some((x, y)) = ints(a, b) {
                if y == 0 {
                    return Err(Exception::zero_division(
                        "integer division or modulo by zero",
                    ));
                }
                let q = x.checked_div(y).ok_or_else(Exception::overflow)?;
                let adjust = x % y != 0 && ((x < 0) != (y < 0));
                return Ok(Value::Int(if adjust { q - 1 } else { q }));
            }
            let (x, y) = floats(a, b).ok_or_else(|| unsupported("//", a, b))?;
            if y == 0.0 {
                return Err(Exception::zero_division("float floor division by zero"));
            }
            Ok(Value::Float((x / y).floor()))
        }
        BinOp::Mod => {
            if let Some((x, y)) = ints(a, b) {
                if y == 0 {
                    return Err(Exception::zero_division(
                        "integer division or modulo by zero",
                    ));
                }
                if y == -1 {
                    return Ok(Value::Int(0));
                }
                let r = x % y;
                let r = if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r };
                return Ok(Value::Int(r));
            }
            let (x, y) = floats(a, b).ok_or_else(|| unsupported("%", a, b))?;
            if y == 0.0 {
                return Err(Exception::zero_division("float modulo"));
            }
            let r = x % y;
            let r = if r != 0.0 && ((r < 0.0) != (y < 0.0)) { r + y } else { r };
            Ok(Value::Float(r))
        }
        BinOp::Pow => pow(a, b),
    }
}

fn add(a: &Value, b: &Value, limits: &RuntimeLimits) -> Result<Value, Exception> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => {
            check_str_len(limits, x.len() + y.len())?;
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(x);
            s.push_str(y);
            Ok(Value::str(s))
        }
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            check_len(limits, x.len() + y.len())?;
            Ok(Value::list(x.iter().chain(y.iter()).cloned().collect()))
        }
        (Value::Tuple(x), Value::Tuple(y)) => {
            check_len(limits, x.len() + y.len())?;
            Ok(Value::tuple(x.iter().chain(y.iter()).cloned().collect()))
        }
        _ => {
            if let Some((x, y)) = ints(a, b) {
                return x.checked_add(y).map(Value::Int).ok_or_else(Exception::overflow);
            }
            let (x, y) = floats(a, b).ok_or_else(|| unsupported("+", a, b))?;
            Ok(Value::Float(x + y))
        }
    }
}

fn mul(a: &Value, b: &Value, limits: &RuntimeLimits) -> Result<Value, Exception> {
    let too_large = || Exception::memory("repeated sequence is too large");
    match (a, b) {
        (Value::Str(s), n) | (n, Value::Str(s)) if matches!(n, Value::Int(_) | Value::Bool(_)) => {
            let count = repeat_count(n.as_int().unwrap_or(0));
            let total = s.len().checked_mul(count).ok_or_else(too_large)?;
            check_str_len(limits, total)?;
            Ok(Value::str(s.repeat(count)))
        }
        (Value::List(items), n) | (n, Value::List(items))
            if matches!(n, Value::Int(_) | Value::Bool(_)) =>
        {
            let count = repeat_count(n.as_int().unwrap_or(0));
            let items = items.borrow();
            let total = items.len().checked_mul(count).ok_or_else(too_large)?;
            check_len(limits, total)?;
            Ok(Value::list(items.iter().cloned().cycle().take(total).collect()))
        }
        (Value::Tuple(items), n) | (n, Value::Tuple(items))
            if matches!(n, Value::Int(_) | Value::Bool(_)) =>
        {
            let count = repeat_count(n.as_int().unwrap_or(0));
            let total = items.len().checked_mul(count).ok_or_else(too_large)?;
            check_len(limits, total)?;
            Ok(Value::tuple(items.iter().cloned().cycle().take(total).collect()))
        }
        _ => {
            if let Some((x, y)) = ints(a, b) {
                return x.checked_mul(y).map(Value::Int).ok_or_else(Exception::overflow);
            }
            let (x, y) = floats(a, b).ok_or_else(|| unsupported("*", a, b))?;
            Ok(Value::Float(x * y))
        }
    }
}

fn pow(a: &Value, b: &Value) -> Result<Value, Exception> {
    if let Some((x, y)) = ints(a, b) {
        if y >= 0 {
            let exp = u32::try_from(y).map_err(|_| Exception::overflow())?;
            return x.checked_pow(exp).map(Value::Int).ok_or_else(Exception::overflow);
        }
    }
    let (x, y) = floats(a, b).ok_or_else(|| unsupported("**", a, b))?;
    if x == 0.0 && y < 0.0 {
        return Err(Exception::zero_division(
            "0.0 cannot be raised to a negative power",
        ));
    }
    let r = x.powf(y);
    if r.is_infinite() && x.is_finite() && y.is_finite() {
        return Err(Exception::new(ExcKind::OverflowError, "numerical result out of range"));
    }
    Ok(Value::Float(r))
}

pub(crate) fn unary(op: UnaryOp, v: &Value) -> Result<Value, Exception> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
        UnaryOp::Neg => match v {
            Value::Float(f) => Ok(Value::Float(-f)),
            other => match other.as_int() {
                Some(i) => i.checked_neg().map(Value::Int).ok_or_else(Exception::overflow),
                None => Err(bad_unary("-", v)),
            },
        },
        UnaryOp::Pos => match v {
            Value::Float(f) => Ok(Value::Float(*f)),
            other => other.as_int().map(Value::Int).ok_or_else(|| bad_unary("+", v)),
        },
    }
}

fn bad_unary(op: &str, v: &Value) -> Exception {
    Exception::type_error(format!("bad operand type for unary {op}: '{}'", v.type_name()))
}

/// Evaluate one link of a comparison chain.
pub(crate) fn compare(
    op: CmpOp,
    a: &Value,
    b: &Value,
    limits: &RuntimeLimits,
) -> Result<bool, Exception> {
    let ordered = |want: fn(Ordering) -> bool| -> Result<bool, Exception> {
        Ok(compare_values(a, b, limits)?.is_some_and(want))
    };
    match op {
        CmpOp::Eq => values_equal(a, b, limits),
        CmpOp::NotEq => values_equal(a, b, limits).map(|equal| !equal),
        CmpOp::Lt => ordered(Ordering::is_lt),
        CmpOp::LtEq => ordered(Ordering::is_le),
        CmpOp::Gt => ordered(Ordering::is_gt),
        CmpOp::GtEq => ordered(Ordering::is_ge),
        CmpOp::In => contains(b, a, limits),
        CmpOp::NotIn => contains(b, a, limits).map(|found| !found),
        CmpOp::Is => Ok(is_same(a, b)),
        CmpOp::IsNot => Ok(!is_same(a, b)),
    }
}

/// `item in container` for containers that need no call context.
pub(crate) fn contains(
    container: &Value,
    item: &Value,
    limits: &RuntimeLimits,
) -> Result<bool, Exception> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(&**needle)),
            other => Err(Exception::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => scan(&items.borrow(), item, limits),
        Value::Tuple(items) => scan(items, item, limits),
        Value::Dict(dict) => Ok(dict.borrow().contains(&Key::from_value(item)?)),
        Value::Range(r) => Ok(match item {
            Value::Float(f) if f.fract() == 0.0 => float_to_int(*f).is_ok_and(|i| r.contains(i)),
            other => other.as_int().is_some_and(|i| r.contains(i)),
        }),
        other => Err(Exception::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

/// Linear membership test with one walk budget for the whole scan
fn scan(items: &[Value], item: &Value, limits: &RuntimeLimits) -> Result<bool, Exception> {
    let mut budget = Budget::new(limits);
    for candidate in items {
        if equal_within(candidate, item, &mut budget)? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RuntimeLimits {
        RuntimeLimits::default()
    }

    fn bin(op: BinOp, a: Value, b: Value) -> Result<Value, Exception> {
        binary(op, &a, &b, &limits())
    }

    #[test]
    fn floor_division_and_modulo_round_toward_negative_infinity() {
        assert_eq!(bin(BinOp::FloorDiv, Value::Int(-7), Value::Int(2)).unwrap().repr(), "-4");
        assert_eq!(bin(BinOp::Mod, Value::Int(-7), Value::Int(2)).unwrap().repr(), "1");
        assert_eq!(bin(BinOp::Mod, Value::Int(7), Value::Int(-2)).unwrap().repr(), "-1");
        assert_eq!(
            bin(BinOp::FloorDiv, Value::Float(7.0), Value::Int(2)).unwrap().repr(),
            "3.0"
        );
    }

    #[test]
    fn division_by_zero_is_arithmetic() {
        for op in [BinOp::Div, BinOp::FloorDiv, BinOp::Mod] {
            let err = bin(op, Value::Int(1), Value::Int(0)).unwrap_err();
            assert_eq!(err.kind, ExcKind::ZeroDivisionError);
            assert!(err.kind.is_a(ExcKind::ArithmeticError));
        }
    }

    #[test]
    fn integer_overflow_raises() {
        let err = bin(BinOp::Add, Value::Int(i64::MAX), Value::Int(1)).unwrap_err();
        assert_eq!(err.kind, ExcKind::OverflowError);
        let err = bin(BinOp::Pow, Value::Int(10), Value::Int(40)).unwrap_err();
        assert_eq!(err.kind, ExcKind::OverflowError);
        assert!(unary(UnaryOp::Neg, &Value::Int(i64::MIN)).is_err());
    }

    #[test]
    fn repetition_respects_size_limits() {
        let err = bin(BinOp::Mul, Value::str("ab"), Value::Int(10_000_000)).unwrap_err();
        assert_eq!(err.kind, ExcKind::MemoryError);
        let err = bin(BinOp::Mul, Value::list(vec![Value::None]), Value::Int(i64::MAX)).unwrap_err();
        assert_eq!(err.kind, ExcKind::MemoryError);
        assert_eq!(bin(BinOp::Mul, Value::Int(3), Value::str("x")).unwrap().to_str(), "xxx");
        assert_eq!(bin(BinOp::Mul, Value::str("x"), Value::Int(-1)).unwrap().to_str(), "");
    }

    #[test]
    fn sequences_repeat_in_order() {
        let pair = || vec![Value::Int(1), Value::str("a")];
        let list = bin(BinOp::Mul, Value::list(pair()), Value::Int(3)).unwrap();
        assert_eq!(list.repr(), "[1, 'a', 1, 'a', 1, 'a']");
        let tuple = bin(BinOp::Mul, Value::Int(2), Value::tuple(pair())).unwrap();
        assert_eq!(tuple.repr(), "(1, 'a', 1, 'a')");
        assert_eq!(bin(BinOp::Mul, Value::list(pair()), Value::Int(0)).unwrap().repr(), "[]");
    }

    #[test]
    fn mixed_types_raise_type_error() {
        let err = bin(BinOp::Add, Value::Int(1), Value::str("a")).unwrap_err();
        assert_eq!(err.kind, ExcKind::TypeError);
        assert!(compare(CmpOp::Lt, &Value::Int(1), &Value::str("a"), &limits()).is_err());
        assert!(compare(CmpOp::Eq, &Value::Int(1), &Value::str("a"), &limits()).is_ok());
    }

    #[test]
    fn membership() {
        let limits = limits();
        assert!(contains(&Value::str("hello"), &Value::str("ell"), &limits).unwrap());
        assert!(contains(&Value::list(vec![Value::Int(1)]), &Value::Float(1.0), &limits).unwrap());
        assert!(compare(CmpOp::NotIn, &Value::Int(3), &Value::tuple(vec![]), &limits).unwrap());
        assert!(contains(&Value::Int(3), &Value::Int(3), &limits).is_err());
    }

    #[test]
    fn float_conversion_edges() {
        assert_eq!(float_to_int(-2.7).unwrap(), -2);
        assert_eq!(float_to_int(f64::NAN).unwrap_err().kind, ExcKind::ValueError);
        assert_eq!(float_to_int(f64::INFINITY).unwrap_err().kind, ExcKind::OverflowError);
        assert_eq!(float_to_int(1e19).unwrap_err().kind, ExcKind::OverflowError);
    }
}
