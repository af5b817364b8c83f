use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::{Map, Number, Value as JsonValue};

use super::builtins::Builtin;
use super::exception::{ExcKind, Exception};
use crate::lang::ast::FunctionDef;
use crate::limits::RuntimeLimits;
use crate::modules::{ModuleProxy, NativeModule};

/// Depth past which printing, comparing and converting give up. Lists can
/// contain themselves.
const MAX_DEPTH: usize = 48;

/// Nodes one walk may visit for each collection entry a call may build
const NODES_PER_ENTRY: usize = 16;

/// Work allowance for one walk over a value graph. Shared references let a
/// few nested lists unfold into billions of nodes, so depth alone does not
/// bound printing, comparing or converting.
pub struct Budget {
    max_bytes: usize,
    nodes: usize,
}

impl Budget {
    pub fn new(limits: &RuntimeLimits) -> Self {
        Self {
            max_bytes: limits.max_string_bytes,
            nodes: limits
                .max_collection_len
                .saturating_mul(NODES_PER_ENTRY)
                .max(NODES_PER_ENTRY),
        }
    }

    fn visit(&mut self) -> Result<(), Exception> {
        match self.nodes.checked_sub(1) {
            Some(left) => {
                self.nodes = left;
                Ok(())
            }
            None => Err(Exception::memory("value is too large to walk")),
        }
    }

    fn check_bytes(&self, len: usize) -> Result<(), Exception> {
        if len > self.max_bytes {
            return Err(Exception::memory(format!(
                "text of more than {} bytes exceeds the string limit",
                self.max_bytes
            )));
        }
        Ok(())
    }
}

impl Default for Budget {
    fn default() -> Self {
        Self::new(&RuntimeLimits::default())
    }
}

/// A script value. Lives only on the thread running its call.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<Dict>>),
    Range(Range),
    Function(Rc<Function>),
    Builtin(Builtin),
    Method(Rc<BoundMethod>),
    Module(Rc<ModuleProxy>),
    ModuleFn(Rc<ModuleFn>),
    ExceptionType(ExcKind),
    Exception(Rc<Exception>),
    Match(Rc<MatchData>),
    Secrets,
    Http,
}

pub struct Function {
    pub def: Arc<FunctionDef>,
    /// Evaluated defaults, aligned with `def.params`
    pub defaults: Vec<Option<Value>>,
}

pub struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

pub struct ModuleFn {
    pub module: Arc<dyn NativeModule>,
    pub name: String,
}

/// Captured result of a pattern search
pub struct MatchData {
    /// Group texts, index 0 being the whole match
    pub groups: Vec<Option<String>>,
    /// Character offsets of each group
    pub spans: Vec<Option<(usize, usize)>>,
    pub names: Vec<(String, usize)>,
}

impl MatchData {
    pub fn group_index(&self, key: &Value) -> Result<usize, Exception> {
        let index = match key {
            Value::Int(i) => usize::try_from(*i).ok(),
            Value::Str(name) => self
                .names
                .iter()
                .find(|(n, _)| n.as_str() == &**name)
                .map(|(_, i)| *i),
            _ => None,
        };
        index
            .filter(|i| *i < self.groups.len())
            .ok_or_else(|| Exception::index_error("no such group"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn len(&self) -> u64 {
        let (start, stop, step) = (self.start as i128, self.stop as i128, self.step as i128);
        let n = if step > 0 && start < stop {
            (stop - start - 1) / step + 1
        } else if step < 0 && start > stop {
            (start - stop - 1) / (-step) + 1
        } else {
            0
        };
        u64::try_from(n).unwrap_or(u64::MAX)
    }

    pub fn get(&self, index: u64) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let v = self.start as i128 + index as i128 * self.step as i128;
        i64::try_from(v).ok()
    }

    pub fn contains(&self, value: i64) -> bool {
        let in_bounds = if self.step > 0 {
            value >= self.start && value < self.stop
        } else {
            value <= self.start && value > self.stop
        };
        in_bounds && (value as i128 - self.start as i128) % self.step as i128 == 0
    }
}

// ============================================================================
// Dict
// ============================================================================

/// Hashable form of a value used as a dict key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    None,
    Bool(bool),
    Int(i64),
    Str(Rc<str>),
    Tuple(Rc<Vec<Key>>),
}

impl Key {
    pub fn from_value(value: &Value) -> Result<Key, Exception> {
        Self::from_value_at(value, 0, &mut Budget::default())
    }

    fn from_value_at(value: &Value, depth: usize, budget: &mut Budget) -> Result<Key, Exception> {
        budget.visit()?;
        if depth > MAX_DEPTH {
            return Err(Exception::type_error("key is nested too deeply"));
        }
        Ok(match value {
            Value::None => Key::None,
            Value::Bool(b) => Key::Bool(*b),
            Value::Int(i) => Key::Int(*i),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Key::Int(*f as i64),
            Value::Str(s) => Key::Str(s.clone()),
            Value::Tuple(items) => Key::Tuple(Rc::new(
                items
                    .iter()
                    .map(|item| Key::from_value_at(item, depth + 1, budget))
                    .collect::<Result<_, _>>()?,
            )),
            other => {
                return Err(Exception::type_error(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )));
            }
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::None => Value::None,
            Key::Bool(b) => Value::Bool(*b),
            Key::Int(i) => Value::Int(*i),
            Key::Str(s) => Value::Str(s.clone()),
            Key::Tuple(items) => Value::Tuple(Rc::new(items.iter().map(Key::to_value).collect())),
        }
    }
}

/// Insertion-ordered mapping
#[derive(Clone, Default)]
pub struct Dict {
    entries: Vec<(Key, Value)>,
    index: HashMap<Key, usize>,
}

impl Dict {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.index.get(key).map(|i| &self.entries[*i].1)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.index.contains_key(key)
    }

    pub fn insert(&mut self, key: Key, value: Value) {
        match self.index.get(&key) {
            Some(i) => self.entries[*i].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        let i = self.index.remove(key)?;
        let (_, value) = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Key, Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn into_values(self) -> impl Iterator<Item = Value> {
        self.entries.into_iter().map(|(_, v)| v)
    }
}

impl FromIterator<(Key, Value)> for Dict {
    fn from_iter<I: IntoIterator<Item = (Key, Value)>>(iter: I) -> Self {
        let mut dict = Dict::default();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

// ============================================================================
// Value behaviour
// ============================================================================

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(dict: Dict) -> Value {
        Value::Dict(Rc::new(RefCell::new(dict)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range(_) => "range",
            Value::Function(_) => "function",
            Value::Builtin(_) | Value::ModuleFn(_) => "builtin_function",
            Value::Method(_) => "method",
            Value::Module(_) => "module",
            Value::ExceptionType(_) => "exception_type",
            Value::Exception(e) => e.kind.name(),
            Value::Match(_) => "match",
            Value::Secrets => "secrets",
            Value::Http => "http_client",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::Range(r) => r.len() > 0,
            _ => true,
        }
    }

    /// Integer view of ints and bools
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Float view of any number
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Bool(_))
    }

    /// `str(value)` for messages and diagnostics. Oversized values are cut
    /// short with `...`.
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(e) => e.message.clone(),
            other => other.repr(),
        }
    }

    /// `repr(value)` for messages and diagnostics. Oversized values are cut
    /// short with `...`.
    pub fn repr(&self) -> String {
        let mut out = String::new();
        if self.write_repr(&mut out, 0, &mut Budget::default()).is_err() {
            out.push_str("...");
        }
        out
    }

    /// `str(value)` as a script sees it: `MemoryError` when the text would
    /// outgrow the call's limits.
    pub fn try_to_str(&self, limits: &RuntimeLimits) -> Result<String, Exception> {
        match self {
            Value::Str(s) => Ok(s.to_string()),
            Value::Exception(e) => Ok(e.message.clone()),
            other => other.try_repr(limits),
        }
    }

    /// `repr(value)` as a script sees it
    pub fn try_repr(&self, limits: &RuntimeLimits) -> Result<String, Exception> {
        let mut out = String::new();
        self.write_repr(&mut out, 0, &mut Budget::new(limits))?;
        Ok(out)
    }

    fn write_repr(
        &self,
        out: &mut String,
        depth: usize,
        budget: &mut Budget,
    ) -> Result<(), Exception> {
        budget.visit()?;
        if depth > MAX_DEPTH {
            out.push_str("...");
            return Ok(());
        }
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Value::Float(f) => out.push_str(&format_float(*f)),
            Value::Str(s) => quote_str(out, s),
            Value::List(items) => {
                out.push('[');
                write_items(out, &items.borrow(), depth, budget)?;
                out.push(']');
            }
            Value::Tuple(items) => {
                out.push('(');
                write_items(out, items, depth, budget)?;
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::Dict(dict) => {
                out.push('{');
                for (i, (k, v)) in dict.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    k.to_value().write_repr(out, depth + 1, budget)?;
                    out.push_str(": ");
                    v.write_repr(out, depth + 1, budget)?;
                }
                out.push('}');
            }
            Value::Range(r) => {
                if r.step == 1 {
                    let _ = write!(out, "range({}, {})", r.start, r.stop);
                } else {
                    let _ = write!(out, "range({}, {}, {})", r.start, r.stop, r.step);
                }
            }
            Value::Function(f) => {
                let _ = write!(out, "<function {}>", f.def.name);
            }
            Value::Builtin(b) => {
                let _ = write!(out, "<built-in function {}>", b.name());
            }
            Value::Method(m) => {
                let _ = write!(out, "<method {} of {}>", m.name, m.receiver.type_name());
            }
            Value::Module(m) => {
                let _ = write!(out, "<module '{}'>", m.name());
            }
            Value::ModuleFn(f) => {
                let _ = write!(out, "<built-in function {}.{}>", f.module.name(), f.name);
            }
            Value::ExceptionType(k) => {
                let _ = write!(out, "<exception {}>", k.name());
            }
            Value::Exception(e) => {
                out.push_str(e.kind.name());
                out.push('(');
                if !e.message.is_empty() {
                    quote_str(out, &e.message);
                }
                out.push(')');
            }
            Value::Match(m) => {
                let span = m.spans.first().copied().flatten().unwrap_or((0, 0));
                let text = m.groups.first().cloned().flatten().unwrap_or_default();
                let _ = write!(out, "<match span=({}, {}), match=", span.0, span.1);
                quote_str(out, &text);
                out.push('>');
            }
            Value::Secrets => out.push_str("<secrets>"),
            Value::Http => out.push_str("<http client>"),
        }
        budget.check_bytes(out.len())
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr())
    }
}

fn write_items(
    out: &mut String,
    items: &[Value],
    depth: usize,
    budget: &mut Budget,
) -> Result<(), Exception> {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        item.write_repr(out, depth + 1, budget)?;
    }
    Ok(())
}

fn quote_str(out: &mut String, s: &str) {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
}

pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

// ============================================================================
// Comparison
// ============================================================================

/// `==` between two values
pub fn values_equal(a: &Value, b: &Value, limits: &RuntimeLimits) -> Result<bool, Exception> {
    equal_at(a, b, 0, &mut Budget::new(limits))
}

/// `==` drawing on a budget shared across several comparisons, such as a
/// membership scan.
pub fn equal_within(a: &Value, b: &Value, budget: &mut Budget) -> Result<bool, Exception> {
    equal_at(a, b, 0, budget)
}

fn equal_at(a: &Value, b: &Value, depth: usize, budget: &mut Budget) -> Result<bool, Exception> {
    budget.visit()?;
    if depth > MAX_DEPTH {
        return Ok(false);
    }
    Ok(match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Float(_), _) | (_, Value::Float(_)) if a.is_number() && b.is_number() => {
            a.as_float() == b.as_float()
        }
        (x, y) if x.is_number() && y.is_number() => x.as_int() == y.as_int(),
        (Value::List(x), Value::List(y)) => {
            Rc::ptr_eq(x, y) || seq_equal(&x.borrow(), &y.borrow(), depth, budget)?
        }
        (Value::Tuple(x), Value::Tuple(y)) => Rc::ptr_eq(x, y) || seq_equal(x, y, depth, budget)?,
        (Value::Dict(x), Value::Dict(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (x, y) = (x.borrow(), y.borrow());
            if x.len() != y.len() {
                return Ok(false);
            }
            for (k, v) in x.iter() {
                let Some(other) = y.get(k) else { return Ok(false) };
                if !equal_at(v, other, depth + 1, budget)? {
                    return Ok(false);
                }
            }
            true
        }
        (Value::Range(x), Value::Range(y)) => x == y,
        (Value::ExceptionType(x), Value::ExceptionType(y)) => x == y,
        _ => is_same(a, b),
    })
}

fn seq_equal(
    x: &[Value],
    y: &[Value],
    depth: usize,
    budget: &mut Budget,
) -> Result<bool, Exception> {
    if x.len() != y.len() {
        return Ok(false);
    }
    for (a, b) in x.iter().zip(y) {
        if !equal_at(a, b, depth + 1, budget)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// `is` identity
pub fn is_same(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => Rc::ptr_eq(x, y),
        (Value::List(x), Value::List(y)) => Rc::ptr_eq(x, y),
        (Value::Tuple(x), Value::Tuple(y)) => Rc::ptr_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => Rc::ptr_eq(x, y),
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
        (Value::Module(x), Value::Module(y)) => Rc::ptr_eq(x, y),
        (Value::Exception(x), Value::Exception(y)) => Rc::ptr_eq(x, y),
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        (Value::ExceptionType(x), Value::ExceptionType(y)) => x == y,
        (Value::Secrets, Value::Secrets) | (Value::Http, Value::Http) => true,
        _ => false,
    }
}

/// Ordering for `<` and friends. `Ok(None)` means unordered (NaN).
pub fn compare_values(
    a: &Value,
    b: &Value,
    limits: &RuntimeLimits,
) -> Result<Option<Ordering>, Exception> {
    compare_at(a, b, 0, &mut Budget::new(limits))
}

fn compare_at(
    a: &Value,
    b: &Value,
    depth: usize,
    budget: &mut Budget,
) -> Result<Option<Ordering>, Exception> {
    budget.visit()?;
    if depth > MAX_DEPTH {
        return Err(Exception::new(
            ExcKind::RecursionError,
            "maximum comparison depth exceeded",
        ));
    }
    match (a, b) {
        (x, y) if x.is_number() && y.is_number() => match (x.as_int(), y.as_int()) {
            (Some(i), Some(j)) => Ok(Some(i.cmp(&j))),
            _ => Ok(x.as_float().partial_cmp(&y.as_float())),
        },
        (Value::Str(x), Value::Str(y)) => Ok(Some(x.cmp(y))),
        (Value::List(x), Value::List(y)) => compare_seq(&x.borrow(), &y.borrow(), depth, budget),
        (Value::Tuple(x), Value::Tuple(y)) => compare_seq(x, y, depth, budget),
        _ => Err(Exception::type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn compare_seq(
    x: &[Value],
    y: &[Value],
    depth: usize,
    budget: &mut Budget,
) -> Result<Option<Ordering>, Exception> {
    for (a, b) in x.iter().zip(y) {
        if equal_at(a, b, depth + 1, budget)? {
            continue;
        }
        return compare_at(a, b, depth + 1, budget);
    }
    Ok(Some(x.len().cmp(&y.len())))
}

/// Total order used for sorting. Callers check comparability first, so
/// mismatched types only reach here nested inside sequences. One budget
/// covers every comparison of a sort.
pub fn sort_order(a: &Value, b: &Value, budget: &mut Budget) -> Result<Ordering, Exception> {
    sort_at(a, b, 0, budget)
}

fn sort_at(a: &Value, b: &Value, depth: usize, budget: &mut Budget) -> Result<Ordering, Exception> {
    budget.visit()?;
    if depth > MAX_DEPTH {
        return Ok(Ordering::Equal);
    }
    Ok(match (a, b) {
        (x, y) if x.is_number() && y.is_number() => match (x.as_int(), y.as_int()) {
            (Some(i), Some(j)) => i.cmp(&j),
            _ => {
                let (fx, fy) = (x.as_float().unwrap_or(0.0), y.as_float().unwrap_or(0.0));
                fx.total_cmp(&fy)
            }
        },
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        (Value::List(x), Value::List(y)) => sort_seq(&x.borrow(), &y.borrow(), depth, budget)?,
        (Value::Tuple(x), Value::Tuple(y)) => sort_seq(x, y, depth, budget)?,
        _ => rank(a).cmp(&rank(b)),
    })
}

fn sort_seq(
    x: &[Value],
    y: &[Value],
    depth: usize,
    budget: &mut Budget,
) -> Result<Ordering, Exception> {
    for (a, b) in x.iter().zip(y) {
        let order = sort_at(a, b, depth + 1, budget)?;
        if order != Ordering::Equal {
            return Ok(order);
        }
    }
    Ok(x.len().cmp(&y.len()))
}

fn rank(v: &Value) -> u8 {
    match v {
        Value::None => 0,
        Value::Bool(_) | Value::Int(_) | Value::Float(_) => 1,
        Value::Str(_) => 2,
        Value::List(_) => 3,
        Value::Tuple(_) => 4,
        _ => 5,
    }
}

/// Whether two values can be ordered against each other by `sorted`.
pub fn sortable_together(a: &Value, b: &Value) -> bool {
    (a.is_number() && b.is_number())
        || matches!(
            (a, b),
            (Value::Str(_), Value::Str(_))
                | (Value::List(_), Value::List(_))
                | (Value::Tuple(_), Value::Tuple(_))
        )
}

/// Drop a value without recursing through nested containers. A list that
/// contains itself a million levels deep would otherwise overflow the stack
/// when its last reference goes away.
pub fn release(value: Value) {
    let mut pending = vec![value];
    while let Some(value) = pending.pop() {
        match value {
            Value::List(items) => {
                if let Ok(cell) = Rc::try_unwrap(items) {
                    pending.extend(cell.into_inner());
                }
            }
            Value::Tuple(items) => {
                if let Ok(items) = Rc::try_unwrap(items) {
                    pending.extend(items);
                }
            }
            Value::Dict(dict) => {
                if let Ok(cell) = Rc::try_unwrap(dict) {
                    pending.extend(cell.into_inner().into_values());
                }
            }
            Value::Method(method) => {
                if let Ok(method) = Rc::try_unwrap(method) {
                    pending.push(method.receiver);
                }
            }
            _ => {}
        }
    }
}

// ============================================================================
// JSON
// ============================================================================

pub fn to_json(value: &Value, limits: &RuntimeLimits) -> Result<JsonValue, Exception> {
    to_json_at(value, 0, &mut Budget::new(limits))
}

fn to_json_at(value: &Value, depth: usize, budget: &mut Budget) -> Result<JsonValue, Exception> {
    budget.visit()?;
    if depth > MAX_DEPTH {
        return Err(Exception::value_error("value is nested too deeply to serialize"));
    }
    Ok(match value {
        Value::None => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(i) => JsonValue::Number((*i).into()),
        Value::Float(f) => Number::from_f64(*f).map(JsonValue::Number).ok_or_else(|| {
            Exception::value_error("out of range float values are not JSON compliant")
        })?,
        Value::Str(s) => JsonValue::String(s.to_string()),
        Value::List(items) => JsonValue::Array(
            items
                .borrow()
                .iter()
                .map(|v| to_json_at(v, depth + 1, budget))
                .collect::<Result<_, _>>()?,
        ),
        Value::Tuple(items) => JsonValue::Array(
            items
                .iter()
                .map(|v| to_json_at(v, depth + 1, budget))
                .collect::<Result<_, _>>()?,
        ),
        Value::Dict(dict) => {
            let mut map = Map::new();
            for (k, v) in dict.borrow().iter() {
                let key = match k {
                    Key::Str(s) => s.to_string(),
                    Key::Int(i) => i.to_string(),
                    Key::Bool(true) => "true".to_string(),
                    Key::Bool(false) => "false".to_string(),
                    Key::None => "null".to_string(),
                    Key::Tuple(_) => {
                        return Err(Exception::type_error(
                            "keys must be str, int, bool or None, not tuple",
                        ));
                    }
                };
                map.insert(key, to_json_at(v, depth + 1, budget)?);
            }
            JsonValue::Object(map)
        }
        other => {
            return Err(Exception::type_error(format!(
                "Object of type {} is not JSON serializable",
                other.type_name()
            )));
        }
    })
}

pub fn from_json(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::None,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => Value::str(s.as_str()),
        JsonValue::Array(items) => Value::list(items.iter().map(from_json).collect()),
        JsonValue::Object(map) => Value::dict(
            map.iter()
                .map(|(k, v)| (Key::Str(Rc::from(k.as_str())), from_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn repr_matches_script_conventions() {
        let v = Value::list(vec![
            Value::Int(1),
            Value::Float(2.0),
            Value::str("a'b"),
            Value::None,
            Value::tuple(vec![Value::Bool(true)]),
        ]);
        assert_eq!(v.repr(), "[1, 2.0, \"a'b\", None, (True,)]");
        assert_eq!(Value::str("x").to_str(), "x");
        assert_eq!(Value::Float(0.5).repr(), "0.5");
    }

    #[test]
    fn self_containing_list_does_not_recurse_forever() {
        let list = Value::list(vec![]);
        if let Value::List(inner) = &list {
            inner.borrow_mut().push(list.clone());
        }
        let limits = RuntimeLimits::default();
        assert!(list.repr().contains("..."));
        assert!(to_json(&list, &limits).is_err());
        assert!(values_equal(&list, &list, &limits).unwrap());

        let other = Value::list(vec![]);
        if let Value::List(inner) = &other {
            inner.borrow_mut().push(other.clone());
        }
        assert!(!values_equal(&list, &other, &limits).unwrap());
    }

    fn doubled(levels: usize, wrap: fn(Vec<Value>) -> Value) -> Value {
        let mut v = wrap(vec![Value::Int(1)]);
        for _ in 0..levels {
            v = wrap(vec![v.clone(), v]);
        }
        v
    }

    #[test]
    fn shared_references_exhaust_the_walk_budget() {
        let limits = RuntimeLimits::default();
        let a = doubled(40, Value::list);
        let b = doubled(40, Value::list);

        assert_eq!(a.try_repr(&limits).unwrap_err().kind, ExcKind::MemoryError);
        assert_eq!(a.try_to_str(&limits).unwrap_err().kind, ExcKind::MemoryError);
        assert_eq!(to_json(&a, &limits).unwrap_err().kind, ExcKind::MemoryError);
        assert_eq!(values_equal(&a, &b, &limits).unwrap_err().kind, ExcKind::MemoryError);
        assert_eq!(compare_values(&a, &b, &limits).unwrap_err().kind, ExcKind::MemoryError);
        let err = sort_order(&a, &b, &mut Budget::new(&limits)).unwrap_err();
        assert_eq!(err.kind, ExcKind::MemoryError);

        // Diagnostics stay usable and identity still short-circuits
        assert!(a.repr().ends_with("..."));
        assert!(values_equal(&a, &a, &limits).unwrap());

        let key = doubled(40, Value::tuple);
        assert_eq!(Key::from_value(&key).unwrap_err().kind, ExcKind::MemoryError);
    }

    #[test]
    fn repr_is_bounded_by_the_string_limit() {
        let limits = RuntimeLimits {
            max_string_bytes: 64,
            ..RuntimeLimits::default()
        };
        let small = Value::list((0..10).map(Value::Int).collect());
        assert_eq!(small.try_repr(&limits).unwrap(), small.repr());
        let large = Value::list((0..100).map(Value::Int).collect());
        assert_eq!(large.try_repr(&limits).unwrap_err().kind, ExcKind::MemoryError);
    }

    #[test]
    fn numeric_equality_crosses_types() {
        let limits = RuntimeLimits::default();
        assert!(values_equal(&Value::Int(1), &Value::Float(1.0), &limits).unwrap());
        assert!(values_equal(&Value::Bool(true), &Value::Int(1), &limits).unwrap());
        assert!(!values_equal(&Value::str("1"), &Value::Int(1), &limits).unwrap());
    }

    #[test]
    fn ordering() {
        let limits = RuntimeLimits::default();
        assert_eq!(
            compare_values(&Value::Int(1), &Value::Float(1.5), &limits).unwrap(),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_values(&Value::Float(f64::NAN), &Value::Int(1), &limits).unwrap(),
            None
        );
        assert!(compare_values(&Value::Int(1), &Value::str("a"), &limits).is_err());
        let a = Value::tuple(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::tuple(vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(compare_values(&a, &b, &limits).unwrap(), Some(Ordering::Less));
    }

    #[test]
    fn dict_preserves_order_and_removal() {
        let mut d = Dict::default();
        d.insert(Key::Str("b".into()), Value::Int(1));
        d.insert(Key::Str("a".into()), Value::Int(2));
        d.insert(Key::Str("c".into()), Value::Int(3));
        d.remove(&Key::Str("a".into()));
        let keys: Vec<_> = d.keys().cloned().collect();
        assert_eq!(keys, vec![Key::Str("b".into()), Key::Str("c".into())]);
        assert!(matches!(d.get(&Key::Str("c".into())), Some(Value::Int(3))));
    }

    #[test]
    fn json_conversion() {
        let v = from_json(&json!({"a": [1, 2.5, null, "x"], "b": true}));
        let limits = RuntimeLimits::default();
        assert_eq!(to_json(&v, &limits).unwrap(), json!({"a": [1, 2.5, null, "x"], "b": true}));
        assert!(to_json(&Value::Float(f64::INFINITY), &limits).is_err());
        assert!(to_json(&Value::Range(Range { start: 0, stop: 1, step: 1 }), &limits).is_err());
    }

    #[test]
    fn deep_nesting_is_released_iteratively() {
        let mut v = Value::None;
        for _ in 0..1_000_000 {
            v = Value::list(vec![v]);
        }
        assert!(v.repr().contains("..."));
        assert!(Key::from_value(&Value::tuple(vec![v.clone()])).is_err());
        release(v);
    }

    #[test]
    fn range_math() {
        let r = Range { start: 10, stop: 0, step: -3 };
        assert_eq!(r.len(), 4);
        assert_eq!(r.get(3), Some(1));
        assert!(r.contains(4));
        assert!(!r.contains(5));
        let full = Range { start: i64::MIN, stop: i64::MAX, step: 1 };
        assert_eq!(full.len(), u64::MAX);
    }
}
