//! Tree-walking evaluator for one call.
//!
//! Runs on the call's own thread. Every statement, loop iteration and call
//! ticks a counter; every few hundred ticks the deadline and the
//! cancellation flag are checked. Timeouts and cancellation unwind as
//! [`Halt`], which `try` cannot catch and `finally` does not run for.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use super::args::{bind, expect_str, given, take};
use super::builtins::{self, Builtin};
use super::exception::{ExcKind, Exception};
use super::methods;
use super::ops;
use super::value::{
    BoundMethod, Dict, Function, Key, Range, Value, from_json, release, to_json,
};
use super::{Scope, check_len, check_str_len};
use crate::lang::ast::{
    BinOp, BoolOp, CmpOp, Constant, ExceptHandler, Expr, ExprKind, Program, Stmt, StmtKind,
};
use crate::limits::RuntimeLimits;
use crate::modules::{AllowedModuleTable, ModuleContext, ModuleProxy, PatternCache};
use crate::net::{FetchRequest, FetchResponse, HttpMethod, NetError, OutboundClient, RequestBody};
use crate::output::OutputBuffer;
use crate::secrets::SecretView;

const CHECK_INTERVAL: u64 = 256;

/// Non-local exits out of statement execution
pub(crate) enum Unwind {
    Raise(Exception),
    Halt(Halt),
    Return(Value),
    Break,
    Continue,
}

/// Uncatchable stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Halt {
    Timeout,
    Cancelled,
    ResourceExhausted(String),
    Internal(String),
}

pub(crate) type Flow<T> = Result<T, Unwind>;

impl From<Exception> for Unwind {
    fn from(exc: Exception) -> Self {
        Unwind::Raise(exc)
    }
}

/// What a call produced, handed back across the thread boundary
#[derive(Debug)]
pub(crate) enum Outcome {
    Returned(JsonValue),
    Raised(Exception),
    Halted(Halt),
}

/// Run a prepared scope to completion on the current thread.
pub(crate) fn execute(
    scope: Scope,
    output: Arc<Mutex<OutputBuffer>>,
    deadline: Instant,
    cancel: Arc<AtomicBool>,
) -> Outcome {
    let io = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(io) => io,
        Err(e) => return Outcome::Halted(Halt::Internal(format!("call runtime: {e}"))),
    };
    let Scope {
        program,
        modules,
        granted,
        arguments,
        secrets,
        client,
        limits,
    } = scope;

    let mut interp = Interpreter {
        globals: HashMap::new(),
        frames: Vec::new(),
        modules,
        granted,
        imported: HashMap::new(),
        secrets,
        client,
        io,
        output,
        limits,
        deadline,
        cancel,
        ticks: 0,
        depth: 0,
        patterns: PatternCache::default(),
        handling: Vec::new(),
    };

    match interp.run_entry(&program, &arguments) {
        Ok(value) => {
            let json = to_json(&value, &interp.limits);
            release(value);
            match json {
                Ok(json) => Outcome::Returned(json),
                Err(exc) if exc.kind == ExcKind::MemoryError => Outcome::Raised(exc),
                Err(exc) => Outcome::Raised(Exception::type_error(format!(
                    "entry function result is not JSON serializable: {}",
                    exc.message
                ))),
            }
        }
        Err(Unwind::Raise(exc)) => Outcome::Raised(exc),
        Err(Unwind::Halt(halt)) => Outcome::Halted(halt),
        Err(Unwind::Return(_) | Unwind::Break | Unwind::Continue) => Outcome::Halted(
            Halt::Internal("control flow escaped the entry function".to_string()),
        ),
    }
}

pub(crate) struct Interpreter {
    globals: HashMap<String, Value>,
    frames: Vec<HashMap<String, Value>>,
    modules: Arc<AllowedModuleTable>,
    granted: BTreeSet<String>,
    imported: HashMap<String, Rc<ModuleProxy>>,
    secrets: SecretView,
    client: OutboundClient,
    io: tokio::runtime::Runtime,
    output: Arc<Mutex<OutputBuffer>>,
    limits: RuntimeLimits,
    deadline: Instant,
    cancel: Arc<AtomicBool>,
    ticks: u64,
    depth: usize,
    patterns: PatternCache,
    /// Exceptions being handled, innermost last, for bare `raise`
    handling: Vec<Exception>,
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        for (_, value) in self.globals.drain() {
            release(value);
        }
        for frame in self.frames.drain(..) {
            frame.into_values().for_each(release);
        }
    }
}

impl Interpreter {
    pub(crate) fn limits(&self) -> &RuntimeLimits {
        &self.limits
    }

    pub(crate) fn secrets(&self) -> &SecretView {
        &self.secrets
    }

    /// Run the top level, then the entry function with the arguments as
    /// keyword arguments.
    fn run_entry(&mut self, program: &Program, arguments: &Map<String, JsonValue>) -> Flow<Value> {
        self.exec_block(&program.body)?;
        let entry = self.globals.get(&self.limits.entry_point).cloned().ok_or_else(|| {
            Exception::new(
                ExcKind::NameError,
                format!("entry function '{}' is not defined", self.limits.entry_point),
            )
        })?;
        let kwargs = arguments
            .iter()
            .map(|(name, value)| (name.clone(), from_json(value)))
            .collect();
        self.call_value(&entry, Vec::new(), kwargs)
    }

    // ========================================================================
    // Budget
    // ========================================================================

    fn tick(&mut self) -> Flow<()> {
        self.ticks += 1;
        if self.ticks % CHECK_INTERVAL == 0 {
            self.check_deadline()?;
        }
        Ok(())
    }

    fn check_deadline(&self) -> Flow<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(Unwind::Halt(Halt::Cancelled));
        }
        if Instant::now() >= self.deadline {
            return Err(Unwind::Halt(Halt::Timeout));
        }
        Ok(())
    }

    // ========================================================================
    // Names
    // ========================================================================

    fn store(&mut self, name: &str, value: Value) {
        let scope = match self.frames.last_mut() {
            Some(frame) => frame,
            None => &mut self.globals,
        };
        if let Some(old) = scope.insert(name.to_string(), value) {
            release(old);
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, Exception> {
        if let Some(value) = self.frames.last().and_then(|frame| frame.get(name)) {
            return Ok(value.clone());
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        match name {
            "http" => return Ok(Value::Http),
            "secrets" => return Ok(Value::Secrets),
            _ => {}
        }
        if let Some(builtin) = Builtin::lookup(name) {
            return Ok(Value::Builtin(builtin));
        }
        if let Some(kind) = ExcKind::lookup(name) {
            return Ok(Value::ExceptionType(kind));
        }
        Err(Exception::new(
            ExcKind::NameError,
            format!("name '{name}' is not defined"),
        ))
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn exec_block(&mut self, body: &[Stmt]) -> Flow<()> {
        for stmt in body {
            self.exec_stmt(stmt)?;
        }
        Ok(())
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Flow<()> {
        self.tick()?;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                let value = self.eval(expr)?;
                release(value);
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value)?,
            StmtKind::If { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.exec_block(body)?;
                } else {
                    self.exec_block(orelse)?;
                }
            }
            StmtKind::While { test, body } => {
                while self.eval(test)?.truthy() {
                    self.tick()?;
                    match self.exec_block(body) {
                        Ok(()) | Err(Unwind::Continue) => {}
                        Err(Unwind::Break) => break,
                        Err(other) => return Err(other),
                    }
                }
            }
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter)?;
                self.for_each(&iterable, |interp, item| {
                    interp.assign(target, item)?;
                    match interp.exec_block(body) {
                        Ok(()) | Err(Unwind::Continue) => Ok(true),
                        Err(Unwind::Break) => Ok(false),
                        Err(other) => Err(other),
                    }
                })?;
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => self.exec_try(body, handlers, orelse, finalbody)?,
            StmtKind::FunctionDef(def) => {
                let mut defaults = Vec::with_capacity(def.params.len());
                for param in &def.params {
                    defaults.push(match &param.default {
                        Some(expr) => Some(self.eval(expr)?),
                        None => None,
                    });
                }
                let function = Function {
                    def: def.clone(),
                    defaults,
                };
                self.store(&def.name, Value::Function(Rc::new(function)));
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Err(Unwind::Return(value));
            }
            StmtKind::Raise(None) => {
                let current = self.handling.last().cloned().ok_or_else(|| {
                    Exception::new(ExcKind::RuntimeError, "no active exception to re-raise")
                })?;
                return Err(current.into());
            }
            StmtKind::Raise(Some(expr)) => {
                let value = self.eval(expr)?;
                return Err(as_exception(&value)?.into());
            }
            StmtKind::Assert { test, msg } => {
                if !self.eval(test)?.truthy() {
                    let message = match msg {
                        Some(expr) => self.eval(expr)?.try_to_str(&self.limits)?,
                        None => String::new(),
                    };
                    return Err(Exception::new(ExcKind::AssertionError, message).into());
                }
            }
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    let proxy = self.import(&alias.name)?;
                    self.store(alias.bound_name(), Value::Module(proxy));
                }
            }
            StmtKind::ImportFrom { module, names } => {
                let proxy = self.import(module)?;
                for alias in names {
                    if alias.name == "*" {
                        return Err(Exception::new(
                            ExcKind::ImportError,
                            "star imports are not supported",
                        )
                        .into());
                    }
                    let value = proxy.attr(&alias.name).map_err(|_| {
                        Exception::new(
                            ExcKind::ImportError,
                            format!("cannot import name '{}' from '{module}'", alias.name),
                        )
                    })?;
                    self.store(alias.bound_name(), value);
                }
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Err(Unwind::Break),
            StmtKind::Continue => return Err(Unwind::Continue),
        }
        Ok(())
    }

    /// Modules outside the call's granted set and modules that do not exist
    /// fail the same way.
    fn import(&mut self, name: &str) -> Result<Rc<ModuleProxy>, Exception> {
        if let Some(proxy) = self.imported.get(name) {
            return Ok(proxy.clone());
        }
        let proxy = self
            .granted
            .contains(name)
            .then(|| self.modules.proxy(name))
            .flatten()
            .ok_or_else(|| {
                Exception::new(ExcKind::ImportError, format!("no module named '{name}'"))
            })?;
        let proxy = Rc::new(proxy);
        self.imported.insert(name.to_string(), proxy.clone());
        Ok(proxy)
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
    ) -> Flow<()> {
        let outcome = match self.exec_block(body) {
            Ok(()) => self.exec_block(orelse),
            Err(Unwind::Raise(exc)) => self.handle(exc, handlers),
            Err(other) => Err(other),
        };
        if let Err(Unwind::Halt(_)) = outcome {
            return outcome;
        }
        self.exec_block(finalbody)?;
        outcome
    }

    fn handle(&mut self, exc: Exception, handlers: &[ExceptHandler]) -> Flow<()> {
        for handler in handlers {
            let matched = match &handler.kind {
                None => true,
                Some(kind) => {
                    let kind = self.eval(kind)?;
                    exception_matches(&exc, &kind)?
                }
            };
            if !matched {
                continue;
            }
            if let Some(name) = &handler.name {
                self.store(name, Value::Exception(Rc::new(exc.clone())));
            }
            self.handling.push(exc);
            let result = self.exec_block(&handler.body);
            self.handling.pop();
            return result;
        }
        Err(Unwind::Raise(exc))
    }

    /// Iterate `iterable`, calling `f` per item until it returns false.
    /// Ranges are walked lazily; everything else is snapshotted first, so
    /// mutating a list while looping over it does not affect the loop.
    fn for_each<F>(&mut self, iterable: &Value, mut f: F) -> Flow<()>
    where
        F: FnMut(&mut Self, Value) -> Flow<bool>,
    {
        if let Value::Range(range) = iterable {
            let len = range.len();
            let mut index = 0;
            while index < len {
                self.tick()?;
                let Some(item) = range.get(index) else { break };
                if !f(self, Value::Int(item))? {
                    break;
                }
                index += 1;
            }
            return Ok(());
        }
        for item in self.iterate(iterable)? {
            self.tick()?;
            if !f(self, item)? {
                break;
            }
        }
        Ok(())
    }

    /// Materialize the items of an iterable value.
    pub(crate) fn iterate(&self, value: &Value) -> Result<Vec<Value>, Exception> {
        Ok(match value {
            Value::List(items) => items.borrow().clone(),
            Value::Tuple(items) => items.as_ref().clone(),
            Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
            Value::Dict(dict) => dict.borrow().keys().map(Key::to_value).collect(),
            Value::Range(range) => {
                let len = usize::try_from(range.len()).unwrap_or(usize::MAX);
                check_len(&self.limits, len)?;
                (0..range.len()).filter_map(|i| range.get(i)).map(Value::Int).collect()
            }
            Value::Secrets => self.secrets.keys().map(Value::str).collect(),
            other => {
                return Err(Exception::type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )));
            }
        })
    }

    fn assign(&mut self, target: &Expr, value: Value) -> Flow<()> {
        match &target.kind {
            ExprKind::Name(name) => self.store(name, value),
            ExprKind::Subscript { value: object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                self.set_item(&object, index, value)?;
            }
            ExprKind::Attribute { value: object, attr } => {
                let object = self.eval(object)?;
                return Err(Exception::attribute_error(format!(
                    "'{}' object attribute '{attr}' is read-only",
                    object.type_name()
                ))
                .into());
            }
            ExprKind::Tuple(targets) | ExprKind::List(targets) => {
                let items = self.iterate(&value)?;
                if items.len() != targets.len() {
                    let message = if items.len() > targets.len() {
                        format!("too many values to unpack (expected {})", targets.len())
                    } else {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        )
                    };
                    return Err(Exception::value_error(message).into());
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
            }
            _ => {
                return Err(Exception::new(ExcKind::RuntimeError, "invalid assignment target").into());
            }
        }
        Ok(())
    }

    fn aug_assign(&mut self, target: &Expr, op: BinOp, value: &Expr) -> Flow<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                let current = self.lookup(name)?;
                let rhs = self.eval(value)?;
                let updated = self.augmented(op, current, &rhs)?;
                self.store(name, updated);
            }
            ExprKind::Subscript { value: object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                let current = self.get_item(&object, &index)?;
                let rhs = self.eval(value)?;
                let updated = self.augmented(op, current, &rhs)?;
                self.set_item(&object, index, updated)?;
            }
            _ => {
                return Err(Exception::new(
                    ExcKind::RuntimeError,
                    "invalid augmented assignment target",
                )
                .into());
            }
        }
        Ok(())
    }

    /// `list += iterable` extends in place; everything else rebinds.
    fn augmented(&self, op: BinOp, current: Value, rhs: &Value) -> Result<Value, Exception> {
        if let (BinOp::Add, Value::List(items)) = (op, &current) {
            let extra = self.iterate(rhs)?;
            check_len(&self.limits, items.borrow().len() + extra.len())?;
            items.borrow_mut().extend(extra);
            return Ok(current);
        }
        ops::binary(op, &current, rhs, &self.limits)
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn eval_all(&mut self, exprs: &[Expr]) -> Flow<Vec<Value>> {
        let mut values = Vec::with_capacity(exprs.len());
        for expr in exprs {
            values.push(self.eval(expr)?);
        }
        Ok(values)
    }

    fn eval(&mut self, expr: &Expr) -> Flow<Value> {
        match &expr.kind {
            ExprKind::Name(name) => Ok(self.lookup(name)?),
            ExprKind::Constant(constant) => Ok(match constant {
                Constant::None => Value::None,
                Constant::Bool(b) => Value::Bool(*b),
                Constant::Int(i) => Value::Int(*i),
                Constant::Float(f) => Value::Float(*f),
                Constant::Str(s) => Value::str(s.as_str()),
            }),
            ExprKind::List(items) => Ok(Value::list(self.eval_all(items)?)),
            ExprKind::Tuple(items) => Ok(Value::tuple(self.eval_all(items)?)),
            ExprKind::Dict(pairs) => {
                let mut dict = Dict::default();
                for (key, value) in pairs {
                    let key = Key::from_value(&self.eval(key)?)?;
                    let value = self.eval(value)?;
                    dict.insert(key, value);
                }
                Ok(Value::dict(dict))
            }
            ExprKind::BinOp { left, op, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(ops::binary(*op, &left, &right, &self.limits)?)
            }
            ExprKind::UnaryOp { op, operand } => {
                let operand = self.eval(operand)?;
                Ok(ops::unary(*op, &operand)?)
            }
            ExprKind::BoolOp { op, left, right } => {
                let left = self.eval(left)?;
                let short_circuit = match op {
                    BoolOp::And => !left.truthy(),
                    BoolOp::Or => left.truthy(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            ExprKind::Compare { left, ops } => {
                let mut lhs = self.eval(left)?;
                for (op, right) in ops {
                    let rhs = self.eval(right)?;
                    if !self.compare(*op, &lhs, &rhs)? {
                        return Ok(Value::Bool(false));
                    }
                    lhs = rhs;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                let callee = self.eval(func)?;
                let args = self.eval_all(args)?;
                let mut kwargs = Vec::with_capacity(keywords.len());
                for keyword in keywords {
                    kwargs.push((keyword.name.clone(), self.eval(&keyword.value)?));
                }
                self.call_value(&callee, args, kwargs)
            }
            ExprKind::Attribute { value, attr } => {
                let object = self.eval(value)?;
                Ok(self.get_attr(&object, attr)?)
            }
            ExprKind::Subscript { value, index } => {
                let object = self.eval(value)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let lower = self.slice_bound(lower.as_deref())?;
                    let upper = self.slice_bound(upper.as_deref())?;
                    let step = self.slice_bound(step.as_deref())?;
                    return Ok(self.slice(&object, lower, upper, step)?);
                }
                let index = self.eval(index)?;
                Ok(self.get_item(&object, &index)?)
            }
            ExprKind::Slice { .. } => {
                Err(Exception::type_error("slice used outside of a subscript").into())
            }
            ExprKind::IfExp { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            ExprKind::ListComp {
                elt,
                target,
                iter,
                conditions,
            } => {
                let iterable = self.eval(iter)?;
                let mut out = Vec::new();
                self.for_each(&iterable, |interp, item| {
                    interp.assign(target, item)?;
                    for condition in conditions {
                        if !interp.eval(condition)?.truthy() {
                            return Ok(true);
                        }
                    }
                    let value = interp.eval(elt)?;
                    check_len(&interp.limits, out.len() + 1)?;
                    out.push(value);
                    Ok(true)
                })?;
                Ok(Value::list(out))
            }
        }
    }

    fn slice_bound(&mut self, expr: Option<&Expr>) -> Flow<Option<i64>> {
        let Some(expr) = expr else { return Ok(None) };
        match self.eval(expr)? {
            Value::None => Ok(None),
            value => match value.as_int() {
                Some(i) => Ok(Some(i)),
                None => Err(Exception::type_error(
                    "slice indices must be integers or None",
                )
                .into()),
            },
        }
    }

    fn compare(&self, op: CmpOp, left: &Value, right: &Value) -> Result<bool, Exception> {
        if let (CmpOp::In | CmpOp::NotIn, Value::Secrets) = (op, right) {
            let found = match left {
                Value::Str(key) => self.secrets.contains_key(key),
                _ => false,
            };
            return Ok(found == (op == CmpOp::In));
        }
        ops::compare(op, left, right, &self.limits)
    }

    // ========================================================================
    // Calls
    // ========================================================================

    pub(crate) fn call_value(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Flow<Value> {
        self.tick()?;
        match callee {
            Value::Function(function) => self.call_function(function.clone(), args, kwargs),
            Value::Builtin(builtin) => builtins::call(self, *builtin, args, kwargs),
            Value::Method(method) => {
                let receiver = method.receiver.clone();
                methods::call(self, &receiver, &method.name, args, kwargs)
            }
            Value::ModuleFn(function) => {
                let mut cx = ModuleContext {
                    limits: &self.limits,
                    patterns: &mut self.patterns,
                    deadline: self.deadline,
                };
                let result = function.module.call(&function.name, args, kwargs, &mut cx);
                self.check_deadline()?;
                Ok(result?)
            }
            Value::ExceptionType(kind) => {
                let message = match args.first() {
                    Some(arg) => arg.try_to_str(&self.limits)?,
                    None => String::new(),
                };
                Ok(Value::Exception(Rc::new(Exception::new(*kind, message))))
            }
            other => Err(Exception::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))
            .into()),
        }
    }

    fn call_function(
        &mut self,
        function: Rc<Function>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Flow<Value> {
        if self.depth >= self.limits.max_call_depth {
            return Err(Exception::new(
                ExcKind::RecursionError,
                "maximum recursion depth exceeded",
            )
            .into());
        }
        let frame = bind_params(&function, args, kwargs)?;
        self.frames.push(frame);
        self.depth += 1;
        let result = self.exec_block(&function.def.body);
        self.depth -= 1;
        if let Some(frame) = self.frames.pop() {
            frame.into_values().for_each(release);
        }
        match result {
            Ok(()) => Ok(Value::None),
            Err(Unwind::Return(value)) => Ok(value),
            Err(other) => Err(other),
        }
    }

    // ========================================================================
    // Attributes and items
    // ========================================================================

    fn get_attr(&self, object: &Value, name: &str) -> Result<Value, Exception> {
        if let Value::Module(proxy) = object {
            return proxy.attr(name);
        }
        if methods::has_method(object, name) {
            return Ok(Value::Method(Rc::new(BoundMethod {
                receiver: object.clone(),
                name: name.to_string(),
            })));
        }
        Err(Exception::attribute_error(format!(
            "'{}' object has no attribute '{name}'",
            object.type_name()
        )))
    }

    pub(crate) fn get_item(&self, object: &Value, index: &Value) -> Result<Value, Exception> {
        match object {
            Value::List(items) => {
                let items = items.borrow();
                let i = normalize_index(index, items.len(), "list")?;
                Ok(items[i].clone())
            }
            Value::Tuple(items) => {
                let i = normalize_index(index, items.len(), "tuple")?;
                Ok(items[i].clone())
            }
            Value::Str(s) => {
                let count = s.chars().count();
                let i = normalize_index(index, count, "string")?;
                Ok(s.chars()
                    .nth(i)
                    .map(|c| Value::str(c.to_string()))
                    .unwrap_or(Value::None))
            }
            Value::Range(range) => {
                let len = usize::try_from(range.len()).unwrap_or(usize::MAX);
                let i = normalize_index(index, len, "range")?;
                range
                    .get(i as u64)
                    .map(Value::Int)
                    .ok_or_else(|| Exception::index_error("range object index out of range"))
            }
            Value::Dict(dict) => {
                let key = Key::from_value(index)?;
                dict.borrow()
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| Exception::key_error(index.repr()))
            }
            Value::Match(m) => {
                let i = m.group_index(index)?;
                Ok(m.groups[i].clone().map_or(Value::None, Value::str))
            }
            Value::Secrets => {
                let key = match index {
                    Value::Str(key) => key,
                    other => return Err(Exception::key_error(other.repr())),
                };
                self.secrets
                    .expose(key)
                    .map(Value::str)
                    .ok_or_else(|| Exception::key_error(index.repr()))
            }
            other => Err(Exception::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    fn set_item(&self, object: &Value, index: Value, value: Value) -> Result<(), Exception> {
        match object {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let i = normalize_index(&index, items.len(), "list assignment")?;
                let old = std::mem::replace(&mut items[i], value);
                drop(items);
                release(old);
                Ok(())
            }
            Value::Dict(dict) => {
                let key = Key::from_value(&index)?;
                let mut dict = dict.borrow_mut();
                if !dict.contains(&key) {
                    check_len(&self.limits, dict.len() + 1)?;
                }
                dict.insert(key, value);
                Ok(())
            }
            other => Err(Exception::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    fn slice(
        &self,
        object: &Value,
        lower: Option<i64>,
        upper: Option<i64>,
        step: Option<i64>,
    ) -> Result<Value, Exception> {
        match object {
            Value::List(items) => {
                let items = items.borrow();
                let picked = slice_indices(items.len(), lower, upper, step)?;
                Ok(Value::list(picked.into_iter().map(|i| items[i].clone()).collect()))
            }
            Value::Tuple(items) => {
                let picked = slice_indices(items.len(), lower, upper, step)?;
                Ok(Value::tuple(picked.into_iter().map(|i| items[i].clone()).collect()))
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let picked = slice_indices(chars.len(), lower, upper, step)?;
                Ok(Value::str(picked.into_iter().map(|i| chars[i]).collect::<String>()))
            }
            Value::Range(range) => slice_range(range, lower, upper, step).map(Value::Range),
            other => Err(Exception::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Append script output. Each chunk is redacted before it reaches the
    /// buffer, so a cut at the output ceiling cannot expose part of a secret.
    pub(crate) fn write_output(&self, text: &str) {
        let text = self.secrets.redact(text);
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_str(&text);
    }

    // ========================================================================
    // Network
    // ========================================================================

    /// `http.fetch`, `http.get` and `http.post`
    pub(crate) fn http_call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Flow<Value> {
        let (method, url, headers, body) = match name {
            "fetch" => {
                let mut slots = bind(name, &["method", "url", "headers", "body"], 2, args, kwargs)?;
                let method_name = expect_str(&take(&mut slots, 0), name)?;
                let method = method_name.parse::<HttpMethod>().map_err(|_| {
                    Exception::value_error(format!("unsupported HTTP method '{method_name}'"))
                })?;
                let url = expect_str(&take(&mut slots, 1), name)?;
                (method, url, given(slots[2].take()), given(slots[3].take()))
            }
            "get" => {
                let mut slots = bind(name, &["url", "headers"], 1, args, kwargs)?;
                let url = expect_str(&take(&mut slots, 0), name)?;
                (HttpMethod::Get, url, given(slots[1].take()), None)
            }
            _ => {
                let mut slots = bind(name, &["url", "body", "headers"], 1, args, kwargs)?;
                let url = expect_str(&take(&mut slots, 0), name)?;
                (HttpMethod::Post, url, given(slots[2].take()), given(slots[1].take()))
            }
        };

        let mut request = FetchRequest::new(method, url.to_string());
        if let Some(headers) = headers {
            let Value::Dict(headers) = headers else {
                return Err(Exception::type_error("headers must be a dict").into());
            };
            for (key, value) in headers.borrow().iter() {
                let name = key.to_value().try_to_str(&self.limits)?;
                request.headers.push((name, value.try_to_str(&self.limits)?));
            }
        }
        if let Some(body) = body {
            request.body = match body {
                Value::Str(text) => RequestBody::from(text.to_string()),
                other => {
                    let json = serde_json::to_string(&to_json(&other, &self.limits)?)
                        .map_err(|e| Exception::value_error(e.to_string()))?;
                    let has_type = request
                        .headers
                        .iter()
                        .any(|(k, _)| k.eq_ignore_ascii_case("content-type"));
                    if !has_type {
                        request
                            .headers
                            .push(("content-type".to_string(), "application/json".to_string()));
                    }
                    RequestBody::from(json)
                }
            };
        }

        self.check_deadline()?;
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        let fetched = self.io.block_on(async {
            tokio::time::timeout(remaining, self.client.fetch(request)).await
        });
        match fetched {
            Err(_) => Err(Unwind::Halt(Halt::Timeout)),
            Ok(Ok(response)) => Ok(self.response_value(response)?),
            Ok(Err(err)) => Err(net_unwind(err)),
        }
    }

    fn response_value(&self, response: FetchResponse) -> Result<Value, Exception> {
        let body = response.text();
        check_str_len(&self.limits, body.len())?;

        let mut headers = Dict::default();
        for (name, value) in &response.headers {
            let key = Key::Str(Rc::from(name.to_ascii_lowercase()));
            let joined = match headers.get(&key) {
                Some(existing) => format!("{}, {value}", existing.to_str()),
                None => value.clone(),
            };
            headers.insert(key, Value::str(joined));
        }

        let entries = [
            ("status", Value::Int(i64::from(response.status))),
            ("headers", Value::dict(headers)),
            ("body", Value::str(body)),
            ("truncated", Value::Bool(response.truncated)),
            (
                "redirect",
                response.redirect.clone().map_or(Value::None, Value::str),
            ),
            ("url", Value::str(response.url.as_str())),
        ];
        Ok(Value::dict(
            entries
                .into_iter()
                .map(|(k, v)| (Key::Str(Rc::from(k)), v))
                .collect(),
        ))
    }
}

fn net_unwind(err: NetError) -> Unwind {
    match err {
        NetError::Rejected(reason) => {
            warn!(reason = %reason, "outbound request rejected");
            Exception::new(
                ExcKind::NetworkDestinationRejected,
                format!("destination rejected: {reason}"),
            )
            .into()
        }
        NetError::HandlesExhausted => Unwind::Halt(Halt::ResourceExhausted(
            "open handle limit reached".to_string(),
        )),
        NetError::InvalidUrl(message) => Exception::value_error(format!("invalid URL: {message}")).into(),
        NetError::Timeout => Exception::new(ExcKind::TimeoutError, "request timed out").into(),
        other => Exception::new(ExcKind::ConnectionError, other.to_string()).into(),
    }
}

fn as_exception(value: &Value) -> Result<Exception, Exception> {
    match value {
        Value::Exception(exc) => Ok(exc.as_ref().clone()),
        Value::ExceptionType(kind) => Ok(Exception::new(*kind, "")),
        _ => Err(Exception::type_error(
            "exceptions must be exception types or instances",
        )),
    }
}

fn exception_matches(exc: &Exception, kind: &Value) -> Result<bool, Exception> {
    match kind {
        Value::ExceptionType(kind) => Ok(exc.kind.is_a(*kind)),
        Value::Tuple(kinds) => {
            for kind in kinds.iter() {
                if exception_matches(exc, kind)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Exception::type_error(
            "catching something that is not an exception type is not allowed",
        )),
    }
}

fn bind_params(
    function: &Function,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<HashMap<String, Value>, Exception> {
    let def = &function.def;
    let params = &def.params;
    if args.len() > params.len() {
        return Err(Exception::type_error(format!(
            "{}() takes {} positional argument(s) but {} were given",
            def.name,
            params.len(),
            args.len()
        )));
    }
    let mut slots: Vec<Option<Value>> = vec![None; params.len()];
    for (slot, arg) in slots.iter_mut().zip(args) {
        *slot = Some(arg);
    }
    for (name, value) in kwargs {
        let Some(i) = params.iter().position(|p| p.name == name) else {
            return Err(Exception::type_error(format!(
                "{}() got an unexpected keyword argument '{name}'",
                def.name
            )));
        };
        if slots[i].is_some() {
            return Err(Exception::type_error(format!(
                "{}() got multiple values for argument '{name}'",
                def.name
            )));
        }
        slots[i] = Some(value);
    }

    let mut frame = HashMap::with_capacity(params.len());
    for ((param, slot), default) in params.iter().zip(slots).zip(&function.defaults) {
        let value = match slot.or_else(|| default.clone()) {
            Some(value) => value,
            None => {
                return Err(Exception::type_error(format!(
                    "{}() missing required argument '{}'",
                    def.name, param.name
                )));
            }
        };
        frame.insert(param.name.clone(), value);
    }
    Ok(frame)
}

fn normalize_index(index: &Value, len: usize, what: &str) -> Result<usize, Exception> {
    let i = index.as_int().ok_or_else(|| {
        Exception::type_error(format!(
            "{what} indices must be integers, not {}",
            index.type_name()
        ))
    })?;
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if i < 0 { i + len_i } else { i };
    if resolved < 0 || resolved >= len_i {
        return Err(Exception::index_error(format!("{what} index out of range")));
    }
    Ok(resolved as usize)
}

/// Python slice bounds over `len` items: first index, end index and step.
fn slice_bounds(
    len: i128,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<(i128, i128, i128), Exception> {
    let step = i128::from(step.unwrap_or(1));
    if step == 0 {
        return Err(Exception::value_error("slice step cannot be zero"));
    }
    let norm = |v: i64| {
        let v = i128::from(v);
        if v < 0 { v + len } else { v }
    };
    Ok(if step > 0 {
        (
            start.map_or(0, |s| norm(s).clamp(0, len)),
            stop.map_or(len, |s| norm(s).clamp(0, len)),
            step,
        )
    } else {
        (
            start.map_or(len - 1, |s| norm(s).clamp(-1, len - 1)),
            stop.map_or(-1, |s| norm(s).clamp(-1, len - 1)),
            step,
        )
    })
}

/// Python slice semantics over a sequence of `len` items.
pub(crate) fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Vec<usize>, Exception> {
    let (mut i, stop, step) = slice_bounds(len as i128, start, stop, step)?;
    let mut out = Vec::new();
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(i as usize);
        i += step;
    }
    Ok(out)
}

/// A slice of a range is another range, computed without visiting its items.
fn slice_range(
    range: &Range,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Range, Exception> {
    let (first, end, step) = slice_bounds(i128::from(range.len()), start, stop, step)?;
    let overflow = || Exception::new(ExcKind::OverflowError, "range slice does not fit in a range");
    let empty = (step > 0 && first >= end) || (step < 0 && first <= end);
    let step = i64::try_from(i128::from(range.step) * step).map_err(|_| overflow())?;
    if empty {
        return Ok(Range { start: 0, stop: 0, step });
    }
    let at = |i: i128| i64::try_from(i128::from(range.start) + i * i128::from(range.step));
    Ok(Range {
        start: at(first).map_err(|_| overflow())?,
        stop: at(end).map_err(|_| overflow())?,
        step,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_follow_python_rules() {
        assert_eq!(slice_indices(5, None, None, None).unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(slice_indices(5, Some(-2), None, None).unwrap(), vec![3, 4]);
        assert_eq!(slice_indices(5, None, None, Some(-1)).unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(slice_indices(5, Some(1), Some(100), Some(2)).unwrap(), vec![1, 3]);
        assert_eq!(slice_indices(5, Some(10), Some(0), Some(-2)).unwrap(), vec![4, 2]);
        assert!(slice_indices(5, None, None, Some(i64::MAX)).unwrap() == vec![0]);
        assert!(slice_indices(5, None, None, Some(0)).is_err());
        assert!(slice_indices(0, None, None, Some(-1)).unwrap().is_empty());
    }

    #[test]
    fn range_slices_stay_lazy() {
        let huge = Range { start: 0, stop: 1_000_000_000_000_000_000, step: 1 };
        assert_eq!(
            slice_range(&huge, Some(0), Some(2), None).unwrap(),
            Range { start: 0, stop: 2, step: 1 }
        );
        let reversed = slice_range(&huge, None, None, Some(-1)).unwrap();
        assert_eq!(reversed.len(), huge.len());
        assert_eq!(reversed.get(0), Some(999_999_999_999_999_999));

        let ten = Range { start: 0, stop: 10, step: 1 };
        let picked = slice_range(&ten, None, None, Some(-3)).unwrap();
        let items: Vec<_> = (0..picked.len()).filter_map(|i| picked.get(i)).collect();
        assert_eq!(items, vec![9, 6, 3, 0]);
        assert_eq!(slice_range(&ten, Some(8), Some(2), None).unwrap().len(), 0);

        // Reversing would need a stop below i64::MIN
        let full = Range { start: i64::MIN, stop: i64::MAX, step: 1 };
        let err = slice_range(&full, None, None, Some(-1)).unwrap_err();
        assert_eq!(err.kind, ExcKind::OverflowError);
        assert!(slice_range(&ten, None, None, Some(0)).is_err());
    }

    #[test]
    fn index_normalization() {
        assert_eq!(normalize_index(&Value::Int(-1), 3, "list").unwrap(), 2);
        assert!(normalize_index(&Value::Int(3), 3, "list").is_err());
        assert!(normalize_index(&Value::str("0"), 3, "list").is_err());
    }
}
