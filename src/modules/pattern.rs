//! The `re` module.
//!
//! Every matching operation runs on a short-lived worker thread and is
//! abandoned once `limits.pattern_timeout_ms` (or the call's remaining
//! deadline) passes. There is no `compile`: patterns are compiled with size
//! limits and cached for the duration of one call.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Instant;

use regex::{Captures, Regex, RegexBuilder};

use super::{ModuleContext, NativeModule, unknown_attribute};
use crate::runtime::args::{bind, expect_int, expect_str, given, take};
use crate::runtime::{ExcKind, Exception, MatchData, Value, check_len};

pub(crate) struct PatternModule;

const EXPORTS: &[&str] = &[
    "search",
    "match",
    "fullmatch",
    "findall",
    "sub",
    "split",
    "escape",
];

const MAX_CACHED: usize = 32;
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// Compiled patterns for one call
#[derive(Default)]
pub(crate) struct PatternCache {
    compiled: HashMap<String, Regex>,
}

impl PatternCache {
    fn get(&mut self, pattern: &str, whole: bool) -> Result<Regex, Exception> {
        let source = if whole {
            format!(r"\A(?:{pattern})\z")
        } else {
            pattern.to_string()
        };
        if let Some(re) = self.compiled.get(&source) {
            return Ok(re.clone());
        }
        let re = RegexBuilder::new(&source)
            .size_limit(PATTERN_SIZE_LIMIT)
            .dfa_size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .map_err(|e| Exception::value_error(format!("invalid pattern: {e}")))?;
        if self.compiled.len() >= MAX_CACHED {
            self.compiled.clear();
        }
        self.compiled.insert(source, re.clone());
        Ok(re)
    }
}

/// Run `op` off-thread, giving up after the pattern timeout.
fn guarded<T, F>(cx: &ModuleContext<'_>, op: F) -> Result<T, Exception>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let remaining = cx.deadline.saturating_duration_since(Instant::now());
    let timeout = cx.limits.pattern_timeout().min(remaining);
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("toolcell-pattern".to_string())
        .spawn(move || {
            let _ = tx.send(op());
        })
        .map_err(|e| {
            Exception::new(
                ExcKind::RuntimeError,
                format!("pattern worker unavailable: {e}"),
            )
        })?;
    match rx.recv_timeout(timeout) {
        Ok(value) => Ok(value),
        Err(RecvTimeoutError::Timeout) => Err(Exception::new(
            ExcKind::TimeoutError,
            format!("pattern operation exceeded {} ms", timeout.as_millis()),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(Exception::new(
            ExcKind::RuntimeError,
            "pattern operation failed",
        )),
    }
}

fn char_offset(text: &str, byte: usize) -> usize {
    text[..byte].chars().count()
}

fn match_data(re: &Regex, text: &str, caps: &Captures<'_>) -> MatchData {
    let groups = (0..caps.len())
        .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
        .collect();
    let spans = (0..caps.len())
        .map(|i| {
            caps.get(i)
                .map(|m| (char_offset(text, m.start()), char_offset(text, m.end())))
        })
        .collect();
    let names = re
        .capture_names()
        .enumerate()
        .filter_map(|(i, name)| name.map(|n| (n.to_string(), i)))
        .collect();
    MatchData {
        groups,
        spans,
        names,
    }
}

enum Found {
    Text(String),
    Groups(Vec<String>),
}

/// Convert `\1` and `\g<name>` group references to the regex crate's
/// `${1}` form, escaping literal `$`.
fn translate_replacement(repl: &str) -> String {
    let mut out = String::with_capacity(repl.len());
    let mut chars = repl.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    let mut num = String::new();
                    while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                        num.push(d);
                        chars.next();
                    }
                    out.push_str(&format!("${{{num}}}"));
                }
                Some('g') => {
                    let mut ahead = chars.clone();
                    ahead.next();
                    if ahead.next() == Some('<') {
                        let name: String = ahead.by_ref().take_while(|c| *c != '>').collect();
                        out.push_str(&format!("${{{name}}}"));
                        chars = ahead;
                    } else {
                        out.push('\\');
                    }
                }
                Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('t') => {
                    chars.next();
                    out.push('\t');
                }
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                _ => out.push('\\'),
            },
            other => out.push(other),
        }
    }
    out
}

impl NativeModule for PatternModule {
    fn name(&self) -> &'static str {
        "re"
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
            "search" | "match" | "fullmatch" => {
                let mut slots = bind(name, &["pattern", "string"], 2, args, kwargs)?;
                let pattern = expect_str(&take(&mut slots, 0), name)?;
                let text = expect_str(&take(&mut slots, 1), name)?.to_string();
                let re = cx.patterns.get(&pattern, name == "fullmatch")?;
                let from_start = name == "match";
                let found = guarded(cx, move || {
                    let caps = re.captures(&text)?;
                    let whole = caps.get(0)?;
                    if from_start && whole.start() != 0 {
                        return None;
                    }
                    Some(match_data(&re, &text, &caps))
                })?;
                Ok(found.map_or(Value::None, |m| Value::Match(Rc::new(m))))
            }
            "findall" => {
                let mut slots = bind(name, &["pattern", "string"], 2, args, kwargs)?;
                let pattern = expect_str(&take(&mut slots, 0), name)?;
                let text = expect_str(&take(&mut slots, 1), name)?.to_string();
                let re = cx.patterns.get(&pattern, false)?;
                let max_len = cx.limits.max_collection_len;
                let found = guarded(cx, move || {
                    let mut out = Vec::new();
                    for caps in re.captures_iter(&text) {
                        if out.len() >= max_len {
                            return None;
                        }
                        let group = |i: usize| caps.get(i).map_or("", |m| m.as_str()).to_string();
                        out.push(match caps.len() {
                            1 => Found::Text(group(0)),
                            2 => Found::Text(group(1)),
                            n => Found::Groups((1..n).map(group).collect()),
                        });
                    }
                    Some(out)
                })?
                .ok_or_else(|| Exception::memory("too many matches"))?;
                let items = found
                    .into_iter()
                    .map(|f| match f {
                        Found::Text(s) => Value::str(s),
                        Found::Groups(g) => {
                            Value::tuple(g.into_iter().map(Value::str).collect())
                        }
                    })
                    .collect();
                Ok(Value::list(items))
            }
            "sub" => {
                let mut slots = bind(name, &["pattern", "repl", "string", "count"], 3, args, kwargs)?;
                let pattern = expect_str(&take(&mut slots, 0), name)?;
                let repl = translate_replacement(&expect_str(&take(&mut slots, 1), name)?);
                let text = expect_str(&take(&mut slots, 2), name)?.to_string();
                let count = match given(slots[3].take()) {
                    Some(v) => usize::try_from(expect_int(&v, name)?).unwrap_or(0),
                    None => 0,
                };
                let re = cx.patterns.get(&pattern, false)?;
                let limit = cx.limits.max_string_bytes;
                let replaced = guarded(cx, move || {
                    let mut out = String::new();
                    let mut last = 0;
                    for (n, caps) in re.captures_iter(&text).enumerate() {
                        if count > 0 && n >= count {
                            break;
                        }
                        let Some(m) = caps.get(0) else { continue };
                        out.push_str(&text[last..m.start()]);
                        caps.expand(&repl, &mut out);
                        last = m.end();
                        if out.len() > limit {
                            return None;
                        }
                    }
                    out.push_str(&text[last..]);
                    (out.len() <= limit).then_some(out)
                })?
                .ok_or_else(|| Exception::memory("string result too large"))?;
                Ok(Value::str(replaced))
            }
            "split" => {
                let mut slots = bind(name, &["pattern", "string", "maxsplit"], 2, args, kwargs)?;
                let pattern = expect_str(&take(&mut slots, 0), name)?;
                let text = expect_str(&take(&mut slots, 1), name)?.to_string();
                let maxsplit = match given(slots[2].take()) {
                    Some(v) => usize::try_from(expect_int(&v, name)?).unwrap_or(0),
                    None => 0,
                };
                let re = cx.patterns.get(&pattern, false)?;
                let parts: Vec<String> = guarded(cx, move || {
                    if maxsplit == 0 {
                        re.split(&text).map(str::to_string).collect()
                    } else {
                        re.splitn(&text, maxsplit + 1).map(str::to_string).collect()
                    }
                })?;
                check_len(cx.limits, parts.len())?;
                Ok(Value::list(parts.into_iter().map(Value::str).collect()))
            }
            "escape" => {
                let mut slots = bind(name, &["pattern"], 1, args, kwargs)?;
                let text = expect_str(&take(&mut slots, 0), name)?;
                Ok(Value::str(regex::escape(&text)))
            }
            _ => Err(unknown_attribute(self.name(), name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::RuntimeLimits;
    use std::time::Duration;

    fn call(name: &str, args: Vec<Value>) -> Result<Value, Exception> {
        let limits = RuntimeLimits::default();
        let mut patterns = PatternCache::default();
        let mut cx = ModuleContext {
            limits: &limits,
            patterns: &mut patterns,
            deadline: Instant::now() + Duration::from_secs(5),
        };
        PatternModule.call(name, args, Vec::new(), &mut cx)
    }

    fn s(text: &str) -> Value {
        Value::str(text)
    }

    #[test]
    fn search_and_match_differ_on_position() {
        let found = call("search", vec![s(r"(\d+)"), s("abc 123")]).unwrap();
        match found {
            Value::Match(m) => {
                assert_eq!(m.groups[1].as_deref(), Some("123"));
                assert_eq!(m.spans[0], Some((4, 7)));
            }
            other => panic!("{}", other.repr()),
        }
        assert!(matches!(
            call("match", vec![s(r"\d+"), s("abc 123")]).unwrap(),
            Value::None
        ));
        assert!(matches!(
            call("fullmatch", vec![s(r"\d+"), s("123")]).unwrap(),
            Value::Match(_)
        ));
        assert!(matches!(
            call("fullmatch", vec![s(r"\d+"), s("123a")]).unwrap(),
            Value::None
        ));
    }

    #[test]
    fn findall_shapes_follow_group_count() {
        let all = call("findall", vec![s(r"\d"), s("a1b2")]).unwrap();
        assert_eq!(all.repr(), "['1', '2']");
        let pairs = call("findall", vec![s(r"(\w)=(\d)"), s("a=1 b=2")]).unwrap();
        assert_eq!(pairs.repr(), "[('a', '1'), ('b', '2')]");
    }

    #[test]
    fn sub_accepts_backslash_groups() {
        let out = call("sub", vec![s(r"(\w+)@(\w+)"), s(r"\2 at \1 $"), s("me@host")]).unwrap();
        assert_eq!(out.to_str(), "host at me $");
    }

    #[test]
    fn split_and_escape() {
        assert_eq!(
            call("split", vec![s(r"\s*,\s*"), s("a , b,c")]).unwrap().repr(),
            "['a', 'b', 'c']"
        );
        assert_eq!(call("escape", vec![s("a.b")]).unwrap().to_str(), r"a\.b");
    }

    #[test]
    fn invalid_and_oversized_patterns_raise_value_error() {
        let err = call("search", vec![s("("), s("x")]).unwrap_err();
        assert_eq!(err.kind, ExcKind::ValueError);
        let err = call("search", vec![s(r"(\w{1000}){1000}"), s("x")]).unwrap_err();
        assert_eq!(err.kind, ExcKind::ValueError);
    }

    #[test]
    fn expired_deadline_times_out() {
        let limits = RuntimeLimits::default();
        let mut patterns = PatternCache::default();
        let mut cx = ModuleContext {
            limits: &limits,
            patterns: &mut patterns,
            deadline: Instant::now(),
        };
        let big = "a".repeat(200_000);
        let err = PatternModule
            .call("findall", vec![s(r"(a|aa)+$"), Value::str(big)], Vec::new(), &mut cx)
            .unwrap_err();
        assert_eq!(err.kind, ExcKind::TimeoutError);
    }
}
