//! Methods on built-in values: `s.upper()`, `items.append(x)`, `m.group(1)`.

use std::rc::Rc;

use super::args::{bind, expect_int, expect_str, given, no_kwargs, take};
use super::builtins::sort_values;
use super::exception::Exception;
use super::interp::{Flow, Interpreter};
use super::value::{Budget, Dict, Key, MatchData, Value, equal_within, release};
use super::{check_len, check_str_len};

const STR_METHODS: &[&str] = &[
    "upper", "lower", "strip", "lstrip", "rstrip", "split", "join", "replace", "startswith",
    "endswith", "find", "count", "isdigit", "isalpha",
];
const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "remove", "index", "count", "sort", "reverse", "copy",
    "clear",
];
const DICT_METHODS: &[&str] = &[
    "get", "keys", "values", "items", "pop", "update", "setdefault", "copy", "clear",
];
const MATCH_METHODS: &[&str] = &["group", "groups", "groupdict", "start", "end", "span"];
const SECRET_METHODS: &[&str] = &["get", "keys"];
const HTTP_METHODS: &[&str] = &["fetch", "get", "post"];

pub(crate) fn has_method(receiver: &Value, name: &str) -> bool {
    let table = match receiver {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Match(_) => MATCH_METHODS,
        Value::Secrets => SECRET_METHODS,
        Value::Http => HTTP_METHODS,
        _ => return false,
    };
    table.contains(&name)
}

pub(crate) fn call(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Flow<Value> {
    match receiver {
        Value::Str(s) => Ok(str_method(interp, s, name, args, kwargs)?),
        Value::List(_) => list_method(interp, receiver, name, args, kwargs),
        Value::Dict(_) => Ok(dict_method(interp, receiver, name, args, kwargs)?),
        Value::Match(m) => Ok(match_method(m, name, args, kwargs)?),
        Value::Secrets => Ok(secrets_method(interp, name, args, kwargs)?),
        Value::Http => interp.http_call(name, args, kwargs),
        other => Err(Exception::attribute_error(format!(
            "'{}' object has no attribute '{name}'",
            other.type_name()
        ))
        .into()),
    }
}

// ============================================================================
// str
// ============================================================================

fn str_method(
    interp: &Interpreter,
    s: &Rc<str>,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, Exception> {
    let func = format!("str.{name}");
    let value = match name {
        "upper" | "lower" | "isdigit" | "isalpha" => {
            bind(&func, &[], 0, args, kwargs)?;
            match name {
                "upper" => Value::str(s.to_uppercase()),
                "lower" => Value::str(s.to_lowercase()),
                "isdigit" => Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())),
                _ => Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic)),
            }
        }
        "strip" | "lstrip" | "rstrip" => {
            let mut slots = bind(&func, &["chars"], 0, args, kwargs)?;
            let chars = given(slots[0].take())
                .map(|c| expect_str(&c, &func))
                .transpose()?;
            let matches = |c: char| match &chars {
                Some(set) => set.contains(c),
                None => c.is_whitespace(),
            };
            let out = match name {
                "strip" => s.trim_matches(matches),
                "lstrip" => s.trim_start_matches(matches),
                _ => s.trim_end_matches(matches),
            };
            Value::str(out)
        }
        "split" => {
            let mut slots = bind(&func, &["sep", "maxsplit"], 0, args, kwargs)?;
            let sep = given(slots[0].take()).map(|v| expect_str(&v, &func)).transpose()?;
            let maxsplit = given(slots[1].take())
                .map(|v| expect_int(&v, &func))
                .transpose()?
                .unwrap_or(-1);
            let parts = match &sep {
                Some(sep) if sep.is_empty() => {
                    return Err(Exception::value_error("empty separator"));
                }
                Some(sep) if maxsplit >= 0 => {
                    let pieces = usize::try_from(maxsplit).unwrap_or(usize::MAX);
                    s.splitn(pieces.saturating_add(1), &**sep)
                        .map(Value::str)
                        .collect::<Vec<_>>()
                }
                Some(sep) => s.split(&**sep).map(Value::str).collect(),
                None => split_whitespace(s, maxsplit),
            };
            check_len(interp.limits(), parts.len())?;
            Value::list(parts)
        }
        "join" => {
            let mut slots = bind(&func, &["iterable"], 1, args, kwargs)?;
            let items = interp.iterate(&take(&mut slots, 0))?;
            let mut parts = Vec::with_capacity(items.len());
            for item in &items {
                match item {
                    Value::Str(part) => parts.push(part.clone()),
                    other => {
                        return Err(Exception::type_error(format!(
                            "sequence item: expected str instance, {} found",
                            other.type_name()
                        )));
                    }
                }
            }
            let total = parts.iter().map(|p| p.len()).sum::<usize>()
                + s.len() * parts.len().saturating_sub(1);
            check_str_len(interp.limits(), total)?;
            Value::str(parts.iter().map(|p| &**p).collect::<Vec<_>>().join(&**s))
        }
        "replace" => {
            let mut slots = bind(&func, &["old", "new", "count"], 2, args, kwargs)?;
            let old = expect_str(&take(&mut slots, 0), &func)?;
            let new = expect_str(&take(&mut slots, 1), &func)?;
            let count = given(slots[2].take()).map(|v| expect_int(&v, &func)).transpose()?;
            let found = s.matches(&*old).count();
            let replaced = match count {
                Some(n) if n >= 0 => found.min(usize::try_from(n).unwrap_or(usize::MAX)),
                _ => found,
            };
            let size = (s.len() - replaced * old.len())
                .saturating_add(replaced.saturating_mul(new.len()));
            check_str_len(interp.limits(), size)?;
            Value::str(s.replacen(&*old, &new, replaced))
        }
        "startswith" | "endswith" => {
            let mut slots = bind(&func, &["prefix"], 1, args, kwargs)?;
            let candidates = match take(&mut slots, 0) {
                Value::Tuple(items) => items
                    .iter()
                    .map(|item| expect_str(item, &func))
                    .collect::<Result<Vec<_>, _>>()?,
                other => vec![expect_str(&other, &func)?],
            };
            let hit = candidates.iter().any(|c| {
                if name == "startswith" {
                    s.starts_with(&**c)
                } else {
                    s.ends_with(&**c)
                }
            });
            Value::Bool(hit)
        }
        "find" => {
            let mut slots = bind(&func, &["sub"], 1, args, kwargs)?;
            let sub = expect_str(&take(&mut slots, 0), &func)?;
            let index = s
                .find(&*sub)
                .map_or(-1, |byte| s[..byte].chars().count() as i64);
            Value::Int(index)
        }
        "count" => {
            let mut slots = bind(&func, &["sub"], 1, args, kwargs)?;
            let sub = expect_str(&take(&mut slots, 0), &func)?;
            Value::Int(s.matches(&*sub).count() as i64)
        }
        _ => return Err(no_attribute("str", name)),
    };
    Ok(value)
}

fn split_whitespace(s: &str, maxsplit: i64) -> Vec<Value> {
    if maxsplit < 0 {
        return s.split_whitespace().map(Value::str).collect();
    }
    let mut out = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if out.len() as i64 == maxsplit {
            out.push(Value::str(rest));
            break;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        out.push(Value::str(&rest[..end]));
        rest = rest[end..].trim_start();
    }
    out
}

// ============================================================================
// list
// ============================================================================

fn list_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Flow<Value> {
    let Value::List(list) = receiver else {
        return Err(no_attribute(receiver.type_name(), name).into());
    };
    let func = format!("list.{name}");
    let value = match name {
        "append" => {
            let mut slots = bind(&func, &["object"], 1, args, kwargs)?;
            let len = list.borrow().len();
            check_len(interp.limits(), len + 1)?;
            list.borrow_mut().push(take(&mut slots, 0));
            Value::None
        }
        "extend" => {
            let mut slots = bind(&func, &["iterable"], 1, args, kwargs)?;
            let extra = interp.iterate(&take(&mut slots, 0))?;
            let len = list.borrow().len();
            check_len(interp.limits(), len + extra.len())?;
            list.borrow_mut().extend(extra);
            Value::None
        }
        "insert" => {
            let mut slots = bind(&func, &["index", "object"], 2, args, kwargs)?;
            let index = expect_int(&take(&mut slots, 0), &func)?;
            let mut items = list.borrow_mut();
            check_len(interp.limits(), items.len() + 1)?;
            let len = items.len() as i64;
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(at as usize, take(&mut slots, 1));
            Value::None
        }
        "pop" => {
            let mut slots = bind(&func, &["index"], 0, args, kwargs)?;
            let index = given(slots[0].take())
                .map(|v| expect_int(&v, &func))
                .transpose()?
                .unwrap_or(-1);
            let mut items = list.borrow_mut();
            if items.is_empty() {
                return Err(Exception::index_error("pop from empty list").into());
            }
            let len = items.len() as i64;
            let at = if index < 0 { index + len } else { index };
            if !(0..len).contains(&at) {
                return Err(Exception::index_error("pop index out of range").into());
            }
            items.remove(at as usize)
        }
        "remove" | "index" | "count" => {
            let mut slots = bind(&func, &["value"], 1, args, kwargs)?;
            let needle = take(&mut slots, 0);
            let mut budget = Budget::new(interp.limits());
            let items = list.borrow();
            let mut position = None;
            let mut count = 0;
            for (i, item) in items.iter().enumerate() {
                if equal_within(item, &needle, &mut budget)? {
                    position.get_or_insert(i);
                    count += 1;
                    if name != "count" {
                        break;
                    }
                }
            }
            match (name, position) {
                ("count", _) => Value::Int(count),
                ("index", Some(i)) => Value::Int(i as i64),
                ("remove", Some(i)) => {
                    drop(items);
                    let removed = list.borrow_mut().remove(i);
                    release(removed);
                    Value::None
                }
                _ => {
                    return Err(Exception::value_error(format!(
                        "{} is not in list",
                        needle.repr()
                    ))
                    .into());
                }
            }
        }
        "sort" => {
            let mut slots = bind(&func, &["key", "reverse"], 0, args, kwargs)?;
            let key = given(slots[0].take());
            let reverse = slots[1].take().is_some_and(|v| v.truthy());
            let items = std::mem::take(&mut *list.borrow_mut());
            match sort_values(interp, items.clone(), key, reverse) {
                Ok(sorted) => *list.borrow_mut() = sorted,
                Err(unwind) => {
                    *list.borrow_mut() = items;
                    return Err(unwind);
                }
            }
            Value::None
        }
        "reverse" | "copy" | "clear" => {
            bind(&func, &[], 0, args, kwargs)?;
            match name {
                "reverse" => {
                    list.borrow_mut().reverse();
                    Value::None
                }
                "copy" => Value::list(list.borrow().clone()),
                _ => {
                    let old = std::mem::take(&mut *list.borrow_mut());
                    release(Value::list(old));
                    Value::None
                }
            }
        }
        _ => return Err(no_attribute("list", name).into()),
    };
    Ok(value)
}

// ============================================================================
// dict
// ============================================================================

fn dict_method(
    interp: &Interpreter,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, Exception> {
    let Value::Dict(dict) = receiver else {
        return Err(no_attribute(receiver.type_name(), name));
    };
    let func = format!("dict.{name}");
    let value = match name {
        "get" => {
            let mut slots = bind(&func, &["key", "default"], 1, args, kwargs)?;
            let key = Key::from_value(&take(&mut slots, 0))?;
            let found = dict.borrow().get(&key).cloned();
            found.unwrap_or_else(|| take(&mut slots, 1))
        }
        "keys" | "values" | "items" | "copy" | "clear" => {
            bind(&func, &[], 0, args, kwargs)?;
            let entries = dict.borrow();
            match name {
                "keys" => Value::list(entries.keys().map(Key::to_value).collect()),
                "values" => Value::list(entries.iter().map(|(_, v)| v.clone()).collect()),
                "items" => Value::list(
                    entries
                        .iter()
                        .map(|(k, v)| Value::tuple(vec![k.to_value(), v.clone()]))
                        .collect(),
                ),
                "copy" => Value::dict(entries.clone()),
                _ => {
                    drop(entries);
                    let old = std::mem::take(&mut *dict.borrow_mut());
                    release(Value::dict(old));
                    Value::None
                }
            }
        }
        "pop" => {
            let mut slots = bind(&func, &["key", "default"], 1, args, kwargs)?;
            let raw = take(&mut slots, 0);
            let key = Key::from_value(&raw)?;
            let removed = dict.borrow_mut().remove(&key);
            match (removed, slots[1].take()) {
                (Some(value), _) => value,
                (None, Some(default)) => default,
                (None, None) => return Err(Exception::key_error(raw.repr())),
            }
        }
        "setdefault" => {
            let mut slots = bind(&func, &["key", "default"], 1, args, kwargs)?;
            let key = Key::from_value(&take(&mut slots, 0))?;
            let existing = dict.borrow().get(&key).cloned();
            match existing {
                Some(value) => value,
                None => {
                    let default = take(&mut slots, 1);
                    let len = dict.borrow().len();
                    check_len(interp.limits(), len + 1)?;
                    dict.borrow_mut().insert(key, default.clone());
                    default
                }
            }
        }
        "update" => {
            if args.len() > 1 {
                return Err(Exception::type_error(format!(
                    "update expected at most 1 argument, got {}",
                    args.len()
                )));
            }
            let mut incoming = Dict::default();
            match args.into_iter().next() {
                None => {}
                Some(Value::Dict(other)) => incoming = other.borrow().clone(),
                Some(pairs) => {
                    for pair in interp.iterate(&pairs)? {
                        let items = interp.iterate(&pair)?;
                        let [k, v] = <[Value; 2]>::try_from(items).map_err(|_| {
                            Exception::value_error(
                                "dictionary update sequence element has wrong length",
                            )
                        })?;
                        incoming.insert(Key::from_value(&k)?, v);
                    }
                }
            }
            for (k, v) in kwargs {
                incoming.insert(Key::Str(k.into()), v);
            }
            let mut target = dict.borrow_mut();
            for (k, v) in incoming.iter() {
                target.insert(k.clone(), v.clone());
            }
            check_len(interp.limits(), target.len())?;
            Value::None
        }
        _ => return Err(no_attribute("dict", name)),
    };
    Ok(value)
}

// ============================================================================
// match, secrets
// ============================================================================

fn match_method(
    m: &MatchData,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, Exception> {
    let func = format!("match.{name}");
    let text = |i: usize| m.groups[i].clone().map_or(Value::None, Value::str);
    let value = match name {
        "group" => {
            no_kwargs(&func, &kwargs)?;
            match args.as_slice() {
                [] => text(0),
                [one] => text(m.group_index(one)?),
                many => Value::tuple(
                    many.iter()
                        .map(|g| m.group_index(g).map(text))
                        .collect::<Result<_, _>>()?,
                ),
            }
        }
        "groups" => {
            bind(&func, &[], 0, args, kwargs)?;
            Value::tuple((1..m.groups.len()).map(text).collect())
        }
        "groupdict" => {
            bind(&func, &[], 0, args, kwargs)?;
            Value::dict(
                m.names
                    .iter()
                    .map(|(n, i)| (Key::Str(n.as_str().into()), text(*i)))
                    .collect(),
            )
        }
        "start" | "end" | "span" => {
            let mut slots = bind(&func, &["group"], 0, args, kwargs)?;
            let index = match slots[0].take() {
                Some(g) => m.group_index(&g)?,
                None => 0,
            };
            let (start, end) = m.spans[index].map_or((-1, -1), |(s, e)| (s as i64, e as i64));
            match name {
                "start" => Value::Int(start),
                "end" => Value::Int(end),
                _ => Value::tuple(vec![Value::Int(start), Value::Int(end)]),
            }
        }
        _ => return Err(no_attribute("match", name)),
    };
    Ok(value)
}

fn secrets_method(
    interp: &Interpreter,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, Exception> {
    let func = format!("secrets.{name}");
    match name {
        "get" => {
            let mut slots = bind(&func, &["key", "default"], 1, args, kwargs)?;
            let key = take(&mut slots, 0);
            let found = match &key {
                Value::Str(k) => interp.secrets().expose(k).map(Value::str),
                _ => None,
            };
            Ok(found.unwrap_or_else(|| take(&mut slots, 1)))
        }
        "keys" => {
            bind(&func, &[], 0, args, kwargs)?;
            Ok(Value::list(interp.secrets().keys().map(Value::str).collect()))
        }
        _ => Err(no_attribute("secrets", name)),
    }
}

fn no_attribute(type_name: &str, name: &str) -> Exception {
    Exception::attribute_error(format!("'{type_name}' object has no attribute '{name}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ExcKind;
    use crate::runtime::testing::{eval, eval_err, run};
    use serde_json::json;

    #[test]
    fn method_tables() {
        assert!(has_method(&Value::str("x"), "upper"));
        assert!(!has_method(&Value::str("x"), "format"));
        assert!(has_method(&Value::Http, "post"));
        assert!(!has_method(&Value::Int(1), "bit_length"));
    }

    #[test]
    fn string_methods() {
        assert_eq!(eval("'a,b,,c'.split(',')"), json!(["a", "b", "", "c"]));
        assert_eq!(eval("'  a  b '.split()"), json!(["a", "b"]));
        assert_eq!(eval("'a b c'.split(None, 1)"), json!(["a", "b c"]));
        assert_eq!(eval("'-'.join(['x', 'y'])"), json!("x-y"));
        assert_eq!(eval("'aaa'.replace('a', 'b', 2)"), json!("bba"));
        assert_eq!(eval("'xxhixx'.strip('x')"), json!("hi"));
        assert_eq!(eval("'héllo'.find('l')"), json!(2));
        assert_eq!(eval("'report.csv'.endswith(('.txt', '.csv'))"), json!(true));
        assert_eq!(eval_err("'a'.split('')").kind, ExcKind::ValueError);
        assert_eq!(eval_err("','.join([1])").kind, ExcKind::TypeError);
    }

    #[test]
    fn replace_checks_size_before_building() {
        let exc = eval_err("('a' * 1000).replace('a', 'b' * 100000)");
        assert_eq!(exc.kind, ExcKind::MemoryError);
    }

    #[test]
    fn list_methods_mutate_in_place() {
        let source = "\
def main():
    items = [3, 1, 2]
    items.append(0)
    items.sort()
    items.insert(0, 9)
    last = items.pop()
    items.remove(9)
    return [items, last, items.index(2), items.count(1)]
";
        assert_eq!(run(source).unwrap(), json!([[0, 1, 2], 3, 2, 1]));
        assert_eq!(eval_err("[].pop()").kind, ExcKind::IndexError);
        assert_eq!(eval_err("[1].index(5)").kind, ExcKind::ValueError);
    }

    #[test]
    fn dict_methods() {
        let source = "\
def main():
    d = {'a': 1}
    d.update({'b': 2}, c=3)
    d.setdefault('a', 100)
    gone = d.pop('b')
    return [d, gone, d.get('z', 0), d.keys(), d.items()]
";
        assert_eq!(
            run(source).unwrap(),
            json!([{"a": 1, "c": 3}, 2, 0, ["a", "c"], [["a", 1], ["c", 3]]])
        );
        assert_eq!(eval_err("{}.pop('k')").kind, ExcKind::KeyError);
    }
}
