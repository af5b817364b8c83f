use rand::Rng;
use rand::seq::SliceRandom;

use super::{ModuleContext, NativeModule, unknown_attribute};
use crate::runtime::args::{bind, expect_int, take};
use crate::runtime::{Exception, Value};

pub(crate) struct RandomModule;

const EXPORTS: &[&str] = &["random", "randint", "choice", "shuffle"];

impl NativeModule for RandomModule {
    fn name(&self) -> &'static str {
        "random"
    }

    fn exports(&self) -> &'static [&'static str] {
        EXPORTS
    }

    fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        _cx: &mut ModuleContext<'_>,
    ) -> Result<Value, Exception> {
        let mut rng = rand::thread_rng();
        match name {
            "random" => {
                bind(name, &[], 0, args, kwargs)?;
                Ok(Value::Float(rng.gen_range(0.0..1.0)))
            }
            "randint" => {
                let mut slots = bind(name, &["a", "b"], 2, args, kwargs)?;
                let a = expect_int(&take(&mut slots, 0), name)?;
                let b = expect_int(&take(&mut slots, 1), name)?;
                if a > b {
                    return Err(Exception::value_error(format!(
                        "empty range for randint({a}, {b})"
                    )));
                }
                Ok(Value::Int(rng.gen_range(a..=b)))
            }
            "choice" => {
                let mut slots = bind(name, &["seq"], 1, args, kwargs)?;
                let picked = match take(&mut slots, 0) {
                    Value::List(items) => items.borrow().choose(&mut rng).cloned(),
                    Value::Tuple(items) => items.choose(&mut rng).cloned(),
                    Value::Str(s) => {
                        let chars: Vec<char> = s.chars().collect();
                        chars.choose(&mut rng).map(|c| Value::str(c.to_string()))
                    }
                    other => {
                        return Err(Exception::type_error(format!(
                            "choice() expected a sequence, got {}",
                            other.type_name()
                        )));
                    }
                };
                picked.ok_or_else(|| Exception::index_error("cannot choose from an empty sequence"))
            }
            "shuffle" => {
                let mut slots = bind(name, &["x"], 1, args, kwargs)?;
                match take(&mut slots, 0) {
                    Value::List(items) => {
                        items.borrow_mut().shuffle(&mut rng);
                        Ok(Value::None)
                    }
                    other => Err(Exception::type_error(format!(
                        "shuffle() expected a list, got {}",
                        other.type_name()
                    ))),
                }
            }
            _ => Err(unknown_attribute(self.name(), name)),
        }
    }
}
