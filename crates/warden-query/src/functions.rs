//! Built-in and user-registered functions.
//!
//! The engine exposes a pluggable function registry so providers and
//! policies can extend the expression language (`split`, `merge`,
//! `parse_date`, ...). Builtins cover the small set the core filters rely
//! on.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{QueryError, is_truthy};

pub type Function = Arc<dyn Fn(&[Value]) -> Result<Value, QueryError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Function>,
}

impl FunctionRegistry {
    /// Empty registry; `builtins()` is usually the right starting point.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with the built-in functions.
    pub fn builtins() -> Self {
        let mut reg = Self::new();
        reg.register("length", |args| {
            expect_arity("length", args, 1)?;
            let n = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                Value::Null => return Ok(Value::Null),
                _ => return Err(QueryError::type_error("length", "string, array or object")),
            };
            Ok(Value::from(n))
        });
        reg.register("contains", |args| {
            expect_arity("contains", args, 2)?;
            let found = match (&args[0], &args[1]) {
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                (Value::Array(a), needle) => a.contains(needle),
                (Value::Null, _) => false,
                _ => return Err(QueryError::type_error("contains", "string or array subject")),
            };
            Ok(Value::Bool(found))
        });
        reg.register("starts_with", |args| {
            expect_arity("starts_with", args, 2)?;
            str_pair("starts_with", args).map(|(s, p)| Value::Bool(s.starts_with(p)))
        });
        reg.register("ends_with", |args| {
            expect_arity("ends_with", args, 2)?;
            str_pair("ends_with", args).map(|(s, p)| Value::Bool(s.ends_with(p)))
        });
        reg.register("split", |args| {
            expect_arity("split", args, 2)?;
            let (s, sep) = str_pair("split", args)?;
            Ok(Value::Array(
                s.split(sep).map(|p| Value::String(p.to_string())).collect(),
            ))
        });
        reg.register("join", |args| {
            expect_arity("join", args, 2)?;
            let Value::String(sep) = &args[0] else {
                return Err(QueryError::type_error("join", "string separator"));
            };
            let Value::Array(parts) = &args[1] else {
                return Err(QueryError::type_error("join", "array of strings"));
            };
            let strings: Result<Vec<&str>, _> = parts
                .iter()
                .map(|p| {
                    p.as_str()
                        .ok_or_else(|| QueryError::type_error("join", "array of strings"))
                })
                .collect();
            Ok(Value::String(strings?.join(sep)))
        });
        reg.register("merge", |args| {
            if args.is_empty() {
                return Err(QueryError::Arity {
                    function: "merge".to_string(),
                    expected: 1,
                    got: 0,
                });
            }
            let mut merged = Map::new();
            for arg in args {
                let Value::Object(o) = arg else {
                    return Err(QueryError::type_error("merge", "objects"));
                };
                for (k, v) in o {
                    merged.insert(k.clone(), v.clone());
                }
            }
            Ok(Value::Object(merged))
        });
        reg.register("keys", |args| {
            expect_arity("keys", args, 1)?;
            let Value::Object(o) = &args[0] else {
                return Err(QueryError::type_error("keys", "object"));
            };
            Ok(Value::Array(
                o.keys().map(|k| Value::String(k.clone())).collect(),
            ))
        });
        reg.register("values", |args| {
            expect_arity("values", args, 1)?;
            let Value::Object(o) = &args[0] else {
                return Err(QueryError::type_error("values", "object"));
            };
            Ok(Value::Array(o.values().cloned().collect()))
        });
        reg.register("type", |args| {
            expect_arity("type", args, 1)?;
            let name = match &args[0] {
                Value::Null => "null",
                Value::Bool(_) => "boolean",
                Value::Number(_) => "number",
                Value::String(_) => "string",
                Value::Array(_) => "array",
                Value::Object(_) => "object",
            };
            Ok(Value::String(name.to_string()))
        });
        reg.register("to_string", |args| {
            expect_arity("to_string", args, 1)?;
            Ok(match &args[0] {
                Value::String(s) => Value::String(s.clone()),
                other => Value::String(other.to_string()),
            })
        });
        reg.register("to_number", |args| {
            expect_arity("to_number", args, 1)?;
            Ok(match &args[0] {
                Value::Number(n) => Value::Number(n.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            })
        });
        reg.register("not_null", |args| {
            for arg in args {
                if !arg.is_null() {
                    return Ok(arg.clone());
                }
            }
            Ok(Value::Null)
        });
        reg.register("sort", |args| {
            expect_arity("sort", args, 1)?;
            let Value::Array(items) = &args[0] else {
                return Err(QueryError::type_error("sort", "array"));
            };
            let mut sorted = items.clone();
            sorted.sort_by(compare_values);
            Ok(Value::Array(sorted))
        });
        reg.register("min", |args| {
            expect_arity("min", args, 1)?;
            array_extreme("min", &args[0], std::cmp::Ordering::Less)
        });
        reg.register("max", |args| {
            expect_arity("max", args, 1)?;
            array_extreme("max", &args[0], std::cmp::Ordering::Greater)
        });
        reg.register("not", |args| {
            expect_arity("not", args, 1)?;
            Ok(Value::Bool(!is_truthy(&args[0])))
        });
        reg
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&[Value]) -> Result<Value, QueryError> + Send + Sync + 'static,
    ) {
        self.functions.insert(name.into(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, QueryError> {
        let f = self
            .get(name)
            .ok_or_else(|| QueryError::UnknownFunction(name.to_string()))?;
        f(args)
    }
}

fn expect_arity(function: &str, args: &[Value], expected: usize) -> Result<(), QueryError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(QueryError::Arity {
            function: function.to_string(),
            expected,
            got: args.len(),
        })
    }
}

fn str_pair<'a>(function: &str, args: &'a [Value]) -> Result<(&'a str, &'a str), QueryError> {
    match (&args[0], &args[1]) {
        (Value::String(a), Value::String(b)) => Ok((a, b)),
        _ => Err(QueryError::type_error(function, "two strings")),
    }
}

fn array_extreme(function: &str, arg: &Value, keep: std::cmp::Ordering) -> Result<Value, QueryError> {
    let Value::Array(items) = arg else {
        return Err(QueryError::type_error(function, "array"));
    };
    let mut best: Option<&Value> = None;
    for item in items {
        best = match best {
            None => Some(item),
            Some(current) => {
                if compare_values(item, current) == keep {
                    Some(item)
                } else {
                    Some(current)
                }
            }
        };
    }
    Ok(best.cloned().unwrap_or(Value::Null))
}

/// Total order over scalar values: numbers before strings, everything else
/// compared by serialized form.
pub(crate) fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => x.cmp(y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn length_over_shapes() {
        let reg = FunctionRegistry::builtins();
        assert_eq!(reg.call("length", &[json!("abc")]).unwrap(), json!(3));
        assert_eq!(reg.call("length", &[json!([1, 2])]).unwrap(), json!(2));
        assert_eq!(reg.call("length", &[json!(null)]).unwrap(), json!(null));
        assert!(reg.call("length", &[json!(5)]).is_err());
    }

    #[test]
    fn split_and_join_invert() {
        let reg = FunctionRegistry::builtins();
        let parts = reg.call("split", &[json!("a-b-c"), json!("-")]).unwrap();
        assert_eq!(parts, json!(["a", "b", "c"]));
        let joined = reg.call("join", &[json!("-"), parts]).unwrap();
        assert_eq!(joined, json!("a-b-c"));
    }

    #[test]
    fn merge_later_wins() {
        let reg = FunctionRegistry::builtins();
        let merged = reg
            .call("merge", &[json!({"a": 1, "b": 1}), json!({"b": 2})])
            .unwrap();
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn custom_function_registration() {
        let mut reg = FunctionRegistry::builtins();
        reg.register("double", |args| {
            Ok(json!(args[0].as_f64().unwrap_or(0.0) * 2.0))
        });
        assert_eq!(reg.call("double", &[json!(21)]).unwrap(), json!(42.0));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let reg = FunctionRegistry::builtins();
        assert!(matches!(
            reg.call("nope", &[]),
            Err(QueryError::UnknownFunction(_))
        ));
    }
}
