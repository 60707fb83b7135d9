//! AST evaluation over `serde_json::Value`.
//!
//! Missing keys evaluate to `Null` rather than erroring; only structural
//! problems (unknown function, bad arity, wrong argument types) surface as
//! errors. Projections map over arrays and drop `Null` results.

use serde_json::Value;

use crate::QueryError;
use crate::functions::{FunctionRegistry, compare_values};
use crate::parser::{Ast, CmpOp};

pub fn eval(ast: &Ast, data: &Value, functions: &FunctionRegistry) -> Result<Value, QueryError> {
    match ast {
        Ast::Identity => Ok(data.clone()),
        Ast::Field(name) => Ok(data.get(name.as_str()).cloned().unwrap_or(Value::Null)),
        Ast::Literal(v) => Ok(v.clone()),
        Ast::Subexpr(lhs, rhs) => {
            let value = eval(lhs, data, functions)?;
            if value.is_null() {
                Ok(Value::Null)
            } else {
                eval(rhs, &value, functions)
            }
        }
        Ast::Index(lhs, idx) => {
            let value = eval(lhs, data, functions)?;
            let Value::Array(items) = value else {
                return Ok(Value::Null);
            };
            let i = if *idx < 0 {
                let back = idx.unsigned_abs() as usize;
                if back > items.len() {
                    return Ok(Value::Null);
                }
                items.len() - back
            } else {
                *idx as usize
            };
            Ok(items.into_iter().nth(i).unwrap_or(Value::Null))
        }
        Ast::Projection(lhs, rhs) => {
            let value = eval(lhs, data, functions)?;
            project(value, rhs, functions)
        }
        Ast::FlattenProjection(lhs, rhs) => {
            let value = eval(lhs, data, functions)?;
            let Value::Array(items) = value else {
                return Ok(Value::Null);
            };
            let mut flat = Vec::new();
            for item in items {
                match item {
                    Value::Array(inner) => flat.extend(inner),
                    Value::Null => {}
                    other => flat.push(other),
                }
            }
            project(Value::Array(flat), rhs, functions)
        }
        Ast::FilterProjection(lhs, cond, rhs) => {
            let value = eval(lhs, data, functions)?;
            let Value::Array(items) = value else {
                return Ok(Value::Null);
            };
            let mut kept = Vec::new();
            for item in items {
                if is_truthy(&eval(cond, &item, functions)?) {
                    let mapped = eval(rhs, &item, functions)?;
                    if !mapped.is_null() {
                        kept.push(mapped);
                    }
                }
            }
            Ok(Value::Array(kept))
        }
        Ast::Pipe(lhs, rhs) => {
            let value = eval(lhs, data, functions)?;
            eval(rhs, &value, functions)
        }
        Ast::Or(lhs, rhs) => {
            let value = eval(lhs, data, functions)?;
            if is_truthy(&value) {
                Ok(value)
            } else {
                eval(rhs, data, functions)
            }
        }
        Ast::Comparison(lhs, op, rhs) => {
            let left = eval(lhs, data, functions)?;
            let right = eval(rhs, data, functions)?;
            Ok(compare(&left, op, &right))
        }
        Ast::Function(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, data, functions)?);
            }
            functions.call(name, &values)
        }
    }
}

fn project(value: Value, rhs: &Ast, functions: &FunctionRegistry) -> Result<Value, QueryError> {
    let Value::Array(items) = value else {
        return Ok(Value::Null);
    };
    let mut out = Vec::new();
    for item in items {
        let mapped = eval(rhs, &item, functions)?;
        if !mapped.is_null() {
            out.push(mapped);
        }
    }
    Ok(Value::Array(out))
}

fn compare(left: &Value, op: &CmpOp, right: &Value) -> Value {
    match op {
        CmpOp::Eq => Value::Bool(left == right),
        CmpOp::Ne => Value::Bool(left != right),
        // Ordered comparison is defined for numbers and strings; anything
        // else yields null, which is falsy.
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let comparable = (left.is_number() && right.is_number())
                || (left.is_string() && right.is_string());
            if !comparable {
                return Value::Null;
            }
            let ord = compare_values(left, right);
            let result = match op {
                CmpOp::Lt => ord.is_lt(),
                CmpOp::Le => ord.is_le(),
                CmpOp::Gt => ord.is_gt(),
                CmpOp::Ge => ord.is_ge(),
                _ => unreachable!(),
            };
            Value::Bool(result)
        }
    }
}

/// Truthiness: null, false, empty string, empty array and empty object are
/// falsy; everything else is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => true,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
