//! # warden-query
//!
//! The key-expression language Warden filters use to address values inside
//! resource documents. The grammar is the familiar JMESPath-style path
//! syntax:
//!
//! - dotted descent: `State.Name`, quoted keys: `"aws:ec2".Name`
//! - indexes: `NetworkInterfaces[0]`, negative from the end
//! - projections: `Instances[*].InstanceId`, flatten: `Reservations[]`
//! - filter projections: `Tags[?Key=='Env'].Value`
//! - pipes and or-defaults: `Tags[?Key=='Env'].Value | [0]`, `Name || Id`
//! - function calls against a pluggable registry: `length(Tags)`,
//!   `split(Name, '-')`
//!
//! Missing keys evaluate to null; compile once, search many.

mod eval;
mod functions;
mod lexer;
mod parser;

use serde_json::Value;
use thiserror::Error;

pub use eval::is_truthy;
pub use functions::{Function, FunctionRegistry};
pub use parser::{Ast, CmpOp};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    #[error("parse error at offset {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    #[error("{function}() expects {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("{function}() expects {expected}")]
    Type { function: String, expected: String },
}

impl QueryError {
    pub(crate) fn type_error(function: &str, expected: &str) -> Self {
        QueryError::Type {
            function: function.to_string(),
            expected: expected.to_string(),
        }
    }
}

/// A compiled key expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    source: String,
    ast: Ast,
}

impl Query {
    pub fn compile(source: &str) -> Result<Self, QueryError> {
        Ok(Self {
            source: source.to_string(),
            ast: parser::Parser::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `data` with the built-in functions.
    pub fn search(&self, data: &Value) -> Result<Value, QueryError> {
        self.search_with(data, &FunctionRegistry::builtins())
    }

    /// Evaluate against `data` with a caller-supplied function registry.
    pub fn search_with(
        &self,
        data: &Value,
        functions: &FunctionRegistry,
    ) -> Result<Value, QueryError> {
        eval::eval(&self.ast, data, functions)
    }
}

/// One-shot convenience: compile and search.
pub fn search(expression: &str, data: &Value) -> Result<Value, QueryError> {
    Query::compile(expression)?.search(data)
}
