//! External trigger events.
//!
//! An event is the payload that arrives with a push-mode invocation: a
//! cloud audit-log entry, an HTTP body, or a scheduled-trigger envelope.
//! Like resources it stays an opaque mapping; modes pull resource
//! identifiers out of it with key expressions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Value);

impl Event {
    pub fn new(value: Value) -> Self {
        Event(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Dotted-path lookup for the common envelope fields (`detail.region`,
    /// `account`). Modes needing full expressions compile them instead.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut cursor = &self.0;
        for part in path.split('.') {
            cursor = cursor.get(part)?;
        }
        Some(cursor)
    }
}

impl From<Value> for Event {
    fn from(value: Value) -> Self {
        Event::new(value)
    }
}
