//! The value matcher: `{key, op, value, value_type}` evaluated against a
//! document.
//!
//! The key is a key expression resolved against the resource (or, for the
//! event filter, against the triggering event). The special prefix `tag:X`
//! selects the value of tag `X` from the resource's tag list. Both sides of
//! the comparison pass through an optional `value_type` coercion first.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use globset::{Glob, GlobMatcher};
use ipnet::IpNet;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::net::IpAddr;
use std::str::FromStr;

use warden_core::error::PolicyError;
use warden_query::{FunctionRegistry, Query, is_truthy};

/// Comparison operators. Aliases accepted in policy files are normalized
/// here (`equal` → `eq`, `gte` → `ge`, `ni` → `not-in`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    NotIn,
    Contains,
    Regex,
    RegexCase,
    Glob,
    Intersect,
    Difference,
    Mod,
    Absent,
    Present,
    Empty,
    NotNull,
    Match,
}

impl FromStr for Op {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, PolicyError> {
        Ok(match s {
            "eq" | "equal" => Op::Eq,
            "ne" | "not-equal" => Op::Ne,
            "gt" | "greater-than" => Op::Gt,
            "ge" | "gte" => Op::Ge,
            "lt" | "less-than" => Op::Lt,
            "le" | "lte" => Op::Le,
            "in" => Op::In,
            "not-in" | "ni" => Op::NotIn,
            "contains" => Op::Contains,
            "regex" => Op::Regex,
            "regex-case" => Op::RegexCase,
            "glob" => Op::Glob,
            "intersect" => Op::Intersect,
            "difference" => Op::Difference,
            "mod" => Op::Mod,
            "absent" => Op::Absent,
            "present" => Op::Present,
            "empty" => Op::Empty,
            "not-null" => Op::NotNull,
            "match" => Op::Match,
            other => {
                return Err(PolicyError::invalid(format!("unknown op {other:?}")));
            }
        })
    }
}

impl Op {
    pub const NAMES: &'static [&'static str] = &[
        "eq", "equal", "ne", "not-equal", "gt", "greater-than", "ge", "gte", "lt", "less-than",
        "le", "lte", "in", "not-in", "ni", "contains", "regex", "regex-case", "glob", "intersect",
        "difference", "mod", "absent", "present", "empty", "not-null", "match",
    ];

    /// Ops that compare against a declared value (as opposed to testing
    /// mere presence or truthiness of the key).
    fn needs_value(self) -> bool {
        !matches!(
            self,
            Op::Absent | Op::Present | Op::Empty | Op::NotNull | Op::Match
        )
    }
}

/// Coercions applied to both operands before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Resource date → age in days from now (UTC).
    Age,
    /// Resource value → integer, unparseable → 0.
    Integer,
    /// Resource value → element/character count.
    Size,
    /// CIDR containment/equality semantics.
    Cidr,
    /// Resource CIDR → prefix length.
    CidrSize,
    /// Resource string → trimmed lowercase.
    Normalize,
    /// Swap operands, giving `in` its "declared value inside resource
    /// list" reading.
    Swap,
    /// Resource date → days until expiry (negative when past).
    Expiration,
    /// Set-level: compare the size of the result set, not one resource.
    ResourceCount,
    /// Both sides parsed as dates and compared as instants.
    Date,
}

impl FromStr for ValueType {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, PolicyError> {
        Ok(match s {
            "age" => ValueType::Age,
            "integer" => ValueType::Integer,
            "size" => ValueType::Size,
            "cidr" => ValueType::Cidr,
            "cidr_size" => ValueType::CidrSize,
            "normalize" => ValueType::Normalize,
            "swap" => ValueType::Swap,
            "expiration" => ValueType::Expiration,
            "resource_count" => ValueType::ResourceCount,
            "date" => ValueType::Date,
            other => {
                return Err(PolicyError::invalid(format!(
                    "unknown value_type {other:?}"
                )));
            }
        })
    }
}

impl ValueType {
    pub const NAMES: &'static [&'static str] = &[
        "age", "integer", "size", "cidr", "cidr_size", "normalize", "swap", "expiration",
        "resource_count", "date",
    ];
}

/// A compiled `{key, op, value, value_type}` predicate.
#[derive(Debug, Clone)]
pub struct ValueMatch {
    pub key: String,
    /// Compiled key expression; `None` for `tag:` keys.
    query: Option<Query>,
    /// Set when the key uses the `tag:X` shorthand.
    tag_key: Option<String>,
    pub op: Option<Op>,
    pub value: Option<Value>,
    pub value_type: Option<ValueType>,
    regex: Option<Regex>,
    glob: Option<GlobMatcher>,
}

impl ValueMatch {
    /// Build from normalized filter config. Errors carry enough context to
    /// surface during validation, before any execution.
    pub fn from_config(data: &Value) -> Result<Self, PolicyError> {
        let key = data
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| PolicyError::invalid("value filter requires a string key"))?
            .to_string();

        let op = data
            .get("op")
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| PolicyError::invalid("op must be a string"))
                    .and_then(Op::from_str)
            })
            .transpose()?;

        let value_type = data
            .get("value_type")
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| PolicyError::invalid("value_type must be a string"))
                    .and_then(ValueType::from_str)
            })
            .transpose()?;

        let value = data.get("value").cloned();

        if let Some(op) = op {
            if op.needs_value() && value.is_none() {
                return Err(PolicyError::invalid(format!(
                    "op {op:?} requires a value"
                )));
            }
        }

        let (query, tag_key) = match key.strip_prefix("tag:") {
            Some(tag) => (None, Some(tag.to_string())),
            None => {
                let q = Query::compile(&key).map_err(|e| {
                    PolicyError::invalid(format!("invalid key expression {key:?}: {e}"))
                })?;
                (Some(q), None)
            }
        };

        let mut regex = None;
        let mut glob = None;
        match op {
            Some(Op::Regex) | Some(Op::RegexCase) => {
                let pattern = value.as_ref().and_then(Value::as_str).ok_or_else(|| {
                    PolicyError::invalid("regex op requires a string value")
                })?;
                regex = Some(
                    RegexBuilder::new(pattern)
                        .case_insensitive(op == Some(Op::Regex))
                        .build()
                        .map_err(|e| {
                            PolicyError::invalid(format!("invalid regex {pattern:?}: {e}"))
                        })?,
                );
            }
            Some(Op::Glob) => {
                let pattern = value.as_ref().and_then(Value::as_str).ok_or_else(|| {
                    PolicyError::invalid("glob op requires a string value")
                })?;
                glob = Some(
                    Glob::new(pattern)
                        .map_err(|e| {
                            PolicyError::invalid(format!("invalid glob {pattern:?}: {e}"))
                        })?
                        .compile_matcher(),
                );
            }
            _ => {}
        }

        Ok(Self {
            key,
            query,
            tag_key,
            op,
            value,
            value_type,
            regex,
            glob,
        })
    }

    /// Resolve the key against `doc`. Missing keys resolve to null.
    pub fn resolve(
        &self,
        doc: &Value,
        tag_attr: &str,
        functions: &FunctionRegistry,
    ) -> Result<Value, PolicyError> {
        if let Some(tag) = &self.tag_key {
            let tags = doc.get(tag_attr).and_then(Value::as_array);
            let found = tags.and_then(|list| {
                list.iter()
                    .find(|t| t.get("Key").and_then(Value::as_str) == Some(tag.as_str()))
                    .and_then(|t| t.get("Value").cloned())
            });
            return Ok(found.unwrap_or(Value::Null));
        }
        let query = self.query.as_ref().unwrap_or_else(|| unreachable!());
        query
            .search_with(doc, functions)
            .map_err(|e| PolicyError::execution(format!("evaluating {:?}: {e}", self.key)))
    }

    /// Full predicate: resolve, coerce, compare.
    pub fn matches_doc(
        &self,
        doc: &Value,
        tag_attr: &str,
        now: DateTime<Utc>,
        functions: &FunctionRegistry,
    ) -> Result<bool, PolicyError> {
        if self.value_type == Some(ValueType::ResourceCount) {
            return Err(PolicyError::execution(
                "resource_count applies across the result set, not per resource",
            ));
        }
        let resolved = self.resolve(doc, tag_attr, functions)?;
        self.compare(resolved, now)
    }

    /// Compare a resolved value. Public so the set-level `resource_count`
    /// path can feed a synthetic count in.
    pub fn compare(&self, resolved: Value, now: DateTime<Utc>) -> Result<bool, PolicyError> {
        let op = match self.op {
            Some(op) => op,
            // No op: equality when a value was declared, truthiness
            // otherwise.
            None => {
                if self.value.is_some() {
                    Op::Eq
                } else {
                    Op::Match
                }
            }
        };

        match op {
            Op::Absent => return Ok(resolved.is_null()),
            Op::Present | Op::NotNull => return Ok(!resolved.is_null()),
            Op::Empty => return Ok(is_empty(&resolved)),
            Op::Match => return Ok(is_truthy(&resolved)),
            _ => {}
        }

        let sentinel = self
            .value
            .clone()
            .ok_or_else(|| PolicyError::invalid(format!("op {op:?} requires a value")))?;

        if self.value_type == Some(ValueType::Cidr) {
            return Ok(cidr_compare(op, &sentinel, &resolved));
        }

        let (sentinel, resolved) = self.coerce(sentinel, resolved, now);

        Ok(match op {
            Op::Eq => values_equal(&sentinel, &resolved),
            Op::Ne => !values_equal(&sentinel, &resolved),
            Op::Gt | Op::Ge | Op::Lt | Op::Le => ordered(op, &sentinel, &resolved),
            Op::In => member_of(&sentinel, &resolved),
            Op::NotIn => !member_of(&sentinel, &resolved),
            Op::Contains => contains(&resolved, &sentinel),
            Op::Regex | Op::RegexCase => {
                let re = self.regex.as_ref().unwrap_or_else(|| unreachable!());
                resolved.as_str().is_some_and(|s| re.is_match(s))
            }
            Op::Glob => {
                let matcher = self.glob.as_ref().unwrap_or_else(|| unreachable!());
                resolved.as_str().is_some_and(|s| matcher.is_match(s))
            }
            Op::Intersect => intersects(&sentinel, &resolved),
            Op::Difference => difference_nonempty(&sentinel, &resolved),
            Op::Mod => modulo(&sentinel, &resolved),
            Op::Absent | Op::Present | Op::Empty | Op::NotNull | Op::Match => unreachable!(),
        })
    }

    /// Apply the declared value-type coercion to both operands.
    fn coerce(&self, sentinel: Value, resolved: Value, now: DateTime<Utc>) -> (Value, Value) {
        match self.value_type {
            None => (sentinel, resolved),
            Some(ValueType::Age) => {
                let age = parse_date(&resolved)
                    .map(|d| days_between(d, now))
                    .map(number)
                    .unwrap_or(Value::Null);
                (number_of(&sentinel), age)
            }
            Some(ValueType::Expiration) => {
                let left = parse_date(&resolved)
                    .map(|d| days_between(now, d))
                    .map(number)
                    .unwrap_or(Value::Null);
                (number_of(&sentinel), left)
            }
            Some(ValueType::Date) => {
                let coerce_one = |v: &Value| {
                    parse_date(v)
                        .map(|d| number(d.timestamp() as f64))
                        .unwrap_or(Value::Null)
                };
                (coerce_one(&sentinel), coerce_one(&resolved))
            }
            Some(ValueType::Integer) => {
                let as_int = |v: &Value| match v {
                    Value::Number(n) => Value::from(n.as_f64().unwrap_or(0.0) as i64),
                    Value::String(s) => Value::from(s.trim().parse::<i64>().unwrap_or(0)),
                    _ => Value::from(0),
                };
                let coerced = as_int(&resolved);
                (sentinel, coerced)
            }
            Some(ValueType::Size) => {
                let size = match &resolved {
                    Value::Array(a) => Value::from(a.len()),
                    Value::Object(o) => Value::from(o.len()),
                    Value::String(s) => Value::from(s.chars().count()),
                    Value::Null => Value::from(0),
                    _ => Value::Null,
                };
                (sentinel, size)
            }
            Some(ValueType::Normalize) => {
                let normalized = match &resolved {
                    Value::String(s) => Value::String(s.trim().to_lowercase()),
                    other => other.clone(),
                };
                (sentinel, normalized)
            }
            Some(ValueType::Swap) => (resolved, sentinel),
            Some(ValueType::CidrSize) => {
                let size = resolved
                    .as_str()
                    .and_then(|s| s.parse::<IpNet>().ok())
                    .map(|net| Value::from(net.prefix_len()))
                    .unwrap_or(Value::Null);
                (sentinel, size)
            }
            // Handled before coercion.
            Some(ValueType::Cidr) | Some(ValueType::ResourceCount) => (sentinel, resolved),
        }
    }
}

fn number(f: f64) -> Value {
    serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn number_of(v: &Value) -> Value {
    match v {
        Value::Number(_) => v.clone(),
        Value::String(s) => s.trim().parse::<f64>().map(number).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 86_400.0
}

/// Numeric-aware equality: `1` equals `1.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordered comparison of the resolved value against the sentinel. Any
/// operand that is undefined or unordered yields false.
fn ordered(op: Op, sentinel: &Value, resolved: &Value) -> bool {
    let ord = match (resolved.as_f64(), sentinel.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (resolved.as_str(), sentinel.as_str()) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        },
    };
    let Some(ord) = ord else { return false };
    match op {
        Op::Gt => ord.is_gt(),
        Op::Ge => ord.is_ge(),
        Op::Lt => ord.is_lt(),
        Op::Le => ord.is_le(),
        _ => false,
    }
}

/// `resolved ∈ sentinel-list`.
fn member_of(sentinel: &Value, resolved: &Value) -> bool {
    match sentinel {
        Value::Array(list) => list.iter().any(|s| values_equal(s, resolved)),
        Value::String(s) => resolved.as_str().is_some_and(|r| s.contains(r)),
        _ => false,
    }
}

/// `sentinel ∈ resolved` (string substring or array membership).
fn contains(resolved: &Value, sentinel: &Value) -> bool {
    match resolved {
        Value::Array(list) => list.iter().any(|r| values_equal(r, sentinel)),
        Value::String(s) => sentinel.as_str().is_some_and(|needle| s.contains(needle)),
        _ => false,
    }
}

fn intersects(sentinel: &Value, resolved: &Value) -> bool {
    match (sentinel, resolved) {
        (Value::Array(a), Value::Array(b)) => {
            b.iter().any(|r| a.iter().any(|s| values_equal(s, r)))
        }
        _ => false,
    }
}

/// True when the resolved set has at least one element outside the
/// sentinel set.
fn difference_nonempty(sentinel: &Value, resolved: &Value) -> bool {
    match (sentinel, resolved) {
        (Value::Array(a), Value::Array(b)) => {
            b.iter().any(|r| !a.iter().any(|s| values_equal(s, r)))
        }
        _ => false,
    }
}

/// Modulo compare: sentinel `[divisor, remainder]`, or a bare divisor
/// meaning remainder zero.
fn modulo(sentinel: &Value, resolved: &Value) -> bool {
    let Some(value) = resolved.as_i64() else {
        return false;
    };
    let (divisor, remainder) = match sentinel {
        Value::Array(pair) if pair.len() == 2 => {
            match (pair[0].as_i64(), pair[1].as_i64()) {
                (Some(d), Some(r)) => (d, r),
                _ => return false,
            }
        }
        Value::Number(_) => match sentinel.as_i64() {
            Some(d) => (d, 0),
            None => return false,
        },
        _ => return false,
    };
    divisor != 0 && value.rem_euclid(divisor) == remainder
}

fn cidr_compare(op: Op, sentinel: &Value, resolved: &Value) -> bool {
    let nets: Vec<IpNet> = match sentinel {
        Value::String(s) => parse_net(s).into_iter().collect(),
        Value::Array(list) => list
            .iter()
            .filter_map(|v| v.as_str())
            .filter_map(parse_net)
            .collect(),
        _ => return false,
    };
    let Some(target) = resolved.as_str() else {
        return false;
    };
    let inside = if let Ok(addr) = target.parse::<IpAddr>() {
        nets.iter().any(|net| net.contains(&addr))
    } else if let Some(net) = parse_net(target) {
        nets.iter().any(|outer| outer.contains(&net))
    } else {
        return false;
    };
    match op {
        Op::In | Op::Contains => inside,
        Op::NotIn => !inside,
        Op::Eq => parse_net(target).is_some_and(|n| nets.contains(&n)),
        Op::Ne => !parse_net(target).is_some_and(|n| nets.contains(&n)),
        _ => false,
    }
}

fn parse_net(s: &str) -> Option<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Some(net);
    }
    // Bare address: treat as a host network.
    s.parse::<IpAddr>().ok().map(IpNet::from)
}

/// Empty per the matcher: undefined, null, empty string or collection.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Lenient date parsing over the formats cloud APIs and tag encodings use:
/// RFC 3339, bare dates with `-` or `/`, the deferred-op stamp format, and
/// epoch seconds or milliseconds.
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let epoch = n.as_f64()?;
            // Heuristic: values past the year 33658 are milliseconds.
            let secs = if epoch.abs() >= 1e12 { epoch / 1000.0 } else { epoch };
            Utc.timestamp_opt(secs as i64, 0).single()
        }
        Value::String(s) => parse_date_str(s.trim()),
        _ => None,
    }
}

pub fn parse_date_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H%M UTC"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}
