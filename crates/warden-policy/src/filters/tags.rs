//! Tag-driven filters: deferred-operation matching and tag counting.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};

use warden_core::error::PolicyError;
use warden_core::event::Event;
use warden_core::resource::Resource;

use super::{Filter, FilterContext};
use crate::value::{Op, parse_date_str};

/// Tag used by `mark-for-op` / `marked-for-op` unless overridden.
pub const DEFAULT_OP_TAG: &str = "warden_status";

/// Parse a deferred-op stamp of the form `msg: op@date`. The message part
/// is optional; the date is `%Y/%m/%d` or `%Y/%m/%d %H%M UTC`.
pub fn parse_op_stamp(value: &str) -> Option<(String, DateTime<Utc>)> {
    let tail = match value.rsplit_once(": ") {
        Some((_, tail)) => tail,
        None => value,
    };
    let (op, date) = tail.split_once('@')?;
    Some((op.trim().to_string(), parse_date_str(date.trim())?))
}

/// Selects resources previously marked for `op` whose due date has passed
/// (optionally skewed into the future by `skew` days).
pub struct MarkedForOpFilter {
    op: String,
    tag: String,
    skew_days: i64,
    skew_hours: i64,
}

impl MarkedForOpFilter {
    pub fn from_config(data: &Value) -> Result<Self, PolicyError> {
        let op = data
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| PolicyError::invalid("marked-for-op requires an op"))?
            .to_string();
        Ok(Self {
            op,
            tag: data
                .get("tag")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_OP_TAG)
                .to_string(),
            skew_days: data.get("skew").and_then(Value::as_i64).unwrap_or(0),
            skew_hours: data.get("skew_hours").and_then(Value::as_i64).unwrap_or(0),
        })
    }
}

impl Filter for MarkedForOpFilter {
    fn name(&self) -> &str {
        "marked-for-op"
    }

    fn matches(
        &self,
        resource: &mut Resource,
        _event: Option<&Event>,
        fctx: &FilterContext,
    ) -> Result<bool, PolicyError> {
        let Some(stamp) = resource.tag(&fctx.type_def.tag_attr, &self.tag) else {
            return Ok(false);
        };
        let Some((op, due)) = parse_op_stamp(stamp) else {
            tracing::warn!(
                policy = %fctx.ctx.policy_name,
                tag = %self.tag,
                stamp = %stamp,
                "unparseable deferred-op stamp"
            );
            return Ok(false);
        };
        if op != self.op {
            return Ok(false);
        }
        let horizon =
            fctx.ctx.now() + Duration::days(self.skew_days) + Duration::hours(self.skew_hours);
        Ok(due <= horizon)
    }
}

pub(super) fn marked_for_op_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["type", "op"],
        "properties": {
            "type": {"enum": ["marked-for-op"]},
            "op": {"type": "string"},
            "tag": {"type": "string"},
            "skew": {"type": "number", "minimum": 0},
            "skew_hours": {"type": "number", "minimum": 0},
        },
    })
}

/// Compares the number of (non-engine) tags on a resource.
pub struct TagCountFilter {
    count: i64,
    op: Op,
}

impl TagCountFilter {
    pub fn from_config(data: &Value) -> Result<Self, PolicyError> {
        let count = data
            .get("count")
            .and_then(Value::as_i64)
            .ok_or_else(|| PolicyError::invalid("tag-count requires a count"))?;
        let op = match data.get("op").and_then(Value::as_str) {
            Some(s) => s.parse()?,
            None => Op::Ge,
        };
        Ok(Self { count, op })
    }
}

impl Filter for TagCountFilter {
    fn name(&self) -> &str {
        "tag-count"
    }

    fn matches(
        &self,
        resource: &mut Resource,
        _event: Option<&Event>,
        fctx: &FilterContext,
    ) -> Result<bool, PolicyError> {
        let count = resource.tag_count(&fctx.type_def.tag_attr, false) as i64;
        Ok(match self.op {
            Op::Eq => count == self.count,
            Op::Ne => count != self.count,
            Op::Gt => count > self.count,
            Op::Ge => count >= self.count,
            Op::Lt => count < self.count,
            Op::Le => count <= self.count,
            _ => {
                return Err(PolicyError::invalid(
                    "tag-count supports only ordering and equality ops",
                ));
            }
        })
    }
}

pub(super) fn tag_count_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["type", "count"],
        "properties": {
            "type": {"enum": ["tag-count"]},
            "count": {"type": "integer", "minimum": 0},
            "op": {"enum": ["eq", "ne", "gt", "ge", "gte", "lt", "le", "lte"]},
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_core::context::{Clock, ExecutionContext};
    use warden_core::resource::ResourceTypeDef;
    use warden_query::FunctionRegistry;

    fn context_at(now: &str) -> ExecutionContext {
        let mut ctx = ExecutionContext::ephemeral("test", "ec2");
        ctx.clock = Clock::Fixed(now.parse().unwrap());
        ctx
    }

    fn run(filter: &dyn Filter, ctx: &ExecutionContext, resource: Value) -> bool {
        let type_def = ResourceTypeDef::new("ec2", "ec2", "Id", "DescribeInstances", "[]");
        let functions = FunctionRegistry::builtins();
        let fctx = FilterContext {
            ctx,
            type_def: &type_def,
            functions: &functions,
            client: None,
        };
        let mut r = Resource::new(resource);
        filter.matches(&mut r, None, &fctx).unwrap()
    }

    #[test]
    fn stamp_parsing() {
        let (op, due) = parse_op_stamp("Resource does not meet policy: delete@2026/03/04").unwrap();
        assert_eq!(op, "delete");
        assert_eq!(due, "2026-03-04T00:00:00Z".parse::<DateTime<Utc>>().unwrap());

        let (op, due) = parse_op_stamp("stop@2026/03/04 1800 UTC").unwrap();
        assert_eq!(op, "stop");
        assert_eq!(due, "2026-03-04T18:00:00Z".parse::<DateTime<Utc>>().unwrap());

        assert!(parse_op_stamp("no stamp here").is_none());
    }

    #[test]
    fn marked_for_op_matches_when_due() {
        let filter = MarkedForOpFilter::from_config(&json!({"op": "delete"})).unwrap();
        let resource = json!({
            "Id": "i-1",
            "Tags": [{"Key": DEFAULT_OP_TAG, "Value": "policy: delete@2026/03/04"}],
        });

        let before = context_at("2026-03-03T00:00:00Z");
        assert!(!run(&filter, &before, resource.clone()));

        let after = context_at("2026-03-05T00:00:00Z");
        assert!(run(&filter, &after, resource.clone()));

        // Wrong op never matches.
        let stop = MarkedForOpFilter::from_config(&json!({"op": "stop"})).unwrap();
        assert!(!run(&stop, &after, resource));
    }

    #[test]
    fn skew_moves_the_horizon_forward() {
        let filter = MarkedForOpFilter::from_config(&json!({"op": "delete", "skew": 2})).unwrap();
        let resource = json!({
            "Id": "i-1",
            "Tags": [{"Key": DEFAULT_OP_TAG, "Value": "delete@2026/03/04"}],
        });
        let ctx = context_at("2026-03-03T00:00:00Z");
        assert!(run(&filter, &ctx, resource));
    }

    #[test]
    fn tag_count_ge_default() {
        let filter = TagCountFilter::from_config(&json!({"count": 2})).unwrap();
        let ctx = context_at("2026-01-01T00:00:00Z");
        assert!(run(
            &filter,
            &ctx,
            json!({"Tags": [{"Key": "a", "Value": "1"}, {"Key": "b", "Value": "2"}]}),
        ));
        assert!(!run(&filter, &ctx, json!({"Tags": [{"Key": "a", "Value": "1"}]})));
    }
}
