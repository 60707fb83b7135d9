//! Tag mutation actions: `tag`, `remove-tag` and `mark-for-op`.
//!
//! Tag writes go through the provider's central tagging API for
//! universal-taggable types (`("tagging", "TagResources")`) and through the
//! type's own service otherwise (`(service, "CreateTags")`). Every write is
//! mirrored onto the local resource copy so filters later in the same run
//! observe it.

use std::collections::BTreeSet;

use chrono::Duration;
use serde_json::{Value, json};

use warden_core::error::PolicyError;
use warden_core::resource::{Resource, ResourceTypeDef};

use super::{Action, ActionContext, DEFAULT_CHUNK_SIZE, invoke_mutation};
use crate::filters::DEFAULT_OP_TAG;

const DEFAULT_MARK_MSG: &str = "Resource does not meet policy";

/// Routing decision for one tag mutation.
struct TagRoute {
    service: String,
    write_op: &'static str,
    delete_op: &'static str,
}

impl TagRoute {
    fn for_type(type_def: &ResourceTypeDef) -> Result<Self, PolicyError> {
        if !type_def.taggable {
            return Err(PolicyError::invalid(format!(
                "resource type {:?} does not support tagging",
                type_def.name
            )));
        }
        Ok(if type_def.universal_taggable {
            Self {
                service: "tagging".to_string(),
                write_op: "TagResources",
                delete_op: "UntagResources",
            }
        } else {
            Self {
                service: type_def.service.clone(),
                write_op: "CreateTags",
                delete_op: "DeleteTags",
            }
        })
    }
}

/// Apply `tags` to a chunk and mirror them locally.
fn write_tags(
    resources: &mut [Resource],
    actx: &ActionContext,
    route: &TagRoute,
    tags: &[(String, String)],
) -> Result<(), PolicyError> {
    let ids: Vec<String> = resources
        .iter()
        .filter_map(|r| r.id(actx.type_def))
        .collect();
    if ids.is_empty() {
        return Ok(());
    }
    let tag_list: Vec<Value> = tags
        .iter()
        .map(|(k, v)| json!({"Key": k, "Value": v}))
        .collect();
    let params = json!({"ids": ids, "tags": tag_list});
    invoke_mutation(actx, &route.service, route.write_op, &params)?;
    for resource in resources.iter_mut() {
        for (k, v) in tags {
            resource.set_tag(&actx.type_def.tag_attr, k, v);
        }
    }
    Ok(())
}

/// Write one or more tags onto matched resources.
pub struct TagAction {
    tags: Vec<(String, String)>,
    route: TagRoute,
    chunk_size: usize,
}

impl TagAction {
    /// Accepts either `{key, value}` or a `tags` mapping.
    pub fn from_config(data: &Value, type_def: &ResourceTypeDef) -> Result<Self, PolicyError> {
        let mut tags: Vec<(String, String)> = Vec::new();
        if let Some(map) = data.get("tags").and_then(Value::as_object) {
            for (k, v) in map {
                let v = v
                    .as_str()
                    .ok_or_else(|| PolicyError::invalid("tag values must be strings"))?;
                tags.push((k.clone(), v.to_string()));
            }
        }
        if let Some(key) = data.get("key").and_then(Value::as_str) {
            let value = data
                .get("value")
                .and_then(Value::as_str)
                .ok_or_else(|| PolicyError::invalid("tag with a key requires a value"))?;
            tags.push((key.to_string(), value.to_string()));
        }
        if tags.is_empty() {
            return Err(PolicyError::invalid(
                "tag requires key/value or a tags mapping",
            ));
        }
        Ok(Self {
            tags,
            route: TagRoute::for_type(type_def)?,
            chunk_size: chunk_size_of(data),
        })
    }
}

impl Action for TagAction {
    fn name(&self) -> &str {
        "tag"
    }

    fn get_permissions(&self) -> BTreeSet<String> {
        BTreeSet::from([format!("{}:{}", self.route.service, self.route.write_op)])
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn process_chunk(
        &self,
        resources: &mut [Resource],
        actx: &ActionContext,
    ) -> Result<(), PolicyError> {
        write_tags(resources, actx, &self.route, &self.tags)
    }
}

pub(super) fn tag_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["type"],
        "properties": {
            "type": {"enum": ["tag"]},
            "key": {"type": "string"},
            "value": {"type": "string"},
            "tags": {"type": "object", "additionalProperties": {"type": "string"}},
            "chunk-size": {"type": "integer", "minimum": 1},
        },
    })
}

/// Remove tags by key from matched resources.
pub struct RemoveTagAction {
    keys: Vec<String>,
    route: TagRoute,
    chunk_size: usize,
}

impl RemoveTagAction {
    pub fn from_config(data: &Value, type_def: &ResourceTypeDef) -> Result<Self, PolicyError> {
        let keys: Vec<String> = data
            .get("tags")
            .or_else(|| data.get("keys"))
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if keys.is_empty() {
            return Err(PolicyError::invalid(
                "remove-tag requires a non-empty tags list",
            ));
        }
        Ok(Self {
            keys,
            route: TagRoute::for_type(type_def)?,
            chunk_size: chunk_size_of(data),
        })
    }
}

impl Action for RemoveTagAction {
    fn name(&self) -> &str {
        "remove-tag"
    }

    fn get_permissions(&self) -> BTreeSet<String> {
        BTreeSet::from([format!("{}:{}", self.route.service, self.route.delete_op)])
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn process_chunk(
        &self,
        resources: &mut [Resource],
        actx: &ActionContext,
    ) -> Result<(), PolicyError> {
        let ids: Vec<String> = resources
            .iter()
            .filter_map(|r| r.id(actx.type_def))
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let params = json!({"ids": ids, "keys": self.keys});
        invoke_mutation(actx, &self.route.service, self.route.delete_op, &params)?;
        for resource in resources.iter_mut() {
            for key in &self.keys {
                resource.remove_tag(&actx.type_def.tag_attr, key);
            }
        }
        Ok(())
    }
}

pub(super) fn remove_tag_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["type", "tags"],
        "properties": {
            "type": {"enum": ["remove-tag"]},
            "tags": {"type": "array", "items": {"type": "string"}, "minItems": 1},
            "chunk-size": {"type": "integer", "minimum": 1},
        },
    })
}

/// Stamp resources with a deferred operation the `marked-for-op` filter
/// picks up once the due date passes. The stamp reads
/// `msg: op@YYYY/MM/DD`, with an `HHMM UTC` suffix when an hour offset is
/// in play.
pub struct MarkForOpAction {
    op: String,
    tag: String,
    msg: String,
    days: i64,
    hours: i64,
    route: TagRoute,
    chunk_size: usize,
}

impl MarkForOpAction {
    pub fn from_config(data: &Value, type_def: &ResourceTypeDef) -> Result<Self, PolicyError> {
        let op = data
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| PolicyError::invalid("mark-for-op requires an op"))?
            .to_string();
        let days = data.get("days").and_then(Value::as_i64).unwrap_or(4);
        let hours = data.get("hours").and_then(Value::as_i64).unwrap_or(0);
        if days < 0 || hours < 0 {
            return Err(PolicyError::invalid("mark-for-op days/hours must be >= 0"));
        }
        Ok(Self {
            op,
            tag: data
                .get("tag")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_OP_TAG)
                .to_string(),
            msg: data
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_MARK_MSG)
                .to_string(),
            days,
            hours,
            route: TagRoute::for_type(type_def)?,
            chunk_size: chunk_size_of(data),
        })
    }

    fn stamp(&self, actx: &ActionContext) -> String {
        let due = actx.ctx.now() + Duration::days(self.days) + Duration::hours(self.hours);
        let date = if self.hours > 0 {
            due.format("%Y/%m/%d %H%M UTC").to_string()
        } else {
            due.format("%Y/%m/%d").to_string()
        };
        format!("{}: {}@{}", self.msg, self.op, date)
    }
}

impl Action for MarkForOpAction {
    fn name(&self) -> &str {
        "mark-for-op"
    }

    fn get_permissions(&self) -> BTreeSet<String> {
        BTreeSet::from([format!("{}:{}", self.route.service, self.route.write_op)])
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn process_chunk(
        &self,
        resources: &mut [Resource],
        actx: &ActionContext,
    ) -> Result<(), PolicyError> {
        let tags = vec![(self.tag.clone(), self.stamp(actx))];
        write_tags(resources, actx, &self.route, &tags)
    }
}

pub(super) fn mark_for_op_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["type", "op"],
        "properties": {
            "type": {"enum": ["mark-for-op"]},
            "op": {"type": "string"},
            "tag": {"type": "string"},
            "msg": {"type": "string"},
            "days": {"type": "integer", "minimum": 0},
            "hours": {"type": "integer", "minimum": 0},
            "chunk-size": {"type": "integer", "minimum": 1},
        },
    })
}

fn chunk_size_of(data: &Value) -> usize {
    data.get("chunk-size")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_CHUNK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use warden_core::client::StaticCloudClient;
    use warden_core::context::{Clock, ExecutionContext};
    use warden_core::resource::ResourceTypeDef;

    use crate::filters::parse_op_stamp;

    fn ec2_def() -> ResourceTypeDef {
        let mut def = ResourceTypeDef::new("ec2", "ec2", "InstanceId", "DescribeInstances", "[]");
        def.taggable = true;
        def
    }

    struct Harness {
        client: StaticCloudClient,
        ctx: ExecutionContext,
        type_def: ResourceTypeDef,
    }

    impl Harness {
        fn new(type_def: ResourceTypeDef) -> Self {
            let mut ctx = ExecutionContext::ephemeral("test", &type_def.name);
            ctx.clock = Clock::Fixed("2026-03-01T00:00:00Z".parse().unwrap());
            Self {
                client: StaticCloudClient::new(),
                ctx,
                type_def,
            }
        }

        fn run(&self, action: &dyn Action, resources: &mut [Resource]) {
            let actx = ActionContext {
                ctx: &self.ctx,
                type_def: &self.type_def,
                client: &self.client,
                event: None,
            };
            action.process_chunk(resources, &actx).unwrap();
        }
    }

    #[test]
    fn tag_action_writes_and_mirrors() {
        let h = Harness::new(ec2_def());
        let action = TagAction::from_config(
            &json!({"type": "tag", "key": "Owner", "value": "infra"}),
            &h.type_def,
        )
        .unwrap();
        let mut resources = vec![Resource::new(json!({"InstanceId": "i-1"}))];
        h.run(&action, &mut resources);

        assert_eq!(h.client.call_count("ec2", "CreateTags"), 1);
        let call = &h.client.calls()[0];
        assert_eq!(call.params["ids"], json!(["i-1"]));
        assert_eq!(call.params["tags"], json!([{"Key": "Owner", "Value": "infra"}]));
        assert_eq!(resources[0].tag("Tags", "Owner"), Some("infra"));
    }

    #[test]
    fn universal_taggable_routes_through_tagging_service() {
        let mut def = ec2_def();
        def.universal_taggable = true;
        let h = Harness::new(def);
        let action = TagAction::from_config(
            &json!({"type": "tag", "tags": {"Env": "prod"}}),
            &h.type_def,
        )
        .unwrap();
        let mut resources = vec![Resource::new(json!({"InstanceId": "i-1"}))];
        h.run(&action, &mut resources);
        assert_eq!(h.client.call_count("tagging", "TagResources"), 1);
    }

    #[test]
    fn non_taggable_type_is_rejected_at_build() {
        let def = ResourceTypeDef::new("eip", "ec2", "AllocationId", "DescribeAddresses", "[]");
        let err = TagAction::from_config(&json!({"type": "tag", "key": "a", "value": "b"}), &def);
        assert!(err.is_err());
    }

    #[test]
    fn remove_tag_deletes_and_mirrors() {
        let h = Harness::new(ec2_def());
        let action = RemoveTagAction::from_config(
            &json!({"type": "remove-tag", "tags": ["Owner"]}),
            &h.type_def,
        )
        .unwrap();
        let mut resources = vec![Resource::new(json!({
            "InstanceId": "i-1",
            "Tags": [{"Key": "Owner", "Value": "infra"}],
        }))];
        h.run(&action, &mut resources);
        assert_eq!(h.client.call_count("ec2", "DeleteTags"), 1);
        assert_eq!(resources[0].tag("Tags", "Owner"), None);
    }

    #[test]
    fn mark_for_op_stamp_round_trips_through_the_filter_parser() {
        let h = Harness::new(ec2_def());
        let action = MarkForOpAction::from_config(
            &json!({"type": "mark-for-op", "op": "stop", "days": 3}),
            &h.type_def,
        )
        .unwrap();
        let mut resources = vec![Resource::new(json!({"InstanceId": "i-1"}))];
        h.run(&action, &mut resources);

        let stamp = resources[0].tag("Tags", DEFAULT_OP_TAG).unwrap();
        let (op, due) = parse_op_stamp(stamp).unwrap();
        assert_eq!(op, "stop");
        let want: DateTime<Utc> = "2026-03-04T00:00:00Z".parse().unwrap();
        assert_eq!(due, want);
        assert!(stamp.starts_with(DEFAULT_MARK_MSG));
    }

    #[test]
    fn mark_for_op_with_hours_stamps_the_hour() {
        let h = Harness::new(ec2_def());
        let action = MarkForOpAction::from_config(
            &json!({"type": "mark-for-op", "op": "stop", "days": 0, "hours": 6}),
            &h.type_def,
        )
        .unwrap();
        let mut resources = vec![Resource::new(json!({"InstanceId": "i-1"}))];
        h.run(&action, &mut resources);

        let stamp = resources[0].tag("Tags", DEFAULT_OP_TAG).unwrap();
        let (_, due) = parse_op_stamp(stamp).unwrap();
        let want: DateTime<Utc> = "2026-03-01T06:00:00Z".parse().unwrap();
        assert_eq!(due, want);
    }
}
