//! Policy document schema: assembly, normalization and validation.
//!
//! The schema is assembled at runtime from whatever the provider has
//! registered: each resource type contributes a `filters` union, an
//! `actions` union and a `policy` object definition, and the top-level
//! `policies` array accepts any registered type's policy shape. Plugin
//! schema fragments reference their own type's filter union through the
//! `#/filters` placeholder, which assembly rewrites to the type-scoped
//! definition so combinators recurse correctly.
//!
//! Shorthand forms are rewritten to their canonical shape by
//! [`normalize_policies`] before validation, so the schema only ever sees
//! full filter and action objects.

use serde_json::{Map, Value, json};

use warden_core::error::{PolicyError, ValidationIssue};

use crate::filters::normalize_filter;
use crate::provider::Provider;

/// Placeholder reference plugin schemas use for "this type's filter union".
const FILTERS_PLACEHOLDER: &str = "#/filters";

/// Assemble the full document schema for everything `provider` has
/// registered.
pub fn build_schema(provider: &Provider) -> Value {
    let mut resources = Map::new();
    let mut policy_refs = Vec::new();

    for (name, plugin) in provider.resources.items() {
        let filters_ref = format!("#/definitions/resources/{name}/filters");
        let actions_ref = format!("#/definitions/resources/{name}/actions");

        let filter_variants: Vec<Value> = plugin
            .filters
            .items()
            .map(|(_, p)| rewrite_refs(&p.schema, &filters_ref))
            .collect();
        let action_variants: Vec<Value> = plugin
            .actions
            .items()
            .map(|(_, p)| rewrite_refs(&p.schema, &filters_ref))
            .collect();

        let policy = json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["name", "resource"],
            "properties": {
                "name": {"type": "string", "pattern": "^[A-Za-z][A-Za-z0-9-_]*$"},
                "resource": {"enum": [name]},
                "description": {"type": "string"},
                "comment": {"type": "string"},
                "mode": {"$ref": "#/definitions/policy-mode"},
                "tags": {"type": "array", "items": {"type": "string"}},
                "max-resources": {"type": "integer", "minimum": 1},
                "query": {"type": "object"},
                "filters": {"type": "array", "items": {"$ref": filters_ref}},
                "actions": {"type": "array", "items": {"$ref": actions_ref}},
            },
        });

        policy_refs.push(json!({"$ref": format!("#/definitions/resources/{name}/policy")}));
        resources.insert(
            name.to_string(),
            json!({
                "filters": {"oneOf": filter_variants},
                "actions": {"oneOf": action_variants},
                "policy": policy,
            }),
        );
    }

    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "additionalProperties": false,
        "required": ["policies"],
        "properties": {
            "policies": {
                "type": "array",
                "items": {"anyOf": policy_refs},
            },
            "vars": {"type": "object"},
        },
        "definitions": {
            "resources": Value::Object(resources),
            "policy-mode": policy_mode_schema(),
        },
    })
}

/// Shapes of the supported execution modes.
fn policy_mode_schema() -> Value {
    json!({
        "anyOf": [
            {
                "type": "object",
                "additionalProperties": false,
                "properties": {"type": {"enum": ["pull"]}},
            },
            {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "events"],
                "properties": {
                    "type": {"enum": ["event"]},
                    "events": {"type": "array", "items": {"type": "string"}, "minItems": 1},
                    "ids": {"type": "string"},
                },
            },
            {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "schedule"],
                "properties": {
                    "type": {"enum": ["periodic"]},
                    "schedule": {"type": "string"},
                },
            },
            {
                "type": "object",
                "additionalProperties": false,
                "properties": {"type": {"enum": ["config-rule"]}},
            },
        ],
    })
}

/// Rewrite every `{"$ref": "#/filters"}` in a plugin fragment to the
/// type-scoped filter union.
fn rewrite_refs(schema: &Value, filters_ref: &str) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if k == "$ref" && v.as_str() == Some(FILTERS_PLACEHOLDER) {
                        (k.clone(), Value::String(filters_ref.to_string()))
                    } else {
                        (k.clone(), rewrite_refs(v, filters_ref))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| rewrite_refs(v, filters_ref)).collect())
        }
        other => other.clone(),
    }
}

/// Rewrite shorthand filters and actions in place, recursing into
/// combinator children.
pub fn normalize_policies(doc: &mut Value) {
    let Some(policies) = doc.get_mut("policies").and_then(Value::as_array_mut) else {
        return;
    };
    for policy in policies {
        if let Some(filters) = policy.get_mut("filters").and_then(Value::as_array_mut) {
            for filter in filters {
                *filter = normalize_filter_deep(filter);
            }
        }
        if let Some(actions) = policy.get_mut("actions").and_then(Value::as_array_mut) {
            for action in actions {
                if let Some(name) = action.as_str() {
                    *action = json!({"type": name});
                }
            }
        }
    }
}

fn normalize_filter_deep(data: &Value) -> Value {
    let mut normalized = normalize_filter(data);
    if let Some(children) = normalized.get_mut("filters").and_then(Value::as_array_mut) {
        for child in children {
            *child = normalize_filter_deep(child);
        }
    }
    normalized
}

/// Validate a normalized document against the assembled schema. Collects
/// every issue rather than stopping at the first.
pub fn validate_document(doc: &Value, schema: &Value) -> Result<(), PolicyError> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| PolicyError::execution(format!("schema failed to compile: {e}")))?;
    let issues: Vec<ValidationIssue> = validator
        .iter_errors(doc)
        .map(|err| ValidationIssue::new(pointer_to_path(&err.instance_path().to_string()), err.to_string()))
        .collect();
    if issues.is_empty() {
        Ok(())
    } else {
        Err(PolicyError::Validation(issues))
    }
}

/// `/policies/0/filters/2` → `policies[0].filters[2]`.
fn pointer_to_path(pointer: &str) -> String {
    let mut out = String::new();
    for segment in pointer.split('/').filter(|s| !s.is_empty()) {
        if segment.chars().all(|c| c.is_ascii_digit()) {
            out.push('[');
            out.push_str(segment);
            out.push(']');
        } else {
            if !out.is_empty() {
                out.push('.');
            }
            out.push_str(segment);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_core::resource::ResourceTypeDef;

    use crate::actions::CloudOpAction;
    use crate::provider::ResourcePlugin;

    fn provider() -> Provider {
        let mut def = ResourceTypeDef::new(
            "ec2",
            "ec2",
            "InstanceId",
            "DescribeInstances",
            "Reservations[].Instances[]",
        );
        def.taggable = true;
        let mut provider = Provider::new("aws");
        provider
            .register_resource(
                ResourcePlugin::new(def)
                    .with_action(
                        "stop",
                        CloudOpAction::plugin("stop", "StopInstances", "InstanceIds", &[]),
                    )
                    .unwrap(),
            )
            .unwrap();
        provider
    }

    fn check(doc: Value) -> Result<(), PolicyError> {
        let provider = provider();
        let schema = build_schema(&provider);
        let mut doc = doc;
        normalize_policies(&mut doc);
        validate_document(&doc, &schema)
    }

    #[test]
    fn valid_policy_passes() {
        check(json!({
            "policies": [{
                "name": "ec2-stop-unmarked",
                "resource": "ec2",
                "filters": [
                    {"tag:Env": "absent"},
                    {"type": "value", "key": "State.Name", "value": "running"},
                ],
                "actions": ["stop", {"type": "mark-for-op", "op": "stop", "days": 3}],
            }],
        }))
        .unwrap();
    }

    #[test]
    fn nested_combinators_validate_recursively() {
        check(json!({
            "policies": [{
                "name": "nested",
                "resource": "ec2",
                "filters": [{
                    "or": [
                        {"tag:Env": "prod"},
                        {"and": [
                            {"type": "value", "key": "State.Name", "value": "stopped"},
                            {"tag:Owner": "absent"},
                        ]},
                    ],
                }],
            }],
        }))
        .unwrap();
    }

    #[test]
    fn unknown_resource_type_fails_with_path() {
        let err = check(json!({
            "policies": [{"name": "x", "resource": "no-such-type"}],
        }))
        .unwrap_err();
        let PolicyError::Validation(issues) = err else {
            panic!("expected validation error");
        };
        assert!(issues.iter().any(|i| i.path.starts_with("policies[0]")));
    }

    #[test]
    fn missing_required_action_field_fails() {
        assert!(
            check(json!({
                "policies": [{
                    "name": "x",
                    "resource": "ec2",
                    "actions": [{"type": "mark-for-op"}],
                }],
            }))
            .is_err()
        );
    }

    #[test]
    fn mode_shapes_are_enforced() {
        check(json!({
            "policies": [{
                "name": "periodic",
                "resource": "ec2",
                "mode": {"type": "periodic", "schedule": "rate(1 hour)"},
            }],
        }))
        .unwrap();

        assert!(
            check(json!({
                "policies": [{
                    "name": "periodic",
                    "resource": "ec2",
                    "mode": {"type": "periodic"},
                }],
            }))
            .is_err()
        );
    }

    #[test]
    fn pointer_paths_are_bracketed() {
        assert_eq!(pointer_to_path("/policies/0/filters/2"), "policies[0].filters[2]");
        assert_eq!(pointer_to_path(""), "");
        assert_eq!(pointer_to_path("/policies"), "policies");
    }
}
