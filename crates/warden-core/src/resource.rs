//! The resource model.
//!
//! A resource is the raw mapping returned by a cloud API, kept dynamic on
//! purpose: the schema surface is too wide and drifts with SDK responses to
//! justify per-type structs. `Resource` wraps a `serde_json::Value` object
//! and adds typed access to the identifier attributes declared by the
//! resource-type descriptor, plus engine annotations written under a
//! reserved key prefix so they can never collide with provider data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved prefix for keys the engine writes onto resources.
pub const ANNOTATION_PREFIX: &str = "warden:";

/// Annotation key recording which filters matched a resource.
pub const MATCHED_FILTERS: &str = "MatchedFilters";

/// Enumeration spec: how to list all resources of a type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumSpec {
    /// Cloud operation name, e.g. `DescribeInstances`.
    pub operation: String,
    /// Key expression projecting the result page to a resource list, e.g.
    /// `Reservations[].Instances[]`.
    pub path: String,
    /// Extra parameters sent with every page request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_params: Option<Value>,
}

/// Detail spec: how to fetch per-resource detail after enumeration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailSpec {
    /// Cloud operation name, e.g. `GetFunctionConfiguration`.
    pub operation: String,
    /// Parameter name carrying the resource identifier.
    pub param: String,
    /// Key expression projecting the response to the detail object.
    pub path: String,
}

/// Static metadata for a cloud resource class. Registered at process start
/// and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceTypeDef {
    /// Short type name, e.g. `ec2`.
    pub name: String,
    /// Cloud service the type belongs to, e.g. `ec2`, `s3`.
    pub service: String,
    pub enum_spec: EnumSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_spec: Option<DetailSpec>,
    /// Attribute holding the stable identifier, e.g. `InstanceId`.
    pub id: String,
    /// Attribute holding the display name, when distinct from the id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_attr: Option<String>,
    /// Attribute holding the creation timestamp, when the API reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_attr: Option<String>,
    /// Attribute holding the tag list. Nearly always `Tags`.
    #[serde(default = "default_tag_attr")]
    pub tag_attr: String,
    /// Whether the type supports tag mutation at all.
    #[serde(default)]
    pub taggable: bool,
    /// Whether tags are resolved through the provider's central tagging API
    /// rather than carried on the enumeration response.
    #[serde(default)]
    pub universal_taggable: bool,
    /// Compliance asset type, e.g. `AWS::EC2::Instance`. Required for the
    /// config-rule execution mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<String>,
    /// Dimension name identifying one resource in the monitoring API, e.g.
    /// `InstanceId`. Required for the metrics filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<String>,
    /// API permissions needed to enumerate the type.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Columns used by the report command when no fields are given.
    #[serde(default)]
    pub default_report_fields: Vec<String>,
}

fn default_tag_attr() -> String {
    "Tags".to_string()
}

impl ResourceTypeDef {
    /// Minimal descriptor for a type identified by `id`, enumerated with
    /// `operation` and projected through `path`.
    pub fn new(
        name: impl Into<String>,
        service: impl Into<String>,
        id: impl Into<String>,
        operation: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            enum_spec: EnumSpec {
                operation: operation.into(),
                path: path.into(),
                extra_params: None,
            },
            detail_spec: None,
            id: id.into(),
            name_attr: None,
            date_attr: None,
            tag_attr: default_tag_attr(),
            taggable: false,
            universal_taggable: false,
            asset_type: None,
            dimension: None,
            permissions: Vec::new(),
            default_report_fields: Vec::new(),
        }
    }
}

/// One cloud resource: an opaque string-keyed mapping.
///
/// The identifier attribute is immutable for the lifetime of the object
/// within a run; augmentation refuses to overwrite it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Value);

impl Resource {
    /// Wrap a raw API object. Non-object values are normalized to an empty
    /// object so downstream access stays total.
    pub fn new(value: Value) -> Self {
        if value.is_object() {
            Resource(value)
        } else {
            Resource(Value::Object(Map::new()))
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    fn map(&self) -> &Map<String, Value> {
        // Constructor guarantees the object shape.
        self.0.as_object().unwrap_or_else(|| unreachable!())
    }

    fn map_mut(&mut self) -> &mut Map<String, Value> {
        self.0.as_object_mut().unwrap_or_else(|| unreachable!())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map().get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.map_mut().insert(key.into(), value);
    }

    /// The resource identifier named by the descriptor, as a string.
    pub fn id(&self, type_def: &ResourceTypeDef) -> Option<String> {
        value_to_id(self.get(&type_def.id)?)
    }

    /// Merge detail fields into the resource. Detail wins on conflicts,
    /// except the identifier attribute which is never overwritten.
    pub fn merge(&mut self, detail: &Value, type_def: &ResourceTypeDef) {
        let Some(detail) = detail.as_object() else {
            return;
        };
        for (k, v) in detail {
            if k == &type_def.id {
                continue;
            }
            self.map_mut().insert(k.clone(), v.clone());
        }
    }

    /// The value of tag `key` from the descriptor's tag attribute, which is
    /// a list of `{Key, Value}` objects.
    pub fn tag(&self, tag_attr: &str, key: &str) -> Option<&str> {
        let tags = self.get(tag_attr)?.as_array()?;
        tags.iter()
            .find(|t| t.get("Key").and_then(Value::as_str) == Some(key))
            .and_then(|t| t.get("Value").and_then(Value::as_str))
    }

    /// Number of tags present, excluding any the engine itself wrote.
    pub fn tag_count(&self, tag_attr: &str, include_engine_tags: bool) -> usize {
        let Some(tags) = self.get(tag_attr).and_then(Value::as_array) else {
            return 0;
        };
        tags.iter()
            .filter(|t| {
                include_engine_tags
                    || t.get("Key")
                        .and_then(Value::as_str)
                        .is_none_or(|k| !k.starts_with("warden_"))
            })
            .count()
    }

    /// Set or replace tag `key` in place on the local copy. This only
    /// mirrors what a tagging action has done (or will do) against the
    /// cloud; it exists so later filters in the same run observe the tag.
    pub fn set_tag(&mut self, tag_attr: &str, key: &str, value: &str) {
        let entry = serde_json::json!({"Key": key, "Value": value});
        let map = self.map_mut();
        let tags = map
            .entry(tag_attr.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(list) = tags.as_array_mut() {
            list.retain(|t| t.get("Key").and_then(Value::as_str) != Some(key));
            list.push(entry);
        }
    }

    pub fn remove_tag(&mut self, tag_attr: &str, key: &str) {
        if let Some(list) = self.map_mut().get_mut(tag_attr).and_then(Value::as_array_mut) {
            list.retain(|t| t.get("Key").and_then(Value::as_str) != Some(key));
        }
    }

    /// Write an engine annotation. The key is namespaced under `warden:`.
    pub fn annotate(&mut self, key: &str, value: Value) {
        self.map_mut()
            .insert(format!("{ANNOTATION_PREFIX}{key}"), value);
    }

    pub fn annotation(&self, key: &str) -> Option<&Value> {
        self.get(&format!("{ANNOTATION_PREFIX}{key}"))
    }

    /// Append to a list-valued annotation, creating it on first write.
    pub fn push_annotation(&mut self, key: &str, value: Value) {
        let full = format!("{ANNOTATION_PREFIX}{key}");
        let slot = self
            .map_mut()
            .entry(full)
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(list) = slot.as_array_mut() {
            list.push(value);
        }
    }

    /// Copy of the resource with every engine annotation removed, for
    /// serialization paths that must emit provider data only.
    pub fn without_annotations(&self) -> Resource {
        let map = self
            .map()
            .iter()
            .filter(|(k, _)| !k.starts_with(ANNOTATION_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Resource(Value::Object(map))
    }
}

impl From<Value> for Resource {
    fn from(value: Value) -> Self {
        Resource::new(value)
    }
}

/// Render an identifier value to its canonical string form.
fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ec2_def() -> ResourceTypeDef {
        ResourceTypeDef::new("ec2", "ec2", "InstanceId", "DescribeInstances", "Reservations[].Instances[]")
    }

    #[test]
    fn id_and_tag_access() {
        let r = Resource::new(json!({
            "InstanceId": "i-123",
            "Tags": [{"Key": "Env", "Value": "prod"}],
        }));
        assert_eq!(r.id(&ec2_def()).as_deref(), Some("i-123"));
        assert_eq!(r.tag("Tags", "Env"), Some("prod"));
        assert_eq!(r.tag("Tags", "Owner"), None);
    }

    #[test]
    fn annotations_are_namespaced_and_strippable() {
        let mut r = Resource::new(json!({"InstanceId": "i-123"}));
        r.push_annotation(MATCHED_FILTERS, json!("tag:Env"));
        r.annotate("Detail", json!({"a": 1}));
        assert_eq!(r.annotation(MATCHED_FILTERS), Some(&json!(["tag:Env"])));
        assert!(r.get("warden:Detail").is_some());

        let clean = r.without_annotations();
        assert_eq!(clean.as_value(), &json!({"InstanceId": "i-123"}));
    }

    #[test]
    fn merge_never_overwrites_identifier() {
        let mut r = Resource::new(json!({"InstanceId": "i-123", "State": "pending"}));
        r.merge(&json!({"InstanceId": "i-999", "State": "running"}), &ec2_def());
        assert_eq!(r.get("InstanceId"), Some(&json!("i-123")));
        assert_eq!(r.get("State"), Some(&json!("running")));
    }

    #[test]
    fn set_tag_replaces_existing_key() {
        let mut r = Resource::new(json!({"Tags": [{"Key": "Env", "Value": "dev"}]}));
        r.set_tag("Tags", "Env", "prod");
        assert_eq!(r.tag("Tags", "Env"), Some("prod"));
        assert_eq!(r.get("Tags").unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn tag_count_skips_engine_tags() {
        let r = Resource::new(json!({
            "Tags": [
                {"Key": "Env", "Value": "prod"},
                {"Key": "warden_status", "Value": "stop@2026/01/01"},
            ],
        }));
        assert_eq!(r.tag_count("Tags", false), 1);
        assert_eq!(r.tag_count("Tags", true), 2);
    }
}
