//! The filter engine.
//!
//! Filters are predicate plugins built out of each resource type's filter
//! registry. Most implement the per-resource `matches` path and inherit
//! the default batch `process`; set-level filters (boolean combinators,
//! `resource_count`) override `process` directly. A policy's filter list
//! is an implicit AND.
//!
//! Failure semantics: an error while testing a single resource logs a
//! warning and drops that resource; an error in a batch `process` is fatal
//! to the policy.

mod metrics;
mod offhours;
mod tags;

pub use metrics::MetricsFilter;
pub use offhours::{DEFAULT_SCHEDULE_TAG, OffHourFilter, Schedule};
pub use tags::{DEFAULT_OP_TAG, MarkedForOpFilter, TagCountFilter, parse_op_stamp};

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Value, json};

use warden_core::client::CloudClient;
use warden_core::error::PolicyError;
use warden_core::event::Event;
use warden_core::registry::Registry;
use warden_core::resource::{MATCHED_FILTERS, Resource, ResourceTypeDef};
use warden_core::context::ExecutionContext;
use warden_query::FunctionRegistry;

use crate::value::{Op, ValueMatch, ValueType};

/// Shared state filters evaluate under.
pub struct FilterContext<'a> {
    pub ctx: &'a ExecutionContext,
    pub type_def: &'a ResourceTypeDef,
    pub functions: &'a FunctionRegistry,
    /// Cloud access for filters that query beyond the resource document.
    /// `None` under validation-only evaluation; such filters then error and
    /// their resources drop with a warning.
    pub client: Option<&'a dyn CloudClient>,
}

/// Predicate plugin over resources.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self) -> Result<(), PolicyError> {
        Ok(())
    }

    /// API permissions this filter needs. Combinators return the
    /// transitive union over their whole subtree.
    fn get_permissions(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Per-resource predicate. Filters may annotate the resource on match.
    fn matches(
        &self,
        resource: &mut Resource,
        event: Option<&Event>,
        fctx: &FilterContext,
    ) -> Result<bool, PolicyError>;

    /// Batch evaluation. The default applies `matches` per resource,
    /// dropping (with a warning) any resource the predicate errors on.
    fn process(
        &self,
        resources: Vec<Resource>,
        event: Option<&Event>,
        fctx: &FilterContext,
    ) -> Result<Vec<Resource>, PolicyError> {
        let mut kept = Vec::with_capacity(resources.len());
        for mut resource in resources {
            match self.matches(&mut resource, event, fctx) {
                Ok(true) => kept.push(resource),
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(
                        policy = %fctx.ctx.policy_name,
                        resource_type = %fctx.type_def.name,
                        filter = %self.name(),
                        resource = %resource.id(fctx.type_def).unwrap_or_default(),
                        error = %error,
                        "filter error, excluding resource"
                    );
                }
            }
        }
        Ok(kept)
    }
}

/// Context handed to filter factories.
pub struct FilterBuildCtx<'a> {
    pub registry: &'a FilterRegistry,
    pub type_def: &'a ResourceTypeDef,
}

type FilterFactory =
    dyn Fn(&Value, &FilterBuildCtx) -> Result<Arc<dyn Filter>, PolicyError> + Send + Sync;

/// Registry entry: a schema fragment plus a factory.
pub struct FilterPlugin {
    pub schema: Value,
    pub build: Box<FilterFactory>,
}

impl FilterPlugin {
    pub fn new(
        schema: Value,
        build: impl Fn(&Value, &FilterBuildCtx) -> Result<Arc<dyn Filter>, PolicyError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            schema,
            build: Box::new(build),
        })
    }
}

pub type FilterRegistry = Registry<FilterPlugin>;

/// Expand value-filter shorthand. `{"tag:Env": "prod"}` and
/// `{"State.Name": "running"}` become full value filters; `{"or": [...]}`
/// becomes a combinator node; everything else passes through.
pub fn normalize_filter(data: &Value) -> Value {
    let Some(obj) = data.as_object() else {
        return data.clone();
    };
    if obj.contains_key("type") {
        return data.clone();
    }
    if obj.len() == 1 {
        let (key, value) = obj.iter().next().unwrap_or_else(|| unreachable!());
        if matches!(key.as_str(), "and" | "or" | "not") {
            let children: Vec<Value> = value
                .as_array()
                .map(|list| list.iter().map(normalize_filter).collect())
                .unwrap_or_default();
            return json!({"type": key, "filters": children});
        }
        // `{key: "absent"}` style presence tests.
        if let Some(op) = value.as_str() {
            if matches!(op, "absent" | "present" | "not-null" | "empty") {
                return json!({"type": "value", "key": key, "op": op});
            }
        }
        if value.is_array() {
            return json!({"type": "value", "key": key, "op": "in", "value": value});
        }
        return json!({"type": "value", "key": key, "value": value});
    }
    data.clone()
}

/// Build one filter node from normalized config.
pub fn build_filter(data: &Value, build_ctx: &FilterBuildCtx) -> Result<Arc<dyn Filter>, PolicyError> {
    let data = normalize_filter(data);
    let name = data
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| PolicyError::invalid(format!("filter missing type: {data}")))?;
    let plugin = build_ctx.registry.get(name).ok_or_else(|| {
        PolicyError::invalid(format!(
            "unknown filter {:?} for resource type {:?}",
            name, build_ctx.type_def.name
        ))
    })?;
    let filter = (plugin.build)(&data, build_ctx)?;
    filter.validate()?;
    Ok(filter)
}

/// Build a policy's filter chain (implicit AND).
pub fn build_filter_chain(
    filters: &[Value],
    build_ctx: &FilterBuildCtx,
) -> Result<Vec<Arc<dyn Filter>>, PolicyError> {
    filters.iter().map(|f| build_filter(f, build_ctx)).collect()
}

/// Identity key for set operations over resources.
fn resource_key(resource: &Resource, type_def: &ResourceTypeDef) -> String {
    resource
        .id(type_def)
        .unwrap_or_else(|| resource.as_value().to_string())
}

// ---------------------------------------------------------------------------
// Value filter
// ---------------------------------------------------------------------------

/// The canonical `{key, op, value, value_type}` filter.
pub struct ValueFilter {
    matcher: ValueMatch,
    annotate: bool,
}

impl ValueFilter {
    pub fn from_config(data: &Value) -> Result<Self, PolicyError> {
        Ok(Self {
            matcher: ValueMatch::from_config(data)?,
            annotate: data
                .get("annotate")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

impl Filter for ValueFilter {
    fn name(&self) -> &str {
        "value"
    }

    fn matches(
        &self,
        resource: &mut Resource,
        _event: Option<&Event>,
        fctx: &FilterContext,
    ) -> Result<bool, PolicyError> {
        let matched = self.matcher.matches_doc(
            resource.as_value(),
            &fctx.type_def.tag_attr,
            fctx.ctx.now(),
            fctx.functions,
        )?;
        if matched && self.annotate {
            resource.push_annotation(MATCHED_FILTERS, json!(self.matcher.key));
        }
        Ok(matched)
    }

    fn process(
        &self,
        resources: Vec<Resource>,
        event: Option<&Event>,
        fctx: &FilterContext,
    ) -> Result<Vec<Resource>, PolicyError> {
        // resource_count compares the size of the result set: all or
        // nothing, evaluated once.
        if self.matcher.value_type == Some(ValueType::ResourceCount) {
            let count = Value::from(resources.len());
            let matched = self.matcher.compare(count, fctx.ctx.now())?;
            return Ok(if matched { resources } else { Vec::new() });
        }
        // Fall back to the default per-resource path.
        let mut kept = Vec::with_capacity(resources.len());
        for mut resource in resources {
            match self.matches(&mut resource, event, fctx) {
                Ok(true) => kept.push(resource),
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(
                        policy = %fctx.ctx.policy_name,
                        filter = "value",
                        error = %error,
                        "filter error, excluding resource"
                    );
                }
            }
        }
        Ok(kept)
    }
}

pub(crate) fn value_filter_schema(type_name: &str) -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["type", "key"],
        "properties": {
            "type": {"enum": [type_name]},
            "key": {"type": "string"},
            "op": {"enum": Op::NAMES},
            "value": {},
            "value_type": {"enum": ValueType::NAMES},
            "annotate": {"type": "boolean"},
        },
    })
}

// ---------------------------------------------------------------------------
// Boolean combinators
// ---------------------------------------------------------------------------

enum Combinator {
    And,
    Or,
    Not,
}

/// `and` / `or` / `not` over child filters. Set semantics are over resource
/// identity; input order is preserved.
pub struct BooleanFilter {
    kind: Combinator,
    children: Vec<Arc<dyn Filter>>,
}

impl BooleanFilter {
    fn from_config(
        kind: Combinator,
        data: &Value,
        build_ctx: &FilterBuildCtx,
    ) -> Result<Self, PolicyError> {
        let children = data
            .get("filters")
            .and_then(Value::as_array)
            .ok_or_else(|| PolicyError::invalid("combinator requires a filters list"))?;
        if children.is_empty() {
            return Err(PolicyError::invalid("combinator requires at least one filter"));
        }
        Ok(Self {
            kind,
            children: build_filter_chain(children, build_ctx)?,
        })
    }
}

impl Filter for BooleanFilter {
    fn name(&self) -> &str {
        match self.kind {
            Combinator::And => "and",
            Combinator::Or => "or",
            Combinator::Not => "not",
        }
    }

    fn get_permissions(&self) -> BTreeSet<String> {
        self.children
            .iter()
            .flat_map(|c| c.get_permissions())
            .collect()
    }

    fn matches(
        &self,
        resource: &mut Resource,
        event: Option<&Event>,
        fctx: &FilterContext,
    ) -> Result<bool, PolicyError> {
        match self.kind {
            Combinator::And => {
                for child in &self.children {
                    if !child.matches(resource, event, fctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Combinator::Or => {
                for child in &self.children {
                    if child.matches(resource, event, fctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Combinator::Not => {
                for child in &self.children {
                    if !child.matches(resource, event, fctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Set-level semantics: `and` intersects left to right with
    /// short-circuit, `or` unions, `not` complements against the input.
    fn process(
        &self,
        resources: Vec<Resource>,
        event: Option<&Event>,
        fctx: &FilterContext,
    ) -> Result<Vec<Resource>, PolicyError> {
        match self.kind {
            Combinator::And => {
                let mut current = resources;
                for child in &self.children {
                    if current.is_empty() {
                        break;
                    }
                    current = child.process(current, event, fctx)?;
                }
                Ok(current)
            }
            Combinator::Or => {
                let order: Vec<String> = resources
                    .iter()
                    .map(|r| resource_key(r, fctx.type_def))
                    .collect();
                let mut matched: std::collections::BTreeMap<String, Resource> =
                    std::collections::BTreeMap::new();
                let mut remaining = resources;
                for child in &self.children {
                    if remaining.is_empty() {
                        break;
                    }
                    let hits = child.process(remaining.clone(), event, fctx)?;
                    for hit in hits {
                        let key = resource_key(&hit, fctx.type_def);
                        remaining.retain(|r| resource_key(r, fctx.type_def) != key);
                        matched.insert(key, hit);
                    }
                }
                Ok(order.iter().filter_map(|k| matched.remove(k)).collect())
            }
            Combinator::Not => {
                // Children are ANDed, then complemented against the input.
                let mut current = resources.clone();
                for child in &self.children {
                    if current.is_empty() {
                        break;
                    }
                    current = child.process(current, event, fctx)?;
                }
                let excluded: BTreeSet<String> = current
                    .iter()
                    .map(|r| resource_key(r, fctx.type_def))
                    .collect();
                Ok(resources
                    .into_iter()
                    .filter(|r| !excluded.contains(&resource_key(r, fctx.type_def)))
                    .collect())
            }
        }
    }
}

fn combinator_schema(name: &str) -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["type", "filters"],
        "properties": {
            "type": {"enum": [name]},
            "filters": {"type": "array", "items": {"$ref": "#/filters"}},
        },
    })
}

// ---------------------------------------------------------------------------
// Event filter
// ---------------------------------------------------------------------------

/// Matches on the triggering event rather than the resource. Passes every
/// resource through when it matches (or when there is no event), none when
/// it does not.
pub struct EventFilter {
    matcher: ValueMatch,
}

impl Filter for EventFilter {
    fn name(&self) -> &str {
        "event"
    }

    fn matches(
        &self,
        _resource: &mut Resource,
        event: Option<&Event>,
        fctx: &FilterContext,
    ) -> Result<bool, PolicyError> {
        let Some(event) = event else {
            return Ok(true);
        };
        self.matcher.matches_doc(
            event.as_value(),
            &fctx.type_def.tag_attr,
            fctx.ctx.now(),
            fctx.functions,
        )
    }
}

// ---------------------------------------------------------------------------
// Base registry
// ---------------------------------------------------------------------------

/// The filter set every resource type inherits.
pub fn base_filter_registry() -> FilterRegistry {
    let mut reg = FilterRegistry::new("filters.base");
    let register = |reg: &mut FilterRegistry, name: &str, plugin: Arc<FilterPlugin>| {
        // Base registration happens once at startup; names are static.
        reg.register(name, plugin)
            .unwrap_or_else(|e| panic!("base filter registry: {e}"));
    };

    register(
        &mut reg,
        "value",
        FilterPlugin::new(value_filter_schema("value"), |data, _| {
            Ok(Arc::new(ValueFilter::from_config(data)?))
        }),
    );
    register(
        &mut reg,
        "event",
        FilterPlugin::new(value_filter_schema("event"), |data, _| {
            Ok(Arc::new(EventFilter {
                matcher: ValueMatch::from_config(data)?,
            }))
        }),
    );
    register(
        &mut reg,
        "and",
        FilterPlugin::new(combinator_schema("and"), |data, build_ctx| {
            Ok(Arc::new(BooleanFilter::from_config(
                Combinator::And,
                data,
                build_ctx,
            )?))
        }),
    );
    register(
        &mut reg,
        "or",
        FilterPlugin::new(combinator_schema("or"), |data, build_ctx| {
            Ok(Arc::new(BooleanFilter::from_config(
                Combinator::Or,
                data,
                build_ctx,
            )?))
        }),
    );
    register(
        &mut reg,
        "not",
        FilterPlugin::new(combinator_schema("not"), |data, build_ctx| {
            Ok(Arc::new(BooleanFilter::from_config(
                Combinator::Not,
                data,
                build_ctx,
            )?))
        }),
    );
    register(
        &mut reg,
        "marked-for-op",
        FilterPlugin::new(tags::marked_for_op_schema(), |data, _| {
            Ok(Arc::new(MarkedForOpFilter::from_config(data)?))
        }),
    );
    register(
        &mut reg,
        "tag-count",
        FilterPlugin::new(tags::tag_count_schema(), |data, _| {
            Ok(Arc::new(TagCountFilter::from_config(data)?))
        }),
    );
    register(
        &mut reg,
        "metrics",
        FilterPlugin::new(metrics::metrics_schema(), |data, build_ctx| {
            Ok(Arc::new(MetricsFilter::from_config(data, build_ctx.type_def)?))
        }),
    );
    register(
        &mut reg,
        "offhour",
        FilterPlugin::new(offhours::offhours_schema("offhour"), |data, _| {
            Ok(Arc::new(OffHourFilter::from_config(data, false)?))
        }),
    );
    register(
        &mut reg,
        "onhour",
        FilterPlugin::new(offhours::offhours_schema("onhour"), |data, _| {
            Ok(Arc::new(OffHourFilter::from_config(data, true)?))
        }),
    );
    reg
}
