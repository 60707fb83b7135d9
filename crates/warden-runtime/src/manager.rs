//! The per-resource-type driver.
//!
//! A `ResourceManager` binds one registered resource type to a cloud client
//! and drives the enumerate → augment → cache pipeline. Enumeration pages
//! through the type's `enum_spec` operation and projects each page through
//! its result-path expression; augmentation fetches per-resource detail in
//! parallel and resolves universal tags through the central tagging API.
//! Results are memoized in the advisory cross-policy cache.

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value, json};

use warden_core::cache::{Cache, CacheKey};
use warden_core::client::CloudClient;
use warden_core::context::ExecutionContext;
use warden_core::error::{CloudError, PolicyError};
use warden_core::event::Event;
use warden_core::resource::Resource;
use warden_policy::actions::Action;
use warden_policy::filters::{Filter, FilterContext};
use warden_policy::provider::ResourcePlugin;
use warden_query::{FunctionRegistry, Query};

/// Tag-resolution chunk size for the central tagging API.
const TAG_CHUNK: usize = 20;

pub struct ResourceManager {
    plugin: Arc<ResourcePlugin>,
    client: Arc<dyn CloudClient>,
    cache: Arc<Cache>,
    functions: Arc<FunctionRegistry>,
    /// Extra enumeration parameters from the policy's `query` block.
    query: Option<Value>,
    /// Mass-mutation guard from the policy's `max-resources`.
    max_resources: Option<usize>,
}

impl ResourceManager {
    pub fn new(plugin: Arc<ResourcePlugin>, client: Arc<dyn CloudClient>, cache: Arc<Cache>) -> Self {
        Self {
            plugin,
            client,
            cache,
            functions: Arc::new(FunctionRegistry::builtins()),
            query: None,
            max_resources: None,
        }
    }

    pub fn with_query(mut self, query: Option<Value>) -> Self {
        self.query = query;
        self
    }

    pub fn with_max_resources(mut self, limit: Option<usize>) -> Self {
        self.max_resources = limit;
        self
    }

    pub fn plugin(&self) -> &Arc<ResourcePlugin> {
        &self.plugin
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    fn enum_params(&self) -> Value {
        let mut params = Map::new();
        if let Some(Value::Object(extra)) = &self.plugin.type_def.enum_spec.extra_params {
            params.extend(extra.clone());
        }
        if let Some(Value::Object(query)) = &self.query {
            params.extend(query.clone());
        }
        Value::Object(params)
    }

    fn cache_key(&self, ctx: &ExecutionContext) -> CacheKey {
        let params = self.enum_params();
        let digest = if params.as_object().is_some_and(Map::is_empty) {
            "0".to_string()
        } else {
            params.to_string()
        };
        CacheKey::new(
            &ctx.account_id,
            &ctx.region,
            &self.plugin.type_def.name,
            digest,
        )
    }

    /// Primary entry: cached, paginated enumeration plus augmentation.
    pub fn resources(&self, ctx: &ExecutionContext) -> Result<Vec<Resource>, PolicyError> {
        let span = ctx.span("resources");
        let _guard = span.enter();

        let key = self.cache_key(ctx);
        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!(
                resource_type = %self.plugin.type_def.name,
                count = cached.len(),
                "enumeration cache hit"
            );
            return Ok(cached.into_iter().map(Resource::new).collect());
        }

        let mut resources = self.enumerate(ctx)?;
        if let Some(limit) = self.max_resources {
            if resources.len() > limit {
                return Err(PolicyError::ResourceLimit {
                    policy: ctx.policy_name.clone(),
                    count: resources.len(),
                    limit,
                });
            }
        }
        self.augment(&mut resources, ctx)?;

        self.cache.put(
            key,
            resources.iter().map(|r| r.as_value().clone()).collect(),
        );
        tracing::info!(
            policy = %ctx.policy_name,
            resource_type = %self.plugin.type_def.name,
            count = resources.len(),
            "resources enumerated"
        );
        Ok(resources)
    }

    fn enumerate(&self, ctx: &ExecutionContext) -> Result<Vec<Resource>, PolicyError> {
        let spec = &self.plugin.type_def.enum_spec;
        let path = Query::compile(&spec.path)
            .map_err(|e| PolicyError::execution(format!("bad result path {:?}: {e}", spec.path)))?;
        let params = self.enum_params();

        ctx.api_stats
            .record(&self.plugin.type_def.service, &spec.operation);
        let pages = self
            .client
            .operation(&self.plugin.type_def.service, &spec.operation, &params)?;

        let mut resources = Vec::new();
        for page in pages {
            let page = page?;
            let projected = path
                .search_with(&page, &self.functions)
                .map_err(|e| PolicyError::execution(format!("result projection failed: {e}")))?;
            match projected {
                Value::Array(items) => resources.extend(items.into_iter().map(Resource::new)),
                Value::Null => {}
                single => resources.push(Resource::new(single)),
            }
        }
        Ok(resources)
    }

    /// Targeted lookup for event mode. A `NotFound` from the client is
    /// logged and yields an empty set.
    pub fn get_resources(
        &self,
        ids: &[String],
        ctx: &ExecutionContext,
    ) -> Result<Vec<Resource>, PolicyError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let spec = &self.plugin.type_def.enum_spec;
        let path = Query::compile(&spec.path)
            .map_err(|e| PolicyError::execution(format!("bad result path {:?}: {e}", spec.path)))?;
        let mut params = match self.enum_params() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        params.insert("ids".to_string(), json!(ids));

        ctx.api_stats
            .record(&self.plugin.type_def.service, &spec.operation);
        let pages = match self.client.operation(
            &self.plugin.type_def.service,
            &spec.operation,
            &Value::Object(params),
        ) {
            Ok(pages) => pages,
            Err(CloudError::NotFound(id)) => {
                tracing::warn!(resource = %id, "resource not found during event resolution");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let wanted: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        let mut resources = Vec::new();
        for page in pages {
            let page = match page {
                Ok(page) => page,
                Err(CloudError::NotFound(id)) => {
                    tracing::warn!(resource = %id, "resource not found during event resolution");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let projected = path
                .search_with(&page, &self.functions)
                .map_err(|e| PolicyError::execution(format!("result projection failed: {e}")))?;
            let items = match projected {
                Value::Array(items) => items,
                Value::Null => continue,
                single => vec![single],
            };
            resources.extend(
                items
                    .into_iter()
                    .map(Resource::new)
                    .filter(|r| {
                        r.id(&self.plugin.type_def)
                            .is_some_and(|id| wanted.contains(id.as_str()))
                    }),
            );
        }
        self.augment(&mut resources, ctx)?;
        Ok(resources)
    }

    /// Apply the compiled filter chain (implicit AND) with a span per
    /// filter.
    pub fn filter_resources(
        &self,
        filters: &[Arc<dyn Filter>],
        mut resources: Vec<Resource>,
        event: Option<&Event>,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Resource>, PolicyError> {
        let fctx = FilterContext {
            ctx,
            type_def: &self.plugin.type_def,
            functions: &self.functions,
            client: Some(self.client.as_ref()),
        };
        for filter in filters {
            let before = resources.len();
            let span = ctx.span(filter.name());
            let _guard = span.enter();
            resources = filter.process(resources, event, &fctx)?;
            tracing::debug!(
                policy = %ctx.policy_name,
                filter = %filter.name(),
                before,
                after = resources.len(),
                "filter applied"
            );
            if resources.is_empty() {
                break;
            }
        }
        Ok(resources)
    }

    /// Union of permissions from the type descriptor, filters and actions.
    pub fn get_permissions(
        &self,
        filters: &[Arc<dyn Filter>],
        actions: &[Arc<dyn Action>],
    ) -> BTreeSet<String> {
        let mut perms: BTreeSet<String> =
            self.plugin.type_def.permissions.iter().cloned().collect();
        for filter in filters {
            perms.extend(filter.get_permissions());
        }
        for action in actions {
            perms.extend(action.get_permissions());
        }
        perms
    }

    /// Detail augmentation plus universal tag resolution.
    fn augment(
        &self,
        resources: &mut [Resource],
        ctx: &ExecutionContext,
    ) -> Result<(), PolicyError> {
        if resources.is_empty() {
            return Ok(());
        }
        if self.plugin.type_def.detail_spec.is_some() {
            self.augment_detail(resources, ctx)?;
        }
        if self.plugin.type_def.universal_taggable {
            self.augment_tags(resources, ctx)?;
        }
        Ok(())
    }

    /// Fetch per-resource detail over a bounded worker pool and merge it.
    /// Detail failures degrade to a warning; the resource keeps its
    /// enumeration shape.
    fn augment_detail(
        &self,
        resources: &mut [Resource],
        ctx: &ExecutionContext,
    ) -> Result<(), PolicyError> {
        let type_def = &self.plugin.type_def;
        let spec = type_def
            .detail_spec
            .as_ref()
            .unwrap_or_else(|| unreachable!());
        let path = Query::compile(&spec.path)
            .map_err(|e| PolicyError::execution(format!("bad detail path {:?}: {e}", spec.path)))?;

        let queue: Mutex<VecDeque<&mut Resource>> = Mutex::new(resources.iter_mut().collect());
        let workers = ctx.concurrency.max(1);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let Some(resource) = queue.lock().pop_front() else {
                            return;
                        };
                        let Some(id) = resource.id(type_def) else {
                            continue;
                        };
                        let params = json!({spec.param.clone(): id});
                        ctx.api_stats.record(&type_def.service, &spec.operation);
                        let detail = self
                            .client
                            .operation(&type_def.service, &spec.operation, &params)
                            .and_then(|mut pages| pages.next().unwrap_or(Ok(Value::Null)));
                        match detail {
                            Ok(page) => {
                                if let Ok(projected) = path.search_with(&page, &self.functions) {
                                    resource.merge(&projected, type_def);
                                }
                            }
                            Err(error) => {
                                tracing::warn!(
                                    resource = %id,
                                    operation = %spec.operation,
                                    error = %error,
                                    "detail fetch failed, keeping enumeration shape"
                                );
                            }
                        }
                    }
                });
            }
        });
        Ok(())
    }

    /// Resolve tags for universal-taggable types through
    /// `("tagging", "GetResources")`; pages carry `{Id, Tags}` entries.
    fn augment_tags(
        &self,
        resources: &mut [Resource],
        ctx: &ExecutionContext,
    ) -> Result<(), PolicyError> {
        let type_def = &self.plugin.type_def;
        let ids: Vec<String> = resources.iter().filter_map(|r| r.id(type_def)).collect();
        let mut tag_map: std::collections::HashMap<String, Value> =
            std::collections::HashMap::new();

        for chunk in ids.chunks(TAG_CHUNK) {
            ctx.api_stats.record("tagging", "GetResources");
            let pages = self
                .client
                .operation("tagging", "GetResources", &json!({"ids": chunk}))?;
            for page in pages {
                let page = page?;
                let entries = match &page {
                    Value::Array(items) => items.as_slice(),
                    other => other
                        .get("Resources")
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or(&[]),
                };
                for entry in entries {
                    if let (Some(id), Some(tags)) =
                        (entry.get("Id").and_then(Value::as_str), entry.get("Tags"))
                    {
                        tag_map.insert(id.to_string(), tags.clone());
                    }
                }
            }
        }

        for resource in resources.iter_mut() {
            if let Some(tags) = resource.id(type_def).and_then(|id| tag_map.get(&id)) {
                resource.set(type_def.tag_attr.clone(), tags.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use warden_core::client::StaticCloudClient;
    use warden_core::resource::{DetailSpec, ResourceTypeDef};

    fn ec2_def() -> ResourceTypeDef {
        ResourceTypeDef::new(
            "ec2",
            "ec2",
            "InstanceId",
            "DescribeInstances",
            "Reservations[].Instances[]",
        )
    }

    fn manager_with(def: ResourceTypeDef, client: Arc<StaticCloudClient>, ttl: u64) -> ResourceManager {
        ResourceManager::new(
            Arc::new(ResourcePlugin::new(def)),
            client,
            Arc::new(if ttl == 0 {
                Cache::disabled()
            } else {
                Cache::new(Duration::from_secs(ttl))
            }),
        )
    }

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::ephemeral("test", "ec2");
        ctx.account_id = "123456789012".to_string();
        ctx.region = "us-east-1".to_string();
        ctx
    }

    #[test]
    fn enumeration_pages_and_projects() {
        let client = Arc::new(StaticCloudClient::new());
        client.respond(
            "ec2",
            "DescribeInstances",
            vec![
                json!({"Reservations": [{"Instances": [{"InstanceId": "i-1"}, {"InstanceId": "i-2"}]}]}),
                json!({"Reservations": [{"Instances": [{"InstanceId": "i-3"}]}]}),
            ],
        );
        let manager = manager_with(ec2_def(), client, 0);
        let resources = manager.resources(&ctx()).unwrap();
        let ids: Vec<_> = resources
            .iter()
            .map(|r| r.id(&manager.plugin().type_def).unwrap())
            .collect();
        assert_eq!(ids, vec!["i-1", "i-2", "i-3"]);
    }

    #[test]
    fn cache_hit_skips_the_api() {
        let client = Arc::new(StaticCloudClient::new());
        client.respond(
            "ec2",
            "DescribeInstances",
            vec![json!({"Reservations": [{"Instances": [{"InstanceId": "i-1"}]}]})],
        );
        let manager = manager_with(ec2_def(), client.clone(), 300);
        let c = ctx();
        assert_eq!(manager.resources(&c).unwrap().len(), 1);
        assert_eq!(manager.resources(&c).unwrap().len(), 1);
        assert_eq!(client.call_count("ec2", "DescribeInstances"), 1);
    }

    #[test]
    fn max_resources_guard_trips() {
        let client = Arc::new(StaticCloudClient::new());
        client.respond(
            "ec2",
            "DescribeInstances",
            vec![json!({"Reservations": [{"Instances": [
                {"InstanceId": "i-1"}, {"InstanceId": "i-2"}, {"InstanceId": "i-3"},
            ]}]})],
        );
        let manager = manager_with(ec2_def(), client, 0).with_max_resources(Some(2));
        let err = manager.resources(&ctx()).unwrap_err();
        assert!(matches!(
            err,
            PolicyError::ResourceLimit { count: 3, limit: 2, .. }
        ));
    }

    #[test]
    fn detail_augmentation_merges_without_touching_the_id() {
        let client = Arc::new(StaticCloudClient::new());
        client.respond(
            "lambda",
            "ListFunctions",
            vec![json!({"Functions": [{"FunctionName": "fn-a"}]})],
        );
        client.respond(
            "lambda",
            "GetFunctionConfiguration",
            vec![json!({"Configuration": {"FunctionName": "other", "MemorySize": 512}})],
        );
        let mut def = ResourceTypeDef::new(
            "lambda",
            "lambda",
            "FunctionName",
            "ListFunctions",
            "Functions[]",
        );
        def.detail_spec = Some(DetailSpec {
            operation: "GetFunctionConfiguration".to_string(),
            param: "FunctionName".to_string(),
            path: "Configuration".to_string(),
        });
        let manager = manager_with(def, client, 0);
        let resources = manager.resources(&ctx()).unwrap();
        assert_eq!(resources[0].get("MemorySize"), Some(&json!(512)));
        assert_eq!(resources[0].get("FunctionName"), Some(&json!("fn-a")));
    }

    #[test]
    fn universal_tags_resolved_through_tagging_api() {
        let client = Arc::new(StaticCloudClient::new());
        client.respond(
            "ec2",
            "DescribeInstances",
            vec![json!({"Reservations": [{"Instances": [{"InstanceId": "i-1"}]}]})],
        );
        client.respond(
            "tagging",
            "GetResources",
            vec![json!([{"Id": "i-1", "Tags": [{"Key": "Env", "Value": "prod"}]}])],
        );
        let mut def = ec2_def();
        def.universal_taggable = true;
        let manager = manager_with(def, client, 0);
        let resources = manager.resources(&ctx()).unwrap();
        assert_eq!(
            resources[0].tag(&manager.plugin().type_def.tag_attr, "Env"),
            Some("prod")
        );
    }

    #[test]
    fn get_resources_not_found_is_empty() {
        let client = Arc::new(StaticCloudClient::new());
        client.fail_next(
            "ec2",
            "DescribeInstances",
            vec![CloudError::NotFound("i-404".to_string())],
        );
        let manager = manager_with(ec2_def(), client, 0);
        let resources = manager
            .get_resources(&["i-404".to_string()], &ctx())
            .unwrap();
        assert!(resources.is_empty());
    }

    #[test]
    fn get_resources_filters_to_requested_ids() {
        let client = Arc::new(StaticCloudClient::new());
        client.respond(
            "ec2",
            "DescribeInstances",
            vec![json!({"Reservations": [{"Instances": [
                {"InstanceId": "i-1"}, {"InstanceId": "i-2"},
            ]}]})],
        );
        let manager = manager_with(ec2_def(), client, 0);
        let resources = manager.get_resources(&["i-2".to_string()], &ctx()).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(
            resources[0].id(&manager.plugin().type_def).as_deref(),
            Some("i-2")
        );
    }
}
