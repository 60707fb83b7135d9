//! The action engine.
//!
//! Actions are mutation plugins applied to the matched resource set.
//! Execution is chunked: the executor partitions resources by the action's
//! chunk size, fans the chunks out over a bounded worker pool, retries
//! transient cloud errors with exponential backoff, and aggregates
//! per-chunk failures without stopping sibling chunks. In dry-run mode an
//! action is built and its permissions surfaced, but `process_chunk` never
//! runs.

mod tags;

pub use tags::{MarkForOpAction, RemoveTagAction, TagAction};

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};

use warden_core::client::CloudClient;
use warden_core::context::ExecutionContext;
use warden_core::error::PolicyError;
use warden_core::event::Event;
use warden_core::registry::Registry;
use warden_core::resource::{Resource, ResourceTypeDef};

pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Shared state actions execute under.
pub struct ActionContext<'a> {
    pub ctx: &'a ExecutionContext,
    pub type_def: &'a ResourceTypeDef,
    pub client: &'a dyn CloudClient,
    pub event: Option<&'a Event>,
}

/// Mutation plugin over matched resources.
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self) -> Result<(), PolicyError> {
        Ok(())
    }

    fn get_permissions(&self) -> BTreeSet<String>;

    fn chunk_size(&self) -> usize {
        DEFAULT_CHUNK_SIZE
    }

    /// When true, a failed chunk stops remaining chunks of this action.
    fn halt_on_error(&self) -> bool {
        false
    }

    /// Apply the mutation to one chunk. Resources are mutable so actions
    /// can mirror their effect locally (tag writes, annotations).
    fn process_chunk(
        &self,
        resources: &mut [Resource],
        actx: &ActionContext,
    ) -> Result<(), PolicyError>;
}

/// Context handed to action factories.
pub struct ActionBuildCtx<'a> {
    pub registry: &'a ActionRegistry,
    pub type_def: &'a ResourceTypeDef,
}

type ActionFactory =
    dyn Fn(&Value, &ActionBuildCtx) -> Result<Arc<dyn Action>, PolicyError> + Send + Sync;

pub struct ActionPlugin {
    pub schema: Value,
    pub build: Box<ActionFactory>,
}

impl ActionPlugin {
    pub fn new(
        schema: Value,
        build: impl Fn(&Value, &ActionBuildCtx) -> Result<Arc<dyn Action>, PolicyError>
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

pub type ActionRegistry = Registry<ActionPlugin>;

/// Build one action from config. `{"type": "stop"}` or the string
/// shorthand `"stop"`.
pub fn build_action(data: &Value, build_ctx: &ActionBuildCtx) -> Result<Arc<dyn Action>, PolicyError> {
    let normalized = match data {
        Value::String(name) => json!({"type": name}),
        other => other.clone(),
    };
    let name = normalized
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| PolicyError::invalid(format!("action missing type: {data}")))?;
    let plugin = build_ctx.registry.get(name).ok_or_else(|| {
        PolicyError::invalid(format!(
            "unknown action {:?} for resource type {:?}",
            name, build_ctx.type_def.name
        ))
    })?;
    let action = (plugin.build)(&normalized, build_ctx)?;
    action.validate()?;
    Ok(action)
}

pub fn build_action_chain(
    actions: &[Value],
    build_ctx: &ActionBuildCtx,
) -> Result<Vec<Arc<dyn Action>>, PolicyError> {
    actions.iter().map(|a| build_action(a, build_ctx)).collect()
}

/// One failed chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ActionFailure {
    pub resource_ids: Vec<String>,
    pub error: String,
}

/// Aggregate outcome of one action over the matched set.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub action: String,
    pub processed: usize,
    pub failed: usize,
    pub dry_run: bool,
    pub errors: Vec<ActionFailure>,
}

impl ActionResult {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Drives chunked, retried, parallel execution of a single action.
pub struct ActionExecutor {
    /// Worker-pool width for chunk fan-out.
    pub parallelism: usize,
    /// Total attempts per chunk, including the first.
    pub max_attempts: usize,
    /// Base backoff delay, doubled per retry.
    pub backoff: Duration,
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self {
            parallelism: 2,
            max_attempts: 5,
            backoff: Duration::from_millis(250),
        }
    }
}

impl ActionExecutor {
    pub fn run(
        &self,
        action: &dyn Action,
        resources: &mut [Resource],
        actx: &ActionContext,
    ) -> ActionResult {
        if actx.ctx.dry_run {
            // Surface required permissions so missing privileges show up
            // in a dry run, but perform no mutation.
            tracing::info!(
                policy = %actx.ctx.policy_name,
                action = %action.name(),
                permissions = ?action.get_permissions(),
                resources = resources.len(),
                "dry-run: skipping action"
            );
            return ActionResult {
                action: action.name().to_string(),
                processed: 0,
                failed: 0,
                dry_run: true,
                errors: Vec::new(),
            };
        }

        let chunk_size = action.chunk_size().max(1);
        let queue: Mutex<VecDeque<&mut [Resource]>> =
            Mutex::new(resources.chunks_mut(chunk_size).collect());
        let workers = self.parallelism.clamp(1, queue.lock().len().max(1));
        let processed = AtomicUsize::new(0);
        let poisoned = AtomicBool::new(false);
        let failures: Mutex<Vec<ActionFailure>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        if poisoned.load(Ordering::SeqCst) && action.halt_on_error() {
                            return;
                        }
                        let Some(chunk) = queue.lock().pop_front() else {
                            return;
                        };
                        let ids: Vec<String> = chunk
                            .iter()
                            .filter_map(|r| r.id(actx.type_def))
                            .collect();
                        match self.run_chunk(action, chunk, actx) {
                            Ok(()) => {
                                processed.fetch_add(ids.len(), Ordering::SeqCst);
                            }
                            Err(error) => {
                                tracing::error!(
                                    policy = %actx.ctx.policy_name,
                                    resource_type = %actx.type_def.name,
                                    action = %action.name(),
                                    resources = ?ids,
                                    error = %error,
                                    "action chunk failed"
                                );
                                poisoned.store(true, Ordering::SeqCst);
                                failures.lock().push(ActionFailure {
                                    resource_ids: ids,
                                    error: error.to_string(),
                                });
                            }
                        }
                    }
                });
            }
        });

        let errors = failures.into_inner();
        ActionResult {
            action: action.name().to_string(),
            processed: processed.into_inner(),
            failed: errors.iter().map(|f| f.resource_ids.len()).sum(),
            dry_run: false,
            errors,
        }
    }

    /// One chunk with retry. Only transient cloud errors are retried.
    fn run_chunk(
        &self,
        action: &dyn Action,
        chunk: &mut [Resource],
        actx: &ActionContext,
    ) -> Result<(), PolicyError> {
        let mut attempt = 1;
        loop {
            match action.process_chunk(chunk, actx) {
                Ok(()) => return Ok(()),
                Err(PolicyError::Cloud(err)) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt as u32 - 1);
                    tracing::warn!(
                        action = %action.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient error, backing off"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Issue a mutation operation and drain its response pages.
pub(crate) fn invoke_mutation(
    actx: &ActionContext,
    service: &str,
    operation: &str,
    params: &Value,
) -> Result<(), PolicyError> {
    actx.ctx.api_stats.record_mutation(service, operation);
    let pages = actx.client.operation(service, operation, params)?;
    for page in pages {
        page?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Generic cloud-operation action
// ---------------------------------------------------------------------------

/// A mutation action that maps directly onto one cloud operation taking a
/// list of resource ids (`delete`, `stop`, `start`, ...). Providers
/// register one per resource type via [`CloudOpAction::plugin`].
pub struct CloudOpAction {
    name: String,
    service: String,
    operation: String,
    param: String,
    permissions: Vec<String>,
    chunk_size: usize,
    halt_on_error: bool,
}

impl CloudOpAction {
    /// Registry entry for an id-list mutation operation.
    pub fn plugin(
        name: &str,
        operation: &str,
        param: &str,
        permissions: &[&str],
    ) -> Arc<ActionPlugin> {
        let name = name.to_string();
        let operation = operation.to_string();
        let param = param.to_string();
        let permissions: Vec<String> = permissions.iter().map(|p| p.to_string()).collect();
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["type"],
            "properties": {
                "type": {"enum": [name]},
                "chunk-size": {"type": "integer", "minimum": 1},
                "halt-on-error": {"type": "boolean"},
            },
        });
        ActionPlugin::new(schema, move |data, build_ctx| {
            Ok(Arc::new(CloudOpAction {
                name: name.clone(),
                service: build_ctx.type_def.service.clone(),
                operation: operation.clone(),
                param: param.clone(),
                permissions: permissions.clone(),
                chunk_size: data
                    .get("chunk-size")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_CHUNK_SIZE),
                halt_on_error: data
                    .get("halt-on-error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }))
        })
    }
}

impl Action for CloudOpAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_permissions(&self) -> BTreeSet<String> {
        self.permissions.iter().cloned().collect()
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn halt_on_error(&self) -> bool {
        self.halt_on_error
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
        let params = json!({self.param.clone(): ids});
        invoke_mutation(actx, &self.service, &self.operation, &params)
    }
}

// ---------------------------------------------------------------------------
// Notify / webhook
// ---------------------------------------------------------------------------

/// Compose a notification message and hand it to the messaging transport
/// (`("messaging", "Send")` on the cloud client).
pub struct NotifyAction {
    to: Vec<String>,
    subject: Option<String>,
    chunk_size: usize,
}

impl NotifyAction {
    pub fn from_config(data: &Value) -> Result<Self, PolicyError> {
        let to = data
            .get("to")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if to.is_empty() {
            return Err(PolicyError::invalid("notify requires a non-empty to list"));
        }
        Ok(Self {
            to,
            subject: data
                .get("subject")
                .and_then(Value::as_str)
                .map(str::to_string),
            chunk_size: data
                .get("chunk-size")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
        })
    }
}

impl Action for NotifyAction {
    fn name(&self) -> &str {
        "notify"
    }

    fn get_permissions(&self) -> BTreeSet<String> {
        BTreeSet::from(["messaging:Send".to_string()])
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn process_chunk(
        &self,
        resources: &mut [Resource],
        actx: &ActionContext,
    ) -> Result<(), PolicyError> {
        let message = json!({
            "policy": actx.ctx.policy_name,
            "resource_type": actx.type_def.name,
            "account": actx.ctx.account_id,
            "region": actx.ctx.region,
            "to": self.to,
            "subject": self.subject,
            "event": actx.event.map(|e| e.as_value().clone()),
            "resources": resources
                .iter()
                .map(|r| r.without_annotations().into_value())
                .collect::<Vec<_>>(),
        });
        invoke_mutation(actx, "messaging", "Send", &message)
    }
}

pub(crate) fn notify_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["type", "to"],
        "properties": {
            "type": {"enum": ["notify"]},
            "to": {"type": "array", "items": {"type": "string"}, "minItems": 1},
            "subject": {"type": "string"},
            "chunk-size": {"type": "integer", "minimum": 1},
        },
    })
}

/// POST matched resource ids to an HTTP endpoint via the client's
/// `("http", "POST")` transport.
pub struct WebhookAction {
    url: String,
    chunk_size: usize,
}

impl WebhookAction {
    pub fn from_config(data: &Value) -> Result<Self, PolicyError> {
        let url = data
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| PolicyError::invalid("webhook requires a url"))?
            .to_string();
        Ok(Self {
            url,
            chunk_size: data
                .get("chunk-size")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
        })
    }
}

impl Action for WebhookAction {
    fn name(&self) -> &str {
        "webhook"
    }

    fn get_permissions(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn process_chunk(
        &self,
        resources: &mut [Resource],
        actx: &ActionContext,
    ) -> Result<(), PolicyError> {
        let body = json!({
            "policy": actx.ctx.policy_name,
            "resource_type": actx.type_def.name,
            "resources": resources
                .iter()
                .filter_map(|r| r.id(actx.type_def))
                .collect::<Vec<_>>(),
        });
        let params = json!({"url": self.url, "body": body});
        invoke_mutation(actx, "http", "POST", &params)
    }
}

pub(crate) fn webhook_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["type", "url"],
        "properties": {
            "type": {"enum": ["webhook"]},
            "url": {"type": "string"},
            "chunk-size": {"type": "integer", "minimum": 1},
        },
    })
}

// ---------------------------------------------------------------------------
// Base registry
// ---------------------------------------------------------------------------

/// Actions every taggable-aware resource type inherits.
pub fn base_action_registry() -> ActionRegistry {
    let mut reg = ActionRegistry::new("actions.base");
    let register = |reg: &mut ActionRegistry, name: &str, plugin: Arc<ActionPlugin>| {
        reg.register(name, plugin)
            .unwrap_or_else(|e| panic!("base action registry: {e}"));
    };

    register(
        &mut reg,
        "tag",
        ActionPlugin::new(tags::tag_schema(), |data, build_ctx| {
            Ok(Arc::new(TagAction::from_config(data, build_ctx.type_def)?))
        }),
    );
    register(
        &mut reg,
        "remove-tag",
        ActionPlugin::new(tags::remove_tag_schema(), |data, build_ctx| {
            Ok(Arc::new(RemoveTagAction::from_config(
                data,
                build_ctx.type_def,
            )?))
        }),
    );
    register(
        &mut reg,
        "mark-for-op",
        ActionPlugin::new(tags::mark_for_op_schema(), |data, build_ctx| {
            Ok(Arc::new(MarkForOpAction::from_config(
                data,
                build_ctx.type_def,
            )?))
        }),
    );
    register(
        &mut reg,
        "notify",
        ActionPlugin::new(notify_schema(), |data, _| {
            Ok(Arc::new(NotifyAction::from_config(data)?))
        }),
    );
    register(
        &mut reg,
        "webhook",
        ActionPlugin::new(webhook_schema(), |data, _| {
            Ok(Arc::new(WebhookAction::from_config(data)?))
        }),
    );
    reg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_core::client::StaticCloudClient;
    use warden_core::error::CloudError;

    fn ec2_def() -> ResourceTypeDef {
        let mut def =
            ResourceTypeDef::new("ec2", "ec2", "InstanceId", "DescribeInstances", "[]");
        def.taggable = true;
        def
    }

    fn make_resources(n: usize) -> Vec<Resource> {
        (0..n)
            .map(|i| Resource::new(json!({"InstanceId": format!("i-{i:03}")})))
            .collect()
    }

    fn executor() -> ActionExecutor {
        ActionExecutor {
            parallelism: 3,
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    fn delete_action(build_ctx: &ActionBuildCtx) -> Arc<dyn Action> {
        let plugin = CloudOpAction::plugin(
            "delete",
            "TerminateInstances",
            "InstanceIds",
            &["ec2:TerminateInstances"],
        );
        (plugin.build)(&json!({"type": "delete"}), build_ctx).unwrap()
    }

    #[test]
    fn chunked_execution_accounts_for_all_resources() {
        let client = StaticCloudClient::new();
        let ctx = ExecutionContext::ephemeral("p", "ec2");
        let type_def = ec2_def();
        let registry = base_action_registry();
        let build_ctx = ActionBuildCtx {
            registry: &registry,
            type_def: &type_def,
        };
        let action = delete_action(&build_ctx);

        let mut resources = make_resources(57);
        let actx = ActionContext {
            ctx: &ctx,
            type_def: &type_def,
            client: &client,
            event: None,
        };
        let result = executor().run(action.as_ref(), &mut resources, &actx);

        // 57 resources in chunks of 20: three calls covering every id.
        assert_eq!(result.processed, 57);
        assert_eq!(result.failed, 0);
        assert_eq!(client.call_count("ec2", "TerminateInstances"), 3);
        let mut seen: Vec<String> = client
            .calls()
            .iter()
            .flat_map(|c| {
                c.params["InstanceIds"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|v| v.as_str().unwrap().to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 57);
    }

    #[test]
    fn failed_chunk_does_not_stop_siblings() {
        let client = StaticCloudClient::new();
        client.fail_next(
            "ec2",
            "TerminateInstances",
            vec![CloudError::permanent("ec2.TerminateInstances", "denied")],
        );
        let ctx = ExecutionContext::ephemeral("p", "ec2");
        let type_def = ec2_def();
        let registry = base_action_registry();
        let build_ctx = ActionBuildCtx {
            registry: &registry,
            type_def: &type_def,
        };
        let action = delete_action(&build_ctx);

        let mut resources = make_resources(57);
        let actx = ActionContext {
            ctx: &ctx,
            type_def: &type_def,
            client: &client,
            event: None,
        };
        let result = executor().run(action.as_ref(), &mut resources, &actx);

        assert_eq!(result.failed, 20);
        assert_eq!(result.processed, 37);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].resource_ids.len(), 20);
        assert!(!result.ok());
        // All three chunks were attempted.
        assert_eq!(client.call_count("ec2", "TerminateInstances"), 3);
    }

    #[test]
    fn transient_errors_are_retried() {
        let client = StaticCloudClient::new();
        client.fail_next(
            "ec2",
            "TerminateInstances",
            vec![
                CloudError::transient("ec2.TerminateInstances", "throttled"),
                CloudError::transient("ec2.TerminateInstances", "throttled"),
            ],
        );
        let ctx = ExecutionContext::ephemeral("p", "ec2");
        let type_def = ec2_def();
        let registry = base_action_registry();
        let build_ctx = ActionBuildCtx {
            registry: &registry,
            type_def: &type_def,
        };
        let action = delete_action(&build_ctx);

        let mut resources = make_resources(5);
        let actx = ActionContext {
            ctx: &ctx,
            type_def: &type_def,
            client: &client,
            event: None,
        };
        let result = executor().run(action.as_ref(), &mut resources, &actx);
        assert_eq!(result.processed, 5);
        assert_eq!(result.failed, 0);
        // Two throttles then success.
        assert_eq!(client.call_count("ec2", "TerminateInstances"), 3);
    }

    #[test]
    fn dry_run_makes_no_mutation_calls() {
        let client = StaticCloudClient::new();
        let mut ctx = ExecutionContext::ephemeral("p", "ec2");
        ctx.dry_run = true;
        let type_def = ec2_def();
        let registry = base_action_registry();
        let build_ctx = ActionBuildCtx {
            registry: &registry,
            type_def: &type_def,
        };
        let action = delete_action(&build_ctx);

        let mut resources = make_resources(10);
        let actx = ActionContext {
            ctx: &ctx,
            type_def: &type_def,
            client: &client,
            event: None,
        };
        let result = executor().run(action.as_ref(), &mut resources, &actx);
        assert!(result.dry_run);
        assert_eq!(result.processed, 0);
        assert_eq!(client.calls().len(), 0);
        assert_eq!(ctx.api_stats.mutation_calls(), 0);
    }

    #[test]
    fn string_shorthand_builds_action() {
        let type_def = ec2_def();
        let mut registry = base_action_registry();
        registry
            .register(
                "delete",
                CloudOpAction::plugin("delete", "TerminateInstances", "InstanceIds", &[]),
            )
            .unwrap();
        let build_ctx = ActionBuildCtx {
            registry: &registry,
            type_def: &type_def,
        };
        assert!(build_action(&json!("delete"), &build_ctx).is_ok());
        assert!(build_action(&json!("no-such"), &build_ctx).is_err());
    }
}
