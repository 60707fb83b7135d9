//! One compiled policy and its execution.
//!
//! `PolicyData` is the parsed YAML shape; `Policy` is the compiled form
//! binding a resource plugin, filter chain, action chain and mode. `push`
//! executes the full pipeline under a scoped execution context: select
//! candidates per the mode, filter, write the matched set, then run the
//! action chain with the chunked executor.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use warden_core::cache::Cache;
use warden_core::client::SessionFactory;
use warden_core::context::{Clock, ExecutionContext};
use warden_core::error::PolicyError;
use warden_core::event::Event;
use warden_policy::actions::{
    Action, ActionBuildCtx, ActionContext, ActionExecutor, ActionResult, build_action_chain,
};
use warden_policy::filters::{Filter, FilterBuildCtx, build_filter_chain};
use warden_policy::provider::{Provider, ResourcePlugin};

use crate::manager::ResourceManager;
use crate::modes::{Compliance, Mode, Verdict};
use crate::output;

/// Parsed policy YAML. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyData {
    pub name: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(
        default,
        rename = "max-resources",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_resources: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Value>,
}

/// Interpolate `{placeholder}` variables through every string in `value`.
///
/// A string that is exactly one placeholder is replaced by the variable's
/// value with its type preserved; otherwise placeholders are rendered into
/// the string. Unknown placeholders are left untouched so late-binding
/// consumers can expand them.
pub fn expand_variables(value: &Value, vars: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(name) = s.strip_prefix('{').and_then(|rest| rest.strip_suffix('}')) {
                if let Some(replacement) = vars.get(name) {
                    return replacement.clone();
                }
            }
            let mut out = s.clone();
            for (name, replacement) in vars {
                let needle = format!("{{{name}}}");
                if out.contains(&needle) {
                    let rendered = match replacement {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    out = out.replace(&needle, &rendered);
                }
            }
            Value::String(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| expand_variables(v, vars)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_variables(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Options shared by every policy in a run.
pub struct RunOptions {
    pub output_dir: Option<std::path::PathBuf>,
    pub region: String,
    pub dry_run: bool,
    pub cache: Arc<Cache>,
    pub clock: Clock,
    pub concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            output_dir: None,
            region: String::new(),
            dry_run: false,
            cache: Arc::new(Cache::disabled()),
            clock: Clock::System,
            concurrency: 2,
        }
    }
}

/// Outcome of one policy execution.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyRunResult {
    pub policy: String,
    pub resource_count: usize,
    pub action_results: Vec<ActionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdicts: Option<Vec<Verdict>>,
    pub success: bool,
}

/// A compiled policy.
pub struct Policy {
    pub data: PolicyData,
    plugin: Arc<ResourcePlugin>,
    filters: Vec<Arc<dyn Filter>>,
    actions: Vec<Arc<dyn Action>>,
    mode: Mode,
}

impl Policy {
    /// Compile `data` against the provider's registries. Unknown resource
    /// types, filters, actions and malformed modes all surface here.
    pub fn compile(data: PolicyData, provider: &Provider) -> Result<Self, PolicyError> {
        let plugin = provider.resource(&data.resource).ok_or_else(|| {
            PolicyError::invalid(format!(
                "policy {:?} references unknown resource type {:?}",
                data.name, data.resource
            ))
        })?;
        let filters = build_filter_chain(
            &data.filters,
            &FilterBuildCtx {
                registry: &plugin.filters,
                type_def: &plugin.type_def,
            },
        )?;
        let actions = build_action_chain(
            &data.actions,
            &ActionBuildCtx {
                registry: &plugin.actions,
                type_def: &plugin.type_def,
            },
        )?;
        let mode = Mode::from_value(data.mode.as_ref())?;
        mode.validate(&plugin.type_def)?;
        Ok(Self {
            data,
            plugin,
            filters,
            actions,
            mode,
        })
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn resource_type(&self) -> &str {
        &self.plugin.type_def.name
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Union of permissions across the type descriptor, filters and
    /// actions.
    pub fn get_permissions(&self) -> BTreeSet<String> {
        let mut perms: BTreeSet<String> =
            self.plugin.type_def.permissions.iter().cloned().collect();
        for filter in &self.filters {
            perms.extend(filter.get_permissions());
        }
        for action in &self.actions {
            perms.extend(action.get_permissions());
        }
        perms
    }

    /// Execute the policy. `event` is required by event-driven modes and
    /// ignored by pull.
    pub fn push(
        &self,
        event: Option<&Event>,
        factory: &dyn SessionFactory,
        opts: &RunOptions,
    ) -> Result<PolicyRunResult, PolicyError> {
        let mut ctx = ExecutionContext::acquire(
            &self.data.name,
            &self.plugin.type_def.name,
            opts.output_dir.as_deref(),
            opts.clock.clone(),
        )?;
        ctx.region = opts.region.clone();
        ctx.account_id = factory.account_id();
        ctx.dry_run = opts.dry_run;
        ctx.concurrency = opts.concurrency.max(1);

        let result = self.run_pipeline(event, factory, opts, &ctx);
        ctx.close()?;
        result
    }

    fn run_pipeline(
        &self,
        event: Option<&Event>,
        factory: &dyn SessionFactory,
        opts: &RunOptions,
        ctx: &ExecutionContext,
    ) -> Result<PolicyRunResult, PolicyError> {
        tracing::info!(
            policy = %self.data.name,
            resource_type = %self.plugin.type_def.name,
            mode = %self.mode.name(),
            region = %ctx.region,
            dry_run = ctx.dry_run,
            "policy run starting"
        );
        let client = factory.client(&opts.region)?;
        let manager = ResourceManager::new(self.plugin.clone(), client.clone(), opts.cache.clone())
            .with_query(self.data.query.clone())
            .with_max_resources(self.data.max_resources);

        let candidates = if self.mode.is_event_driven() {
            let event = event.ok_or_else(|| {
                PolicyError::execution(format!(
                    "policy {} in {} mode invoked without an event",
                    self.data.name,
                    self.mode.name()
                ))
            })?;
            let ids = self.mode.resolve_ids(event);
            manager.get_resources(&ids, ctx)?
        } else {
            manager.resources(ctx)?
        };

        ctx.log(&format!(
            "policy {} ({}) enumerated {} candidates",
            self.data.name,
            self.mode.name(),
            candidates.len()
        ));
        let matched = manager.filter_resources(&self.filters, candidates.clone(), event, ctx)?;
        ctx.log(&format!("{} resources matched", matched.len()));
        ctx.put_metric("ResourceCount", matched.len() as f64, "Count");
        output::write_resources(ctx, &matched)?;
        output::write_metadata(ctx, &self.data)?;

        if self.mode == Mode::ConfigRule {
            // Filters define non-compliance; no actions run.
            let matched_ids: BTreeSet<String> = matched
                .iter()
                .filter_map(|r| r.id(&self.plugin.type_def))
                .collect();
            let verdicts: Vec<Verdict> = candidates
                .iter()
                .filter_map(|r| r.id(&self.plugin.type_def))
                .map(|id| Verdict {
                    compliance: if matched_ids.contains(&id) {
                        Compliance::NonCompliant
                    } else {
                        Compliance::Compliant
                    },
                    resource_id: id,
                })
                .collect();
            return Ok(PolicyRunResult {
                policy: self.data.name.clone(),
                resource_count: matched.len(),
                action_results: Vec::new(),
                verdicts: Some(verdicts),
                success: true,
            });
        }

        let executor = ActionExecutor {
            parallelism: ctx.concurrency,
            ..ActionExecutor::default()
        };
        let mut action_results = Vec::with_capacity(self.actions.len());
        let mut resources = matched;
        let mut success = true;
        for action in &self.actions {
            let span = ctx.span(action.name());
            let _guard = span.enter();
            let actx = ActionContext {
                ctx,
                type_def: &self.plugin.type_def,
                client: client.as_ref(),
                event,
            };
            let result = executor.run(action.as_ref(), &mut resources, &actx);
            ctx.log(&format!(
                "action {}: {} processed, {} failed{}",
                result.action,
                result.processed,
                result.failed,
                if result.dry_run { " (dry-run)" } else { "" }
            ));
            output::write_action_result(ctx, &result)?;
            let failed = !result.ok();
            if failed {
                success = false;
                ctx.put_metric("ActionFailures", result.failed as f64, "Count");
            }
            let halt = failed && action.halt_on_error();
            action_results.push(result);
            if halt {
                tracing::error!(
                    policy = %self.data.name,
                    action = %action.name(),
                    "halt-on-error action failed, stopping action chain"
                );
                break;
            }
        }

        tracing::info!(
            policy = %self.data.name,
            matched = resources.len(),
            actions = action_results.len(),
            success,
            "policy run finished"
        );
        Ok(PolicyRunResult {
            policy: self.data.name.clone(),
            resource_count: resources.len(),
            action_results,
            verdicts: None,
            success,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_core::client::StaticSessionFactory;
    use warden_core::resource::ResourceTypeDef;
    use warden_policy::actions::CloudOpAction;

    fn provider() -> Provider {
        let mut def = ResourceTypeDef::new(
            "ec2",
            "ec2",
            "InstanceId",
            "DescribeInstances",
            "Reservations[].Instances[]",
        );
        def.taggable = true;
        let mut provider = Provider::new("static");
        provider
            .register_resource(
                ResourcePlugin::new(def)
                    .with_action(
                        "stop",
                        CloudOpAction::plugin(
                            "stop",
                            "StopInstances",
                            "InstanceIds",
                            &["ec2:StopInstances"],
                        ),
                    )
                    .unwrap(),
            )
            .unwrap();
        provider
    }

    fn policy_data(value: Value) -> PolicyData {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn compile_rejects_unknown_pieces() {
        let provider = provider();
        assert!(
            Policy::compile(
                policy_data(json!({"name": "p", "resource": "no-such"})),
                &provider
            )
            .is_err()
        );
        assert!(
            Policy::compile(
                policy_data(json!({
                    "name": "p",
                    "resource": "ec2",
                    "filters": [{"type": "no-such-filter"}],
                })),
                &provider
            )
            .is_err()
        );
    }

    #[test]
    fn permissions_union_covers_type_filters_and_actions() {
        let provider = provider();
        let policy = Policy::compile(
            policy_data(json!({
                "name": "p",
                "resource": "ec2",
                "actions": ["stop", {"type": "tag", "key": "a", "value": "b"}],
            })),
            &provider,
        )
        .unwrap();
        let perms = policy.get_permissions();
        assert!(perms.contains("ec2:StopInstances"));
        assert!(perms.contains("ec2:CreateTags"));
    }

    #[test]
    fn variable_expansion_preserves_types_and_defers_unknowns() {
        let mut vars = Map::new();
        vars.insert("account_id".to_string(), json!("123456789012"));
        vars.insert("limit".to_string(), json!(5));

        let doc = json!({
            "name": "p-{account_id}",
            "max": "{limit}",
            "msg": "acct {account_id} keeps {unknown}",
        });
        let expanded = expand_variables(&doc, &vars);
        assert_eq!(expanded["name"], json!("p-123456789012"));
        assert_eq!(expanded["max"], json!(5));
        assert_eq!(expanded["msg"], json!("acct 123456789012 keeps {unknown}"));
    }

    #[test]
    fn pull_policy_filters_and_acts() {
        let provider = provider();
        let policy = Policy::compile(
            policy_data(json!({
                "name": "stop-dev",
                "resource": "ec2",
                "filters": [{"tag:Env": "dev"}],
                "actions": ["stop"],
            })),
            &provider,
        )
        .unwrap();

        let factory = StaticSessionFactory::new("123456789012");
        factory.client_handle().respond(
            "ec2",
            "DescribeInstances",
            vec![json!({"Reservations": [{"Instances": [
                {"InstanceId": "i-1", "Tags": [{"Key": "Env", "Value": "dev"}]},
                {"InstanceId": "i-2", "Tags": [{"Key": "Env", "Value": "prod"}]},
            ]}]})],
        );

        let result = policy.push(None, &factory, &RunOptions::default()).unwrap();
        assert!(result.success);
        assert_eq!(result.resource_count, 1);
        let stops = factory.client_handle().calls();
        let stop = stops
            .iter()
            .find(|c| c.operation == "StopInstances")
            .unwrap();
        assert_eq!(stop.params["InstanceIds"], json!(["i-1"]));
    }

    #[test]
    fn event_mode_resolves_single_resource() {
        let provider = provider();
        let policy = Policy::compile(
            policy_data(json!({
                "name": "on-launch",
                "resource": "ec2",
                "mode": {"type": "event", "events": ["RunInstances"], "ids": "detail.instance-id"},
                "filters": [{"tag:Env": "absent"}],
            })),
            &provider,
        )
        .unwrap();

        let factory = StaticSessionFactory::new("123456789012");
        factory.client_handle().respond(
            "ec2",
            "DescribeInstances",
            vec![json!({"Reservations": [{"Instances": [
                {"InstanceId": "i-1"}, {"InstanceId": "i-2"},
            ]}]})],
        );

        let event = Event::new(json!({"detail": {"instance-id": "i-1"}}));
        let result = policy
            .push(Some(&event), &factory, &RunOptions::default())
            .unwrap();
        assert_eq!(result.resource_count, 1);
    }

    #[test]
    fn config_rule_returns_verdicts_and_runs_no_actions() {
        let mut def = ResourceTypeDef::new(
            "ec2",
            "ec2",
            "InstanceId",
            "DescribeInstances",
            "Reservations[].Instances[]",
        );
        def.taggable = true;
        def.asset_type = Some("AWS::EC2::Instance".to_string());
        let mut provider = Provider::new("static");
        provider
            .register_resource(ResourcePlugin::new(def))
            .unwrap();

        let policy = Policy::compile(
            policy_data(json!({
                "name": "untagged-noncompliant",
                "resource": "ec2",
                "mode": {"type": "config-rule"},
                "filters": [{"tag:Owner": "absent"}],
                "actions": [{"type": "tag", "key": "flagged", "value": "true"}],
            })),
            &provider,
        )
        .unwrap();

        let factory = StaticSessionFactory::new("123456789012");
        factory.client_handle().respond(
            "ec2",
            "DescribeInstances",
            vec![json!({"Reservations": [{"Instances": [{"InstanceId": "i-1"}]}]})],
        );

        let event = Event::new(json!({"resourceId": "i-1"}));
        let result = policy
            .push(Some(&event), &factory, &RunOptions::default())
            .unwrap();
        let verdicts = result.verdicts.unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].compliance, Compliance::NonCompliant);
        // The tag action must not have run.
        assert!(
            factory
                .client_handle()
                .calls()
                .iter()
                .all(|c| c.operation != "CreateTags")
        );
    }
}
