//! Policy collections: loading, selection and concurrent execution.
//!
//! A collection is one policy file's worth of compiled policies. Loading
//! normalizes shorthand, validates the document against the assembled
//! schema, rejects duplicate names, then compiles every policy. Execution
//! is sequential by default with an opt-in policy-level pool; one policy
//! failing marks the collection partial without stopping its siblings.

use std::collections::VecDeque;
use std::collections::btree_map::Entry;

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use warden_core::client::SessionFactory;
use warden_core::error::{PolicyError, ValidationIssue};
use warden_core::event::Event;
use warden_policy::provider::Provider;
use warden_policy::schema::{build_schema, normalize_policies, validate_document};

use crate::policy::{Policy, PolicyData, PolicyRunResult, RunOptions, expand_variables};

pub struct PolicyCollection {
    pub policies: Vec<Policy>,
}

impl PolicyCollection {
    /// Load and compile a policy document. `vars` are expanded before
    /// validation; `{policy}` resolves per policy to its own name, and
    /// placeholders with no binding stay as written.
    pub fn load_str(
        source: &str,
        provider: &Provider,
        vars: Option<&Map<String, Value>>,
    ) -> Result<Self, PolicyError> {
        let mut doc: Value = serde_yaml::from_str(source)
            .map_err(|e| PolicyError::invalid(format!("unparseable policy file: {e}")))?;
        if let Some(vars) = vars {
            doc = expand_variables(&doc, vars);
        }
        normalize_policies(&mut doc);

        let schema = build_schema(provider);
        validate_document(&doc, &schema)?;

        let raw = doc
            .get("policies")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut seen = std::collections::BTreeMap::new();
        let mut issues = Vec::new();
        for (index, policy) in raw.iter().enumerate() {
            let Some(name) = policy.get("name").and_then(Value::as_str) else {
                continue;
            };
            match seen.entry(name.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(index);
                }
                Entry::Occupied(first) => {
                    issues.push(ValidationIssue::new(
                        format!("policies[{index}].name"),
                        format!(
                            "duplicate policy name {:?} (first defined at policies[{}])",
                            name,
                            first.get()
                        ),
                    ));
                }
            }
        }
        if !issues.is_empty() {
            return Err(PolicyError::Validation(issues));
        }

        let policies = raw
            .into_iter()
            .map(|value| {
                // The policy's own name becomes available inside its body.
                let mut policy_vars = Map::new();
                if let Some(name) = value.get("name").and_then(Value::as_str) {
                    policy_vars
                        .insert("policy".to_string(), Value::String(name.to_string()));
                }
                let value = expand_variables(&value, &policy_vars);
                let data: PolicyData = serde_json::from_value(value)
                    .map_err(|e| PolicyError::invalid(format!("malformed policy: {e}")))?;
                Policy::compile(data, provider)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { policies })
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Narrow to policies whose name matches `pattern` (regex) and whose
    /// resource type equals `resource_type`, when given.
    pub fn select(
        &self,
        pattern: Option<&str>,
        resource_type: Option<&str>,
    ) -> Result<Vec<&Policy>, PolicyError> {
        let regex = pattern
            .map(Regex::new)
            .transpose()
            .map_err(|e| PolicyError::invalid(format!("bad policy name pattern: {e}")))?;
        Ok(self
            .policies
            .iter()
            .filter(|p| regex.as_ref().is_none_or(|re| re.is_match(p.name())))
            .filter(|p| resource_type.is_none_or(|t| p.resource_type() == t))
            .collect())
    }

    /// Run every selected policy. `pool` > 1 runs policies concurrently.
    pub fn run(
        &self,
        selected: &[&Policy],
        event: Option<&Event>,
        factory: &dyn SessionFactory,
        opts: &RunOptions,
        pool: usize,
    ) -> CollectionResult {
        let outcomes: Mutex<Vec<PolicyOutcome>> = Mutex::new(Vec::with_capacity(selected.len()));
        let run_one = |policy: &Policy| {
            let outcome = match policy.push(event, factory, opts) {
                Ok(run) => PolicyOutcome {
                    policy: policy.name().to_string(),
                    run: Some(run),
                    error: None,
                },
                Err(error) => {
                    tracing::error!(
                        policy = %policy.name(),
                        error = %error,
                        "policy run failed"
                    );
                    PolicyOutcome {
                        policy: policy.name().to_string(),
                        run: None,
                        error: Some(error.to_string()),
                    }
                }
            };
            outcomes.lock().push(outcome);
        };

        if pool <= 1 {
            for policy in selected {
                run_one(policy);
            }
        } else {
            let queue: Mutex<VecDeque<&Policy>> =
                Mutex::new(selected.iter().copied().collect());
            std::thread::scope(|scope| {
                for _ in 0..pool.min(selected.len().max(1)) {
                    scope.spawn(|| {
                        loop {
                            let Some(policy) = queue.lock().pop_front() else {
                                return;
                            };
                            run_one(policy);
                        }
                    });
                }
            });
        }

        let mut outcomes = outcomes.into_inner();
        // Pool execution completes out of order; report in selection order.
        outcomes.sort_by_key(|o| {
            selected
                .iter()
                .position(|p| p.name() == o.policy)
                .unwrap_or(usize::MAX)
        });
        CollectionResult { outcomes }
    }
}

/// One policy's outcome within a collection run.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyOutcome {
    pub policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<PolicyRunResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PolicyOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.run.as_ref().is_some_and(|r| r.success)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionResult {
    pub outcomes: Vec<PolicyOutcome>,
}

impl CollectionResult {
    /// True when at least one policy failed or errored.
    pub fn partial(&self) -> bool {
        self.outcomes.iter().any(|o| !o.succeeded())
    }

    pub fn exit_code(&self) -> i32 {
        if self.partial() { 1 } else { 0 }
    }
}
