//! Per-run execution context.
//!
//! One context is acquired per policy run. It owns the run's output
//! directory, the metrics buffer, the API-call counters, the dry-run flag
//! and the clock. Teardown is guaranteed: `close` flushes explicitly and
//! `Drop` repeats the flush best-effort for abnormal exits.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::error::PolicyError;

/// Time source. Policies compare tag dates and resource ages against "now",
/// so tests inject a fixed instant instead of freezing the world.
#[derive(Debug, Clone)]
pub enum Clock {
    System,
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(at) => *at,
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}

/// Shared API-call counters, bucketed by `service.operation`. Mutation
/// calls are counted separately so a dry run can be asserted to have made
/// none.
#[derive(Clone, Default)]
pub struct ApiStats {
    calls: Arc<Mutex<BTreeMap<String, u64>>>,
    mutations: Arc<Mutex<u64>>,
}

impl ApiStats {
    pub fn record(&self, service: &str, operation: &str) {
        *self
            .calls
            .lock()
            .entry(format!("{service}.{operation}"))
            .or_insert(0) += 1;
    }

    pub fn record_mutation(&self, service: &str, operation: &str) {
        self.record(service, operation);
        *self.mutations.lock() += 1;
    }

    pub fn total(&self) -> u64 {
        self.calls.lock().values().sum()
    }

    pub fn mutation_calls(&self) -> u64 {
        *self.mutations.lock()
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.calls.lock().clone()
    }
}

/// Buffering run-log sink, flushed to `warden-run.log` on teardown. Lines
/// mirror the pipeline milestones also emitted through `tracing`, kept with
/// the run's artifacts so a run directory is self-describing.
#[derive(Clone, Default)]
pub struct LogSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogSink {
    pub fn write(&self, at: DateTime<Utc>, line: &str) {
        self.lines.lock().push(format!(
            "{} {line}",
            at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

/// One buffered metric datum.
#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

/// Buffering metrics sink, flushed to `metrics.json` on teardown.
#[derive(Clone, Default)]
pub struct MetricsSink {
    buffer: Arc<Mutex<Vec<Metric>>>,
}

impl MetricsSink {
    pub fn put(&self, name: impl Into<String>, value: f64, unit: impl Into<String>, at: DateTime<Utc>) {
        self.buffer.lock().push(Metric {
            name: name.into(),
            value,
            unit: unit.into(),
            timestamp: at,
        });
    }

    pub fn snapshot(&self) -> Vec<Metric> {
        self.buffer.lock().clone()
    }
}

/// Scoped per-policy-run state.
pub struct ExecutionContext {
    pub policy_name: String,
    pub resource_type: String,
    pub region: String,
    pub account_id: String,
    pub start: DateTime<Utc>,
    pub dry_run: bool,
    pub clock: Clock,
    /// Worker-pool width for chunked action and augmentation fan-out.
    pub concurrency: usize,
    pub api_stats: ApiStats,
    pub metrics: MetricsSink,
    pub run_log: LogSink,
    output_dir: Option<PathBuf>,
    closed: bool,
}

impl ExecutionContext {
    /// Context without an output directory, for validation-only paths and
    /// tests that do not assert on artifacts.
    pub fn ephemeral(policy_name: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            policy_name: policy_name.into(),
            resource_type: resource_type.into(),
            region: String::new(),
            account_id: String::new(),
            start: Utc::now(),
            dry_run: false,
            clock: Clock::System,
            concurrency: 2,
            api_stats: ApiStats::default(),
            metrics: MetricsSink::default(),
            run_log: LogSink::default(),
            output_dir: None,
            closed: false,
        }
    }

    /// Acquire a context rooted at `output_root`, creating
    /// `<root>/<policy>/<timestamp>/`.
    pub fn acquire(
        policy_name: impl Into<String>,
        resource_type: impl Into<String>,
        output_root: Option<&Path>,
        clock: Clock,
    ) -> Result<Self, PolicyError> {
        let policy_name = policy_name.into();
        let start = clock.now();
        let output_dir = match output_root {
            Some(root) => {
                let dir = root
                    .join(&policy_name)
                    .join(start.format("%Y-%m-%dT%H-%M-%S").to_string());
                fs::create_dir_all(&dir).map_err(|e| {
                    PolicyError::execution(format!(
                        "unable to create output dir {}: {e}",
                        dir.display()
                    ))
                })?;
                Some(dir)
            }
            None => None,
        };
        Ok(Self {
            policy_name,
            resource_type: resource_type.into(),
            region: String::new(),
            account_id: String::new(),
            start,
            dry_run: false,
            clock,
            concurrency: 2,
            api_stats: ApiStats::default(),
            metrics: MetricsSink::default(),
            run_log: LogSink::default(),
            output_dir,
            closed: false,
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// Span wrapping one pipeline stage, named for trace output.
    pub fn span(&self, stage: &str) -> tracing::Span {
        tracing::info_span!("stage", policy = %self.policy_name, stage = %stage)
    }

    pub fn put_metric(&self, name: impl Into<String>, value: f64, unit: impl Into<String>) {
        self.metrics.put(name, value, unit, self.now());
    }

    /// Record a pipeline milestone in the run log.
    pub fn log(&self, line: &str) {
        self.run_log.write(self.now(), line);
    }

    /// Serialize `value` to `<output-dir>/<name>`. A context without an
    /// output directory drops artifacts silently.
    pub fn write_artifact(&self, name: &str, value: &impl Serialize) -> Result<(), PolicyError> {
        let Some(dir) = &self.output_dir else {
            return Ok(());
        };
        let path = dir.join(name);
        let data = serde_json::to_vec_pretty(value)
            .map_err(|e| PolicyError::execution(format!("serializing {name}: {e}")))?;
        fs::write(&path, data)
            .map_err(|e| PolicyError::execution(format!("writing {}: {e}", path.display())))
    }

    /// Flush metrics and API stats to the output directory. Idempotent.
    pub fn close(&mut self) -> Result<(), PolicyError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let metrics = self.metrics.snapshot();
        if !metrics.is_empty() {
            self.write_artifact("metrics.json", &metrics)?;
        }
        let stats = self.api_stats.snapshot();
        if !stats.is_empty() {
            self.write_artifact("api-stats.json", &stats)?;
        }
        let lines = self.run_log.snapshot();
        if !lines.is_empty() {
            if let Some(dir) = &self.output_dir {
                let path = dir.join("warden-run.log");
                fs::write(&path, lines.join("\n") + "\n").map_err(|e| {
                    PolicyError::execution(format!("writing {}: {e}", path.display()))
                })?;
            }
        }
        tracing::debug!(
            policy = %self.policy_name,
            api_calls = self.api_stats.total(),
            mutations = self.api_stats.mutation_calls(),
            "run context closed"
        );
        Ok(())
    }

    /// RFC 3339 form of the run start, used in metadata artifacts.
    pub fn start_rfc3339(&self) -> String {
        self.start.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if !self.closed {
            // Abnormal exit path; flush best-effort.
            let _ = self.close();
        }
    }
}

/// Convert an arbitrary serializable into a `Value`, for artifact tests.
pub fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
