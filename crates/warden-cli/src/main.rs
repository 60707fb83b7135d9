//! Warden command line.
//!
//! The engine core is cloud-agnostic; the binary wires it to a provider
//! fixture: a JSON file declaring resource-type descriptors, optional
//! id-list mutation actions, and canned API responses served through the
//! static cloud client. That keeps the full pipeline — schema validation,
//! enumeration, filtering, actions, artifacts — exercisable end to end
//! without credentials.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use warden_core::cache::Cache;
use warden_core::client::StaticSessionFactory;
use warden_core::resource::{Resource, ResourceTypeDef};
use warden_policy::actions::CloudOpAction;
use warden_policy::provider::{Provider, ResourcePlugin};
use warden_policy::schema::build_schema;
use warden_runtime::{PolicyCollection, RunOptions, render_csv, report_rows};

#[derive(Parser)]
#[command(name = "warden", version, about = "Declarative cloud governance policies")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). WARDEN_LOG overrides.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute policies
    Run(RunArgs),
    /// Validate a policy file without executing anything
    Validate {
        /// Policy file
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
        /// Provider fixture declaring the available resource types
        #[arg(long)]
        fixture: PathBuf,
    },
    /// Print the composed policy JSON schema
    Schema {
        /// Provider fixture; omitted prints the empty-provider skeleton
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Flatten a previous run's matched resources into a report
    Report(ReportArgs),
    /// Print a previous run's log
    Logs(RunDirArgs),
    /// Print a previous run's metrics
    Metrics(RunDirArgs),
    /// Print the engine version
    Version,
}

#[derive(Args)]
struct RunDirArgs {
    /// Root directory a previous run wrote artifacts under
    #[arg(short = 's', long = "output-dir", env = "WARDEN_OUTPUT_DIR")]
    output_dir: PathBuf,

    /// Policy name
    #[arg(short = 'p', long = "policy")]
    policy: String,
}

#[derive(Args)]
struct RunArgs {
    /// Policy file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Provider fixture declaring resource types and canned responses
    #[arg(long)]
    fixture: PathBuf,

    /// Root directory for per-run artifacts
    #[arg(short = 's', long = "output-dir", env = "WARDEN_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    #[arg(short = 'r', long = "region", default_value = "")]
    region: String,

    /// Only run policies whose name matches this regex
    #[arg(short = 'p', long = "policies")]
    policies: Option<String>,

    /// Only run policies for this resource type
    #[arg(short = 't', long = "resource")]
    resource: Option<String>,

    /// Cache file; loaded before and saved after the run
    #[arg(long, env = "WARDEN_CACHE")]
    cache: Option<PathBuf>,

    /// Cache TTL in minutes; 0 disables caching
    #[arg(long = "cache-period", env = "WARDEN_CACHE_PERIOD", default_value_t = 15)]
    cache_period: u64,

    /// Enumerate and filter, but skip every mutating call
    #[arg(short = 'd', long = "dryrun", env = "WARDEN_DRYRUN")]
    dryrun: bool,

    /// Worker-pool width within each policy
    #[arg(long, env = "WARDEN_CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// Policy-level parallelism across the collection
    #[arg(long, default_value_t = 1)]
    pool: usize,

    /// YAML/JSON mapping of variables expanded into the policy document
    #[arg(long)]
    vars: Option<PathBuf>,
}

#[derive(Args)]
struct ReportArgs {
    /// Provider fixture declaring the resource types
    #[arg(long)]
    fixture: PathBuf,

    /// Root directory a previous run wrote artifacts under
    #[arg(short = 's', long = "output-dir", env = "WARDEN_OUTPUT_DIR")]
    output_dir: PathBuf,

    /// Policy name to report on
    #[arg(short = 'p', long = "policy")]
    policy: String,

    /// Fields to project; defaults to the type's report fields
    #[arg(long = "field")]
    fields: Vec<String>,

    /// Output format
    #[arg(long, default_value = "csv", value_parser = ["csv", "json"])]
    format: String,
}

/// Provider fixture: descriptors, per-type mutation actions, canned pages.
#[derive(Deserialize)]
struct Fixture {
    #[serde(default = "default_account")]
    account_id: String,
    types: Vec<ResourceTypeDef>,
    /// Per-type id-list mutation actions, e.g. a `stop` for `ec2`.
    #[serde(default)]
    actions: BTreeMap<String, Vec<FixtureAction>>,
    /// Canned response pages keyed by `service.operation`.
    #[serde(default)]
    responses: BTreeMap<String, Vec<Value>>,
}

#[derive(Deserialize)]
struct FixtureAction {
    name: String,
    operation: String,
    param: String,
    #[serde(default)]
    permissions: Vec<String>,
}

fn default_account() -> String {
    "000000000000".to_string()
}

impl Fixture {
    fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("parsing fixture {}", path.display()))
    }

    fn provider(&self) -> Result<Provider> {
        let mut provider = Provider::new("static");
        for type_def in &self.types {
            let mut plugin = ResourcePlugin::new(type_def.clone());
            for action in self.actions.get(&type_def.name).into_iter().flatten() {
                let permissions: Vec<&str> =
                    action.permissions.iter().map(String::as_str).collect();
                plugin = plugin.with_action(
                    &action.name,
                    CloudOpAction::plugin(
                        &action.name,
                        &action.operation,
                        &action.param,
                        &permissions,
                    ),
                )?;
            }
            provider.register_resource(plugin)?;
        }
        provider.finalize();
        Ok(provider)
    }

    fn session(&self) -> StaticSessionFactory {
        let factory = StaticSessionFactory::new(&self.account_id);
        for (key, pages) in &self.responses {
            if let Some((service, operation)) = key.split_once('.') {
                factory
                    .client_handle()
                    .respond(service, operation, pages.clone());
            }
        }
        factory
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match dispatch(cli.cmd) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warden=info,warn",
        1 => "warden=debug,info",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("WARDEN_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(cmd: Command) -> Result<ExitCode> {
    match cmd {
        Command::Run(args) => run(args),
        Command::Validate { config, fixture } => validate(&config, &fixture),
        Command::Schema { fixture } => schema(fixture.as_deref()),
        Command::Report(args) => report(args),
        Command::Logs(args) => logs(&args),
        Command::Metrics(args) => metrics(&args),
        Command::Version => {
            println!("warden {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_vars(path: Option<&Path>) -> Result<Option<Map<String, Value>>> {
    let Some(path) = path else { return Ok(None) };
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: Value = serde_yaml::from_str(&data)
        .with_context(|| format!("parsing variables {}", path.display()))?;
    match value {
        Value::Object(map) => Ok(Some(map)),
        _ => bail!("variables file must be a mapping"),
    }
}

fn load_collection(
    config: &Path,
    provider: &Provider,
    vars: Option<&Map<String, Value>>,
) -> Result<PolicyCollection> {
    let source = std::fs::read_to_string(config)
        .with_context(|| format!("reading policy file {}", config.display()))?;
    PolicyCollection::load_str(&source, provider, vars)
        .with_context(|| format!("loading {}", config.display()))
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let fixture = Fixture::load(&args.fixture)?;
    let provider = fixture.provider()?;
    let mut vars = load_vars(args.vars.as_deref())?.unwrap_or_default();
    // Built-in run variables; user-supplied bindings win.
    for (name, value) in [
        ("account_id", fixture.account_id.clone()),
        ("region", args.region.clone()),
        ("now", chrono::Utc::now().to_rfc3339()),
    ] {
        vars.entry(name.to_string()).or_insert(Value::String(value));
    }
    let collection = load_collection(&args.config, &provider, Some(&vars))?;

    let selected = collection.select(args.policies.as_deref(), args.resource.as_deref())?;
    if selected.is_empty() {
        bail!("no policies selected");
    }

    let cache = Arc::new(if args.cache_period == 0 {
        Cache::disabled()
    } else {
        Cache::new(Duration::from_secs(args.cache_period * 60))
    });
    if let Some(path) = &args.cache {
        cache.load(path);
    }

    let factory = fixture.session();
    let opts = RunOptions {
        output_dir: args.output_dir.clone(),
        region: args.region.clone(),
        dry_run: args.dryrun,
        cache: cache.clone(),
        concurrency: args.concurrency,
        ..RunOptions::default()
    };
    let result = collection.run(&selected, None, &factory, &opts, args.pool);

    if let Some(path) = &args.cache {
        if let Err(error) = cache.save(path) {
            tracing::warn!(path = %path.display(), error = %error, "cache save failed");
        }
    }

    for outcome in &result.outcomes {
        match (&outcome.run, &outcome.error) {
            (Some(run), _) => {
                let failed: usize = run.action_results.iter().map(|a| a.failed).sum();
                println!(
                    "{}: matched {} resources, {} actions, {} failures{}",
                    outcome.policy,
                    run.resource_count,
                    run.action_results.len(),
                    failed,
                    if run.action_results.iter().any(|a| a.dry_run) {
                        " (dry-run)"
                    } else {
                        ""
                    },
                );
            }
            (None, Some(error)) => println!("{}: FAILED: {error}", outcome.policy),
            (None, None) => {}
        }
    }
    Ok(ExitCode::from(result.exit_code() as u8))
}

fn validate(config: &Path, fixture: &Path) -> Result<ExitCode> {
    let fixture = Fixture::load(fixture)?;
    let provider = fixture.provider()?;
    let collection = load_collection(config, &provider, None)?;
    println!(
        "{}: {} policies valid",
        config.display(),
        collection.len()
    );
    Ok(ExitCode::SUCCESS)
}

fn schema(fixture: Option<&Path>) -> Result<ExitCode> {
    let provider = match fixture {
        Some(path) => Fixture::load(path)?.provider()?,
        None => Provider::new("static"),
    };
    let schema = build_schema(&provider);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(ExitCode::SUCCESS)
}

fn report(args: ReportArgs) -> Result<ExitCode> {
    let fixture = Fixture::load(&args.fixture)?;
    let run_dir = latest_run_dir(&args.output_dir, &args.policy)?;

    let metadata: Value = serde_json::from_slice(
        &std::fs::read(run_dir.join("metadata.json"))
            .with_context(|| format!("reading metadata in {}", run_dir.display()))?,
    )?;
    let resource_type = metadata
        .pointer("/policy/resource")
        .and_then(Value::as_str)
        .context("metadata.json carries no resource type")?;
    let type_def = fixture
        .types
        .iter()
        .find(|t| t.name == resource_type)
        .with_context(|| format!("fixture does not declare resource type {resource_type:?}"))?;

    let resources: Vec<Resource> = serde_json::from_slice(
        &std::fs::read(run_dir.join("resources.json"))
            .with_context(|| format!("reading resources in {}", run_dir.display()))?,
    )?;

    let fields = if args.fields.is_empty() {
        if type_def.default_report_fields.is_empty() {
            vec![type_def.id.clone()]
        } else {
            type_def.default_report_fields.clone()
        }
    } else {
        args.fields.clone()
    };
    let rows = report_rows(&resources, &fields, type_def)?;

    match args.format.as_str() {
        "json" => {
            let objects: Vec<Value> = rows
                .iter()
                .map(|row| {
                    Value::Object(fields.iter().cloned().zip(row.iter().cloned()).collect())
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&objects)?);
        }
        _ => print!("{}", render_csv(&fields, &rows)),
    }
    Ok(ExitCode::SUCCESS)
}

fn logs(args: &RunDirArgs) -> Result<ExitCode> {
    let run_dir = latest_run_dir(&args.output_dir, &args.policy)?;
    let path = run_dir.join("warden-run.log");
    let log = std::fs::read_to_string(&path)
        .with_context(|| format!("no run log at {}", path.display()))?;
    print!("{log}");
    Ok(ExitCode::SUCCESS)
}

fn metrics(args: &RunDirArgs) -> Result<ExitCode> {
    let run_dir = latest_run_dir(&args.output_dir, &args.policy)?;
    let path = run_dir.join("metrics.json");
    let data: Value = match std::fs::read(&path) {
        Ok(data) => serde_json::from_slice(&data)
            .with_context(|| format!("parsing {}", path.display()))?,
        // A run that matched nothing flushes no metrics.
        Err(_) => Value::Array(Vec::new()),
    };
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(ExitCode::SUCCESS)
}

/// Newest run directory for a policy; timestamps sort lexicographically.
fn latest_run_dir(root: &Path, policy: &str) -> Result<PathBuf> {
    let policy_dir = root.join(policy);
    let mut runs: Vec<PathBuf> = std::fs::read_dir(&policy_dir)
        .with_context(|| format!("no runs under {}", policy_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    runs.sort();
    runs.pop()
        .with_context(|| format!("no runs under {}", policy_dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_core::client::SessionFactory;

    #[test]
    fn fixture_builds_provider_and_session() {
        let fixture: Fixture = serde_json::from_value(json!({
            "account_id": "123456789012",
            "types": [{
                "name": "ec2",
                "service": "ec2",
                "id": "InstanceId",
                "enum_spec": {
                    "operation": "DescribeInstances",
                    "path": "Reservations[].Instances[]",
                },
                "taggable": true,
            }],
            "actions": {
                "ec2": [{"name": "stop", "operation": "StopInstances", "param": "InstanceIds"}],
            },
            "responses": {
                "ec2.DescribeInstances": [{"Reservations": []}],
            },
        }))
        .unwrap();
        let provider = fixture.provider().unwrap();
        let ec2 = provider.resource("ec2").unwrap();
        assert!(ec2.actions.contains("stop"));
        assert_eq!(fixture.session().account_id(), "123456789012");
    }

    #[test]
    fn latest_run_dir_picks_newest_timestamp() {
        let root = tempfile::tempdir().unwrap();
        for stamp in ["2026-01-01T00-00-00", "2026-02-01T00-00-00"] {
            std::fs::create_dir_all(root.path().join("p").join(stamp)).unwrap();
        }
        let latest = latest_run_dir(root.path(), "p").unwrap();
        assert!(latest.ends_with("p/2026-02-01T00-00-00"));
    }
}
