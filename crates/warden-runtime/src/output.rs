//! Per-run artifacts and reporting.
//!
//! Every policy run with an output directory leaves three artifact kinds
//! behind: `resources.json` (the matched set, post-filter and pre-action),
//! one `action-<name>.json` per executed action, and `metadata.json`
//! snapshotting the policy definition with run timing and the engine
//! version. The report path flattens persisted resources into rows using
//! the descriptor's default report fields.

use serde_json::{Value, json};

use warden_core::context::ExecutionContext;
use warden_core::error::PolicyError;
use warden_core::resource::{Resource, ResourceTypeDef};
use warden_policy::actions::ActionResult;
use warden_query::{FunctionRegistry, Query};

use crate::policy::PolicyData;

/// Matched set, post-filter and pre-action.
pub fn write_resources(ctx: &ExecutionContext, resources: &[Resource]) -> Result<(), PolicyError> {
    ctx.write_artifact("resources.json", &resources)
}

pub fn write_action_result(ctx: &ExecutionContext, result: &ActionResult) -> Result<(), PolicyError> {
    ctx.write_artifact(&format!("action-{}.json", result.action), result)
}

/// Policy snapshot with run timing and engine version.
pub fn write_metadata(ctx: &ExecutionContext, data: &PolicyData) -> Result<(), PolicyError> {
    let metadata = json!({
        "policy": data,
        "start": ctx.start_rfc3339(),
        "end": ctx
            .now()
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "version": env!("CARGO_PKG_VERSION"),
        "region": ctx.region,
        "account_id": ctx.account_id,
        "dry_run": ctx.dry_run,
    });
    ctx.write_artifact("metadata.json", &metadata)
}

/// One report row: the requested fields projected out of one resource.
pub fn report_rows(
    resources: &[Resource],
    fields: &[String],
    type_def: &ResourceTypeDef,
) -> Result<Vec<Vec<Value>>, PolicyError> {
    let fields: Vec<String> = if fields.is_empty() {
        if type_def.default_report_fields.is_empty() {
            vec![type_def.id.clone()]
        } else {
            type_def.default_report_fields.clone()
        }
    } else {
        fields.to_vec()
    };
    let functions = FunctionRegistry::builtins();
    let queries: Vec<Query> = fields
        .iter()
        .map(|f| {
            Query::compile(f)
                .map_err(|e| PolicyError::invalid(format!("bad report field {f:?}: {e}")))
        })
        .collect::<Result<_, _>>()?;

    let mut rows = Vec::with_capacity(resources.len());
    for resource in resources {
        let row = queries
            .iter()
            .map(|q| {
                q.search_with(resource.as_value(), &functions)
                    .unwrap_or(Value::Null)
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Render rows as CSV with a header line. Values are JSON-rendered except
/// bare strings; cells containing delimiters are quoted.
pub fn render_csv(fields: &[String], rows: &[Vec<Value>]) -> String {
    let mut out = String::new();
    out.push_str(&fields.iter().map(|f| csv_cell(f)).collect::<Vec<_>>().join(","));
    out.push('\n');
    for row in rows {
        let line: Vec<String> = row
            .iter()
            .map(|v| match v {
                Value::String(s) => csv_cell(s),
                Value::Null => String::new(),
                other => csv_cell(&other.to_string()),
            })
            .collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

fn csv_cell(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ec2_def() -> ResourceTypeDef {
        let mut def = ResourceTypeDef::new(
            "ec2",
            "ec2",
            "InstanceId",
            "DescribeInstances",
            "Reservations[].Instances[]",
        );
        def.default_report_fields = vec![
            "InstanceId".to_string(),
            "State.Name".to_string(),
            "Tags[?Key=='Env'].Value | [0]".to_string(),
        ];
        def
    }

    fn resources() -> Vec<Resource> {
        vec![
            Resource::new(json!({
                "InstanceId": "i-1",
                "State": {"Name": "running"},
                "Tags": [{"Key": "Env", "Value": "prod"}],
            })),
            Resource::new(json!({"InstanceId": "i-2", "State": {"Name": "stopped"}})),
        ]
    }

    #[test]
    fn rows_use_default_report_fields() {
        let def = ec2_def();
        let rows = report_rows(&resources(), &[], &def).unwrap();
        assert_eq!(rows[0], vec![json!("i-1"), json!("running"), json!("prod")]);
        assert_eq!(rows[1], vec![json!("i-2"), json!("stopped"), Value::Null]);
    }

    #[test]
    fn csv_rendering_quotes_when_needed() {
        let fields = vec!["id".to_string(), "note".to_string()];
        let rows = vec![vec![json!("i-1"), json!("hello, \"world\"")]];
        let csv = render_csv(&fields, &rows);
        assert_eq!(csv, "id,note\ni-1,\"hello, \"\"world\"\"\"\n");
    }

    #[test]
    fn artifacts_land_in_the_run_directory() {
        use warden_core::context::Clock;
        let root = tempfile::tempdir().unwrap();
        let mut ctx = ExecutionContext::acquire(
            "report-test",
            "ec2",
            Some(root.path()),
            Clock::Fixed("2026-01-01T00:00:00Z".parse().unwrap()),
        )
        .unwrap();
        write_resources(&ctx, &resources()).unwrap();
        let data: PolicyData = serde_json::from_value(json!({
            "name": "report-test",
            "resource": "ec2",
        }))
        .unwrap();
        write_metadata(&ctx, &data).unwrap();
        let dir = ctx.output_dir().unwrap().to_path_buf();
        assert!(dir.join("resources.json").exists());
        let meta: Value =
            serde_json::from_slice(&std::fs::read(dir.join("metadata.json")).unwrap()).unwrap();
        assert_eq!(meta["policy"]["name"], json!("report-test"));
        assert_eq!(meta["version"], json!(env!("CARGO_PKG_VERSION")));
        ctx.close().unwrap();
    }
}
