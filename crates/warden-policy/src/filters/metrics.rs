//! Metric-statistics filter.
//!
//! Matches resources on their monitoring metrics: one statistics query per
//! resource over a trailing window, aggregated and compared against the
//! declared value. The resource's identity dimension comes from the type
//! descriptor (`dimension`, falling back to the id attribute).

use chrono::Duration;
use serde_json::{Value, json};
use std::collections::BTreeSet;

use warden_core::error::PolicyError;
use warden_core::event::Event;
use warden_core::resource::{Resource, ResourceTypeDef};

use crate::value::Op;

use super::{Filter, FilterContext};

const DEFAULT_DAYS: f64 = 14.0;
const DEFAULT_PERIOD_SECS: i64 = 86_400;

const STATISTICS: &[&str] = &["Average", "Sum", "Maximum", "Minimum", "SampleCount"];

pub struct MetricsFilter {
    metric: String,
    namespace: String,
    statistic: String,
    dimension: String,
    days: f64,
    period: i64,
    op: Op,
    value: f64,
    missing_value: Option<f64>,
}

impl MetricsFilter {
    pub fn from_config(data: &Value, type_def: &ResourceTypeDef) -> Result<Self, PolicyError> {
        let metric = data
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| PolicyError::invalid("metrics filter requires a metric name"))?
            .to_string();
        let value = data
            .get("value")
            .and_then(Value::as_f64)
            .ok_or_else(|| PolicyError::invalid("metrics filter requires a numeric value"))?;
        let op = match data.get("op").and_then(Value::as_str) {
            None => Op::Lt,
            Some(s) => {
                let op = s.parse::<Op>()?;
                if !matches!(op, Op::Lt | Op::Le | Op::Gt | Op::Ge | Op::Eq | Op::Ne) {
                    return Err(PolicyError::invalid(format!(
                        "metrics filter does not support op {s:?}"
                    )));
                }
                op
            }
        };
        let statistic = data
            .get("statistics")
            .and_then(Value::as_str)
            .unwrap_or("Average")
            .to_string();
        if !STATISTICS.contains(&statistic.as_str()) {
            return Err(PolicyError::invalid(format!(
                "unknown statistic {statistic:?}"
            )));
        }
        Ok(Self {
            metric,
            namespace: data
                .get("namespace")
                .and_then(Value::as_str)
                .unwrap_or(&type_def.service)
                .to_string(),
            statistic,
            dimension: type_def
                .dimension
                .clone()
                .unwrap_or_else(|| type_def.id.clone()),
            days: data.get("days").and_then(Value::as_f64).unwrap_or(DEFAULT_DAYS),
            period: data
                .get("period")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_PERIOD_SECS),
            op,
            value,
            missing_value: data.get("missing-value").and_then(Value::as_f64),
        })
    }

    fn compare(&self, observed: f64) -> bool {
        match self.op {
            Op::Lt => observed < self.value,
            Op::Le => observed <= self.value,
            Op::Gt => observed > self.value,
            Op::Ge => observed >= self.value,
            Op::Eq => observed == self.value,
            Op::Ne => observed != self.value,
            _ => false,
        }
    }
}

impl Filter for MetricsFilter {
    fn name(&self) -> &str {
        "metrics"
    }

    fn get_permissions(&self) -> BTreeSet<String> {
        ["monitoring:GetMetricStatistics".to_string()].into()
    }

    fn matches(
        &self,
        resource: &mut Resource,
        _event: Option<&Event>,
        fctx: &FilterContext,
    ) -> Result<bool, PolicyError> {
        let client = fctx
            .client
            .ok_or_else(|| PolicyError::execution("metrics filter requires cloud access"))?;
        let id = resource
            .id(fctx.type_def)
            .ok_or_else(|| PolicyError::execution("resource has no identifier"))?;

        let end = fctx.ctx.now();
        let start = end - Duration::seconds((self.days * 86_400.0) as i64);
        let params = json!({
            "Namespace": self.namespace,
            "MetricName": self.metric,
            "Statistics": [self.statistic],
            "StartTime": start.to_rfc3339(),
            "EndTime": end.to_rfc3339(),
            "Period": self.period,
            "Dimensions": [{"Name": self.dimension, "Value": id}],
        });
        fctx.ctx.api_stats.record("monitoring", "GetMetricStatistics");

        let mut points = Vec::new();
        for page in client.operation("monitoring", "GetMetricStatistics", &params)? {
            let page = page?;
            if let Some(datapoints) = page.get("Datapoints").and_then(Value::as_array) {
                points.extend(
                    datapoints
                        .iter()
                        .filter_map(|dp| dp.get(&self.statistic).and_then(Value::as_f64)),
                );
            }
        }

        let observed = if points.is_empty() {
            match self.missing_value {
                Some(v) => v,
                // No data and no declared substitute: not a match.
                None => return Ok(false),
            }
        } else {
            points.iter().sum::<f64>() / points.len() as f64
        };
        resource.annotate(
            "Metrics",
            json!({&self.metric: {&self.statistic: observed}}),
        );
        Ok(self.compare(observed))
    }
}

pub(crate) fn metrics_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["type", "name", "value"],
        "properties": {
            "type": {"enum": ["metrics"]},
            "name": {"type": "string"},
            "namespace": {"type": "string"},
            "statistics": {"enum": STATISTICS},
            "days": {"type": "number", "minimum": 0},
            "period": {"type": "integer", "minimum": 60},
            "op": {"enum": ["lt", "le", "lte", "gt", "ge", "gte", "eq", "ne"]},
            "value": {"type": "number"},
            "missing-value": {"type": "number"},
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_core::client::StaticCloudClient;
    use warden_core::context::{Clock, ExecutionContext};
    use warden_query::FunctionRegistry;

    fn ec2_def() -> ResourceTypeDef {
        ResourceTypeDef::new("ec2", "ec2", "InstanceId", "DescribeInstances", "Instances[]")
    }

    fn run(filter: &MetricsFilter, client: &StaticCloudClient, resource: Value) -> bool {
        let mut ctx = ExecutionContext::ephemeral("test", "ec2");
        ctx.clock = Clock::Fixed("2026-01-15T00:00:00Z".parse().unwrap());
        let type_def = ec2_def();
        let functions = FunctionRegistry::builtins();
        let fctx = FilterContext {
            ctx: &ctx,
            type_def: &type_def,
            functions: &functions,
            client: Some(client),
        };
        let mut r = Resource::new(resource);
        filter.matches(&mut r, None, &fctx).unwrap()
    }

    #[test]
    fn underutilized_instance_matches_less_than() {
        let filter = MetricsFilter::from_config(
            &json!({"type": "metrics", "name": "CPUUtilization", "value": 30}),
            &ec2_def(),
        )
        .unwrap();
        let client = StaticCloudClient::new();
        client.respond(
            "monitoring",
            "GetMetricStatistics",
            vec![json!({"Datapoints": [{"Average": 4.0}, {"Average": 6.0}]})],
        );
        assert!(run(&filter, &client, json!({"InstanceId": "i-1"})));

        let call = &client.calls()[0];
        assert_eq!(call.params["MetricName"], json!("CPUUtilization"));
        assert_eq!(
            call.params["Dimensions"],
            json!([{"Name": "InstanceId", "Value": "i-1"}])
        );
        assert_eq!(call.params["StartTime"], json!("2026-01-01T00:00:00+00:00"));
    }

    #[test]
    fn busy_instance_does_not_match() {
        let filter = MetricsFilter::from_config(
            &json!({"type": "metrics", "name": "CPUUtilization", "value": 30}),
            &ec2_def(),
        )
        .unwrap();
        let client = StaticCloudClient::new();
        client.respond(
            "monitoring",
            "GetMetricStatistics",
            vec![json!({"Datapoints": [{"Average": 85.0}]})],
        );
        assert!(!run(&filter, &client, json!({"InstanceId": "i-1"})));
    }

    #[test]
    fn no_datapoints_needs_a_declared_substitute() {
        let client = StaticCloudClient::new();
        client.respond(
            "monitoring",
            "GetMetricStatistics",
            vec![json!({"Datapoints": []})],
        );

        let silent = MetricsFilter::from_config(
            &json!({"type": "metrics", "name": "CPUUtilization", "value": 30}),
            &ec2_def(),
        )
        .unwrap();
        assert!(!run(&silent, &client, json!({"InstanceId": "i-1"})));

        let substituted = MetricsFilter::from_config(
            &json!({
                "type": "metrics",
                "name": "CPUUtilization",
                "value": 30,
                "missing-value": 0,
            }),
            &ec2_def(),
        )
        .unwrap();
        assert!(run(&substituted, &client, json!({"InstanceId": "i-1"})));
    }

    #[test]
    fn rejects_set_ops_and_unknown_statistics() {
        assert!(
            MetricsFilter::from_config(
                &json!({"type": "metrics", "name": "x", "value": 1, "op": "in"}),
                &ec2_def(),
            )
            .is_err()
        );
        assert!(
            MetricsFilter::from_config(
                &json!({"type": "metrics", "name": "x", "value": 1, "statistics": "Median"}),
                &ec2_def(),
            )
            .is_err()
        );
    }
}
