//! Execution modes.
//!
//! A mode decides where a policy's candidate resources come from: `pull`
//! enumerates the full set, `event` resolves the identifiers carried by a
//! push payload, `periodic` is pull on a schedule, and `config-rule`
//! evaluates a single changed resource into a compliance verdict instead of
//! acting on it.

use serde::Serialize;
use serde_json::Value;

use warden_core::error::PolicyError;
use warden_core::event::Event;
use warden_core::resource::ResourceTypeDef;

/// Default event path carrying resource identifiers.
const DEFAULT_IDS_PATH: &str = "resources";
/// Default event path for config-rule invocations.
const CONFIG_ID_PATH: &str = "resourceId";

#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Pull,
    Event {
        events: Vec<String>,
        ids: Option<String>,
    },
    Periodic {
        schedule: String,
    },
    ConfigRule,
}

impl Mode {
    /// Parse the policy's `mode` block; absence means `pull`.
    pub fn from_value(data: Option<&Value>) -> Result<Mode, PolicyError> {
        let Some(data) = data else {
            return Ok(Mode::Pull);
        };
        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| PolicyError::invalid("mode requires a type"))?;
        match kind {
            "pull" => Ok(Mode::Pull),
            "event" => {
                let events: Vec<String> = data
                    .get("events")
                    .and_then(Value::as_array)
                    .map(|list| {
                        list.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                if events.is_empty() {
                    return Err(PolicyError::invalid("event mode requires an events list"));
                }
                Ok(Mode::Event {
                    events,
                    ids: data
                        .get("ids")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            }
            "periodic" => {
                let schedule = data
                    .get("schedule")
                    .and_then(Value::as_str)
                    .ok_or_else(|| PolicyError::invalid("periodic mode requires a schedule"))?
                    .to_string();
                Ok(Mode::Periodic { schedule })
            }
            "config-rule" => Ok(Mode::ConfigRule),
            other => Err(PolicyError::invalid(format!("unknown mode type {other:?}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mode::Pull => "pull",
            Mode::Event { .. } => "event",
            Mode::Periodic { .. } => "periodic",
            Mode::ConfigRule => "config-rule",
        }
    }

    /// Semantic checks beyond document shape.
    pub fn validate(&self, type_def: &ResourceTypeDef) -> Result<(), PolicyError> {
        if matches!(self, Mode::ConfigRule) && type_def.asset_type.is_none() {
            return Err(PolicyError::invalid(format!(
                "config-rule mode requires an asset type on resource {:?}",
                type_def.name
            )));
        }
        Ok(())
    }

    /// True when candidates come from an event rather than enumeration.
    pub fn is_event_driven(&self) -> bool {
        matches!(self, Mode::Event { .. } | Mode::ConfigRule)
    }

    /// Extract the resource identifiers from an event payload. Accepts a
    /// single string or a list of strings at the mode's id path.
    pub fn resolve_ids(&self, event: &Event) -> Vec<String> {
        let path = match self {
            Mode::Event { ids, .. } => ids.as_deref().unwrap_or(DEFAULT_IDS_PATH),
            Mode::ConfigRule => CONFIG_ID_PATH,
            _ => return Vec::new(),
        };
        match event.get(path) {
            Some(Value::String(id)) => vec![id.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Compliance verdict a config-rule run hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub resource_id: String,
    pub compliance: Compliance,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Compliance {
    #[serde(rename = "COMPLIANT")]
    Compliant,
    #[serde(rename = "NON_COMPLIANT")]
    NonCompliant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_mode_is_pull() {
        assert_eq!(Mode::from_value(None).unwrap(), Mode::Pull);
    }

    #[test]
    fn event_mode_requires_events() {
        assert!(Mode::from_value(Some(&json!({"type": "event"}))).is_err());
        let mode = Mode::from_value(Some(&json!({
            "type": "event",
            "events": ["RunInstances"],
        })))
        .unwrap();
        assert!(mode.is_event_driven());
    }

    #[test]
    fn config_rule_needs_asset_type() {
        let mode = Mode::from_value(Some(&json!({"type": "config-rule"}))).unwrap();
        let mut def = ResourceTypeDef::new("ec2", "ec2", "InstanceId", "DescribeInstances", "[]");
        assert!(mode.validate(&def).is_err());
        def.asset_type = Some("AWS::EC2::Instance".to_string());
        mode.validate(&def).unwrap();
    }

    #[test]
    fn id_resolution_handles_string_and_list() {
        let mode = Mode::from_value(Some(&json!({
            "type": "event",
            "events": ["RunInstances"],
            "ids": "detail.instance-id",
        })))
        .unwrap();
        let event = Event::new(json!({"detail": {"instance-id": "i-1"}}));
        assert_eq!(mode.resolve_ids(&event), vec!["i-1"]);

        let listy = Mode::from_value(Some(&json!({
            "type": "event",
            "events": ["RunInstances"],
        })))
        .unwrap();
        let event = Event::new(json!({"resources": ["i-1", "i-2"]}));
        assert_eq!(listy.resolve_ids(&event), vec!["i-1", "i-2"]);
    }

    #[test]
    fn verdicts_serialize_to_config_vocabulary() {
        let verdict = Verdict {
            resource_id: "i-1".to_string(),
            compliance: Compliance::NonCompliant,
        };
        assert_eq!(
            serde_json::to_value(&verdict).unwrap(),
            json!({"resource_id": "i-1", "compliance": "NON_COMPLIANT"}),
        );
    }
}
