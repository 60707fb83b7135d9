//! Off-hours scheduling filters.
//!
//! Resources carry a schedule tag such as `off=(M-F,18);on=(M-F,8);tz=pt`.
//! The `offhour` filter matches resources whose off hour is now (in the
//! schedule's timezone); `onhour` matches the on hour. Participation is
//! opt-in through the tag unless the filter sets `opt-out: true`, in which
//! case untagged resources use the filter defaults and a tag value of
//! `off` excludes a resource entirely.

use std::str::FromStr;

use chrono::{Datelike, Timelike, Weekday};
use chrono_tz::Tz;
use serde_json::{Value, json};

use warden_core::error::PolicyError;
use warden_core::event::Event;
use warden_core::resource::Resource;

use super::{Filter, FilterContext};

/// Default schedule tag.
pub const DEFAULT_SCHEDULE_TAG: &str = "warden_offhours";

const DEFAULT_OFFHOUR: u32 = 19;
const DEFAULT_ONHOUR: u32 = 7;

/// One `(days, hour)` group of a schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleGroup {
    pub days: Vec<Weekday>,
    pub hour: u32,
}

/// A parsed schedule tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    pub off: Vec<ScheduleGroup>,
    pub on: Vec<ScheduleGroup>,
    pub tz: Option<Tz>,
}

impl Schedule {
    /// Parse `off=(M-F,18);on=(M-F,8);tz=pt`. Returns `None` on malformed
    /// input; the caller logs and skips the resource.
    pub fn parse(s: &str) -> Option<Schedule> {
        let mut schedule = Schedule::default();
        for part in s.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=')?;
            match key.trim() {
                "off" => schedule.off.push(parse_group(value.trim())?),
                "on" => schedule.on.push(parse_group(value.trim())?),
                "tz" => schedule.tz = Some(resolve_tz(value.trim())?),
                _ => return None,
            }
        }
        Some(schedule)
    }
}

fn parse_group(s: &str) -> Option<ScheduleGroup> {
    let inner = s.strip_prefix('(')?.strip_suffix(')')?;
    let (days, hour) = inner.rsplit_once(',')?;
    let hour: u32 = hour.trim().parse().ok()?;
    if hour > 23 {
        return None;
    }
    Some(ScheduleGroup {
        days: parse_days(days.trim())?,
        hour,
    })
}

fn parse_days(s: &str) -> Option<Vec<Weekday>> {
    if let Some((start, end)) = s.split_once('-') {
        let start = day_code(start.trim())?;
        let end = day_code(end.trim())?;
        let mut days = Vec::new();
        let mut day = start;
        loop {
            days.push(day);
            if day == end {
                return Some(days);
            }
            day = day.succ();
            if days.len() > 7 {
                return None;
            }
        }
    }
    s.split(',').map(|d| day_code(d.trim())).collect()
}

fn day_code(s: &str) -> Option<Weekday> {
    Some(match s.to_uppercase().as_str() {
        "M" => Weekday::Mon,
        "T" => Weekday::Tue,
        "W" => Weekday::Wed,
        "H" => Weekday::Thu,
        "F" => Weekday::Fri,
        "S" => Weekday::Sat,
        "U" => Weekday::Sun,
        _ => return None,
    })
}

/// Common US abbreviations plus IANA names.
fn resolve_tz(s: &str) -> Option<Tz> {
    Some(match s.to_lowercase().as_str() {
        "et" | "est" | "edt" => Tz::America__New_York,
        "ct" | "cst" | "cdt" => Tz::America__Chicago,
        "mt" | "mst" | "mdt" => Tz::America__Denver,
        "pt" | "pst" | "pdt" => Tz::America__Los_Angeles,
        "utc" | "gmt" => Tz::UTC,
        other => Tz::from_str(other).ok().or_else(|| Tz::from_str(s).ok())?,
    })
}

/// Shared implementation for `offhour` and `onhour`.
pub struct OffHourFilter {
    is_on: bool,
    hour: u32,
    default_tz: Tz,
    tag: String,
    opt_out: bool,
    weekends: bool,
}

impl OffHourFilter {
    pub fn from_config(data: &Value, is_on: bool) -> Result<Self, PolicyError> {
        let hour_key = if is_on { "onhour" } else { "offhour" };
        let hour = data
            .get(hour_key)
            .and_then(Value::as_u64)
            .map(|h| h as u32)
            .unwrap_or(if is_on { DEFAULT_ONHOUR } else { DEFAULT_OFFHOUR });
        if hour > 23 {
            return Err(PolicyError::invalid(format!("{hour_key} must be 0-23")));
        }
        let default_tz = match data.get("default_tz").and_then(Value::as_str) {
            Some(tz) => resolve_tz(tz)
                .ok_or_else(|| PolicyError::invalid(format!("unknown timezone {tz:?}")))?,
            None => Tz::UTC,
        };
        Ok(Self {
            is_on,
            hour,
            default_tz,
            tag: data
                .get("tag")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_SCHEDULE_TAG)
                .to_string(),
            opt_out: data.get("opt-out").and_then(Value::as_bool).unwrap_or(false),
            weekends: data.get("weekends").and_then(Value::as_bool).unwrap_or(true),
        })
    }

    fn default_days(&self) -> Vec<Weekday> {
        if self.weekends {
            vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ]
        } else {
            vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ]
        }
    }
}

impl Filter for OffHourFilter {
    fn name(&self) -> &str {
        if self.is_on { "onhour" } else { "offhour" }
    }

    fn matches(
        &self,
        resource: &mut Resource,
        _event: Option<&Event>,
        fctx: &FilterContext,
    ) -> Result<bool, PolicyError> {
        let tag_value = resource.tag(&fctx.type_def.tag_attr, &self.tag);
        let schedule = match tag_value {
            None if !self.opt_out => return Ok(false),
            None => Schedule::default(),
            Some(v) if v.trim().eq_ignore_ascii_case("off") => return Ok(false),
            Some(v) if v.trim().is_empty() => Schedule::default(),
            Some(v) => match Schedule::parse(v) {
                Some(s) => s,
                None => {
                    tracing::warn!(
                        policy = %fctx.ctx.policy_name,
                        tag = %self.tag,
                        value = %v,
                        "unparseable schedule tag"
                    );
                    return Ok(false);
                }
            },
        };

        let tz = schedule.tz.unwrap_or(self.default_tz);
        let now = fctx.ctx.now().with_timezone(&tz);
        let groups = if self.is_on { &schedule.on } else { &schedule.off };

        if groups.is_empty() {
            return Ok(self.default_days().contains(&now.weekday()) && now.hour() == self.hour);
        }
        Ok(groups
            .iter()
            .any(|g| g.days.contains(&now.weekday()) && now.hour() == g.hour))
    }
}

pub(super) fn offhours_schema(type_name: &str) -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["type"],
        "properties": {
            "type": {"enum": [type_name]},
            type_name: {"type": "integer", "minimum": 0, "maximum": 23},
            "default_tz": {"type": "string"},
            "tag": {"type": "string"},
            "opt-out": {"type": "boolean"},
            "weekends": {"type": "boolean"},
        },
    })
}
