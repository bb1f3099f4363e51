//! Cron timing for the optional export loop.

use chrono::{DateTime, Utc};
use cron::Schedule;
use leadflow_core::{LeadflowError, LeadflowResult};
use std::str::FromStr;

/// Parse a cron expression into a [`cron::Schedule`].
///
/// Accepts the 6/7-field format (sec min hour day-of-month month
/// day-of-week [year]); a plain 5-field expression gets a `0` seconds field
/// prepended.
pub fn parse_cron(cron_expr: &str) -> LeadflowResult<Schedule> {
    let expr = if cron_expr.split_whitespace().count() == 5 {
        format!("0 {cron_expr}")
    } else {
        cron_expr.to_string()
    };
    Schedule::from_str(&expr)
        .map_err(|e| LeadflowError::Config(format!("Invalid cron expression '{cron_expr}': {e}")))
}

/// First fire time of `schedule` strictly after `after`.
pub fn next_fire_after(schedule: &Schedule, after: DateTime<Utc>) -> LeadflowResult<DateTime<Utc>> {
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| LeadflowError::Config("Cron expression has no upcoming fire times".into()))
}

/// How long to wait from `now` until the next fire time.
pub fn delay_until_next(schedule: &Schedule, now: DateTime<Utc>) -> LeadflowResult<std::time::Duration> {
    let next = next_fire_after(schedule, now)?;
    Ok((next - now).to_std().unwrap_or_default())
}
