//! Trigger evaluation.
//!
//! A trigger is a pure rule that answers one question: given an instant,
//! when does the job fire next? Three kinds are supported:
//! - `interval`: a fixed elapsed time after the anchor
//! - `cron`: calendar field constraints (see [`crate::cron`])
//! - `date`: a single instant, fired at most once

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::cron::CronSchedule;

/// Errors produced while validating or evaluating a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    /// Interval duration is zero.
    #[error("interval must be longer than zero")]
    ZeroInterval,

    /// Interval duration does not fit in a timestamp offset.
    #[error("interval of {0} seconds is too large")]
    IntervalTooLarge(u64),

    /// A cron field could not be parsed.
    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    /// No timestamp satisfies the cron fields within the search horizon.
    #[error("cron fields cannot be satisfied within {0} years")]
    Unsatisfiable(i32),

    /// The trigger has no fire time after the given instant.
    #[error("trigger never fires after {0}")]
    NeverFires(DateTime<Utc>),
}

/// When and how often a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire every fixed duration.
    Interval(IntervalTrigger),
    /// Fire whenever the calendar fields match.
    Cron(CronTrigger),
    /// Fire once at a specific instant.
    Date(DateTrigger),
}

impl Trigger {
    /// Interval trigger of `seconds` seconds.
    pub fn every_seconds(seconds: u64) -> Self {
        Self::Interval(IntervalTrigger {
            seconds,
            ..Default::default()
        })
    }

    /// One-shot trigger at `run_at`.
    pub fn at(run_at: DateTime<Utc>) -> Self {
        Self::Date(DateTrigger { run_at })
    }

    /// Earliest fire time strictly after `after`, or `None` if the trigger is
    /// exhausted.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, TriggerError> {
        match self {
            Self::Interval(interval) => interval.next_fire(after),
            Self::Cron(cron) => cron.next_fire(after),
            Self::Date(date) => Ok(date.next_fire(after)),
        }
    }

    /// First fire time of a newly created or modified trigger.
    ///
    /// A trigger that would never fire is rejected.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, TriggerError> {
        self.next_fire(now)?
            .ok_or(TriggerError::NeverFires(now))
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval(interval) => write!(f, "interval[{}s]", interval.total_seconds()),
            Self::Cron(cron) => write!(f, "cron[{}]", cron.describe()),
            Self::Date(date) => write!(f, "date[{}]", date.run_at.to_rfc3339()),
        }
    }
}

/// Fixed-duration trigger, anchored at the moment the job was scheduled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalTrigger {
    #[serde(default)]
    pub weeks: u64,
    #[serde(default)]
    pub days: u64,
    #[serde(default)]
    pub hours: u64,
    #[serde(default)]
    pub minutes: u64,
    #[serde(default)]
    pub seconds: u64,
    /// No fire times after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl IntervalTrigger {
    /// Total interval length in seconds, saturating on overflow.
    pub fn total_seconds(&self) -> u64 {
        self.weeks
            .saturating_mul(7 * 24 * 3600)
            .saturating_add(self.days.saturating_mul(24 * 3600))
            .saturating_add(self.hours.saturating_mul(3600))
            .saturating_add(self.minutes.saturating_mul(60))
            .saturating_add(self.seconds)
    }

    /// Interval length as a duration.
    pub fn duration(&self) -> Result<Duration, TriggerError> {
        let total = self.total_seconds();
        if total == 0 {
            return Err(TriggerError::ZeroInterval);
        }
        i64::try_from(total)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or(TriggerError::IntervalTooLarge(total))
    }

    fn next_fire(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, TriggerError> {
        let next = after.checked_add_signed(self.duration()?);
        Ok(next.filter(|t| self.end_date.is_none_or(|end| *t <= end)))
    }
}

/// Calendar trigger. Each field holds a cron-style expression; `None` matches
/// any value, except `second`, which defaults to `0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronTrigger {
    #[serde(default, deserialize_with = "field_expr", skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, deserialize_with = "field_expr", skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    #[serde(default, deserialize_with = "field_expr", skip_serializing_if = "Option::is_none")]
    pub day: Option<String>,
    #[serde(default, deserialize_with = "field_expr", skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<String>,
    #[serde(default, deserialize_with = "field_expr", skip_serializing_if = "Option::is_none")]
    pub hour: Option<String>,
    #[serde(default, deserialize_with = "field_expr", skip_serializing_if = "Option::is_none")]
    pub minute: Option<String>,
    #[serde(default, deserialize_with = "field_expr", skip_serializing_if = "Option::is_none")]
    pub second: Option<String>,
    /// No fire times after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl CronTrigger {
    pub fn with_year(mut self, expr: impl Into<String>) -> Self {
        self.year = Some(expr.into());
        self
    }

    pub fn with_month(mut self, expr: impl Into<String>) -> Self {
        self.month = Some(expr.into());
        self
    }

    pub fn with_day(mut self, expr: impl Into<String>) -> Self {
        self.day = Some(expr.into());
        self
    }

    pub fn with_day_of_week(mut self, expr: impl Into<String>) -> Self {
        self.day_of_week = Some(expr.into());
        self
    }

    pub fn with_hour(mut self, expr: impl Into<String>) -> Self {
        self.hour = Some(expr.into());
        self
    }

    pub fn with_minute(mut self, expr: impl Into<String>) -> Self {
        self.minute = Some(expr.into());
        self
    }

    pub fn with_second(mut self, expr: impl Into<String>) -> Self {
        self.second = Some(expr.into());
        self
    }

    /// Parse the field expressions into a schedule.
    pub fn schedule(&self) -> Result<CronSchedule, TriggerError> {
        CronSchedule::parse(self)
    }

    fn next_fire(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, TriggerError> {
        let next = self.schedule()?.next_after(after)?;
        Ok(next.filter(|t| self.end_date.is_none_or(|end| *t <= end)))
    }

    fn describe(&self) -> String {
        let fields = [
            ("year", &self.year),
            ("month", &self.month),
            ("day", &self.day),
            ("day_of_week", &self.day_of_week),
            ("hour", &self.hour),
            ("minute", &self.minute),
            ("second", &self.second),
        ];
        fields
            .iter()
            .filter_map(|(name, expr)| expr.as_ref().map(|e| format!("{}='{}'", name, e)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// One-shot trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateTrigger {
    pub run_at: DateTime<Utc>,
}

impl DateTrigger {
    fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.run_at > after).then_some(self.run_at)
    }
}

/// Accept cron fields written either as strings (`"*/5"`) or bare numbers (`5`).
fn field_expr<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Number(n) => n.to_string(),
        Raw::Text(s) => s,
    }))
}
