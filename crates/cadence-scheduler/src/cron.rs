//! Cron field parsing and next-fire search.
//!
//! Field syntax per field:
//! ```text
//! *         any value
//! a         exact value
//! a,b,c     list
//! a-b       inclusive range
//! */n       every n-th value over the full range
//! a-b/n     every n-th value within a range
//! a/n       every n-th value from a to the field maximum
//! ```
//! Day-of-week counts from Sunday (0 and 7 are both Sunday) and accepts
//! `sun`..`sat`. Months accept `jan`..`dec`. All arithmetic is in UTC.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

use crate::trigger::{CronTrigger, TriggerError};

/// How many calendar years past the first candidate year the search may run
/// before the fields are declared unsatisfiable. Eight years covers the gap
/// between leap days across a skipped century leap year.
pub const SEARCH_HORIZON_YEARS: i32 = 8;

const MIN_YEAR: u32 = 1970;
const MAX_YEAR: u32 = 2199;

const WEEKDAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Set of allowed values for one small field (all values < 64).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    max: u32,
}

impl FieldSet {
    fn full(min: u32, max: u32) -> Self {
        let mut bits = 0u64;
        for v in min..=max {
            bits |= 1u64 << v;
        }
        Self { bits, max }
    }

    fn from_values(values: &[u32], max: u32) -> Self {
        let bits = values.iter().fold(0u64, |acc, v| acc | (1u64 << *v));
        Self { bits, max }
    }

    fn contains(&self, value: u32) -> bool {
        value <= self.max && self.bits & (1u64 << value) != 0
    }

    /// Smallest allowed value that is `>= value`.
    fn next_at_or_after(&self, value: u32) -> Option<u32> {
        (value..=self.max).find(|v| self.contains(*v))
    }
}

/// Parsed cron fields, ready for searching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    years: Option<BTreeSet<i32>>,
    month: FieldSet,
    day: FieldSet,
    day_of_week: FieldSet,
    hour: FieldSet,
    minute: FieldSet,
    second: FieldSet,
}

impl CronSchedule {
    /// Parse every field of a cron trigger.
    pub fn parse(trigger: &CronTrigger) -> Result<Self, TriggerError> {
        let years = trigger
            .year
            .as_deref()
            .map(|expr| parse_values("year", expr, MIN_YEAR, MAX_YEAR, &[]))
            .transpose()?
            .map(|values| values.into_iter().map(|y| y as i32).collect());

        let day_of_week = match trigger.day_of_week.as_deref() {
            Some(expr) => {
                // 7 is an alias for Sunday
                let values: Vec<u32> = parse_values("day_of_week", expr, 0, 7, WEEKDAY_NAMES)?
                    .into_iter()
                    .map(|d| d % 7)
                    .collect();
                FieldSet::from_values(&values, 6)
            }
            None => FieldSet::full(0, 6),
        };

        Ok(Self {
            years,
            month: small_field("month", trigger.month.as_deref(), 1, 12, MONTH_NAMES)?,
            day: small_field("day", trigger.day.as_deref(), 1, 31, &[])?,
            day_of_week,
            hour: small_field("hour", trigger.hour.as_deref(), 0, 23, &[])?,
            minute: small_field("minute", trigger.minute.as_deref(), 0, 59, &[])?,
            second: small_field("second", Some(trigger.second.as_deref().unwrap_or("0")), 0, 59, &[])?,
        })
    }

    /// Earliest whole-second timestamp strictly after `after` that satisfies
    /// every field.
    ///
    /// Returns `Ok(None)` when a `year` constraint has no remaining value, and
    /// [`TriggerError::Unsatisfiable`] when nothing matches within
    /// [`SEARCH_HORIZON_YEARS`] of the first candidate year. A jump to a later
    /// value of the `year` field restarts the horizon from that year.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, TriggerError> {
        let Some(start) = after
            .with_nanosecond(0)
            .and_then(|t| t.checked_add_signed(chrono::Duration::seconds(1)))
        else {
            return Ok(None);
        };

        let mut date = start.date_naive();
        let (mut hour, mut minute, mut second) = (start.hour(), start.minute(), start.second());
        let mut limit_year: Option<i32> = None;

        loop {
            let year = date.year();

            if let Some(years) = &self.years {
                match years.range(year..).next() {
                    None => return Ok(None),
                    Some(&next_year) if next_year != year => {
                        let Some(d) = NaiveDate::from_ymd_opt(next_year, 1, 1) else {
                            return Ok(None);
                        };
                        date = d;
                        (hour, minute, second) = (0, 0, 0);
                        // The horizon counts from the year actually searched
                        limit_year = Some(next_year + SEARCH_HORIZON_YEARS);
                        continue;
                    }
                    Some(_) => {}
                }
            }

            let limit = *limit_year.get_or_insert(year + SEARCH_HORIZON_YEARS);
            if year > limit {
                return Err(TriggerError::Unsatisfiable(SEARCH_HORIZON_YEARS));
            }

            if !self.month.contains(date.month()) {
                let next = match self.month.next_at_or_after(date.month()) {
                    Some(month) => NaiveDate::from_ymd_opt(year, month, 1),
                    None => NaiveDate::from_ymd_opt(year + 1, 1, 1),
                };
                let Some(d) = next else { return Ok(None) };
                date = d;
                (hour, minute, second) = (0, 0, 0);
                continue;
            }

            if !self.day.contains(date.day())
                || !self.day_of_week.contains(date.weekday().num_days_from_sunday())
            {
                let Some(d) = date.succ_opt() else { return Ok(None) };
                date = d;
                (hour, minute, second) = (0, 0, 0);
                continue;
            }

            if !self.hour.contains(hour) {
                match self.hour.next_at_or_after(hour) {
                    Some(h) => (hour, minute, second) = (h, 0, 0),
                    None => {
                        let Some(d) = date.succ_opt() else { return Ok(None) };
                        date = d;
                        (hour, minute, second) = (0, 0, 0);
                    }
                }
                continue;
            }

            if !self.minute.contains(minute) {
                match self.minute.next_at_or_after(minute) {
                    Some(m) => (minute, second) = (m, 0),
                    None => {
                        // Roll into the next hour; the day check reruns if it wraps
                        if hour == 23 {
                            let Some(d) = date.succ_opt() else { return Ok(None) };
                            date = d;
                            (hour, minute, second) = (0, 0, 0);
                        } else {
                            (hour, minute, second) = (hour + 1, 0, 0);
                        }
                    }
                }
                continue;
            }

            if !self.second.contains(second) {
                match self.second.next_at_or_after(second) {
                    Some(s) => second = s,
                    None => {
                        if minute == 59 {
                            if hour == 23 {
                                let Some(d) = date.succ_opt() else { return Ok(None) };
                                date = d;
                                (hour, minute, second) = (0, 0, 0);
                            } else {
                                (hour, minute, second) = (hour + 1, 0, 0);
                            }
                        } else {
                            (minute, second) = (minute + 1, 0);
                        }
                    }
                }
                continue;
            }

            let Some(naive) = date.and_hms_opt(hour, minute, second) else {
                return Ok(None);
            };
            return Ok(Some(Utc.from_utc_datetime(&naive)));
        }
    }
}

fn small_field(
    field: &'static str,
    expr: Option<&str>,
    min: u32,
    max: u32,
    names: &[&str],
) -> Result<FieldSet, TriggerError> {
    match expr {
        Some(expr) => Ok(FieldSet::from_values(
            &parse_values(field, expr, min, max, names)?,
            max,
        )),
        None => Ok(FieldSet::full(min, max)),
    }
}

/// Expand a field expression into the sorted list of values it allows.
fn parse_values(
    field: &'static str,
    expr: &str,
    min: u32,
    max: u32,
    names: &[&str],
) -> Result<Vec<u32>, TriggerError> {
    let invalid = |reason: String| TriggerError::InvalidField {
        field,
        value: expr.to_string(),
        reason,
    };

    let mut values = BTreeSet::new();
    for part in expr.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(invalid("empty list element".to_string()));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("bad step '{}'", step)))?;
                if step == 0 {
                    return Err(invalid("step must be positive".to_string()));
                }
                (range.trim(), Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                parse_value(a.trim(), names, min).ok_or_else(|| invalid(format!("bad value '{}'", a)))?,
                parse_value(b.trim(), names, min).ok_or_else(|| invalid(format!("bad value '{}'", b)))?,
            )
        } else {
            let v = parse_value(range, names, min)
                .ok_or_else(|| invalid(format!("bad value '{}'", range)))?;
            if step.is_some() { (v, max) } else { (v, v) }
        };

        if lo < min || hi > max {
            return Err(invalid(format!("values must be within {}-{}", min, max)));
        }
        if lo > hi {
            return Err(invalid(format!("range start {} is after end {}", lo, hi)));
        }

        values.extend((lo..=hi).step_by(step.unwrap_or(1) as usize));
    }

    Ok(values.into_iter().collect())
}

/// Parse a number or a (case-insensitive) name. Names map to `min + index`.
fn parse_value(token: &str, names: &[&str], min: u32) -> Option<u32> {
    if let Ok(n) = token.parse::<u32>() {
        return Some(n);
    }
    let lower = token.to_ascii_lowercase();
    names
        .iter()
        .position(|name| *name == lower)
        .map(|index| min + index as u32)
}
