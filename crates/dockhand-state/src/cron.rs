//! Five-field cron expressions.
//!
//! Fields: minute, hour, day-of-month, month, day-of-week. Each field is a
//! wildcard, a value, a comma list, a range or a stepped range (`*/n`,
//! `a-b/n`, `a/n`). Day-of-week accepts 0-7 with 7 folded to 0 (Sunday).
//!
//! Day matching follows conventional cron: when both day fields are
//! restricted a candidate matches if either does; when only one is restricted
//! the other is ignored. Evaluation is in UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

/// Upper bound on the forward scan for the next match.
const SEARCH_HORIZON_DAYS: i64 = 2 * 366;

/// Errors produced while parsing or evaluating a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), found {found}")]
    FieldCount { found: usize },

    #[error("{field}: invalid value '{value}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("{field}: value {value} outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{field}: invalid range '{value}'")]
    InvalidRange { field: &'static str, value: String },

    #[error("{field}: invalid step in '{value}'")]
    InvalidStep { field: &'static str, value: String },

    #[error("'{expr}' has no matching time within {SEARCH_HORIZON_DAYS} days")]
    NoMatch { expr: String },
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
};

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    restricted: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronExpr {
    /// Parse and validate an expression.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount {
                found: fields.len(),
            });
        }

        let mut days_of_week = parse_field(fields[4], DAY_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1u64 << 7)) | 1;
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(fields[0], MINUTE)?,
            hours: parse_field(fields[1], HOUR)?,
            days_of_month: parse_field(fields[2], DAY_OF_MONTH)?,
            months: parse_field(fields[3], MONTH)?,
            days_of_week,
        })
    }

    /// Normalised source text (single-space separated).
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the expression matches the minute containing `at`.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.months.contains(at.month())
            && self.day_matches(at.date_naive())
            && self.hours.contains(at.hour())
            && self.minutes.contains(at.minute())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (
            self.days_of_month.restricted,
            self.days_of_week.restricted,
        ) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// Earliest whole minute strictly after `after` that matches.
    ///
    /// Scans forward minute by minute, skipping whole hours, days and months
    /// that cannot match. Gives up after roughly two years.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let limit = after + Duration::days(SEARCH_HORIZON_DAYS);
        let mut candidate = truncate_to_minute(after) + Duration::minutes(1);

        while candidate <= limit {
            if !self.months.contains(candidate.month()) {
                candidate = start_of_next_month(candidate);
                continue;
            }
            if !self.day_matches(candidate.date_naive()) {
                candidate = start_of_next_day(candidate);
                continue;
            }
            if !self.hours.contains(candidate.hour()) {
                candidate = start_of_next_hour(candidate);
                continue;
            }
            if !self.minutes.contains(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Ok(candidate);
        }

        Err(CronError::NoMatch {
            expr: self.source.clone(),
        })
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse `expr` and return its first match strictly after `after`.
pub fn next_run_after(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    CronExpr::parse(expr)?.next_after(after)
}

fn parse_field(text: &str, spec: FieldSpec) -> Result<FieldSet, CronError> {
    let mut bits = 0u64;
    for part in text.split(',') {
        bits |= parse_part(part, spec)?;
    }
    Ok(FieldSet {
        bits,
        restricted: !text.starts_with('*'),
    })
}

fn parse_part(part: &str, spec: FieldSpec) -> Result<u64, CronError> {
    if part.is_empty() {
        return Err(CronError::InvalidValue {
            field: spec.name,
            value: part.to_string(),
        });
    }

    let (range_text, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step = step
                .parse::<u32>()
                .ok()
                .filter(|s| (1..=spec.max).contains(s))
                .ok_or_else(|| CronError::InvalidStep {
                    field: spec.name,
                    value: part.to_string(),
                })?;
            (range, Some(step))
        }
        None => (part, None),
    };

    let (start, end) = if range_text == "*" {
        (spec.min, spec.max)
    } else if let Some((lo, hi)) = range_text.split_once('-') {
        let lo = parse_value(lo, spec)?;
        let hi = parse_value(hi, spec)?;
        if lo > hi {
            return Err(CronError::InvalidRange {
                field: spec.name,
                value: part.to_string(),
            });
        }
        (lo, hi)
    } else {
        let value = parse_value(range_text, spec)?;
        // `a/n` runs from a to the field maximum.
        match step {
            Some(_) => (value, spec.max),
            None => (value, value),
        }
    };

    let step = step.unwrap_or(1);
    let mut bits = 0u64;
    let mut value = start;
    while value <= end {
        bits |= 1u64 << value;
        match value.checked_add(step) {
            Some(next) => value = next,
            None => break,
        }
    }
    Ok(bits)
}

fn parse_value(text: &str, spec: FieldSpec) -> Result<u32, CronError> {
    let value = text.parse::<u32>().map_err(|_| CronError::InvalidValue {
        field: spec.name,
        value: text.to_string(),
    })?;
    if value < spec.min || value > spec.max {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(at)
}

fn start_of_next_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    let floored = at.with_minute(0).unwrap_or(at);
    floored + Duration::hours(1)
}

fn start_of_next_day(at: DateTime<Utc>) -> DateTime<Utc> {
    let next = at.date_naive().succ_opt().unwrap_or(NaiveDate::MAX);
    midnight(next)
}

fn start_of_next_month(at: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MAX);
    midnight(first)
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}
