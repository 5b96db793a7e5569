//! Five-field cron expressions.
//!
//! Fields are `minute hour day-of-month month day-of-week`, each accepting
//! `*`, single values, ranges (`1-5`), steps (`*/15`, `10-50/10`) and
//! comma-separated lists of those. Day-of-week runs 0-7 with both 0 and 7
//! meaning Sunday. When both day fields are restricted a day matches if
//! either one does, as in Vixie cron. Evaluation happens in UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use thiserror::Error;

/// Errors produced while parsing a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("cron expression needs 5 fields, found {found}")]
    FieldCount { found: usize },

    #[error("invalid {field} field '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("{field} value {value} outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7 };

/// How far ahead `next_after` searches before concluding the expression
/// never fires (e.g. `0 0 30 2 *`).
const SEARCH_YEARS: i32 = 5;

/// Bit set of allowed values for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    restricted: bool,
}

impl Field {
    fn parse(raw: &str, spec: FieldSpec) -> Result<Self, CronError> {
        let invalid = || CronError::InvalidField {
            field: spec.name,
            value: raw.to_string(),
        };

        let mut bits = 0u64;
        for item in raw.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid())?;
                    if step == 0 {
                        return Err(invalid());
                    }
                    (range, step)
                }
                None => (item, 1),
            };

            let (low, high) = if range == "*" {
                (spec.min, spec.max)
            } else if let Some((low, high)) = range.split_once('-') {
                let low = parse_value(low, spec).map_err(|_| invalid())?;
                let high = parse_value(high, spec).map_err(|_| invalid())?;
                check_range(low, spec)?;
                check_range(high, spec)?;
                if low > high {
                    return Err(invalid());
                }
                (low, high)
            } else {
                let value = parse_value(range, spec).map_err(|_| invalid())?;
                check_range(value, spec)?;
                // "5/10" means every 10 starting at 5
                if item.contains('/') {
                    (value, spec.max)
                } else {
                    (value, value)
                }
            };

            let mut next = Some(low);
            while let Some(value) = next.filter(|v| *v <= high) {
                bits |= 1 << value;
                next = value.checked_add(step);
            }
        }

        Ok(Self {
            bits,
            restricted: raw != "*",
        })
    }

    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }
}

fn parse_value(raw: &str, spec: FieldSpec) -> Result<u32, CronError> {
    raw.trim().parse().map_err(|_| CronError::InvalidField {
        field: spec.name,
        value: raw.to_string(),
    })
}

fn check_range(value: u32, spec: FieldSpec) -> Result<(), CronError> {
    if value < spec.min || value > spec.max {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(())
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronExpr {
    /// Parses a single-string expression such as `"*/15 1-6 * * *"`.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minutes, hours, dom, months, dow] = fields.as_slice() else {
            return Err(CronError::FieldCount { found: fields.len() });
        };
        Self::from_parts(minutes, hours, dom, months, dow)
    }

    /// Builds an expression from its individual fields.
    pub fn from_parts(
        minutes: &str,
        hours: &str,
        days_of_month: &str,
        months: &str,
        dow_raw: &str,
    ) -> Result<Self, CronError> {
        let mut days_of_week = Field::parse(dow_raw, DAY_OF_WEEK)?;
        // fold 7 onto Sunday
        if days_of_week.contains(7) {
            days_of_week.bits |= 1;
        }

        Ok(Self {
            source: format!("{minutes} {hours} {days_of_month} {months} {dow_raw}"),
            minutes: Field::parse(minutes, MINUTE)?,
            hours: Field::parse(hours, HOUR)?,
            days_of_month: Field::parse(days_of_month, DAY_OF_MONTH)?,
            months: Field::parse(months, MONTH)?,
            days_of_week,
        })
    }

    /// Returns the expression as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.days_of_month.restricted, self.days_of_week.restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// Returns the first matching minute strictly after `after`.
    ///
    /// Returns `None` if nothing matches within the search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = after.year() + SEARCH_YEARS;

        while t.year() <= horizon {
            if !self.months.contains(t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = (t.date_naive() + Duration::days(1))
                    .and_hms_opt(0, 0, 0)?
                    .and_utc();
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
