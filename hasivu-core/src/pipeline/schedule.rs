use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use cron::Schedule;

use crate::error::{CoreError, Result};

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn invalid(expression: &str, detail: impl fmt::Display) -> CoreError {
    CoreError::InvalidInput(format!("invalid cron expression '{expression}': {detail}"))
}

fn weekday(raw: &str, expression: &str) -> Result<String> {
    match raw.parse::<usize>() {
        Ok(7) => Ok(WEEKDAYS[0].to_string()),
        Ok(day) => WEEKDAYS
            .get(day)
            .map(|name| name.to_string())
            .ok_or_else(|| invalid(expression, format_args!("day-of-week value {day} outside 0-7"))),
        Err(_) => Ok(raw.to_ascii_uppercase()),
    }
}

/// Rewrites a classic day-of-week field (0 or 7 = Sunday) with day names so
/// the Quartz-style numbering of the `cron` crate does not shift it.
fn weekday_field(raw: &str, expression: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (part, None),
        };
        let range = match range.split_once('-') {
            _ if range == "*" => range.to_string(),
            Some((lo, "7")) if step.is_none() && lo != "0" => {
                parts.push(WEEKDAYS[0].to_string());
                format!("{}-SAT", weekday(lo, expression)?)
            }
            Some((lo, hi)) => format!("{}-{}", weekday(lo, expression)?, weekday(hi, expression)?),
            None => weekday(range, expression)?,
        };
        parts.push(match step {
            Some(step) => format!("{range}/{step}"),
            None => range,
        });
    }
    Ok(parts.join(","))
}

/// Five-field cron schedule evaluated in UTC with minute resolution.
///
/// A thin layer over [`cron::Schedule`]: `@hourly`, `@daily`, `@weekly` and
/// `@monthly` are expanded, a zero seconds field is prepended and the
/// day-of-week field is translated. When both day fields are restricted a
/// date must match both.
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronSchedule {}

impl FromStr for CronSchedule {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let expanded = match trimmed {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                trimmed,
                format_args!("expected 5 fields, found {}", fields.len()),
            ));
        }
        if fields
            .iter()
            .any(|field| field.split(',').any(|part| part.ends_with("/0")))
        {
            return Err(invalid(trimmed, "step must be positive"));
        }

        let quartz = format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            weekday_field(fields[4], trimmed)?
        );
        let schedule = Schedule::from_str(&quartz).map_err(|err| invalid(trimmed, err))?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// True when the minute containing `at` is a firing time.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        at.with_second(0)
            .and_then(|minute| minute.with_nanosecond(0))
            .is_some_and(|minute| self.schedule.includes(minute))
    }

    /// First firing time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// True when a firing time falls in `(since, now]`.
    pub fn due(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.next_after(since).is_some_and(|next| next <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parses_lists_ranges_and_steps() {
        let schedule = CronSchedule::parse("*/15 8-10 * * 1-5").unwrap();
        assert!(schedule.matches(at("2026-03-02T08:45:00Z")));
        assert!(schedule.matches(at("2026-03-02T08:45:30Z")));
        assert!(!schedule.matches(at("2026-03-02T08:50:00Z")));
        assert!(!schedule.matches(at("2026-03-01T08:45:00Z")));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expression in ["* * * *", "60 * * * *", "*/0 * * * *", "a * * * *", "0 0 * * 8"] {
            assert!(
                matches!(CronSchedule::parse(expression), Err(CoreError::InvalidInput(_))),
                "{expression}"
            );
        }
    }

    #[test]
    fn next_after_rolls_over_days_and_months() {
        let daily = CronSchedule::parse("@daily").unwrap();
        assert_eq!(
            daily.next_after(at("2026-01-31T12:00:00Z")),
            Some(at("2026-02-01T00:00:00Z"))
        );

        let quarterly = CronSchedule::parse("30 6 1 1,4,7,10 *").unwrap();
        assert_eq!(
            quarterly.next_after(at("2026-04-01T06:30:00Z")),
            Some(at("2026-07-01T06:30:00Z"))
        );
    }

    #[test]
    fn next_after_is_strictly_later() {
        let hourly = CronSchedule::parse("@hourly").unwrap();
        assert_eq!(
            hourly.next_after(at("2026-05-05T10:00:00Z")),
            Some(at("2026-05-05T11:00:00Z"))
        );
        assert_eq!(
            hourly.next_after(at("2026-05-05T10:00:42Z")),
            Some(at("2026-05-05T11:00:00Z"))
        );
    }

    #[test]
    fn sunday_is_zero_or_seven() {
        for expression in ["0 9 * * 0", "0 9 * * 7", "0 9 * * 5-7"] {
            let schedule = CronSchedule::parse(expression).unwrap();
            assert!(schedule.matches(at("2026-03-01T09:00:00Z")), "{expression}");
        }
        let weekly = CronSchedule::parse("@weekly").unwrap();
        assert_eq!(
            weekly.next_after(at("2026-03-02T00:00:00Z")),
            Some(at("2026-03-08T00:00:00Z"))
        );
    }

    #[test]
    fn both_day_fields_must_match_when_set() {
        let schedule = CronSchedule::parse("0 12 13 * 5").unwrap();
        // 2026-03-13 is a Friday.
        assert!(schedule.matches(at("2026-03-13T12:00:00Z")));
        assert!(!schedule.matches(at("2026-03-06T12:00:00Z")));
        assert!(!schedule.matches(at("2026-04-13T12:00:00Z")));
    }

    #[test]
    fn due_covers_the_half_open_window() {
        let hourly = CronSchedule::parse("@hourly").unwrap();
        assert!(hourly.due(at("2026-05-05T10:30:00Z"), at("2026-05-05T11:00:00Z")));
        assert!(!hourly.due(at("2026-05-05T11:00:00Z"), at("2026-05-05T11:59:59Z")));
    }
}
