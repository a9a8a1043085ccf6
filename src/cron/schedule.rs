// src/cron/schedule.rs

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc};

use super::field::{CronField, FieldSet, InvalidCron};

/// How far ahead the occurrence search looks before giving up.
///
/// Four years covers every leap-day pattern (`0 0 29 2 *`).
pub const SEARCH_HORIZON_DAYS: i64 = 4 * 366;

/// A parsed 5-field cron expression (minute, hour, day-of-month, month, weekday).
///
/// All times are evaluated in UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    weekday: FieldSet,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, InvalidCron> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(InvalidCron {
                expr: expr.to_string(),
                field: CronField::Expression,
                reason: format!("expected 5 fields, got {}", parts.len()),
            });
        }

        let mut sets = Vec::with_capacity(5);
        for (field, text) in CronField::POSITIONAL.iter().zip(parts.iter()) {
            let set = FieldSet::parse(*field, text).map_err(|reason| InvalidCron {
                expr: expr.to_string(),
                field: *field,
                reason,
            })?;
            sets.push(set);
        }

        Ok(Self {
            expr: parts.join(" "),
            minute: sets[0],
            hour: sets[1],
            day_of_month: sets[2],
            month: sets[3],
            weekday: sets[4],
        })
    }

    /// Normalised source expression.
    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// Whether the minute containing `t` satisfies every field.
    ///
    /// Day-of-month and weekday are OR'd, unless one of them is `*`, in which
    /// case only the other one has to match.
    pub fn matches(&self, t: &DateTime<Utc>) -> bool {
        if !self.minute.contains(t.minute())
            || !self.hour.contains(t.hour())
            || !self.month.contains(t.month())
        {
            return false;
        }

        let dom = self.day_of_month.contains(t.day());
        let dow = self.weekday.contains(t.weekday().num_days_from_sunday());

        if self.day_of_month.is_wildcard() || self.weekday.is_wildcard() {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// First occurrence strictly after `from`, if one exists within the horizon.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_occurrences(from, 1).into_iter().next()
    }

    /// The first `count` occurrences strictly after `from`, in ascending order.
    ///
    /// Walks forward one minute at a time; fewer than `count` results are
    /// returned when the horizon is exhausted (e.g. `0 0 31 2 *`).
    pub fn next_occurrences(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        if count == 0 {
            return out;
        }

        let deadline = from + TimeDelta::days(SEARCH_HORIZON_DAYS);
        let mut candidate = truncate_to_minute(from) + TimeDelta::minutes(1);

        while candidate <= deadline {
            if self.matches(&candidate) {
                out.push(candidate);
                if out.len() == count {
                    break;
                }
            }
            candidate += TimeDelta::minutes(1);
        }

        out
    }
}

impl FromStr for CronSchedule {
    type Err = InvalidCron;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronSchedule::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(60), 0).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn daily_at_two_am() {
        let s = CronSchedule::parse("0 2 * * *").unwrap();
        let got = s.next_occurrences(at(2024, 1, 1, 0, 0), 3);
        assert_eq!(
            got,
            vec![
                at(2024, 1, 1, 2, 0),
                at(2024, 1, 2, 2, 0),
                at(2024, 1, 3, 2, 0)
            ]
        );
    }

    #[test]
    fn from_is_exclusive() {
        let s = CronSchedule::parse("30 * * * *").unwrap();
        assert_eq!(s.next_after(at(2024, 5, 1, 10, 30)), Some(at(2024, 5, 1, 11, 30)));
    }

    #[test]
    fn seconds_are_truncated_before_advancing() {
        let s = CronSchedule::parse("* * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 42).unwrap();
        assert_eq!(s.next_after(from), Some(at(2024, 5, 1, 10, 31)));
    }

    #[test]
    fn day_of_month_and_weekday_are_ored() {
        // 13th of the month OR any Friday.
        let s = CronSchedule::parse("0 0 13 * 5").unwrap();
        let got = s.next_occurrences(at(2024, 9, 1, 0, 0), 3);
        // 2024-09-06 is a Friday, 2024-09-13 is both, 2024-09-20 a Friday.
        assert_eq!(
            got,
            vec![at(2024, 9, 6, 0, 0), at(2024, 9, 13, 0, 0), at(2024, 9, 20, 0, 0)]
        );
    }

    #[test]
    fn wildcard_weekday_only_checks_day_of_month() {
        let s = CronSchedule::parse("0 0 15 * *").unwrap();
        let got = s.next_occurrences(at(2024, 1, 1, 0, 0), 2);
        assert_eq!(got, vec![at(2024, 1, 15, 0, 0), at(2024, 2, 15, 0, 0)]);
    }

    #[test]
    fn leap_day_is_found_within_horizon() {
        let s = CronSchedule::parse("0 12 29 2 *").unwrap();
        assert_eq!(s.next_after(at(2024, 3, 1, 0, 0)), Some(at(2028, 2, 29, 12, 0)));
    }

    #[test]
    fn impossible_date_yields_nothing() {
        let s = CronSchedule::parse("0 0 31 2 *").unwrap();
        assert!(s.next_occurrences(at(2024, 1, 1, 0, 0), 1).is_empty());
    }

    #[test]
    fn errors_identify_the_field() {
        let err = CronSchedule::parse("0 24 * * *").unwrap_err();
        assert_eq!(err.field, CronField::Hour);

        let err = CronSchedule::parse("0 2 * 13 *").unwrap_err();
        assert_eq!(err.field, CronField::Month);

        let err = CronSchedule::parse("0 2 * *").unwrap_err();
        assert_eq!(err.field, CronField::Expression);
        assert!(err.to_string().contains("expected 5 fields"));
    }
}
