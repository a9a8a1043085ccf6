// src/cron/field.rs

//! Parsing of a single cron field into a set of allowed values.

use std::fmt;

use thiserror::Error;

/// One of the five positional cron fields, or the expression as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    /// Problems with the expression shape (e.g. wrong number of fields).
    Expression,
    Minute,
    Hour,
    DayOfMonth,
    Month,
    Weekday,
}

impl CronField {
    /// Positional order of the fields in an expression.
    pub const POSITIONAL: [CronField; 5] = [
        CronField::Minute,
        CronField::Hour,
        CronField::DayOfMonth,
        CronField::Month,
        CronField::Weekday,
    ];

    /// Inclusive range of values accepted by this field.
    pub fn bounds(self) -> (u32, u32) {
        match self {
            CronField::Minute => (0, 59),
            CronField::Hour => (0, 23),
            CronField::DayOfMonth => (1, 31),
            CronField::Month => (1, 12),
            CronField::Weekday => (0, 6),
            CronField::Expression => (0, 0),
        }
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CronField::Expression => "expression",
            CronField::Minute => "minute",
            CronField::Hour => "hour",
            CronField::DayOfMonth => "day-of-month",
            CronField::Month => "month",
            CronField::Weekday => "weekday",
        };
        f.write_str(name)
    }
}

/// A cron expression that could not be parsed.
///
/// `field` identifies the offending field so callers can point the user at it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cron expression '{expr}' ({field}): {reason}")]
pub struct InvalidCron {
    pub expr: String,
    pub field: CronField,
    pub reason: String,
}

/// Set of values a field allows, stored as a bitmask (every field fits in 64 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSet {
    bits: u64,
    /// True when the field was written with a `*` item.
    wildcard: bool,
}

impl FieldSet {
    /// Parse one field: `*`, `5`, `1,2,3`, `1-5` or any comma list of those.
    ///
    /// On failure, returns a human readable reason (the caller attaches the
    /// field and expression).
    pub fn parse(field: CronField, text: &str) -> Result<Self, String> {
        let (min, max) = field.bounds();
        let mut set = FieldSet {
            bits: 0,
            wildcard: false,
        };

        for item in text.split(',') {
            if item.is_empty() {
                return Err(format!("empty item in list '{text}'"));
            }

            if item == "*" {
                set.wildcard = true;
                set.insert_range(min, max);
                continue;
            }

            if item.contains('-') {
                let parts: Vec<&str> = item.split('-').collect();
                if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
                    return Err(format!("malformed range '{item}'"));
                }
                let start = parse_value(parts[0], min, max)?;
                let end = parse_value(parts[1], min, max)?;
                if start > end {
                    return Err(format!("range '{item}' runs backwards"));
                }
                set.insert_range(start, end);
                continue;
            }

            let value = parse_value(item, min, max)?;
            set.insert_range(value, value);
        }

        Ok(set)
    }

    fn insert_range(&mut self, start: u32, end: u32) {
        for v in start..=end {
            self.bits |= 1u64 << v;
        }
    }

    pub fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }

    /// Whether the field was written as (or includes) `*`.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// Allowed values in ascending order.
    pub fn values(&self) -> impl Iterator<Item = u32> + '_ {
        (0..64).filter(move |v| self.contains(*v))
    }
}

fn parse_value(text: &str, min: u32, max: u32) -> Result<u32, String> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("'{text}' is not a number"));
    }
    let value: u32 = text
        .parse()
        .map_err(|_| format!("'{text}' is not a number"))?;
    if value < min || value > max {
        return Err(format!("value {value} out of range {min}-{max}"));
    }
    Ok(value)
}
