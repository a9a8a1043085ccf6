// src/cron/mod.rs

//! Cron expression parsing and occurrence computation.
//!
//! - [`field`] parses a single field into a value set.
//! - [`schedule`] combines the five fields and searches for occurrences.

pub mod field;
pub mod schedule;

use chrono::{DateTime, Utc};

pub use field::{CronField, InvalidCron};
pub use schedule::CronSchedule;

/// Parse `expr` into a [`CronSchedule`].
pub fn parse(expr: &str) -> Result<CronSchedule, InvalidCron> {
    CronSchedule::parse(expr)
}

/// The first `count` occurrences of `expr` strictly after `from`.
pub fn next_occurrences(
    expr: &str,
    from: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, InvalidCron> {
    Ok(CronSchedule::parse(expr)?.next_occurrences(from, count))
}
