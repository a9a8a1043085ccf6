// src/schedule/mod.rs

//! Deciding when deployments are due.
//!
//! Instant and delayed deployments fire exactly once: they are only due while
//! `pending`, and the state machine moves them out of `pending` when they
//! start. Recurring deployments fire once per record; after an occurrence
//! reaches a terminal state, [`successor`] materialises the next one.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::cron::CronSchedule;
use crate::errors::{FleetcastError, Result};
use crate::model::{Deployment, DeploymentStatus};
use crate::types::ScheduleType;

/// Whether `deployment` should be started at `now`.
pub fn is_due(deployment: &Deployment, now: DateTime<Utc>) -> bool {
    if deployment.status != DeploymentStatus::Pending {
        return false;
    }
    match deployment.schedule_type {
        ScheduleType::Instant => true,
        ScheduleType::Delayed | ScheduleType::Recurring => {
            deployment.scheduled_for.is_some_and(|at| now >= at)
        }
    }
}

/// The firing that follows `after`.
///
/// If that firing is not strictly after `now` (the scheduler was down across
/// one or more firings), skip forward to the first firing after `now` instead
/// of replaying the missed ones.
pub fn next_occurrence(
    schedule: &CronSchedule,
    after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let next = schedule.next_after(after)?;
    if next > now {
        return Some(next);
    }
    let skipped = schedule.next_after(now);
    debug!(
        pattern = %schedule,
        missed = %next,
        resumed = ?skipped,
        "skipping missed recurring occurrences"
    );
    skipped
}

/// Build the next occurrence record of a terminal recurring deployment.
///
/// Returns `Ok(None)` for non-recurring or non-terminal deployments and when
/// the pattern has no further firing within the search horizon.
pub fn successor(deployment: &Deployment, now: DateTime<Utc>) -> Result<Option<Deployment>> {
    if !deployment.is_recurring() || !deployment.status.is_terminal() {
        return Ok(None);
    }

    let pattern = deployment.recurring_pattern.as_deref().ok_or_else(|| {
        FleetcastError::Validation(format!(
            "recurring deployment {} has no recurring_pattern",
            deployment.id
        ))
    })?;
    let schedule = CronSchedule::parse(pattern)?;
    let after = deployment.scheduled_for.unwrap_or(now);

    Ok(next_occurrence(&schedule, after, now).map(|at| deployment.next_occurrence(at, now)))
}
