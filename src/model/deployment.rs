// src/model/deployment.rs

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cron::CronSchedule;
use crate::errors::{FleetcastError, Result};
use crate::types::{BootMode, DeploymentId, DeviceName, ImageName, ProfileName, ScheduleType};

/// Name of the imaging engine used when a deployment does not pick one.
pub const DEFAULT_IMAGING_ENGINE: &str = "default";

/// Lifecycle of a single deployment.
///
/// ```text
/// pending -> deploying -> completed | failed
/// pending | deploying -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Completed,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Completed | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Request to create a deployment, before validation.
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub device: DeviceName,
    pub image: ImageName,
    pub schedule_type: ScheduleType,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub recurring_pattern: Option<String>,
    pub boot_mode: BootMode,
    pub imaging_engine: String,
    pub profile: Option<ProfileName>,
}

impl NewDeployment {
    /// A deployment that runs as soon as the scheduler sees it.
    pub fn instant(device: impl Into<DeviceName>, image: impl Into<ImageName>) -> Self {
        Self {
            device: device.into(),
            image: image.into(),
            schedule_type: ScheduleType::Instant,
            scheduled_for: None,
            recurring_pattern: None,
            boot_mode: BootMode::default(),
            imaging_engine: DEFAULT_IMAGING_ENGINE.to_string(),
            profile: None,
        }
    }

    /// A one-shot deployment due at `at`.
    pub fn delayed(
        device: impl Into<DeviceName>,
        image: impl Into<ImageName>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            schedule_type: ScheduleType::Delayed,
            scheduled_for: Some(at),
            ..Self::instant(device, image)
        }
    }

    /// A recurring deployment whose first occurrence is `first`.
    pub fn recurring(
        device: impl Into<DeviceName>,
        image: impl Into<ImageName>,
        pattern: impl Into<String>,
        first: DateTime<Utc>,
    ) -> Self {
        Self {
            schedule_type: ScheduleType::Recurring,
            scheduled_for: Some(first),
            recurring_pattern: Some(pattern.into()),
            ..Self::instant(device, image)
        }
    }

    pub fn with_profile(mut self, profile: impl Into<ProfileName>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_boot_mode(mut self, boot_mode: BootMode) -> Self {
        self.boot_mode = boot_mode;
        self
    }

    pub fn with_imaging_engine(mut self, engine: impl Into<String>) -> Self {
        self.imaging_engine = engine.into();
        self
    }
}

/// One deployment of one image to one device.
///
/// Recurring schedules are materialised as one record per firing; `parent`
/// links an occurrence to the one that spawned it.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: DeploymentId,
    pub device: DeviceName,
    pub image: ImageName,
    pub schedule_type: ScheduleType,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub recurring_pattern: Option<String>,
    pub status: DeploymentStatus,
    pub progress: u8,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub boot_mode: BootMode,
    pub imaging_engine: String,
    pub profile: Option<ProfileName>,
    pub created_at: DateTime<Utc>,
    pub parent: Option<DeploymentId>,
}

impl Deployment {
    /// Validate a request and build a `pending` deployment.
    ///
    /// - `delayed` needs `scheduled_for` strictly after `now`.
    /// - `recurring` needs a valid cron pattern and a first occurrence.
    pub fn create(new: NewDeployment, now: DateTime<Utc>) -> Result<Self> {
        if new.device.trim().is_empty() {
            return Err(FleetcastError::Validation(
                "deployment needs a device".to_string(),
            ));
        }
        if new.image.trim().is_empty() {
            return Err(FleetcastError::Validation(
                "deployment needs an image".to_string(),
            ));
        }

        match new.schedule_type {
            ScheduleType::Instant => {}
            ScheduleType::Delayed => match new.scheduled_for {
                None => {
                    return Err(FleetcastError::Validation(
                        "delayed deployment needs scheduled_for".to_string(),
                    ));
                }
                Some(at) if at <= now => {
                    return Err(FleetcastError::Validation(format!(
                        "scheduled_for {at} is not in the future"
                    )));
                }
                Some(_) => {}
            },
            ScheduleType::Recurring => {
                let pattern = new.recurring_pattern.as_deref().ok_or_else(|| {
                    FleetcastError::Validation(
                        "recurring deployment needs recurring_pattern".to_string(),
                    )
                })?;
                CronSchedule::parse(pattern)?;
                if new.scheduled_for.is_none() {
                    return Err(FleetcastError::Validation(
                        "recurring deployment needs scheduled_for".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            device: new.device,
            image: new.image,
            schedule_type: new.schedule_type,
            scheduled_for: new.scheduled_for,
            recurring_pattern: new.recurring_pattern,
            status: DeploymentStatus::Pending,
            progress: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
            boot_mode: new.boot_mode,
            imaging_engine: new.imaging_engine,
            profile: new.profile,
            created_at: now,
            parent: None,
        })
    }

    /// Fresh `pending` record for the next firing of this recurring deployment.
    pub fn next_occurrence(&self, scheduled_for: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            scheduled_for: Some(scheduled_for),
            status: DeploymentStatus::Pending,
            progress: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            parent: Some(self.id),
            ..self.clone()
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.schedule_type == ScheduleType::Recurring
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn delayed_in_the_past_is_rejected() {
        let now = Utc::now();
        let err = Deployment::create(
            NewDeployment::delayed("pc-1", "win11", now - TimeDelta::minutes(1)),
            now,
        )
        .unwrap_err();
        assert!(err.is_validation());

        let err = Deployment::create(NewDeployment::delayed("pc-1", "win11", now), now)
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn delayed_in_the_future_starts_pending() {
        let now = Utc::now();
        let d = Deployment::create(
            NewDeployment::delayed("pc-1", "win11", now + TimeDelta::hours(1)),
            now,
        )
        .unwrap();
        assert_eq!(d.status, DeploymentStatus::Pending);
        assert_eq!(d.progress, 0);
    }

    #[test]
    fn recurring_needs_a_valid_pattern() {
        let now = Utc::now();
        let err = Deployment::create(
            NewDeployment::recurring("pc-1", "win11", "0 25 * * *", now),
            now,
        )
        .unwrap_err();
        assert!(matches!(err, FleetcastError::InvalidCron(_)));
    }

    #[test]
    fn next_occurrence_is_a_new_record() {
        let now = Utc::now();
        let first = Deployment::create(
            NewDeployment::recurring("pc-1", "win11", "0 2 * * *", now),
            now,
        )
        .unwrap();
        let next = first.next_occurrence(now + TimeDelta::days(1), now);
        assert_ne!(next.id, first.id);
        assert_eq!(next.parent, Some(first.id));
        assert_eq!(next.status, DeploymentStatus::Pending);
        assert_eq!(next.recurring_pattern, first.recurring_pattern);
    }
}
