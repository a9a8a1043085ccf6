use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use uuid::Uuid;

pub type DeviceName = String;
pub type ImageName = String;
pub type ProfileName = String;

pub type DeploymentId = Uuid;
pub type SessionId = Uuid;
pub type BindingId = Uuid;

/// When a deployment becomes due.
///
/// - `Instant`: due as soon as the scheduler sees it.
/// - `Delayed`: due once `scheduled_for` has passed.
/// - `Recurring`: due at each firing of a cron pattern; every firing is its
///   own deployment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    #[default]
    Instant,
    Delayed,
    Recurring,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleType::Instant => "instant",
            ScheduleType::Delayed => "delayed",
            ScheduleType::Recurring => "recurring",
        }
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "instant" => Ok(ScheduleType::Instant),
            "delayed" => Ok(ScheduleType::Delayed),
            "recurring" => Ok(ScheduleType::Recurring),
            other => Err(format!(
                "invalid schedule type: {other} (expected \"instant\", \"delayed\" or \"recurring\")"
            )),
        }
    }
}

/// Firmware boot mode handed to the imaging engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    Bios,
    #[default]
    Uefi,
}

impl BootMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BootMode::Bios => "bios",
            BootMode::Uefi => "uefi",
        }
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the tasks of a post-deployment profile are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOrder {
    #[default]
    Sequential,
    Parallel,
}

impl fmt::Display for ExecutionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionOrder::Sequential => f.write_str("sequential"),
            ExecutionOrder::Parallel => f.write_str("parallel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_type_parses_case_insensitively() {
        assert_eq!("Delayed".parse::<ScheduleType>(), Ok(ScheduleType::Delayed));
        assert_eq!(" recurring ".parse::<ScheduleType>(), Ok(ScheduleType::Recurring));
        assert!("weekly".parse::<ScheduleType>().is_err());
    }
}
