// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::model::{DeviceStatus, TaskConfig, DEFAULT_IMAGING_ENGINE};
use crate::types::{BootMode, ExecutionOrder, ScheduleType};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [scheduler]
/// tick_interval_secs = 5
///
/// [imaging.default]
/// cmd = "clone-disk --target {device} --image {image_path} --boot {boot_mode}"
/// progress_pattern = "^progress=(\\d+)"
///
/// [transmission]
/// cmd = "udp-sender --file {image_path} --mcast-addr {address} --port {port}"
/// bytes_pattern = "bytes=(\\d+)"
///
/// [runners]
/// script = "{interpreter} -c '{script}'"
///
/// [device.lab-01]
/// status = "online"
///
/// [image.win11]
/// path = "/srv/images/win11.img"
/// size_bytes = 21474836480
///
/// [profile.base]
/// halt_on_failure = true
///
/// [[profile.base.task]]
/// name = "install agent"
/// type = "snapin"
/// package = "agent.msi"
///
/// [[deployment]]
/// device = "lab-01"
/// image = "win11"
/// profile = "base"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// Imaging engines by name; deployments pick one with `imaging_engine`.
    #[serde(default)]
    pub imaging: BTreeMap<String, ImagingSection>,

    #[serde(default)]
    pub transmission: TransmissionSection,

    #[serde(default)]
    pub runners: RunnersSection,

    #[serde(default)]
    pub device: BTreeMap<String, DeviceSection>,

    #[serde(default)]
    pub image: BTreeMap<String, ImageSection>,

    #[serde(default)]
    pub profile: BTreeMap<String, ProfileSection>,

    #[serde(default)]
    pub deployment: Vec<DeploymentSection>,

    #[serde(default)]
    pub multicast: Vec<MulticastSection>,
}

/// A config that passed validation. Built with `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    raw: RawConfigFile,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self { raw }
    }

    pub fn scheduler(&self) -> &SchedulerSection {
        &self.raw.scheduler
    }

    pub fn imaging(&self) -> &BTreeMap<String, ImagingSection> {
        &self.raw.imaging
    }

    pub fn transmission(&self) -> &TransmissionSection {
        &self.raw.transmission
    }

    pub fn runners(&self) -> &RunnersSection {
        &self.raw.runners
    }

    pub fn devices(&self) -> &BTreeMap<String, DeviceSection> {
        &self.raw.device
    }

    pub fn images(&self) -> &BTreeMap<String, ImageSection> {
        &self.raw.image
    }

    pub fn profiles(&self) -> &BTreeMap<String, ProfileSection> {
        &self.raw.profile
    }

    pub fn deployments(&self) -> &[DeploymentSection] {
        &self.raw.deployment
    }

    pub fn multicast(&self) -> &[MulticastSection] {
        &self.raw.multicast
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Watchdog for a single imaging job.
    #[serde(default = "default_timeout_minutes")]
    pub imaging_timeout_minutes: u64,

    /// Watchdog for a whole multicast session.
    #[serde(default = "default_timeout_minutes")]
    pub transmission_timeout_minutes: u64,

    /// Same as `--once`.
    #[serde(default)]
    pub exit_when_idle: bool,
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn default_timeout_minutes() -> u64 {
    240
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            imaging_timeout_minutes: default_timeout_minutes(),
            transmission_timeout_minutes: default_timeout_minutes(),
            exit_when_idle: false,
        }
    }
}

impl SchedulerSection {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn imaging_timeout(&self) -> Duration {
        Duration::from_secs(self.imaging_timeout_minutes.saturating_mul(60))
    }

    pub fn transmission_timeout(&self) -> Duration {
        Duration::from_secs(self.transmission_timeout_minutes.saturating_mul(60))
    }
}

/// `[imaging.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImagingSection {
    /// Placeholders: `{deployment}`, `{device}`, `{image}`, `{image_path}`,
    /// `{boot_mode}`.
    pub cmd: String,

    /// Regex whose first capture group is a percentage.
    #[serde(default)]
    pub progress_pattern: Option<String>,
}

/// `[transmission]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TransmissionSection {
    /// Placeholders: `{session}`, `{address}`, `{port}`, `{image}`,
    /// `{image_path}`, `{receivers}`, `{receiver_count}`. Required as soon
    /// as a `[[multicast]]` session is configured.
    #[serde(default)]
    pub cmd: Option<String>,

    /// Regex whose first capture group is the cumulative byte count.
    #[serde(default)]
    pub bytes_pattern: Option<String>,

    /// Regex whose first capture group is the name of a finished receiver.
    #[serde(default)]
    pub receiver_done_pattern: Option<String>,
}

/// `[runners]` section: one command template per task type.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RunnersSection {
    #[serde(default)]
    pub snapin: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub domain_join: Option<String>,
    #[serde(default)]
    pub product_key: Option<String>,
}

/// `[device.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DeviceSection {
    #[serde(default)]
    pub status: DeviceStatus,
}

/// `[image.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageSection {
    pub path: String,
    pub size_bytes: u64,
}

/// `[profile.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProfileSection {
    #[serde(default)]
    pub execution_order: ExecutionOrder,

    #[serde(default)]
    pub halt_on_failure: bool,

    #[serde(default)]
    pub task: Vec<TaskSection>,
}

/// `[[profile.<name>.task]]` entry. The `type` key selects the task kind;
/// the remaining keys are that kind's settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSection {
    pub name: String,

    #[serde(flatten)]
    pub config: TaskConfig,

    #[serde(default = "default_task_timeout_minutes")]
    pub timeout_minutes: u32,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub retry_delay_seconds: u64,
}

fn default_task_timeout_minutes() -> u32 {
    30
}

/// `[[deployment]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentSection {
    pub device: String,
    pub image: String,

    #[serde(default)]
    pub schedule: ScheduleType,

    /// RFC 3339 timestamp, e.g. `"2026-11-01T02:00:00Z"`.
    #[serde(default)]
    pub scheduled_for: Option<String>,

    /// Five-field cron expression for recurring deployments.
    #[serde(default)]
    pub cron: Option<String>,

    #[serde(default)]
    pub boot_mode: BootMode,

    #[serde(default = "default_imaging_engine")]
    pub imaging_engine: String,

    #[serde(default)]
    pub profile: Option<String>,
}

fn default_imaging_engine() -> String {
    DEFAULT_IMAGING_ENGINE.to_string()
}

/// `[[multicast]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MulticastSection {
    pub image: String,
    pub address: String,
    pub port: u32,
    pub max_clients: u32,

    #[serde(default)]
    pub participants: Vec<String>,

    #[serde(default)]
    pub profile: Option<String>,

    /// Start as soon as every participant device can be claimed.
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
}

fn default_auto_start() -> bool {
    true
}
