// src/config/mod.rs

//! Configuration loading and validation for fleetcast.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate references, schedules and patterns (`validate.rs`).
//! - Turn a validated config into a ready-to-run orchestrator (`plan.rs`).

pub mod loader;
pub mod model;
pub mod plan;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{
    ConfigFile, DeploymentSection, DeviceSection, ImageSection, ImagingSection,
    MulticastSection, ProfileSection, RawConfigFile, RunnersSection, SchedulerSection,
    TaskSection, TransmissionSection,
};
pub use plan::{build_plan, Plan};
