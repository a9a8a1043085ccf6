// src/model/mod.rs

//! Records the orchestrator owns.
//!
//! Deployments and multicast sessions are the root aggregates; participants,
//! profile bindings and task runs belong to them.

pub mod deployment;
pub mod device;
pub mod multicast;
pub mod profile;

pub use deployment::{Deployment, DeploymentStatus, NewDeployment, DEFAULT_IMAGING_ENGINE};
pub use device::{Device, DeviceStatus, Image};
pub use multicast::{
    MulticastParticipant, MulticastSession, NewSession, ParticipantStatus, SessionStatus,
};
pub use profile::{
    BindingTarget, ChainOutcome, PostDeploymentProfile, PostDeploymentTask, ProfileBinding,
    TaskConfig, TaskRun, TaskRunStatus, TaskType, MAX_RETRY_COUNT,
};
