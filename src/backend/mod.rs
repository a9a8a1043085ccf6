// src/backend/mod.rs

//! Collaborator contracts consumed by the orchestrator.
//!
//! - [`ImagingEngine`] images one device and pushes progress events.
//! - [`TransmissionEngine`] fans one image out over multicast and pushes byte
//!   counts.
//! - [`TaskRunner`] executes one post-deployment task.
//!
//! Engines push events into a channel per job handle; the orchestrator drains
//! those channels on every tick instead of being called back, so no engine
//! ever re-enters orchestrator state.
//!
//! Shell-command implementations of all three live in [`command`],
//! [`imaging`], [`transmission`] and [`runner`].

pub mod command;
pub mod imaging;
pub mod runner;
pub mod transmission;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::Result;
use crate::model::{Image, TaskConfig, TaskType};
use crate::types::{BootMode, DeploymentId, DeviceName, SessionId};

pub use imaging::CommandImagingEngine;
pub use runner::CommandTaskRunner;
pub use transmission::CommandTransmissionEngine;

/// Opaque handle of a job owned by a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(pub Uuid);

impl JobHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---- imaging ---------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ImagingRequest {
    pub deployment: DeploymentId,
    pub device: DeviceName,
    pub image: Image,
    pub boot_mode: BootMode,
}

/// Out-of-band events pushed by an imaging engine for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagingEvent {
    /// Percent complete, 0-100.
    Progress(u8),
    Completed,
    Failed(String),
}

/// A started imaging job: its handle and its inbound event channel.
#[derive(Debug)]
pub struct ImagingJob {
    pub handle: JobHandle,
    pub events: mpsc::UnboundedReceiver<ImagingEvent>,
}

pub trait ImagingEngine: Send + Sync {
    fn start(&self, request: ImagingRequest) -> Result<ImagingJob>;

    /// Best-effort abort; the orchestrator records the final state regardless.
    fn abort(&self, handle: JobHandle) -> Result<()>;
}

// ---- transmission ----------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransmissionRequest {
    pub session: SessionId,
    pub address: Ipv4Addr,
    pub port: u16,
    pub image: Image,
    pub receivers: Vec<DeviceName>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransmissionEvent {
    /// Cumulative bytes transmitted so far, sampled at `at`.
    BytesSent { total: u64, at: DateTime<Utc> },
    /// One receiver has the whole image.
    ParticipantCompleted(DeviceName),
    /// The sender finished; every receiver that has not reported otherwise
    /// has the whole image.
    Finished,
    /// Unrecoverable transmission error.
    Failed(String),
}

#[derive(Debug)]
pub struct Transmission {
    pub handle: JobHandle,
    pub events: mpsc::UnboundedReceiver<TransmissionEvent>,
}

pub trait TransmissionEngine: Send + Sync {
    fn open(&self, request: TransmissionRequest) -> Result<Transmission>;

    fn close(&self, handle: JobHandle) -> Result<()>;
}

// ---- task runners ----------------------------------------------------------

/// Result of one task attempt as reported by a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded { output: String },
    Failed { error: String, output: String },
}

pub type TaskFuture<'a> = Pin<Box<dyn Future<Output = TaskOutcome> + Send + 'a>>;

/// Uniform capability implemented once per task type.
pub trait TaskRunner: Send + Sync {
    fn run<'a>(&'a self, config: &'a TaskConfig, timeout: Duration) -> TaskFuture<'a>;
}

/// Task runners keyed by task type.
#[derive(Clone, Default)]
pub struct TaskRunners {
    runners: HashMap<TaskType, Arc<dyn TaskRunner>>,
}

impl TaskRunners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: TaskType, runner: Arc<dyn TaskRunner>) {
        self.runners.insert(task_type, runner);
    }

    pub fn with(mut self, task_type: TaskType, runner: Arc<dyn TaskRunner>) -> Self {
        self.register(task_type, runner);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskRunner>> {
        self.runners.get(&task_type).cloned()
    }

    pub fn registered(&self) -> Vec<TaskType> {
        TaskType::ALL
            .into_iter()
            .filter(|t| self.runners.contains_key(t))
            .collect()
    }
}

impl fmt::Debug for TaskRunners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunners")
            .field("registered", &self.registered())
            .finish()
    }
}
