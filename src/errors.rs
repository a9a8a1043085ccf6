// src/errors.rs

//! Crate-wide error type and helpers.
//!
//! The variants follow the orchestrator's failure taxonomy:
//! - validation problems are rejected before anything reaches the scheduler,
//! - capacity problems are retried on the next tick,
//! - collaborator and timeout failures end as a terminal `failed` state with a
//!   persisted message.

use thiserror::Error;
use uuid::Uuid;

use crate::cron::InvalidCron;

#[derive(Error, Debug)]
pub enum FleetcastError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    InvalidCron(#[from] InvalidCron),

    #[error("Session {session} is full ({max_clients} clients)")]
    CapacityExceeded { session: Uuid, max_clients: u16 },

    #[error("Session {0} has no participants")]
    NoParticipants(Uuid),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FleetcastError {
    /// Errors that are rejected at creation time and never enter the scheduler.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            FleetcastError::Validation(_) | FleetcastError::InvalidCron(_)
        )
    }

    /// Errors that leave the unit of work untouched so the next tick retries it.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            FleetcastError::CapacityExceeded { .. } | FleetcastError::DeviceBusy(_)
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FleetcastError>;
