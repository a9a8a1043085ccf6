// src/engine/mod.rs

//! The scheduler loop.
//!
//! The pure core state machine lives in [`core`]: an [`Orchestrator`] that is
//! driven by `tick(now)` and by [`RuntimeEvent`]s and answers with
//! [`CoreCommand`]s. The async/IO shell in [`runtime`] owns the tick
//! interval, the event channel and the chain backend.

pub mod clock;
pub mod core;
pub mod runtime;

use std::time::Duration;

use crate::chain::ChainReport;
use crate::model::ProfileBinding;
use crate::types::{BindingId, DeploymentId, SessionId};

pub use clock::{Clock, SystemClock};
pub use core::Orchestrator;
pub use runtime::{Runtime, RuntimeHandle};

/// Runtime options used by both the core and the async shell.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    pub tick_interval: Duration,
    /// Stop once no work is in flight and nothing is due (used for `--once`).
    pub exit_when_idle: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            exit_when_idle: false,
        }
    }
}

/// Events flowing into the runtime from chain workers, signal handlers and
/// API callers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A task chain ran to a terminal outcome.
    ChainFinished(ChainReport),
    CancelDeployment(DeploymentId),
    /// Cancel a recurring deployment and stop its series.
    CancelSeries(DeploymentId),
    CancelSession(SessionId),
    CancelChain(BindingId),
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    RunTaskChain(ProfileBinding),
    CancelTaskChain(BindingId),
    /// Stop the loop (idle in `--once` mode, or shutdown).
    RequestExit,
}

/// Decision returned by the core after a tick or an event.
#[derive(Debug, Clone)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    pub keep_running: bool,
}

impl CoreStep {
    pub fn proceed(commands: Vec<CoreCommand>) -> Self {
        Self {
            commands,
            keep_running: true,
        }
    }

    pub fn exit(mut commands: Vec<CoreCommand>) -> Self {
        commands.push(CoreCommand::RequestExit);
        Self {
            commands,
            keep_running: false,
        }
    }
}
