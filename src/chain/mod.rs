// src/chain/mod.rs

//! Post-deployment task chains.
//!
//! - [`executor`] runs one profile binding: sequential or parallel, with
//!   retries, per-attempt timeouts, halt-on-failure and cooperative
//!   cancellation.
//! - [`backend`] is how the runtime shell dispatches chains without blocking
//!   the scheduler tick.

pub mod backend;
pub mod executor;

use crate::model::{ChainOutcome, TaskRun};
use crate::types::BindingId;

pub use backend::{ChainBackend, RealChainBackend};
pub use executor::TaskChainExecutor;

/// Result of running one binding's chain.
#[derive(Debug, Clone)]
pub struct ChainReport {
    pub binding: BindingId,
    pub outcome: ChainOutcome,
    /// Every attempt of every task, including skipped tasks.
    pub runs: Vec<TaskRun>,
}
