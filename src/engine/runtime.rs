// src/engine/runtime.rs

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::chain::ChainBackend;
use crate::errors::{Error, Result};
use crate::types::{BindingId, DeploymentId, SessionId};

use super::clock::Clock;
use super::core::Orchestrator;
use super::{CoreCommand, CoreStep, RuntimeEvent};

/// How long a stopping runtime waits for cancelled chains to report back.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Async shell around [`Orchestrator`].
///
/// Ticks the core on a fixed interval, feeds it [`RuntimeEvent`]s and hands
/// the chains it asks for to a [`ChainBackend`].
pub struct Runtime<B: ChainBackend, C: Clock> {
    core: Orchestrator,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    backend: B,
    clock: C,
}

impl<B: ChainBackend, C: Clock> fmt::Debug for Runtime<B, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<B: ChainBackend, C: Clock> Runtime<B, C> {
    pub fn new(core: Orchestrator, event_rx: mpsc::Receiver<RuntimeEvent>, backend: B, clock: C) -> Self {
        Self {
            core,
            event_rx,
            backend,
            clock,
        }
    }

    /// Main loop. Returns the core so callers can inspect the final state.
    pub async fn run(mut self) -> Result<Orchestrator> {
        let options = self.core.options();
        info!(tick_interval = ?options.tick_interval, once = options.exit_when_idle, "fleetcast runtime started");

        let mut interval = tokio::time::interval(options.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                _ = interval.tick() => {
                    let now = self.clock.now();
                    self.core.tick(now)
                }
                event = self.event_rx.recv() => match event {
                    Some(event) => {
                        debug!(?event, "runtime received event");
                        let now = self.clock.now();
                        self.core.step(event, now)
                    }
                    None => {
                        info!("runtime event channel closed; exiting");
                        break;
                    }
                },
            };

            if !self.execute(step).await? {
                break;
            }
        }

        if self.core.running_chains() > 0 {
            self.drain_chains().await;
        }

        info!("runtime exiting");
        Ok(self.core)
    }

    /// Record reports from chains that were cancelled on the way out.
    async fn drain_chains(&mut self) {
        info!(chains = self.core.running_chains(), grace = ?SHUTDOWN_GRACE, "waiting for task chains to stop");
        let deadline = Instant::now() + SHUTDOWN_GRACE;

        while self.core.running_chains() > 0 {
            match tokio::time::timeout_at(deadline, self.event_rx.recv()).await {
                Ok(Some(RuntimeEvent::ChainFinished(report))) => self.core.record_chain(report),
                Ok(Some(event)) => debug!(?event, "ignoring event while stopping"),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        chains = self.core.running_chains(),
                        "task chains did not stop within the grace period"
                    );
                    break;
                }
            }
        }
    }

    async fn execute(&mut self, step: CoreStep) -> Result<bool> {
        for command in step.commands {
            match command {
                CoreCommand::RunTaskChain(binding) => self.backend.run_chain(binding).await?,
                CoreCommand::CancelTaskChain(binding) => self.backend.cancel_chain(binding).await?,
                CoreCommand::RequestExit => info!("core issued RequestExit command"),
            }
        }
        Ok(step.keep_running)
    }
}

/// Cloneable sender for talking to a running [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    tx: mpsc::Sender<RuntimeEvent>,
}

impl RuntimeHandle {
    pub fn new(tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self { tx }
    }

    pub async fn cancel_deployment(&self, id: DeploymentId) -> Result<()> {
        self.send(RuntimeEvent::CancelDeployment(id)).await
    }

    pub async fn cancel_series(&self, id: DeploymentId) -> Result<()> {
        self.send(RuntimeEvent::CancelSeries(id)).await
    }

    pub async fn cancel_session(&self, id: SessionId) -> Result<()> {
        self.send(RuntimeEvent::CancelSession(id)).await
    }

    pub async fn cancel_chain(&self, binding: BindingId) -> Result<()> {
        self.send(RuntimeEvent::CancelChain(binding)).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(RuntimeEvent::ShutdownRequested).await
    }

    async fn send(&self, event: RuntimeEvent) -> Result<()> {
        self.tx.send(event).await.map_err(Error::from)?;
        Ok(())
    }
}
