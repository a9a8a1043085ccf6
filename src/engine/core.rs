// src/engine/core.rs

//! Pure core of the scheduler loop.
//!
//! [`Orchestrator`] owns the record store and both state machines. It has no
//! channels and never awaits; collaborator events are drained from their
//! per-job channels inside [`Orchestrator::tick`]. Everything that needs the
//! async world (running task chains) is returned as a [`CoreCommand`].

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::chain::ChainReport;
use crate::deploy::{DeploymentStateMachine, DeploymentTick};
use crate::errors::{FleetcastError, Result};
use crate::model::{
    BindingTarget, DeploymentStatus, NewDeployment, NewSession, ProfileBinding, SessionStatus,
};
use crate::multicast::{MulticastOrchestrator, MulticastTick};
use crate::schedule;
use crate::store::{DeviceRegistry, Store};
use crate::types::{BindingId, DeploymentId, SessionId};

use super::{CoreCommand, CoreStep, RuntimeEvent, RuntimeOptions};

#[derive(Debug)]
pub struct Orchestrator {
    store: Store,
    registry: Arc<dyn DeviceRegistry>,
    deployments: DeploymentStateMachine,
    multicast: MulticastOrchestrator,
    running_chains: BTreeSet<BindingId>,
    options: RuntimeOptions,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        registry: Arc<dyn DeviceRegistry>,
        deployments: DeploymentStateMachine,
        multicast: MulticastOrchestrator,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            store,
            registry,
            deployments,
            multicast,
            running_chains: BTreeSet::new(),
            options,
        }
    }

    pub fn options(&self) -> RuntimeOptions {
        self.options
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Catalog edits (images, profiles) and removal of finished records.
    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    pub fn running_chains(&self) -> usize {
        self.running_chains.len()
    }

    // ---- application entry points ------------------------------------

    pub fn submit_deployment(&mut self, new: NewDeployment, now: DateTime<Utc>) -> Result<DeploymentId> {
        self.deployments.submit(&mut self.store, new, now)
    }

    pub fn create_session(&mut self, new: NewSession, now: DateTime<Utc>) -> Result<SessionId> {
        self.multicast.create(&mut self.store, new, now)
    }

    pub fn add_participant(&mut self, session: SessionId, device: &str) -> Result<()> {
        self.multicast.add_participant(&mut self.store, session, device)
    }

    pub fn remove_participant(&mut self, session: SessionId, device: &str) -> Result<()> {
        self.multicast.remove_participant(&mut self.store, session, device)
    }

    pub fn start_session(&mut self, session: SessionId, now: DateTime<Utc>) -> Result<()> {
        self.multicast.start(&mut self.store, session, now)
    }

    /// Cancel one deployment; a recurring series continues with its next
    /// occurrence, whose id is returned.
    pub fn cancel_deployment(&mut self, id: DeploymentId, now: DateTime<Utc>) -> Result<Option<DeploymentId>> {
        self.deployments.cancel(&mut self.store, id, now)
    }

    pub fn cancel_series(&mut self, id: DeploymentId, now: DateTime<Utc>) -> Result<()> {
        self.deployments.cancel_series(&mut self.store, id, now)
    }

    pub fn cancel_session(&mut self, id: SessionId, now: DateTime<Utc>) -> Result<()> {
        self.multicast.cancel(&mut self.store, id, now)
    }

    /// Command to cancel a running chain.
    pub fn cancel_chain(&self, binding: BindingId) -> Result<CoreCommand> {
        if !self.running_chains.contains(&binding) {
            return Err(FleetcastError::NotFound(format!("running chain for binding {binding}")));
        }
        Ok(CoreCommand::CancelTaskChain(binding))
    }

    // ---- loop ---------------------------------------------------------

    /// One scheduler tick at `now`.
    ///
    /// Advances deployments then multicast sessions, creates a profile
    /// binding for every deployment or participant that completed with a
    /// profile attached, and returns the chains to run.
    pub fn tick(&mut self, now: DateTime<Utc>) -> CoreStep {
        let deployed = self.deployments.advance(&mut self.store, now);
        let multicast = self.multicast.advance(&mut self.store, now);
        log_tick(&deployed, &multicast);

        let mut commands = Vec::new();
        for id in &deployed.completed {
            if let Some(binding) = self.bind_deployment(*id, now) {
                commands.push(CoreCommand::RunTaskChain(binding));
            }
        }
        for (session, device) in &multicast.completed_participants {
            if let Some(binding) = self.bind_participant(*session, device, now) {
                commands.push(CoreCommand::RunTaskChain(binding));
            }
        }

        if self.options.exit_when_idle && commands.is_empty() && self.is_idle(now) {
            info!("nothing in flight and nothing due; stopping");
            return CoreStep::exit(commands);
        }
        CoreStep::proceed(commands)
    }

    /// Handle a single runtime event.
    pub fn step(&mut self, event: RuntimeEvent, now: DateTime<Utc>) -> CoreStep {
        match event {
            RuntimeEvent::ChainFinished(report) => {
                self.record_chain(report);
                if self.options.exit_when_idle && self.is_idle(now) {
                    info!("last chain finished and nothing due; stopping");
                    return CoreStep::exit(Vec::new());
                }
                CoreStep::proceed(Vec::new())
            }
            RuntimeEvent::CancelDeployment(id) => {
                if let Err(e) = self.cancel_deployment(id, now) {
                    warn!(deployment = %id, error = %e, "cancel rejected");
                }
                CoreStep::proceed(Vec::new())
            }
            RuntimeEvent::CancelSeries(id) => {
                if let Err(e) = self.cancel_series(id, now) {
                    warn!(deployment = %id, error = %e, "cancel rejected");
                }
                CoreStep::proceed(Vec::new())
            }
            RuntimeEvent::CancelSession(id) => {
                if let Err(e) = self.cancel_session(id, now) {
                    warn!(session = %id, error = %e, "cancel rejected");
                }
                CoreStep::proceed(Vec::new())
            }
            RuntimeEvent::CancelChain(binding) => match self.cancel_chain(binding) {
                Ok(command) => CoreStep::proceed(vec![command]),
                Err(e) => {
                    warn!(%binding, error = %e, "cancel rejected");
                    CoreStep::proceed(Vec::new())
                }
            },
            RuntimeEvent::ShutdownRequested => {
                let deployments = self.deployments.cancel_in_flight(&mut self.store, now);
                let sessions = self.multicast.cancel_active(&mut self.store, now);
                info!(
                    chains = self.running_chains.len(),
                    deployments = deployments.len(),
                    sessions = sessions.len(),
                    "shutdown requested"
                );
                let commands = self
                    .running_chains
                    .iter()
                    .map(|b| CoreCommand::CancelTaskChain(*b))
                    .collect();
                CoreStep::exit(commands)
            }
        }
    }

    /// Store the runs of a finished chain and forget it.
    pub fn record_chain(&mut self, report: ChainReport) {
        self.running_chains.remove(&report.binding);
        info!(binding = %report.binding, outcome = %report.outcome, runs = report.runs.len(), "recording chain result");
        if let Err(e) = self
            .store
            .record_chain_result(report.binding, report.outcome, report.runs)
        {
            // The owning aggregate was removed while the chain ran.
            warn!(binding = %report.binding, error = %e, "dropping chain result");
        }
    }

    /// No imaging job, transmission or chain is in flight, no pending
    /// deployment is due on an available device, and no auto-start session
    /// is ready to start.
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        if self.deployments.in_flight() > 0
            || self.multicast.in_flight() > 0
            || !self.running_chains.is_empty()
        {
            return false;
        }
        let due = self
            .store
            .deployments()
            .any(|d| schedule::is_due(d, now) && self.available(&d.device));
        let startable = self.store.sessions().any(|s| {
            s.status == SessionStatus::Waiting
                && s.auto_start
                && !s.participants.is_empty()
                && s.participants.iter().all(|p| self.available(&p.device))
        });
        !due && !startable
    }

    fn available(&self, device: &str) -> bool {
        self.registry
            .status(device)
            .is_some_and(|status| status.is_available())
    }

    fn bind_deployment(&mut self, id: DeploymentId, now: DateTime<Utc>) -> Option<ProfileBinding> {
        let deployment = self.store.deployment(id)?;
        if deployment.status != DeploymentStatus::Completed {
            return None;
        }
        let name = deployment.profile.as_ref()?;
        let Some(profile) = self.store.profile(name).cloned() else {
            warn!(deployment = %id, profile = %name, "profile no longer exists; no tasks will run");
            return None;
        };
        let binding = ProfileBinding::new(
            profile,
            BindingTarget::Deployment(id),
            deployment.device.clone(),
            deployment.image.clone(),
            now,
        );
        Some(self.register_binding(binding))
    }

    fn bind_participant(
        &mut self,
        session: SessionId,
        device: &str,
        now: DateTime<Utc>,
    ) -> Option<ProfileBinding> {
        let s = self.store.session(session)?;
        let name = s.profile.as_ref()?;
        let Some(profile) = self.store.profile(name).cloned() else {
            warn!(%session, profile = %name, "profile no longer exists; no tasks will run");
            return None;
        };
        let binding = ProfileBinding::new(
            profile,
            BindingTarget::Participant {
                session,
                device: device.to_string(),
            },
            device.to_string(),
            s.image.clone(),
            now,
        );
        Some(self.register_binding(binding))
    }

    fn register_binding(&mut self, binding: ProfileBinding) -> ProfileBinding {
        debug!(
            binding = %binding.id,
            device = %binding.device,
            profile = %binding.profile.name,
            "profile bound"
        );
        self.running_chains.insert(binding.id);
        self.store.insert_binding(binding.clone());
        binding
    }
}

fn log_tick(deployed: &DeploymentTick, multicast: &MulticastTick) {
    let changed = !deployed.started.is_empty()
        || !deployed.completed.is_empty()
        || !deployed.failed.is_empty()
        || !deployed.spawned.is_empty()
        || !multicast.started.is_empty()
        || !multicast.finished.is_empty()
        || !multicast.completed_participants.is_empty();
    if changed {
        debug!(
            started = deployed.started.len(),
            deferred = deployed.deferred.len(),
            completed = deployed.completed.len(),
            failed = deployed.failed.len(),
            spawned = deployed.spawned.len(),
            sessions_started = multicast.started.len(),
            sessions_finished = multicast.finished.len(),
            participants_completed = multicast.completed_participants.len(),
            "tick"
        );
    }
}
