// src/deploy/mod.rs

//! Lifecycle of single-device deployments.
//!
//! ```text
//! pending -> deploying -> completed | failed
//! pending | deploying -> cancelled
//! ```
//!
//! `pending -> deploying` happens only from [`DeploymentStateMachine::advance`]
//! and only after the target device was claimed through the registry's
//! compare-and-set. A lost claim leaves the deployment pending for the next
//! tick.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::backend::{ImagingEngine, ImagingEvent, ImagingRequest, JobHandle};
use crate::errors::{FleetcastError, Result};
use crate::model::{Deployment, DeploymentStatus, NewDeployment};
use crate::schedule;
use crate::store::{DeviceRegistry, Store};
use crate::types::DeploymentId;

struct ActiveJob {
    engine: Arc<dyn ImagingEngine>,
    handle: JobHandle,
    events: UnboundedReceiver<ImagingEvent>,
}

/// What one call to [`DeploymentStateMachine::advance`] changed.
#[derive(Debug, Default, Clone)]
pub struct DeploymentTick {
    pub started: Vec<DeploymentId>,
    /// Due but the device could not be claimed; retried next tick.
    pub deferred: Vec<DeploymentId>,
    pub completed: Vec<DeploymentId>,
    pub failed: Vec<DeploymentId>,
    /// Next occurrences created for finished recurring deployments.
    pub spawned: Vec<DeploymentId>,
}

pub struct DeploymentStateMachine {
    registry: Arc<dyn DeviceRegistry>,
    engines: HashMap<String, Arc<dyn ImagingEngine>>,
    jobs: HashMap<DeploymentId, ActiveJob>,
    imaging_timeout: TimeDelta,
}

impl fmt::Debug for DeploymentStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentStateMachine")
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .field("in_flight", &self.jobs.len())
            .field("imaging_timeout", &self.imaging_timeout)
            .finish_non_exhaustive()
    }
}

impl DeploymentStateMachine {
    pub fn new(registry: Arc<dyn DeviceRegistry>, imaging_timeout: Duration) -> Self {
        Self {
            registry,
            engines: HashMap::new(),
            jobs: HashMap::new(),
            imaging_timeout: TimeDelta::from_std(imaging_timeout).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn register_engine(&mut self, name: impl Into<String>, engine: Arc<dyn ImagingEngine>) {
        self.engines.insert(name.into(), engine);
    }

    pub fn has_engine(&self, name: &str) -> bool {
        self.engines.contains_key(name)
    }

    /// Number of deployments currently waiting on an imaging engine.
    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    /// Validate a request against the catalog and registry and store it as
    /// `pending`.
    pub fn submit(
        &self,
        store: &mut Store,
        new: NewDeployment,
        now: DateTime<Utc>,
    ) -> Result<DeploymentId> {
        if store.image(&new.image).is_none() {
            return Err(FleetcastError::Validation(format!(
                "unknown image '{}'",
                new.image
            )));
        }
        if let Some(profile) = &new.profile {
            if store.profile(profile).is_none() {
                return Err(FleetcastError::Validation(format!(
                    "unknown profile '{profile}'"
                )));
            }
        }
        if !self.has_engine(&new.imaging_engine) {
            return Err(FleetcastError::Validation(format!(
                "unknown imaging engine '{}'",
                new.imaging_engine
            )));
        }
        if self.registry.status(&new.device).is_none() {
            return Err(FleetcastError::Validation(format!(
                "unknown device '{}'",
                new.device
            )));
        }

        let deployment = Deployment::create(new, now)?;
        info!(
            deployment = %deployment.id,
            device = %deployment.device,
            image = %deployment.image,
            schedule = %deployment.schedule_type,
            scheduled_for = ?deployment.scheduled_for,
            "deployment created"
        );
        Ok(store.insert_deployment(deployment))
    }

    /// Drive every deployment one step:
    /// 1. apply events pushed by imaging engines,
    /// 2. fail deployments whose imaging exceeded the watchdog timeout,
    /// 3. start pending deployments that are due.
    ///
    /// Errors never escape; a failing deployment ends as `failed` and the
    /// others keep progressing.
    pub fn advance(&mut self, store: &mut Store, now: DateTime<Utc>) -> DeploymentTick {
        let mut tick = DeploymentTick::default();

        self.drain_events(store, now, &mut tick);
        self.enforce_timeouts(store, now, &mut tick);

        for id in store.deployment_ids_with_status(DeploymentStatus::Pending) {
            let due = store
                .deployment(id)
                .is_some_and(|d| schedule::is_due(d, now));
            if !due {
                continue;
            }

            match self.try_start(store, id, now) {
                Ok(()) => tick.started.push(id),
                Err(e) if e.is_capacity() => {
                    debug!(deployment = %id, error = %e, "deployment deferred to next tick");
                    tick.deferred.push(id);
                }
                Err(e) => {
                    warn!(deployment = %id, error = %e, "deployment could not be started");
                    let next = self.finish(
                        store,
                        id,
                        DeploymentStatus::Failed,
                        Some(e.to_string()),
                        now,
                        true,
                    );
                    tick.failed.push(id);
                    tick.spawned.extend(next);
                }
            }
        }

        tick
    }

    /// Claim the device and hand the deployment to its imaging engine.
    ///
    /// Returns [`FleetcastError::DeviceBusy`] if the claim was lost; the
    /// deployment is left untouched in that case.
    pub fn try_start(&mut self, store: &mut Store, id: DeploymentId, now: DateTime<Utc>) -> Result<()> {
        let deployment = store
            .deployment(id)
            .ok_or_else(|| FleetcastError::NotFound(format!("deployment {id}")))?;
        if deployment.status != DeploymentStatus::Pending {
            return Err(FleetcastError::InvalidTransition(format!(
                "deployment {id} is {}; only pending deployments can start",
                deployment.status
            )));
        }

        let engine = self
            .engines
            .get(&deployment.imaging_engine)
            .cloned()
            .ok_or_else(|| {
                FleetcastError::Collaborator(format!(
                    "imaging engine '{}' is not registered",
                    deployment.imaging_engine
                ))
            })?;
        let image = store.image(&deployment.image).cloned().ok_or_else(|| {
            FleetcastError::Validation(format!("image '{}' no longer exists", deployment.image))
        })?;
        let device = deployment.device.clone();
        let request = ImagingRequest {
            deployment: id,
            device: device.clone(),
            image,
            boot_mode: deployment.boot_mode,
        };

        if !self.registry.claim(&device)? {
            return Err(FleetcastError::DeviceBusy(device));
        }

        let job = match engine.start(request) {
            Ok(job) => job,
            Err(e) => {
                if let Err(release_err) = self.registry.release(&device) {
                    warn!(%device, error = %release_err, "failed to release device after start error");
                }
                return Err(match e {
                    FleetcastError::Collaborator(_) => e,
                    other => FleetcastError::Collaborator(other.to_string()),
                });
            }
        };

        let deployment = store.deployment_mut(id)?;
        deployment.status = DeploymentStatus::Deploying;
        deployment.started_at = Some(now);
        deployment.progress = 0;
        info!(
            deployment = %id,
            %device,
            image = %deployment.image,
            boot_mode = %deployment.boot_mode,
            job = %job.handle,
            "deployment started"
        );

        self.jobs.insert(
            id,
            ActiveJob {
                engine,
                handle: job.handle,
                events: job.events,
            },
        );
        Ok(())
    }

    /// User-initiated cancel of a pending or deploying deployment.
    ///
    /// The imaging engine is asked to abort, but the deployment is recorded as
    /// `cancelled` whether or not it acknowledges. For recurring deployments
    /// the next occurrence is still created; its id is returned.
    pub fn cancel(
        &mut self,
        store: &mut Store,
        id: DeploymentId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeploymentId>> {
        self.cancel_inner(store, id, now, true)
    }

    /// Cancel every deployment still waiting on its imaging engine, aborting
    /// the jobs and releasing their devices. Recurring series keep their next
    /// occurrence.
    pub fn cancel_in_flight(&mut self, store: &mut Store, now: DateTime<Utc>) -> Vec<DeploymentId> {
        let ids: Vec<DeploymentId> = self.jobs.keys().copied().collect();
        let mut cancelled = Vec::with_capacity(ids.len());
        for id in ids {
            match self.cancel(store, id, now) {
                Ok(_) => cancelled.push(id),
                Err(e) => {
                    warn!(deployment = %id, error = %e, "could not cancel in-flight deployment");
                    self.jobs.remove(&id);
                }
            }
        }
        cancelled
    }

    /// Cancel a recurring deployment without creating its next occurrence.
    pub fn cancel_series(&mut self, store: &mut Store, id: DeploymentId, now: DateTime<Utc>) -> Result<()> {
        self.cancel_inner(store, id, now, false).map(|_| ())
    }

    fn cancel_inner(
        &mut self,
        store: &mut Store,
        id: DeploymentId,
        now: DateTime<Utc>,
        spawn_next: bool,
    ) -> Result<Option<DeploymentId>> {
        let status = store
            .deployment(id)
            .map(|d| d.status)
            .ok_or_else(|| FleetcastError::NotFound(format!("deployment {id}")))?;

        match status {
            DeploymentStatus::Pending => {}
            DeploymentStatus::Deploying => {
                if let Some(job) = self.jobs.get(&id) {
                    if let Err(e) = job.engine.abort(job.handle) {
                        warn!(deployment = %id, error = %e, "imaging engine did not accept abort");
                    }
                }
            }
            other => {
                return Err(FleetcastError::InvalidTransition(format!(
                    "deployment {id} is already {other}"
                )));
            }
        }

        info!(deployment = %id, from = %status, "deployment cancelled");
        Ok(self.finish(store, id, DeploymentStatus::Cancelled, None, now, spawn_next))
    }

    fn drain_events(&mut self, store: &mut Store, now: DateTime<Utc>, tick: &mut DeploymentTick) {
        let mut drained: Vec<(DeploymentId, Vec<ImagingEvent>)> = Vec::new();

        for (id, job) in self.jobs.iter_mut() {
            let mut events = Vec::new();
            loop {
                match job.events.try_recv() {
                    Ok(event) => events.push(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        events.push(ImagingEvent::Failed(
                            "imaging engine closed its event channel".to_string(),
                        ));
                        break;
                    }
                }
            }
            if !events.is_empty() {
                drained.push((*id, events));
            }
        }

        for (id, events) in drained {
            for event in events {
                if !self.jobs.contains_key(&id) {
                    // Already terminal; later events are stale.
                    break;
                }
                self.apply_event(store, id, event, now, tick);
            }
        }
    }

    fn apply_event(
        &mut self,
        store: &mut Store,
        id: DeploymentId,
        event: ImagingEvent,
        now: DateTime<Utc>,
        tick: &mut DeploymentTick,
    ) {
        let Ok(deployment) = store.deployment_mut(id) else {
            self.jobs.remove(&id);
            return;
        };
        if deployment.status != DeploymentStatus::Deploying {
            return;
        }

        match event {
            ImagingEvent::Progress(p) => {
                let p = p.min(100);
                if p > deployment.progress {
                    deployment.progress = p;
                    debug!(deployment = %id, progress = p, "imaging progress");
                }
            }
            ImagingEvent::Completed => {
                info!(deployment = %id, device = %deployment.device, "deployment completed");
                let next = self.finish(store, id, DeploymentStatus::Completed, None, now, true);
                tick.completed.push(id);
                tick.spawned.extend(next);
            }
            ImagingEvent::Failed(reason) => {
                warn!(deployment = %id, device = %deployment.device, %reason, "deployment failed");
                let message = FleetcastError::Collaborator(reason).to_string();
                let next = self.finish(store, id, DeploymentStatus::Failed, Some(message), now, true);
                tick.failed.push(id);
                tick.spawned.extend(next);
            }
        }
    }

    fn enforce_timeouts(&mut self, store: &mut Store, now: DateTime<Utc>, tick: &mut DeploymentTick) {
        let expired: Vec<DeploymentId> = store
            .deployments()
            .filter(|d| d.status == DeploymentStatus::Deploying)
            .filter(|d| {
                d.started_at
                    .is_some_and(|started| now.signed_duration_since(started) >= self.imaging_timeout)
            })
            .map(|d| d.id)
            .collect();

        for id in expired {
            if let Some(job) = self.jobs.get(&id) {
                if let Err(e) = job.engine.abort(job.handle) {
                    warn!(deployment = %id, error = %e, "abort after timeout was rejected");
                }
            }
            let message = FleetcastError::Timeout(format!(
                "imaging did not finish within {} minutes",
                self.imaging_timeout.num_minutes()
            ))
            .to_string();
            warn!(deployment = %id, %message, "deployment watchdog fired");
            let next = self.finish(store, id, DeploymentStatus::Failed, Some(message), now, true);
            tick.failed.push(id);
            tick.spawned.extend(next);
        }
    }

    /// Record a terminal status, release the device, and spawn the next
    /// occurrence for recurring deployments.
    fn finish(
        &mut self,
        store: &mut Store,
        id: DeploymentId,
        status: DeploymentStatus,
        error: Option<String>,
        now: DateTime<Utc>,
        spawn_next: bool,
    ) -> Option<DeploymentId> {
        self.jobs.remove(&id);

        let Ok(deployment) = store.deployment_mut(id) else {
            return None;
        };
        let held_device = deployment.status == DeploymentStatus::Deploying;
        deployment.status = status;
        deployment.completed_at = Some(now);
        deployment.error_message = error;
        if status == DeploymentStatus::Completed {
            deployment.progress = 100;
        }
        let device = deployment.device.clone();

        if held_device {
            if let Err(e) = self.registry.release(&device) {
                warn!(deployment = %id, %device, error = %e, "failed to release device");
            }
        }

        if !spawn_next {
            return None;
        }

        let deployment = store.deployment(id)?;
        match schedule::successor(deployment, now) {
            Ok(Some(next)) => {
                info!(
                    deployment = %id,
                    next = %next.id,
                    scheduled_for = ?next.scheduled_for,
                    "scheduled next recurring occurrence"
                );
                Some(store.insert_deployment(next))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(deployment = %id, error = %e, "could not compute next recurring occurrence");
                None
            }
        }
    }
}
