// src/store/mod.rs

//! In-memory record store.
//!
//! Holds the image catalog, profiles and the root aggregates (deployments and
//! multicast sessions) together with the records they own (bindings and task
//! runs). Removing an aggregate removes everything it owns.

pub mod registry;

use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::{FleetcastError, Result};
use crate::model::{
    BindingTarget, ChainOutcome, Deployment, DeploymentStatus, Image, MulticastSession,
    PostDeploymentProfile, ProfileBinding, SessionStatus, TaskRun,
};
use crate::types::{BindingId, DeploymentId, SessionId};

pub use registry::{DeviceRegistry, InMemoryDeviceRegistry};

#[derive(Debug, Default)]
pub struct Store {
    images: BTreeMap<String, Image>,
    profiles: BTreeMap<String, PostDeploymentProfile>,
    deployments: BTreeMap<DeploymentId, Deployment>,
    sessions: BTreeMap<SessionId, MulticastSession>,
    bindings: BTreeMap<BindingId, ProfileBinding>,
    task_runs: Vec<TaskRun>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- images -------------------------------------------------------

    pub fn upsert_image(&mut self, image: Image) -> Result<()> {
        if image.size_bytes == 0 {
            return Err(FleetcastError::Validation(format!(
                "image '{}' must have a non-zero size",
                image.name
            )));
        }
        self.images.insert(image.name.clone(), image);
        Ok(())
    }

    pub fn image(&self, name: &str) -> Option<&Image> {
        self.images.get(name)
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }

    // ---- profiles -----------------------------------------------------

    pub fn upsert_profile(&mut self, profile: PostDeploymentProfile) -> Result<()> {
        profile.validate()?;
        self.profiles.insert(profile.name.clone(), profile);
        Ok(())
    }

    pub fn profile(&self, name: &str) -> Option<&PostDeploymentProfile> {
        self.profiles.get(name)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &PostDeploymentProfile> {
        self.profiles.values()
    }

    // ---- deployments --------------------------------------------------

    pub fn insert_deployment(&mut self, deployment: Deployment) -> DeploymentId {
        let id = deployment.id;
        self.deployments.insert(id, deployment);
        id
    }

    pub fn deployment(&self, id: DeploymentId) -> Option<&Deployment> {
        self.deployments.get(&id)
    }

    pub fn deployment_mut(&mut self, id: DeploymentId) -> Result<&mut Deployment> {
        self.deployments
            .get_mut(&id)
            .ok_or_else(|| FleetcastError::NotFound(format!("deployment {id}")))
    }

    pub fn deployments(&self) -> impl Iterator<Item = &Deployment> {
        self.deployments.values()
    }

    /// Deployment ids with the given status, oldest first.
    pub fn deployment_ids_with_status(&self, status: DeploymentStatus) -> Vec<DeploymentId> {
        let mut matching: Vec<&Deployment> = self
            .deployments
            .values()
            .filter(|d| d.status == status)
            .collect();
        matching.sort_by_key(|d| (d.scheduled_for.unwrap_or(d.created_at), d.created_at));
        matching.into_iter().map(|d| d.id).collect()
    }

    /// Delete a deployment and the bindings / task runs it owns.
    ///
    /// An in-flight deployment must be cancelled first.
    pub fn remove_deployment(&mut self, id: DeploymentId) -> Result<Deployment> {
        let status = self
            .deployment(id)
            .map(|d| d.status)
            .ok_or_else(|| FleetcastError::NotFound(format!("deployment {id}")))?;
        if status == DeploymentStatus::Deploying {
            return Err(FleetcastError::InvalidTransition(format!(
                "deployment {id} is deploying; cancel it before removing"
            )));
        }
        self.remove_bindings_where(|t| matches!(t, BindingTarget::Deployment(d) if *d == id));
        self.deployments
            .remove(&id)
            .ok_or_else(|| FleetcastError::NotFound(format!("deployment {id}")))
    }

    // ---- multicast sessions -------------------------------------------

    pub fn insert_session(&mut self, session: MulticastSession) -> SessionId {
        let id = session.id;
        self.sessions.insert(id, session);
        id
    }

    pub fn session(&self, id: SessionId) -> Option<&MulticastSession> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Result<&mut MulticastSession> {
        self.sessions
            .get_mut(&id)
            .ok_or_else(|| FleetcastError::NotFound(format!("multicast session {id}")))
    }

    pub fn sessions(&self) -> impl Iterator<Item = &MulticastSession> {
        self.sessions.values()
    }

    pub fn session_ids_with_status(&self, status: SessionStatus) -> Vec<SessionId> {
        let mut matching: Vec<&MulticastSession> = self
            .sessions
            .values()
            .filter(|s| s.status == status)
            .collect();
        matching.sort_by_key(|s| s.created_at);
        matching.into_iter().map(|s| s.id).collect()
    }

    /// Delete a session, its participants and their bindings / task runs.
    pub fn remove_session(&mut self, id: SessionId) -> Result<MulticastSession> {
        let status = self
            .session(id)
            .map(|s| s.status)
            .ok_or_else(|| FleetcastError::NotFound(format!("multicast session {id}")))?;
        if status == SessionStatus::Active {
            return Err(FleetcastError::InvalidTransition(format!(
                "multicast session {id} is active; cancel it before removing"
            )));
        }
        self.remove_bindings_where(
            |t| matches!(t, BindingTarget::Participant { session, .. } if *session == id),
        );
        self.sessions
            .remove(&id)
            .ok_or_else(|| FleetcastError::NotFound(format!("multicast session {id}")))
    }

    // ---- bindings and task runs ---------------------------------------

    pub fn insert_binding(&mut self, binding: ProfileBinding) -> BindingId {
        let id = binding.id;
        self.bindings.insert(id, binding);
        id
    }

    pub fn binding(&self, id: BindingId) -> Option<&ProfileBinding> {
        self.bindings.get(&id)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &ProfileBinding> {
        self.bindings.values()
    }

    pub fn bindings_for(&self, target: &BindingTarget) -> Vec<&ProfileBinding> {
        self.bindings
            .values()
            .filter(|b| &b.target == target)
            .collect()
    }

    /// Store the result of a finished chain. Runs are appended, never replaced.
    pub fn record_chain_result(
        &mut self,
        binding: BindingId,
        outcome: ChainOutcome,
        runs: Vec<TaskRun>,
    ) -> Result<()> {
        let entry = self
            .bindings
            .get_mut(&binding)
            .ok_or_else(|| FleetcastError::NotFound(format!("binding {binding}")))?;
        entry.outcome = Some(outcome);
        self.task_runs.extend(runs);
        Ok(())
    }

    /// All task runs of a binding, in task order then attempt order.
    pub fn task_runs_for(&self, binding: BindingId) -> Vec<&TaskRun> {
        let mut runs: Vec<&TaskRun> = self
            .task_runs
            .iter()
            .filter(|r| r.binding == binding)
            .collect();
        runs.sort_by_key(|r| (r.task_index, r.attempt));
        runs
    }

    fn remove_bindings_where<F>(&mut self, pred: F)
    where
        F: Fn(&BindingTarget) -> bool,
    {
        let doomed: Vec<BindingId> = self
            .bindings
            .values()
            .filter(|b| pred(&b.target))
            .map(|b| b.id)
            .collect();
        for id in &doomed {
            self.bindings.remove(id);
        }
        self.task_runs.retain(|r| !doomed.contains(&r.binding));
        if !doomed.is_empty() {
            debug!(removed = doomed.len(), "removed owned bindings and task runs");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::{NewDeployment, TaskRunStatus};
    use crate::types::ExecutionOrder;

    fn profile() -> PostDeploymentProfile {
        PostDeploymentProfile {
            name: "base".into(),
            execution_order: ExecutionOrder::Sequential,
            halt_on_failure: false,
            tasks: Vec::new(),
        }
    }

    #[test]
    fn removing_a_deployment_cascades_to_its_bindings_and_runs() {
        let now = Utc::now();
        let mut store = Store::new();
        let d = Deployment::create(NewDeployment::instant("pc-1", "win11"), now).unwrap();
        let id = store.insert_deployment(d);

        let binding = ProfileBinding::new(
            profile(),
            BindingTarget::Deployment(id),
            "pc-1".into(),
            "win11".into(),
            now,
        );
        let bid = store.insert_binding(binding);
        let mut run = TaskRun::pending(bid, 0, "A", 1);
        run.succeed(String::new(), now);
        store
            .record_chain_result(bid, ChainOutcome::Completed, vec![run])
            .unwrap();
        assert_eq!(store.task_runs_for(bid).len(), 1);
        assert_eq!(store.task_runs_for(bid)[0].status, TaskRunStatus::Succeeded);

        store.remove_deployment(id).unwrap();
        assert!(store.binding(bid).is_none());
        assert!(store.task_runs_for(bid).is_empty());
    }

    #[test]
    fn deploying_deployments_cannot_be_removed() {
        let now = Utc::now();
        let mut store = Store::new();
        let mut d = Deployment::create(NewDeployment::instant("pc-1", "win11"), now).unwrap();
        d.status = DeploymentStatus::Deploying;
        let id = store.insert_deployment(d);
        assert!(matches!(
            store.remove_deployment(id),
            Err(FleetcastError::InvalidTransition(_))
        ));
    }

    #[test]
    fn zero_sized_images_are_rejected() {
        let mut store = Store::new();
        assert!(store.upsert_image(Image::new("empty", "/srv/empty", 0)).is_err());
        assert!(store.upsert_image(Image::new("win11", "/srv/win11", 10)).is_ok());
    }
}
