#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleetcast::deploy::DeploymentStateMachine;
use fleetcast::engine::{Orchestrator, RuntimeOptions};
use fleetcast::model::{DeviceStatus, Image, DEFAULT_IMAGING_ENGINE};
use fleetcast::multicast::MulticastOrchestrator;
use fleetcast::store::{InMemoryDeviceRegistry, Store};

use crate::fakes::{FakeImagingEngine, FakeTransmissionEngine};

/// Size of the `win11` image every world starts with.
pub const IMAGE_SIZE: u64 = 1_000;

/// A store, a registry and fake engines wired together.
pub struct World {
    pub store: Store,
    pub registry: Arc<InMemoryDeviceRegistry>,
    pub imaging: FakeImagingEngine,
    pub transmission: FakeTransmissionEngine,
}

impl World {
    /// Every device starts `online`; the catalog holds one `win11` image.
    pub fn new(devices: &[&str]) -> Self {
        let registry = InMemoryDeviceRegistry::with_devices(
            devices.iter().map(|d| (d.to_string(), DeviceStatus::Online)),
        );
        let mut store = Store::new();
        store
            .upsert_image(Image::new("win11", "/images/win11.wim", IMAGE_SIZE))
            .expect("valid image");

        Self {
            store,
            registry: Arc::new(registry),
            imaging: FakeImagingEngine::new(),
            transmission: FakeTransmissionEngine::new(),
        }
    }

    pub fn deployments(&self, imaging_timeout: Duration) -> DeploymentStateMachine {
        let mut machine = DeploymentStateMachine::new(self.registry.clone(), imaging_timeout);
        machine.register_engine(DEFAULT_IMAGING_ENGINE, Arc::new(self.imaging.clone()));
        machine
    }

    pub fn multicast(&self, transmission_timeout: Duration) -> MulticastOrchestrator {
        MulticastOrchestrator::new(
            self.registry.clone(),
            Arc::new(self.transmission.clone()),
            transmission_timeout,
        )
    }

    /// Move the store into an orchestrator with one-hour watchdogs.
    pub fn orchestrator(&mut self, options: RuntimeOptions) -> Orchestrator {
        let hour = Duration::from_secs(3600);
        let deployments = self.deployments(hour);
        let multicast = self.multicast(hour);
        Orchestrator::new(
            std::mem::take(&mut self.store),
            self.registry.clone(),
            deployments,
            multicast,
            options,
        )
    }
}
