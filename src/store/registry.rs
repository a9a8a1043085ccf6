// src/store/registry.rs

//! Device registry with compare-and-set claims.
//!
//! A device is the target of at most one deployment or session at a time.
//! This is enforced by atomically flipping its status from `online`/`idle` to
//! `deploying`; whoever wins the flip owns the device until it is released.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::errors::{FleetcastError, Result};
use crate::model::{Device, DeviceStatus};
use crate::types::DeviceName;

/// Read/write access to device status.
pub trait DeviceRegistry: Send + Sync + Debug {
    fn status(&self, device: &str) -> Option<DeviceStatus>;

    /// Unconditionally set a device's status, registering it if unknown.
    fn set_status(&self, device: &str, status: DeviceStatus);

    /// Atomically replace the status with `new` if it is currently one of
    /// `expected`. Returns whether the swap happened.
    fn compare_and_set(
        &self,
        device: &str,
        expected: &[DeviceStatus],
        new: DeviceStatus,
    ) -> Result<bool>;

    fn devices(&self) -> Vec<Device>;

    /// Claim an available device for imaging.
    fn claim(&self, device: &str) -> Result<bool> {
        self.compare_and_set(device, &DeviceStatus::CLAIMABLE, DeviceStatus::Deploying)
    }

    /// Hand a claimed device back. Releasing an unclaimed device is a no-op.
    fn release(&self, device: &str) -> Result<()> {
        self.compare_and_set(device, &[DeviceStatus::Deploying], DeviceStatus::Idle)?;
        Ok(())
    }
}

/// Registry kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryDeviceRegistry {
    devices: Mutex<BTreeMap<DeviceName, DeviceStatus>>,
}

impl InMemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = (S, DeviceStatus)>,
        S: Into<DeviceName>,
    {
        let map = devices.into_iter().map(|(n, s)| (n.into(), s)).collect();
        Self {
            devices: Mutex::new(map),
        }
    }

    // A panic while holding the lock cannot leave a half-written status.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<DeviceName, DeviceStatus>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeviceRegistry for InMemoryDeviceRegistry {
    fn status(&self, device: &str) -> Option<DeviceStatus> {
        self.lock().get(device).copied()
    }

    fn set_status(&self, device: &str, status: DeviceStatus) {
        self.lock().insert(device.to_string(), status);
    }

    fn compare_and_set(
        &self,
        device: &str,
        expected: &[DeviceStatus],
        new: DeviceStatus,
    ) -> Result<bool> {
        let mut devices = self.lock();
        let current = devices
            .get_mut(device)
            .ok_or_else(|| FleetcastError::NotFound(format!("device {device}")))?;

        if expected.contains(current) {
            debug!(device, from = %current, to = %new, "device status swapped");
            *current = new;
            Ok(true)
        } else {
            debug!(device, current = %current, wanted = %new, "device status swap refused");
            Ok(false)
        }
    }

    fn devices(&self) -> Vec<Device> {
        self.lock()
            .iter()
            .map(|(name, status)| Device {
                name: name.clone(),
                status: *status,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn claim_and_release() {
        let reg = InMemoryDeviceRegistry::with_devices([("pc-1", DeviceStatus::Online)]);
        assert!(reg.claim("pc-1").unwrap());
        assert_eq!(reg.status("pc-1"), Some(DeviceStatus::Deploying));
        assert!(!reg.claim("pc-1").unwrap());
        reg.release("pc-1").unwrap();
        assert_eq!(reg.status("pc-1"), Some(DeviceStatus::Idle));
    }

    #[test]
    fn offline_devices_cannot_be_claimed() {
        let reg = InMemoryDeviceRegistry::with_devices([("pc-1", DeviceStatus::Offline)]);
        assert!(!reg.claim("pc-1").unwrap());
        assert_eq!(reg.status("pc-1"), Some(DeviceStatus::Offline));
    }

    #[test]
    fn unknown_device_is_not_found() {
        let reg = InMemoryDeviceRegistry::new();
        assert!(matches!(reg.claim("ghost"), Err(FleetcastError::NotFound(_))));
    }

    #[test]
    fn concurrent_claims_have_exactly_one_winner() {
        let reg = Arc::new(InMemoryDeviceRegistry::with_devices([(
            "pc-1",
            DeviceStatus::Idle,
        )]));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || reg.claim("pc-1").unwrap())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
