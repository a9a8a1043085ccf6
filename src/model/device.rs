// src/model/device.rs

use std::fmt;

use serde::Deserialize;

use crate::types::{DeviceName, ImageName};

/// Availability of a target machine as tracked by the device registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Online,
    Idle,
    Offline,
    /// Claimed by exactly one deployment or multicast session.
    Deploying,
}

impl DeviceStatus {
    /// Statuses from which a device may be claimed for imaging.
    pub const CLAIMABLE: [DeviceStatus; 2] = [DeviceStatus::Online, DeviceStatus::Idle];

    pub fn is_available(self) -> bool {
        Self::CLAIMABLE.contains(&self)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Idle => "idle",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Deploying => "deploying",
        };
        f.write_str(s)
    }
}

/// An entry of the image catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub name: ImageName,
    pub path: String,
    pub size_bytes: u64,
}

impl Image {
    pub fn new(name: impl Into<ImageName>, path: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            size_bytes,
        }
    }
}

/// Registry snapshot of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: DeviceName,
    pub status: DeviceStatus,
}
