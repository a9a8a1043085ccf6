// src/model/multicast.rs

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{FleetcastError, Result};
use crate::types::{DeviceName, ImageName, ProfileName, SessionId};

pub const MIN_PORT: u16 = 1024;
pub const MAX_CLIENTS_LIMIT: u16 = 50;

/// Lifecycle of a multicast session.
///
/// ```text
/// waiting -> active -> completed | failed | cancelled
/// waiting -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-receiver status inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantStatus {
    Waiting,
    Receiving,
    Completed,
    Failed,
    Cancelled,
}

impl ParticipantStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ParticipantStatus::Completed | ParticipantStatus::Failed | ParticipantStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct MulticastParticipant {
    pub device: DeviceName,
    pub status: ParticipantStatus,
    pub progress: u8,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MulticastParticipant {
    fn new(device: DeviceName) -> Self {
        Self {
            device,
            status: ParticipantStatus::Waiting,
            progress: 0,
            completed_at: None,
        }
    }
}

/// Request to open a multicast session, before validation.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub image: ImageName,
    pub multicast_address: String,
    pub port: u32,
    pub max_clients: u32,
    pub profile: Option<ProfileName>,
    /// Start automatically once participants are present and their devices can
    /// be claimed.
    pub auto_start: bool,
}

impl NewSession {
    pub fn new(
        image: impl Into<ImageName>,
        multicast_address: impl Into<String>,
        port: u32,
        max_clients: u32,
    ) -> Self {
        Self {
            image: image.into(),
            multicast_address: multicast_address.into(),
            port,
            max_clients,
            profile: None,
            auto_start: false,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<ProfileName>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }
}

/// One image fanned out to up to `max_clients` devices.
#[derive(Debug, Clone)]
pub struct MulticastSession {
    pub id: SessionId,
    pub image: ImageName,
    pub multicast_address: Ipv4Addr,
    pub port: u16,
    pub max_clients: u16,
    pub participants: Vec<MulticastParticipant>,
    pub status: SessionStatus,
    pub bytes_sent: u64,
    /// Bytes per second over the latest sample window.
    pub throughput: f64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub profile: Option<ProfileName>,
    pub auto_start: bool,
    pub created_at: DateTime<Utc>,
}

impl MulticastSession {
    /// Validate address, port and client limit and build a `waiting` session.
    pub fn create(new: NewSession, now: DateTime<Utc>) -> Result<Self> {
        let address: Ipv4Addr = new.multicast_address.trim().parse().map_err(|_| {
            FleetcastError::Validation(format!(
                "'{}' is not an IPv4 address",
                new.multicast_address
            ))
        })?;
        if !address.is_multicast() {
            return Err(FleetcastError::Validation(format!(
                "{address} is outside the multicast range 224.0.0.0/4"
            )));
        }

        if new.port < u32::from(MIN_PORT) || new.port > u32::from(u16::MAX) {
            return Err(FleetcastError::Validation(format!(
                "port {} must be within {MIN_PORT}-{}",
                new.port,
                u16::MAX
            )));
        }

        if new.max_clients == 0 || new.max_clients > u32::from(MAX_CLIENTS_LIMIT) {
            return Err(FleetcastError::Validation(format!(
                "max_clients {} must be within 1-{MAX_CLIENTS_LIMIT}",
                new.max_clients
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            image: new.image,
            multicast_address: address,
            port: new.port as u16,
            max_clients: new.max_clients as u16,
            participants: Vec::new(),
            status: SessionStatus::Waiting,
            bytes_sent: 0,
            throughput: 0.0,
            error_message: None,
            started_at: None,
            completed_at: None,
            profile: new.profile,
            auto_start: new.auto_start,
            created_at: now,
        })
    }

    pub fn client_count(&self) -> usize {
        self.participants.len()
    }

    pub fn participant(&self, device: &str) -> Option<&MulticastParticipant> {
        self.participants.iter().find(|p| p.device == device)
    }

    pub fn participant_mut(&mut self, device: &str) -> Option<&mut MulticastParticipant> {
        self.participants.iter_mut().find(|p| p.device == device)
    }

    /// Add a receiver. Only the session-local invariants are checked here
    /// (status, capacity, duplicates); device availability is the caller's job.
    pub fn push_participant(&mut self, device: DeviceName) -> Result<()> {
        if self.status != SessionStatus::Waiting {
            return Err(FleetcastError::InvalidTransition(format!(
                "session {} is {}; participants can only be added while waiting",
                self.id, self.status
            )));
        }
        if self.client_count() >= usize::from(self.max_clients) {
            return Err(FleetcastError::CapacityExceeded {
                session: self.id,
                max_clients: self.max_clients,
            });
        }
        if self.participant(&device).is_some() {
            return Err(FleetcastError::Validation(format!(
                "device {device} already participates in session {}",
                self.id
            )));
        }
        self.participants.push(MulticastParticipant::new(device));
        Ok(())
    }

    /// Devices of participants that have not reached a terminal status.
    pub fn receiving_devices(&self) -> Vec<DeviceName> {
        self.participants
            .iter()
            .filter(|p| !p.status.is_terminal())
            .map(|p| p.device.clone())
            .collect()
    }

    pub fn all_participants_terminal(&self) -> bool {
        self.participants.iter().all(|p| p.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(max_clients: u32) -> MulticastSession {
        MulticastSession::create(NewSession::new("win11", "239.1.1.1", 9000, max_clients), Utc::now())
            .unwrap()
    }

    #[test]
    fn rejects_bad_parameters() {
        let now = Utc::now();
        for new in [
            NewSession::new("win11", "10.0.0.1", 9000, 5),
            NewSession::new("win11", "not-an-ip", 9000, 5),
            NewSession::new("win11", "239.1.1.1", 1023, 5),
            NewSession::new("win11", "239.1.1.1", 65536, 5),
            NewSession::new("win11", "239.1.1.1", 9000, 0),
            NewSession::new("win11", "239.1.1.1", 9000, 51),
        ] {
            let err = MulticastSession::create(new, now).unwrap_err();
            assert!(err.is_validation(), "expected validation error, got {err:?}");
        }
    }

    #[test]
    fn capacity_is_enforced() {
        let mut s = session(1);
        s.push_participant("pc-1".into()).unwrap();
        let err = s.push_participant("pc-2".into()).unwrap_err();
        assert!(matches!(err, FleetcastError::CapacityExceeded { max_clients: 1, .. }));
        assert_eq!(s.client_count(), 1);
    }

    #[test]
    fn duplicate_devices_are_rejected() {
        let mut s = session(5);
        s.push_participant("pc-1".into()).unwrap();
        assert!(s.push_participant("pc-1".into()).is_err());
        assert_eq!(s.client_count(), 1);
    }

    #[test]
    fn receiving_devices_skip_terminal_participants() {
        let mut s = session(5);
        for device in ["pc-1", "pc-2", "pc-3"] {
            s.push_participant(device.into()).unwrap();
        }
        s.participants[0].status = ParticipantStatus::Completed;
        s.participants[1].status = ParticipantStatus::Receiving;
        assert_eq!(s.receiving_devices(), vec!["pc-2".to_string(), "pc-3".to_string()]);
    }
}
