// src/multicast/mod.rs

//! Multicast sessions: one image streamed to many devices at once.
//!
//! A session collects participants while `waiting`, claims every participant
//! device when it starts (all or nothing), and then follows the transmission
//! engine's byte counts and per-receiver completions until every participant
//! is terminal.

pub mod throughput;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::backend::{JobHandle, TransmissionEngine, TransmissionEvent, TransmissionRequest};
use crate::errors::{FleetcastError, Result};
use crate::model::{MulticastSession, NewSession, ParticipantStatus, SessionStatus};
use crate::store::{DeviceRegistry, Store};
use crate::types::{DeviceName, SessionId};

pub use throughput::ThroughputMeter;

struct ActiveTransmission {
    handle: JobHandle,
    events: UnboundedReceiver<TransmissionEvent>,
    meter: ThroughputMeter,
    image_size: u64,
}

/// What one call to [`MulticastOrchestrator::advance`] changed.
#[derive(Debug, Default, Clone)]
pub struct MulticastTick {
    pub started: Vec<SessionId>,
    /// Auto-start sessions whose devices could not all be claimed.
    pub deferred: Vec<SessionId>,
    /// Participants that received the whole image during this tick.
    pub completed_participants: Vec<(SessionId, DeviceName)>,
    /// Sessions that reached a terminal status during this tick.
    pub finished: Vec<SessionId>,
}

pub struct MulticastOrchestrator {
    registry: Arc<dyn DeviceRegistry>,
    engine: Arc<dyn TransmissionEngine>,
    active: HashMap<SessionId, ActiveTransmission>,
    transmission_timeout: TimeDelta,
}

impl fmt::Debug for MulticastOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastOrchestrator")
            .field("active", &self.active.len())
            .field("transmission_timeout", &self.transmission_timeout)
            .finish_non_exhaustive()
    }
}

impl MulticastOrchestrator {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        engine: Arc<dyn TransmissionEngine>,
        transmission_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            engine,
            active: HashMap::new(),
            transmission_timeout: TimeDelta::from_std(transmission_timeout)
                .unwrap_or(TimeDelta::MAX),
        }
    }

    /// Number of sessions with an open transmission.
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    pub fn create(&self, store: &mut Store, new: NewSession, now: DateTime<Utc>) -> Result<SessionId> {
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

        let session = MulticastSession::create(new, now)?;
        info!(
            session = %session.id,
            image = %session.image,
            address = %session.multicast_address,
            port = session.port,
            max_clients = session.max_clients,
            "multicast session created"
        );
        Ok(store.insert_session(session))
    }

    /// Add a device to a waiting session. The device must currently be
    /// available; it is only claimed when the session starts.
    pub fn add_participant(&self, store: &mut Store, id: SessionId, device: &str) -> Result<()> {
        let status = self
            .registry
            .status(device)
            .ok_or_else(|| FleetcastError::Validation(format!("unknown device '{device}'")))?;
        if !status.is_available() {
            return Err(FleetcastError::DeviceBusy(format!("{device} is {status}")));
        }

        let session = store.session_mut(id)?;
        session.push_participant(device.to_string())?;
        debug!(session = %id, %device, clients = session.client_count(), "participant added");
        Ok(())
    }

    pub fn remove_participant(&self, store: &mut Store, id: SessionId, device: &str) -> Result<()> {
        let session = store.session_mut(id)?;
        if session.status != SessionStatus::Waiting {
            return Err(FleetcastError::InvalidTransition(format!(
                "session {id} is {}; participants can only be removed while waiting",
                session.status
            )));
        }
        let before = session.participants.len();
        session.participants.retain(|p| p.device != device);
        if session.participants.len() == before {
            return Err(FleetcastError::NotFound(format!(
                "device {device} in session {id}"
            )));
        }
        debug!(session = %id, %device, "participant removed");
        Ok(())
    }

    /// Claim every participant device and open the transmission.
    ///
    /// - no participants: [`FleetcastError::NoParticipants`], session untouched,
    /// - a device cannot be claimed: devices claimed so far are released and
    ///   [`FleetcastError::DeviceBusy`] is returned, session still waiting,
    /// - the engine refuses to open: devices are released and the session is
    ///   `failed`.
    pub fn start(&mut self, store: &mut Store, id: SessionId, now: DateTime<Utc>) -> Result<()> {
        let session = store
            .session(id)
            .ok_or_else(|| FleetcastError::NotFound(format!("multicast session {id}")))?;
        if session.status != SessionStatus::Waiting {
            return Err(FleetcastError::InvalidTransition(format!(
                "session {id} is {}; only waiting sessions can start",
                session.status
            )));
        }
        if session.participants.is_empty() {
            return Err(FleetcastError::NoParticipants(id));
        }
        let image = store.image(&session.image).cloned().ok_or_else(|| {
            FleetcastError::Validation(format!("image '{}' no longer exists", session.image))
        })?;
        let devices: Vec<DeviceName> = session.participants.iter().map(|p| p.device.clone()).collect();

        let mut claimed: Vec<&str> = Vec::with_capacity(devices.len());
        for device in &devices {
            match self.registry.claim(device) {
                Ok(true) => claimed.push(device),
                Ok(false) => {
                    self.release_all(&claimed);
                    return Err(FleetcastError::DeviceBusy(device.clone()));
                }
                Err(e) => {
                    self.release_all(&claimed);
                    return Err(e);
                }
            }
        }

        let request = TransmissionRequest {
            session: id,
            address: session.multicast_address,
            port: session.port,
            image: image.clone(),
            receivers: devices.clone(),
        };

        let transmission = match self.engine.open(request) {
            Ok(t) => t,
            Err(e) => {
                self.release_all(&claimed);
                let message = match e {
                    FleetcastError::Collaborator(_) => e.to_string(),
                    other => FleetcastError::Collaborator(other.to_string()).to_string(),
                };
                warn!(session = %id, error = %message, "transmission could not be opened");
                let session = store.session_mut(id)?;
                session.status = SessionStatus::Failed;
                session.error_message = Some(message.clone());
                session.completed_at = Some(now);
                for p in &mut session.participants {
                    p.status = ParticipantStatus::Failed;
                }
                return Err(FleetcastError::Collaborator(message));
            }
        };

        let session = store.session_mut(id)?;
        session.status = SessionStatus::Active;
        session.started_at = Some(now);
        for p in &mut session.participants {
            p.status = ParticipantStatus::Receiving;
        }
        info!(
            session = %id,
            clients = devices.len(),
            image = %image.name,
            job = %transmission.handle,
            "multicast session started"
        );

        self.active.insert(
            id,
            ActiveTransmission {
                handle: transmission.handle,
                events: transmission.events,
                meter: ThroughputMeter::new(),
                image_size: image.size_bytes,
            },
        );
        Ok(())
    }

    /// Drive every session one step:
    /// 1. start waiting `auto_start` sessions that have participants,
    /// 2. apply events pushed by the transmission engine,
    /// 3. fail sessions whose transmission exceeded the timeout.
    pub fn advance(&mut self, store: &mut Store, now: DateTime<Utc>) -> MulticastTick {
        let mut tick = MulticastTick::default();

        let ready: Vec<SessionId> = store
            .session_ids_with_status(SessionStatus::Waiting)
            .into_iter()
            .filter(|id| {
                store
                    .session(*id)
                    .is_some_and(|s| s.auto_start && !s.participants.is_empty())
            })
            .collect();
        for id in ready {
            match self.start(store, id, now) {
                Ok(()) => tick.started.push(id),
                Err(e) if e.is_capacity() => {
                    debug!(session = %id, error = %e, "session start deferred to next tick");
                    tick.deferred.push(id);
                }
                Err(e) => {
                    warn!(session = %id, error = %e, "session could not be started");
                    if let Ok(session) = store.session_mut(id) {
                        if session.status == SessionStatus::Waiting {
                            session.status = SessionStatus::Failed;
                            session.error_message = Some(e.to_string());
                            session.completed_at = Some(now);
                        }
                    }
                    tick.finished.push(id);
                }
            }
        }

        self.drain_events(store, now, &mut tick);
        self.enforce_timeouts(store, now, &mut tick);
        tick
    }

    /// Cancel a waiting or active session.
    ///
    /// The transmission is closed (best effort) and forgotten, so samples that
    /// arrive afterwards never change `bytes_sent`. Participants still
    /// receiving are marked cancelled and their devices released.
    pub fn cancel(&mut self, store: &mut Store, id: SessionId, now: DateTime<Utc>) -> Result<()> {
        let status = store
            .session(id)
            .map(|s| s.status)
            .ok_or_else(|| FleetcastError::NotFound(format!("multicast session {id}")))?;
        if status.is_terminal() {
            return Err(FleetcastError::InvalidTransition(format!(
                "session {id} is already {status}"
            )));
        }

        if let Some(active) = self.active.remove(&id) {
            if let Err(e) = self.engine.close(active.handle) {
                warn!(session = %id, error = %e, "transmission engine did not accept close");
            }
        }

        let session = store.session_mut(id)?;
        // Devices are only claimed once the session is active.
        let released = if status == SessionStatus::Active {
            session.receiving_devices()
        } else {
            Vec::new()
        };
        for p in &mut session.participants {
            if !p.status.is_terminal() {
                p.status = ParticipantStatus::Cancelled;
            }
        }
        session.status = SessionStatus::Cancelled;
        session.completed_at = Some(now);
        info!(session = %id, from = %status, "multicast session cancelled");

        for device in &released {
            self.release(device);
        }
        Ok(())
    }

    /// Cancel every session with an open transmission.
    pub fn cancel_active(&mut self, store: &mut Store, now: DateTime<Utc>) -> Vec<SessionId> {
        let ids: Vec<SessionId> = self.active.keys().copied().collect();
        let mut cancelled = Vec::with_capacity(ids.len());
        for id in ids {
            match self.cancel(store, id, now) {
                Ok(()) => cancelled.push(id),
                Err(e) => {
                    warn!(session = %id, error = %e, "could not cancel active session");
                    self.active.remove(&id);
                }
            }
        }
        cancelled
    }

    fn drain_events(&mut self, store: &mut Store, now: DateTime<Utc>, tick: &mut MulticastTick) {
        let mut drained: Vec<(SessionId, Vec<TransmissionEvent>)> = Vec::new();
        for (id, active) in self.active.iter_mut() {
            let mut events = Vec::new();
            loop {
                match active.events.try_recv() {
                    Ok(event) => events.push(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        events.push(TransmissionEvent::Failed(
                            "transmission engine closed its event channel".to_string(),
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
                if !self.active.contains_key(&id) {
                    break;
                }
                self.apply_event(store, id, event, now, tick);
            }
        }
    }

    fn apply_event(
        &mut self,
        store: &mut Store,
        id: SessionId,
        event: TransmissionEvent,
        now: DateTime<Utc>,
        tick: &mut MulticastTick,
    ) {
        let Ok(session) = store.session_mut(id) else {
            self.active.remove(&id);
            return;
        };
        if session.status != SessionStatus::Active {
            return;
        }
        let Some(active) = self.active.get_mut(&id) else {
            return;
        };

        match event {
            TransmissionEvent::BytesSent { total, at } => {
                session.bytes_sent = total;
                if let Some(rate) = active.meter.record(total, at) {
                    session.throughput = rate;
                }
                let percent = percent_of(total, active.image_size);
                for p in &mut session.participants {
                    if p.status == ParticipantStatus::Receiving && percent > p.progress {
                        p.progress = percent;
                    }
                }
                debug!(session = %id, bytes = total, throughput = session.throughput, "transmission sample");
            }
            TransmissionEvent::ParticipantCompleted(device) => {
                match session.participant_mut(&device) {
                    Some(p) if p.status == ParticipantStatus::Receiving => {
                        p.status = ParticipantStatus::Completed;
                        p.progress = 100;
                        p.completed_at = Some(now);
                        info!(session = %id, %device, "participant completed");
                        self.release(&device);
                        tick.completed_participants.push((id, device));
                    }
                    Some(p) => {
                        debug!(session = %id, %device, status = ?p.status, "ignoring completion for finished participant");
                    }
                    None => {
                        warn!(session = %id, %device, "completion reported for unknown participant");
                    }
                }
                if session.all_participants_terminal() {
                    self.finish(store, id, None, now, true, tick);
                }
            }
            TransmissionEvent::Finished => {
                let mut completed = Vec::new();
                for p in &mut session.participants {
                    if p.status == ParticipantStatus::Receiving {
                        p.status = ParticipantStatus::Completed;
                        p.progress = 100;
                        p.completed_at = Some(now);
                        completed.push(p.device.clone());
                    }
                }
                for device in completed {
                    info!(session = %id, %device, "participant completed");
                    self.release(&device);
                    tick.completed_participants.push((id, device));
                }
                self.finish(store, id, None, now, false, tick);
            }
            TransmissionEvent::Failed(reason) => {
                warn!(session = %id, %reason, "transmission failed");
                let message = FleetcastError::Collaborator(reason).to_string();
                self.fail_receiving(store, id, now);
                self.finish(store, id, Some(message), now, false, tick);
            }
        }
    }

    fn enforce_timeouts(&mut self, store: &mut Store, now: DateTime<Utc>, tick: &mut MulticastTick) {
        let expired: Vec<SessionId> = store
            .sessions()
            .filter(|s| s.status == SessionStatus::Active)
            .filter(|s| {
                s.started_at.is_some_and(|started| {
                    now.signed_duration_since(started) >= self.transmission_timeout
                })
            })
            .map(|s| s.id)
            .collect();

        for id in expired {
            let message = FleetcastError::Timeout(format!(
                "transmission did not finish within {} minutes",
                self.transmission_timeout.num_minutes()
            ))
            .to_string();
            warn!(session = %id, %message, "transmission watchdog fired");
            self.fail_receiving(store, id, now);
            self.finish(store, id, Some(message), now, true, tick);
        }
    }

    fn fail_receiving(&self, store: &mut Store, id: SessionId, now: DateTime<Utc>) {
        let Ok(session) = store.session_mut(id) else {
            return;
        };
        let mut failed = Vec::new();
        for p in &mut session.participants {
            if p.status == ParticipantStatus::Receiving {
                p.status = ParticipantStatus::Failed;
                p.completed_at = Some(now);
                failed.push(p.device.clone());
            }
        }
        for device in &failed {
            self.release(device);
        }
    }

    /// Move an active session to its terminal status once no participant is
    /// still receiving. `error` forces `failed`; otherwise the session is
    /// `completed` if at least one participant completed.
    fn finish(
        &mut self,
        store: &mut Store,
        id: SessionId,
        error: Option<String>,
        now: DateTime<Utc>,
        close: bool,
        tick: &mut MulticastTick,
    ) {
        if let Some(active) = self.active.remove(&id) {
            if close {
                if let Err(e) = self.engine.close(active.handle) {
                    warn!(session = %id, error = %e, "transmission engine did not accept close");
                }
            }
        }

        let Ok(session) = store.session_mut(id) else {
            return;
        };
        let any_completed = session
            .participants
            .iter()
            .any(|p| p.status == ParticipantStatus::Completed);

        match error {
            Some(message) => {
                session.status = SessionStatus::Failed;
                session.error_message = Some(message);
            }
            None if any_completed => session.status = SessionStatus::Completed,
            None => {
                session.status = SessionStatus::Failed;
                session.error_message = Some("no participant received the image".to_string());
            }
        }
        session.completed_at = Some(now);
        info!(
            session = %id,
            status = %session.status,
            bytes = session.bytes_sent,
            "multicast session finished"
        );
        tick.finished.push(id);
    }

    fn release(&self, device: &str) {
        if let Err(e) = self.registry.release(device) {
            warn!(%device, error = %e, "failed to release device");
        }
    }

    fn release_all(&self, devices: &[&str]) {
        for device in devices {
            self.release(device);
        }
    }
}

fn percent_of(bytes: u64, size: u64) -> u8 {
    if size == 0 {
        return 0;
    }
    let percent = (u128::from(bytes) * 100) / u128::from(size);
    percent.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_a_clamped_percentage() {
        assert_eq!(percent_of(0, 1_000), 0);
        assert_eq!(percent_of(500, 1_000), 50);
        assert_eq!(percent_of(999, 1_000), 99);
        assert_eq!(percent_of(5_000, 1_000), 100);
        assert_eq!(percent_of(u64::MAX, u64::MAX), 100);
    }
}
