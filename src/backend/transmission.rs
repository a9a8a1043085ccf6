// src/backend/transmission.rs

use chrono::Utc;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::errors::{FleetcastError, Result};

use super::command::{render_template, spawn_watched, JobRegistry};
use super::{JobHandle, Transmission, TransmissionEngine, TransmissionEvent, TransmissionRequest};

/// Multicast sender that runs a configured command line per session
/// (e.g. a `udp-sender` wrapper).
///
/// Placeholders: `{session}`, `{address}`, `{port}`, `{image}`,
/// `{image_path}`, `{receivers}` (comma separated), `{receiver_count}`.
///
/// - lines matching `bytes_pattern` (capture 1 = cumulative bytes) become
///   byte-count samples,
/// - lines matching `receiver_done_pattern` (capture 1 = device name) mark
///   one receiver complete,
/// - exit status 0 finishes the transmission, anything else fails it.
#[derive(Debug)]
pub struct CommandTransmissionEngine {
    template: String,
    bytes: Option<Regex>,
    receiver_done: Option<Regex>,
    jobs: JobRegistry,
}

impl CommandTransmissionEngine {
    pub fn new(
        template: impl Into<String>,
        bytes_pattern: Option<&str>,
        receiver_done_pattern: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            template: template.into(),
            bytes: compile("bytes", bytes_pattern)?,
            receiver_done: compile("receiver_done", receiver_done_pattern)?,
            jobs: JobRegistry::new(),
        })
    }
}

fn compile(what: &str, pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| {
            Regex::new(p).map_err(|e| {
                FleetcastError::ConfigError(format!("invalid transmission {what} pattern '{p}': {e}"))
            })
        })
        .transpose()
}

impl TransmissionEngine for CommandTransmissionEngine {
    fn open(&self, request: TransmissionRequest) -> Result<Transmission> {
        let cmdline = render_template(
            &self.template,
            &[
                ("session", request.session.to_string()),
                ("address", request.address.to_string()),
                ("port", request.port.to_string()),
                ("image", request.image.name.clone()),
                ("image_path", request.image.path.clone()),
                ("receivers", request.receivers.join(",")),
                ("receiver_count", request.receivers.len().to_string()),
            ],
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, token) = self.jobs.register();
        let bytes = self.bytes.clone();
        let receiver_done = self.receiver_done.clone();
        let label = format!("multicast {}:{}", request.address, request.port);

        let spawned = spawn_watched(
            label,
            cmdline,
            handle,
            token,
            self.jobs.clone(),
            tx,
            move |line| parse_line(bytes.as_ref(), receiver_done.as_ref(), line),
            |status| match status {
                Ok(s) if s.success() => TransmissionEvent::Finished,
                Ok(s) => TransmissionEvent::Failed(format!("transmission command exited with {s}")),
                Err(e) => TransmissionEvent::Failed(format!("transmission command failed: {e}")),
            },
        );

        if let Err(e) = spawned {
            self.jobs.finish(handle);
            return Err(FleetcastError::Collaborator(e.to_string()));
        }

        Ok(Transmission { handle, events: rx })
    }

    fn close(&self, handle: JobHandle) -> Result<()> {
        if !self.jobs.cancel(handle) {
            warn!(%handle, "close requested for a transmission that is no longer running");
        }
        Ok(())
    }
}

fn parse_line(
    bytes: Option<&Regex>,
    receiver_done: Option<&Regex>,
    line: &str,
) -> Vec<TransmissionEvent> {
    let mut events = Vec::new();

    if let Some(total) = bytes
        .and_then(|re| re.captures(line))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
    {
        events.push(TransmissionEvent::BytesSent {
            total,
            at: Utc::now(),
        });
    }

    if let Some(device) = receiver_done
        .and_then(|re| re.captures(line))
        .and_then(|c| c.get(1))
    {
        events.push(TransmissionEvent::ParticipantCompleted(
            device.as_str().to_string(),
        ));
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_byte_counts_and_receivers() {
        let bytes = Regex::new(r"bytes=(\d+)").unwrap();
        let done = Regex::new(r"receiver (\S+) done").unwrap();

        let events = parse_line(Some(&bytes), Some(&done), "bytes=1024");
        assert!(matches!(events.as_slice(), [TransmissionEvent::BytesSent { total: 1024, .. }]));

        let events = parse_line(Some(&bytes), Some(&done), "receiver pc-7 done");
        assert_eq!(
            events,
            vec![TransmissionEvent::ParticipantCompleted("pc-7".to_string())]
        );

        assert!(parse_line(Some(&bytes), Some(&done), "waiting for receivers").is_empty());
    }
}
