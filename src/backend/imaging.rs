// src/backend/imaging.rs

use regex::Regex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::errors::{FleetcastError, Result};

use super::command::{render_template, spawn_watched, JobRegistry};
use super::{ImagingEngine, ImagingEvent, ImagingJob, ImagingRequest, JobHandle};

/// Imaging engine that runs a configured command line per deployment.
///
/// Placeholders: `{deployment}`, `{device}`, `{image}`, `{image_path}`,
/// `{boot_mode}`. Stdout lines matching `progress_pattern` (first capture
/// group = percent) become progress events; exit status 0 means success.
#[derive(Debug)]
pub struct CommandImagingEngine {
    template: String,
    progress: Option<Regex>,
    jobs: JobRegistry,
}

impl CommandImagingEngine {
    pub fn new(template: impl Into<String>, progress_pattern: Option<&str>) -> Result<Self> {
        let progress = progress_pattern
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    FleetcastError::ConfigError(format!("invalid imaging progress pattern '{p}': {e}"))
                })
            })
            .transpose()?;
        Ok(Self {
            template: template.into(),
            progress,
            jobs: JobRegistry::new(),
        })
    }
}

impl ImagingEngine for CommandImagingEngine {
    fn start(&self, request: ImagingRequest) -> Result<ImagingJob> {
        let cmdline = render_template(
            &self.template,
            &[
                ("deployment", request.deployment.to_string()),
                ("device", request.device.clone()),
                ("image", request.image.name.clone()),
                ("image_path", request.image.path.clone()),
                ("boot_mode", request.boot_mode.to_string()),
            ],
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, token) = self.jobs.register();
        let progress = self.progress.clone();
        let label = format!("imaging {}", request.device);

        let spawned = spawn_watched(
            label,
            cmdline,
            handle,
            token,
            self.jobs.clone(),
            tx,
            move |line| parse_progress(progress.as_ref(), line).into_iter().collect(),
            |status| match status {
                Ok(s) if s.success() => ImagingEvent::Completed,
                Ok(s) => ImagingEvent::Failed(format!("imaging command exited with {s}")),
                Err(e) => ImagingEvent::Failed(format!("imaging command failed: {e}")),
            },
        );

        if let Err(e) = spawned {
            self.jobs.finish(handle);
            return Err(FleetcastError::Collaborator(e.to_string()));
        }

        Ok(ImagingJob { handle, events: rx })
    }

    fn abort(&self, handle: JobHandle) -> Result<()> {
        if !self.jobs.cancel(handle) {
            warn!(%handle, "abort requested for an imaging job that is no longer running");
        }
        Ok(())
    }
}

fn parse_progress(pattern: Option<&Regex>, line: &str) -> Option<ImagingEvent> {
    let caps = pattern?.captures(line)?;
    let value: u32 = caps.get(1)?.as_str().parse().ok()?;
    Some(ImagingEvent::Progress(value.min(100) as u8))
}
