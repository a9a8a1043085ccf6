// src/config/plan.rs

//! Turning a validated [`ConfigFile`] into a ready-to-run [`Orchestrator`]:
//! device registry, image catalog, profiles, command-backed collaborators,
//! and the initial deployments and multicast sessions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::backend::{
    CommandImagingEngine, CommandTaskRunner, CommandTransmissionEngine, JobHandle, TaskRunners,
    Transmission, TransmissionEngine, TransmissionRequest,
};
use crate::config::model::{ConfigFile, DeploymentSection, ProfileSection};
use crate::config::validate::parse_timestamp;
use crate::cron::CronSchedule;
use crate::deploy::DeploymentStateMachine;
use crate::engine::{Orchestrator, RuntimeOptions};
use crate::errors::{FleetcastError, Result};
use crate::model::{
    Image, NewDeployment, NewSession, PostDeploymentProfile, PostDeploymentTask, TaskType,
};
use crate::multicast::MulticastOrchestrator;
use crate::store::{DeviceRegistry, InMemoryDeviceRegistry, Store};
use crate::types::{DeploymentId, ScheduleType, SessionId};

/// Everything `run` needs to start the scheduler loop.
#[derive(Debug)]
pub struct Plan {
    pub orchestrator: Orchestrator,
    pub runners: TaskRunners,
    pub deployments: Vec<DeploymentId>,
    pub sessions: Vec<SessionId>,
}

pub fn build_plan(cfg: &ConfigFile, options: RuntimeOptions, now: DateTime<Utc>) -> Result<Plan> {
    let registry: Arc<dyn DeviceRegistry> = Arc::new(InMemoryDeviceRegistry::with_devices(
        cfg.devices().iter().map(|(name, d)| (name.clone(), d.status)),
    ));

    let mut store = Store::new();
    for (name, image) in cfg.images() {
        store.upsert_image(Image::new(name.clone(), image.path.clone(), image.size_bytes))?;
    }
    for (name, section) in cfg.profiles() {
        store.upsert_profile(profile_from_section(name, section))?;
    }

    let scheduler = cfg.scheduler();
    let mut deployments = DeploymentStateMachine::new(Arc::clone(&registry), scheduler.imaging_timeout());
    for (name, section) in cfg.imaging() {
        let engine = CommandImagingEngine::new(section.cmd.clone(), section.progress_pattern.as_deref())?;
        deployments.register_engine(name.clone(), Arc::new(engine));
    }

    let transmission: Arc<dyn TransmissionEngine> = match &cfg.transmission().cmd {
        Some(cmd) => Arc::new(CommandTransmissionEngine::new(
            cmd.clone(),
            cfg.transmission().bytes_pattern.as_deref(),
            cfg.transmission().receiver_done_pattern.as_deref(),
        )?),
        None => Arc::new(NoTransmission),
    };
    let multicast = MulticastOrchestrator::new(
        Arc::clone(&registry),
        transmission,
        scheduler.transmission_timeout(),
    );

    let mut orchestrator = Orchestrator::new(store, registry, deployments, multicast, options);

    let mut deployment_ids = Vec::new();
    for section in cfg.deployments() {
        let new = new_deployment(section, now)?;
        deployment_ids.push(orchestrator.submit_deployment(new, now)?);
    }

    let mut session_ids = Vec::new();
    for section in cfg.multicast() {
        let mut new = NewSession::new(
            section.image.clone(),
            section.address.clone(),
            section.port,
            section.max_clients,
        )
        .auto_start(section.auto_start);
        if let Some(profile) = &section.profile {
            new = new.with_profile(profile.clone());
        }
        let id = orchestrator.create_session(new, now)?;
        for device in &section.participants {
            orchestrator.add_participant(id, device)?;
        }
        session_ids.push(id);
    }

    info!(
        deployments = deployment_ids.len(),
        sessions = session_ids.len(),
        "plan loaded"
    );

    Ok(Plan {
        orchestrator,
        runners: task_runners(cfg),
        deployments: deployment_ids,
        sessions: session_ids,
    })
}

pub fn profile_from_section(name: &str, section: &ProfileSection) -> PostDeploymentProfile {
    PostDeploymentProfile {
        name: name.to_string(),
        execution_order: section.execution_order,
        halt_on_failure: section.halt_on_failure,
        tasks: section
            .task
            .iter()
            .map(|t| PostDeploymentTask {
                name: t.name.clone(),
                config: t.config.clone(),
                timeout_minutes: t.timeout_minutes,
                retry_count: t.retry_count,
                retry_delay_seconds: t.retry_delay_seconds,
            })
            .collect(),
    }
}

/// Build the creation request for a `[[deployment]]` entry.
///
/// Recurring entries without `scheduled_for` start at the first firing after
/// `now`.
pub fn new_deployment(section: &DeploymentSection, now: DateTime<Utc>) -> Result<NewDeployment> {
    let label = format!("[[deployment]] ({})", section.device);
    let scheduled_for = section
        .scheduled_for
        .as_deref()
        .map(|s| parse_timestamp(&label, s))
        .transpose()?;

    let new = match section.schedule {
        ScheduleType::Instant => NewDeployment::instant(section.device.clone(), section.image.clone()),
        ScheduleType::Delayed => {
            let at = scheduled_for.ok_or_else(|| {
                FleetcastError::Validation(format!("{label}: delayed deployments need scheduled_for"))
            })?;
            NewDeployment::delayed(section.device.clone(), section.image.clone(), at)
        }
        ScheduleType::Recurring => {
            let expr = section.cron.clone().ok_or_else(|| {
                FleetcastError::Validation(format!("{label}: recurring deployments need cron"))
            })?;
            let first = match scheduled_for {
                Some(at) => at,
                None => CronSchedule::parse(&expr)?.next_after(now).ok_or_else(|| {
                    FleetcastError::Validation(format!("{label}: cron '{expr}' never fires"))
                })?,
            };
            NewDeployment::recurring(section.device.clone(), section.image.clone(), expr, first)
        }
    };

    let mut new = new
        .with_boot_mode(section.boot_mode)
        .with_imaging_engine(section.imaging_engine.clone());
    if let Some(profile) = &section.profile {
        new = new.with_profile(profile.clone());
    }
    Ok(new)
}

fn task_runners(cfg: &ConfigFile) -> TaskRunners {
    let r = cfg.runners();
    let mut runners = TaskRunners::new();
    for (task_type, template) in [
        (TaskType::Snapin, &r.snapin),
        (TaskType::Script, &r.script),
        (TaskType::DomainJoin, &r.domain_join),
        (TaskType::ProductKey, &r.product_key),
    ] {
        if let Some(template) = template {
            runners.register(task_type, Arc::new(CommandTaskRunner::new(template.clone())));
        }
    }
    runners
}

/// Stand-in when no `[transmission]` command is configured. Validation
/// guarantees no configured session reaches it.
#[derive(Debug)]
struct NoTransmission;

impl TransmissionEngine for NoTransmission {
    fn open(&self, request: TransmissionRequest) -> Result<Transmission> {
        Err(FleetcastError::Collaborator(format!(
            "session {} cannot start: no [transmission].cmd configured",
            request.session
        )))
    }

    fn close(&self, _handle: JobHandle) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::model::RawConfigFile;

    fn config(text: &str) -> ConfigFile {
        let raw: RawConfigFile = toml::from_str(text).unwrap();
        ConfigFile::try_from(raw).unwrap()
    }

    #[test]
    fn recurring_without_start_begins_at_next_firing() {
        let cfg = config(
            r#"
            [imaging.default]
            cmd = "true"
            [device.lab-01]
            [image.win11]
            path = "/srv/win11.img"
            size_bytes = 10
            [[deployment]]
            device = "lab-01"
            image = "win11"
            schedule = "recurring"
            cron = "0 2 * * *"
            "#,
        );
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let new = new_deployment(&cfg.deployments()[0], now).unwrap();
        assert_eq!(new.schedule_type, ScheduleType::Recurring);
        assert_eq!(
            new.scheduled_for,
            Some(Utc.with_ymd_and_hms(2025, 1, 2, 2, 0, 0).unwrap())
        );
    }

    #[test]
    fn plan_registers_devices_and_work() {
        let cfg = config(
            r#"
            [imaging.default]
            cmd = "true"
            [transmission]
            cmd = "true"
            [runners]
            script = "{script}"
            [device.lab-01]
            [device.lab-02]
            [device.lab-03]
            status = "offline"
            [image.win11]
            path = "/srv/win11.img"
            size_bytes = 10
            [profile.base]
            [[profile.base.task]]
            name = "hello"
            type = "script"
            script = "echo hello"
            [[deployment]]
            device = "lab-01"
            image = "win11"
            profile = "base"
            [[multicast]]
            image = "win11"
            address = "239.1.1.1"
            port = 9000
            max_clients = 4
            participants = ["lab-02"]
            auto_start = false
            "#,
        );
        let plan = build_plan(&cfg, RuntimeOptions::default(), Utc::now()).unwrap();
        assert_eq!(plan.deployments.len(), 1);
        assert_eq!(plan.sessions.len(), 1);
        assert_eq!(plan.runners.registered(), vec![TaskType::Script]);
        let store = plan.orchestrator.store();
        assert_eq!(store.session(plan.sessions[0]).unwrap().client_count(), 1);
        assert_eq!(plan.orchestrator.registry().devices().len(), 3);
    }
}
