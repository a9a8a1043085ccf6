// src/config/validate.rs

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::model::{ConfigFile, DeploymentSection, MulticastSection, RawConfigFile};
use crate::cron;
use crate::errors::{FleetcastError, Result};
use crate::model::{TaskType, MAX_RETRY_COUNT};
use crate::types::ScheduleType;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = FleetcastError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_scheduler(cfg)?;
    validate_engines(cfg)?;
    validate_images(cfg)?;
    validate_profiles(cfg)?;
    for (i, d) in cfg.deployment.iter().enumerate() {
        validate_deployment(cfg, i, d)?;
    }
    for (i, m) in cfg.multicast.iter().enumerate() {
        validate_multicast(cfg, i, m)?;
    }
    Ok(())
}

fn config_error(msg: impl Into<String>) -> FleetcastError {
    FleetcastError::ConfigError(msg.into())
}

fn validate_scheduler(cfg: &RawConfigFile) -> Result<()> {
    let s = &cfg.scheduler;
    if s.tick_interval_secs == 0 {
        return Err(config_error("[scheduler].tick_interval_secs must be >= 1 (got 0)"));
    }
    if s.imaging_timeout_minutes == 0 {
        return Err(config_error("[scheduler].imaging_timeout_minutes must be >= 1 (got 0)"));
    }
    if s.transmission_timeout_minutes == 0 {
        return Err(config_error(
            "[scheduler].transmission_timeout_minutes must be >= 1 (got 0)",
        ));
    }
    Ok(())
}

fn check_pattern(section: &str, key: &str, pattern: Option<&str>) -> Result<()> {
    if let Some(p) = pattern {
        Regex::new(p).map_err(|e| config_error(format!("{section}.{key} is not a valid regex: {e}")))?;
    }
    Ok(())
}

fn validate_engines(cfg: &RawConfigFile) -> Result<()> {
    for (name, engine) in &cfg.imaging {
        let section = format!("[imaging.{name}]");
        if engine.cmd.trim().is_empty() {
            return Err(config_error(format!("{section}.cmd must not be empty")));
        }
        check_pattern(&section, "progress_pattern", engine.progress_pattern.as_deref())?;
    }

    let t = &cfg.transmission;
    check_pattern("[transmission]", "bytes_pattern", t.bytes_pattern.as_deref())?;
    check_pattern(
        "[transmission]",
        "receiver_done_pattern",
        t.receiver_done_pattern.as_deref(),
    )?;
    let has_cmd = t.cmd.as_deref().is_some_and(|c| !c.trim().is_empty());
    if !cfg.multicast.is_empty() && !has_cmd {
        return Err(config_error(
            "[transmission].cmd is required when [[multicast]] sessions are configured",
        ));
    }
    Ok(())
}

fn validate_images(cfg: &RawConfigFile) -> Result<()> {
    for (name, image) in &cfg.image {
        if image.path.trim().is_empty() {
            return Err(config_error(format!("[image.{name}].path must not be empty")));
        }
        if image.size_bytes == 0 {
            return Err(config_error(format!("[image.{name}].size_bytes must be >= 1")));
        }
    }
    Ok(())
}

fn runner_configured(cfg: &RawConfigFile, task_type: TaskType) -> bool {
    let r = &cfg.runners;
    let template = match task_type {
        TaskType::Snapin => &r.snapin,
        TaskType::Script => &r.script,
        TaskType::DomainJoin => &r.domain_join,
        TaskType::ProductKey => &r.product_key,
    };
    template.as_deref().is_some_and(|t| !t.trim().is_empty())
}

fn validate_profiles(cfg: &RawConfigFile) -> Result<()> {
    for (name, profile) in &cfg.profile {
        let mut seen = BTreeSet::new();
        for task in &profile.task {
            let section = format!("[[profile.{name}.task]] '{}'", task.name);
            if task.name.trim().is_empty() {
                return Err(config_error(format!(
                    "[[profile.{name}.task]] entries need a non-empty name"
                )));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(config_error(format!("{section} is defined twice")));
            }
            if task.timeout_minutes == 0 {
                return Err(config_error(format!("{section}: timeout_minutes must be >= 1")));
            }
            if task.retry_count > MAX_RETRY_COUNT {
                return Err(config_error(format!(
                    "{section}: retry_count must be <= {MAX_RETRY_COUNT} (got {})",
                    task.retry_count
                )));
            }
            let task_type = task.config.task_type();
            if !runner_configured(cfg, task_type) {
                return Err(config_error(format!(
                    "{section} is a {task_type} task but [runners].{task_type} is not set"
                )));
            }
        }
    }
    Ok(())
}

pub(crate) fn parse_timestamp(section: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            config_error(format!(
                "{section}.scheduled_for '{value}' is not an RFC 3339 timestamp: {e}"
            ))
        })
}

fn validate_deployment(cfg: &RawConfigFile, index: usize, d: &DeploymentSection) -> Result<()> {
    let section = format!("[[deployment]] #{} ({})", index + 1, d.device);

    if !cfg.device.contains_key(&d.device) {
        return Err(config_error(format!("{section}: unknown device '{}'", d.device)));
    }
    if !cfg.image.contains_key(&d.image) {
        return Err(config_error(format!("{section}: unknown image '{}'", d.image)));
    }
    if let Some(profile) = &d.profile {
        if !cfg.profile.contains_key(profile) {
            return Err(config_error(format!("{section}: unknown profile '{profile}'")));
        }
    }
    if !cfg.imaging.contains_key(&d.imaging_engine) {
        return Err(config_error(format!(
            "{section}: unknown imaging engine '{}' (no [imaging.{}] section)",
            d.imaging_engine, d.imaging_engine
        )));
    }

    if let Some(at) = &d.scheduled_for {
        parse_timestamp(&section, at)?;
    }

    match d.schedule {
        ScheduleType::Instant => {
            if d.scheduled_for.is_some() || d.cron.is_some() {
                return Err(config_error(format!(
                    "{section}: instant deployments take neither scheduled_for nor cron"
                )));
            }
        }
        ScheduleType::Delayed => {
            if d.scheduled_for.is_none() {
                return Err(config_error(format!(
                    "{section}: delayed deployments need scheduled_for"
                )));
            }
            if d.cron.is_some() {
                return Err(config_error(format!(
                    "{section}: cron is only valid for recurring deployments"
                )));
            }
        }
        ScheduleType::Recurring => {
            let Some(expr) = &d.cron else {
                return Err(config_error(format!(
                    "{section}: recurring deployments need cron"
                )));
            };
            cron::parse(expr).map_err(|e| config_error(format!("{section}: {e}")))?;
        }
    }
    Ok(())
}

fn validate_multicast(cfg: &RawConfigFile, index: usize, m: &MulticastSection) -> Result<()> {
    let section = format!("[[multicast]] #{} ({}:{})", index + 1, m.address, m.port);

    if !cfg.image.contains_key(&m.image) {
        return Err(config_error(format!("{section}: unknown image '{}'", m.image)));
    }
    if let Some(profile) = &m.profile {
        if !cfg.profile.contains_key(profile) {
            return Err(config_error(format!("{section}: unknown profile '{profile}'")));
        }
    }

    let mut seen = BTreeSet::new();
    for device in &m.participants {
        if !cfg.device.contains_key(device) {
            return Err(config_error(format!("{section}: unknown device '{device}'")));
        }
        if !seen.insert(device.as_str()) {
            return Err(config_error(format!("{section}: device '{device}' listed twice")));
        }
    }
    if m.participants.len() > m.max_clients as usize {
        return Err(config_error(format!(
            "{section}: {} participants exceed max_clients = {}",
            m.participants.len(),
            m.max_clients
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn parse(toml_text: &str) -> Result<ConfigFile> {
        let raw: RawConfigFile = toml::from_str(toml_text)?;
        ConfigFile::try_from(raw)
    }

    const BASE: &str = r#"
        [imaging.default]
        cmd = "clone {device} {image_path}"

        [runners]
        script = "{script}"

        [device.lab-01]
        [device.lab-02]
        status = "idle"

        [image.win11]
        path = "/srv/win11.img"
        size_bytes = 1000

        [profile.base]
        halt_on_failure = true

        [[profile.base.task]]
        name = "hello"
        type = "script"
        script = "echo hello"
        retry_count = 2
    "#;

    #[test]
    fn base_config_is_valid() {
        let cfg = parse(BASE).unwrap();
        assert_eq!(cfg.profiles()["base"].task[0].retry_count, 2);
        assert_eq!(cfg.profiles()["base"].task[0].timeout_minutes, 30);
        assert_eq!(cfg.scheduler().tick_interval_secs, 5);
    }

    #[test]
    fn recurring_deployment_needs_a_valid_cron() {
        let text = format!(
            "{BASE}\n[[deployment]]\ndevice = \"lab-01\"\nimage = \"win11\"\nschedule = \"recurring\"\ncron = \"0 25 * * *\"\n"
        );
        let err = parse(&text).unwrap_err().to_string();
        assert!(err.contains("[[deployment]] #1"), "{err}");
        assert!(err.contains("hour"), "{err}");
    }

    #[test]
    fn unknown_references_are_rejected() {
        let text = format!("{BASE}\n[[deployment]]\ndevice = \"lab-99\"\nimage = \"win11\"\n");
        assert!(parse(&text).unwrap_err().to_string().contains("unknown device 'lab-99'"));

        let text = format!(
            "{BASE}\n[transmission]\ncmd = \"send\"\n\n[[multicast]]\nimage = \"win11\"\naddress = \"239.1.1.1\"\nport = 9000\nmax_clients = 2\nprofile = \"missing\"\n"
        );
        assert!(parse(&text).unwrap_err().to_string().contains("unknown profile 'missing'"));
    }

    #[test]
    fn retry_count_is_bounded() {
        let text = BASE.replace("retry_count = 2", "retry_count = 4294967295");
        let err = parse(&text).unwrap_err().to_string();
        assert!(err.contains("retry_count must be <= 100"), "{err}");
    }

    #[test]
    fn huge_timeouts_saturate() {
        let text = format!(
            "[scheduler]\nimaging_timeout_minutes = 9223372036854775807\ntransmission_timeout_minutes = 9223372036854775807\n{BASE}"
        );
        let cfg = parse(&text).unwrap();
        assert_eq!(cfg.scheduler().imaging_timeout(), Duration::from_secs(u64::MAX));
        assert_eq!(cfg.scheduler().transmission_timeout(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn task_types_need_a_runner() {
        let text = format!(
            "{BASE}\n[[profile.base.task]]\nname = \"key\"\ntype = \"product_key\"\nkey = \"AAAAA\"\n"
        );
        let err = parse(&text).unwrap_err().to_string();
        assert!(err.contains("[runners].product_key"), "{err}");
    }

    #[test]
    fn multicast_requires_a_transmission_command() {
        let text = format!(
            "{BASE}\n[[multicast]]\nimage = \"win11\"\naddress = \"239.1.1.1\"\nport = 9000\nmax_clients = 2\n"
        );
        let err = parse(&text).unwrap_err().to_string();
        assert!(err.contains("[transmission].cmd"), "{err}");
    }
}
