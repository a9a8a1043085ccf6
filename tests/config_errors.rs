// tests/config_errors.rs

use std::error::Error;
use std::io::Write;

use chrono::{TimeZone, Utc};
use tempfile::NamedTempFile;

use fleetcast::config::{build_plan, load_and_validate};
use fleetcast::engine::RuntimeOptions;
use fleetcast::errors::FleetcastError;
use fleetcast::model::DeploymentStatus;
use fleetcast::types::ScheduleType;

type TestResult = Result<(), Box<dyn Error>>;

const VALID: &str = r#"
[scheduler]
tick_interval_secs = 2
imaging_timeout_minutes = 90

[imaging.default]
cmd = "clone-disk {device} {image_path}"
progress_pattern = "^progress=(\\d+)"

[runners]
script = "sh -c '{script}'"

[device.lab-01]
[device.lab-02]

[image.win11]
path = "/srv/images/win11.img"
size_bytes = 1000

[profile.base]
execution_order = "sequential"

[[profile.base.task]]
name = "hostname"
type = "script"
script = "hostname"

[[deployment]]
device = "lab-01"
image = "win11"
schedule = "delayed"
scheduled_for = "2030-06-01T08:00:00Z"
profile = "base"

[[deployment]]
device = "lab-02"
image = "win11"
schedule = "recurring"
cron = "30 1 * * 1-5"
"#;

fn write_config(text: &str) -> Result<NamedTempFile, Box<dyn Error>> {
    let mut file = NamedTempFile::new()?;
    file.write_all(text.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[test]
fn valid_config_builds_a_plan() -> TestResult {
    let file = write_config(VALID)?;
    let cfg = load_and_validate(file.path())?;
    assert_eq!(cfg.scheduler().tick_interval_secs, 2);
    assert_eq!(cfg.deployments().len(), 2);

    let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    let plan = build_plan(&cfg, RuntimeOptions::default(), now)?;
    let store = plan.orchestrator.store();
    assert_eq!(plan.deployments.len(), 2);

    let delayed = store.deployment(plan.deployments[0]).unwrap();
    assert_eq!(delayed.schedule_type, ScheduleType::Delayed);
    assert_eq!(
        delayed.scheduled_for,
        Some(Utc.with_ymd_and_hms(2030, 6, 1, 8, 0, 0).unwrap())
    );
    assert_eq!(delayed.profile.as_deref(), Some("base"));
    assert_eq!(delayed.status, DeploymentStatus::Pending);

    // 2030-01-01 is a Tuesday.
    let recurring = store.deployment(plan.deployments[1]).unwrap();
    assert_eq!(
        recurring.scheduled_for,
        Some(Utc.with_ymd_and_hms(2030, 1, 1, 1, 30, 0).unwrap())
    );
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() {
    let err = load_and_validate("/definitely/not/here/Fleetcast.toml").unwrap_err();
    assert!(matches!(err, FleetcastError::IoError(_)), "{err:?}");
}

#[test]
fn malformed_toml_is_reported() -> TestResult {
    let file = write_config("[device.lab-01\nstatus = \"online\"")?;
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, FleetcastError::TomlError(_)), "{err:?}");
    Ok(())
}

#[test]
fn unknown_keys_are_rejected() -> TestResult {
    let file = write_config(&format!("{VALID}\n[scheduler_extra]\nfoo = 1\n"))?;
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, FleetcastError::TomlError(_)), "{err:?}");
    Ok(())
}

#[test]
fn bad_timestamp_names_the_deployment() -> TestResult {
    let text = VALID.replace("2030-06-01T08:00:00Z", "next tuesday");
    let file = write_config(&text)?;
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, FleetcastError::ConfigError(_)), "{err:?}");
    let msg = err.to_string();
    assert!(msg.contains("[[deployment]] #1"), "{msg}");
    assert!(msg.contains("next tuesday"), "{msg}");
    Ok(())
}

#[test]
fn bad_cron_names_the_field() -> TestResult {
    let text = VALID.replace("30 1 * * 1-5", "30 1 * * 1-9");
    let file = write_config(&text)?;
    let err = load_and_validate(file.path()).unwrap_err().to_string();
    assert!(err.contains("[[deployment]] #2"), "{err}");
    assert!(err.contains("weekday"), "{err}");
    Ok(())
}

#[test]
fn invalid_progress_pattern_is_rejected() -> TestResult {
    let text = VALID.replace("^progress=(\\\\d+)", "progress=(");
    let file = write_config(&text)?;
    let err = load_and_validate(file.path()).unwrap_err().to_string();
    assert!(err.contains("progress_pattern"), "{err}");
    Ok(())
}

#[test]
fn delayed_in_the_past_is_rejected_when_building_the_plan() -> TestResult {
    let file = write_config(VALID)?;
    let cfg = load_and_validate(file.path())?;
    let now = Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap();
    let err = build_plan(&cfg, RuntimeOptions::default(), now).unwrap_err();
    assert!(err.is_validation(), "{err:?}");
    Ok(())
}
