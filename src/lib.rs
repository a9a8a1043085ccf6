// src/lib.rs

pub mod backend;
pub mod chain;
pub mod cli;
pub mod config;
pub mod cron;
pub mod deploy;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod model;
pub mod multicast;
pub mod schedule;
pub mod store;
pub mod types;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::chain::{RealChainBackend, TaskChainExecutor};
use crate::cli::CliArgs;
use crate::config::{build_plan, load_and_validate, ConfigFile};
use crate::engine::{Runtime, RuntimeEvent, RuntimeHandle, RuntimeOptions, SystemClock};
use crate::model::DeploymentStatus;
use crate::types::ScheduleType;

/// Occurrences shown per recurring deployment in `--dry-run`.
const DRY_RUN_OCCURRENCES: usize = 3;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading and the initial plan
/// - the scheduler core and its runtime shell
/// - the task chain backend
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;
    let now = Utc::now();

    if args.dry_run {
        print_dry_run(&cfg, now);
        return Ok(());
    }

    let options = runtime_options(&cfg, &args);
    let plan = build_plan(&cfg, options, now)?;

    // Runtime event channel.
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);

    let backend = RealChainBackend::new(TaskChainExecutor::new(plan.runners), rt_tx.clone());

    // Ctrl-C → graceful shutdown.
    {
        let handle = RuntimeHandle::new(rt_tx.clone());
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = handle.shutdown().await;
        });
    }

    let runtime = Runtime::new(plan.orchestrator, rt_rx, backend, SystemClock);
    let core = runtime.run().await?;

    let store = core.store();
    for status in [
        DeploymentStatus::Completed,
        DeploymentStatus::Failed,
        DeploymentStatus::Cancelled,
        DeploymentStatus::Pending,
    ] {
        let count = store.deployment_ids_with_status(status).len();
        if count > 0 {
            info!(%status, count, "deployments at exit");
        }
    }
    Ok(())
}

/// Runtime options from `[scheduler]`, with CLI flags taking precedence.
pub fn runtime_options(cfg: &ConfigFile, args: &CliArgs) -> RuntimeOptions {
    let scheduler = cfg.scheduler();
    RuntimeOptions {
        tick_interval: args
            .tick_interval
            .map(Duration::from_secs)
            .unwrap_or_else(|| scheduler.tick_interval()),
        exit_when_idle: args.once || scheduler.exit_when_idle,
    }
}

/// Print devices, images, profiles and the work plan, including the next
/// firings of each recurring deployment.
fn print_dry_run(cfg: &ConfigFile, now: DateTime<Utc>) {
    let s = cfg.scheduler();
    println!("fleetcast dry-run");
    println!("  scheduler.tick_interval_secs = {}", s.tick_interval_secs);
    println!("  scheduler.imaging_timeout_minutes = {}", s.imaging_timeout_minutes);
    println!(
        "  scheduler.transmission_timeout_minutes = {}",
        s.transmission_timeout_minutes
    );
    println!();

    println!("devices ({}):", cfg.devices().len());
    for (name, device) in cfg.devices() {
        println!("  - {name} ({})", device.status);
    }

    println!("images ({}):", cfg.images().len());
    for (name, image) in cfg.images() {
        println!("  - {name}: {} ({} bytes)", image.path, image.size_bytes);
    }

    println!("profiles ({}):", cfg.profiles().len());
    for (name, profile) in cfg.profiles() {
        println!(
            "  - {name} [{}, halt_on_failure = {}]",
            profile.execution_order, profile.halt_on_failure
        );
        for task in &profile.task {
            println!(
                "      {} ({}): timeout {}m, retries {} every {}s",
                task.name,
                task.config.summary(),
                task.timeout_minutes,
                task.retry_count,
                task.retry_delay_seconds
            );
        }
    }

    println!("deployments ({}):", cfg.deployments().len());
    for d in cfg.deployments() {
        println!("  - {} <- {} [{}]", d.device, d.image, d.schedule);
        if let Some(at) = &d.scheduled_for {
            println!("      scheduled_for: {at}");
        }
        if let Some(profile) = &d.profile {
            println!("      profile: {profile}");
        }
        if d.schedule == ScheduleType::Recurring {
            if let Some(expr) = &d.cron {
                println!("      cron: {expr}");
                match cron::next_occurrences(expr, now, DRY_RUN_OCCURRENCES) {
                    Ok(next) => {
                        for at in next {
                            println!("      next: {}", at.to_rfc3339());
                        }
                    }
                    Err(e) => println!("      invalid: {e}"),
                }
            }
        }
    }

    println!("multicast sessions ({}):", cfg.multicast().len());
    for m in cfg.multicast() {
        println!(
            "  - {} -> {}:{} (max {} clients, auto_start = {})",
            m.image, m.address, m.port, m.max_clients, m.auto_start
        );
        if !m.participants.is_empty() {
            println!("      participants: {}", m.participants.join(", "));
        }
        if let Some(profile) = &m.profile {
            println!("      profile: {profile}");
        }
    }

    debug!("dry-run complete (no execution)");
}
