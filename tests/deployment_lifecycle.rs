// tests/deployment_lifecycle.rs

mod common;
use crate::common::world::World;
use crate::common::{epoch, init_tracing};

use std::error::Error;
use std::time::Duration;

use chrono::{TimeDelta, TimeZone, Utc};

use fleetcast::errors::FleetcastError;
use fleetcast::model::{DeploymentStatus, DeviceStatus, NewDeployment};
use fleetcast::store::DeviceRegistry;

type TestResult = Result<(), Box<dyn Error>>;

const HOUR: Duration = Duration::from_secs(3600);

#[test]
fn instant_deployment_claims_device_and_completes() -> TestResult {
    init_tracing();
    let mut w = World::new(&["pc-1"]);
    let mut sm = w.deployments(HOUR);
    let now = epoch();

    let id = sm.submit(&mut w.store, NewDeployment::instant("pc-1", "win11"), now)?;
    let tick = sm.advance(&mut w.store, now);
    assert_eq!(tick.started, vec![id]);
    assert_eq!(w.registry.status("pc-1"), Some(DeviceStatus::Deploying));
    assert_eq!(w.imaging.started(), vec!["pc-1".to_string()]);

    let d = w.store.deployment(id).unwrap();
    assert_eq!(d.status, DeploymentStatus::Deploying);
    assert_eq!(d.started_at, Some(now));
    assert_eq!(d.progress, 0);

    w.imaging.complete("pc-1");
    let tick = sm.advance(&mut w.store, now + TimeDelta::minutes(10));
    assert_eq!(tick.completed, vec![id]);

    let d = w.store.deployment(id).unwrap();
    assert_eq!(d.status, DeploymentStatus::Completed);
    assert_eq!(d.progress, 100);
    assert_eq!(d.completed_at, Some(now + TimeDelta::minutes(10)));
    assert_eq!(w.registry.status("pc-1"), Some(DeviceStatus::Idle));
    assert_eq!(sm.in_flight(), 0);
    Ok(())
}

#[test]
fn busy_device_defers_the_deployment() -> TestResult {
    init_tracing();
    let mut w = World::new(&["pc-1"]);
    let mut sm = w.deployments(HOUR);
    let now = epoch();

    let first = sm.submit(&mut w.store, NewDeployment::instant("pc-1", "win11"), now)?;
    let second = sm.submit(&mut w.store, NewDeployment::instant("pc-1", "win11"), now)?;

    let tick = sm.advance(&mut w.store, now);
    assert_eq!(tick.started.len(), 1);
    assert_eq!(tick.deferred.len(), 1);
    let (winner, loser) = if tick.started[0] == first {
        (first, second)
    } else {
        (second, first)
    };
    assert_eq!(w.store.deployment(loser).unwrap().status, DeploymentStatus::Pending);
    assert!(w.store.deployment(loser).unwrap().error_message.is_none());

    w.imaging.complete("pc-1");
    let tick = sm.advance(&mut w.store, now + TimeDelta::minutes(1));
    assert_eq!(tick.completed, vec![winner]);
    assert_eq!(tick.started, vec![loser]);
    assert_eq!(
        w.store.deployment(loser).unwrap().status,
        DeploymentStatus::Deploying
    );
    Ok(())
}

#[test]
fn offline_device_stays_pending() -> TestResult {
    let mut w = World::new(&["pc-1"]);
    w.registry.set_status("pc-1", DeviceStatus::Offline);
    let mut sm = w.deployments(HOUR);
    let now = epoch();

    let id = sm.submit(&mut w.store, NewDeployment::instant("pc-1", "win11"), now)?;
    for minute in 0..3 {
        let tick = sm.advance(&mut w.store, now + TimeDelta::minutes(minute));
        assert_eq!(tick.deferred, vec![id]);
    }
    assert_eq!(w.store.deployment(id).unwrap().status, DeploymentStatus::Pending);
    assert!(w.imaging.started().is_empty());
    Ok(())
}

#[test]
fn progress_only_moves_forward() -> TestResult {
    let mut w = World::new(&["pc-1"]);
    let mut sm = w.deployments(HOUR);
    let now = epoch();

    let id = sm.submit(&mut w.store, NewDeployment::instant("pc-1", "win11"), now)?;
    sm.advance(&mut w.store, now);

    w.imaging.progress("pc-1", 40);
    w.imaging.progress("pc-1", 25);
    sm.advance(&mut w.store, now);
    assert_eq!(w.store.deployment(id).unwrap().progress, 40);

    w.imaging.progress("pc-1", 250);
    sm.advance(&mut w.store, now);
    assert_eq!(w.store.deployment(id).unwrap().progress, 100);
    assert_eq!(
        w.store.deployment(id).unwrap().status,
        DeploymentStatus::Deploying
    );
    Ok(())
}

#[test]
fn engine_failure_is_recorded_and_releases_device() -> TestResult {
    let mut w = World::new(&["pc-1"]);
    let mut sm = w.deployments(HOUR);
    let now = epoch();

    let id = sm.submit(&mut w.store, NewDeployment::instant("pc-1", "win11"), now)?;
    sm.advance(&mut w.store, now);
    w.imaging.fail("pc-1", "disk write error");
    let tick = sm.advance(&mut w.store, now);

    assert_eq!(tick.failed, vec![id]);
    let d = w.store.deployment(id).unwrap();
    assert_eq!(d.status, DeploymentStatus::Failed);
    assert_eq!(
        d.error_message.as_deref(),
        Some("Collaborator error: disk write error")
    );
    assert_eq!(w.registry.status("pc-1"), Some(DeviceStatus::Idle));
    Ok(())
}

#[test]
fn refused_start_fails_without_holding_the_device() -> TestResult {
    let mut w = World::new(&["pc-1"]);
    w.imaging.refuse("pc-1");
    let mut sm = w.deployments(HOUR);
    let now = epoch();

    let id = sm.submit(&mut w.store, NewDeployment::instant("pc-1", "win11"), now)?;
    let tick = sm.advance(&mut w.store, now);

    assert_eq!(tick.failed, vec![id]);
    let d = w.store.deployment(id).unwrap();
    assert_eq!(d.status, DeploymentStatus::Failed);
    assert!(d.error_message.as_deref().unwrap().contains("imaging refused"));
    assert_eq!(w.registry.status("pc-1"), Some(DeviceStatus::Idle));
    Ok(())
}

#[test]
fn watchdog_fails_stuck_imaging() -> TestResult {
    let mut w = World::new(&["pc-1"]);
    let mut sm = w.deployments(Duration::from_secs(30 * 60));
    let now = epoch();

    let id = sm.submit(&mut w.store, NewDeployment::instant("pc-1", "win11"), now)?;
    sm.advance(&mut w.store, now);

    let tick = sm.advance(&mut w.store, now + TimeDelta::minutes(29));
    assert!(tick.failed.is_empty());

    let tick = sm.advance(&mut w.store, now + TimeDelta::minutes(30));
    assert_eq!(tick.failed, vec![id]);
    let d = w.store.deployment(id).unwrap();
    assert_eq!(d.status, DeploymentStatus::Failed);
    assert_eq!(
        d.error_message.as_deref(),
        Some("Timed out: imaging did not finish within 30 minutes")
    );
    assert_eq!(w.imaging.aborted().len(), 1);
    assert_eq!(w.registry.status("pc-1"), Some(DeviceStatus::Idle));

    // Late completion after the watchdog is ignored.
    w.imaging.complete("pc-1");
    let tick = sm.advance(&mut w.store, now + TimeDelta::minutes(31));
    assert!(tick.completed.is_empty());
    assert_eq!(w.store.deployment(id).unwrap().status, DeploymentStatus::Failed);
    Ok(())
}

#[test]
fn cancel_aborts_imaging_and_releases_device() -> TestResult {
    let mut w = World::new(&["pc-1"]);
    let mut sm = w.deployments(HOUR);
    let now = epoch();

    let id = sm.submit(&mut w.store, NewDeployment::instant("pc-1", "win11"), now)?;
    sm.advance(&mut w.store, now);
    let handle = w.imaging.handle_of("pc-1").unwrap();

    let spawned = sm.cancel(&mut w.store, id, now + TimeDelta::minutes(2))?;
    assert!(spawned.is_none());
    assert_eq!(w.imaging.aborted(), vec![handle]);

    let d = w.store.deployment(id).unwrap();
    assert_eq!(d.status, DeploymentStatus::Cancelled);
    assert_eq!(d.completed_at, Some(now + TimeDelta::minutes(2)));
    assert_eq!(w.registry.status("pc-1"), Some(DeviceStatus::Idle));

    // Cancelling twice is an invalid transition.
    let err = sm.cancel(&mut w.store, id, now).unwrap_err();
    assert!(matches!(err, FleetcastError::InvalidTransition(_)));
    Ok(())
}

#[test]
fn cancelling_a_pending_deployment_does_not_touch_the_device() -> TestResult {
    let mut w = World::new(&["pc-1"]);
    let mut sm = w.deployments(HOUR);
    let now = epoch();

    let id = sm.submit(
        &mut w.store,
        NewDeployment::delayed("pc-1", "win11", now + TimeDelta::hours(1)),
        now,
    )?;
    sm.cancel(&mut w.store, id, now)?;

    assert_eq!(w.store.deployment(id).unwrap().status, DeploymentStatus::Cancelled);
    assert_eq!(w.registry.status("pc-1"), Some(DeviceStatus::Online));
    assert!(w.imaging.aborted().is_empty());
    Ok(())
}

#[test]
fn delayed_deployment_waits_and_rejects_past_times() -> TestResult {
    let mut w = World::new(&["pc-1"]);
    let mut sm = w.deployments(HOUR);
    let now = epoch();

    let err = sm
        .submit(
            &mut w.store,
            NewDeployment::delayed("pc-1", "win11", now - TimeDelta::minutes(5)),
            now,
        )
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(w.store.deployments().count(), 0);

    let at = now + TimeDelta::hours(2);
    let id = sm.submit(&mut w.store, NewDeployment::delayed("pc-1", "win11", at), now)?;
    assert!(sm.advance(&mut w.store, now + TimeDelta::hours(1)).started.is_empty());
    assert_eq!(sm.advance(&mut w.store, at).started, vec![id]);
    Ok(())
}

#[test]
fn submit_rejects_unknown_references() {
    let mut w = World::new(&["pc-1"]);
    let sm = w.deployments(HOUR);
    let now = epoch();

    for new in [
        NewDeployment::instant("ghost", "win11"),
        NewDeployment::instant("pc-1", "win7"),
        NewDeployment::instant("pc-1", "win11").with_profile("missing"),
        NewDeployment::instant("pc-1", "win11").with_imaging_engine("pxe"),
    ] {
        let err = sm.submit(&mut w.store, new, now).unwrap_err();
        assert!(err.is_validation(), "expected validation error, got {err:?}");
    }
    assert_eq!(w.store.deployments().count(), 0);
}

#[test]
fn recurring_completion_spawns_next_occurrence() -> TestResult {
    let mut w = World::new(&["pc-1"]);
    let mut sm = w.deployments(HOUR);
    let created = epoch();
    let first_at = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();

    let id = sm.submit(
        &mut w.store,
        NewDeployment::recurring("pc-1", "win11", "0 2 * * *", first_at),
        created,
    )?;
    assert_eq!(sm.advance(&mut w.store, first_at).started, vec![id]);

    w.imaging.complete("pc-1");
    let tick = sm.advance(&mut w.store, first_at + TimeDelta::minutes(20));
    assert_eq!(tick.completed, vec![id]);
    assert_eq!(tick.spawned.len(), 1);

    let next = w.store.deployment(tick.spawned[0]).unwrap();
    assert_eq!(next.status, DeploymentStatus::Pending);
    assert_eq!(next.parent, Some(id));
    assert_eq!(
        next.scheduled_for,
        Some(Utc.with_ymd_and_hms(2024, 1, 2, 2, 0, 0).unwrap())
    );
    // The finished occurrence is kept as history.
    assert_eq!(w.store.deployment(id).unwrap().status, DeploymentStatus::Completed);
    Ok(())
}

#[test]
fn cancel_keeps_a_series_going_but_cancel_series_stops_it() -> TestResult {
    let mut w = World::new(&["pc-1"]);
    let mut sm = w.deployments(HOUR);
    let now = epoch();
    let first_at = now + TimeDelta::hours(2);

    let id = sm.submit(
        &mut w.store,
        NewDeployment::recurring("pc-1", "win11", "0 2 * * *", first_at),
        now,
    )?;
    let next = sm.cancel(&mut w.store, id, now)?.expect("series continues");
    assert_eq!(w.store.deployment(next).unwrap().parent, Some(id));

    sm.cancel_series(&mut w.store, next, now)?;
    assert_eq!(w.store.deployment(next).unwrap().status, DeploymentStatus::Cancelled);
    assert_eq!(w.store.deployment_ids_with_status(DeploymentStatus::Pending).len(), 0);
    Ok(())
}

#[test]
fn closed_event_channel_fails_the_deployment() -> TestResult {
    let mut w = World::new(&["pc-1"]);
    let mut sm = w.deployments(HOUR);
    let now = epoch();

    let id = sm.submit(&mut w.store, NewDeployment::instant("pc-1", "win11"), now)?;
    sm.advance(&mut w.store, now);
    w.imaging.progress("pc-1", 60);
    w.imaging.drop_channel("pc-1");

    let tick = sm.advance(&mut w.store, now);
    assert_eq!(tick.failed, vec![id]);
    let d = w.store.deployment(id).unwrap();
    assert_eq!(d.status, DeploymentStatus::Failed);
    assert_eq!(d.progress, 60);
    assert!(d.error_message.as_deref().unwrap().contains("closed its event channel"));
    assert_eq!(w.registry.status("pc-1"), Some(DeviceStatus::Idle));
    Ok(())
}
