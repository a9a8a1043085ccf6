#![allow(dead_code)]

//! Fake collaborators for driving the orchestrator deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;

use fleetcast::backend::{
    ImagingEngine, ImagingEvent, ImagingJob, ImagingRequest, JobHandle, TaskFuture, TaskOutcome,
    TaskRunner, Transmission, TransmissionEngine, TransmissionEvent, TransmissionRequest,
};
use fleetcast::chain::backend::BackendFuture;
use fleetcast::chain::{ChainBackend, ChainReport};
use fleetcast::engine::{Clock, RuntimeEvent};
use fleetcast::errors::{FleetcastError, Result};
use fleetcast::model::{ChainOutcome, ProfileBinding, TaskConfig};
use fleetcast::types::{BindingId, DeviceName, SessionId};

// ---- imaging ---------------------------------------------------------------

#[derive(Default)]
struct ImagingState {
    jobs: HashMap<DeviceName, (JobHandle, mpsc::UnboundedSender<ImagingEvent>)>,
    started: Vec<ImagingRequest>,
    aborted: Vec<JobHandle>,
    refuse: HashSet<DeviceName>,
}

/// Imaging engine whose jobs are completed by the test.
///
/// Clones share state, so a test keeps one clone and hands another to the
/// state machine.
#[derive(Clone, Default)]
pub struct FakeImagingEngine {
    state: Arc<Mutex<ImagingState>>,
}

impl FakeImagingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `start` fail for this device.
    pub fn refuse(&self, device: &str) {
        self.state.lock().unwrap().refuse.insert(device.to_string());
    }

    pub fn started(&self) -> Vec<DeviceName> {
        self.state
            .lock()
            .unwrap()
            .started
            .iter()
            .map(|r| r.device.clone())
            .collect()
    }

    pub fn aborted(&self) -> Vec<JobHandle> {
        self.state.lock().unwrap().aborted.clone()
    }

    pub fn handle_of(&self, device: &str) -> Option<JobHandle> {
        self.state.lock().unwrap().jobs.get(device).map(|(h, _)| *h)
    }

    fn send(&self, device: &str, event: ImagingEvent) {
        let state = self.state.lock().unwrap();
        let (_, tx) = state
            .jobs
            .get(device)
            .unwrap_or_else(|| panic!("no imaging job for {device}"));
        // The receiver may be gone after cancel; that's fine for tests.
        let _ = tx.send(event);
    }

    pub fn progress(&self, device: &str, percent: u8) {
        self.send(device, ImagingEvent::Progress(percent));
    }

    pub fn complete(&self, device: &str) {
        self.send(device, ImagingEvent::Completed);
    }

    pub fn fail(&self, device: &str, reason: &str) {
        self.send(device, ImagingEvent::Failed(reason.to_string()));
    }

    /// Drop the job's sender, as a crashed engine would.
    pub fn drop_channel(&self, device: &str) {
        self.state.lock().unwrap().jobs.remove(device);
    }
}

impl ImagingEngine for FakeImagingEngine {
    fn start(&self, request: ImagingRequest) -> Result<ImagingJob> {
        let mut state = self.state.lock().unwrap();
        if state.refuse.contains(&request.device) {
            return Err(FleetcastError::Collaborator(format!(
                "imaging refused for {}",
                request.device
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = JobHandle::new();
        state.jobs.insert(request.device.clone(), (handle, tx));
        state.started.push(request);
        Ok(ImagingJob { handle, events: rx })
    }

    fn abort(&self, handle: JobHandle) -> Result<()> {
        self.state.lock().unwrap().aborted.push(handle);
        Ok(())
    }
}

// ---- transmission ----------------------------------------------------------

#[derive(Default)]
struct TransmissionState {
    open: HashMap<SessionId, (JobHandle, mpsc::UnboundedSender<TransmissionEvent>)>,
    opened: Vec<TransmissionRequest>,
    closed: Vec<JobHandle>,
    refuse: bool,
}

/// Transmission engine whose byte counts and completions are pushed by the
/// test.
#[derive(Clone, Default)]
pub struct FakeTransmissionEngine {
    state: Arc<Mutex<TransmissionState>>,
}

impl FakeTransmissionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_open(&self) {
        self.state.lock().unwrap().refuse = true;
    }

    pub fn opened(&self) -> Vec<TransmissionRequest> {
        self.state.lock().unwrap().opened.clone()
    }

    pub fn closed(&self) -> Vec<JobHandle> {
        self.state.lock().unwrap().closed.clone()
    }

    fn send(&self, session: SessionId, event: TransmissionEvent) {
        let state = self.state.lock().unwrap();
        let (_, tx) = state
            .open
            .get(&session)
            .unwrap_or_else(|| panic!("no transmission for session {session}"));
        let _ = tx.send(event);
    }

    pub fn bytes(&self, session: SessionId, total: u64, at: DateTime<Utc>) {
        self.send(session, TransmissionEvent::BytesSent { total, at });
    }

    pub fn participant_done(&self, session: SessionId, device: &str) {
        self.send(session, TransmissionEvent::ParticipantCompleted(device.to_string()));
    }

    pub fn finish(&self, session: SessionId) {
        self.send(session, TransmissionEvent::Finished);
    }

    pub fn fail(&self, session: SessionId, reason: &str) {
        self.send(session, TransmissionEvent::Failed(reason.to_string()));
    }
}

impl TransmissionEngine for FakeTransmissionEngine {
    fn open(&self, request: TransmissionRequest) -> Result<Transmission> {
        let mut state = self.state.lock().unwrap();
        if state.refuse {
            return Err(FleetcastError::Collaborator("sender unavailable".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = JobHandle::new();
        state.open.insert(request.session, (handle, tx));
        state.opened.push(request);
        Ok(Transmission { handle, events: rx })
    }

    fn close(&self, handle: JobHandle) -> Result<()> {
        self.state.lock().unwrap().closed.push(handle);
        Ok(())
    }
}

// ---- task runner -----------------------------------------------------------

/// Task runner whose behaviour is chosen by the script text:
///
/// - `"ok"` (or anything unrecognised): succeed,
/// - `"fail"`: always fail,
/// - `"fail:N"`: fail the first N calls, then succeed,
/// - `"sleep:MS"`: sleep MS milliseconds (tokio time), then succeed,
/// - `"hang"`: never finish.
///
/// Non-script tasks are keyed by their summary and always succeed.
#[derive(Clone, Default)]
pub struct ScriptedTaskRunner {
    calls: Arc<Mutex<Vec<(String, tokio::time::Instant)>>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

struct RunningGuard {
    running: Arc<AtomicUsize>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls made with this script.
    pub fn calls(&self, script: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == script)
            .count()
    }

    /// Scripts in call order.
    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
    }

    /// Tokio instants of the calls made with this script.
    pub fn call_times(&self, script: &str) -> Vec<tokio::time::Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == script)
            .map(|(_, t)| *t)
            .collect()
    }

    /// Highest number of tasks that were running at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn record(&self, key: &str) -> (usize, RunningGuard) {
        let mut calls = self.calls.lock().unwrap();
        calls.push((key.to_string(), tokio::time::Instant::now()));
        let n = calls.iter().filter(|(s, _)| s == key).count();

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);
        let guard = RunningGuard {
            running: Arc::clone(&self.running),
        };
        (n, guard)
    }
}

impl TaskRunner for ScriptedTaskRunner {
    fn run<'a>(&'a self, config: &'a TaskConfig, _timeout: Duration) -> TaskFuture<'a> {
        Box::pin(async move {
            let key = match config {
                TaskConfig::Script { script, .. } => script.clone(),
                other => other.summary(),
            };
            let (call, _guard) = self.record(&key);

            if key == "fail" {
                return TaskOutcome::Failed {
                    error: "scripted failure".to_string(),
                    output: String::new(),
                };
            }
            if key == "hang" {
                std::future::pending::<()>().await;
            }
            if let Some(n) = key.strip_prefix("fail:").and_then(|n| n.parse::<usize>().ok()) {
                if call <= n {
                    return TaskOutcome::Failed {
                        error: format!("scripted failure {call}/{n}"),
                        output: String::new(),
                    };
                }
            }
            if let Some(ms) = key.strip_prefix("sleep:").and_then(|n| n.parse::<u64>().ok()) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            TaskOutcome::Succeeded {
                output: format!("{key} done"),
            }
        })
    }
}

// ---- clocks ----------------------------------------------------------------

/// Clock moved by hand.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// UTC clock that follows tokio's (possibly paused) clock from `origin`.
#[derive(Clone, Copy)]
pub struct TokioClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().duration_since(self.started);
        self.origin + TimeDelta::from_std(elapsed).unwrap_or(TimeDelta::MAX)
    }
}

// ---- chain backend ---------------------------------------------------------

/// Chain backend that reports every chain as finished with `outcome`
/// straight away.
pub struct FakeChainBackend {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    outcome: ChainOutcome,
    ran: Arc<Mutex<Vec<ProfileBinding>>>,
    cancelled: Arc<Mutex<Vec<BindingId>>>,
}

impl FakeChainBackend {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>, outcome: ChainOutcome) -> Self {
        Self {
            runtime_tx,
            outcome,
            ran: Arc::default(),
            cancelled: Arc::default(),
        }
    }

    pub fn ran(&self) -> Arc<Mutex<Vec<ProfileBinding>>> {
        Arc::clone(&self.ran)
    }

    pub fn cancelled(&self) -> Arc<Mutex<Vec<BindingId>>> {
        Arc::clone(&self.cancelled)
    }
}

impl ChainBackend for FakeChainBackend {
    fn run_chain(&mut self, binding: ProfileBinding) -> BackendFuture<'_> {
        let tx = self.runtime_tx.clone();
        let ran = Arc::clone(&self.ran);
        let outcome = self.outcome;

        Box::pin(async move {
            let report = ChainReport {
                binding: binding.id,
                outcome,
                runs: Vec::new(),
            };
            ran.lock().unwrap().push(binding);
            tx.send(RuntimeEvent::ChainFinished(report))
                .await
                .map_err(anyhow::Error::from)?;
            Ok(())
        })
    }

    fn cancel_chain(&mut self, binding: BindingId) -> BackendFuture<'_> {
        let cancelled = Arc::clone(&self.cancelled);
        Box::pin(async move {
            cancelled.lock().unwrap().push(binding);
            Ok(())
        })
    }
}
