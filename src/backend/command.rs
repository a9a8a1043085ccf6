// src/backend/command.rs

//! Shared plumbing for collaborators that shell out to external tools.
//!
//! - [`render_template`] fills `{placeholder}`s in a configured command line.
//! - [`shell_command`] builds a platform shell invocation.
//! - [`JobRegistry`] tracks cancellation tokens of running jobs.
//! - [`spawn_watched`] runs a command in the background, turns stdout lines
//!   into events and reports the exit status as a final event.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::Result;

use super::JobHandle;

/// Replace every `{key}` in `template` with its value.
///
/// Unknown placeholders are left untouched so a typo shows up verbatim in the
/// logged command line.
pub fn render_template(template: &str, values: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Build a shell command appropriate for the platform.
pub fn shell_command(cmdline: &str) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmdline);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmdline);
        c
    };
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Cancellation tokens of jobs that are still running.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<JobHandle, CancellationToken>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobHandle, CancellationToken>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self) -> (JobHandle, CancellationToken) {
        let handle = JobHandle::new();
        let token = CancellationToken::new();
        self.lock().insert(handle, token.clone());
        (handle, token)
    }

    /// Request cancellation. Returns false if the job already finished.
    pub fn cancel(&self, handle: JobHandle) -> bool {
        match self.lock().remove(&handle) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, handle: JobHandle) {
        self.lock().remove(&handle);
    }

    pub fn running(&self) -> usize {
        self.lock().len()
    }
}

/// Spawn `cmdline` and forward its output as events.
///
/// - every stdout line is passed to `on_line`; the events it returns are sent,
/// - when the process exits, `on_exit` maps the exit status to a final event,
/// - when `token` is cancelled the process is killed and no final event is sent.
pub fn spawn_watched<E, L, X>(
    label: String,
    cmdline: String,
    handle: JobHandle,
    token: CancellationToken,
    jobs: JobRegistry,
    events: mpsc::UnboundedSender<E>,
    mut on_line: L,
    on_exit: X,
) -> Result<()>
where
    E: Send + 'static,
    L: FnMut(&str) -> Vec<E> + Send + 'static,
    X: FnOnce(std::io::Result<ExitStatus>) -> E + Send + 'static,
{
    info!(job = %label, %handle, cmd = %cmdline, "starting external command");

    let mut child = shell_command(&cmdline)
        .spawn()
        .with_context(|| format!("spawning process for {label}"))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Always consume stderr so buffers don't fill; log at debug.
    if let Some(stderr) = stderr {
        let label = label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(job = %label, "stderr: {}", line);
            }
        });
    }

    tokio::spawn(async move {
        let mut lines = stdout.map(|s| BufReader::new(s).lines());

        loop {
            tokio::select! {
                line = next_line(&mut lines) => match line {
                    Some(line) => {
                        debug!(job = %label, "stdout: {}", line);
                        for event in on_line(&line) {
                            let _ = events.send(event);
                        }
                    }
                    None => break,
                },
                _ = token.cancelled() => {
                    kill(&mut child, &label).await;
                    jobs.finish(handle);
                    return;
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status,
            _ = token.cancelled() => {
                kill(&mut child, &label).await;
                jobs.finish(handle);
                return;
            }
        };

        match &status {
            Ok(s) => info!(job = %label, %handle, success = s.success(), code = ?s.code(), "external command exited"),
            Err(e) => warn!(job = %label, %handle, error = %e, "waiting for external command failed"),
        }

        jobs.finish(handle);
        let _ = events.send(on_exit(status));
    });

    Ok(())
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> Option<String> {
    match lines {
        Some(l) => l.next_line().await.ok().flatten(),
        None => None,
    }
}

async fn kill(child: &mut tokio::process::Child, label: &str) {
    info!(job = %label, "cancellation requested; killing process");
    if let Err(e) = child.kill().await {
        warn!(job = %label, error = %e, "failed to kill child process on cancellation");
    }
}

/// Keep at most the last `limit` bytes of captured output.
pub fn tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_known_placeholders() {
        let out = render_template(
            "clone --dev {device} --img {image} --mode {boot_mode} {unknown}",
            &[
                ("device", "pc-1".to_string()),
                ("image", "/srv/win11".to_string()),
                ("boot_mode", "uefi".to_string()),
            ],
        );
        assert_eq!(out, "clone --dev pc-1 --img /srv/win11 --mode uefi {unknown}");
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("aé", 1), "");
    }

    #[test]
    fn job_registry_cancels_once() {
        let jobs = JobRegistry::new();
        let (handle, token) = jobs.register();
        assert_eq!(jobs.running(), 1);
        assert!(jobs.cancel(handle));
        assert!(token.is_cancelled());
        assert!(!jobs.cancel(handle));
        assert_eq!(jobs.running(), 0);
    }

    #[tokio::test]
    async fn watched_command_reports_lines_and_exit() {
        let jobs = JobRegistry::new();
        let (handle, token) = jobs.register();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        spawn_watched(
            "echo-test".to_string(),
            "echo one; echo two".to_string(),
            handle,
            token,
            jobs.clone(),
            tx,
            |line| vec![format!("line:{line}")],
            |status| format!("exit:{}", status.map(|s| s.success()).unwrap_or(false)),
        )
        .unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("line:one"));
        assert_eq!(rx.recv().await.as_deref(), Some("line:two"));
        assert_eq!(rx.recv().await.as_deref(), Some("exit:true"));
    }
}
