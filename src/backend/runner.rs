// src/backend/runner.rs

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::model::TaskConfig;

use super::command::{render_template, shell_command, tail};
use super::{TaskFuture, TaskOutcome, TaskRunner};

/// Bytes of stdout/stderr kept on a TaskRun.
const OUTPUT_LIMIT: usize = 8 * 1024;

/// Runs a post-deployment task by rendering a command template with the
/// task's configuration and executing it through the shell.
///
/// One instance is registered per task type, e.g. `install-snapin {package}
/// {args}` for snapins or `{script}` for scripts.
#[derive(Debug, Clone)]
pub struct CommandTaskRunner {
    template: String,
}

impl CommandTaskRunner {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl TaskRunner for CommandTaskRunner {
    fn run<'a>(&'a self, config: &'a TaskConfig, timeout: Duration) -> TaskFuture<'a> {
        Box::pin(async move {
            let cmdline = render_template(&self.template, &config.placeholders());
            info!(task = %config.summary(), "running task command");

            let child = match shell_command(&cmdline).spawn() {
                Ok(child) => child,
                Err(e) => {
                    return TaskOutcome::Failed {
                        error: format!("spawning task command failed: {e}"),
                        output: String::new(),
                    };
                }
            };

            // The child is killed on drop if the timeout fires.
            let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return TaskOutcome::Failed {
                        error: format!("waiting for task command failed: {e}"),
                        output: String::new(),
                    };
                }
                Err(_) => {
                    warn!(task = %config.summary(), ?timeout, "task command timed out");
                    return TaskOutcome::Failed {
                        error: format!("timed out after {}s", timeout.as_secs()),
                        output: String::new(),
                    };
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(task = %config.summary(), code = ?output.status.code(), "task command exited");

            if output.status.success() {
                TaskOutcome::Succeeded {
                    output: tail(&stdout, OUTPUT_LIMIT),
                }
            } else {
                TaskOutcome::Failed {
                    error: format!("task command exited with {}", output.status),
                    output: tail(&format!("{stdout}{stderr}"), OUTPUT_LIMIT),
                }
            }
        })
    }
}
