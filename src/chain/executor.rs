// src/chain/executor.rs

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{TaskOutcome, TaskRunners};
use crate::model::{ChainOutcome, PostDeploymentTask, ProfileBinding, TaskRun};
use crate::types::{BindingId, ExecutionOrder};

use super::ChainReport;

const SKIPPED_AFTER_FAILURE: &str = "skipped: an earlier task failed";
const SKIPPED_AFTER_CANCEL: &str = "skipped: chain cancelled";

/// Runs the tasks of one profile binding against its device.
#[derive(Debug, Clone)]
pub struct TaskChainExecutor {
    runners: TaskRunners,
}

/// All attempts of one task and how the task ended.
#[derive(Debug)]
struct TaskResult {
    runs: Vec<TaskRun>,
    succeeded: bool,
    cancelled: bool,
}

impl TaskChainExecutor {
    pub fn new(runners: TaskRunners) -> Self {
        Self { runners }
    }

    /// Execute the binding's profile to completion or until `cancel` fires.
    ///
    /// Every attempt becomes its own [`TaskRun`]; the report lists them in
    /// task order then attempt order.
    pub async fn execute(&self, binding: &ProfileBinding, cancel: CancellationToken) -> ChainReport {
        let profile = &binding.profile;
        info!(
            binding = %binding.id,
            device = %binding.device,
            profile = %profile.name,
            order = %profile.execution_order,
            tasks = profile.tasks.len(),
            "task chain started"
        );

        let (mut runs, outcome) = match profile.execution_order {
            ExecutionOrder::Sequential => self.run_sequential(binding, &cancel).await,
            ExecutionOrder::Parallel => self.run_parallel(binding, &cancel).await,
        };
        runs.sort_by_key(|r| (r.task_index, r.attempt));

        info!(binding = %binding.id, %outcome, runs = runs.len(), "task chain finished");
        ChainReport {
            binding: binding.id,
            outcome,
            runs,
        }
    }

    async fn run_sequential(
        &self,
        binding: &ProfileBinding,
        cancel: &CancellationToken,
    ) -> (Vec<TaskRun>, ChainOutcome) {
        let profile = &binding.profile;
        let mut runs = Vec::new();
        let mut any_failed = false;
        let mut halted = false;
        let mut cancelled = false;

        for (index, task) in profile.tasks.iter().enumerate() {
            if halted || cancelled || cancel.is_cancelled() {
                let reason = if halted {
                    SKIPPED_AFTER_FAILURE
                } else {
                    cancelled = true;
                    SKIPPED_AFTER_CANCEL
                };
                let mut run = TaskRun::pending(binding.id, index, &task.name, 1);
                run.skip(reason, Utc::now());
                debug!(binding = %binding.id, task = %task.name, reason, "task skipped");
                runs.push(run);
                continue;
            }

            let result = run_task(&self.runners, binding.id, index, task, cancel, None).await;
            runs.extend(result.runs);
            if result.cancelled {
                cancelled = true;
            } else if !result.succeeded {
                any_failed = true;
                if profile.halt_on_failure {
                    warn!(binding = %binding.id, task = %task.name, "halting chain after failure");
                    halted = true;
                }
            }
        }

        (runs, outcome_of(cancelled, halted, any_failed))
    }

    async fn run_parallel(
        &self,
        binding: &ProfileBinding,
        cancel: &CancellationToken,
    ) -> (Vec<TaskRun>, ChainOutcome) {
        let profile = &binding.profile;
        // Fired by the first failure when halting; stops further retries.
        let halt = CancellationToken::new();
        let mut set = JoinSet::new();

        for (index, task) in profile.tasks.iter().cloned().enumerate() {
            let runners = self.runners.clone();
            let cancel = cancel.clone();
            let halt = halt.clone();
            let binding_id = binding.id;
            let halt_on_failure = profile.halt_on_failure;

            set.spawn(async move {
                let result = run_task(&runners, binding_id, index, &task, &cancel, Some(&halt)).await;
                if halt_on_failure && !result.succeeded && !result.cancelled {
                    halt.cancel();
                }
                result
            });
        }

        let mut runs = Vec::new();
        let mut any_failed = false;
        let mut cancelled = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    runs.extend(result.runs);
                    cancelled |= result.cancelled;
                    any_failed |= !result.succeeded && !result.cancelled;
                }
                Err(e) => {
                    error!(binding = %binding.id, error = %e, "task worker panicked");
                    any_failed = true;
                }
            }
        }

        let halted = profile.halt_on_failure && any_failed;
        (runs, outcome_of(cancelled, halted, any_failed))
    }
}

fn outcome_of(cancelled: bool, halted: bool, any_failed: bool) -> ChainOutcome {
    if cancelled {
        ChainOutcome::Cancelled
    } else if halted {
        ChainOutcome::Failed
    } else if any_failed {
        ChainOutcome::CompletedWithErrors
    } else {
        ChainOutcome::Completed
    }
}

/// Run one task with its retry policy.
///
/// `halt`, when fired, stops further retries; the attempt in flight still
/// finishes.
async fn run_task(
    runners: &TaskRunners,
    binding: BindingId,
    index: usize,
    task: &PostDeploymentTask,
    cancel: &CancellationToken,
    halt: Option<&CancellationToken>,
) -> TaskResult {
    let task_type = task.config.task_type();
    let Some(runner) = runners.get(task_type) else {
        let now = Utc::now();
        let mut run = TaskRun::pending(binding, index, &task.name, 1);
        run.start(now);
        run.fail(format!("no runner registered for task type {task_type}"), None, now);
        warn!(%binding, task = %task.name, %task_type, "no runner for task type");
        return TaskResult {
            runs: vec![run],
            succeeded: false,
            cancelled: false,
        };
    };

    let max_attempts = task.max_attempts();
    let timeout = task.timeout();
    let mut runs = Vec::new();

    for attempt in 1..=max_attempts {
        let mut run = TaskRun::pending(binding, index, &task.name, attempt);
        run.start(Utc::now());
        info!(%binding, task = %task.name, %task_type, attempt, max_attempts, "task attempt started");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(timeout, runner.run(&task.config, timeout)) => Some(result),
        };

        match outcome {
            None => {
                run.fail("cancelled".to_string(), None, Utc::now());
                info!(%binding, task = %task.name, attempt, "task attempt cancelled");
                runs.push(run);
                return TaskResult {
                    runs,
                    succeeded: false,
                    cancelled: true,
                };
            }
            Some(Ok(TaskOutcome::Succeeded { output })) => {
                run.succeed(output, Utc::now());
                info!(%binding, task = %task.name, attempt, "task succeeded");
                runs.push(run);
                return TaskResult {
                    runs,
                    succeeded: true,
                    cancelled: false,
                };
            }
            Some(Ok(TaskOutcome::Failed { error, output })) => {
                warn!(%binding, task = %task.name, attempt, %error, "task attempt failed");
                run.fail(error, Some(output), Utc::now());
            }
            Some(Err(_)) => {
                let error = format!("timed out after {} minutes", task.timeout_minutes);
                warn!(%binding, task = %task.name, attempt, %error, "task attempt timed out");
                run.fail(error, None, Utc::now());
            }
        }
        runs.push(run);

        if attempt == max_attempts {
            break;
        }
        if halt.is_some_and(CancellationToken::is_cancelled) {
            debug!(%binding, task = %task.name, "not retrying; chain is halting");
            break;
        }

        debug!(%binding, task = %task.name, delay = ?task.retry_delay(), "waiting before retry");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return TaskResult {
                    runs,
                    succeeded: false,
                    cancelled: true,
                };
            }
            _ = tokio::time::sleep(task.retry_delay()) => {}
        }
    }

    TaskResult {
        runs,
        succeeded: false,
        cancelled: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_precedence() {
        assert_eq!(outcome_of(true, true, true), ChainOutcome::Cancelled);
        assert_eq!(outcome_of(false, true, true), ChainOutcome::Failed);
        assert_eq!(outcome_of(false, false, true), ChainOutcome::CompletedWithErrors);
        assert_eq!(outcome_of(false, false, false), ChainOutcome::Completed);
    }
}
