// src/model/profile.rs

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::{FleetcastError, Result};
use crate::types::{BindingId, DeploymentId, DeviceName, ExecutionOrder, ImageName, ProfileName, SessionId};

/// Kind of post-deployment task; selects the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Snapin,
    Script,
    DomainJoin,
    ProductKey,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Snapin,
        TaskType::Script,
        TaskType::DomainJoin,
        TaskType::ProductKey,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Snapin => "snapin",
            TaskType::Script => "script",
            TaskType::DomainJoin => "domain_join",
            TaskType::ProductKey => "product_key",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific task configuration.
///
/// In TOML the variant is selected by `type = "..."`:
///
/// ```toml
/// [[profile.base.task]]
/// type = "domain_join"
/// domain = "corp.example"
/// username = "joiner"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskConfig {
    Snapin {
        package: String,
        #[serde(default)]
        args: Option<String>,
    },
    Script {
        script: String,
        #[serde(default)]
        interpreter: Option<String>,
    },
    DomainJoin {
        domain: String,
        username: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        ou: Option<String>,
    },
    ProductKey {
        key: String,
    },
}

impl TaskConfig {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskConfig::Snapin { .. } => TaskType::Snapin,
            TaskConfig::Script { .. } => TaskType::Script,
            TaskConfig::DomainJoin { .. } => TaskType::DomainJoin,
            TaskConfig::ProductKey { .. } => TaskType::ProductKey,
        }
    }

    /// `{name}` -> value pairs a command template may reference.
    pub fn placeholders(&self) -> Vec<(&'static str, String)> {
        match self {
            TaskConfig::Snapin { package, args } => vec![
                ("package", package.clone()),
                ("args", args.clone().unwrap_or_default()),
            ],
            TaskConfig::Script {
                script,
                interpreter,
            } => vec![
                ("script", script.clone()),
                ("interpreter", interpreter.clone().unwrap_or_else(|| "sh".to_string())),
            ],
            TaskConfig::DomainJoin {
                domain,
                username,
                password,
                ou,
            } => vec![
                ("domain", domain.clone()),
                ("username", username.clone()),
                ("password", password.clone().unwrap_or_default()),
                ("ou", ou.clone().unwrap_or_default()),
            ],
            TaskConfig::ProductKey { key } => vec![("key", key.clone())],
        }
    }

    /// Short label for logs (never includes secrets).
    pub fn summary(&self) -> String {
        match self {
            TaskConfig::Snapin { package, .. } => format!("snapin {package}"),
            TaskConfig::Script { script, .. } => {
                let first = script.lines().next().unwrap_or_default();
                format!("script {first}")
            }
            TaskConfig::DomainJoin { domain, .. } => format!("domain_join {domain}"),
            TaskConfig::ProductKey { .. } => "product_key".to_string(),
        }
    }
}

/// Largest accepted `retry_count` for a single task.
pub const MAX_RETRY_COUNT: u32 = 100;

/// One step of a post-deployment profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostDeploymentTask {
    pub name: String,
    pub config: TaskConfig,
    pub timeout_minutes: u32,
    pub retry_count: u32,
    pub retry_delay_seconds: u64,
}

impl PostDeploymentTask {
    pub fn new(name: impl Into<String>, config: TaskConfig) -> Self {
        Self {
            name: name.into(),
            config,
            timeout_minutes: 30,
            retry_count: 0,
            retry_delay_seconds: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_minutes) * 60)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    /// Upper bound on TaskRun attempts for this task.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

/// Reusable ordered list of tasks run after imaging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostDeploymentProfile {
    pub name: ProfileName,
    pub execution_order: ExecutionOrder,
    pub halt_on_failure: bool,
    pub tasks: Vec<PostDeploymentTask>,
}

impl PostDeploymentProfile {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FleetcastError::Validation(
                "profile name must not be empty".to_string(),
            ));
        }
        for (idx, task) in self.tasks.iter().enumerate() {
            if task.timeout_minutes == 0 {
                return Err(FleetcastError::Validation(format!(
                    "profile '{}' task #{} ('{}'): timeout_minutes must be >= 1",
                    self.name,
                    idx + 1,
                    task.name
                )));
            }
            if task.retry_count > MAX_RETRY_COUNT {
                return Err(FleetcastError::Validation(format!(
                    "profile '{}' task #{} ('{}'): retry_count must be <= {MAX_RETRY_COUNT} (got {})",
                    self.name,
                    idx + 1,
                    task.name,
                    task.retry_count
                )));
            }
        }
        Ok(())
    }
}

/// What a binding's task chain runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingTarget {
    Deployment(DeploymentId),
    Participant { session: SessionId, device: DeviceName },
}

/// Final result of one task chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl fmt::Display for ChainOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainOutcome::Completed => "completed",
            ChainOutcome::CompletedWithErrors => "completed_with_errors",
            ChainOutcome::Failed => "failed",
            ChainOutcome::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A profile attached to one concrete deployment or multicast participant.
///
/// The profile is snapshotted so later edits do not affect a running chain.
#[derive(Debug, Clone)]
pub struct ProfileBinding {
    pub id: BindingId,
    pub profile: PostDeploymentProfile,
    pub target: BindingTarget,
    pub device: DeviceName,
    pub image: ImageName,
    pub created_at: DateTime<Utc>,
    pub outcome: Option<ChainOutcome>,
}

impl ProfileBinding {
    pub fn new(
        profile: PostDeploymentProfile,
        target: BindingTarget,
        device: DeviceName,
        image: ImageName,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            profile,
            target,
            device,
            image,
            created_at: now,
            outcome: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskRunStatus::Succeeded | TaskRunStatus::Failed | TaskRunStatus::Skipped
        )
    }
}

/// One recorded attempt of one task within a binding. Never overwritten.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub id: Uuid,
    pub binding: BindingId,
    pub task_index: usize,
    pub task_name: String,
    pub attempt: u32,
    pub status: TaskRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl TaskRun {
    pub fn pending(binding: BindingId, task_index: usize, task_name: &str, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            binding,
            task_index,
            task_name: task_name.to_string(),
            attempt,
            status: TaskRunStatus::Pending,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = TaskRunStatus::Running;
        self.started_at = Some(now);
    }

    pub fn succeed(&mut self, output: String, now: DateTime<Utc>) {
        self.status = TaskRunStatus::Succeeded;
        self.output = Some(output).filter(|o| !o.is_empty());
        self.finished_at = Some(now);
    }

    pub fn fail(&mut self, error: String, output: Option<String>, now: DateTime<Utc>) {
        self.status = TaskRunStatus::Failed;
        self.error = Some(error);
        self.output = output.filter(|o| !o.is_empty());
        self.finished_at = Some(now);
    }

    pub fn skip(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = TaskRunStatus::Skipped;
        self.error = Some(reason.to_string());
        self.finished_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_with(task: PostDeploymentTask) -> PostDeploymentProfile {
        PostDeploymentProfile {
            name: "base".to_string(),
            execution_order: ExecutionOrder::Sequential,
            halt_on_failure: false,
            tasks: vec![task],
        }
    }

    fn script(name: &str) -> PostDeploymentTask {
        PostDeploymentTask::new(
            name,
            TaskConfig::Script {
                script: "true".to_string(),
                interpreter: None,
            },
        )
    }

    #[test]
    fn retry_count_has_an_upper_bound() {
        let mut task = script("a");
        task.retry_count = MAX_RETRY_COUNT;
        assert!(profile_with(task.clone()).validate().is_ok());

        task.retry_count = u32::MAX;
        let err = profile_with(task).validate().unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("retry_count"), "{err}");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut task = script("a");
        task.timeout_minutes = 0;
        assert!(profile_with(task).validate().unwrap_err().is_validation());
    }
}
