#![allow(dead_code)]

use chrono::Utc;
use fleetcast::model::{
    BindingTarget, PostDeploymentProfile, PostDeploymentTask, ProfileBinding, TaskConfig,
};
use fleetcast::types::ExecutionOrder;
use uuid::Uuid;

/// Builder for a script task. The script text doubles as the behaviour key
/// for [`crate::fakes::ScriptedTaskRunner`].
pub struct TaskBuilder {
    task: PostDeploymentTask,
}

impl TaskBuilder {
    pub fn script(name: &str, script: &str) -> Self {
        Self {
            task: PostDeploymentTask::new(
                name,
                TaskConfig::Script {
                    script: script.to_string(),
                    interpreter: None,
                },
            ),
        }
    }

    pub fn config(name: &str, config: TaskConfig) -> Self {
        Self {
            task: PostDeploymentTask::new(name, config),
        }
    }

    pub fn retries(mut self, count: u32) -> Self {
        self.task.retry_count = count;
        self
    }

    pub fn retry_delay_secs(mut self, secs: u64) -> Self {
        self.task.retry_delay_seconds = secs;
        self
    }

    pub fn timeout_minutes(mut self, minutes: u32) -> Self {
        self.task.timeout_minutes = minutes;
        self
    }

    pub fn build(self) -> PostDeploymentTask {
        self.task
    }
}

/// Builder for `PostDeploymentProfile`.
pub struct ProfileBuilder {
    profile: PostDeploymentProfile,
}

impl ProfileBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            profile: PostDeploymentProfile {
                name: name.to_string(),
                execution_order: ExecutionOrder::Sequential,
                halt_on_failure: false,
                tasks: Vec::new(),
            },
        }
    }

    pub fn parallel(mut self) -> Self {
        self.profile.execution_order = ExecutionOrder::Parallel;
        self
    }

    pub fn halt_on_failure(mut self, halt: bool) -> Self {
        self.profile.halt_on_failure = halt;
        self
    }

    pub fn task(mut self, task: PostDeploymentTask) -> Self {
        self.profile.tasks.push(task);
        self
    }

    /// Shorthand for a script task with default policy.
    pub fn script(self, name: &str, script: &str) -> Self {
        self.task(TaskBuilder::script(name, script).build())
    }

    pub fn build(self) -> PostDeploymentProfile {
        self.profile
    }
}

/// A binding of `profile` to a fresh deployment id on `device`.
pub fn binding_for(profile: PostDeploymentProfile, device: &str) -> ProfileBinding {
    ProfileBinding::new(
        profile,
        BindingTarget::Deployment(Uuid::new_v4()),
        device.to_string(),
        "win11".to_string(),
        Utc::now(),
    )
}
