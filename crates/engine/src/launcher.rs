//! ECS task launching.
//!
//! Adapter over the orchestrator's `RunTask` API. The per-call limit is 10
//! tasks, so larger counts are chunked; a chunk that errors is logged and
//! does not abort the remaining chunks. Partial successes accumulate into
//! the outcome.

use async_trait::async_trait;
use aws_sdk_ecs::config::{BehaviorVersion, Region};
use aws_sdk_ecs::types::{ContainerOverride as EcsContainerOverride, KeyValuePair, TaskOverride};
use aws_sdk_ecs::Client;
use tracing::{info, warn};

use ecss_core::config::AwsConfig;
use ecss_core::{ContainerOverride, SchedulerError, TaskInfo};

/// Environment entry added to every container override so a running task can
/// be traced back to the job that started it.
pub const OVERRIDE_TAG: &str = "ECSS_SCHEDULER_OVERRIDE_TAG";

/// ECS caps RunTask at 10 tasks per call.
const RUN_TASK_CHUNK: u32 = 10;

/// The result of launching tasks for one fire.
#[derive(Debug, Default)]
pub struct LaunchOutcome {
    pub tasks: Vec<TaskInfo>,
    pub failures: Vec<String>,
}

/// Seam between the scheduler engine and the orchestrator API.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launch `count` copies of a task definition with per-container
    /// environment overrides, tagged with the scheduler's name.
    async fn launch(
        &self,
        task_definition: &str,
        count: u32,
        overrides: &[ContainerOverride],
        job_id: &str,
    ) -> Result<LaunchOutcome, SchedulerError>;
}

pub struct EcsTaskLauncher {
    client: Client,
    cluster: String,
    started_by: String,
}

impl EcsTaskLauncher {
    /// Build an ECS client from project config. Static credentials and an
    /// endpoint override are applied when configured; otherwise the default
    /// provider chain is used.
    pub async fn new(cluster: &str, started_by: &str, aws: &AwsConfig) -> Self {
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(aws.region.clone()))
            .load()
            .await;
        let mut builder = aws_sdk_ecs::config::Builder::from(&base);

        if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
            let creds = aws_credential_types::Credentials::new(
                key_id,
                secret,
                aws.session_token.clone(),
                None,
                "ecss-static",
            );
            builder = builder.credentials_provider(creds);
        }
        if let Some(ref endpoint) = aws.endpoint_url {
            if !endpoint.is_empty() {
                builder = builder.endpoint_url(endpoint);
            }
        }

        info!(cluster = %cluster, started_by = %started_by, "ecs task launcher initialized");
        Self {
            client: Client::from_conf(builder.build()),
            cluster: cluster.to_string(),
            started_by: started_by.to_string(),
        }
    }
}

/// Translate job overrides into the orchestrator's shape, tagging each
/// container with the owning job id.
fn build_task_override(overrides: &[ContainerOverride], job_id: &str) -> Option<TaskOverride> {
    if overrides.is_empty() {
        return None;
    }
    let mut task_override = TaskOverride::builder();
    for entry in overrides {
        let mut container = EcsContainerOverride::builder().name(&entry.container_name);
        for (name, value) in &entry.environment {
            container = container.environment(
                KeyValuePair::builder().name(name).value(value).build(),
            );
        }
        container = container.environment(
            KeyValuePair::builder()
                .name(OVERRIDE_TAG)
                .value(job_id)
                .build(),
        );
        task_override = task_override.container_overrides(container.build());
    }
    Some(task_override.build())
}

#[async_trait]
impl Launcher for EcsTaskLauncher {
    async fn launch(
        &self,
        task_definition: &str,
        count: u32,
        overrides: &[ContainerOverride],
        job_id: &str,
    ) -> Result<LaunchOutcome, SchedulerError> {
        let task_override = build_task_override(overrides, job_id);
        let mut outcome = LaunchOutcome::default();
        let mut remaining = count;

        while remaining > 0 {
            let chunk = remaining.min(RUN_TASK_CHUNK);
            let mut request = self
                .client
                .run_task()
                .cluster(&self.cluster)
                .task_definition(task_definition)
                .started_by(&self.started_by)
                .count(chunk as i32);
            if let Some(ref overrides) = task_override {
                request = request.overrides(overrides.clone());
            }

            match request.send().await {
                Ok(resp) => {
                    for failure in resp.failures() {
                        let reason = format!(
                            "{} ({})",
                            failure.reason().unwrap_or("unknown"),
                            failure.arn().unwrap_or("no arn")
                        );
                        warn!(job_id, task_definition, %reason, "task start failure");
                        outcome.failures.push(reason);
                    }
                    for task in resp.tasks() {
                        outcome.tasks.push(TaskInfo {
                            task_id: task.task_arn().unwrap_or_default().to_string(),
                            host_id: task.container_instance_arn().map(str::to_string),
                        });
                    }
                }
                Err(e) => {
                    // One bad chunk must not sink the rest of the fire.
                    let reason = format!("run_task chunk of {chunk} failed: {e}");
                    warn!(job_id, task_definition, %reason, "task launch error");
                    outcome.failures.push(reason);
                }
            }
            remaining -= chunk;
        }

        info!(
            job_id,
            task_definition,
            requested = count,
            launched = outcome.tasks.len(),
            "task launch complete"
        );
        Ok(outcome)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_no_overrides_means_no_task_override() {
        assert!(build_task_override(&[], "job-1").is_none());
    }

    #[test]
    fn test_overrides_carry_environment_and_tag() {
        let overrides = vec![ContainerOverride {
            container_name: "worker".into(),
            environment: BTreeMap::from([("SLEEP_SECONDS".to_string(), "10".to_string())]),
        }];
        let built = build_task_override(&overrides, "long-sleep-task").unwrap();
        let containers = built.container_overrides();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name(), Some("worker"));

        let env = containers[0].environment();
        let pairs: Vec<(&str, &str)> = env
            .iter()
            .map(|kv| (kv.name().unwrap_or(""), kv.value().unwrap_or("")))
            .collect();
        assert!(pairs.contains(&("SLEEP_SECONDS", "10")));
        assert!(pairs.contains(&(OVERRIDE_TAG, "long-sleep-task")));
    }

    #[test]
    fn test_chunking_math() {
        // 25 tasks split into 10 + 10 + 5.
        let mut remaining: u32 = 25;
        let mut chunks = Vec::new();
        while remaining > 0 {
            let chunk = remaining.min(RUN_TASK_CHUNK);
            chunks.push(chunk);
            remaining -= chunk;
        }
        assert_eq!(chunks, vec![10, 10, 5]);
    }
}
