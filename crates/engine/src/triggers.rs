//! Fire-time trigger evaluation.
//!
//! A trigger attached to a job gates execution and controls task fan-out.
//! Trigger types are resolved at runtime by their string tag through
//! [`TriggerRegistry`]; the built-in `sqs` evaluator scales the launch count
//! by queue depth. A job with an unknown trigger type does not launch — the
//! fire is skipped with a logged warning.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_sqs::config::{BehaviorVersion, Region};
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use tracing::{debug, info};

use ecss_core::config::AwsConfig;
use ecss_core::{Job, SchedulerError};

/// Decides how many tasks a fire should launch for a job.
#[async_trait]
pub trait TriggerEvaluator: Send + Sync {
    /// The launch count for this fire. Zero means "do not launch".
    async fn task_count(&self, job: &Job) -> Result<u32, SchedulerError>;
}

/// Maps trigger type tags to evaluators. Built once at startup.
#[derive(Default)]
pub struct TriggerRegistry {
    evaluators: HashMap<String, Arc<dyn TriggerEvaluator>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in evaluators registered.
    pub async fn with_builtins(aws: &AwsConfig) -> Self {
        let mut registry = Self::new();
        registry.register("sqs", Arc::new(SqsQueueTrigger::new(aws).await));
        registry
    }

    pub fn register(&mut self, kind: &str, evaluator: Arc<dyn TriggerEvaluator>) {
        self.evaluators.insert(kind.to_string(), evaluator);
    }

    /// Evaluate the job's trigger (if any) into a launch count.
    pub async fn task_count(&self, job: &Job) -> Result<u32, SchedulerError> {
        let Some(ref trigger) = job.trigger else {
            return Ok(untriggered_count(job));
        };
        match self.evaluators.get(&trigger.kind) {
            Some(evaluator) => evaluator.task_count(job).await,
            None => Err(SchedulerError::Trigger(format!(
                "unknown trigger type '{}'",
                trigger.kind
            ))),
        }
    }
}

/// Launch count for a job without a trigger.
pub fn untriggered_count(job: &Job) -> u32 {
    job.task_count.min(job.launch_cap())
}

/// Launch count for a queue-depth trigger.
///
/// An empty queue launches nothing. Otherwise the demand implied by the
/// backlog is floored at the job's `taskCount` and capped at
/// `min(maxCount, 50)`.
pub fn queue_scaled_count(job: &Job, depth: u64) -> u32 {
    if depth == 0 {
        return 0;
    }
    let per_task = job
        .trigger
        .as_ref()
        .and_then(|t| t.messages_per_task)
        .filter(|m| *m > 0);
    let scaled = match per_task {
        Some(m) => depth.div_ceil(m as u64).min(u32::MAX as u64) as u32,
        None => 0,
    };
    scaled.max(job.task_count).min(job.launch_cap())
}

/// Queue-depth trigger backed by SQS `ApproximateNumberOfMessages`.
pub struct SqsQueueTrigger {
    client: Client,
}

impl SqsQueueTrigger {
    /// Build an SQS client from project config. Static credentials and an
    /// endpoint override are applied when configured; otherwise the default
    /// provider chain is used.
    pub async fn new(aws: &AwsConfig) -> Self {
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(aws.region.clone()))
            .load()
            .await;
        let mut builder = aws_sdk_sqs::config::Builder::from(&base);

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

        info!(region = %aws.region, "sqs trigger evaluator initialized");
        Self {
            client: Client::from_conf(builder.build()),
        }
    }

    async fn queue_depth(&self, queue_name: &str) -> Result<u64, SchedulerError> {
        let queue_url = self
            .client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| SchedulerError::Trigger(format!("sqs queue url lookup failed: {e}")))?
            .queue_url()
            .ok_or_else(|| {
                SchedulerError::Trigger(format!("sqs returned no url for queue '{queue_name}'"))
            })?
            .to_string();

        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(&queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| SchedulerError::Trigger(format!("sqs depth probe failed: {e}")))?;

        let depth = resp
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        debug!(queue = %queue_name, depth, "sqs queue depth");
        Ok(depth)
    }
}

#[async_trait]
impl TriggerEvaluator for SqsQueueTrigger {
    async fn task_count(&self, job: &Job) -> Result<u32, SchedulerError> {
        let queue_name = job
            .trigger
            .as_ref()
            .and_then(|t| t.queue_name.as_deref())
            .ok_or_else(|| {
                SchedulerError::Trigger("sqs trigger is missing queueName".to_string())
            })?;
        let depth = self.queue_depth(queue_name).await?;
        Ok(queue_scaled_count(job, depth))
    }
}

// ── Tests ────────────────────────────────────────────────────────────
