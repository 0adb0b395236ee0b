//! Job store: uniform CRUD over a pluggable backend.
//!
//! The [`JobStore`] facade owns canonical serialization, id ordering,
//! pagination, partial-merge semantics, and the single retry applied to
//! transient backend failures. Records live in an in-memory map seeded from
//! the backend at boot; every write goes through the backend before the map,
//! so the backend is always the source of truth across restarts.

pub mod backend;
pub mod dynamodb;
pub mod elasticsearch;
pub mod memory;
pub mod s3;
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use ecss_core::{Job, JobPatch, SchedulerError, TaskInfo};

pub use backend::{JobBackend, StoreError};
pub use dynamodb::DynamoDbBackend;
pub use elasticsearch::ElasticsearchBackend;
pub use memory::MemoryBackend;
pub use s3::S3Backend;
pub use sqlite::SqliteBackend;

/// One page of a job listing.
#[derive(Debug)]
pub struct JobPage {
    pub items: Vec<Job>,
    pub total: usize,
}

pub struct JobStore {
    backend: Arc<dyn JobBackend>,
    jobs: RwLock<BTreeMap<String, Job>>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl JobStore {
    /// Seed the store from the backend. Records that fail to deserialize are
    /// logged and skipped; they stay in the backend untouched.
    pub async fn load(backend: Arc<dyn JobBackend>) -> Result<Self, SchedulerError> {
        let records = retry_once(
            backend.load_all().await,
            || backend.load_all(),
            "load_all",
        )
        .await
        .map_err(store_error)?;

        let mut jobs = BTreeMap::new();
        for (id, body) in records {
            match serde_json::from_str::<Job>(&body) {
                Ok(job) => {
                    jobs.insert(id, job);
                }
                Err(e) => {
                    warn!(
                        job_id = %id,
                        error = %e,
                        "skipping corrupt job record at boot"
                    );
                }
            }
        }
        info!(
            backend = backend.name(),
            jobs = jobs.len(),
            "job store loaded"
        );
        Ok(Self {
            backend,
            jobs: RwLock::new(jobs),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Page through jobs in id order.
    pub async fn list(&self, skip: usize, limit: usize) -> JobPage {
        let jobs = self.jobs.read().await;
        JobPage {
            items: jobs.values().skip(skip).take(limit).cloned().collect(),
            total: jobs.len(),
        }
    }

    /// Every job, in id order. Used to seed the scheduler at boot.
    pub async fn all(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Result<Job, SchedulerError> {
        if let Some(job) = self.jobs.read().await.get(id) {
            return Ok(job.clone());
        }
        // Cache miss — go to the backend so records written before a crash
        // mid-boot (or by a prior process) still resolve.
        let body = retry_once(self.backend.get(id).await, || self.backend.get(id), "get")
            .await
            .map_err(store_error)?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        let job: Job =
            serde_json::from_str(&body).map_err(|e| SchedulerError::BackendCorrupt {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        self.jobs.write().await.insert(id.to_string(), job.clone());
        Ok(job)
    }

    /// Persist a new job. Fails when the id is already taken.
    pub async fn create(&self, job: Job) -> Result<Job, SchedulerError> {
        {
            let jobs = self.jobs.read().await;
            if jobs.contains_key(&job.id) {
                return Err(SchedulerError::AlreadyExists(job.id.clone()));
            }
        }
        self.persist(&job).await?;
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    /// Field-wise merge of a partial update into the stored record.
    pub async fn update(&self, id: &str, patch: &JobPatch) -> Result<Job, SchedulerError> {
        let current = self.get(id).await?;
        let merged = patch.apply(&current);
        merged
            .check_invariants()
            .map_err(SchedulerError::Validation)?;
        self.persist(&merged).await?;
        self.jobs
            .write()
            .await
            .insert(id.to_string(), merged.clone());
        Ok(merged)
    }

    /// Engine write-back after a fire: run metadata only.
    pub async fn record_run(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
        last_run_tasks: Vec<TaskInfo>,
        estimated_next_run: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulerError> {
        let mut job = self.get(id).await?;
        job.last_run = Some(last_run);
        job.last_run_tasks = last_run_tasks;
        job.estimated_next_run = estimated_next_run;
        self.persist(&job).await?;
        self.jobs.write().await.insert(id.to_string(), job);
        Ok(())
    }

    /// Engine write-back when a job is (re)scheduled: next fire estimate.
    pub async fn record_next_run(
        &self,
        id: &str,
        estimated_next_run: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulerError> {
        let mut job = self.get(id).await?;
        if job.estimated_next_run == estimated_next_run {
            return Ok(());
        }
        job.estimated_next_run = estimated_next_run;
        self.persist(&job).await?;
        self.jobs.write().await.insert(id.to_string(), job);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), SchedulerError> {
        if !self.jobs.read().await.contains_key(id) {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        retry_once(
            self.backend.delete(id).await,
            || self.backend.delete(id),
            "delete",
        )
        .await
        .map_err(store_error)?;
        self.jobs.write().await.remove(id);
        Ok(())
    }

    async fn persist(&self, job: &Job) -> Result<(), SchedulerError> {
        let body = serde_json::to_string(job)
            .map_err(|e| SchedulerError::Internal(format!("job serialization failed: {e}")))?;
        retry_once(
            self.backend.put(&job.id, &body).await,
            || self.backend.put(&job.id, &body),
            "put",
        )
        .await
        .map_err(store_error)
    }
}

/// Retry a backend call exactly once when it reports a transient failure.
async fn retry_once<T, F, Fut>(
    first: Result<T, StoreError>,
    again: F,
    operation: &str,
) -> Result<T, StoreError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    match first {
        Err(StoreError::Unavailable(reason)) => {
            warn!(%reason, operation, "backend unavailable; retrying once");
            again().await
        }
        other => other,
    }
}

fn store_error(e: StoreError) -> SchedulerError {
    match e {
        StoreError::Unavailable(reason) => SchedulerError::BackendUnavailable(reason),
        StoreError::Other(reason) => SchedulerError::Internal(reason),
    }
}

/// Pick the backend selected by configuration.
///
/// Selecting more than one is a caller error; when it happens anyway the
/// precedence order is SQLite, S3, DynamoDB, Elasticsearch. With nothing
/// configured the ephemeral in-memory backend is used.
pub async fn select_backend(
    config: &ecss_core::Config,
) -> Result<Arc<dyn JobBackend>, SchedulerError> {
    let store = &config.store;
    if store.configured_backends() > 1 {
        warn!(
            "multiple job store backends configured; applying precedence \
             sqlite > s3 > dynamodb > elasticsearch"
        );
    }
    if let Some(ref file) = store.sqlite_file {
        let backend = SqliteBackend::connect(file).await.map_err(store_error)?;
        return Ok(Arc::new(backend));
    }
    if let Some(ref bucket) = store.s3_bucket {
        let backend = S3Backend::new(bucket, store.s3_prefix.as_deref(), &config.aws).await;
        return Ok(Arc::new(backend));
    }
    if let Some(ref table) = store.dynamodb_table {
        return Ok(Arc::new(DynamoDbBackend::new(table, &config.aws).await));
    }
    if let Some(ref index) = store.elasticsearch_index {
        return Ok(Arc::new(ElasticsearchBackend::new(
            index,
            &store.elasticsearch_hosts,
        )));
    }
    Ok(Arc::new(MemoryBackend::new()))
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            task_definition: id.to_string(),
            schedule: "25 */5".into(),
            schedule_start: None,
            schedule_end: None,
            timezone: None,
            task_count: 1,
            max_count: None,
            trigger: None,
            suspended: false,
            overrides: Vec::new(),
            last_run: None,
            last_run_tasks: Vec::new(),
            estimated_next_run: None,
        }
    }

    async fn store() -> JobStore {
        JobStore::load(Arc::new(MemoryBackend::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let store = store().await;
        let created = store.create(job("sleeper-task")).await.unwrap();
        let fetched = store.get("sleeper-task").await.unwrap();
        assert_eq!(created, fetched);
    }

    #[tokio::test]
    async fn test_create_duplicate_id_rejected() {
        let store = store().await;
        store.create(job("sleeper-task")).await.unwrap();
        let err = store.create(job("sleeper-task")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyExists(id) if id == "sleeper-task"));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = store().await;
        let err = store.get("ghost").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_pages_in_id_order() {
        let store = store().await;
        for id in ["c-task", "a-task", "b-task", "d-task"] {
            store.create(job(id)).await.unwrap();
        }
        let page = store.list(1, 2).await;
        assert_eq!(page.total, 4);
        let ids: Vec<&str> = page.items.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["b-task", "c-task"]);
    }

    #[tokio::test]
    async fn test_update_merges_and_validates() {
        let store = store().await;
        store.create(job("sleeper-task")).await.unwrap();

        let patch = JobPatch {
            max_count: Some(10),
            ..Default::default()
        };
        let updated = store.update("sleeper-task", &patch).await.unwrap();
        assert_eq!(updated.max_count, Some(10));
        assert_eq!(updated.schedule, "25 */5");

        // A merge that breaks taskCount <= maxCount is refused.
        let bad = JobPatch {
            task_count: Some(20),
            ..Default::default()
        };
        let err = store.update("sleeper-task", &bad).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
        // And the stored record is unchanged.
        assert_eq!(store.get("sleeper-task").await.unwrap().task_count, 1);
    }

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let store = store().await;
        store.create(job("sleeper-task")).await.unwrap();
        let patch = JobPatch {
            schedule: Some("30 */7".into()),
            ..Default::default()
        };
        let first = store.update("sleeper-task", &patch).await.unwrap();
        let second = store.update("sleeper-task", &patch).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let store = store().await;
        store.create(job("sleeper-task")).await.unwrap();
        store.delete("sleeper-task").await.unwrap();
        assert!(matches!(
            store.delete("sleeper-task").await.unwrap_err(),
            SchedulerError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_record_run_updates_engine_fields_only() {
        let store = store().await;
        store.create(job("sleeper-task")).await.unwrap();
        let fired_at = Utc::now();
        store
            .record_run(
                "sleeper-task",
                fired_at,
                vec![TaskInfo {
                    task_id: "arn:task/1".into(),
                    host_id: Some("arn:host/1".into()),
                }],
                None,
            )
            .await
            .unwrap();
        let stored = store.get("sleeper-task").await.unwrap();
        assert_eq!(stored.last_run, Some(fired_at));
        assert_eq!(stored.last_run_tasks.len(), 1);
        assert_eq!(stored.schedule, "25 */5");
    }

    #[tokio::test]
    async fn test_corrupt_records_skipped_at_boot() {
        let backend = Arc::new(MemoryBackend::default());
        backend
            .put("good", &serde_json::to_string(&job("good")).unwrap())
            .await
            .unwrap();
        backend.put("bad", "not json at all").await.unwrap();

        let store = JobStore::load(backend).await.unwrap();
        assert_eq!(store.list(0, 10).await.total, 1);
        assert!(store.get("good").await.is_ok());
        // The point read falls through to the backend and reports corruption.
        assert!(matches!(
            store.get("bad").await.unwrap_err(),
            SchedulerError::BackendCorrupt { .. }
        ));
    }

    // A backend that fails transiently on the first call of each operation.
    struct FlakyBackend {
        inner: MemoryBackend,
        failures: AtomicUsize,
    }

    impl FlakyBackend {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryBackend::default(),
                failures: AtomicUsize::new(failures),
            }
        }

        fn maybe_fail(&self) -> Result<(), StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                Err(StoreError::Unavailable("simulated outage".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl JobBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }
        async fn bootstrap(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn load_all(&self) -> Result<Vec<(String, String)>, StoreError> {
            self.maybe_fail()?;
            self.inner.load_all().await
        }
        async fn get(&self, id: &str) -> Result<Option<String>, StoreError> {
            self.maybe_fail()?;
            self.inner.get(id).await
        }
        async fn put(&self, id: &str, body: &str) -> Result<(), StoreError> {
            self.maybe_fail()?;
            self.inner.put(id, body).await
        }
        async fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.maybe_fail()?;
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        // A single failure is absorbed by the retry.
        let store = JobStore::load(Arc::new(FlakyBackend::new(1))).await.unwrap();
        store.create(job("sleeper-task")).await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_failure_surfaces_unavailable() {
        // Two consecutive failures exhaust the single retry.
        let err = JobStore::load(Arc::new(FlakyBackend::new(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::BackendUnavailable(_)));
    }
}
