//! The scheduler engine.
//!
//! One task owns the in-memory trigger table: a [`TriggerTable`] holding one
//! entry per non-deleted job, seeded from the store at boot and kept in sync
//! through the mutation channel. A 1-second tick finds due entries; each
//! fire runs on its own spawned task so a slow launch cannot delay other
//! jobs. Missed instants are not replayed — the next scheduled instant is
//! honored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use ecss_core::{Job, Schedule};
use ecss_store::JobStore;

use crate::dispatch::{JobMutation, MutationKind};
use crate::launcher::Launcher;
use crate::triggers::TriggerRegistry;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// How long shutdown waits for in-flight fires before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

// ── Trigger table ────────────────────────────────────────────────────

struct ScheduleEntry {
    schedule: Schedule,
    tz: Tz,
    suspended: bool,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    next_fire: Option<DateTime<Utc>>,
}

/// A fire owed to a job, captured at tick time.
#[derive(Debug, PartialEq)]
pub struct FireOrder {
    pub job_id: String,
    /// The instant the schedule reached.
    pub scheduled: DateTime<Utc>,
    /// The entry's new next-fire estimate, for write-back.
    pub estimated_next_run: Option<DateTime<Utc>>,
}

/// The engine's in-memory schedule state, one entry per job.
///
/// Owned exclusively by the engine task; mutations arrive through the
/// channel and are applied here in publication order.
#[derive(Default)]
pub struct TriggerTable {
    entries: HashMap<String, ScheduleEntry>,
}

impl TriggerTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.entries.contains_key(job_id)
    }

    pub fn is_suspended(&self, job_id: &str) -> Option<bool> {
        self.entries.get(job_id).map(|e| e.suspended)
    }

    pub fn next_fire(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(job_id).and_then(|e| e.next_fire)
    }

    /// Insert or replace the entry for a job. Returns the next-fire estimate
    /// for store write-back, or `None` when the stored schedule fails to
    /// parse (logged; the job stays unscheduled until the next update).
    pub fn upsert(&mut self, job: &Job, now: DateTime<Utc>) -> Option<Option<DateTime<Utc>>> {
        let schedule = match Schedule::parse(&job.schedule) {
            Ok(schedule) => schedule,
            Err(reasons) => {
                error!(
                    job_id = %job.id,
                    schedule = %job.schedule,
                    reasons = ?reasons,
                    "stored schedule does not parse; job will not be scheduled"
                );
                self.entries.remove(&job.id);
                return None;
            }
        };
        let tz = job.tz();
        let next_fire = compute_next(&schedule, tz, job.schedule_start, job.schedule_end, now);
        self.entries.insert(
            job.id.clone(),
            ScheduleEntry {
                schedule,
                tz,
                suspended: job.suspended,
                start: job.schedule_start,
                end: job.schedule_end,
                next_fire,
            },
        );
        Some(next_fire)
    }

    pub fn remove(&mut self, job_id: &str) {
        self.entries.remove(job_id);
    }

    pub fn pause(&mut self, job_id: &str) -> bool {
        match self.entries.get_mut(job_id) {
            Some(entry) => {
                entry.suspended = true;
                true
            }
            None => false,
        }
    }

    /// Un-suspend and recompute the next fire from `now`. Returns the new
    /// estimate for write-back.
    pub fn resume(&mut self, job_id: &str, now: DateTime<Utc>) -> Option<Option<DateTime<Utc>>> {
        let entry = self.entries.get_mut(job_id)?;
        entry.suspended = false;
        entry.next_fire = compute_next(&entry.schedule, entry.tz, entry.start, entry.end, now);
        Some(entry.next_fire)
    }

    /// Entries due at `now`. Each returned entry has its next fire advanced
    /// past `now`, so an instant fires at most once.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<FireOrder> {
        let mut orders = Vec::new();
        for (job_id, entry) in &mut self.entries {
            if entry.suspended {
                continue;
            }
            let Some(scheduled) = entry.next_fire else {
                continue;
            };
            if scheduled > now {
                continue;
            }
            entry.next_fire = compute_next(&entry.schedule, entry.tz, entry.start, entry.end, now);
            orders.push(FireOrder {
                job_id: job_id.clone(),
                scheduled,
                estimated_next_run: entry.next_fire,
            });
        }
        orders
    }
}

/// Next fire after `now`, clipped to the job's schedule window.
fn compute_next(
    schedule: &Schedule,
    tz: Tz,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let base = match start {
        // The window's first instant is itself eligible.
        Some(start) if start > now => start - chrono::Duration::seconds(1),
        _ => now,
    };
    let next = schedule.next_after(base, tz)?;
    match end {
        Some(end) if next > end => None,
        _ => Some(next),
    }
}

// ── Engine ───────────────────────────────────────────────────────────

pub struct SchedulerEngine {
    store: Arc<JobStore>,
    registry: Arc<TriggerRegistry>,
    launcher: Arc<dyn Launcher>,
    rx: mpsc::UnboundedReceiver<JobMutation>,
    table: TriggerTable,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<TriggerRegistry>,
        launcher: Arc<dyn Launcher>,
        rx: mpsc::UnboundedReceiver<JobMutation>,
    ) -> Self {
        Self {
            store,
            registry,
            launcher,
            rx,
            table: TriggerTable::default(),
        }
    }

    /// Seed the trigger table from the store. Called once before `run`.
    pub async fn seed(&mut self) {
        let now = Utc::now();
        let jobs = self.store.all().await;
        let count = jobs.len();
        for job in jobs {
            if let Some(estimate) = self.table.upsert(&job, now) {
                write_estimate(&self.store, &job.id, estimate).await;
            }
        }
        info!(jobs = count, "scheduler seeded from job store");
    }

    /// Drive the scheduler until `shutdown` flips. Drains the mutation
    /// channel, stops accepting new fires, then waits for in-flight fires up
    /// to a bounded grace period.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let SchedulerEngine {
            store,
            registry,
            launcher,
            mut rx,
            mut table,
        } = self;
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut fires: JoinSet<()> = JoinSet::new();
        info!("scheduler engine online");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                mutation = rx.recv() => match mutation {
                    Some(mutation) => apply_mutation(&mut table, &store, mutation).await,
                    None => break,
                },
                _ = interval.tick() => {
                    let now = Utc::now();
                    for order in table.due(now) {
                        debug!(job_id = %order.job_id, scheduled = %order.scheduled, "job due");
                        fires.spawn(run_fire(
                            store.clone(),
                            registry.clone(),
                            launcher.clone(),
                            order,
                        ));
                    }
                    // Reap completed fires so the set does not grow unbounded.
                    while fires.try_join_next().is_some() {}
                },
            }
        }

        // Apply anything already published before we stop.
        while let Ok(mutation) = rx.try_recv() {
            apply_mutation(&mut table, &store, mutation).await;
        }

        if !fires.is_empty() {
            info!(in_flight = fires.len(), "waiting for in-flight fires");
            let drain = async {
                while fires.join_next().await.is_some() {}
            };
            if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
                warn!("shutdown grace period elapsed with fires still running");
            }
        }
        info!("scheduler engine stopped");
    }
}

/// Apply one mutation to the trigger table, in publication order.
async fn apply_mutation(table: &mut TriggerTable, store: &JobStore, mutation: JobMutation) {
    let now = Utc::now();
    debug!(job_id = %mutation.job_id, kind = %mutation.kind, "applying job mutation");
    match mutation.kind {
        MutationKind::Create | MutationKind::Update => match mutation.snapshot {
            Some(ref job) => {
                if let Some(estimate) = table.upsert(job, now) {
                    write_estimate(store, &job.id, estimate).await;
                }
            }
            None => warn!(
                job_id = %mutation.job_id,
                "create/update mutation without snapshot; ignoring"
            ),
        },
        MutationKind::Delete => table.remove(&mutation.job_id),
        MutationKind::Pause => {
            if !table.pause(&mutation.job_id) {
                warn!(job_id = %mutation.job_id, "pause for unknown job");
            }
        }
        MutationKind::Resume => match table.resume(&mutation.job_id, now) {
            Some(estimate) => write_estimate(store, &mutation.job_id, estimate).await,
            None => warn!(job_id = %mutation.job_id, "resume for unknown job"),
        },
    }
}

async fn write_estimate(store: &JobStore, job_id: &str, estimate: Option<DateTime<Utc>>) {
    if let Err(e) = store.record_next_run(job_id, estimate).await {
        warn!(job_id, error = %e, "failed to record next-run estimate");
    }
}

/// One fire: evaluate the trigger, launch, write back run metadata.
///
/// Every failure is logged with the job id and absorbed — the schedule
/// stays active no matter what happens here.
async fn run_fire(
    store: Arc<JobStore>,
    registry: Arc<TriggerRegistry>,
    launcher: Arc<dyn Launcher>,
    order: FireOrder,
) {
    let job = match store.get(&order.job_id).await {
        Ok(job) => job,
        Err(e) => {
            warn!(job_id = %order.job_id, error = %e, "fired job no longer loads; skipping");
            return;
        }
    };
    if job.suspended {
        debug!(job_id = %job.id, "job suspended since tick; skipping fire");
        return;
    }

    let count = match registry.task_count(&job).await {
        Ok(count) => count,
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "trigger evaluation failed; fire skipped");
            if let Err(e) = store
                .record_next_run(&job.id, order.estimated_next_run)
                .await
            {
                warn!(job_id = %job.id, error = %e, "failed to record next-run estimate");
            }
            return;
        }
    };

    let tasks = if count > 0 {
        match launcher
            .launch(&job.task_definition, count, &job.overrides, &job.id)
            .await
        {
            Ok(outcome) => {
                info!(
                    job_id = %job.id,
                    task_definition = %job.task_definition,
                    count,
                    launched = outcome.tasks.len(),
                    failures = outcome.failures.len(),
                    "job fired"
                );
                outcome.tasks
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "task launch failed");
                Vec::new()
            }
        }
    } else {
        info!(job_id = %job.id, "job fired with zero task demand; nothing launched");
        Vec::new()
    };

    if let Err(e) = store
        .record_run(&job.id, order.scheduled, tasks, order.estimated_next_run)
        .await
    {
        warn!(job_id = %job.id, error = %e, "failed to write back run metadata");
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use ecss_core::{ContainerOverride, SchedulerError, TaskInfo, Trigger};
    use ecss_store::MemoryBackend;
    use std::sync::Mutex;

    use crate::dispatch::mutation_channel;
    use crate::launcher::LaunchOutcome;
    use crate::triggers::{queue_scaled_count, TriggerEvaluator};

    fn job(id: &str, schedule: &str) -> Job {
        Job {
            id: id.to_string(),
            task_definition: id.to_string(),
            schedule: schedule.to_string(),
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

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    // ── TriggerTable unit tests ──────────────────────────────────────

    #[test]
    fn test_upsert_computes_next_fire() {
        let mut table = TriggerTable::default();
        let now = at(2030, 6, 1, 12, 0, 0);
        let estimate = table.upsert(&job("a", "30 5"), now).unwrap();
        assert_eq!(estimate, Some(at(2030, 6, 1, 12, 5, 30)));
        assert_eq!(table.next_fire("a"), Some(at(2030, 6, 1, 12, 5, 30)));
    }

    #[test]
    fn test_upsert_replaces_schedule() {
        let mut table = TriggerTable::default();
        let now = at(2030, 6, 1, 12, 0, 0);
        table.upsert(&job("a", "0 30 9"), now);
        let first = table.next_fire("a");
        table.upsert(&job("a", "0 45 10"), now);
        assert_ne!(table.next_fire("a"), first);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_upsert_bad_schedule_unschedules() {
        let mut table = TriggerTable::default();
        let now = at(2030, 6, 1, 12, 0, 0);
        table.upsert(&job("a", "0 30 9"), now);
        assert!(table.upsert(&job("a", "not a schedule"), now).is_none());
        assert!(!table.contains("a"));
    }

    #[test]
    fn test_due_advances_and_fires_once() {
        let mut table = TriggerTable::default();
        let created = at(2030, 6, 1, 12, 0, 0);
        table.upsert(&job("a", "30 5"), created);

        // Not yet due.
        assert!(table.due(at(2030, 6, 1, 12, 5, 29)).is_empty());

        let orders = table.due(at(2030, 6, 1, 12, 5, 30));
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].scheduled, at(2030, 6, 1, 12, 5, 30));
        // "30 5" is second 30 of minute 5, so the next slot is an hour on.
        assert_eq!(orders[0].estimated_next_run, Some(at(2030, 6, 1, 13, 5, 30)));

        // The same instant does not fire twice.
        assert!(table.due(at(2030, 6, 1, 12, 5, 30)).is_empty());
    }

    #[test]
    fn test_missed_instants_are_not_replayed() {
        let mut table = TriggerTable::default();
        table.upsert(&job("a", "30 5"), at(2030, 6, 1, 12, 0, 0));

        // The process was stalled for an hour: exactly one fire comes out,
        // and the next estimate is relative to now, not the backlog.
        let late = at(2030, 6, 1, 13, 2, 0);
        let orders = table.due(late);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].estimated_next_run, Some(at(2030, 6, 1, 13, 5, 30)));
        assert!(table.due(late).is_empty());
    }

    #[test]
    fn test_pause_and_resume_cycle() {
        let mut table = TriggerTable::default();
        let now = at(2030, 6, 1, 12, 0, 0);
        table.upsert(&job("a", "30 5"), now);

        assert!(table.pause("a"));
        assert_eq!(table.is_suspended("a"), Some(true));
        assert!(table.due(at(2030, 6, 1, 12, 5, 30)).is_empty());

        let estimate = table.resume("a", at(2030, 6, 1, 12, 6, 0)).unwrap();
        assert_eq!(estimate, Some(at(2030, 6, 1, 13, 5, 30)));
        assert_eq!(table.due(at(2030, 6, 1, 13, 5, 30)).len(), 1);
    }

    #[test]
    fn test_suspended_job_enters_paused() {
        let mut table = TriggerTable::default();
        let mut suspended = job("a", "30 5");
        suspended.suspended = true;
        table.upsert(&suspended, at(2030, 6, 1, 12, 0, 0));
        assert_eq!(table.is_suspended("a"), Some(true));
        assert!(table.due(at(2030, 6, 1, 12, 5, 30)).is_empty());
    }

    #[test]
    fn test_delete_removes_entry() {
        let mut table = TriggerTable::default();
        table.upsert(&job("a", "30 5"), at(2030, 6, 1, 12, 0, 0));
        table.remove("a");
        assert!(table.is_empty());
        assert!(table.due(at(2030, 6, 1, 12, 5, 30)).is_empty());
    }

    #[test]
    fn test_schedule_window_clips_fires() {
        let mut table = TriggerTable::default();
        let mut windowed = job("a", "0 0 12");
        windowed.schedule_start = Some(at(2030, 6, 10, 0, 0, 0));
        windowed.schedule_end = Some(at(2030, 6, 12, 0, 0, 0));

        let estimate = table.upsert(&windowed, at(2030, 6, 1, 0, 0, 0)).unwrap();
        // First fire waits for the window to open.
        assert_eq!(estimate, Some(at(2030, 6, 10, 12, 0, 0)));

        let orders = table.due(at(2030, 6, 10, 12, 0, 0));
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].estimated_next_run, Some(at(2030, 6, 11, 12, 0, 0)));

        // After the window closes there is no next fire.
        let orders = table.due(at(2030, 6, 11, 12, 0, 0));
        assert_eq!(orders[0].estimated_next_run, None);
    }

    #[test]
    fn test_window_start_instant_is_eligible() {
        let mut table = TriggerTable::default();
        let mut windowed = job("a", "0 0 12");
        windowed.schedule_start = Some(at(2030, 6, 10, 12, 0, 0));
        let estimate = table.upsert(&windowed, at(2030, 6, 1, 0, 0, 0)).unwrap();
        assert_eq!(estimate, Some(at(2030, 6, 10, 12, 0, 0)));
    }

    // ── Engine integration ───────────────────────────────────────────

    struct RecordingLauncher {
        calls: Mutex<Vec<(String, u32)>>,
    }

    impl RecordingLauncher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, u32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Launcher for RecordingLauncher {
        async fn launch(
            &self,
            task_definition: &str,
            count: u32,
            _overrides: &[ContainerOverride],
            _job_id: &str,
        ) -> Result<LaunchOutcome, SchedulerError> {
            self.calls
                .lock()
                .unwrap()
                .push((task_definition.to_string(), count));
            Ok(LaunchOutcome {
                tasks: (0..count)
                    .map(|i| TaskInfo {
                        task_id: format!("arn:task/{i}"),
                        host_id: Some(format!("arn:host/{i}")),
                    })
                    .collect(),
                failures: Vec::new(),
            })
        }
    }

    struct FixedDepth(u64);

    #[async_trait]
    impl TriggerEvaluator for FixedDepth {
        async fn task_count(&self, job: &Job) -> Result<u32, SchedulerError> {
            Ok(queue_scaled_count(job, self.0))
        }
    }

    async fn store() -> Arc<JobStore> {
        Arc::new(JobStore::load(Arc::new(MemoryBackend::default())).await.unwrap())
    }

    #[tokio::test]
    async fn test_mutation_reaches_engine_within_a_dispatch_cycle() {
        let store = store().await;
        let launcher = RecordingLauncher::new();
        let (tx, rx) = mutation_channel();
        let registry = Arc::new(TriggerRegistry::new());
        let engine = SchedulerEngine::new(store.clone(), registry, launcher.clone(), rx);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(shutdown_rx));

        // Create a job that fires far in the future; the observable effect
        // of dispatch is the estimate written back to the store.
        let created = store.create(job("sleeper-task", "0 0 0 * * 1 1")).await.unwrap();
        tx.created(&created);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stored = store.get("sleeper-task").await.unwrap();
        assert!(stored.estimated_next_run.is_some());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(launcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_engine_fires_due_job_and_writes_back() {
        let store = store().await;
        let launcher = RecordingLauncher::new();
        let (_tx, rx) = mutation_channel();
        let registry = Arc::new(TriggerRegistry::new());
        let mut engine = SchedulerEngine::new(store.clone(), registry, launcher.clone(), rx);

        // Fires every second.
        store.create(job("sleeper-task", "*")).await.unwrap();
        engine.seed().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let calls = launcher.calls();
        assert!(!calls.is_empty(), "expected at least one fire");
        assert_eq!(calls[0], ("sleeper-task".to_string(), 1));

        let stored = store.get("sleeper-task").await.unwrap();
        assert!(stored.last_run.is_some());
        assert_eq!(stored.last_run_tasks.len(), 1);
        assert!(stored.estimated_next_run.is_some());
    }

    #[tokio::test]
    async fn test_zero_demand_skips_launcher_but_completes_fire() {
        let store = store().await;
        let launcher = RecordingLauncher::new();
        let (_tx, rx) = mutation_channel();
        let mut registry = TriggerRegistry::new();
        registry.register("sqs", Arc::new(FixedDepth(0)));

        let mut triggered = job("consumer-task", "*");
        triggered.trigger = Some(Trigger {
            kind: "sqs".into(),
            queue_name: Some("q".into()),
            messages_per_task: Some(100),
        });
        let mut engine =
            SchedulerEngine::new(store.clone(), Arc::new(registry), launcher.clone(), rx);
        store.create(triggered).await.unwrap();
        engine.seed().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        // Depth 0: the launcher is never invoked, but the fire completed.
        assert!(launcher.calls().is_empty());
        let stored = store.get("consumer-task").await.unwrap();
        assert!(stored.last_run.is_some());
        assert!(stored.last_run_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_trigger_type_skips_fire_entirely() {
        let store = store().await;
        let launcher = RecordingLauncher::new();
        let (_tx, rx) = mutation_channel();
        let registry = Arc::new(TriggerRegistry::new());

        let mut triggered = job("consumer-task", "*");
        triggered.trigger = Some(Trigger {
            kind: "mystery".into(),
            queue_name: None,
            messages_per_task: None,
        });
        let mut engine = SchedulerEngine::new(store.clone(), registry, launcher.clone(), rx);
        store.create(triggered).await.unwrap();
        engine.seed().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(launcher.calls().is_empty());
        // The fire was skipped: no run metadata was recorded.
        let stored = store.get("consumer-task").await.unwrap();
        assert!(stored.last_run.is_none());
    }
}
