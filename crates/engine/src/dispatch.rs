//! Mutation channel between the REST surface and the scheduler engine.
//!
//! API handlers never touch the scheduler's trigger table directly. After a
//! successful store write they publish a [`JobMutation`] onto an in-process,
//! single-consumer channel; the engine applies mutations in publication
//! order, so persistence and scheduling cannot drift.

use std::fmt;

use tokio::sync::mpsc;
use tracing::warn;

use ecss_core::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    Pause,
    Resume,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Pause => "pause",
            Self::Resume => "resume",
        };
        f.write_str(label)
    }
}

/// One change to propagate into the engine's trigger table.
#[derive(Debug, Clone)]
pub struct JobMutation {
    pub kind: MutationKind,
    pub job_id: String,
    /// The stored record after the write; carried for create/update so the
    /// engine never has to re-read the store mid-dispatch.
    pub snapshot: Option<Job>,
}

/// Build the single-consumer mutation channel.
pub fn mutation_channel() -> (MutationSender, mpsc::UnboundedReceiver<JobMutation>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MutationSender { tx }, rx)
}

/// Publisher half, cloned into every API handler.
#[derive(Clone)]
pub struct MutationSender {
    tx: mpsc::UnboundedSender<JobMutation>,
}

impl MutationSender {
    pub fn created(&self, job: &Job) {
        self.publish(JobMutation {
            kind: MutationKind::Create,
            job_id: job.id.clone(),
            snapshot: Some(job.clone()),
        });
    }

    pub fn updated(&self, job: &Job) {
        self.publish(JobMutation {
            kind: MutationKind::Update,
            job_id: job.id.clone(),
            snapshot: Some(job.clone()),
        });
    }

    pub fn deleted(&self, job_id: &str) {
        self.publish(JobMutation {
            kind: MutationKind::Delete,
            job_id: job_id.to_string(),
            snapshot: None,
        });
    }

    pub fn paused(&self, job_id: &str) {
        self.publish(JobMutation {
            kind: MutationKind::Pause,
            job_id: job_id.to_string(),
            snapshot: None,
        });
    }

    pub fn resumed(&self, job_id: &str) {
        self.publish(JobMutation {
            kind: MutationKind::Resume,
            job_id: job_id.to_string(),
            snapshot: None,
        });
    }

    fn publish(&self, mutation: JobMutation) {
        if let Err(e) = self.tx.send(mutation) {
            // Only happens during shutdown, after the engine stopped.
            warn!(
                job_id = %e.0.job_id,
                kind = %e.0.kind,
                "scheduler is gone; dropping job mutation"
            );
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

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

    #[tokio::test]
    async fn test_mutations_arrive_in_publication_order() {
        let (tx, mut rx) = mutation_channel();
        tx.created(&job("a"));
        tx.paused("a");
        tx.resumed("a");
        tx.updated(&job("a"));
        tx.deleted("a");

        let kinds: Vec<MutationKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                MutationKind::Create,
                MutationKind::Pause,
                MutationKind::Resume,
                MutationKind::Update,
                MutationKind::Delete,
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot_carried_for_writes_only() {
        let (tx, mut rx) = mutation_channel();
        tx.created(&job("a"));
        tx.deleted("a");

        let create = rx.recv().await.unwrap();
        assert!(create.snapshot.is_some());
        let delete = rx.recv().await.unwrap();
        assert!(delete.snapshot.is_none());
    }

    #[tokio::test]
    async fn test_publish_after_receiver_dropped_does_not_panic() {
        let (tx, rx) = mutation_channel();
        drop(rx);
        tx.created(&job("a"));
        tx.deleted("a");
    }
}
