//! Canonical job record and nested types.
//!
//! A job is the persisted scheduling document for one orchestrator task
//! template. The wire representation is camelCase JSON; the serialization of
//! [`Job`] is exactly what every store backend persists, one record per id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;

pub const MIN_TASKS: u32 = 1;
pub const MAX_TASKS: u32 = 50;

/// A persisted scheduling record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub task_definition: String,
    /// 8-field schedule expression with all wildcards resolved.
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub task_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<ContainerOverride>,
    /// Engine-managed: when the job last fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// Engine-managed: tasks started by the last fire.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_run_tasks: Vec<TaskInfo>,
    /// Engine-managed: next fire instant derived from the schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_next_run: Option<DateTime<Utc>>,
}

impl Job {
    /// Upper bound on tasks per fire: `maxCount` capped at the global limit.
    pub fn launch_cap(&self) -> u32 {
        self.max_count.unwrap_or(MAX_TASKS).min(MAX_TASKS)
    }

    /// The zone the schedule is interpreted in (UTC when unset).
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone
            .as_deref()
            .and_then(|name| name.parse().ok())
            .unwrap_or(chrono_tz::UTC)
    }

    /// Cross-field constraints that must hold for any stored record.
    pub fn check_invariants(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if let Some(max) = self.max_count {
            if self.task_count > max {
                errors.push(
                    "maxCount",
                    format!(
                        "must be greater than or equal to taskCount ({})",
                        self.task_count
                    ),
                );
            }
        }
        if let (Some(start), Some(end)) = (self.schedule_start, self.schedule_end) {
            if end < start {
                errors.push("scheduleEnd", "must not precede scheduleStart");
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Optional fan-out/gating condition evaluated at fire time.
///
/// The body is closed: unknown fields are rejected at validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_per_task: Option<u32>,
}

/// Per-container environment overrides passed through to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerOverride {
    pub container_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

/// Identifiers of one task started by a fire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
}

/// A validated partial update. `None` fields leave prior values untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub task_definition: Option<String>,
    pub schedule: Option<String>,
    pub schedule_start: Option<DateTime<Utc>>,
    pub schedule_end: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
    pub task_count: Option<u32>,
    pub max_count: Option<u32>,
    pub trigger: Option<Trigger>,
    pub suspended: Option<bool>,
    pub overrides: Option<Vec<ContainerOverride>>,
}

impl JobPatch {
    /// Merge into an existing record, producing the updated job.
    pub fn apply(&self, current: &Job) -> Job {
        let mut job = current.clone();
        if let Some(ref v) = self.task_definition {
            job.task_definition = v.clone();
        }
        if let Some(ref v) = self.schedule {
            job.schedule = v.clone();
        }
        if let Some(v) = self.schedule_start {
            job.schedule_start = Some(v);
        }
        if let Some(v) = self.schedule_end {
            job.schedule_end = Some(v);
        }
        if let Some(ref v) = self.timezone {
            job.timezone = Some(v.clone());
        }
        if let Some(v) = self.task_count {
            job.task_count = v;
        }
        if let Some(v) = self.max_count {
            job.max_count = Some(v);
        }
        if let Some(ref v) = self.trigger {
            job.trigger = Some(v.clone());
        }
        if let Some(v) = self.suspended {
            job.suspended = v;
        }
        if let Some(ref v) = self.overrides {
            job.overrides = v.clone();
        }
        job
    }

    /// When this patch's only effective change is the `suspended` flag,
    /// return its new value. Used to publish pause/resume mutations instead
    /// of a full update.
    pub fn suspension_only(&self, current: &Job) -> Option<bool> {
        let unchanged = self
            .task_definition
            .as_ref()
            .map_or(true, |v| *v == current.task_definition)
            && self
                .schedule
                .as_ref()
                .map_or(true, |v| *v == current.schedule)
            && self
                .schedule_start
                .map_or(true, |v| Some(v) == current.schedule_start)
            && self
                .schedule_end
                .map_or(true, |v| Some(v) == current.schedule_end)
            && self
                .timezone
                .as_ref()
                .map_or(true, |v| Some(v) == current.timezone.as_ref())
            && self.task_count.map_or(true, |v| v == current.task_count)
            && self
                .max_count
                .map_or(true, |v| Some(v) == current.max_count)
            && self
                .trigger
                .as_ref()
                .map_or(true, |v| Some(v) == current.trigger.as_ref())
            && self
                .overrides
                .as_ref()
                .map_or(true, |v| *v == current.overrides);
        match self.suspended {
            Some(flag) if unchanged && flag != current.suspended => Some(flag),
            _ => None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
