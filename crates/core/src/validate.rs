//! Request document validation.
//!
//! Turns raw JSON documents into canonical records, aggregating every
//! field-level problem into one response. Unknown top-level fields are
//! ignored; closed nested structures (trigger body, override entry) reject
//! unknown fields. Engine-managed fields are stripped silently — clients may
//! send them, they are never honored.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{SchedulerError, ValidationErrors};
use crate::job::{ContainerOverride, Job, JobPatch, Trigger, MAX_TASKS, MIN_TASKS};
use crate::schedule::{resolve_wildcards, Schedule};

const MAX_ID_LEN: usize = 64;
const MAX_TASK_DEFINITION_LEN: usize = 255;

/// Validate a create document into a canonical [`Job`].
///
/// The id falls back to `taskDefinition` when not given explicitly; the
/// schedule has its wildcards resolved so the returned record is exactly
/// what gets persisted.
pub fn validate_create(body: &Value) -> Result<Job, SchedulerError> {
    let mut errors = ValidationErrors::new();
    let map = match body.as_object() {
        Some(map) => map,
        None => {
            errors.push("body", "must be a JSON object");
            return Err(SchedulerError::Validation(errors));
        }
    };

    let task_definition = match string_field(map, "taskDefinition", &mut errors) {
        Some(value) => {
            check_task_definition(&value, "taskDefinition", &mut errors);
            value
        }
        None => {
            errors.push("taskDefinition", "is required");
            String::new()
        }
    };

    // Explicit id wins; otherwise the task definition doubles as the id.
    let (id, id_field) = match string_field(map, "id", &mut errors) {
        Some(id) => (id, "id"),
        None => (task_definition.clone(), "taskDefinition"),
    };
    check_id(&id, id_field, &mut errors);

    let schedule = match string_field(map, "schedule", &mut errors) {
        Some(raw) => resolve_and_check_schedule(&raw, &mut errors),
        None => {
            errors.push("schedule", "is required");
            String::new()
        }
    };

    let job = Job {
        id,
        task_definition,
        schedule,
        schedule_start: datetime_field(map, "scheduleStart", &mut errors),
        schedule_end: datetime_field(map, "scheduleEnd", &mut errors),
        timezone: timezone_field(map, &mut errors),
        task_count: count_field(map, "taskCount", &mut errors).unwrap_or(MIN_TASKS),
        max_count: count_field(map, "maxCount", &mut errors),
        trigger: trigger_field(map, &mut errors),
        suspended: bool_field(map, "suspended", &mut errors).unwrap_or(false),
        overrides: overrides_field(map, &mut errors).unwrap_or_default(),
        last_run: None,
        last_run_tasks: Vec::new(),
        estimated_next_run: None,
    };

    if errors.is_empty() {
        if let Err(relation_errors) = job.check_invariants() {
            errors.extend(relation_errors);
        }
    }
    errors.into_result(job)
}

/// Validate an update document into a [`JobPatch`].
///
/// Every field is optional; an `id` in the body is ignored (ids are
/// immutable), as are the engine-managed fields.
pub fn validate_update(body: &Value) -> Result<JobPatch, SchedulerError> {
    let mut errors = ValidationErrors::new();
    let map = match body.as_object() {
        Some(map) => map,
        None => {
            errors.push("body", "must be a JSON object");
            return Err(SchedulerError::Validation(errors));
        }
    };

    let task_definition = string_field(map, "taskDefinition", &mut errors).map(|value| {
        check_task_definition(&value, "taskDefinition", &mut errors);
        value
    });

    let schedule = string_field(map, "schedule", &mut errors)
        .map(|raw| resolve_and_check_schedule(&raw, &mut errors));

    let patch = JobPatch {
        task_definition,
        schedule,
        schedule_start: datetime_field(map, "scheduleStart", &mut errors),
        schedule_end: datetime_field(map, "scheduleEnd", &mut errors),
        timezone: timezone_field(map, &mut errors),
        task_count: count_field(map, "taskCount", &mut errors),
        max_count: count_field(map, "maxCount", &mut errors),
        trigger: trigger_field(map, &mut errors),
        suspended: bool_field(map, "suspended", &mut errors),
        overrides: overrides_field(map, &mut errors),
    };

    errors.into_result(patch)
}

// ── Field checks ─────────────────────────────────────────────────────

fn check_id(id: &str, field: &str, errors: &mut ValidationErrors) {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        errors.push(field, format!("id must be 1-{} characters", MAX_ID_LEN));
        return;
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        errors.push(
            field,
            "id may only contain letters, digits, underscores, and dashes",
        );
    }
}

fn check_task_definition(value: &str, field: &str, errors: &mut ValidationErrors) {
    if value.is_empty() || value.len() > MAX_TASK_DEFINITION_LEN {
        errors.push(
            field,
            format!("must be 1-{} characters", MAX_TASK_DEFINITION_LEN),
        );
    }
    if value.contains(':') {
        errors.push(field, "task definition names cannot contain revision numbers");
    }
}

/// Resolve `?` wildcards and validate the resulting expression. The resolved
/// string is what callers persist.
fn resolve_and_check_schedule(raw: &str, errors: &mut ValidationErrors) -> String {
    match resolve_wildcards(raw) {
        Ok(resolved) => {
            if let Err(reasons) = Schedule::parse(&resolved) {
                for reason in reasons {
                    errors.push("schedule", reason);
                }
            }
            resolved
        }
        Err(reasons) => {
            for reason in reasons {
                errors.push("schedule", reason);
            }
            raw.to_string()
        }
    }
}

// ── Typed extraction helpers ─────────────────────────────────────────

fn string_field(map: &Map<String, Value>, key: &str, errors: &mut ValidationErrors) -> Option<String> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.push(key, "must be a string");
            None
        }
    }
}

fn bool_field(map: &Map<String, Value>, key: &str, errors: &mut ValidationErrors) -> Option<bool> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => {
            errors.push(key, "must be a boolean");
            None
        }
    }
}

fn count_field(map: &Map<String, Value>, key: &str, errors: &mut ValidationErrors) -> Option<u32> {
    let value = match map.get(key) {
        None | Some(Value::Null) => return None,
        Some(Value::Number(n)) => n.as_i64(),
        Some(_) => {
            errors.push(key, "must be an integer");
            return None;
        }
    };
    match value {
        Some(n) if (MIN_TASKS as i64..=MAX_TASKS as i64).contains(&n) => Some(n as u32),
        _ => {
            errors.push(
                key,
                format!("must be an integer between {} and {}", MIN_TASKS, MAX_TASKS),
            );
            None
        }
    }
}

/// ISO-8601 timestamps; a missing offset is interpreted as UTC.
fn datetime_field(
    map: &Map<String, Value>,
    key: &str,
    errors: &mut ValidationErrors,
) -> Option<DateTime<Utc>> {
    let raw = string_field(map, key, errors)?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    errors.push(key, format!("'{}' is not an ISO-8601 timestamp", raw));
    None
}

fn timezone_field(map: &Map<String, Value>, errors: &mut ValidationErrors) -> Option<String> {
    let name = string_field(map, "timezone", errors)?;
    if name.parse::<chrono_tz::Tz>().is_err() {
        errors.push("timezone", format!("unknown timezone '{}'", name));
        return None;
    }
    Some(name)
}

fn trigger_field(map: &Map<String, Value>, errors: &mut ValidationErrors) -> Option<Trigger> {
    let value = match map.get("trigger") {
        None | Some(Value::Null) => return None,
        Some(v) => v,
    };
    let trigger: Trigger = match serde_json::from_value(value.clone()) {
        Ok(t) => t,
        Err(e) => {
            errors.push("trigger", e.to_string());
            return None;
        }
    };
    if trigger.kind.is_empty() {
        errors.push("trigger", "type is required");
    }
    if trigger.kind == "sqs" && trigger.queue_name.as_deref().map_or(true, str::is_empty) {
        errors.push("trigger", "sqs trigger type requires \"queueName\" field");
    }
    if trigger.messages_per_task == Some(0) {
        errors.push("trigger", "messagesPerTask must be at least 1");
    }
    Some(trigger)
}

fn overrides_field(
    map: &Map<String, Value>,
    errors: &mut ValidationErrors,
) -> Option<Vec<ContainerOverride>> {
    let value = match map.get("overrides") {
        None | Some(Value::Null) => return None,
        Some(v) => v,
    };
    let overrides: Vec<ContainerOverride> = match serde_json::from_value(value.clone()) {
        Ok(list) => list,
        Err(e) => {
            errors.push("overrides", e.to_string());
            return None;
        }
    };
    let mut seen = std::collections::BTreeSet::new();
    for entry in &overrides {
        if entry.container_name.is_empty() {
            errors.push("overrides", "containerName is required");
        }
        if !seen.insert(entry.container_name.as_str()) {
            errors.push(
                "overrides",
                format!("duplicate containerName '{}'", entry.container_name),
            );
        }
    }
    Some(overrides)
}

// ── Tests ────────────────────────────────────────────────────────────
