//! Scheduler error taxonomy.
//!
//! One enum covers every failure the core can surface; `status_code()` maps
//! each kind to the HTTP status the REST layer responds with. Launch and
//! trigger failures never reach HTTP — they are absorbed by the engine so a
//! bad job cannot stop the scheduler.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Job {0} does not exist")]
    NotFound(String),

    #[error("Job {0} already exists")]
    AlreadyExists(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("stored record {id} is corrupt: {reason}")]
    BackendCorrupt { id: String, reason: String },

    #[error("launch error: {0}")]
    Launch(String),

    #[error("trigger error: {0}")]
    Trigger(String),

    #[error("{0}")]
    Internal(String),
}

impl SchedulerError {
    /// Map to an HTTP status code for API responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 422,
            Self::NotFound(_) => 404,
            Self::AlreadyExists(_) => 409,
            Self::BackendUnavailable(_) => 503,
            Self::BackendCorrupt { .. } => 500,
            Self::Launch(_) | Self::Trigger(_) | Self::Internal(_) => 500,
        }
    }

    /// Field-level detail for validation failures, `None` otherwise.
    pub fn field_errors(&self) -> Option<&BTreeMap<String, Vec<String>>> {
        match self {
            Self::Validation(errors) => Some(&errors.0),
            _ => None,
        }
    }
}

/// Aggregated field-level validation errors.
///
/// Every offending field is reported with all of its reasons so a single
/// response covers the whole document.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ValidationErrors(pub BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reason against a field.
    pub fn push(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(reason.into());
    }

    /// Absorb another set of errors, prefixing nothing.
    pub fn extend(&mut self, other: ValidationErrors) {
        for (field, reasons) in other.0 {
            self.0.entry(field).or_default().extend(reasons);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convert into a result: `Ok(value)` when no errors were recorded.
    pub fn into_result<T>(self, value: T) -> Result<T, SchedulerError> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(SchedulerError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, reasons) in &self.0 {
            for reason in reasons {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{}: {}", field, reason)?;
                first = false;
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
