//! Job backend trait and error types.
//!
//! A backend persists one serialized job record per id. Implementations
//! handle the specifics of a particular storage service; the [`JobStore`]
//! facade owns ordering, pagination, merge semantics, and retries.
//!
//! [`JobStore`]: crate::JobStore

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient I/O failure — the facade retries these once.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Anything else (misconfiguration, malformed service response).
    #[error("{0}")]
    Other(String),
}

/// Capability set every job store backend provides.
///
/// Bodies are the canonical JSON serialization of a job; backends treat them
/// as opaque strings keyed by id.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Create the underlying artifact (file, bucket, table, index) with
    /// reasonable defaults if absent. Pre-existing artifacts are used as-is
    /// and never reshaped.
    async fn bootstrap(&self) -> Result<(), StoreError>;

    /// Every stored `(id, body)` pair.
    async fn load_all(&self) -> Result<Vec<(String, String)>, StoreError>;

    /// The body stored for `id`, if any.
    async fn get(&self, id: &str) -> Result<Option<String>, StoreError>;

    /// Insert or replace the body stored for `id`.
    async fn put(&self, id: &str, body: &str) -> Result<(), StoreError>;

    /// Remove the record for `id`. Deleting an absent id is not an error.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}
