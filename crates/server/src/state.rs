//! Shared application state for the REST surface.

use std::sync::Arc;

use ecss_engine::MutationSender;
use ecss_store::JobStore;

/// Handed to every handler. The store is the only shared persistent
/// resource; scheduler changes travel exclusively through `mutations`.
pub struct AppState {
    pub store: Arc<JobStore>,
    pub mutations: MutationSender,
}
