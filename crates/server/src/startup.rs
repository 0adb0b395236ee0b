//! Startup wiring: backend bootstrap, scheduler construction, and the
//! single-process advisory lock.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use fs2::FileExt;
use tracing::info;

use ecss_core::Config;
use ecss_engine::{mutation_channel, EcsTaskLauncher, Launcher, SchedulerEngine, TriggerRegistry};
use ecss_store::JobStore;

use crate::state::AppState;

/// Holds the advisory lock for the life of the process.
pub struct SchedulerLock {
    _file: std::fs::File,
}

/// Enforce one scheduler process per logical cluster.
///
/// A second process fails loudly here instead of silently double-firing
/// jobs against the same orchestrator.
pub fn acquire_scheduler_lock(path: &Path) -> anyhow::Result<SchedulerLock> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("cannot open lock file {}", path.display()))?;
    file.try_lock_exclusive().with_context(|| {
        format!(
            "another scheduler process already holds {}; refusing to start",
            path.display()
        )
    })?;

    // Record our pid now that we hold the lock.
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    info!(lock = %path.display(), "scheduler process lock acquired");
    Ok(SchedulerLock { _file: file })
}

/// Select and bootstrap the store backend, seed the scheduler, and wire the
/// mutation channel between them.
pub async fn build(config: &Config) -> anyhow::Result<(Arc<AppState>, SchedulerEngine)> {
    let backend = ecss_store::select_backend(config).await?;
    backend
        .bootstrap()
        .await
        .with_context(|| format!("bootstrap of {} backend failed", backend.name()))?;

    let store = Arc::new(JobStore::load(backend).await?);
    let registry = Arc::new(TriggerRegistry::with_builtins(&config.aws).await);
    let launcher: Arc<dyn Launcher> = Arc::new(
        EcsTaskLauncher::new(&config.ecs_cluster, &config.started_by, &config.aws).await,
    );

    let (mutations, rx) = mutation_channel();
    let mut engine = SchedulerEngine::new(store.clone(), registry, launcher, rx);
    engine.seed().await;

    let state = Arc::new(AppState { store, mutations });
    Ok((state, engine))
}

// ── Tests ────────────────────────────────────────────────────────────
