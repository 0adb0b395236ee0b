mod api;
mod router;
mod startup;
mod state;

use tokio::sync::watch;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use ecss_core::config::{load_dotenv, LogConfig};
use ecss_core::Config;

/// Initialize tracing: stdout always, plus a rotating file when a log
/// folder is configured. The returned guard must stay alive so buffered
/// file output flushes on exit.
fn init_tracing(log: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.level_filter()));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    match log.folder {
        Some(ref folder) => {
            std::fs::create_dir_all(folder)?;
            let appender = tracing_appender::rolling::daily(folder, "app.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .init();
            Ok(None)
        }
    }
}

/// Resolve on SIGINT/SIGTERM and flip the engine's shutdown flag.
async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install SIGINT handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
    let _ = shutdown.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let config = Config::from_env()?;
    let _log_guard = init_tracing(&config.log)?;
    config.log_summary();

    // One scheduler process per logical cluster — fail loudly otherwise.
    let _lock = startup::acquire_scheduler_lock(&config.lock_file)?;

    let (state, engine) = startup::build(&config).await?;
    let app = router::build_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_handle = tokio::spawn(engine.run(shutdown_rx));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("webapi listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await?;

    // In-flight HTTP requests have completed; let the engine drain too.
    let _ = shutdown_tx.send(true);
    engine_handle.await?;
    Ok(())
}
