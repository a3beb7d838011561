use std::path::PathBuf;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use sparkq_db::Db;
use sparkq_services::services::config::{ConfigHandle, LoadedConfig};
use sparkq_services::services::janitor::{run_purge_janitor, run_stale_janitor, JanitorSettings};
use sparkq_services::services::lifecycle::Engine;
use sparkq_services::services::lock::PidLock;
use tokio_util::sync::CancellationToken;

use crate::routes::{admin, assets, health, queues, sessions, tasks};
use crate::state::{AppState, ServerMode};

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/version", get(health::version))
        .route("/reload", post(admin::reload))
        .route("/shutdown", post(admin::shutdown))
        .nest("/sessions", sessions::router())
        .nest("/queues", queues::router())
        .nest("/tasks", tasks::router());

    Router::new()
        .route("/health", get(health::health))
        .nest("/api", api)
        .merge(assets::router())
        .with_state(state)
}

/// Boot the service: instance lock, migrations, janitors, HTTP listener.
/// Returns once a graceful shutdown has drained in-flight requests and
/// stopped the janitors.
pub async fn serve(loaded: LoadedConfig) -> anyhow::Result<()> {
    let data_dir = loaded.data_dir();
    // One service instance per database.
    let _instance_lock = PidLock::acquire(&data_dir, "sparkq-server")?;

    let db = Db::connect(&loaded.database_path()).await?;
    let shutdown = CancellationToken::new();
    let engine = Engine::new(db.clone());

    let janitor_settings = JanitorSettings {
        interval: Duration::from_secs(loaded.config.queue_runner.auto_fail_interval_seconds),
        purge_older_than_days: loaded.config.purge.older_than_days,
    };
    let stale_janitor = tokio::spawn(run_stale_janitor(
        engine.clone(),
        janitor_settings,
        shutdown.clone(),
    ));
    let purge_janitor = tokio::spawn(run_purge_janitor(
        engine,
        janitor_settings,
        shutdown.clone(),
    ));

    let host = loaded.config.server.host.clone();
    let port = loaded.config.server.port;
    let assets_dir = resolve_assets_dir(&loaded);
    let state = AppState::new(
        db,
        ConfigHandle::new(loaded),
        ServerMode::from_env(),
        assets_dir,
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    tracing::info!("sparkq listening on {}", listener.local_addr()?);

    let token = shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = termination_signal() => {}
            }
        })
        .await?;

    // Janitors finish their in-flight tick and exit.
    shutdown.cancel();
    let _ = stale_janitor.await;
    let _ = purge_janitor.await;
    tracing::info!("sparkq stopped");
    Ok(())
}

fn resolve_assets_dir(loaded: &LoadedConfig) -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("SPARKQ_ASSETS_DIR") {
        return Some(PathBuf::from(dir));
    }
    let default = loaded.base_dir.join("ui/dist");
    default.is_dir().then_some(default)
}

async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
