use std::path::PathBuf;

use sparkq_db::Db;
use sparkq_services::services::config::ConfigHandle;
use sparkq_services::services::lifecycle::Engine;
use tokio_util::sync::CancellationToken;

/// Dev mode serves assets uncached; production pins hashed assets forever
/// and enforces the UI/server build-version invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Dev,
    Production,
}

impl ServerMode {
    /// `SPARKQ_ENV=production` selects production; anything else is dev.
    pub fn from_env() -> Self {
        match std::env::var("SPARKQ_ENV").as_deref() {
            Ok("production") => ServerMode::Production,
            _ => ServerMode::Dev,
        }
    }
}

/// Everything a request handler can reach, threaded through axum state.
#[derive(Clone)]
pub struct AppState {
    db: Db,
    engine: Engine,
    config: ConfigHandle,
    build_id: String,
    ui_build_id: Option<String>,
    mode: ServerMode,
    assets_dir: Option<PathBuf>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        db: Db,
        config: ConfigHandle,
        mode: ServerMode,
        assets_dir: Option<PathBuf>,
        shutdown: CancellationToken,
    ) -> Self {
        let ui_build_id = assets_dir.as_ref().and_then(|dir| {
            std::fs::read_to_string(dir.join("version.txt"))
                .ok()
                .map(|s| s.trim().to_string())
        });
        Self {
            engine: Engine::new(db.clone()),
            db,
            config,
            build_id: env!("CARGO_PKG_VERSION").to_string(),
            ui_build_id,
            mode,
            assets_dir,
            shutdown,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn ui_build_id(&self) -> Option<&str> {
        self.ui_build_id.as_deref()
    }

    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    pub fn assets_dir(&self) -> Option<&PathBuf> {
        self.assets_dir.as_ref()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}
