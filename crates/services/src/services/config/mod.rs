pub mod types;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;

pub use types::*;

pub const CONFIG_ENV_VAR: &str = "SPARKQ_CONFIG";
pub const CONFIG_FILE_NAME: &str = "sparkq.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {} does not exist", .0.display())]
    MissingEnvPath(PathBuf),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml_ng::Error,
    },
}

/// A parsed configuration document plus where it came from. Immutable once
/// constructed; `reload` builds a fresh one and swaps the shared reference.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: SparkqConfig,
    /// The file the document came from. None when no config file was found
    /// and defaults are in effect.
    pub source_path: Option<PathBuf>,
    /// Directory that relative paths inside the document resolve against.
    pub base_dir: PathBuf,
}

impl LoadedConfig {
    /// Locate and load the active configuration: `SPARKQ_CONFIG` if set,
    /// else `sparkq.yml` in the working directory, else the nearest
    /// `sparkq.yml` up the directory tree. First match wins.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(env_path);
            if !path.exists() {
                return Err(ConfigError::MissingEnvPath(path));
            }
            return Self::load_from(&path);
        }

        let cwd = std::env::current_dir().map_err(|source| ConfigError::Io {
            path: PathBuf::from("."),
            source,
        })?;
        match discover(&cwd) {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::defaults_in(cwd)),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SparkqConfig =
            serde_yaml_ng::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            config,
            source_path: Some(path.to_path_buf()),
            base_dir,
        })
    }

    pub fn defaults_in(base_dir: PathBuf) -> Self {
        Self {
            config: SparkqConfig::default(),
            source_path: None,
            base_dir,
        }
    }

    /// Resolve a path from the document against the config file directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.config.database.path)
    }

    /// Directory holding the database; runner lockfiles and the instance
    /// lock live next to it.
    pub fn data_dir(&self) -> PathBuf {
        self.database_path()
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_dir.clone())
    }

    pub fn runner_lock_dir(&self) -> PathBuf {
        self.data_dir().join("runners")
    }
}

/// `sparkq.yml` in `start`, else the nearest one up the ancestor chain.
fn discover(start: &Path) -> Option<PathBuf> {
    start.ancestors().map(|dir| dir.join(CONFIG_FILE_NAME)).find(|c| c.is_file())
}

/// Shared, swappable configuration reference. Readers get a cheap
/// `Arc<LoadedConfig>` snapshot; reload swaps the slot atomically.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<LoadedConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: LoadedConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn get(&self) -> Arc<LoadedConfig> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Re-read the active document and swap it in. The old snapshot stays
    /// valid for readers that already hold it.
    pub fn reload(&self) -> Result<Arc<LoadedConfig>, ConfigError> {
        let current_source = self.get().source_path.clone();
        let fresh = match current_source {
            Some(path) => LoadedConfig::load_from(&path)?,
            None => LoadedConfig::load()?,
        };
        let fresh = Arc::new(fresh);
        match self.inner.write() {
            Ok(mut guard) => *guard = fresh.clone(),
            Err(poisoned) => *poisoned.into_inner() = fresh.clone(),
        }
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparkq_db::models::task::TaskClass;

    const SAMPLE: &str = r#"
project:
  name: demo
server:
  host: 127.0.0.1
  port: 6001
database:
  path: data/sparkq.db
purge:
  older_than_days: 7
queue_runner:
  poll_interval: 5
  auto_fail_interval_seconds: 2
  base_url: http://127.0.0.1:6001
task_classes:
  FAST_SCRIPT:
    timeout: 60
  LLM_HEAVY:
    timeout: 2400
tools:
  run_script:
    task_class: FAST_SCRIPT
    description: Run a repo script
"#;

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn parses_document_and_resolves_relative_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(dir.path(), SAMPLE);

        let loaded = LoadedConfig::load_from(&path).unwrap();
        assert_eq!(loaded.config.project.name, "demo");
        assert_eq!(loaded.config.server.port, 6001);
        assert_eq!(loaded.config.purge.older_than_days, 7);
        assert_eq!(loaded.database_path(), dir.path().join("data/sparkq.db"));
        assert_eq!(loaded.data_dir(), dir.path().join("data"));
    }

    #[test]
    fn class_timeouts_fall_back_to_builtins() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(dir.path(), SAMPLE);
        let loaded = LoadedConfig::load_from(&path).unwrap();

        assert_eq!(loaded.config.timeout_for_class(TaskClass::FastScript), 60);
        assert_eq!(loaded.config.timeout_for_class(TaskClass::LlmHeavy), 2400);
        // Not overridden: built-in defaults.
        assert_eq!(loaded.config.timeout_for_class(TaskClass::MediumScript), 600);
        assert_eq!(loaded.config.timeout_for_class(TaskClass::LlmLite), 480);
    }

    #[test]
    fn tool_mapping_resolves_class() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(dir.path(), SAMPLE);
        let loaded = LoadedConfig::load_from(&path).unwrap();

        assert_eq!(
            loaded.config.class_for_tool("run_script"),
            Some(TaskClass::FastScript)
        );
        assert_eq!(loaded.config.class_for_tool("unknown"), None);
    }

    #[test]
    fn missing_file_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let loaded = LoadedConfig::defaults_in(dir.path().to_path_buf());
        assert_eq!(loaded.config.server.port, 5005);
        assert_eq!(loaded.config.purge.older_than_days, 3);
        assert_eq!(loaded.config.queue_runner.poll_interval, 30);
        assert_eq!(loaded.database_path(), dir.path().join("sparkq.db"));
    }

    #[test]
    fn discover_walks_up_from_nested_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        write_config(dir.path(), SAMPLE);
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = discover(&nested).unwrap();
        assert_eq!(found, dir.path().join(CONFIG_FILE_NAME));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(dir.path(), "serverr:\n  port: 1\n");
        assert!(matches!(
            LoadedConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn reload_swaps_the_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(dir.path(), SAMPLE);
        let handle = ConfigHandle::new(LoadedConfig::load_from(&path).unwrap());
        assert_eq!(handle.get().config.server.port, 6001);

        write_config(dir.path(), "server:\n  port: 7001\n");
        let old = handle.get();
        handle.reload().unwrap();
        assert_eq!(handle.get().config.server.port, 7001);
        // Snapshots taken before the reload are unaffected.
        assert_eq!(old.config.server.port, 6001);
    }
}
