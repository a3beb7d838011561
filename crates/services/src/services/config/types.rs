use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sparkq_db::models::task::TaskClass;

/// The `sparkq.yml` document. Every section is optional; defaults below
/// keep a missing file equivalent to an empty one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SparkqConfig {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub purge: PurgeConfig,
    #[serde(default)]
    pub queue_runner: QueueRunnerConfig,
    #[serde(default)]
    pub task_classes: BTreeMap<TaskClass, TaskClassConfig>,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolConfig>,
    /// Directories scanned for script metadata; external to the core and
    /// passed through to tooling untouched.
    #[serde(default)]
    pub script_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default = "default_project_name")]
    pub name: String,
    pub repo_path: Option<PathBuf>,
    pub prd_path: Option<PathBuf>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: default_project_name(),
            repo_path: None,
            prd_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PurgeConfig {
    #[serde(default = "default_purge_days")]
    pub older_than_days: i64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            older_than_days: default_purge_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueRunnerConfig {
    /// Seconds between runner polls.
    #[serde(default = "default_interval")]
    pub poll_interval: u64,
    /// Seconds between janitor ticks.
    #[serde(default = "default_interval")]
    pub auto_fail_interval_seconds: u64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for QueueRunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_interval(),
            auto_fail_interval_seconds: default_interval(),
            base_url: default_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskClassConfig {
    pub timeout: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    pub task_class: TaskClass,
    pub description: Option<String>,
}

fn default_project_name() -> String {
    "sparkq".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5005
}

fn default_database_path() -> PathBuf {
    PathBuf::from("sparkq.db")
}

fn default_purge_days() -> i64 {
    3
}

fn default_interval() -> u64 {
    30
}

fn default_base_url() -> String {
    "http://127.0.0.1:5005".to_string()
}

impl SparkqConfig {
    /// Effective timeout for a class: configured override, else the
    /// built-in default for that class.
    pub fn timeout_for_class(&self, class: TaskClass) -> i64 {
        if let Some(entry) = self.task_classes.get(&class) {
            return entry.timeout;
        }
        match class {
            TaskClass::FastScript => 120,
            TaskClass::MediumScript => 600,
            TaskClass::LlmLite => 480,
            TaskClass::LlmHeavy => 1200,
        }
    }

    /// Class a tool maps to, when the config declares one.
    pub fn class_for_tool(&self, tool_name: &str) -> Option<TaskClass> {
        self.tools.get(tool_name).map(|t| t.task_class)
    }
}
