use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.stage-engine/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub hosting: HostingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            store: StoreConfig::default(),
            process: ProcessConfig::default(),
            health: HealthConfig::default(),
            git: GitConfig::default(),
            hosting: HostingConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `~/.stage-engine/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stage-engine")
            .join("config.toml")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// Settings for the Store (`eng-store`): where the databases live and how
/// they're tuned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_app_db_path")]
    pub app_db_path: String,
    #[serde(default = "default_project_db_dir")]
    pub project_db_dir: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            app_db_path: default_app_db_path(),
            project_db_dir: default_project_db_dir(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_app_db_path() -> String {
    "~/.stage-engine/app.db".into()
}
fn default_project_db_dir() -> String {
    "~/.stage-engine/data".into()
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Settings for the Process Supervisor (`eng-process`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,
    #[serde(default = "default_event_buffer")]
    pub event_buffer_size: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            agent_binary: default_agent_binary(),
            event_buffer_size: default_event_buffer(),
        }
    }
}

fn default_agent_binary() -> String {
    "agent".into()
}
fn default_event_buffer() -> usize {
    256
}

/// Settings for the Health Monitor (`eng-process::health`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_ms(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
        }
    }
}

fn default_poll_ms() -> u64 {
    5_000
}
fn default_inactivity_timeout_ms() -> u64 {
    10 * 60 * 1000
}

/// Settings for the Git Adapter (`eng-git`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_worktree_dirname")]
    pub worktree_dirname: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            worktree_dirname: default_worktree_dirname(),
        }
    }
}

fn default_worktree_dirname() -> String {
    ".stagehand-worktrees".into()
}

/// Settings for the Hosting Adapter retry policy (`eng-git::hosting`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostingConfig {
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub owner_env: Option<String>,
    #[serde(default)]
    pub repo_env: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub pr_poll_interval_ms: u64,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            token_env: None,
            owner_env: None,
            repo_env: None,
            max_retries: default_max_retries(),
            pr_poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_poll_interval_ms() -> u64 {
    60_000
}
