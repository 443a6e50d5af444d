//! Configuration system for Trellis recipes.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config -> environment variables -> explicit overrides.

use crate::checkpoint::atomic_write;
use crate::device::Device;
use crate::error::{RecipeError, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration of a recipe run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Run the evaluation sub-loop every this many iterations.
    #[serde(default = "default_test_every")]
    pub test_every: u64,
    /// Emit metrics every this many iterations; `<= 0` logs at epoch end only.
    #[serde(default = "default_log_every")]
    pub log_every: i64,
    /// Moving-average window for per-batch metrics.
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default)]
    pub device: Device,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            test_every: default_test_every(),
            log_every: default_log_every(),
            window: default_window(),
            device: Device::default(),
            checkpoint: CheckpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    /// File name template; `{iters}` and `{epoch}` are substituted.
    #[serde(default = "default_checkpoint_name")]
    pub name: String,
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_checkpoint_dir(),
            name: default_checkpoint_name(),
            max_checkpoints: default_max_checkpoints(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive for the stderr layer.
    #[serde(default = "default_level")]
    pub level: String,
    /// Directory for daily-rolling JSON logs. Disabled when unset.
    #[serde(default)]
    pub json_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json_dir: None,
        }
    }
}

fn default_epochs() -> usize {
    5
}

fn default_test_every() -> u64 {
    1000
}

fn default_log_every() -> i64 {
    100
}

fn default_window() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".trellis/checkpoints")
}

fn default_checkpoint_name() -> String {
    "ckpt_{iters}.json".to_string()
}

fn default_max_checkpoints() -> usize {
    5
}

fn default_level() -> String {
    "info".to_string()
}

/// Load configuration from all layers.
///
/// Later layers win: built-in defaults, the user-level `config.toml`, the
/// workspace `.trellis/config.toml`, `TRELLIS_*` environment variables
/// (`__` separates nested keys, e.g. `TRELLIS_CHECKPOINT__ENABLED`), then
/// `overrides`.
pub fn load_config(workspace: Option<&Path>, overrides: Option<&RecipeConfig>) -> Result<RecipeConfig> {
    let mut figment = Figment::from(Serialized::defaults(RecipeConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = figment.merge(Env::prefixed("TRELLIS_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment
        .extract()
        .map_err(|e| RecipeError::Config(e.to_string()))
}

/// `<workspace>/.trellis/config.toml`.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".trellis").join("config.toml")
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "trellis", "trellis")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Write `config` to `<workspace>/.trellis/config.toml`, returning the path.
pub fn save_workspace_config(workspace: &Path, config: &RecipeConfig) -> Result<PathBuf> {
    let path = workspace_config_path(workspace);
    let toml_str = toml::to_string_pretty(config).map_err(|e| RecipeError::Config(e.to_string()))?;
    atomic_write(&path, toml_str.as_bytes())?;
    Ok(path)
}

/// Whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}
