//! Configuration for stagegate paths and engine settings.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STAGEGATE_HOME)
//! 2. Config file (.stagegate/config.yaml)
//! 3. Defaults (~/.stagegate)
//!
//! Config file discovery:
//! - Searches current directory and parents for .stagegate/config.yaml
//! - Paths in config file are relative to the config file's parent directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::dispatch::RetryPolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<std::result::Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub dispatcher: Option<DispatcherConfig>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to config file)
    pub home: Option<String>,
    /// Stage table YAML (relative to project root)
    pub stages: Option<String>,
    /// Directory holding transform processor executables
    pub processors: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// "process" (default) or "http"
    pub mode: Option<String>,
    /// Base URL for http mode
    pub endpoint: Option<String>,
    /// Per-dispatch timeout in seconds
    pub timeout_seconds: Option<u64>,
}

/// How transforms are dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherMode {
    Process,
    Http { endpoint: String },
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to stagegate home (engine state)
    pub home: PathBuf,
    /// Stage table file, if one is configured
    pub stages_file: Option<PathBuf>,
    /// Directory of transform processor executables
    pub processors_dir: PathBuf,
    /// Dispatcher selection
    pub dispatcher: DispatcherMode,
    /// Per-dispatch timeout in seconds
    pub dispatch_timeout_seconds: u64,
    /// Retry policy for transform dispatch
    pub retry: RetryPolicy,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Path to the SQLite database ($STAGEGATE_HOME/stagegate.db)
    pub fn db_path(&self) -> PathBuf {
        self.home.join("stagegate.db")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".stagegate").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".stagegate");

    let config_file = find_config_file();

    if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        // Base directory is the parent of .stagegate/ (i.e., the project root)
        let stagegate_dir = config_path.parent().unwrap_or(Path::new("."));
        let base_dir = stagegate_dir.parent().unwrap_or(Path::new("."));

        let home = if let Ok(env_home) = std::env::var("STAGEGATE_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            resolve_path(stagegate_dir, home_path)
        } else {
            default_home
        };

        let stages_file = config
            .paths
            .stages
            .as_ref()
            .map(|p| resolve_path(base_dir, p));

        let processors_dir = config
            .paths
            .processors
            .as_ref()
            .map(|p| resolve_path(base_dir, p))
            .unwrap_or_else(|| home.join("processors"));

        let dispatcher_cfg = config.dispatcher.as_ref();
        let dispatcher = match dispatcher_cfg.and_then(|d| d.mode.as_deref()) {
            Some("http") => {
                let endpoint = dispatcher_cfg
                    .and_then(|d| d.endpoint.clone())
                    .context("dispatcher.endpoint is required in http mode")?;
                DispatcherMode::Http { endpoint }
            }
            Some("process") | None => DispatcherMode::Process,
            Some(other) => anyhow::bail!("Unknown dispatcher mode: {other}"),
        };

        let dispatch_timeout_seconds = dispatcher_cfg
            .and_then(|d| d.timeout_seconds)
            .unwrap_or(300);

        Ok(ResolvedConfig {
            home,
            stages_file,
            processors_dir,
            dispatcher,
            dispatch_timeout_seconds,
            retry: config.retry.unwrap_or_default(),
            config_file,
        })
    } else {
        // No config file - use env vars or defaults
        let home = std::env::var("STAGEGATE_HOME")
            .map(PathBuf::from)
            .unwrap_or(default_home);

        Ok(ResolvedConfig {
            stages_file: None,
            processors_dir: home.join("processors"),
            home,
            dispatcher: DispatcherMode::Process,
            dispatch_timeout_seconds: 300,
            retry: RetryPolicy::default(),
            config_file: None,
        })
    }
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
