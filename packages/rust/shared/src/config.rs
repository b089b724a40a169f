//! Application configuration for the warehouse ingestion service.
//!
//! User config lives at `~/.warehouse/warehouse.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, WarehouseError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "warehouse.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".warehouse";

// ---------------------------------------------------------------------------
// Config structs (matching warehouse.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Upstream ERP source settings.
    #[serde(default)]
    pub source: SourceConfig,

    /// Worker pool sizing and deadlines.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Pipeline id → upstream dataset name.
    #[serde(default)]
    pub pipelines: PipelineMapping,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "~/.warehouse/warehouse.db".into()
}

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// ERP base URL, e.g. `https://erp.example.com`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the ERP username (never store it here).
    #[serde(default = "default_username_env")]
    pub username_env: String,

    /// Name of the env var holding the ERP password (never store it here).
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// `limit_page_length` sent with every resource fetch.
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            username_env: default_username_env(),
            password_env: default_password_env(),
            page_limit: default_page_limit(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".into()
}
fn default_username_env() -> String {
    "ERP_USERNAME".into()
}
fn default_password_env() -> String {
    "ERP_PASSWORD".into()
}
fn default_page_limit() -> u32 {
    10
}
fn default_request_timeout() -> u64 {
    30
}

/// `[workers]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Runners executing at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Admitted but unfinished executions before `submit` is refused.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Deadline for one upstream pull.
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,

    /// Deadline for one store call made by a runner.
    #[serde(default = "default_store_timeout")]
    pub store_timeout_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_pending: default_max_pending(),
            pull_timeout_secs: default_pull_timeout(),
            store_timeout_secs: default_store_timeout(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}
fn default_max_pending() -> usize {
    64
}
fn default_pull_timeout() -> u64 {
    120
}
fn default_store_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Pipeline mapping
// ---------------------------------------------------------------------------

/// Maps pipeline ids to the dataset names the ERP system uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineMapping(pub BTreeMap<String, String>);

impl PipelineMapping {
    /// Upstream dataset name for `pipeline_id`, or the id itself when unmapped.
    pub fn upstream_name<'a>(&'a self, pipeline_id: &'a str) -> &'a str {
        self.0
            .get(pipeline_id)
            .map(String::as_str)
            .unwrap_or(pipeline_id)
    }
}

impl Default for PipelineMapping {
    fn default() -> Self {
        Self(BTreeMap::from([
            ("soil_collection".to_string(), "Soil Collection Data".to_string()),
            ("weather_data".to_string(), "Weather Data".to_string()),
            ("crop_yield".to_string(), "Crop Yield Data".to_string()),
        ]))
    }
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_concurrent: usize,
    pub max_pending: usize,
    pub pull_timeout: Duration,
    pub store_timeout: Duration,
}

impl From<&AppConfig> for WorkerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_concurrent: config.workers.max_concurrent.max(1),
            max_pending: config.workers.max_pending.max(1),
            pull_timeout: Duration::from_secs(config.workers.pull_timeout_secs),
            store_timeout: Duration::from_secs(config.workers.store_timeout_secs),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Resolved ERP connection settings, credentials included.
#[derive(Clone)]
pub struct SourceCredentials {
    pub base_url: Url,
    pub username: String,
    pub password: String,
    pub page_limit: u32,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for SourceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCredentials")
            .field("base_url", &self.base_url.as_str())
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("page_limit", &self.page_limit)
            .finish()
    }
}

/// Read ERP credentials from the env vars named in `[source]`.
pub fn resolve_source_credentials(config: &AppConfig) -> Result<SourceCredentials> {
    let base_url = Url::parse(&config.source.base_url).map_err(|e| {
        WarehouseError::config(format!(
            "invalid source.base_url '{}': {e}",
            config.source.base_url
        ))
    })?;

    Ok(SourceCredentials {
        base_url,
        username: read_env(&config.source.username_env)?,
        password: read_env(&config.source.password_env)?,
        page_limit: config.source.page_limit,
        request_timeout: Duration::from_secs(config.source.request_timeout_secs),
    })
}

fn read_env(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(WarehouseError::config(format!(
            "ERP credential not found. Set the {var_name} environment variable."
        ))),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.warehouse/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| WarehouseError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.warehouse/warehouse.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| WarehouseError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        WarehouseError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| WarehouseError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| WarehouseError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| WarehouseError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| WarehouseError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
