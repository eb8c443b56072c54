use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::undo::HistoryConfig;

/// Project-relative location of the project config file.
pub const PROJECT_CONFIG_PATH: &str = ".arbor/config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArborConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub history: HistorySection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store file; relative paths resolve against the project root.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Soft-deleted rows older than this are eligible for purge.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            retention_days: default_retention_days(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs((self.retention_days as u64) * 86_400)
    }

    #[must_use]
    pub fn resolved_path(&self, project_root: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            project_root.join(&self.path)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_zone")]
    pub zone: String,
    /// Upper bound on records requested per change page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            zone: default_zone(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySection {
    /// Zero disables the limit.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

impl From<&HistorySection> for HistoryConfig {
    fn from(section: &HistorySection) -> Self {
        Self {
            max_depth: (section.max_depth > 0).then_some(section.max_depth),
        }
    }
}

/// User-level overrides; every field is optional and falls through to the
/// project value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub busy_timeout_ms: Option<u64>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub history_max_depth: Option<usize>,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".arbor/arbor.sqlite3")
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_retention_days() -> u32 {
    30
}

fn default_zone() -> String {
    "tasks".to_string()
}

const fn default_page_size() -> usize {
    200
}

const fn default_max_depth() -> usize {
    100
}

/// Load `.arbor/config.toml` under `project_root`; defaults if absent.
///
/// # Errors
///
/// Returns an error naming the file when it cannot be read or parsed.
pub fn load_project_config(project_root: &Path) -> Result<ArborConfig> {
    let path = project_root.join(PROJECT_CONFIG_PATH);
    if !path.exists() {
        return Ok(ArborConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<ArborConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load `<config_dir>/arbor/config.toml`; defaults if absent.
///
/// # Errors
///
/// Returns an error naming the file when it cannot be read or parsed.
pub fn load_user_config() -> Result<UserConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };
    load_user_config_from(&config_dir.join("arbor/config.toml"))
}

fn load_user_config_from(path: &Path) -> Result<UserConfig> {
    if !path.exists() {
        return Ok(UserConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<UserConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Project config with user overrides applied.
///
/// # Errors
///
/// Returns the first load or parse error.
pub fn resolve_config(project_root: &Path) -> Result<ArborConfig> {
    let project = load_project_config(project_root)?;
    let user = load_user_config()?;
    Ok(apply_user_overrides(project, &user))
}

fn apply_user_overrides(mut config: ArborConfig, user: &UserConfig) -> ArborConfig {
    if let Some(ms) = user.busy_timeout_ms {
        config.store.busy_timeout_ms = ms;
    }
    if let Some(zone) = &user.zone {
        config.cloud.zone.clone_from(zone);
    }
    if let Some(depth) = user.history_max_depth {
        config.history.max_depth = depth;
    }
    config
}
