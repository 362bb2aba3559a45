//! Runtime settings.
//!
//! Resolution order per field: environment variable, then `settings.json` in
//! the data directory, then the built-in default.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const APP_IDENTIFIER: &str = "com.waterfall.workbench";
pub const SETTINGS_FILE: &str = "settings.json";
pub const CACHE_FILE: &str = "waterfall-cache.sqlite3";

pub const ENV_DATA_DIR: &str = "WATERFALL_DATA_DIR";
pub const ENV_SQL_ENDPOINT: &str = "WATERFALL_SQL_ENDPOINT";
pub const ENV_API_ENDPOINT: &str = "WATERFALL_API_ENDPOINT";
pub const ENV_USER_ID: &str = "WATERFALL_USER_ID";

const DEFAULT_SQL_ENDPOINT: &str = "http://127.0.0.1:5000";

/// Optional overrides read from `settings.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    sql_endpoint: Option<String>,
    api_endpoint: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub data_dir: PathBuf,
    pub sql_endpoint: String,
    /// Project persistence endpoint. Without one, projects and mapping uploads
    /// stay in memory.
    pub api_endpoint: Option<String>,
    pub user_id: Option<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let data_dir = match env_value(ENV_DATA_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };
        Self::load_from(data_dir)
    }

    pub fn load_from(data_dir: PathBuf) -> Result<Self> {
        let file = read_settings_file(&data_dir.join(SETTINGS_FILE))?;
        Ok(Self {
            sql_endpoint: env_value(ENV_SQL_ENDPOINT)
                .or(file.sql_endpoint)
                .unwrap_or_else(|| DEFAULT_SQL_ENDPOINT.to_string()),
            api_endpoint: env_value(ENV_API_ENDPOINT).or(file.api_endpoint),
            user_id: env_value(ENV_USER_ID).or(file.user_id),
            data_dir,
        })
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join(CACHE_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| env::current_dir().ok())
        .ok_or_else(|| anyhow::anyhow!("failed to resolve application data directory"))?;
    Ok(base.join(APP_IDENTIFIER))
}

fn read_settings_file(path: &Path) -> Result<SettingsFile> {
    if !path.exists() {
        return Ok(SettingsFile::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}
