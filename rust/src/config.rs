//! Beacon configuration: JSON file plus environment overrides.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::target::BeaconSettings;
use crate::wid::{TimeUnit, WidGenOptions};

pub const CONFIG_ENV: &str = "WALDIEZ_BEACON_CONFIG";
pub const DATA_DIR_ENV: &str = "WALDIEZ_BEACON_DATA_DIR";
pub const NAMESPACE_ENV: &str = "WALDIEZ_BEACON_NAMESPACE";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BeaconConfig {
    /// Where generator state lives. Relative paths are taken from the
    /// working directory.
    pub data_dir: PathBuf,
    pub namespace: String,
    pub time_unit: TimeUnit,
    /// Value of the `source` field in outgoing beacons.
    pub source: String,
    pub settings: BeaconSettings,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".local").join("beacon"),
            namespace: "default".to_string(),
            time_unit: TimeUnit::Ms,
            source: "player".to_string(),
            settings: BeaconSettings::default(),
        }
    }
}

impl BeaconConfig {
    /// Load from `path`, or from `$WALDIEZ_BEACON_CONFIG`, or fall back to
    /// defaults; then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded beacon config");
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = get(DATA_DIR_ENV) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(ns) = get(NAMESPACE_ENV) {
            self.namespace = ns.trim().to_string();
        }
    }

    /// Data dir made absolute against `root`.
    pub fn resolve_data_dir(&self, root: &Path) -> PathBuf {
        if self.data_dir.is_absolute() {
            self.data_dir.clone()
        } else {
            root.join(&self.data_dir)
        }
    }

    pub fn wid_options(&self) -> WidGenOptions {
        WidGenOptions {
            time_unit: self.time_unit,
            ..WidGenOptions::with_namespace(self.namespace.clone())
        }
    }
}
