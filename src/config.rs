use semver::Version;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::catalog::registry::Arch;
use crate::catalog::semver::parse_tolerant;

// =============================================================================
// Time-related constants
// =============================================================================

/// Default refresh interval in milliseconds (15 minutes)
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 15 * 60 * 1000;

/// Timeout for fetch operations in milliseconds (30 seconds)
pub const FETCH_TIMEOUT_MS: u64 = 30_000;

/// Delay between starting each fetch request to avoid rate limiting (10ms)
pub const FETCH_STAGGER_DELAY_MS: u64 = 10;

// =============================================================================
// Registry defaults
// =============================================================================

/// Oldest release tracked by default
pub const DEFAULT_MIN_VERSION: &str = "1.2.0";

pub const DEFAULT_REGISTRY_URL: &str = "https://ghcr.io";

/// Repository whose tags define the published releases
pub const DEFAULT_RELEASE_REPOSITORY: &str = "siderolabs/imager";

/// Repository of the per-release extension manifest images
pub const DEFAULT_EXTENSIONS_REPOSITORY: &str = "siderolabs/extensions";

/// Name of the log file inside the data directory
pub const LOG_FILE_NAME: &str = "release-catalog.log";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid minimum version: {0}")]
    InvalidMinVersion(String),
}

/// Catalog configuration structure
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CatalogConfig {
    pub registry: RegistryConfig,
    /// Releases below this version are ignored
    pub min_version: String,
    /// Reference architecture used to pull extension manifests
    pub arch: Arch,
    /// Time budget of a single refresh in milliseconds
    pub fetch_timeout: u64,
    /// Interval between refreshes in watch mode in milliseconds
    pub refresh_interval: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            min_version: DEFAULT_MIN_VERSION.to_string(),
            arch: Arch::default(),
            fetch_timeout: FETCH_TIMEOUT_MS,
            refresh_interval: DEFAULT_REFRESH_INTERVAL_MS,
        }
    }
}

impl CatalogConfig {
    /// Load the configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn min_version(&self) -> Result<Version, ConfigError> {
        parse_tolerant(&self.min_version)
            .ok_or_else(|| ConfigError::InvalidMinVersion(self.min_version.clone()))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval)
    }
}

/// Registry-specific configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryConfig {
    pub base_url: String,
    pub release_repository: String,
    pub extensions_repository: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REGISTRY_URL.to_string(),
            release_repository: DEFAULT_RELEASE_REPOSITORY.to_string(),
            extensions_repository: DEFAULT_EXTENSIONS_REPOSITORY.to_string(),
        }
    }
}

/// Returns the path to the data directory for release-catalog.
/// Uses $XDG_DATA_HOME/release-catalog if XDG_DATA_HOME is set,
/// otherwise falls back to ~/.local/share/release-catalog,
/// or ./release-catalog if neither is available.
pub fn data_dir() -> PathBuf {
    data_dir_with_env(std::env::var("XDG_DATA_HOME").ok(), dirs::home_dir())
}

fn data_dir_with_env(xdg_data_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    let data_dir = xdg_data_home
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));

    data_dir.join("release-catalog")
}
