use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const MIN_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

const CONFIG_FILE: &str = "imager.toml";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "os-imager", "os-imager")
}

/// Runtime settings, loaded from `imager.toml`. Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagerConfig {
    pub cache_enabled: bool,
    pub cache_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    /// RSA-2048 private key used for secure boot signing.
    pub signing_key: Option<PathBuf>,
    pub chunk_size: usize,
    pub verify: bool,
    pub connect_timeout_secs: u64,
    /// Fail a download that delivers no bytes for this long.
    pub stall_timeout_secs: u64,
    /// Chunks buffered between the fetcher and the cache writer.
    pub cache_queue_depth: usize,
    pub user_agent: String,
    pub use_system_proxy: bool,
}

impl Default for ImagerConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_dir: None,
            temp_dir: None,
            signing_key: None,
            chunk_size: MAX_CHUNK_SIZE,
            verify: true,
            connect_timeout_secs: 30,
            stall_timeout_secs: 60,
            cache_queue_depth: 32,
            user_agent: format!("os-imager/{}", env!("CARGO_PKG_VERSION")),
            use_system_proxy: true,
        }
    }
}

impl ImagerConfig {
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load from `path`, or from the default location when it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) if p.exists() => p,
                _ => {
                    debug!("No configuration file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse configuration file: {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration file: {}", path.display()))
    }

    /// Cache directory to use, or `None` when caching is off.
    pub fn effective_cache_dir(&self) -> Option<PathBuf> {
        if !self.cache_enabled {
            return None;
        }
        self.cache_dir
            .clone()
            .or_else(|| project_dirs().map(|dirs| dirs.cache_dir().join("images")))
    }

    pub fn effective_temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Chunk size clamped so that cancellation stays responsive.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs.max(1))
    }
}
