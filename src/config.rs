//! Chancacher configuration.
//!
//! [`ChanCacherConfig`] is what a pipeline is built from. The CLI reads it
//! from the `[cache]` table of a TOML file, next to a `[log]` table:
//!
//! ```toml
//! [cache]
//! depth = 1000
//! cache_dir = "/var/cache/ingest/stream0"
//! max_size = 1073741824
//!
//! [log]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Hard ceiling on the in-memory buffer depth. Deeper requests are clamped
/// so a misconfigured depth cannot exhaust memory.
pub const MAX_DEPTH: usize = 1_000_000;

/// Settings for one chancacher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChanCacherConfig {
    /// Output buffer capacity. 0 is a direct handoff; anything above
    /// [`MAX_DEPTH`] (including `usize::MAX`) means `MAX_DEPTH`.
    #[serde(default = "default_depth")]
    pub depth: usize,

    /// Directory backing the disk spill. `None` or an empty path disables
    /// spilling.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Maximum bytes on disk across both cache files; 0 is unlimited.
    #[serde(default)]
    pub max_size: u64,
}

fn default_depth() -> usize {
    1000
}

impl Default for ChanCacherConfig {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            cache_dir: None,
            max_size: 0,
        }
    }
}

impl ChanCacherConfig {
    /// In-memory only, with the given depth.
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            ..Self::default()
        }
    }

    /// Spill to `dir` when the buffer is full.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Cap the bytes held on disk.
    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }

    /// Depth after clamping to [`MAX_DEPTH`].
    pub fn effective_depth(&self) -> usize {
        self.depth.min(MAX_DEPTH)
    }

    /// The spill directory, if spilling is enabled.
    pub fn cache_path(&self) -> Option<&Path> {
        self.cache_dir
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }
}

/// Logging settings for the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

/// Contents of a chancache TOML config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub cache: ChanCacherConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Errors loading a config file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}
