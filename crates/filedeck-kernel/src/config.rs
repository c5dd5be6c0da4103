//! Kernel configuration.
//!
//! Loaded from a TOML file:
//!
//! ```toml
//! staging_dir = "/var/tmp/filedeck"
//! debug_timing = false
//!
//! [[volumes]]
//! root = "/srv/share"
//! permissions = { read = true, write = true, locked = false }
//!
//! [[volumes.rules]]
//! pattern = "^/readonly(/|$)"
//! write = false
//!
//! [[volumes]]
//! driver = "ftp"
//! host = "ftp.example.org"
//! user = "anonymous"
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::hash::SEPARATOR;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level kernel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Root of `uploads/`, `tmb/` and `tmp/`. Defaults to `<tmp>/filedeck`.
    pub staging_dir: Option<PathBuf>,
    /// Log every driver operation's elapsed time at debug level.
    pub debug_timing: bool,
    /// Abort commands running longer than this. Absent means no limit.
    pub operation_timeout_secs: Option<u64>,
    /// Upload chunk size advertised to clients on `open`.
    pub upload_max_size: Option<String>,
    /// Public prefix of the connector (used for `url`/`tmbUrl` options).
    pub connector_url: Option<String>,
    pub volumes: Vec<VolumeConfig>,
}

impl KernelConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Staging root, falling back to the system temp dir.
    pub fn staging_root(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("filedeck"))
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }

    /// Fill volume defaults and reject bad or duplicate ids.
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (i, volume) in self.volumes.iter_mut().enumerate() {
            volume.apply_defaults(i);
            volume.validate()?;
            if !seen.insert(volume.id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "volume with id '{}' already exists",
                    volume.id
                )));
            }
        }
        Ok(())
    }
}

/// How backend ids relate to what clients are shown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Addressing {
    /// Ids are paths; entries carry no extra `id` field.
    #[default]
    Path,
    /// Ids are opaque; entries expose them as `id`.
    Opaque,
}

/// Volume-wide permission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub locked: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            locked: false,
        }
    }
}

/// Per-path permission override. The last matching rule wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Regex matched against the backend id.
    pub pattern: String,
    pub read: Option<bool>,
    pub write: Option<bool>,
    pub locked: Option<bool>,
}

/// One configured volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Stable id ending in `_`. Defaults to `v{index}_`.
    pub id: String,
    /// Display name of the root.
    pub name: String,
    /// Backend kind. Defaults to `local`.
    pub driver: String,
    pub root: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub permissions: Permissions,
    pub rules: Vec<PermissionRule>,
    /// Local thumbnail directory. Defaults to the staging `tmb/` dir.
    pub tmbdir: Option<PathBuf>,
    pub addressing: Addressing,
    /// Report a `dirs` flag for directories with subdirectories.
    pub subdirs: bool,
    /// Octal mode applied to created files, e.g. `"644"`.
    pub file_mode: Option<String>,
    /// Octal mode applied to created directories, e.g. `"755"`.
    pub dir_mode: Option<String>,
    /// Public URL prefix returned by the `url` command.
    pub url: Option<String>,
    /// Commands hidden from clients for this volume.
    pub disabled: Vec<String>,
}

impl VolumeConfig {
    /// A local volume rooted at `root`.
    pub fn local(root: impl Into<String>) -> Self {
        Self {
            root: Some(root.into()),
            ..Default::default()
        }
    }

    fn apply_defaults(&mut self, index: usize) {
        if let Some(root) = &mut self.root {
            let trimmed = root.trim_end_matches(['/', '\\']);
            if !trimmed.is_empty() {
                *root = trimmed.to_string();
            }
        }
        if self.id.is_empty() {
            self.id = format!("v{index}{SEPARATOR}");
        }
        if self.name.is_empty() {
            self.name = self
                .root
                .as_deref()
                .and_then(|r| r.rsplit(['/', '\\']).next())
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Volume {}", index + 1));
        }
        if self.driver.is_empty() {
            self.driver = "local".to_string();
        }
    }

    /// Check id shape, rule patterns and mode strings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_volume_id(&self.id)?;
        for rule in &self.rules {
            Regex::new(&rule.pattern).map_err(|e| {
                ConfigError::Invalid(format!("volume {}: bad rule pattern: {e}", self.id))
            })?;
        }
        for mode in [&self.file_mode, &self.dir_mode].into_iter().flatten() {
            parse_mode(mode).ok_or_else(|| {
                ConfigError::Invalid(format!("volume {}: bad mode '{mode}'", self.id))
            })?;
        }
        Ok(())
    }
}

/// Volume ids end in the separator and contain it nowhere else.
pub fn validate_volume_id(id: &str) -> Result<(), ConfigError> {
    let ok = id.len() > 1 && id.ends_with(SEPARATOR) && id.matches(SEPARATOR).count() == 1;
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "volume id '{id}' must end in '{SEPARATOR}' and contain no other '{SEPARATOR}'"
        )))
    }
}

/// Parse an octal mode string (`"755"`, `"0o755"`, `"0755"`).
pub fn parse_mode(mode: &str) -> Option<u32> {
    let digits = mode.trim().trim_start_matches("0o");
    u32::from_str_radix(digits, 8).ok().filter(|m| *m <= 0o7777)
}
