//! Volumes: long-lived identity and configuration of one mounted backend.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{Addressing, ConfigError, Permissions, VolumeConfig, parse_mode};
use crate::vfs::{BackendFactory, Driver, VfsResult};

/// Process-wide settings every volume is created with.
#[derive(Debug, Clone)]
pub struct VolumeContext {
    /// Thumbnail directory used when a volume sets none.
    pub tmbdir: PathBuf,
    /// Scratch directory for backend-side staging.
    pub scratch: PathBuf,
    /// Public connector prefix for `url`/`tmbUrl` options.
    pub connector_url: String,
    pub debug_timing: bool,
}

impl VolumeContext {
    /// Context rooted in one directory, for scratch volumes and tests.
    pub fn rooted(dir: &Path) -> Self {
        Self {
            tmbdir: dir.join("tmb"),
            scratch: dir.join("tmp"),
            connector_url: "/connector".to_string(),
            debug_timing: false,
        }
    }
}

struct Rule {
    pattern: Regex,
    read: Option<bool>,
    write: Option<bool>,
    locked: Option<bool>,
}

/// One mounted backend.
///
/// Lives for the process (or until unmounted). Hands out request-scoped
/// [`Driver`]s through [`open_driver`](Self::open_driver).
pub struct Volume {
    config: VolumeConfig,
    factory: Arc<dyn BackendFactory>,
    rules: Vec<Rule>,
    file_mode: Option<u32>,
    dir_mode: Option<u32>,
    tmbdir: PathBuf,
    scratch: PathBuf,
    connector_url: String,
    debug_timing: bool,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.config.id)
            .field("name", &self.config.name)
            .field("driver", &self.config.driver)
            .finish()
    }
}

impl Volume {
    /// Build a volume from a normalized config.
    pub fn new(
        config: VolumeConfig,
        factory: Arc<dyn BackendFactory>,
        ctx: &VolumeContext,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rules = config
            .rules
            .iter()
            .map(|r| {
                Ok(Rule {
                    pattern: Regex::new(&r.pattern)
                        .map_err(|e| ConfigError::Invalid(e.to_string()))?,
                    read: r.read,
                    write: r.write,
                    locked: r.locked,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let tmbdir = config.tmbdir.clone().unwrap_or_else(|| ctx.tmbdir.clone());
        Ok(Self {
            file_mode: config.file_mode.as_deref().and_then(parse_mode),
            dir_mode: config.dir_mode.as_deref().and_then(parse_mode),
            rules,
            tmbdir,
            scratch: ctx.scratch.clone(),
            connector_url: ctx.connector_url.trim_end_matches('/').to_string(),
            debug_timing: ctx.debug_timing,
            factory,
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Backend kind selector.
    pub fn kind(&self) -> &str {
        &self.config.driver
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn factory(&self) -> &Arc<dyn BackendFactory> {
        &self.factory
    }

    pub fn is_path_based(&self) -> bool {
        self.config.addressing == Addressing::Path
    }

    pub fn tmbdir(&self) -> &Path {
        &self.tmbdir
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    pub fn file_mode(&self) -> Option<u32> {
        self.file_mode
    }

    pub fn dir_mode(&self) -> Option<u32> {
        self.dir_mode
    }

    pub fn debug_timing(&self) -> bool {
        self.debug_timing
    }

    /// Permission policy for one backend id. The last matching rule wins.
    pub fn permissions_for(&self, id: &str) -> Permissions {
        let mut perms = self.config.permissions;
        for rule in self.rules.iter().filter(|r| r.pattern.is_match(id)) {
            if let Some(read) = rule.read {
                perms.read = read;
            }
            if let Some(write) = rule.write {
                perms.write = write;
            }
            if let Some(locked) = rule.locked {
                perms.locked = locked;
            }
        }
        perms
    }

    /// Options reported on the root entry.
    pub fn options(&self) -> serde_json::Value {
        serde_json::json!({
            "disabled": self.config.disabled,
            "archivers": {
                "create": ["application/zip"],
                "extract": ["application/zip"],
                "createext": { "application/zip": "zip" },
            },
            "csscls": format!("elfinder-navbar-root-{}", self.kind()),
            "uiCmdMap": [],
            "url": format!("{}/file/{}/", self.connector_url, self.id()),
            "tmbUrl": format!("{}/tmb/{}/", self.connector_url, self.id()),
        })
    }

    /// Open a driver bound to one request's abort scope.
    ///
    /// The driver listens on a child of `abort`, so aborting the request
    /// aborts every driver it opened.
    pub async fn open_driver(self: &Arc<Self>, abort: &CancellationToken) -> VfsResult<Driver> {
        Driver::open(self.clone(), abort.child_token()).await
    }
}
