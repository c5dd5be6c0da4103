//! Command-layer errors and their wire translation.

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::hash::HashError;
use crate::imaging::ImagingError;
use crate::staging::ChunkError;
use crate::vfs::VfsError;

/// Message clients show for name collisions.
pub const ALREADY_EXISTS_MESSAGE: &str = "File already exists in destination.";

#[derive(Debug, Error)]
pub enum CommandError {
    /// A required field is missing or malformed.
    #[error("errCmdParams: {0}")]
    Params(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("no volumes configured")]
    NoVolumes,

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error(transparent)]
    Vfs(#[from] VfsError),

    #[error("image error: {0}")]
    Image(String),

    #[error("upload error: {0}")]
    Upload(String),

    /// Pre-formatted `errNetMount`/`errNetUnMount` array.
    #[error("{}", .0.join(" "))]
    Mount(Vec<String>),
}

pub type CommandResult<T> = Result<T, CommandError>;

impl CommandError {
    pub fn params(field: impl Into<String>) -> Self {
        CommandError::Params(field.into())
    }

    pub fn mount<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandError::Mount(parts.into_iter().map(Into::into).collect())
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, CommandError::Vfs(VfsError::Aborted))
    }

    /// The `error` field of the response envelope.
    pub fn to_wire(&self) -> Value {
        match self {
            CommandError::Params(_) => json!("errCmdParams"),
            CommandError::UnknownCommand(cmd) => json!(["errUnknownCmd", cmd]),
            CommandError::NoVolumes => json!(["errConf", "No volumes configured."]),
            CommandError::Hash(e) => json!(["errFileNotFound", e.to_string()]),
            CommandError::Vfs(VfsError::Aborted) => json!("Aborted"),
            CommandError::Vfs(e) if e.is_already_exists() => json!(ALREADY_EXISTS_MESSAGE),
            CommandError::Vfs(e) => json!([e.code(), e.to_string()]),
            CommandError::Image(msg) => json!(["errResize", msg]),
            CommandError::Upload(msg) => json!(["errUpload", msg]),
            CommandError::Mount(parts) => json!(parts),
        }
    }

    /// Log at a level matching how surprising the failure is.
    pub(crate) fn log(&self, cmd: &str) {
        match self {
            CommandError::Vfs(VfsError::Aborted) => info!(cmd, "command aborted"),
            CommandError::Vfs(VfsError::NotImplemented { backend, operation }) => {
                warn!(cmd, backend, operation, "backend cannot perform operation")
            }
            CommandError::Params(field) => warn!(cmd, field, "missing or invalid parameter"),
            CommandError::UnknownCommand(_) => warn!(cmd, "not a recognized command"),
            other => error!(cmd, error = %other, "command failed"),
        }
    }
}

impl From<ImagingError> for CommandError {
    fn from(e: ImagingError) -> Self {
        match e {
            ImagingError::Io(io) => CommandError::Vfs(io.into()),
            other => CommandError::Image(other.to_string()),
        }
    }
}

impl From<ChunkError> for CommandError {
    fn from(e: ChunkError) -> Self {
        CommandError::Upload(e.to_string())
    }
}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        CommandError::Vfs(e.into())
    }
}
