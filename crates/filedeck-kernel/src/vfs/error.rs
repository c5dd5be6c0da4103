//! Driver-layer error types.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Driver-layer error type.
///
/// `Clone` so a memoized in-flight lookup can hand the same failure to every
/// waiter sharing it.
#[derive(Debug, Clone, Error)]
pub enum VfsError {
    /// Entry not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Destination already exists.
    #[error("file already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Volume is read-only.
    #[error("volume is read-only")]
    ReadOnly,

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Backend id escapes the volume root.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// Malformed backend id or entry name.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The backend kind cannot perform this operation.
    #[error("{backend} backend does not implement {operation}")]
    NotImplemented {
        /// Backend kind (e.g. `ftp`).
        backend: &'static str,
        /// Contract operation name.
        operation: &'static str,
    },

    /// The owning request was aborted.
    #[error("command aborted")]
    Aborted,

    /// Network backend replied with an error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(id: impl Into<String>) -> Self {
        Self::AlreadyExists(id.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(id: impl Into<String>) -> Self {
        Self::PermissionDenied(id.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(id: impl Into<String>) -> Self {
        Self::NotADirectory(id.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(id: impl Into<String>) -> Self {
        Self::IsADirectory(id.into())
    }

    /// Create a PathEscapesRoot error.
    pub fn path_escapes_root(id: impl Into<String>) -> Self {
        Self::PathEscapesRoot(id.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(id: impl Into<String>) -> Self {
        Self::InvalidPath(id.into())
    }

    /// Create a NotImplemented error.
    pub fn not_implemented(backend: &'static str, operation: &'static str) -> Self {
        Self::NotImplemented { backend, operation }
    }

    /// Create a Protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Native error code reported to clients next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            VfsError::NotFound(_) => "ENOENT",
            VfsError::AlreadyExists(_) => "EEXIST",
            VfsError::PermissionDenied(_) => "EACCES",
            VfsError::ReadOnly => "EROFS",
            VfsError::NotADirectory(_) => "ENOTDIR",
            VfsError::IsADirectory(_) => "EISDIR",
            VfsError::PathEscapesRoot(_) => "EPERM",
            VfsError::InvalidPath(_) => "EINVAL",
            VfsError::NotImplemented { .. } => "ENOTSUP",
            VfsError::Aborted => "ECANCELED",
            VfsError::Protocol(_) => "EPROTO",
            VfsError::Io(e) => io_code(e.kind()),
            VfsError::Other(_) => "EIO",
        }
    }

    /// Returns true if this error reports an existing destination.
    pub fn is_already_exists(&self) -> bool {
        match self {
            VfsError::AlreadyExists(_) => true,
            VfsError::Io(e) => e.kind() == io::ErrorKind::AlreadyExists,
            VfsError::Protocol(msg) | VfsError::Other(msg) => {
                msg.contains("dest already exists") || msg.contains("file already exists")
            }
            _ => false,
        }
    }
}

fn io_code(kind: io::ErrorKind) -> &'static str {
    match kind {
        io::ErrorKind::NotFound => "ENOENT",
        io::ErrorKind::PermissionDenied => "EACCES",
        io::ErrorKind::AlreadyExists => "EEXIST",
        io::ErrorKind::NotADirectory => "ENOTDIR",
        io::ErrorKind::IsADirectory => "EISDIR",
        io::ErrorKind::DirectoryNotEmpty => "ENOTEMPTY",
        io::ErrorKind::InvalidInput => "EINVAL",
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        io::ErrorKind::ConnectionReset => "ECONNRESET",
        io::ErrorKind::StorageFull => "ENOSPC",
        _ => "EIO",
    }
}

/// Payload carried by io errors raised when a request is aborted mid-stream.
#[derive(Debug)]
struct AbortSignal;

impl std::fmt::Display for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("command aborted")
    }
}

impl std::error::Error for AbortSignal {}

/// Map io errors onto the matching variant so callers can match on kind.
impl From<io::Error> for VfsError {
    fn from(e: io::Error) -> Self {
        if e.get_ref().is_some_and(|inner| inner.is::<AbortSignal>()) {
            return VfsError::Aborted;
        }
        match e.kind() {
            io::ErrorKind::NotFound => VfsError::NotFound(e.to_string()),
            io::ErrorKind::AlreadyExists => VfsError::AlreadyExists(e.to_string()),
            io::ErrorKind::PermissionDenied => VfsError::PermissionDenied(e.to_string()),
            _ => VfsError::Io(Arc::new(e)),
        }
    }
}

/// Convert VfsError to std::io::Error for stream adapters.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::ReadOnly => {
                io::Error::new(io::ErrorKind::PermissionDenied, "volume is read-only")
            }
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            VfsError::PathEscapesRoot(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::InvalidPath(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::Aborted => io::Error::other(AbortSignal),
            VfsError::Io(e) => io::Error::new(e.kind(), e.to_string()),
            other => io::Error::other(other.to_string()),
        }
    }
}

/// Driver-layer result type.
pub type VfsResult<T> = Result<T, VfsError>;
