//! Virtual filesystem layer.
//!
//! - [`BackendOps`] - raw operations for one storage kind
//! - [`Driver`] - a backend bound to one request, with its [`RequestCache`]
//!   and abort token
//! - [`LocalBackend`], [`FtpBackend`], [`MemoryBackend`] - the storage kinds
//!
//! ## Design Decisions
//!
//! - **Path-like ids**: every backend addresses entries with `/`-rooted ids;
//!   the root is always `/`. Clients only ever see hash tokens.
//! - **Mime marks directories**: `mime == "directory"` is the only
//!   directory flag.
//! - **No cross-request caching**: each driver's cache dies with it.

pub mod backends;
mod cache;
mod driver;
mod entry;
mod error;
mod ops;
pub mod path;
mod types;

pub use backends::{FtpBackend, LocalBackend, MemoryBackend};
pub use cache::RequestCache;
pub use driver::{AbortableReader, DEFAULT_COPY_SUFFIX, Driver, MAX_MEDIA_CHUNK};
pub use entry::{ContentRange, Entry, FileDownload};
pub use error::{VfsError, VfsResult};
pub use ops::{BackendFactory, BackendOps, ByteStream, bytes_stream};
pub use types::{
    BROKEN_SYMLINK, ByteRange, DIRECTORY, FALLBACK_MIME, FileStat, Listed, ROOT_ID, TreeNode,
    WalkEntry, guess_mime, now_ts, unix_ts,
};
