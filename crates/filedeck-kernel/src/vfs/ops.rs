//! Backend operations trait.
//!
//! One implementation per storage kind. This is the only place
//! backend-specific logic lives; everything above it (the [`Driver`]
//! wrapper, transfers, archives, command handlers) is written against this
//! contract.
//!
//! [`Driver`]: super::Driver

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

use super::types::{ByteRange, FileStat, Listed};
use super::{VfsError, VfsResult};
use crate::volume::Volume;

/// Byte stream handed between backends.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Wrap an owned buffer as a [`ByteStream`].
pub fn bytes_stream(data: impl Into<Vec<u8>>) -> ByteStream {
    Box::pin(std::io::Cursor::new(data.into()))
}

/// Raw operations for one storage kind.
///
/// Ids are `/`-rooted backend ids. Caching, abort wiring and permission
/// normalization are layered on by the driver, never here.
#[async_trait]
pub trait BackendOps: Send + Sync {
    /// Backend kind (`local`, `ftp`, `memory`).
    fn kind(&self) -> &'static str;

    /// Check the backend is reachable. Unreachable is `false`, not an error.
    async fn init(&self) -> bool {
        true
    }

    /// Release connections and handles.
    async fn destroy(&self) {}

    /// Network-mount hook.
    async fn mount(&self) -> VfsResult<bool> {
        Ok(true)
    }

    /// Network-unmount hook.
    async fn unmount(&self) -> VfsResult<bool> {
        Ok(true)
    }

    /// Stat an entry, `None` if it does not exist.
    async fn stat(&self, id: &str) -> VfsResult<Option<FileStat>>;

    /// List a directory's children.
    async fn readdir(&self, id: &str) -> VfsResult<Vec<Listed>>;

    /// Open a byte stream, optionally limited to a half-open range.
    async fn read(&self, id: &str, range: Option<ByteRange>) -> VfsResult<ByteStream>;

    /// Create or replace `dir/name` with the stream's bytes. Returns the new id.
    async fn write(&self, dir: &str, name: &str, data: ByteStream) -> VfsResult<String>;

    /// Create the directory `dir/name`. Fails if it exists.
    async fn mkdir(&self, dir: &str, name: &str) -> VfsResult<String>;

    /// Move `src` to `dir/name`.
    async fn move_to(&self, src: &str, dir: &str, name: &str) -> VfsResult<String>;

    /// Rename `src` in place.
    async fn rename(&self, src: &str, name: &str) -> VfsResult<String>;

    /// Copy `src` (recursively) to `dir/name`.
    async fn copy(&self, src: &str, dir: &str, name: &str) -> VfsResult<String>;

    /// Change mode bits.
    async fn chmod(&self, _id: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::not_implemented(self.kind(), "chmod"))
    }

    /// Remove an entry, recursively for directories.
    async fn rm(&self, id: &str) -> VfsResult<()>;

    /// Move a locally staged file into the backend.
    ///
    /// The default streams the file through [`write`](Self::write); backends
    /// with a cheaper whole-file path override it.
    async fn upload(&self, tmp: &Path, dir: &str, name: &str) -> VfsResult<String> {
        let file = tokio::fs::File::open(tmp).await?;
        self.write(dir, name, Box::pin(file)).await
    }

    /// Apply the volume's fixed file/dir mode to a freshly created entry.
    async fn fix_permissions(&self, _id: &str) -> VfsResult<()> {
        Ok(())
    }

    /// Public URI of an entry. Never carries credentials.
    fn uri(&self, id: &str) -> String;

    /// Real filesystem path, for backends that have one.
    fn local_path(&self, _id: &str) -> Option<PathBuf> {
        None
    }
}

/// Builds backends of one kind for a volume.
pub trait BackendFactory: Send + Sync {
    /// Kind selector used in volume configs.
    fn kind(&self) -> &'static str;

    /// Protocol name offered to `netmount`, if this kind can be net-mounted.
    fn net_protocol(&self) -> Option<&'static str> {
        None
    }

    /// Create a backend bound to one driver.
    fn create(&self, volume: &Volume) -> VfsResult<Arc<dyn BackendOps>>;
}
