//! Request-scoped drivers.
//!
//! A [`Driver`] binds one [`Volume`]'s backend to one in-flight request. It
//! owns the request's [`RequestCache`] and abort token, applies the cache
//! invalidation rules around every mutation and wraps every stream it hands
//! out or consumes so that aborting the request stops the bytes.

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, warn};

use super::cache::RequestCache;
use super::entry::{ContentRange, Entry, FileDownload};
use super::ops::{BackendOps, ByteStream, bytes_stream};
use super::path;
use super::types::{ByteRange, DIRECTORY, FALLBACK_MIME, FileStat, ROOT_ID, WalkEntry};
use super::{VfsError, VfsResult};
use crate::config::parse_mode;
use crate::hash;
use crate::imaging;
use crate::volume::Volume;

/// Ceiling on one ranged delivery of audio or video content.
pub const MAX_MEDIA_CHUNK: u64 = 1024 * 1000 * 4;

/// Suffix `unique` appends when the caller gives none.
pub const DEFAULT_COPY_SUFFIX: &str = " - Copy";

const INITIALIZED: u8 = 1;
const DESTROYED: u8 = 2;

/// A volume's backend bound to one request.
///
/// Created by [`Volume::open_driver`], which runs `init`. Call
/// [`destroy`](Self::destroy) when the request is done; dropping an
/// undestroyed driver schedules the backend teardown on the runtime.
/// Using a driver after `destroy` is a programmer error and panics.
pub struct Driver {
    volume: Arc<Volume>,
    backend: Arc<dyn BackendOps>,
    cache: RequestCache,
    abort: CancellationToken,
    state: AtomicU8,
    initialized: bool,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("volume", &self.volume.id())
            .field("kind", &self.backend.kind())
            .field("initialized", &self.initialized)
            .field("aborted", &self.abort.is_cancelled())
            .finish()
    }
}

impl Driver {
    /// Create the backend and run its `init`.
    ///
    /// An unreachable backend is not an error: the driver comes back with
    /// [`is_initialized`](Self::is_initialized) false.
    pub async fn open(volume: Arc<Volume>, abort: CancellationToken) -> VfsResult<Self> {
        let backend = volume.factory().create(&volume)?;
        let initialized = backend.init().await;
        if !initialized {
            error!(
                volume = volume.id(),
                kind = backend.kind(),
                "driver could not initialize"
            );
        }
        let cache = RequestCache::new();
        cache.put_stat(
            ROOT_ID,
            Some(FileStat::directory(volume.name(), None, 0)),
        );
        Ok(Self {
            volume,
            backend,
            cache,
            abort,
            state: AtomicU8::new(INITIALIZED),
            initialized,
        })
    }

    /// Release the backend. Idempotent.
    pub async fn destroy(&self) {
        if self.state.swap(DESTROYED, Ordering::AcqRel) != DESTROYED {
            self.backend.destroy().await;
        }
    }

    fn alive(&self) {
        assert_ne!(
            self.state.load(Ordering::Acquire),
            DESTROYED,
            "driver for volume {} used after destroy",
            self.volume.id()
        );
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn backend(&self) -> &Arc<dyn BackendOps> {
        &self.backend
    }

    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn cache(&self) -> &RequestCache {
        &self.cache
    }

    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    /// Cancel every stream and sub-driver opened under this driver.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Fail with [`VfsError::Aborted`] once the request has been aborted.
    pub fn check_abort(&self) -> VfsResult<()> {
        if self.abort.is_cancelled() {
            Err(VfsError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Hash token for a backend id of this volume.
    pub fn hash(&self, id: &str) -> String {
        hash::encode(self.volume.id(), id)
    }

    /// Public URI of an entry.
    pub fn uri(&self, id: &str) -> String {
        self.backend.uri(id)
    }

    async fn timed<T>(&self, op: &'static str, fut: impl Future<Output = T>) -> T {
        if !self.volume.debug_timing() {
            return fut.await;
        }
        let start = Instant::now();
        let out = fut.await;
        debug!(
            volume = self.volume.id(),
            op,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "driver op"
        );
        out
    }

    fn guard(&self, stream: ByteStream) -> ByteStream {
        Box::pin(AbortableReader::new(stream, &self.abort))
    }

    async fn fix_permissions(&self, id: &str) {
        if let Err(e) = self.backend.fix_permissions(id).await {
            warn!(volume = self.volume.id(), id, error = %e, "could not normalize permissions");
        }
    }

    // ========================================================================
    // Memoized lookups
    // ========================================================================

    /// Stat through the request cache.
    pub async fn stat(&self, id: &str) -> VfsResult<Option<FileStat>> {
        self.alive();
        let backend = self.backend.clone();
        let owned = id.to_string();
        self.timed(
            "stat",
            self.cache
                .stat(id, move || async move { backend.stat(&owned).await }),
        )
        .await
    }

    /// Stat that treats a missing entry as an error.
    pub async fn stat_required(&self, id: &str) -> VfsResult<FileStat> {
        self.stat(id).await?.ok_or_else(|| VfsError::not_found(id))
    }

    /// Child ids of a directory, through the request cache.
    ///
    /// Child stats carried by the listing are seeded into the cache.
    pub async fn readdir(&self, id: &str) -> VfsResult<Vec<String>> {
        self.alive();
        let backend = self.backend.clone();
        let owned = id.to_string();
        let listed = self
            .timed(
                "readdir",
                self.cache
                    .readdir(id, move || async move { backend.readdir(&owned).await }),
            )
            .await?;
        let mut ids = Vec::with_capacity(listed.len());
        for child in listed {
            if let Some(stat) = child.stat {
                self.cache.seed_stat(&child.id, stat);
            }
            ids.push(child.id);
        }
        Ok(ids)
    }

    // ========================================================================
    // Streams
    // ========================================================================

    /// Open an abortable byte stream, optionally limited to a range.
    pub async fn read(&self, id: &str, range: Option<ByteRange>) -> VfsResult<ByteStream> {
        self.alive();
        self.check_abort()?;
        let stream = self.timed("read", self.backend.read(id, range)).await?;
        Ok(self.guard(stream))
    }

    /// Read a whole entry into memory.
    pub async fn read_to_vec(&self, id: &str) -> VfsResult<Vec<u8>> {
        let mut stream = self.read(id, None).await?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Create or replace `dir/name` from a stream.
    pub async fn write(&self, dir: &str, name: &str, data: ByteStream) -> VfsResult<String> {
        self.alive();
        path::validate_name(name)?;
        self.check_abort()?;
        let data = self.guard(data);
        let result = self
            .timed("write", self.backend.write(dir, name, data))
            .await;
        self.cache.invalidate_dir(dir);
        self.cache.invalidate_stat(&path::join(dir, name));
        let id = result?;
        self.cache.invalidate_stat(&id);
        self.fix_permissions(&id).await;
        Ok(id)
    }

    /// Create or replace `dir/name` from a buffer.
    pub async fn write_bytes(
        &self,
        dir: &str,
        name: &str,
        data: impl Into<Vec<u8>>,
    ) -> VfsResult<String> {
        self.write(dir, name, bytes_stream(data)).await
    }

    /// Move a locally staged file into the backend.
    pub async fn upload(&self, tmp: &Path, dir: &str, name: &str) -> VfsResult<String> {
        self.alive();
        path::validate_name(name)?;
        self.check_abort()?;
        let result = self
            .timed("upload", self.backend.upload(tmp, dir, name))
            .await;
        self.cache.invalidate_dir(dir);
        self.cache.invalidate_stat(&path::join(dir, name));
        let id = result?;
        self.cache.invalidate_stat(&id);
        self.fix_permissions(&id).await;
        Ok(id)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub async fn mkdir(&self, dir: &str, name: &str) -> VfsResult<String> {
        self.alive();
        path::validate_name(name)?;
        let result = self.timed("mkdir", self.backend.mkdir(dir, name)).await;
        self.cache.clear_dirs();
        self.cache.invalidate_stat(&path::join(dir, name));
        let id = result?;
        self.cache.invalidate_stat(&id);
        self.fix_permissions(&id).await;
        Ok(id)
    }

    pub async fn move_to(&self, src: &str, dir: &str, name: &str) -> VfsResult<String> {
        self.alive();
        path::validate_name(name)?;
        let result = self
            .timed("move", self.backend.move_to(src, dir, name))
            .await;
        self.cache.invalidate_stat(src);
        self.cache.clear_dirs();
        self.cache.invalidate_stat(&path::join(dir, name));
        result
    }

    pub async fn rename(&self, src: &str, name: &str) -> VfsResult<String> {
        self.alive();
        path::validate_name(name)?;
        let result = self.timed("rename", self.backend.rename(src, name)).await;
        self.cache.invalidate_stat(src);
        self.cache.clear_dirs();
        if let Ok(id) = &result {
            self.cache.invalidate_stat(id);
        }
        result
    }

    /// Backend-native copy; the copy gets the volume's modes, not the source's.
    pub async fn copy(&self, src: &str, dir: &str, name: &str) -> VfsResult<String> {
        self.alive();
        path::validate_name(name)?;
        let result = self.timed("copy", self.backend.copy(src, dir, name)).await;
        self.cache.clear_dirs();
        self.cache.invalidate_stat(&path::join(dir, name));
        let id = result?;
        self.fix_permissions(&id).await;
        Ok(id)
    }

    /// Change mode bits from an octal string.
    pub async fn chmod(&self, id: &str, mode: &str) -> VfsResult<()> {
        self.alive();
        let bits = parse_mode(mode)
            .ok_or_else(|| VfsError::other(format!("invalid mode: {mode}")))?;
        let result = self.timed("chmod", self.backend.chmod(id, bits)).await;
        self.cache.invalidate_stat(id);
        result
    }

    /// Remove an entry, recursively for directories.
    pub async fn rm(&self, id: &str) -> VfsResult<()> {
        self.alive();
        if id == ROOT_ID {
            return Err(VfsError::permission_denied("cannot remove a volume root"));
        }
        let result = self.timed("rm", self.backend.rm(id)).await;
        self.cache.invalidate_stat(id);
        self.cache.clear_dirs();
        result
    }

    pub async fn mount(&self) -> VfsResult<bool> {
        self.alive();
        self.backend.mount().await
    }

    pub async fn unmount(&self) -> VfsResult<bool> {
        self.alive();
        self.backend.unmount().await
    }

    // ========================================================================
    // Derived operations
    // ========================================================================

    /// A name in `dir` that collides with nothing, derived from `name`.
    ///
    /// The first collision appends `suffix` (default `" - Copy"`, also used
    /// for `"~"`), later ones append `" (n)"` after it. Always re-lists.
    pub async fn unique(&self, dir: &str, name: &str, suffix: Option<&str>) -> VfsResult<String> {
        let suffix = match suffix {
            None | Some("") | Some("~") => DEFAULT_COPY_SUFFIX,
            Some(s) => s,
        };
        self.cache.invalidate_dir(dir);
        let mut names = Vec::new();
        for child in self.readdir(dir).await? {
            if let Some(stat) = self.stat(&child).await? {
                names.push(stat.name);
            }
        }
        let mut candidate = name.to_string();
        let mut i = 0;
        while names.iter().any(|n| *n == candidate) {
            i += 1;
            candidate = if i > 1 {
                format!("{name}{suffix} ({i})")
            } else {
                format!("{name}{suffix}")
            };
        }
        Ok(candidate)
    }

    /// Depth-first pre-order walk below `root` (exclusive).
    ///
    /// Siblings are visited directories first, then by name. The abort flag
    /// is checked before every directory is listed.
    #[tracing::instrument(skip(self), fields(volume = self.volume.id()), name = "driver.walk")]
    pub async fn walk(&self, root: &str) -> VfsResult<Vec<WalkEntry>> {
        let mut out = Vec::new();
        self.walk_into(root.to_string(), Vec::new(), &mut out).await?;
        Ok(out)
    }

    fn walk_into<'a>(
        &'a self,
        id: String,
        parents: Vec<String>,
        out: &'a mut Vec<WalkEntry>,
    ) -> BoxFuture<'a, VfsResult<()>> {
        async move {
            self.check_abort()?;
            let mut children = Vec::new();
            for child in self.readdir(&id).await? {
                if let Some(stat) = self.stat(&child).await? {
                    children.push((child, stat));
                }
            }
            children.sort_by(|(_, a), (_, b)| {
                b.is_dir().cmp(&a.is_dir()).then_with(|| a.name.cmp(&b.name))
            });

            let mut lineage = parents;
            lineage.push(id);
            for (child, stat) in children {
                let is_dir = stat.is_dir();
                out.push(WalkEntry {
                    id: child.clone(),
                    stat,
                    parents: lineage.clone(),
                });
                if is_dir {
                    self.walk_into(child, lineage.clone(), out).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Client-visible description of an entry, `None` if it does not exist.
    pub async fn file(&self, id: &str) -> VfsResult<Option<Entry>> {
        let Some(stat) = self.stat(id).await? else {
            return Ok(None);
        };
        let is_root = id == ROOT_ID;
        let mime = if stat.mime.is_empty() {
            FALLBACK_MIME.to_string()
        } else {
            stat.mime.clone()
        };

        let perms = self.volume.permissions_for(id);
        let parent_writable = match stat.parent.as_deref() {
            Some(parent) => self.stat(parent).await?.map(|p| p.writable),
            None => None,
        };
        let locked = perms.locked && parent_writable == Some(false);

        let tmb = if mime.starts_with("image/") {
            self.tmb(id, false).await.unwrap_or_else(|e| {
                debug!(id, error = %e, "thumbnail lookup failed");
                None
            })
        } else {
            None
        };

        let dirs = if is_root {
            Some(1)
        } else if mime == DIRECTORY && self.volume.config().subdirs {
            self.has_subdirs(id).await?.then_some(1)
        } else {
            None
        };

        Ok(Some(Entry {
            hash: self.hash(id),
            phash: stat
                .parent
                .as_deref()
                .filter(|_| !is_root)
                .map(|p| self.hash(p))
                .unwrap_or_default(),
            name: stat.name,
            size: stat.size,
            mime,
            ts: stat.ts,
            read: u8::from(perms.read && stat.readable),
            write: u8::from(perms.write && stat.writable),
            locked: u8::from(locked),
            volumeid: self.volume.id().to_string(),
            id: (!self.volume.is_path_based()).then(|| id.to_string()),
            dirs,
            tmb,
            options: is_root.then(|| self.volume.options()),
            isroot: is_root.then_some(1),
            uri: Some(self.uri(id)),
        }))
    }

    /// Entry that must exist.
    pub async fn file_required(&self, id: &str) -> VfsResult<Entry> {
        self.file(id).await?.ok_or_else(|| VfsError::not_found(id))
    }

    /// Returns true if a directory has at least one child directory.
    pub async fn has_subdirs(&self, id: &str) -> VfsResult<bool> {
        for child in self.readdir(id).await? {
            if self.stat(&child).await?.is_some_and(|s| s.is_dir()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Stream an entry for download, honoring an HTTP `Range` header.
    ///
    /// Audio and video ranges are capped at [`MAX_MEDIA_CHUNK`] bytes.
    pub async fn fetch(&self, id: &str, range: Option<&str>) -> VfsResult<FileDownload> {
        let stat = self.stat_required(id).await?;
        if stat.is_dir() {
            return Err(VfsError::is_a_directory(id));
        }
        let range = range.and_then(|h| ByteRange::from_http(h, stat.size));
        let range = match range {
            Some(r) if is_streamed_media(&stat.mime) => Some(r.capped(MAX_MEDIA_CHUNK)),
            other => other,
        };
        let body = self.read(id, range).await?;
        let (content_range, length) = match range {
            Some(r) => (
                Some(ContentRange {
                    start: r.start,
                    end: r.end.saturating_sub(1).max(r.start),
                    total: stat.size,
                }),
                r.len(),
            ),
            None => (None, stat.size),
        };
        Ok(FileDownload {
            name: stat.name,
            mime: stat.mime,
            size: stat.size,
            range: content_range,
            length,
            attachment: false,
            body,
        })
    }

    /// Thumbnail name for an image entry.
    ///
    /// `Ok(None)` means no thumbnail can be produced. Without `create`, a
    /// missing thumbnail reports `"1"` ("not generated yet").
    pub async fn tmb(&self, id: &str, create: bool) -> VfsResult<Option<String>> {
        let Some(stat) = self.stat(id).await? else {
            return Ok(None);
        };
        let tmbdir = self.volume.tmbdir();
        let in_tmbdir = stat
            .parent
            .as_deref()
            .and_then(|p| self.backend.local_path(p))
            .is_some_and(|p| p == tmbdir);
        if in_tmbdir {
            return Ok(Some(stat.name));
        }

        let name = format!(
            "{}.png",
            hash::md5_hex(format!("{id}_{}_{}", stat.size, stat.ts))
        );
        let dest = tmbdir.join(&name);
        if tokio::fs::metadata(&dest).await.is_ok_and(|m| m.is_file()) {
            return Ok(Some(name));
        }
        if !create {
            return Ok(Some("1".to_string()));
        }

        let data = self.read_to_vec(id).await?;
        match imaging::write_thumbnail(data, dest).await {
            Ok(()) => Ok(Some(name)),
            Err(e) => {
                debug!(id, error = %e, "thumbnail not generatable");
                Ok(None)
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if self.state.swap(DESTROYED, Ordering::AcqRel) == DESTROYED {
            return;
        }
        let backend = self.backend.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { backend.destroy().await });
            }
            Err(_) => warn!(
                volume = self.volume.id(),
                "driver dropped outside a runtime without destroy"
            ),
        }
    }
}

fn is_streamed_media(mime: &str) -> bool {
    mime.starts_with("audio/") || mime.starts_with("video/")
}

/// Byte stream that fails with [`VfsError::Aborted`] once its token fires.
pub struct AbortableReader {
    inner: ByteStream,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl AbortableReader {
    pub fn new(inner: ByteStream, token: &CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(token.clone().cancelled_owned()),
        }
    }
}

impl AsyncRead for AbortableReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(VfsError::Aborted.into()));
        }
        this.inner.as_mut().poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;
    use crate::vfs::backends::MemoryFactory;
    use crate::volume::VolumeContext;
    use tempfile::TempDir;

    async fn memory_driver() -> (Driver, TempDir) {
        let dir = TempDir::new().unwrap();
        let volume = Volume::new(
            VolumeConfig {
                id: "m_".into(),
                name: "mem".into(),
                driver: "memory".into(),
                ..Default::default()
            },
            Arc::new(MemoryFactory::default()),
            &VolumeContext::rooted(dir.path()),
        )
        .unwrap();
        let driver = Arc::new(volume)
            .open_driver(&CancellationToken::new())
            .await
            .unwrap();
        (driver, dir)
    }

    #[tokio::test]
    async fn test_write_invalidates_stat_and_listing() {
        let (driver, _dir) = memory_driver().await;
        let id = driver.write_bytes("/", "a.txt", "one").await.unwrap();
        assert_eq!(driver.stat(&id).await.unwrap().unwrap().size, 3);
        assert_eq!(driver.readdir("/").await.unwrap(), vec![id.clone()]);

        driver.write_bytes("/", "a.txt", "three").await.unwrap();
        assert_eq!(driver.stat(&id).await.unwrap().unwrap().size, 5);

        let b = driver.write_bytes("/", "b.txt", "").await.unwrap();
        assert!(driver.readdir("/").await.unwrap().contains(&b));
        driver.destroy().await;
    }

    #[tokio::test]
    async fn test_unique_suffix_policy() {
        let (driver, _dir) = memory_driver().await;
        for name in ["Copy.txt", "Copy.txt - Copy", "Copy.txt - Copy (2)"] {
            driver.write_bytes("/", name, "x").await.unwrap();
        }
        let name = driver.unique("/", "Copy.txt", None).await.unwrap();
        assert_eq!(name, "Copy.txt - Copy (3)");
        let name = driver.unique("/", "Copy.txt", Some("~")).await.unwrap();
        assert_eq!(name, "Copy.txt - Copy (3)");
        let name = driver.unique("/", "fresh.txt", None).await.unwrap();
        assert_eq!(name, "fresh.txt");
        driver.destroy().await;
    }

    #[tokio::test]
    async fn test_walk_order() {
        let (driver, _dir) = memory_driver().await;
        driver.write_bytes("/", "b.txt", "b").await.unwrap();
        driver.write_bytes("/", "a.txt", "a").await.unwrap();
        let z = driver.mkdir("/", "z").await.unwrap();
        driver.write_bytes(&z, "inner.txt", "i").await.unwrap();

        let names: Vec<_> = driver
            .walk("/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.stat.name)
            .collect();
        assert_eq!(names, ["z", "inner.txt", "a.txt", "b.txt"]);
        driver.destroy().await;
    }

    #[tokio::test]
    async fn test_walk_aborts() {
        let (driver, _dir) = memory_driver().await;
        driver.mkdir("/", "d").await.unwrap();
        driver.abort();
        assert!(matches!(driver.walk("/").await, Err(VfsError::Aborted)));
        driver.destroy().await;
    }

    #[tokio::test]
    async fn test_aborted_read_stops() {
        let (driver, _dir) = memory_driver().await;
        let id = driver.write_bytes("/", "big.bin", vec![7u8; 1024]).await.unwrap();
        let mut stream = driver.read(&id, None).await.unwrap();
        driver.abort();
        let mut buf = Vec::new();
        let err = stream.read_to_end(&mut buf).await.unwrap_err();
        assert!(matches!(VfsError::from(err), VfsError::Aborted));
        driver.destroy().await;
    }

    #[tokio::test]
    async fn test_fetch_range_and_media_cap() {
        let (driver, _dir) = memory_driver().await;
        let data: Vec<u8> = (0..100u8).collect();
        let id = driver.write_bytes("/", "data.bin", data).await.unwrap();

        let mut dl = driver.fetch(&id, Some("bytes=10-19")).await.unwrap();
        let mut buf = Vec::new();
        dl.body.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, (10..20u8).collect::<Vec<_>>());
        assert_eq!(dl.range.unwrap().header(), "bytes 10-19/100");
        assert_eq!(dl.length, 10);

        let video = driver
            .write_bytes("/", "clip.mp4", vec![0u8; 5_000_000])
            .await
            .unwrap();
        let mut dl = driver
            .fetch(&video, Some("bytes=0-104857599"))
            .await
            .unwrap();
        let mut buf = Vec::new();
        dl.body.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf.len() as u64, MAX_MEDIA_CHUNK);
        assert_eq!(dl.range.unwrap().start, 0);
        driver.destroy().await;
    }

    #[tokio::test]
    async fn test_file_entry_shape() {
        let (driver, _dir) = memory_driver().await;
        let root = driver.file_required("/").await.unwrap();
        assert_eq!(root.name, "mem");
        assert_eq!(root.phash, "");
        assert_eq!(root.dirs, Some(1));
        assert_eq!(root.isroot, Some(1));
        assert!(root.options.is_some());

        let id = driver.write_bytes("/", "pic.png", "not a png").await.unwrap();
        let entry = driver.file_required(&id).await.unwrap();
        assert_eq!(entry.phash, driver.hash("/"));
        assert_eq!(entry.mime, "image/png");
        assert_eq!(entry.tmb.as_deref(), Some("1"));
        assert_eq!(entry.read, 1);
        assert!(driver.tmb(&id, true).await.unwrap().is_none());
        driver.destroy().await;
    }

    #[tokio::test]
    async fn test_rm_root_refused() {
        let (driver, _dir) = memory_driver().await;
        assert!(driver.rm("/").await.is_err());
        driver.destroy().await;
        driver.destroy().await;
    }
}
