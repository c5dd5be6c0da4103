//! Local filesystem backend.
//!
//! Backend ids are paths relative to `root`, with path security to prevent
//! escaping it.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::error;

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{BackendFactory, BackendOps, ByteStream};
use crate::vfs::path;
use crate::vfs::types::{
    BROKEN_SYMLINK, ByteRange, DIRECTORY, FileStat, Listed, ROOT_ID, guess_mime, unix_ts,
};
use crate::volume::Volume;

/// Local filesystem backend.
///
/// All ids are relative to `root`. For example, if `root` is
/// `/srv/share`, then id `/docs/a.txt` is `/srv/share/docs/a.txt`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    volume_name: String,
    file_mode: Option<u32>,
    dir_mode: Option<u32>,
}

impl LocalBackend {
    /// Create a backend rooted at the given path.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(root: impl Into<PathBuf>, volume_name: impl Into<String>) -> Self {
        let root: PathBuf = root.into();
        let root = dunce::canonicalize(&root).unwrap_or(root);
        Self {
            root,
            volume_name: volume_name.into(),
            file_mode: None,
            dir_mode: None,
        }
    }

    /// Modes applied to created files and directories.
    pub fn with_modes(mut self, file_mode: Option<u32>, dir_mode: Option<u32>) -> Self {
        self.file_mode = file_mode;
        self.dir_mode = dir_mode;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an id to a path under the root without following its last
    /// component.
    ///
    /// Returns an error if the parent directory resolves outside the root.
    fn resolve(&self, id: &str) -> VfsResult<PathBuf> {
        let id = path::normalize(id);
        let rel = id.trim_start_matches('/');
        if rel.is_empty() {
            return Ok(self.root.clone());
        }
        let full = self.root.join(rel);
        let parent = full
            .parent()
            .ok_or_else(|| VfsError::invalid_path("no parent"))?;
        let filename = full
            .file_name()
            .ok_or_else(|| VfsError::invalid_path("no filename"))?;

        let parent = dunce::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());
        if !parent.starts_with(&self.root) {
            return Err(VfsError::path_escapes_root(format!(
                "{} is not under {}",
                parent.display(),
                self.root.display()
            )));
        }
        Ok(parent.join(filename))
    }

    /// Like [`resolve`](Self::resolve), but follows symlinks and requires
    /// the target to stay under the root.
    fn resolve_followed(&self, id: &str) -> VfsResult<PathBuf> {
        let full = self.resolve(id)?;
        let canonical = dunce::canonicalize(&full)?;
        if !canonical.starts_with(&self.root) {
            return Err(VfsError::path_escapes_root(id.to_string()));
        }
        Ok(canonical)
    }

    async fn ensure_absent(&self, dest: &Path, id: &str) -> VfsResult<()> {
        match fs::symlink_metadata(dest).await {
            Ok(_) => Err(VfsError::already_exists(id)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_mode(&self, path: &Path, mode: u32) -> VfsResult<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = (path, mode);
            Err(VfsError::not_implemented("local", "chmod"))
        }
    }
}

#[cfg(unix)]
fn access(path: &Path) -> (bool, bool) {
    use rustix::fs::{Access, access};
    (
        access(path, Access::READ_OK).is_ok(),
        access(path, Access::WRITE_OK).is_ok(),
    )
}

#[cfg(not(unix))]
fn access(path: &Path) -> (bool, bool) {
    let writable = std::fs::metadata(path)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false);
    (true, writable)
}

/// Recursive copy that keeps going across directories.
pub(crate) fn copy_recursive<'a>(src: &'a Path, dest: &'a Path) -> BoxFuture<'a, io::Result<()>> {
    async move {
        let meta = fs::metadata(src).await?;
        if meta.is_dir() {
            fs::create_dir(dest).await?;
            let mut dir = fs::read_dir(src).await?;
            while let Some(entry) = dir.next_entry().await? {
                copy_recursive(&entry.path(), &dest.join(entry.file_name())).await?;
            }
        } else {
            fs::copy(src, dest).await?;
        }
        Ok(())
    }
    .boxed()
}

/// Rename, falling back to copy + remove across filesystems.
pub(crate) async fn move_path(src: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(src, dest).await {
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            copy_recursive(src, dest).await?;
            if fs::symlink_metadata(src).await?.is_dir() {
                fs::remove_dir_all(src).await
            } else {
                fs::remove_file(src).await
            }
        }
        other => other,
    }
}

#[async_trait]
impl BackendOps for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn init(&self) -> bool {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => true,
            _ => {
                error!(root = %self.root.display(), volume = %self.volume_name, "local volume root does not exist");
                false
            }
        }
    }

    async fn stat(&self, id: &str) -> VfsResult<Option<FileStat>> {
        let full = self.resolve(id)?;
        let meta = match fs::symlink_metadata(&full).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let id = path::normalize(id);
        let is_root = id == ROOT_ID;
        let name = if is_root {
            self.volume_name.clone()
        } else {
            path::basename(&id).to_string()
        };
        let (mut readable, mut writable) = access(&full);

        let target = if meta.file_type().is_symlink() {
            fs::metadata(&full).await.ok()
        } else {
            Some(meta.clone())
        };
        let mime = match target {
            None => {
                readable = true;
                writable = true;
                BROKEN_SYMLINK.to_string()
            }
            Some(t) if t.is_dir() || is_root => DIRECTORY.to_string(),
            Some(_) => guess_mime(&name),
        };

        Ok(Some(FileStat {
            parent: path::parent(&id),
            size: if mime == DIRECTORY { 0 } else { meta.len() },
            ts: meta.modified().map(unix_ts).unwrap_or(0),
            name,
            mime,
            readable,
            writable,
        }))
    }

    async fn readdir(&self, id: &str) -> VfsResult<Vec<Listed>> {
        let full = self.resolve(id)?;
        let id = path::normalize(id);
        let mut out = Vec::new();
        let mut dir = fs::read_dir(&full).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            out.push(Listed::id(path::join(&id, &name)));
        }
        Ok(out)
    }

    async fn read(&self, id: &str, range: Option<ByteRange>) -> VfsResult<ByteStream> {
        let full = self.resolve_followed(id)?;
        let mut file = fs::File::open(&full).await?;
        match range {
            Some(range) => {
                file.seek(io::SeekFrom::Start(range.start)).await?;
                Ok(Box::pin(file.take(range.len())))
            }
            None => Ok(Box::pin(file)),
        }
    }

    async fn write(&self, dir: &str, name: &str, mut data: ByteStream) -> VfsResult<String> {
        let id = path::join(&path::normalize(dir), name);
        let full = self.resolve(&id)?;
        let mut file = fs::File::create(&full).await?;
        tokio::io::copy(&mut data, &mut file).await?;
        file.flush().await?;
        Ok(id)
    }

    async fn mkdir(&self, dir: &str, name: &str) -> VfsResult<String> {
        let id = path::join(&path::normalize(dir), name);
        let full = self.resolve(&id)?;
        fs::create_dir(&full).await?;
        Ok(id)
    }

    async fn move_to(&self, src: &str, dir: &str, name: &str) -> VfsResult<String> {
        let id = path::join(&path::normalize(dir), name);
        let from = self.resolve(src)?;
        let to = self.resolve(&id)?;
        self.ensure_absent(&to, &id).await?;
        move_path(&from, &to).await?;
        Ok(id)
    }

    async fn rename(&self, src: &str, name: &str) -> VfsResult<String> {
        let src = path::normalize(src);
        let parent = path::parent(&src).ok_or_else(|| VfsError::invalid_path("cannot rename a root"))?;
        self.move_to(&src, &parent, name).await
    }

    async fn copy(&self, src: &str, dir: &str, name: &str) -> VfsResult<String> {
        let id = path::join(&path::normalize(dir), name);
        let from = self.resolve_followed(src)?;
        let to = self.resolve(&id)?;
        self.ensure_absent(&to, &id).await?;
        copy_recursive(&from, &to).await?;
        Ok(id)
    }

    async fn chmod(&self, id: &str, mode: u32) -> VfsResult<()> {
        let full = self.resolve(id)?;
        self.set_mode(&full, mode).await
    }

    async fn rm(&self, id: &str) -> VfsResult<()> {
        let full = self.resolve(id)?;
        if full == self.root {
            return Err(VfsError::permission_denied("cannot remove the volume root"));
        }
        let meta = fs::symlink_metadata(&full).await?;
        if meta.is_dir() {
            fs::remove_dir_all(&full).await?;
        } else {
            fs::remove_file(&full).await?;
        }
        Ok(())
    }

    async fn upload(&self, tmp: &Path, dir: &str, name: &str) -> VfsResult<String> {
        let id = path::join(&path::normalize(dir), name);
        let dest = self.resolve(&id)?;
        move_path(tmp, &dest).await?;
        Ok(id)
    }

    async fn fix_permissions(&self, id: &str) -> VfsResult<()> {
        let full = self.resolve(id)?;
        let meta = match fs::metadata(&full).await {
            Ok(meta) => meta,
            Err(_) => return Ok(()),
        };
        let mode = if meta.is_dir() {
            self.dir_mode
        } else {
            self.file_mode
        };
        match mode {
            Some(mode) => self.set_mode(&full, mode).await,
            None => Ok(()),
        }
    }

    fn uri(&self, id: &str) -> String {
        let rel = path::normalize(id);
        let full = self.root.join(rel.trim_start_matches('/'));
        let mut p = full.to_string_lossy().replace('\\', "/");
        if !p.starts_with('/') {
            p.insert(0, '/');
        }
        format!("file://{p}")
    }

    fn local_path(&self, id: &str) -> Option<PathBuf> {
        self.resolve(id).ok()
    }
}

/// Builds [`LocalBackend`]s from a volume's `root`.
#[derive(Debug, Default)]
pub struct LocalFactory;

impl BackendFactory for LocalFactory {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn create(&self, volume: &Volume) -> VfsResult<std::sync::Arc<dyn BackendOps>> {
        let root = volume
            .config()
            .root
            .as_deref()
            .ok_or_else(|| VfsError::other(format!("volume {} has no root", volume.id())))?;
        Ok(std::sync::Arc::new(
            LocalBackend::new(root, volume.name()).with_modes(volume.file_mode(), volume.dir_mode()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::bytes_stream;
    use tempfile::TempDir;

    fn setup() -> (LocalBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path(), "share");
        (backend, dir)
    }

    async fn read_all(backend: &LocalBackend, id: &str, range: Option<ByteRange>) -> Vec<u8> {
        let mut stream = backend.read(id, range).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (backend, _dir) = setup();
        let id = backend
            .write("/", "test.txt", bytes_stream("hello world"))
            .await
            .unwrap();
        assert_eq!(id, "/test.txt");
        assert_eq!(read_all(&backend, &id, None).await, b"hello world");
        assert_eq!(
            read_all(&backend, &id, Some(ByteRange::new(6, 11))).await,
            b"world"
        );
    }

    #[tokio::test]
    async fn test_stat_root_and_file() {
        let (backend, dir) = setup();
        std::fs::write(dir.path().join("a.png"), "12345").unwrap();

        let root = backend.stat("/").await.unwrap().unwrap();
        assert_eq!(root.name, "share");
        assert_eq!(root.mime, DIRECTORY);
        assert_eq!(root.parent, None);

        let stat = backend.stat("/a.png").await.unwrap().unwrap();
        assert_eq!(stat.mime, "image/png");
        assert_eq!(stat.size, 5);
        assert_eq!(stat.parent.as_deref(), Some("/"));
        assert!(stat.readable);

        assert!(backend.stat("/missing").await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_broken_symlink() {
        let (backend, dir) = setup();
        std::os::unix::fs::symlink(dir.path().join("gone"), dir.path().join("link")).unwrap();
        let stat = backend.stat("/link").await.unwrap().unwrap();
        assert_eq!(stat.mime, BROKEN_SYMLINK);
    }

    #[tokio::test]
    async fn test_mkdir_is_not_recursive_or_idempotent() {
        let (backend, _dir) = setup();
        backend.mkdir("/", "sub").await.unwrap();
        let again = backend.mkdir("/", "sub").await.unwrap_err();
        assert!(again.is_already_exists());
        assert!(backend.mkdir("/nope", "deeper").await.is_err());
    }

    #[tokio::test]
    async fn test_rename_move_copy() {
        let (backend, _dir) = setup();
        backend.mkdir("/", "d").await.unwrap();
        backend.write("/", "old.txt", bytes_stream("content")).await.unwrap();

        let renamed = backend.rename("/old.txt", "new.txt").await.unwrap();
        assert_eq!(renamed, "/new.txt");
        assert!(backend.stat("/old.txt").await.unwrap().is_none());

        let copied = backend.copy("/new.txt", "/d", "copy.txt").await.unwrap();
        assert_eq!(read_all(&backend, &copied, None).await, b"content");
        assert!(backend.copy("/new.txt", "/d", "copy.txt").await.unwrap_err().is_already_exists());

        let moved = backend.move_to("/new.txt", "/d", "moved.txt").await.unwrap();
        assert_eq!(moved, "/d/moved.txt");
        let mut names: Vec<_> = backend
            .readdir("/d")
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.id)
            .collect();
        names.sort();
        assert_eq!(names, ["/d/copy.txt", "/d/moved.txt"]);
    }

    #[tokio::test]
    async fn test_rm_recursive() {
        let (backend, _dir) = setup();
        backend.mkdir("/", "d").await.unwrap();
        backend.write("/d", "f.txt", bytes_stream("x")).await.unwrap();
        backend.rm("/d").await.unwrap();
        assert!(backend.stat("/d").await.unwrap().is_none());
        assert!(backend.rm("/").await.is_err());
    }

    #[tokio::test]
    async fn test_path_escape_blocked() {
        let (backend, dir) = setup();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), "s").unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
            assert!(backend.read("/escape/secret", None).await.is_err());
        }
        // `..` is normalized away and never leaves the root
        assert!(backend.stat("/../../etc/passwd").await.unwrap().is_none());
        let _ = dir;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fix_permissions_applies_volume_modes() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path(), "v").with_modes(Some(0o600), Some(0o700));
        let id = backend.write("/", "f", bytes_stream("x")).await.unwrap();
        backend.fix_permissions(&id).await.unwrap();
        let mode = std::fs::metadata(dir.path().join("f")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_upload_moves_staged_file() {
        let (backend, _dir) = setup();
        let staging = TempDir::new().unwrap();
        let tmp = staging.path().join("upload");
        std::fs::write(&tmp, "payload").unwrap();
        let id = backend.upload(&tmp, "/", "file.bin").await.unwrap();
        assert!(!tmp.exists());
        assert_eq!(read_all(&backend, &id, None).await, b"payload");
    }

    #[tokio::test]
    async fn test_uri_and_local_path() {
        let (backend, _dir) = setup();
        assert!(backend.uri("/a b.txt").starts_with("file:///"));
        let local = backend.local_path("/x").unwrap();
        assert!(local.starts_with(backend.root()));
    }
}
