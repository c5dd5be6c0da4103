//! FTP backend.
//!
//! Talks to the server through an [`FtpSession`], so the protocol client can
//! be swapped for a fake in tests. One session per driver, opened by `init`.
//!
//! Downloads are spooled through a scratch file: the control channel owes a
//! transfer reply until the data connection is drained, and the session lock
//! cannot be held by a stream handed to the caller.

mod client;

pub use client::{ClientConnector, ClientSession};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, warn};

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{BackendFactory, BackendOps, ByteStream};
use crate::vfs::path;
use crate::vfs::types::{ByteRange, FileStat, Listed, ROOT_ID};
use crate::volume::Volume;

/// One row of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    /// Modification time, unix seconds (0 when the server did not say).
    pub modified: i64,
}

/// Narrow FTP capability set the backend is written against.
#[async_trait]
pub trait FtpSession: Send {
    async fn list(&mut self, dir: &str) -> VfsResult<Vec<RemoteEntry>>;
    /// Download `range` of a file (all of it for `None`) into `sink`.
    /// Returns the number of bytes written.
    async fn retrieve(
        &mut self,
        id: &str,
        range: Option<ByteRange>,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> VfsResult<u64>;
    async fn store(&mut self, id: &str, data: ByteStream) -> VfsResult<()>;
    async fn mkdir(&mut self, id: &str) -> VfsResult<()>;
    async fn rename(&mut self, from: &str, to: &str) -> VfsResult<()>;
    async fn delete(&mut self, id: &str) -> VfsResult<()>;
    async fn rmdir(&mut self, id: &str) -> VfsResult<()>;
    /// Send a `SITE` command.
    async fn site(&mut self, command: &str) -> VfsResult<()>;
    async fn quit(&mut self);
}

/// Connection settings for one FTP volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

impl FtpParams {
    pub fn from_volume(volume: &Volume) -> VfsResult<Self> {
        let config = volume.config();
        let host = config
            .host
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| VfsError::other(format!("volume {} has no host", volume.id())))?;
        Ok(Self {
            host,
            port: config.port.unwrap_or(21),
            user: config.user.clone().unwrap_or_else(|| "anonymous".to_string()),
            pass: config.pass.clone().unwrap_or_default(),
        })
    }
}

/// Opens sessions for an [`FtpBackend`].
#[async_trait]
pub trait FtpConnector: Send + Sync {
    async fn connect(&self, params: &FtpParams) -> VfsResult<Box<dyn FtpSession>>;
}

type SessionSlot = Mutex<Option<Box<dyn FtpSession>>>;

/// The locked session slot, connected.
struct Live<'a>(MutexGuard<'a, Option<Box<dyn FtpSession>>>);

impl Live<'_> {
    fn get(&mut self) -> VfsResult<&mut (dyn FtpSession + 'static)> {
        self.0
            .as_deref_mut()
            .ok_or_else(|| VfsError::protocol("ftp session unavailable"))
    }
}

/// FTP backend.
pub struct FtpBackend {
    params: FtpParams,
    volume_name: String,
    scratch: PathBuf,
    connector: Arc<dyn FtpConnector>,
    session: SessionSlot,
}

impl std::fmt::Debug for FtpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpBackend")
            .field("host", &self.params.host)
            .field("port", &self.params.port)
            .field("user", &self.params.user)
            .finish()
    }
}

impl FtpBackend {
    pub fn new(
        params: FtpParams,
        volume_name: impl Into<String>,
        scratch: impl Into<PathBuf>,
        connector: Arc<dyn FtpConnector>,
    ) -> Self {
        Self {
            params,
            volume_name: volume_name.into(),
            scratch: scratch.into(),
            connector,
            session: Mutex::new(None),
        }
    }

    /// The live session, reconnecting if it was dropped.
    async fn session(&self) -> VfsResult<Live<'_>> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.connector.connect(&self.params).await?);
        }
        Ok(Live(guard))
    }

    /// Download into a fresh scratch file and return its path.
    async fn spool(&self, id: &str, range: Option<ByteRange>) -> VfsResult<PathBuf> {
        tokio::fs::create_dir_all(&self.scratch).await?;
        let tmp = self.scratch.join(format!("ftp-{}", uuid::Uuid::new_v4()));
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            self.session().await?.get()?.retrieve(id, range, &mut file).await?;
            file.flush().await?;
            Ok::<(), VfsError>(())
        }
        .await;
        match result {
            Ok(()) => Ok(tmp),
            Err(e) => {
                remove_scratch(&tmp).await;
                Err(e)
            }
        }
    }

    fn to_stat(&self, dir: &str, entry: &RemoteEntry) -> FileStat {
        let parent = Some(dir.to_string());
        if entry.is_dir {
            FileStat::directory(&entry.name, parent, entry.modified)
        } else {
            FileStat::file(&entry.name, parent, entry.size, entry.modified)
        }
    }

    async fn list(&self, dir: &str) -> VfsResult<Vec<Listed>> {
        let entries = self.session().await?.get()?.list(dir).await?;
        Ok(entries
            .iter()
            .map(|e| Listed::with_stat(path::join(dir, &e.name), self.to_stat(dir, e)))
            .collect())
    }

    async fn ensure_absent(&self, id: &str) -> VfsResult<()> {
        match self.stat(id).await? {
            Some(_) => Err(VfsError::already_exists(id)),
            None => Ok(()),
        }
    }

    fn remove_tree<'a>(&'a self, id: &'a str, is_dir: bool) -> BoxFuture<'a, VfsResult<()>> {
        async move {
            if !is_dir {
                return self.session().await?.get()?.delete(id).await;
            }
            for child in self.list(id).await? {
                let child_dir = child.stat.as_ref().is_some_and(FileStat::is_dir);
                self.remove_tree(&child.id, child_dir).await?;
            }
            self.session().await?.get()?.rmdir(id).await
        }
        .boxed()
    }

    /// Copy one entry through a local scratch file per regular file.
    fn copy_tree<'a>(&'a self, src: &'a str, dest: &'a str, is_dir: bool) -> BoxFuture<'a, VfsResult<()>> {
        async move {
            if is_dir {
                self.session().await?.get()?.mkdir(dest).await?;
                for child in self.list(src).await? {
                    let name = path::basename(&child.id).to_string();
                    let child_dir = child.stat.as_ref().is_some_and(FileStat::is_dir);
                    self.copy_tree(&child.id, &path::join(dest, &name), child_dir)
                        .await?;
                }
                return Ok(());
            }

            let tmp = self.spool(src, None).await?;
            let result = async {
                let file = tokio::fs::File::open(&tmp).await?;
                self.session().await?.get()?.store(dest, Box::pin(file)).await
            }
            .await;
            remove_scratch(&tmp).await;
            result
        }
        .boxed()
    }
}

#[async_trait]
impl BackendOps for FtpBackend {
    fn kind(&self) -> &'static str {
        "ftp"
    }

    async fn init(&self) -> bool {
        match self.session().await {
            Ok(_) => true,
            Err(e) => {
                error!(host = %self.params.host, volume = %self.volume_name, "FTP volume could not connect: {e}");
                false
            }
        }
    }

    async fn destroy(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            session.quit().await;
        }
    }

    async fn stat(&self, id: &str) -> VfsResult<Option<FileStat>> {
        let id = path::normalize(id);
        let Some(parent) = path::parent(&id) else {
            return Ok(Some(FileStat::directory(&self.volume_name, None, 0)));
        };
        let listed = match self.list(&parent).await {
            Ok(listed) => listed,
            Err(VfsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(listed.into_iter().find(|l| l.id == id).and_then(|l| l.stat))
    }

    async fn readdir(&self, id: &str) -> VfsResult<Vec<Listed>> {
        self.list(&path::normalize(id)).await
    }

    async fn read(&self, id: &str, range: Option<ByteRange>) -> VfsResult<ByteStream> {
        let tmp = self.spool(&path::normalize(id), range).await?;
        let file = tokio::fs::File::open(&tmp).await;
        // The open handle keeps the content readable once unlinked.
        remove_scratch(&tmp).await;
        Ok(Box::pin(file?))
    }

    async fn write(&self, dir: &str, name: &str, data: ByteStream) -> VfsResult<String> {
        let id = path::join(&path::normalize(dir), name);
        self.session().await?.get()?.store(&id, data).await?;
        Ok(id)
    }

    async fn mkdir(&self, dir: &str, name: &str) -> VfsResult<String> {
        let id = path::join(&path::normalize(dir), name);
        self.ensure_absent(&id).await?;
        self.session().await?.get()?.mkdir(&id).await?;
        Ok(id)
    }

    async fn move_to(&self, src: &str, dir: &str, name: &str) -> VfsResult<String> {
        let id = path::join(&path::normalize(dir), name);
        self.ensure_absent(&id).await?;
        self.session().await?.get()?.rename(&path::normalize(src), &id).await?;
        Ok(id)
    }

    async fn rename(&self, src: &str, name: &str) -> VfsResult<String> {
        let src = path::normalize(src);
        let parent = path::parent(&src).ok_or_else(|| VfsError::invalid_path("cannot rename a root"))?;
        self.move_to(&src, &parent, name).await
    }

    async fn copy(&self, src: &str, dir: &str, name: &str) -> VfsResult<String> {
        let id = path::join(&path::normalize(dir), name);
        let src = path::normalize(src);
        let stat = self.stat(&src).await?.ok_or_else(|| VfsError::not_found(&src))?;
        self.ensure_absent(&id).await?;
        self.copy_tree(&src, &id, stat.is_dir()).await?;
        Ok(id)
    }

    async fn chmod(&self, id: &str, mode: u32) -> VfsResult<()> {
        let id = path::normalize(id);
        self.session()
            .await?
            .get()?
            .site(&format!("CHMOD {mode:o} {id}"))
            .await
    }

    async fn rm(&self, id: &str) -> VfsResult<()> {
        let id = path::normalize(id);
        if id == ROOT_ID {
            return Err(VfsError::permission_denied("cannot remove the volume root"));
        }
        let stat = self.stat(&id).await?.ok_or_else(|| VfsError::not_found(&id))?;
        self.remove_tree(&id, stat.is_dir()).await
    }

    async fn upload(&self, tmp: &Path, dir: &str, name: &str) -> VfsResult<String> {
        let file = tokio::fs::File::open(tmp).await?;
        let id = self.write(dir, name, Box::pin(file)).await?;
        tokio::fs::remove_file(tmp).await?;
        Ok(id)
    }

    fn uri(&self, id: &str) -> String {
        let port = if self.params.port == 21 {
            String::new()
        } else {
            format!(":{}", self.params.port)
        };
        format!(
            "ftp://{}@{}{}{}",
            self.params.user,
            self.params.host,
            port,
            path::normalize(id)
        )
    }
}

async fn remove_scratch(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), "could not remove ftp scratch file: {e}");
    }
}

/// Builds [`FtpBackend`]s. Net-mountable as `ftp`.
pub struct FtpFactory {
    connector: Arc<dyn FtpConnector>,
}

impl std::fmt::Debug for FtpFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpFactory").finish_non_exhaustive()
    }
}

impl Default for FtpFactory {
    fn default() -> Self {
        Self::new(Arc::new(ClientConnector))
    }
}

impl FtpFactory {
    pub fn new(connector: Arc<dyn FtpConnector>) -> Self {
        Self { connector }
    }
}

impl BackendFactory for FtpFactory {
    fn kind(&self) -> &'static str {
        "ftp"
    }

    fn net_protocol(&self) -> Option<&'static str> {
        Some("ftp")
    }

    fn create(&self, volume: &Volume) -> VfsResult<Arc<dyn BackendOps>> {
        Ok(Arc::new(FtpBackend::new(
            FtpParams::from_volume(volume)?,
            volume.name(),
            volume.scratch_dir(),
            self.connector.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::bytes_stream;
    use parking_lot::Mutex as SyncMutex;
    use tokio::io::AsyncReadExt;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[derive(Clone)]
    enum FakeNode {
        Dir,
        File(Vec<u8>),
    }

    /// In-process FTP server state shared by every fake session.
    #[derive(Default, Clone)]
    struct FakeServer {
        nodes: Arc<SyncMutex<BTreeMap<String, FakeNode>>>,
        log: Arc<SyncMutex<Vec<String>>>,
    }

    struct FakeSession(FakeServer);

    #[async_trait]
    impl FtpSession for FakeSession {
        async fn list(&mut self, dir: &str) -> VfsResult<Vec<RemoteEntry>> {
            self.0.log.lock().push(format!("LIST {dir}"));
            let nodes = self.0.nodes.lock();
            if dir != "/" && !matches!(nodes.get(dir), Some(FakeNode::Dir)) {
                return Err(VfsError::not_found(dir));
            }
            Ok(nodes
                .iter()
                .filter(|(k, _)| k.as_str() != "/" && path::parent(k).as_deref() == Some(dir))
                .map(|(k, n)| RemoteEntry {
                    name: path::basename(k).to_string(),
                    is_dir: matches!(n, FakeNode::Dir),
                    size: match n {
                        FakeNode::File(d) => d.len() as u64,
                        FakeNode::Dir => 0,
                    },
                    modified: 1_700_000_000,
                })
                .collect())
        }

        async fn retrieve(
            &mut self,
            id: &str,
            range: Option<ByteRange>,
            sink: &mut (dyn AsyncWrite + Unpin + Send),
        ) -> VfsResult<u64> {
            self.0.log.lock().push(format!("RETR {id}"));
            let data = match self.0.nodes.lock().get(id) {
                Some(FakeNode::File(d)) => d.clone(),
                _ => return Err(VfsError::not_found(id)),
            };
            let slice = match range {
                Some(r) => &data[r.start as usize..(r.end as usize).min(data.len())],
                None => &data[..],
            };
            sink.write_all(slice).await?;
            Ok(slice.len() as u64)
        }

        async fn store(&mut self, id: &str, mut data: ByteStream) -> VfsResult<()> {
            let mut buf = Vec::new();
            data.read_to_end(&mut buf).await?;
            self.0.nodes.lock().insert(id.to_string(), FakeNode::File(buf));
            Ok(())
        }

        async fn mkdir(&mut self, id: &str) -> VfsResult<()> {
            self.0.nodes.lock().insert(id.to_string(), FakeNode::Dir);
            Ok(())
        }

        async fn rename(&mut self, from: &str, to: &str) -> VfsResult<()> {
            let mut nodes = self.0.nodes.lock();
            let moved: Vec<_> = nodes
                .keys()
                .filter(|k| *k == from || k.starts_with(&format!("{from}/")))
                .cloned()
                .collect();
            for key in moved {
                if let Some(node) = nodes.remove(&key) {
                    nodes.insert(format!("{to}{}", &key[from.len()..]), node);
                }
            }
            Ok(())
        }

        async fn delete(&mut self, id: &str) -> VfsResult<()> {
            self.0.log.lock().push(format!("DELE {id}"));
            self.0.nodes.lock().remove(id);
            Ok(())
        }

        async fn rmdir(&mut self, id: &str) -> VfsResult<()> {
            self.0.log.lock().push(format!("RMD {id}"));
            self.0.nodes.lock().remove(id);
            Ok(())
        }

        async fn site(&mut self, command: &str) -> VfsResult<()> {
            self.0.log.lock().push(format!("SITE {command}"));
            Ok(())
        }

        async fn quit(&mut self) {
            self.0.log.lock().push("QUIT".to_string());
        }
    }

    struct FakeConnector {
        server: FakeServer,
        reachable: bool,
    }

    #[async_trait]
    impl FtpConnector for FakeConnector {
        async fn connect(&self, _params: &FtpParams) -> VfsResult<Box<dyn FtpSession>> {
            if self.reachable {
                Ok(Box::new(FakeSession(self.server.clone())))
            } else {
                Err(VfsError::protocol("530 Login incorrect"))
            }
        }
    }

    fn params() -> FtpParams {
        FtpParams {
            host: "ftp.example.com".to_string(),
            port: 21,
            user: "alice".to_string(),
            pass: "hunter2".to_string(),
        }
    }

    fn setup(reachable: bool) -> (FtpBackend, FakeServer, TempDir) {
        let server = FakeServer::default();
        server.nodes.lock().insert("/".to_string(), FakeNode::Dir);
        let scratch = TempDir::new().unwrap();
        let backend = FtpBackend::new(
            params(),
            "remote",
            scratch.path(),
            Arc::new(FakeConnector {
                server: server.clone(),
                reachable,
            }),
        );
        (backend, server, scratch)
    }

    async fn read_all(backend: &FtpBackend, id: &str, range: Option<ByteRange>) -> Vec<u8> {
        let mut buf = Vec::new();
        backend
            .read(id, range)
            .await
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_init_false_when_unreachable() {
        let (backend, _server, _scratch) = setup(false);
        assert!(!backend.init().await);
        let (backend, _server, _scratch) = setup(true);
        assert!(backend.init().await);
    }

    #[tokio::test]
    async fn test_listing_carries_stats_and_stat_uses_parent() {
        let (backend, server, _scratch) = setup(true);
        backend.mkdir("/", "docs").await.unwrap();
        backend.write("/docs", "a.txt", bytes_stream("abc")).await.unwrap();

        let listed = backend.readdir("/docs").await.unwrap();
        assert_eq!(listed.len(), 1);
        let stat = listed[0].stat.as_ref().unwrap();
        assert_eq!(stat.size, 3);
        assert_eq!(stat.ts, 1_700_000_000);
        assert_eq!(stat.parent.as_deref(), Some("/docs"));

        server.log.lock().clear();
        let stat = backend.stat("/docs/a.txt").await.unwrap().unwrap();
        assert_eq!(stat.mime, "text/plain");
        assert_eq!(server.log.lock().as_slice(), ["LIST /docs"]);
        assert!(backend.stat("/nope/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ranged_read_stops_at_end() {
        let (backend, _server, scratch) = setup(true);
        backend.write("/", "f.bin", bytes_stream("0123456789")).await.unwrap();
        assert_eq!(read_all(&backend, "/f.bin", Some(ByteRange::new(2, 5))).await, b"234");
        assert_eq!(read_all(&backend, "/f.bin", None).await, b"0123456789");
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
        assert!(backend.read("/missing.bin", None).await.is_err());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_copy_through_scratch_and_recursive_rm() {
        let (backend, server, scratch) = setup(true);
        backend.mkdir("/", "src").await.unwrap();
        backend.write("/src", "f.txt", bytes_stream("data")).await.unwrap();

        backend.copy("/src", "/", "dst").await.unwrap();
        assert_eq!(read_all(&backend, "/dst/f.txt", None).await, b"data");
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
        assert!(backend.mkdir("/", "dst").await.unwrap_err().is_already_exists());

        server.log.lock().clear();
        backend.rm("/src").await.unwrap();
        let log = server.log.lock().clone();
        assert!(log.contains(&"DELE /src/f.txt".to_string()));
        assert!(log.contains(&"RMD /src".to_string()));
    }

    #[tokio::test]
    async fn test_chmod_and_uri_and_destroy() {
        let (backend, server, _scratch) = setup(true);
        backend.chmod("/a b.txt", 0o644).await.unwrap();
        let uri = backend.uri("/dir/a.txt");
        assert_eq!(uri, "ftp://alice@ftp.example.com/dir/a.txt");
        assert!(!uri.contains("hunter2"));
        backend.destroy().await;
        let log = server.log.lock().clone();
        assert_eq!(log, ["SITE CHMOD 644 /a b.txt", "QUIT"]);
    }
}
