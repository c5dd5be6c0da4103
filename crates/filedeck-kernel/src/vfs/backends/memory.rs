//! In-memory filesystem backend.
//!
//! Used for scratch volumes and testing. All data is ephemeral.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{BackendFactory, BackendOps, ByteStream, bytes_stream};
use crate::vfs::path;
use crate::vfs::types::{ByteRange, FileStat, Listed, ROOT_ID, now_ts};
use crate::volume::Volume;

#[derive(Debug, Clone)]
enum Node {
    File { data: Arc<Vec<u8>>, ts: i64 },
    Directory { ts: i64 },
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self, Node::Directory { .. })
    }
}

/// The tree behind one memory volume.
///
/// Shared by every driver opened on the volume, so data outlives requests.
/// Keys are normalized backend ids.
#[derive(Debug)]
pub struct MemoryStore {
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store holding only the root directory.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_ID.to_string(), Node::Directory { ts: now_ts() });
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Ids strictly below `id`, in key order.
    fn descendants(nodes: &BTreeMap<String, Node>, id: &str) -> Vec<String> {
        let prefix = if id == ROOT_ID {
            ROOT_ID.to_string()
        } else {
            format!("{id}/")
        };
        nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.as_str() != ROOT_ID)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn require_dir(nodes: &BTreeMap<String, Node>, id: &str) -> VfsResult<()> {
        match nodes.get(id) {
            Some(node) if node.is_dir() => Ok(()),
            Some(_) => Err(VfsError::not_a_directory(id)),
            None => Err(VfsError::not_found(id)),
        }
    }

    /// Copy `src` and everything below it to `dest`.
    fn copy_subtree(nodes: &mut BTreeMap<String, Node>, src: &str, dest: &str) -> VfsResult<()> {
        let node = nodes.get(src).cloned().ok_or_else(|| VfsError::not_found(src))?;
        let below = Self::descendants(nodes, src);
        let mut copies = vec![(dest.to_string(), node)];
        for id in below {
            if let Some(node) = nodes.get(&id) {
                let rel = &id[src.len()..];
                copies.push((format!("{dest}{rel}"), node.clone()));
            }
        }
        nodes.extend(copies);
        Ok(())
    }

    fn remove_subtree(nodes: &mut BTreeMap<String, Node>, id: &str) {
        for child in Self::descendants(nodes, id) {
            nodes.remove(&child);
        }
        nodes.remove(id);
    }
}

/// In-memory filesystem backend.
///
/// Thread-safe via the store's internal `RwLock`.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    volume_id: String,
    volume_name: String,
}

impl MemoryBackend {
    pub fn new(store: Arc<MemoryStore>, volume_id: impl Into<String>, volume_name: impl Into<String>) -> Self {
        Self {
            store,
            volume_id: volume_id.into(),
            volume_name: volume_name.into(),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    fn stat_node(&self, id: &str, node: &Node) -> FileStat {
        let parent = path::parent(id);
        let name = if id == ROOT_ID {
            self.volume_name.clone()
        } else {
            path::basename(id).to_string()
        };
        match node {
            Node::Directory { ts } => FileStat::directory(name, parent, *ts),
            Node::File { data, ts } => FileStat::file(name, parent, data.len() as u64, *ts),
        }
    }

    fn target(&self, dir: &str, name: &str) -> VfsResult<String> {
        path::validate_name(name)?;
        Ok(path::join(&path::normalize(dir), name))
    }

    fn move_subtree(&self, src: &str, dest: &str) -> VfsResult<()> {
        let src = path::normalize(src);
        if src == ROOT_ID {
            return Err(VfsError::permission_denied("cannot move the volume root"));
        }
        if dest.starts_with(&format!("{src}/")) {
            return Err(VfsError::invalid_path(format!("cannot move {src} into itself")));
        }
        let mut nodes = self.store.nodes.write();
        if nodes.contains_key(dest) {
            return Err(VfsError::already_exists(dest));
        }
        if let Some(parent) = path::parent(dest) {
            MemoryStore::require_dir(&nodes, &parent)?;
        }
        MemoryStore::copy_subtree(&mut nodes, &src, dest)?;
        MemoryStore::remove_subtree(&mut nodes, &src);
        Ok(())
    }
}

#[async_trait]
impl BackendOps for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn stat(&self, id: &str) -> VfsResult<Option<FileStat>> {
        let id = path::normalize(id);
        let nodes = self.store.nodes.read();
        Ok(nodes.get(&id).map(|node| self.stat_node(&id, node)))
    }

    async fn readdir(&self, id: &str) -> VfsResult<Vec<Listed>> {
        let id = path::normalize(id);
        let nodes = self.store.nodes.read();
        MemoryStore::require_dir(&nodes, &id)?;
        let listed = MemoryStore::descendants(&nodes, &id)
            .into_iter()
            .filter(|child| path::parent(child).as_deref() == Some(id.as_str()))
            .filter_map(|child| {
                let stat = self.stat_node(&child, nodes.get(&child)?);
                Some(Listed::with_stat(child, stat))
            })
            .collect();
        Ok(listed)
    }

    async fn read(&self, id: &str, range: Option<ByteRange>) -> VfsResult<ByteStream> {
        let id = path::normalize(id);
        let data = match self.store.nodes.read().get(&id) {
            Some(Node::File { data, .. }) => data.clone(),
            Some(Node::Directory { .. }) => return Err(VfsError::is_a_directory(id)),
            None => return Err(VfsError::not_found(id)),
        };
        let len = data.len() as u64;
        let range = range.unwrap_or(ByteRange::new(0, len)).clamped(len);
        Ok(bytes_stream(&data[range.start as usize..range.end as usize]))
    }

    async fn write(&self, dir: &str, name: &str, mut data: ByteStream) -> VfsResult<String> {
        let id = self.target(dir, name)?;
        let mut buf = Vec::new();
        data.read_to_end(&mut buf).await?;

        let mut nodes = self.store.nodes.write();
        MemoryStore::require_dir(&nodes, &path::normalize(dir))?;
        if nodes.get(&id).is_some_and(Node::is_dir) {
            return Err(VfsError::is_a_directory(id));
        }
        nodes.insert(
            id.clone(),
            Node::File {
                data: Arc::new(buf),
                ts: now_ts(),
            },
        );
        Ok(id)
    }

    async fn mkdir(&self, dir: &str, name: &str) -> VfsResult<String> {
        let id = self.target(dir, name)?;
        let mut nodes = self.store.nodes.write();
        MemoryStore::require_dir(&nodes, &path::normalize(dir))?;
        if nodes.contains_key(&id) {
            return Err(VfsError::already_exists(id));
        }
        nodes.insert(id.clone(), Node::Directory { ts: now_ts() });
        Ok(id)
    }

    async fn move_to(&self, src: &str, dir: &str, name: &str) -> VfsResult<String> {
        let id = self.target(dir, name)?;
        self.move_subtree(src, &id)?;
        Ok(id)
    }

    async fn rename(&self, src: &str, name: &str) -> VfsResult<String> {
        let src = path::normalize(src);
        let parent = path::parent(&src).ok_or_else(|| VfsError::invalid_path("cannot rename a root"))?;
        self.move_to(&src, &parent, name).await
    }

    async fn copy(&self, src: &str, dir: &str, name: &str) -> VfsResult<String> {
        let id = self.target(dir, name)?;
        let src = path::normalize(src);
        let mut nodes = self.store.nodes.write();
        MemoryStore::require_dir(&nodes, &path::normalize(dir))?;
        if nodes.contains_key(&id) {
            return Err(VfsError::already_exists(id));
        }
        if id.starts_with(&format!("{src}/")) {
            return Err(VfsError::invalid_path(format!("cannot copy {src} into itself")));
        }
        MemoryStore::copy_subtree(&mut nodes, &src, &id)?;
        Ok(id)
    }

    async fn rm(&self, id: &str) -> VfsResult<()> {
        let id = path::normalize(id);
        if id == ROOT_ID {
            return Err(VfsError::permission_denied("cannot remove the volume root"));
        }
        let mut nodes = self.store.nodes.write();
        if !nodes.contains_key(&id) {
            return Err(VfsError::not_found(id));
        }
        MemoryStore::remove_subtree(&mut nodes, &id);
        Ok(())
    }

    fn uri(&self, id: &str) -> String {
        format!("memory://{}{}", self.volume_id, path::normalize(id))
    }
}

/// Builds [`MemoryBackend`]s, one shared [`MemoryStore`] per volume id.
#[derive(Debug, Default)]
pub struct MemoryFactory {
    stores: DashMap<String, Arc<MemoryStore>>,
}

impl MemoryFactory {
    /// The store behind a volume, created on first use.
    pub fn store(&self, volume_id: &str) -> Arc<MemoryStore> {
        self.stores
            .entry(volume_id.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone()
    }

    /// Drop a volume's data.
    pub fn forget(&self, volume_id: &str) {
        self.stores.remove(volume_id);
    }
}

impl BackendFactory for MemoryFactory {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn create(&self, volume: &Volume) -> VfsResult<Arc<dyn BackendOps>> {
        Ok(Arc::new(MemoryBackend::new(
            self.store(volume.id()),
            volume.id(),
            volume.name(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(Arc::new(MemoryStore::new()), "m_", "scratch")
    }

    async fn read_all(backend: &MemoryBackend, id: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        backend
            .read(id, None)
            .await
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let fs = backend();
        let id = fs.write("/", "test.txt", bytes_stream("hello world")).await.unwrap();
        assert_eq!(read_all(&fs, &id).await, b"hello world");

        let mut buf = Vec::new();
        fs.read(&id, Some(ByteRange::new(6, 100)))
            .await
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"world");
    }

    #[tokio::test]
    async fn test_root_stat_uses_volume_name() {
        let fs = backend();
        let root = fs.stat("/").await.unwrap().unwrap();
        assert_eq!(root.name, "scratch");
        assert!(root.is_dir());
        assert_eq!(root.parent, None);
    }

    #[tokio::test]
    async fn test_readdir_carries_stats() {
        let fs = backend();
        fs.mkdir("/", "dir").await.unwrap();
        fs.write("/dir", "a.txt", bytes_stream("a")).await.unwrap();
        fs.mkdir("/dir", "nested").await.unwrap();
        fs.write("/dir/nested", "deep.txt", bytes_stream("d")).await.unwrap();

        let listed = fs.readdir("/dir").await.unwrap();
        let ids: Vec<_> = listed.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, ["/dir/a.txt", "/dir/nested"]);
        let a = listed[0].stat.as_ref().unwrap();
        assert_eq!(a.mime, "text/plain");
        assert_eq!(a.size, 1);
        assert_eq!(a.parent.as_deref(), Some("/dir"));
    }

    #[tokio::test]
    async fn test_mkdir_requires_parent_and_fails_if_present() {
        let fs = backend();
        fs.mkdir("/", "d").await.unwrap();
        assert!(fs.mkdir("/", "d").await.unwrap_err().is_already_exists());
        assert!(matches!(
            fs.mkdir("/missing", "d").await,
            Err(VfsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_move_and_copy_subtrees() {
        let fs = backend();
        fs.mkdir("/", "src").await.unwrap();
        fs.write("/src", "f.txt", bytes_stream("x")).await.unwrap();
        fs.mkdir("/", "dst").await.unwrap();

        fs.copy("/src", "/dst", "copy").await.unwrap();
        assert_eq!(read_all(&fs, "/dst/copy/f.txt").await, b"x");
        assert!(fs.stat("/src/f.txt").await.unwrap().is_some());

        fs.move_to("/src", "/dst", "moved").await.unwrap();
        assert!(fs.stat("/src").await.unwrap().is_none());
        assert_eq!(read_all(&fs, "/dst/moved/f.txt").await, b"x");

        assert!(fs.move_to("/dst", "/dst/moved", "loop").await.is_err());
        assert!(fs.copy("/dst/moved", "/dst", "copy").await.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn test_rename_keeps_siblings() {
        let fs = backend();
        fs.mkdir("/", "a").await.unwrap();
        fs.mkdir("/", "ab").await.unwrap();
        fs.write("/a", "x", bytes_stream("1")).await.unwrap();
        fs.rename("/a", "c").await.unwrap();
        assert!(fs.stat("/ab").await.unwrap().is_some());
        assert!(fs.stat("/c/x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rm() {
        let fs = backend();
        fs.mkdir("/", "d").await.unwrap();
        fs.write("/d", "f", bytes_stream("x")).await.unwrap();
        fs.rm("/d").await.unwrap();
        assert!(fs.stat("/d/f").await.unwrap().is_none());
        assert!(fs.rm("/").await.is_err());
        assert!(matches!(fs.chmod("/x", 0o644).await, Err(VfsError::NotImplemented { .. })));
    }

    #[tokio::test]
    async fn test_factory_shares_store_per_volume() {
        let factory = MemoryFactory::default();
        let a = factory.store("v1_");
        let b = factory.store("v1_");
        let c = factory.store("v2_");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
