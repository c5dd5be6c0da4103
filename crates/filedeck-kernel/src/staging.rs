//! Process-local staging area and chunked-upload bookkeeping.
//!
//! ```text
//! <staging>/
//!   uploads/   staged upload files, `<session>_chunks/<i>` part files
//!   tmb/       thumbnail cache
//!   tmp/       archive and extraction scratch
//! ```

use dashmap::DashMap;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, VolumeConfig};
use crate::hash::md5_hex;
use crate::vfs::backends::LocalFactory;
use crate::volume::{Volume, VolumeContext};

/// Id of the private scratch volume. Never registered with clients.
pub const SCRATCH_VOLUME_ID: &str = "scratch_";

/// Most parts one chunked upload may be split into.
pub const MAX_CHUNKS: usize = 1 << 16;

/// The staging directories under one root.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
    uploads: PathBuf,
    tmb: PathBuf,
    tmp: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            uploads: root.join("uploads"),
            tmb: root.join("tmb"),
            tmp: root.join("tmp"),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads
    }

    pub fn tmb_dir(&self) -> &Path {
        &self.tmb
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp
    }

    /// Create all directories and empty `uploads/` and `tmp/`.
    pub async fn prepare(&self) -> io::Result<()> {
        for dir in [&self.uploads, &self.tmp] {
            match fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        for dir in [&self.uploads, &self.tmb, &self.tmp] {
            fs::create_dir_all(dir).await?;
        }
        info!(root = %self.root.display(), "staging area ready");
        Ok(())
    }

    /// Volume context using this area's thumbnail and scratch directories.
    pub fn volume_context(&self, connector_url: impl Into<String>, debug_timing: bool) -> VolumeContext {
        VolumeContext {
            tmbdir: self.tmb.clone(),
            scratch: self.tmp.clone(),
            connector_url: connector_url.into(),
            debug_timing,
        }
    }

    /// Local volume rooted at `tmp/`, the source of re-inserted extractions.
    pub fn scratch_volume(&self, ctx: &VolumeContext) -> Result<Arc<Volume>, ConfigError> {
        let config = VolumeConfig {
            id: SCRATCH_VOLUME_ID.to_string(),
            name: "scratch".to_string(),
            driver: "local".to_string(),
            root: Some(self.tmp.to_string_lossy().into_owned()),
            ..Default::default()
        };
        Ok(Arc::new(Volume::new(config, Arc::new(LocalFactory), ctx)?))
    }

    /// A staged upload file by name. `None` for names that are not plain.
    pub fn staged(&self, name: &str) -> Option<PathBuf> {
        let plain = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        plain.then(|| self.uploads.join(name))
    }

    /// Fresh path for a staged upload.
    pub fn new_upload_path(&self) -> PathBuf {
        self.uploads.join(uuid::Uuid::new_v4().to_string())
    }

    pub fn chunk_dir(&self, session: &str) -> PathBuf {
        self.uploads.join(format!("{session}_chunks"))
    }

    /// Move one received part into its session directory.
    pub async fn store_chunk(&self, session: &str, index: usize, part: &Path) -> io::Result<()> {
        let dir = self.chunk_dir(session);
        fs::create_dir_all(&dir).await?;
        let dest = dir.join(index.to_string());
        if fs::rename(part, &dest).await.is_err() {
            fs::copy(part, &dest).await?;
            fs::remove_file(part).await?;
        }
        Ok(())
    }

    /// Concatenate parts `0..count` into `uploads/<session>`, drop the parts
    /// and return the merged size.
    pub async fn merge_chunks(&self, session: &str, count: usize) -> io::Result<u64> {
        let dir = self.chunk_dir(session);
        let merged = self.uploads.join(session);
        let mut out = fs::File::create(&merged).await?;
        for i in 0..count {
            let mut part = fs::File::open(dir.join(i.to_string())).await?;
            tokio::io::copy(&mut part, &mut out).await?;
        }
        out.flush().await?;
        let size = out.metadata().await?.len();
        if let Err(e) = fs::remove_dir_all(&dir).await {
            debug!(dir = %dir.display(), "could not remove chunk dir: {e}");
        }
        Ok(size)
    }

    /// Remove a session's parts and merged file, whichever exist.
    pub async fn discard_chunks(&self, session: &str) {
        let dir = self.chunk_dir(session);
        let merged = self.uploads.join(session);
        for result in [fs::remove_dir_all(&dir).await, fs::remove_file(&merged).await] {
            if let Err(e) = result {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(session, "could not discard chunk upload: {e}");
                }
            }
        }
    }
}

/// A `chunk` field that does not name a part.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("malformed chunk name: {0}")]
    Malformed(String),

    #[error("chunk {index} out of range for {count} chunks")]
    OutOfRange { index: usize, count: usize },
}

/// A parsed `<name>.<index>_<last>.part` chunk field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkName {
    pub name: String,
    pub index: usize,
    pub count: usize,
}

impl ChunkName {
    pub fn parse(chunk: &str) -> Result<Self, ChunkError> {
        let malformed = || ChunkError::Malformed(chunk.to_string());
        let stem = chunk.strip_suffix(".part").ok_or_else(malformed)?;
        let (name, counters) = stem.rsplit_once('.').ok_or_else(malformed)?;
        let (index, last) = counters.split_once('_').ok_or_else(malformed)?;
        let index: usize = index.parse().map_err(|_| malformed())?;
        let last: usize = last.parse().map_err(|_| malformed())?;
        let count = last
            .checked_add(1)
            .filter(|count| *count <= MAX_CHUNKS)
            .ok_or_else(malformed)?;
        if name.is_empty() {
            return Err(malformed());
        }
        if index >= count {
            return Err(ChunkError::OutOfRange { index, count });
        }
        Ok(Self {
            name: name.to_string(),
            index,
            count,
        })
    }
}

/// Upload session key: md5 of `[cid, name, total, mtime, upload_path]` as JSON.
pub fn session_id(cid: &Value, name: &str, total: u64, mtime: &Value, upload_path: &Value) -> String {
    let key = serde_json::json!([cid, name, total, mtime, upload_path]);
    md5_hex(key.to_string())
}

/// Client file key: md5 of `[cid, name]`. A `chunkfail` request carries
/// only these, so sessions are also found by it.
pub fn upload_owner(cid: &Value, name: &str) -> String {
    md5_hex(serde_json::json!([cid, name]).to_string())
}

#[derive(Debug)]
struct ChunkSession {
    owner: String,
    received: Vec<bool>,
}

/// Received chunk indices per upload session.
#[derive(Debug, Default)]
pub struct ChunkTracker {
    sessions: DashMap<String, ChunkSession>,
}

impl ChunkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `index` received. Returns true once every chunk has arrived, at
    /// which point the session is forgotten.
    pub fn record(&self, session: &str, owner: &str, index: usize, count: usize) -> Result<bool, ChunkError> {
        if count > MAX_CHUNKS {
            return Err(ChunkError::Malformed(format!("{count} chunks")));
        }
        if index >= count {
            return Err(ChunkError::OutOfRange { index, count });
        }
        let complete = {
            let mut entry = self
                .sessions
                .entry(session.to_string())
                .or_insert_with(|| ChunkSession {
                    owner: owner.to_string(),
                    received: vec![false; count],
                });
            if entry.received.len() != count {
                entry.received.resize(count, false);
            }
            entry.received[index] = true;
            entry.received.iter().all(|received| *received)
        };
        if complete {
            self.sessions.remove(session);
        }
        Ok(complete)
    }

    /// Number of chunks received so far, `None` for unknown sessions.
    pub fn received(&self, session: &str) -> Option<usize> {
        self.sessions
            .get(session)
            .map(|s| s.received.iter().filter(|r| **r).count())
    }

    pub fn forget(&self, session: &str) {
        self.sessions.remove(session);
    }

    /// Forget every session of one client file and return their ids.
    pub fn abandon(&self, owner: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.owner == owner)
            .map(|s| s.key().clone())
            .collect();
        for id in &ids {
            self.sessions.remove(id);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
