//! Core driver-layer types.
//!
//! Backend ids are `/`-rooted, `/`-separated strings for every backend kind;
//! the root of a volume is always [`ROOT_ID`].

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Mime value marking a directory. No separate flag exists.
pub const DIRECTORY: &str = "directory";

/// Mime reported when a backend cannot tell.
pub const FALLBACK_MIME: &str = "application/binary";

/// Mime reported for a symlink whose target is gone.
pub const BROKEN_SYMLINK: &str = "symlink-broken";

/// Backend id of every volume root.
pub const ROOT_ID: &str = "/";

/// Canonical description of one filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// Entry name (the volume name for the root).
    pub name: String,
    /// Mime type, or [`DIRECTORY`].
    pub mime: String,
    /// Parent backend id, `None` for the root.
    pub parent: Option<String>,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Modification time, unix seconds.
    pub ts: i64,
    /// Backend reports the entry readable.
    pub readable: bool,
    /// Backend reports the entry writable.
    pub writable: bool,
}

impl FileStat {
    /// Stat for a directory.
    pub fn directory(name: impl Into<String>, parent: Option<String>, ts: i64) -> Self {
        Self {
            name: name.into(),
            mime: DIRECTORY.to_string(),
            parent,
            size: 0,
            ts,
            readable: true,
            writable: true,
        }
    }

    /// Stat for a regular file, mime guessed from the name.
    pub fn file(name: impl Into<String>, parent: Option<String>, size: u64, ts: i64) -> Self {
        let name = name.into();
        let mime = guess_mime(&name);
        Self {
            name,
            mime,
            parent,
            size,
            ts,
            readable: true,
            writable: true,
        }
    }

    /// Returns true if this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.mime == DIRECTORY
    }
}

/// Guess a mime type from a file name.
pub fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or(FALLBACK_MIME)
        .to_string()
}

/// One child returned by a backend listing.
///
/// Backends that learn child metadata for free fill `stat` so the driver can
/// seed its cache without a round trip per child.
#[derive(Debug, Clone)]
pub struct Listed {
    /// Child backend id.
    pub id: String,
    /// Child metadata when the listing carried it.
    pub stat: Option<FileStat>,
}

impl Listed {
    /// A bare child id.
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stat: None,
        }
    }

    /// A child id with its metadata.
    pub fn with_stat(id: impl Into<String>, stat: FileStat) -> Self {
        Self {
            id: id.into(),
            stat: Some(stat),
        }
    }
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Limit the range to at most `max` bytes from its start.
    pub fn capped(self, max: u64) -> Self {
        Self::new(self.start, self.end.min(self.start.saturating_add(max)))
    }

    /// Clamp the range to a file of `size` bytes.
    pub fn clamped(self, size: u64) -> Self {
        Self::new(self.start.min(size), self.end.min(size))
    }

    /// Parse an HTTP `bytes=a-b` header (inclusive end) against a file size.
    ///
    /// A missing end means "to the end of the file". Suffix ranges (`-n`)
    /// select the last `n` bytes.
    pub fn from_http(header: &str, size: u64) -> Option<Self> {
        let spec = header.trim().strip_prefix("bytes=").unwrap_or(header.trim());
        let (start, end) = spec.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());
        if start.is_empty() {
            let n: u64 = end.parse().ok()?;
            return Some(Self::new(size.saturating_sub(n), size));
        }
        let start: u64 = start.parse().ok()?;
        let end = if end.is_empty() {
            size
        } else {
            end.parse::<u64>().ok()?.saturating_add(1)
        };
        Some(Self::new(start, end).clamped(size))
    }
}

/// Node of a tree created by a cross-backend copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    /// Destination backend id.
    pub id: String,
    pub name: String,
    pub is_dir: bool,
    pub children: Vec<TreeNode>,
}

/// One entry visited by a walk.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub id: String,
    pub stat: FileStat,
    /// Ancestor ids from the walk root down to the direct parent.
    pub parents: Vec<String>,
}

/// Convert a system time to unix seconds.
pub fn unix_ts(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Current time in unix seconds.
pub fn now_ts() -> i64 {
    unix_ts(SystemTime::now())
}
