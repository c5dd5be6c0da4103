//! Client-visible descriptions of entries and downloads.

use serde::Serialize;

use super::ops::ByteStream;

/// Client-visible file descriptor.
///
/// Built by [`Driver::file`](super::Driver::file) from a stat, its hash and
/// the volume's permission policy. Flags are `0`/`1` numbers on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub name: String,
    pub hash: String,
    /// Parent hash, empty for a root.
    pub phash: String,
    pub size: u64,
    pub mime: String,
    pub ts: i64,
    pub read: u8,
    pub write: u8,
    pub locked: u8,
    pub volumeid: String,
    /// Backend id, only for opaque-addressed volumes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirs: Option<u8>,
    /// Thumbnail name, or `"1"` when not generated yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmb: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isroot: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.mime == super::DIRECTORY
    }
}

/// Served portion of a ranged download, inclusive end as in HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ContentRange {
    /// `Content-Range` header value.
    pub fn header(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Streamed file content for the transport.
pub struct FileDownload {
    pub name: String,
    pub mime: String,
    /// Full size of the file.
    pub size: u64,
    pub range: Option<ContentRange>,
    /// Number of bytes the body yields.
    pub length: u64,
    /// Serve as an attachment.
    pub attachment: bool,
    pub body: ByteStream,
}

impl std::fmt::Debug for FileDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDownload")
            .field("name", &self.name)
            .field("mime", &self.mime)
            .field("size", &self.size)
            .field("range", &self.range)
            .field("length", &self.length)
            .field("attachment", &self.attachment)
            .finish_non_exhaustive()
    }
}

impl FileDownload {
    /// `Content-Disposition` header value for attachments.
    pub fn disposition(&self) -> Option<String> {
        self.attachment
            .then(|| format!("attachment;filename=\"{}\"", self.name.replace('"', "\\\"")))
    }
}
