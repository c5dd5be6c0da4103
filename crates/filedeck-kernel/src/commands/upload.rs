//! The `upload` command.
//!
//! The transport stages each uploaded file under the staging `uploads/`
//! directory and passes `files: [{name, path}]`. Chunked uploads arrive one
//! part per request with `chunk` and `range`; once every part is in, the
//! reply carries `_chunkmerged` and the client re-sends `upload` with
//! `chunk = _chunkmerged` to move the merged file into place.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{CommandContext, CommandError, CommandHandler, CommandOutput, CommandResult, Params, Reply, data_uri};
use crate::staging::{ChunkName, StagingArea, session_id, upload_owner};

/// A file the transport staged for this request.
#[derive(Debug, Clone, Deserialize)]
pub struct StagedUpload {
    /// Client-side file name.
    pub name: String,
    /// Absolute path inside the uploads dir, or a plain staged name.
    pub path: String,
}

/// `range = "start,length,total"` of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkRange {
    start: u64,
    length: u64,
    total: u64,
}

impl ChunkRange {
    fn parse(range: &str) -> Option<Self> {
        let mut parts = range.split(',').map(|p| p.trim().parse::<u64>());
        let range = Self {
            start: parts.next()?.ok()?,
            length: parts.next()?.ok()?,
            total: parts.next()?.ok()?,
        };
        parts.next().is_none().then_some(range)
    }
}

pub struct Upload;

impl Upload {
    fn staged_files(params: &Params) -> CommandResult<Vec<StagedUpload>> {
        match params.get("files") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(files) => {
                serde_json::from_value(files.clone()).map_err(|_| CommandError::params("files"))
            }
        }
    }

    /// Where a staged file lives. Paths outside the uploads dir are refused.
    fn staged_path(staging: &StagingArea, file: &StagedUpload) -> CommandResult<PathBuf> {
        let path = Path::new(&file.path);
        if path.is_absolute() {
            let inside = path.parent() == Some(staging.uploads_dir())
                && path.file_name().is_some_and(|n| n != "." && n != "..");
            return inside.then(|| path.to_path_buf()).ok_or_else(|| CommandError::params("files"));
        }
        staging.staged(&file.path).ok_or_else(|| CommandError::params("files"))
    }

    /// Store one chunk and merge the session once every part has arrived.
    async fn chunk(
        ctx: &CommandContext<'_>,
        params: &Params,
        files: &[StagedUpload],
        mut reply: Reply,
    ) -> CommandResult<Reply> {
        let range = params
            .str("range")
            .and_then(ChunkRange::parse)
            .ok_or_else(|| CommandError::params("range"))?;
        let chunk = ChunkName::parse(params.require_str("chunk")?)?;
        let [file] = files else {
            return Err(CommandError::params("files"));
        };
        let dispatcher = ctx.dispatcher();
        let staging = dispatcher.staging();
        let part = Self::staged_path(staging, file)?;

        let session = session_id(
            params.get("cid").unwrap_or(&Value::Null),
            &chunk.name,
            range.total,
            params.get("mtime").unwrap_or(&Value::Null),
            params.get("upload_path").unwrap_or(&Value::Null),
        );
        debug!(
            session = %session,
            index = chunk.index,
            count = chunk.count,
            start = range.start,
            length = range.length,
            "chunk received"
        );
        let owner = upload_owner(params.get("cid").unwrap_or(&Value::Null), &chunk.name);
        let merged = async {
            staging.store_chunk(&session, chunk.index, &part).await?;
            if !dispatcher.chunks().record(&session, &owner, chunk.index, chunk.count)? {
                return Ok(None);
            }
            Ok::<_, CommandError>(Some(staging.merge_chunks(&session, chunk.count).await?))
        }
        .await;
        let size = match merged {
            Ok(Some(size)) => size,
            Ok(None) => return Ok(reply),
            Err(e) => {
                dispatcher.chunks().forget(&session);
                staging.discard_chunks(&session).await;
                return Err(e);
            }
        };

        if size != range.total {
            staging.discard_chunks(&session).await;
            reply.set("_chunkfailure", true);
            reply.error = Some(json!(format!(
                "Chunked Upload failed. Size mismatch ({size} != {})",
                range.total
            )));
        }
        reply.set("_chunkmerged", session);
        reply.set("_name", chunk.name);
        Ok(reply)
    }

    /// Drop every unfinished session of the file named by `chunk`.
    async fn abandon(ctx: &CommandContext<'_>, params: &Params) -> String {
        let Some(chunk) = params.str("chunk").and_then(|c| ChunkName::parse(c).ok()) else {
            return String::new();
        };
        let dispatcher = ctx.dispatcher();
        let owner = upload_owner(params.get("cid").unwrap_or(&Value::Null), &chunk.name);
        for session in dispatcher.chunks().abandon(&owner) {
            debug!(session = %session, "chunked upload abandoned");
            dispatcher.staging().discard_chunks(&session).await;
        }
        chunk.name
    }
}

#[async_trait]
impl CommandHandler for Upload {
    fn name(&self) -> &'static str {
        "upload"
    }

    fn description(&self) -> &'static str {
        "Move staged uploads into a directory"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target"]
    }

    #[tracing::instrument(skip(self, ctx, params), name = "command.upload")]
    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let (driver, dir) = ctx.resolve(params.require_str("target")?).await?;
        let mut files = Self::staged_files(params)?;
        let uploads = params.strings("upload");
        let mut reply = Reply::new();
        if let Some(node) = params.str("node") {
            reply.set("callback", json!({ "node": node, "bind": "upload" }));
        }

        let first = uploads.first().map(String::as_str);
        if first == Some("chunkfail") && params.str("mimes") == Some("chunkfail") {
            let name = Self::abandon(ctx, params).await;
            reply.set("warning", json!(["errUploadFile", name, "errUploadTemp"]));
            return Ok(reply.into());
        }
        if params.has("range") {
            return Ok(Self::chunk(ctx, params, &files, reply).await?.into());
        }

        match first {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                return Err(CommandError::Upload("uploads from URLs are not supported".into()));
            }
            Some(uri) if uri.starts_with("data:") => {
                let data = data_uri::decode(uri).ok_or_else(|| CommandError::params("upload"))?;
                let new_id = driver.write_bytes(&dir, &data.file_name(), data.data).await?;
                reply.added.push(driver.file_required(&new_id).await?);
                return Ok(reply.into());
            }
            _ => {}
        }

        if let Some(merged) = params.str("chunk") {
            let [name] = uploads.as_slice() else {
                return Err(CommandError::params("upload"));
            };
            files.push(StagedUpload {
                name: name.clone(),
                path: merged.to_string(),
            });
        }

        let staging = ctx.dispatcher().staging();
        let destinations = params.strings("upload_path");
        let renames = params.strings("renames");
        let suffix = params.str("suffix");
        for (i, file) in files.iter().enumerate() {
            driver.check_abort()?;
            let tmp = Self::staged_path(staging, file)?;
            let dst_dir = match destinations.get(i) {
                Some(hash) => {
                    let (volume, id) = ctx.volumes().unhash(hash)?;
                    if volume.id() != driver.volume().id() {
                        return Err(CommandError::params("upload_path"));
                    }
                    id
                }
                None => dir.clone(),
            };
            let name = if renames.contains(&file.name) {
                driver.unique(&dst_dir, &file.name, suffix).await?
            } else {
                file.name.clone()
            };
            let new_id = driver.upload(&tmp, &dst_dir, &name).await?;
            if let Err(e) = tokio::fs::remove_file(&tmp).await {
                debug!(path = %tmp.display(), "staged upload already gone: {e}");
            }
            reply.added.push(driver.file_required(&new_id).await?);
        }
        Ok(reply.into())
    }
}
