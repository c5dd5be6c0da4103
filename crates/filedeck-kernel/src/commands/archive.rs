//! Archive commands: `archive`, `extract` and the two-phase `zipdl`.

use async_trait::async_trait;
use serde_json::json;

use super::{CommandContext, CommandError, CommandHandler, CommandOutput, CommandResult, Params, Reply};
use crate::archive::{self as engine, ZIP_MIME};
use crate::vfs::{FileDownload, VfsError, path};

/// Name used when the client gives none.
pub const DEFAULT_ARCHIVE_NAME: &str = "Archive.zip";

pub struct Archive;

#[async_trait]
impl CommandHandler for Archive {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn description(&self) -> &'static str {
        "Zip entries into an archive next to the first one"
    }

    fn required(&self) -> &'static [&'static str] {
        &["targets", "type"]
    }

    fn validate(&self, params: &Params) -> CommandResult<()> {
        if !params.has("targets") {
            return Err(CommandError::params("targets"));
        }
        match params.str("type") {
            Some(ZIP_MIME) => Ok(()),
            _ => Err(CommandError::params("type")),
        }
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let (driver, ids) = ctx.resolve_all(&params.require_strings("targets")?).await?;
        let first = ids.first().ok_or_else(|| CommandError::params("targets"))?;
        let dir = driver
            .stat_required(first)
            .await?
            .parent
            .ok_or_else(|| VfsError::permission_denied("cannot archive a volume root"))?;
        let name = match params.str("name") {
            Some(name) => path::replace_ext(name, ".zip"),
            None => DEFAULT_ARCHIVE_NAME.to_string(),
        };
        let name = driver.unique(&dir, &name, None).await?;
        let new_id = engine::archive(&driver, &ids, &dir, &name).await?;
        let mut reply = Reply::new();
        reply.added.push(driver.file_required(&new_id).await?);
        Ok(reply.into())
    }
}

pub struct Extract;

#[async_trait]
impl CommandHandler for Extract {
    fn name(&self) -> &'static str {
        "extract"
    }

    fn description(&self) -> &'static str {
        "Unpack an archive next to itself, optionally into a new directory"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let (driver, id) = ctx.resolve(params.require_str("target")?).await?;
        let stat = driver.stat_required(&id).await?;
        let mut dst = stat
            .parent
            .clone()
            .ok_or_else(|| VfsError::is_a_directory(id.clone()))?;
        let makedir = params.flag("makedir");
        if makedir {
            let name = driver.unique(&dst, &path::replace_ext(&stat.name, ""), None).await?;
            dst = driver.mkdir(&dst, &name).await?;
        }

        let created = engine::extract(&driver, &id, &dst, ctx.dispatcher().scratch_volume()).await?;
        let mut reply = Reply::new();
        if makedir {
            reply.added.push(driver.file_required(&dst).await?);
        } else {
            for new_id in created {
                reply.added.push(driver.file_required(&new_id).await?);
            }
        }
        Ok(reply.into())
    }
}

pub struct ZipDl;

impl ZipDl {
    /// Second phase: stream a prepared archive from the scratch area.
    async fn download(ctx: &CommandContext<'_>, targets: &[String]) -> CommandResult<CommandOutput> {
        let [_, file, rest @ ..] = targets else {
            return Err(CommandError::params("targets"));
        };
        let valid = path::validate_name(file).is_ok() && file.ends_with(".zip");
        if !valid {
            return Err(CommandError::params("targets"));
        }
        let tmp = ctx.dispatcher().staging().tmp_dir().join(file);
        let handle = tokio::fs::File::open(&tmp).await?;
        let size = handle.metadata().await?.len();
        // The open handle keeps the content readable after the unlink.
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            tracing::warn!(path = %tmp.display(), "could not remove prepared archive: {e}");
        }
        let name = rest.first().cloned().unwrap_or_else(|| DEFAULT_ARCHIVE_NAME.to_string());
        let mime = rest.get(1).cloned().unwrap_or_else(|| ZIP_MIME.to_string());
        Ok(CommandOutput::Download(FileDownload {
            name,
            mime,
            size,
            range: None,
            length: size,
            attachment: true,
            body: Box::pin(handle),
        }))
    }
}

#[async_trait]
impl CommandHandler for ZipDl {
    fn name(&self) -> &'static str {
        "zipdl"
    }

    fn description(&self) -> &'static str {
        "Prepare a zip of entries for download, then stream it"
    }

    fn required(&self) -> &'static [&'static str] {
        &["targets"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let targets = params.require_strings("targets")?;
        if params.flag("download") {
            return Self::download(ctx, &targets).await;
        }
        let (driver, ids) = ctx.resolve_all(&targets).await?;
        let tmp = engine::archive_to_temp(&driver, &ids).await?;
        let file = tmp
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| VfsError::other("archive has no file name"))?;
        let zipdl = json!({
            "file": file,
            "name": DEFAULT_ARCHIVE_NAME,
            "mime": ZIP_MIME,
        });
        Ok(Reply::new().with("zipdl", zipdl).into())
    }
}
