//! Commands that create, change or remove entries.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

use super::{
    CommandContext, CommandError, CommandHandler, CommandOutput, CommandResult, Params, Reply,
    data_uri,
};
use crate::transfer;
use crate::vfs::backends::{copy_recursive, move_path};
use crate::vfs::{Driver, ROOT_ID, VfsError, VfsResult, path};

pub struct Mkdir;

#[async_trait]
impl CommandHandler for Mkdir {
    fn name(&self) -> &'static str {
        "mkdir"
    }

    fn description(&self) -> &'static str {
        "Create one directory, or a list of nested relative directories"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let (driver, id) = ctx.resolve(params.require_str("target")?).await?;
        let mut reply = Reply::new();
        let dirs = params.strings("dirs");
        if !dirs.is_empty() {
            let mut created: HashMap<String, String> = HashMap::new();
            let mut hashes = Map::new();
            for dir in dirs {
                let (parent, name) = dir.rsplit_once('/').unwrap_or(("", dir.as_str()));
                let base = if parent.is_empty() {
                    id.clone()
                } else {
                    created
                        .get(parent)
                        .cloned()
                        .ok_or_else(|| VfsError::not_found(parent))?
                };
                let new_id = driver.mkdir(&base, name).await?;
                reply.added.push(driver.file_required(&new_id).await?);
                hashes.insert(dir.clone(), Value::String(driver.hash(&new_id)));
                created.insert(dir, new_id);
            }
            reply.set("hashes", hashes);
        } else if let Some(name) = params.str("name") {
            let new_id = driver.mkdir(&id, name).await?;
            reply.added.push(driver.file_required(&new_id).await?);
        }
        reply.changed.push(driver.file_required(&id).await?);
        Ok(reply.into())
    }
}

pub struct Mkfile;

#[async_trait]
impl CommandHandler for Mkfile {
    fn name(&self) -> &'static str {
        "mkfile"
    }

    fn description(&self) -> &'static str {
        "Create an empty file"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target", "name"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let (driver, id) = ctx.resolve(params.require_str("target")?).await?;
        let new_id = driver.write_bytes(&id, params.require_str("name")?, Vec::new()).await?;
        let mut reply = Reply::new();
        reply.added.push(driver.file_required(&new_id).await?);
        Ok(reply.into())
    }
}

pub struct Rename;

#[async_trait]
impl CommandHandler for Rename {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn description(&self) -> &'static str {
        "Rename an entry in place"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target", "name"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let target = params.require_str("target")?;
        let (driver, id) = ctx.resolve(target).await?;
        let new_id = driver.rename(&id, params.require_str("name")?).await?;
        let mut reply = Reply::new();
        reply.added.push(driver.file_required(&new_id).await?);
        reply.removed.push(target.to_string());
        Ok(reply.into())
    }
}

pub struct Rm;

#[async_trait]
impl CommandHandler for Rm {
    fn name(&self) -> &'static str {
        "rm"
    }

    fn description(&self) -> &'static str {
        "Remove entries, recursively for directories"
    }

    fn required(&self) -> &'static [&'static str] {
        &["targets"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let mut reply = Reply::new();
        for hash in params.require_strings("targets")? {
            let (driver, id) = ctx.resolve(&hash).await?;
            driver.rm(&id).await?;
            reply.removed.push(hash);
        }
        Ok(reply.into())
    }
}

pub struct Duplicate;

#[async_trait]
impl CommandHandler for Duplicate {
    fn name(&self) -> &'static str {
        "duplicate"
    }

    fn description(&self) -> &'static str {
        "Copy entries next to themselves under a unique name"
    }

    fn required(&self) -> &'static [&'static str] {
        &["targets"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let suffix = params.str("suffix");
        let mut reply = Reply::new();
        for hash in params.require_strings("targets")? {
            let (driver, id) = ctx.resolve(&hash).await?;
            let stat = driver.stat_required(&id).await?;
            let parent = stat
                .parent
                .ok_or_else(|| VfsError::permission_denied("cannot duplicate a volume root"))?;
            let name = driver.unique(&parent, &stat.name, suffix).await?;
            let new_id = driver.copy(&id, &parent, &name).await?;
            reply.added.push(driver.file_required(&new_id).await?);
        }
        Ok(reply.into())
    }
}

pub struct Paste;

impl Paste {
    /// Direct filesystem move or copy between two local volumes.
    async fn local_transfer(
        src: &Driver,
        src_id: &str,
        dst: &Driver,
        dst_dir: &str,
        name: &str,
        cut: bool,
    ) -> VfsResult<Option<String>> {
        let (Some(from), Some(dir)) = (src.backend().local_path(src_id), dst.backend().local_path(dst_dir))
        else {
            return Ok(None);
        };
        let new_id = path::join(dst_dir, name);
        let to = dir.join(name);
        if tokio::fs::symlink_metadata(&to).await.is_ok() {
            return Err(VfsError::already_exists(new_id));
        }
        if cut {
            move_path(&from, &to).await?;
            src.cache().invalidate_stat(src_id);
            src.cache().clear_dirs();
        } else {
            copy_recursive(&from, &to).await?;
            if let Err(e) = dst.backend().fix_permissions(&new_id).await {
                debug!(id = %new_id, error = %e, "could not normalize permissions");
            }
        }
        dst.cache().clear_dirs();
        dst.cache().invalidate_stat(&new_id);
        Ok(Some(new_id))
    }
}

#[async_trait]
impl CommandHandler for Paste {
    fn name(&self) -> &'static str {
        "paste"
    }

    fn description(&self) -> &'static str {
        "Copy or move entries into a directory, across volumes if needed"
    }

    fn required(&self) -> &'static [&'static str] {
        &["targets", "dst"]
    }

    #[tracing::instrument(skip(self, ctx, params), name = "command.paste")]
    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let cut = params.flag("cut");
        let renames = params.strings("renames");
        let suffix = params.str("suffix");
        let (dst, dst_id) = ctx.resolve(params.require_str("dst")?).await?;
        let mut reply = Reply::new();

        for hash in params.require_strings("targets")? {
            let (src, src_id) = ctx.resolve(&hash).await?;
            let mut name = src.stat_required(&src_id).await?.name;
            if renames.contains(&name) {
                name = dst.unique(&dst_id, &name, suffix).await?;
            }

            let same_volume = src.volume().id() == dst.volume().id();
            let both_local = src.kind() == "local" && dst.kind() == "local";
            let native = if same_volume {
                Some(if cut {
                    dst.move_to(&src_id, &dst_id, &name).await?
                } else {
                    dst.copy(&src_id, &dst_id, &name).await?
                })
            } else if both_local {
                Self::local_transfer(&src, &src_id, &dst, &dst_id, &name, cut).await?
            } else {
                None
            };

            let new_id = match native {
                Some(id) => id,
                None => {
                    let tree = transfer::copy_tree_as(&src, &src_id, &dst, &dst_id, &name).await?;
                    if cut {
                        src.rm(&src_id).await?;
                    }
                    tree.id
                }
            };
            if cut {
                reply.removed.push(hash);
            }
            reply.added.push(dst.file_required(&new_id).await?);
        }
        reply.changed.push(dst.file_required(&dst_id).await?);
        Ok(reply.into())
    }
}

pub struct Put;

#[async_trait]
impl CommandHandler for Put {
    fn name(&self) -> &'static str {
        "put"
    }

    fn description(&self) -> &'static str {
        "Replace the content of a file"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let content = params.get("content").and_then(Value::as_str).unwrap_or_default();
        let (driver, id) = ctx.resolve(params.require_str("target")?).await?;
        let stat = driver.stat_required(&id).await?;
        if stat.is_dir() {
            return Err(VfsError::is_a_directory(id).into());
        }
        let parent = stat.parent.clone().unwrap_or_else(|| ROOT_ID.to_string());

        let data = match params.str("encoding") {
            Some("scheme") => {
                data_uri::decode(content)
                    .ok_or_else(|| CommandError::params("content"))?
                    .data
            }
            Some("hash") => {
                let (source, source_id) = ctx.resolve(content).await?;
                source.read_to_vec(&source_id).await?
            }
            Some(other) => {
                debug!(encoding = other, "storing content as UTF-8");
                content.as_bytes().to_vec()
            }
            None => content.as_bytes().to_vec(),
        };

        let new_id = driver.write_bytes(&parent, &stat.name, data).await?;
        let mut reply = Reply::new();
        reply.changed.push(driver.file_required(&new_id).await?);
        Ok(reply.into())
    }
}

pub struct Get;

#[async_trait]
impl CommandHandler for Get {
    fn name(&self) -> &'static str {
        "get"
    }

    fn description(&self) -> &'static str {
        "File content as UTF-8 text"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let (driver, id) = ctx.resolve(params.require_str("target")?).await?;
        let bytes = driver.read_to_vec(&id).await?;
        let reply = match String::from_utf8(bytes) {
            Ok(text) => Reply::new().with("content", text),
            Err(_) if params.string("conv").as_deref() == Some("0") => {
                Reply::new().with("doconv", "unknown")
            }
            Err(_) => Reply::new().with("content", false),
        };
        Ok(reply.into())
    }
}

pub struct Chmod;

#[async_trait]
impl CommandHandler for Chmod {
    fn name(&self) -> &'static str {
        "chmod"
    }

    fn description(&self) -> &'static str {
        "Change mode bits of entries"
    }

    fn required(&self) -> &'static [&'static str] {
        &["targets", "mode"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let mode = params.string("mode").ok_or_else(|| CommandError::params("mode"))?;
        let mut reply = Reply::new();
        for hash in params.require_strings("targets")? {
            let (driver, id) = ctx.resolve(&hash).await?;
            driver.chmod(&id, &mode).await?;
            reply.changed.push(driver.file_required(&id).await?);
        }
        Ok(reply.into())
    }
}
