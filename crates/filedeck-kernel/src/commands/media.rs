//! Content delivery and image commands.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{CommandContext, CommandError, CommandHandler, CommandOutput, CommandResult, Params, Reply};
use crate::imaging::{self, Transform};
use crate::vfs::{VfsError, path};

pub struct File;

#[async_trait]
impl CommandHandler for File {
    fn name(&self) -> &'static str {
        "file"
    }

    fn description(&self) -> &'static str {
        "Stream file content, optionally ranged or as an attachment"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let (driver, id) = ctx.resolve(params.require_str("target")?).await?;
        let mut download = driver.fetch(&id, params.str("range")).await?;
        download.attachment = params.flag("download");
        Ok(CommandOutput::Download(download))
    }
}

pub struct Url;

#[async_trait]
impl CommandHandler for Url {
    fn name(&self) -> &'static str {
        "url"
    }

    fn description(&self) -> &'static str {
        "Public URL of an entry"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let (driver, id) = ctx.resolve(params.require_str("target")?).await?;
        driver.stat_required(&id).await?;
        let url = match driver.volume().config().url.as_deref().filter(|u| !u.is_empty()) {
            Some(prefix) => format!("{}{}", prefix.trim_end_matches('/'), id),
            None => driver.uri(&id),
        };
        Ok(Reply::new().with("url", url).into())
    }
}

pub struct Tmb;

#[async_trait]
impl CommandHandler for Tmb {
    fn name(&self) -> &'static str {
        "tmb"
    }

    fn description(&self) -> &'static str {
        "Generate thumbnails for images"
    }

    fn required(&self) -> &'static [&'static str] {
        &["targets"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let mut images = Map::new();
        for hash in params.require_strings("targets")? {
            let (driver, id) = ctx.resolve(&hash).await?;
            driver.check_abort()?;
            let name = driver.tmb(&id, true).await?;
            images.insert(hash, name.map_or(Value::Null, Value::String));
        }
        Ok(Reply::new().with("images", images).into())
    }
}

pub struct Dim;

#[async_trait]
impl CommandHandler for Dim {
    fn name(&self) -> &'static str {
        "dim"
    }

    fn description(&self) -> &'static str {
        "Pixel dimensions of an image"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let (driver, id) = ctx.resolve(params.require_str("target")?).await?;
        let (width, height) = imaging::dimensions(driver.read_to_vec(&id).await?).await?;
        Ok(Reply::new().with("dim", format!("{width}x{height}")).into())
    }
}

pub struct Resize;

impl Resize {
    fn dimension(params: &Params, key: &str) -> CommandResult<u32> {
        let value = params.require_number(key)?;
        if !value.is_finite() || value < 0.0 || value > f64::from(u32::MAX) {
            return Err(CommandError::params(key));
        }
        Ok(value.round() as u32)
    }

    fn transform(params: &Params) -> CommandResult<Transform> {
        match params.require_str("mode")? {
            "resize" => Ok(Transform::Resize {
                width: Self::dimension(params, "width")?,
                height: Self::dimension(params, "height")?,
            }),
            "crop" => Ok(Transform::Crop {
                x: Self::dimension(params, "x")?,
                y: Self::dimension(params, "y")?,
                width: Self::dimension(params, "width")?,
                height: Self::dimension(params, "height")?,
            }),
            "rotate" => {
                let degrees = params.require_number("degree")?;
                if degrees.fract() != 0.0 || (degrees as i64) % 90 != 0 {
                    return Err(CommandError::params("degree"));
                }
                Ok(Transform::Rotate {
                    degrees: degrees as i32,
                })
            }
            _ => Err(CommandError::params("mode")),
        }
    }

    fn quality(params: &Params) -> Option<u8> {
        params
            .number("quality")
            .filter(|q| (1.0..=100.0).contains(q))
            .map(|q| q as u8)
    }
}

#[async_trait]
impl CommandHandler for Resize {
    fn name(&self) -> &'static str {
        "resize"
    }

    fn description(&self) -> &'static str {
        "Resize, crop or rotate an image in place"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target", "mode"]
    }

    fn validate(&self, params: &Params) -> CommandResult<()> {
        if !params.has("target") {
            return Err(CommandError::params("target"));
        }
        Self::transform(params).map(|_| ())
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let op = Self::transform(params)?;
        let (driver, id) = ctx.resolve(params.require_str("target")?).await?;
        let stat = driver.stat_required(&id).await?;
        if stat.is_dir() {
            return Err(VfsError::is_a_directory(id).into());
        }
        let parent = stat.parent.clone().or_else(|| path::parent(&id)).ok_or_else(|| {
            VfsError::invalid_path(id.clone())
        })?;
        if let Some(bg) = params.str("bg") {
            tracing::debug!(bg, "rotation background ignored for right angles");
        }

        let data = driver.read_to_vec(&id).await?;
        let out = imaging::transform(data, op, Self::quality(params)).await?;
        let new_id = driver.write_bytes(&parent, &stat.name, out).await?;

        let mut entry = driver.file_required(&new_id).await?;
        entry.tmb = Some("1".to_string());
        let mut reply = Reply::new();
        reply.changed.push(entry);
        Ok(reply.into())
    }
}
