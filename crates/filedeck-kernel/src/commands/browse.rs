//! Read-only navigation commands.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::{
    CommandContext, CommandError, CommandHandler, CommandOutput, CommandResult, Params, Reply,
    entries,
};
use crate::vfs::{Driver, Entry, ROOT_ID, VfsError, VfsResult};

/// Protocol version reported on `open` with `init`.
pub const API_VERSION: &str = "2.161";

/// Keep entries whose mime (or its top-level type) is listed. Empty keeps all.
fn mime_allowed(mimes: &HashSet<String>, mime: &str) -> bool {
    if mimes.is_empty() {
        return true;
    }
    let top = mime.split('/').next().unwrap_or(mime);
    mimes.contains(mime) || mimes.contains(top)
}

/// Entries of the child directories of `id`.
async fn child_dirs(driver: &Driver, id: &str) -> VfsResult<Vec<Entry>> {
    let mut dirs = Vec::new();
    for child in driver.readdir(id).await? {
        if driver.stat(&child).await?.is_some_and(|s| s.is_dir()) {
            if let Some(entry) = driver.file(&child).await? {
                dirs.push(entry);
            }
        }
    }
    Ok(dirs)
}

pub struct Open;

#[async_trait]
impl CommandHandler for Open {
    fn name(&self) -> &'static str {
        "open"
    }

    fn description(&self) -> &'static str {
        "Open a directory: cwd entry, its files and optionally every volume root"
    }

    fn validate(&self, params: &Params) -> CommandResult<()> {
        if params.flag("init") || params.has("target") {
            Ok(())
        } else {
            Err(CommandError::params("target"))
        }
    }

    #[tracing::instrument(skip(self, ctx, params), name = "command.open")]
    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let (driver, id) = match params.str("target") {
            Some(target) => ctx.resolve(target).await?,
            None => (ctx.driver().await?, ROOT_ID.to_string()),
        };
        let mut reply = Reply::new();
        if params.flag("init") {
            let dispatcher = ctx.dispatcher();
            reply.set("api", API_VERSION);
            reply.set("netDrivers", json!(dispatcher.backends().net_protocols()));
            reply.set("uplMaxSize", dispatcher.options().upload_max_size.clone());
        }

        let (cwd_id, cwd) = match driver.file(&id).await? {
            Some(entry) => (id, entry),
            None => (ROOT_ID.to_string(), driver.file_required(ROOT_ID).await?),
        };
        reply.set("options", driver.volume().options());

        let mut files = Vec::new();
        if params.flag("tree") {
            for volume in ctx.volumes().list() {
                let d = ctx.driver_for(&volume).await?;
                if d.is_initialized() {
                    if let Some(root) = d.file(ROOT_ID).await? {
                        files.push(root);
                    }
                }
            }
        }
        if driver.is_initialized() {
            let mimes: HashSet<String> = params.strings("mimes").into_iter().collect();
            let children = match driver.readdir(&cwd_id).await {
                Ok(children) => children,
                // Removed between the stat and the listing.
                Err(VfsError::NotFound(_)) => {
                    debug!(id = %cwd_id, "cwd vanished before listing");
                    Vec::new()
                }
                Err(e) => {
                    warn!(id = %cwd_id, error = %e, "cwd not listable");
                    return Err(e.into());
                }
            };
            for child in children {
                if let Some(entry) = driver.file(&child).await? {
                    if mime_allowed(&mimes, &entry.mime) {
                        files.push(entry);
                    }
                }
            }
        }
        reply.set("cwd", json!(cwd));
        reply.set("files", entries(&files));
        Ok(reply.into())
    }
}

pub struct Ls;

#[async_trait]
impl CommandHandler for Ls {
    fn name(&self) -> &'static str {
        "ls"
    }

    fn description(&self) -> &'static str {
        "Map of child hashes to names"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let (driver, id) = ctx.resolve(params.require_str("target")?).await?;
        let intersect: HashSet<String> = params.strings("intersect").into_iter().collect();
        let mut list = Map::new();
        for child in driver.readdir(&id).await? {
            let Some(stat) = driver.stat(&child).await? else {
                continue;
            };
            if intersect.is_empty() || intersect.contains(&stat.name) {
                list.insert(driver.hash(&child), Value::String(stat.name));
            }
        }
        Ok(Reply::new().with("list", list).into())
    }
}

pub struct Tree;

#[async_trait]
impl CommandHandler for Tree {
    fn name(&self) -> &'static str {
        "tree"
    }

    fn description(&self) -> &'static str {
        "Child directories of a directory"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let (driver, id) = ctx.resolve(params.require_str("target")?).await?;
        let tree = child_dirs(&driver, &id).await?;
        Ok(Reply::new().with("tree", entries(&tree)).into())
    }
}

pub struct Parents;

#[async_trait]
impl CommandHandler for Parents {
    fn name(&self) -> &'static str {
        "parents"
    }

    fn description(&self) -> &'static str {
        "Sibling directories of every ancestor up to a limit"
    }

    fn required(&self) -> &'static [&'static str] {
        &["target"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let (driver, id) = ctx.resolve(params.require_str("target")?).await?;
        let until = match params.str("until") {
            Some(hash) => ctx.volumes().unhash(hash)?.1,
            None => ROOT_ID.to_string(),
        };

        let mut tree = Vec::new();
        let mut current = id;
        loop {
            driver.check_abort()?;
            let Some(parent) = driver.stat_required(&current).await?.parent else {
                break;
            };
            if parent == current {
                break;
            }
            tree.extend(child_dirs(&driver, &parent).await?);
            if parent == until {
                break;
            }
            current = parent;
        }
        Ok(Reply::new().with("tree", entries(&tree)).into())
    }
}

pub struct Info;

#[async_trait]
impl CommandHandler for Info {
    fn name(&self) -> &'static str {
        "info"
    }

    fn description(&self) -> &'static str {
        "Entries for a list of hashes"
    }

    fn required(&self) -> &'static [&'static str] {
        &["targets"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let mut files = Vec::new();
        for hash in params.require_strings("targets")? {
            let (driver, id) = ctx.resolve(&hash).await?;
            if let Some(entry) = driver.file(&id).await? {
                files.push(entry);
            }
        }
        Ok(Reply::new().with("files", entries(&files)).into())
    }
}

#[derive(Debug, Default)]
struct Totals {
    size: u64,
    files: u64,
    dirs: u64,
}

fn measure<'a>(driver: &'a Driver, id: String, totals: &'a mut Totals) -> BoxFuture<'a, VfsResult<u64>> {
    async move {
        let Some(stat) = driver.stat(&id).await? else {
            return Ok(0);
        };
        if !stat.is_dir() {
            totals.files += 1;
            totals.size += stat.size;
            return Ok(stat.size);
        }
        driver.check_abort()?;
        totals.dirs += 1;
        let mut size = 0;
        for child in driver.readdir(&id).await? {
            size += measure(driver, child, totals).await?;
        }
        Ok(size)
    }
    .boxed()
}

pub struct Size;

#[async_trait]
impl CommandHandler for Size {
    fn name(&self) -> &'static str {
        "size"
    }

    fn description(&self) -> &'static str {
        "Recursive size and entry counts"
    }

    fn required(&self) -> &'static [&'static str] {
        &["targets"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let mut totals = Totals::default();
        let mut sizes = Vec::new();
        for hash in params.require_strings("targets")? {
            let (driver, id) = ctx.resolve(&hash).await?;
            sizes.push(measure(&driver, id, &mut totals).await?);
        }
        Ok(Reply::new()
            .with("size", totals.size)
            .with("fileCnt", totals.files)
            .with("dirCnt", totals.dirs)
            .with("sizes", sizes)
            .into())
    }
}

pub struct Subdirs;

#[async_trait]
impl CommandHandler for Subdirs {
    fn name(&self) -> &'static str {
        "subdirs"
    }

    fn description(&self) -> &'static str {
        "Whether each directory has child directories"
    }

    fn required(&self) -> &'static [&'static str] {
        &["targets"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let mut subdirs = Map::new();
        for hash in params.require_strings("targets")? {
            let (driver, id) = ctx.resolve(&hash).await?;
            let flag = u8::from(driver.has_subdirs(&id).await?);
            subdirs.insert(hash, flag.into());
        }
        Ok(Reply::new().with("subdirs", subdirs).into())
    }
}

pub struct Search;

#[async_trait]
impl CommandHandler for Search {
    fn name(&self) -> &'static str {
        "search"
    }

    fn description(&self) -> &'static str {
        "Entries below a directory whose name contains a query"
    }

    fn required(&self) -> &'static [&'static str] {
        &["q"]
    }

    #[tracing::instrument(skip(self, ctx, params), name = "command.search")]
    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let q = params.require_str("q")?;
        let (driver, root) = match params.str("target") {
            Some(target) => ctx.resolve(target).await?,
            None => (ctx.driver().await?, ROOT_ID.to_string()),
        };
        let mimes: HashSet<String> = params.strings("mimes").into_iter().collect();
        let mut files = Vec::new();
        for entry in driver.walk(&root).await? {
            if !entry.stat.name.contains(q) || !mime_allowed(&mimes, &entry.stat.mime) {
                continue;
            }
            if let Some(file) = driver.file(&entry.id).await? {
                files.push(file);
            }
        }
        Ok(Reply::new().with("files", entries(&files)).into())
    }
}

pub struct ListTree;

#[async_trait]
impl CommandHandler for ListTree {
    fn name(&self) -> &'static str {
        "listtree"
    }

    fn description(&self) -> &'static str {
        "Hashes of every entry below each target"
    }

    fn required(&self) -> &'static [&'static str] {
        &["targets"]
    }

    #[tracing::instrument(skip(self, ctx, params), name = "command.listtree")]
    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let mut ids = Vec::new();
        for hash in params.require_strings("targets")? {
            let (driver, id) = ctx.resolve(&hash).await?;
            ids.extend(driver.walk(&id).await?.iter().map(|e| driver.hash(&e.id)));
        }
        Ok(Reply::new().with("ids", ids).into())
    }
}
