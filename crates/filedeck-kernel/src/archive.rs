//! Zip archive creation and extraction through drivers.
//!
//! Archives are built in the volume's scratch directory from driver streams
//! and extracted there before being re-inserted with a cross-backend copy,
//! so every backend kind gets both for free. The zip codec is synchronous;
//! it runs on the blocking pool and pulls driver streams through a bridge.

use futures::future::{BoxFuture, FutureExt};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::transfer;
use crate::vfs::{ByteStream, Driver, ROOT_ID, VfsError, VfsResult, path};
use crate::volume::Volume;

/// Mime of the only archive format offered.
pub const ZIP_MIME: &str = "application/zip";

enum ZipItem {
    Dir(String),
    File(String, ByteStream),
}

fn zip_error(e: ZipError) -> VfsError {
    match e {
        ZipError::Io(e) => e.into(),
        other => VfsError::other(format!("zip: {other}")),
    }
}

fn join_error(e: tokio::task::JoinError) -> VfsError {
    VfsError::other(format!("archive task failed: {e}"))
}

/// Write a store-only zip of `ids` to a fresh file in the scratch directory.
///
/// Directories are added with all their descendants, named relative to the
/// archive root. Complete only once the writer has finished the central
/// directory and the file is synced.
#[tracing::instrument(skip(driver), fields(volume = driver.volume().id()), name = "archive.create")]
pub async fn archive_to_temp(driver: &Driver, ids: &[String]) -> VfsResult<PathBuf> {
    let scratch = driver.volume().scratch_dir().to_path_buf();
    tokio::fs::create_dir_all(&scratch).await?;
    let dest = scratch.join(format!("{}.zip", uuid::Uuid::new_v4()));

    let handle = tokio::runtime::Handle::current();
    let (tx, mut rx) = mpsc::channel::<ZipItem>(1);
    let target = dest.clone();
    let writer = tokio::task::spawn_blocking(move || -> VfsResult<()> {
        let file = std::fs::File::create(&target)?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .large_file(true);
        while let Some(item) = rx.blocking_recv() {
            match item {
                ZipItem::Dir(name) => zip.add_directory(name, options).map_err(zip_error)?,
                ZipItem::File(name, body) => {
                    zip.start_file(name, options).map_err(zip_error)?;
                    let mut reader = SyncIoBridge::new_with_handle(body, handle.clone());
                    std::io::copy(&mut reader, &mut zip)?;
                }
            }
        }
        let file = zip.finish().map_err(zip_error)?;
        file.sync_all()?;
        Ok(())
    });

    let fed = feed(driver, ids, &tx).await;
    drop(tx);
    let written = writer.await.map_err(join_error).and_then(|r| r);

    // The writer's error is authoritative: a failed feed usually means it died.
    if let Err(e) = written.and(fed) {
        remove_quietly(&dest).await;
        return Err(e);
    }
    Ok(dest)
}

async fn feed(driver: &Driver, ids: &[String], tx: &mpsc::Sender<ZipItem>) -> VfsResult<()> {
    for id in ids {
        append(driver, id.clone(), None, tx).await?;
    }
    Ok(())
}

fn append<'a>(
    driver: &'a Driver,
    id: String,
    dir: Option<String>,
    tx: &'a mpsc::Sender<ZipItem>,
) -> BoxFuture<'a, VfsResult<()>> {
    async move {
        driver.check_abort()?;
        let Some(stat) = driver.stat(&id).await? else {
            return Ok(());
        };
        let name = match dir {
            Some(dir) => format!("{dir}/{}", stat.name),
            None => stat.name.clone(),
        };
        let closed = || VfsError::other("archive writer stopped");
        if stat.is_dir() {
            tx.send(ZipItem::Dir(format!("{name}/")))
                .await
                .map_err(|_| closed())?;
            for child in driver.readdir(&id).await? {
                append(driver, child, Some(name.clone()), tx).await?;
            }
        } else {
            let body = driver.read(&id, None).await?;
            tx.send(ZipItem::File(name, body))
                .await
                .map_err(|_| closed())?;
        }
        Ok(())
    }
    .boxed()
}

/// Build a zip of `ids` and store it as `dir/name`. Returns the new id.
pub async fn archive(driver: &Driver, ids: &[String], dir: &str, name: &str) -> VfsResult<String> {
    let tmp = archive_to_temp(driver, ids).await?;
    let result = async {
        let file = tokio::fs::File::open(&tmp).await?;
        driver.write(dir, name, Box::pin(file)).await
    }
    .await;
    remove_quietly(&tmp).await;
    result
}

/// Unpack an archive into a fresh directory under the scratch directory.
#[tracing::instrument(skip(driver), fields(volume = driver.volume().id()), name = "archive.extract")]
pub async fn extract_to_temp(driver: &Driver, archive_id: &str) -> VfsResult<PathBuf> {
    let scratch = driver.volume().scratch_dir().to_path_buf();
    let key = uuid::Uuid::new_v4();
    let dir = scratch.join(key.to_string());
    let zip_path = scratch.join(format!("{key}.zip"));
    tokio::fs::create_dir_all(&dir).await?;

    let result = async {
        let mut body = driver.read(archive_id, None).await?;
        let mut file = tokio::fs::File::create(&zip_path).await?;
        tokio::io::copy(&mut body, &mut file).await?;
        file.sync_all().await?;
        drop(file);
        driver.check_abort()?;

        let (src, out) = (zip_path.clone(), dir.clone());
        let abort = driver.abort_token().clone();
        tokio::task::spawn_blocking(move || unpack(&src, &out, &|| abort.is_cancelled()))
            .await
            .map_err(join_error)?
    }
    .await;

    remove_quietly(&zip_path).await;
    match result {
        Ok(()) => Ok(dir),
        Err(e) => {
            remove_quietly(&dir).await;
            Err(e)
        }
    }
}

/// Unpack the zip at `src` under `out`, checking `cancelled` before every
/// entry and every buffer. Entries naming paths outside `out` fail the
/// extraction.
fn unpack(src: &Path, out: &Path, cancelled: &dyn Fn() -> bool) -> VfsResult<()> {
    let mut archive = ZipArchive::new(std::fs::File::open(src)?).map_err(zip_error)?;
    for i in 0..archive.len() {
        if cancelled() {
            return Err(VfsError::Aborted);
        }
        let mut entry = archive.by_index(i).map_err(zip_error)?;
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| VfsError::path_escapes_root(entry.name().to_string()))?;
        let target = out.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&target)?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = entry.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            if cancelled() {
                return Err(VfsError::Aborted);
            }
        }
    }
    Ok(())
}

/// Unpack `archive_id` into `dst_dir` of the same driver.
///
/// Entries are re-inserted from `scratch`, a local volume rooted at the
/// scratch directory. Returns the ids of the top-level entries created.
pub async fn extract(
    driver: &Driver,
    archive_id: &str,
    dst_dir: &str,
    scratch: &Arc<Volume>,
) -> VfsResult<Vec<String>> {
    let tmpdir = extract_to_temp(driver, archive_id).await?;
    let source = scratch.open_driver(driver.abort_token()).await?;
    let result = reinsert(&source, &tmpdir, driver, dst_dir).await;
    source.destroy().await;
    remove_quietly(&tmpdir).await;
    result
}

async fn reinsert(source: &Driver, tmpdir: &Path, dst: &Driver, dst_dir: &str) -> VfsResult<Vec<String>> {
    let scratch_root = source
        .backend()
        .local_path(ROOT_ID)
        .ok_or_else(|| VfsError::other("scratch volume has no local root"))?;
    let tmpdir = dunce::canonicalize(tmpdir)?;
    let rel = tmpdir
        .strip_prefix(&scratch_root)
        .map_err(|_| VfsError::path_escapes_root(tmpdir.display().to_string()))?;
    let base = format!("/{}", rel.to_string_lossy().replace('\\', "/"));

    let mut names = Vec::new();
    let mut dir = tokio::fs::read_dir(&tmpdir).await?;
    while let Some(entry) = dir.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    let mut created = Vec::with_capacity(names.len());
    for name in names {
        let tree = transfer::copy_tree(source, &path::join(&base, &name), dst, dst_dir).await?;
        debug!(id = %tree.id, "extracted entry");
        created.push(tree.id);
    }
    Ok(created)
}

async fn remove_quietly(path: &Path) {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(e) = result {
        warn!(path = %path.display(), "could not remove scratch entry: {e}");
    }
}
