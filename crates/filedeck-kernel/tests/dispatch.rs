//! End-to-end command tests through the dispatcher.
//!
//! Each test gets a local volume (`l1_`) rooted in a temp dir, an in-memory
//! volume (`m1_`) and its own staging area.

use filedeck_kernel::config::{KernelConfig, VolumeConfig};
use filedeck_kernel::hash;
use filedeck_kernel::{CommandOutput, Dispatcher, Params, Reply};
use serde_json::{Value, json};
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

struct Fixture {
    _dir: TempDir,
    share: PathBuf,
    dispatcher: Dispatcher,
}

impl Fixture {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let share = dir.path().join("share");
        std::fs::create_dir_all(&share).unwrap();
        let config = KernelConfig {
            staging_dir: Some(dir.path().join("staging")),
            volumes: vec![
                VolumeConfig {
                    id: "l1_".to_string(),
                    ..VolumeConfig::local(share.to_string_lossy())
                },
                VolumeConfig {
                    id: "m1_".to_string(),
                    name: "scratchpad".to_string(),
                    driver: "memory".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let dispatcher = Dispatcher::from_config(config).await.unwrap();
        Self {
            _dir: dir,
            share,
            dispatcher,
        }
    }

    async fn output(&self, params: Value) -> CommandOutput {
        self.dispatcher.dispatch(Params::from_json(params).unwrap()).await
    }

    /// Run a command that must succeed with a JSON reply.
    async fn ok(&self, params: Value) -> Reply {
        let reply = self
            .output(params.clone())
            .await
            .into_reply()
            .expect("json reply");
        assert!(reply.error.is_none(), "{params} failed: {:?}", reply.error);
        reply
    }

    async fn download(&self, params: Value) -> Vec<u8> {
        let CommandOutput::Download(mut download) = self.output(params).await else {
            panic!("expected a download");
        };
        let mut bytes = Vec::new();
        download.body.read_to_end(&mut bytes).await.unwrap();
        bytes
    }

    async fn new_file(&self, dir: &str, name: &str, content: &str) -> String {
        let created = self.ok(json!({ "cmd": "mkfile", "target": dir, "name": name })).await;
        let hash = created.added[0].hash.clone();
        self.ok(json!({ "cmd": "put", "target": hash, "content": content })).await;
        hash
    }
}

fn local_root() -> String {
    hash::encode("l1_", "/")
}

fn memory_root() -> String {
    hash::encode("m1_", "/")
}

#[tokio::test]
async fn test_file_lifecycle() {
    let fx = Fixture::new().await;

    let mkdir = fx.ok(json!({ "cmd": "mkdir", "target": local_root(), "name": "docs" })).await;
    assert_eq!(mkdir.added[0].name, "docs");
    assert_eq!(mkdir.added[0].mime, "directory");
    assert_eq!(mkdir.changed[0].hash, local_root());
    let docs = mkdir.added[0].hash.clone();

    let file = fx.new_file(&docs, "a.txt", "hello").await;
    assert_eq!(std::fs::read_to_string(fx.share.join("docs/a.txt")).unwrap(), "hello");

    let get = fx.ok(json!({ "cmd": "get", "target": file })).await;
    assert_eq!(get.extra["content"], "hello");

    let renamed = fx.ok(json!({ "cmd": "rename", "target": file, "name": "b.txt" })).await;
    assert_eq!(renamed.added[0].name, "b.txt");
    assert_eq!(renamed.removed, vec![file]);
    let file = renamed.added[0].hash.clone();

    let ls = fx.ok(json!({ "cmd": "ls", "target": docs })).await;
    let names: Vec<&Value> = ls.extra["list"].as_object().unwrap().values().collect();
    assert_eq!(names, vec!["b.txt"]);

    let size = fx.ok(json!({ "cmd": "size", "targets": [docs] })).await;
    assert_eq!(size.extra["size"], 5);
    assert_eq!(size.extra["fileCnt"], 1);

    let rm = fx.ok(json!({ "cmd": "rm", "targets": [file] })).await;
    assert_eq!(rm.removed.len(), 1);
    assert!(!fx.share.join("docs/b.txt").exists());
}

#[tokio::test]
async fn test_open_init_lists_every_root() {
    let fx = Fixture::new().await;
    fx.new_file(&local_root(), "readme.md", "# hi").await;

    let open = fx.ok(json!({ "cmd": "open", "init": 1, "tree": 1 })).await;
    assert_eq!(open.extra["api"], "2.161");
    assert_eq!(open.extra["cwd"]["hash"], local_root());
    let files = open.extra["files"].as_array().unwrap();
    let names: Vec<&str> = files.iter().filter_map(|f| f["name"].as_str()).collect();
    assert!(names.contains(&"scratchpad"));
    assert!(names.contains(&"readme.md"));
}

#[tokio::test]
async fn test_paste_across_backends() {
    let fx = Fixture::new().await;
    let file = fx.new_file(&local_root(), "x.txt", "payload").await;

    let copied = fx
        .ok(json!({ "cmd": "paste", "targets": [file], "dst": memory_root() }))
        .await;
    let in_memory = copied.added[0].clone();
    assert_eq!(in_memory.name, "x.txt");
    assert_eq!(in_memory.volumeid, "m1_");
    assert!(copied.removed.is_empty());
    let get = fx.ok(json!({ "cmd": "get", "target": in_memory.hash })).await;
    assert_eq!(get.extra["content"], "payload");

    let moved = fx
        .ok(json!({
            "cmd": "paste",
            "targets": [in_memory.hash],
            "dst": local_root(),
            "cut": 1,
            "renames": ["x.txt"],
        }))
        .await;
    assert_ne!(moved.added[0].name, "x.txt");
    assert_eq!(moved.removed, vec![in_memory.hash.clone()]);
    let gone = fx.output(json!({ "cmd": "get", "target": in_memory.hash })).await;
    assert!(gone.reply().unwrap().error.is_some());
    assert!(fx.share.join(&moved.added[0].name).exists());
}

#[tokio::test]
async fn test_paste_name_collision() {
    let fx = Fixture::new().await;
    let dst = fx.ok(json!({ "cmd": "mkdir", "target": local_root(), "name": "dst" })).await;
    let dst = dst.added[0].hash.clone();
    fx.new_file(&dst, "dup.txt", "1").await;
    let file = fx.new_file(&local_root(), "dup.txt", "2").await;

    let reply = fx
        .output(json!({ "cmd": "paste", "targets": [file], "dst": dst }))
        .await
        .into_reply()
        .unwrap();
    assert_eq!(reply.error, Some(json!("File already exists in destination.")));
    assert_eq!(std::fs::read_to_string(fx.share.join("dst/dup.txt")).unwrap(), "1");
}

#[tokio::test]
async fn test_archive_and_extract() {
    let fx = Fixture::new().await;
    let src = fx.ok(json!({ "cmd": "mkdir", "target": local_root(), "name": "src" })).await;
    let src = src.added[0].hash.clone();
    fx.new_file(&src, "a.txt", "alpha").await;

    let archived = fx
        .ok(json!({
            "cmd": "archive",
            "targets": [src],
            "type": "application/zip",
            "name": "bundle",
        }))
        .await;
    let zip = archived.added[0].clone();
    assert_eq!(zip.name, "bundle.zip");

    let extracted = fx
        .ok(json!({ "cmd": "extract", "target": zip.hash, "makedir": 1 }))
        .await;
    assert_eq!(extracted.added.len(), 1);
    assert_eq!(extracted.added[0].name, "bundle");
    let restored = std::fs::read_to_string(fx.share.join("bundle/src/a.txt")).unwrap();
    assert_eq!(restored, "alpha");

    let bad_type = fx
        .output(json!({ "cmd": "archive", "targets": [src], "type": "application/x-tar" }))
        .await;
    assert_eq!(bad_type.reply().unwrap().error, Some(json!("errCmdParams")));
}

#[tokio::test]
async fn test_extract_into_memory_volume() {
    let fx = Fixture::new().await;
    let file = fx.new_file(&memory_root(), "note.txt", "in memory").await;
    let zip = fx
        .ok(json!({ "cmd": "archive", "targets": [file], "type": "application/zip" }))
        .await;
    assert_eq!(zip.added[0].name, "Archive.zip");
    fx.ok(json!({ "cmd": "rm", "targets": [file] })).await;

    let extracted = fx.ok(json!({ "cmd": "extract", "target": zip.added[0].hash })).await;
    assert_eq!(extracted.added[0].name, "note.txt");
    let get = fx.ok(json!({ "cmd": "get", "target": extracted.added[0].hash })).await;
    assert_eq!(get.extra["content"], "in memory");
}

#[tokio::test]
async fn test_zipdl_two_phases() {
    let fx = Fixture::new().await;
    let file = fx.new_file(&local_root(), "report.txt", "numbers").await;

    let prepared = fx.ok(json!({ "cmd": "zipdl", "targets": [file] })).await;
    let zipdl = &prepared.extra["zipdl"];
    assert_eq!(zipdl["name"], "Archive.zip");
    assert_eq!(zipdl["mime"], "application/zip");
    let tmp = zipdl["file"].as_str().unwrap().to_string();
    let staged = fx.dispatcher.staging().tmp_dir().join(&tmp);
    assert!(staged.exists());

    let bytes = fx
        .download(json!({
            "cmd": "zipdl",
            "download": 1,
            "targets": [file, tmp, "Archive.zip", "application/zip"],
        }))
        .await;
    assert!(bytes.starts_with(b"PK"));
    assert!(!staged.exists());
}

#[tokio::test]
async fn test_file_download_range() {
    let fx = Fixture::new().await;
    let file = fx.new_file(&local_root(), "digits.txt", "0123456789").await;

    let all = fx.download(json!({ "cmd": "file", "target": file })).await;
    assert_eq!(all, b"0123456789");
    let part = fx
        .download(json!({ "cmd": "file", "target": file, "range": "bytes=2-4" }))
        .await;
    assert_eq!(part, b"234");
}

#[tokio::test]
async fn test_chunked_upload() {
    let fx = Fixture::new().await;
    let uploads = fx.dispatcher.staging().uploads_dir().to_path_buf();
    std::fs::write(uploads.join("part0"), "hello ").unwrap();
    std::fs::write(uploads.join("part1"), "world!").unwrap();

    let first = fx
        .ok(json!({
            "cmd": "upload",
            "target": local_root(),
            "chunk": "greeting.txt.0_1.part",
            "range": "0,6,12",
            "cid": "42",
            "files": [{ "name": "blob", "path": "part0" }],
        }))
        .await;
    assert!(first.extra.get("_chunkmerged").is_none());

    let last = fx
        .ok(json!({
            "cmd": "upload",
            "target": local_root(),
            "chunk": "greeting.txt.1_1.part",
            "range": "6,6,12",
            "cid": "42",
            "files": [{ "name": "blob", "path": "part1" }],
        }))
        .await;
    assert_eq!(last.extra["_name"], "greeting.txt");
    let merged = last.extra["_chunkmerged"].as_str().unwrap().to_string();

    let placed = fx
        .ok(json!({
            "cmd": "upload",
            "target": local_root(),
            "chunk": merged,
            "upload": ["greeting.txt"],
        }))
        .await;
    assert_eq!(placed.added[0].name, "greeting.txt");
    let content = std::fs::read_to_string(fx.share.join("greeting.txt")).unwrap();
    assert_eq!(content, "hello world!");
    assert!(!uploads.join(&merged).exists());
}

#[tokio::test]
async fn test_chunked_upload_size_mismatch() {
    let fx = Fixture::new().await;
    let uploads = fx.dispatcher.staging().uploads_dir().to_path_buf();
    std::fs::write(uploads.join("only"), "short").unwrap();

    let reply = fx
        .output(json!({
            "cmd": "upload",
            "target": local_root(),
            "chunk": "big.bin.0_0.part",
            "range": "0,5,100",
            "files": [{ "name": "blob", "path": "only" }],
        }))
        .await
        .into_reply()
        .unwrap();
    assert_eq!(reply.extra["_chunkfailure"], true);
    assert_eq!(
        reply.error,
        Some(json!("Chunked Upload failed. Size mismatch (5 != 100)"))
    );
    assert!(fx.dispatcher.chunks().is_empty());
    assert_eq!(std::fs::read_dir(&uploads).unwrap().count(), 0);
}

#[tokio::test]
async fn test_chunkfail_drops_partial_session() {
    let fx = Fixture::new().await;
    let uploads = fx.dispatcher.staging().uploads_dir().to_path_buf();
    std::fs::write(uploads.join("part0"), "first").unwrap();

    fx.ok(json!({
        "cmd": "upload",
        "target": local_root(),
        "chunk": "movie.mp4.0_2.part",
        "range": "0,5,15",
        "cid": "7",
        "files": [{ "name": "blob", "path": "part0" }],
    }))
    .await;
    assert_eq!(fx.dispatcher.chunks().len(), 1);

    let fail = fx
        .ok(json!({
            "cmd": "upload",
            "target": local_root(),
            "chunk": "movie.mp4.1_2.part",
            "cid": "7",
            "upload": ["chunkfail"],
            "mimes": "chunkfail",
        }))
        .await;
    assert_eq!(fail.extra["warning"], json!(["errUploadFile", "movie.mp4", "errUploadTemp"]));
    assert!(fx.dispatcher.chunks().is_empty());
    assert_eq!(std::fs::read_dir(&uploads).unwrap().count(), 0);
}

#[tokio::test]
async fn test_oversized_chunk_count_is_rejected() {
    let fx = Fixture::new().await;
    let uploads = fx.dispatcher.staging().uploads_dir().to_path_buf();
    std::fs::write(uploads.join("part0"), "x").unwrap();

    let reply = fx
        .output(json!({
            "cmd": "upload",
            "target": local_root(),
            "chunk": "a.txt.0_18446744073709551615.part",
            "range": "0,1,1",
            "files": [{ "name": "blob", "path": "part0" }],
        }))
        .await
        .into_reply()
        .unwrap();
    assert!(reply.error.is_some());
    assert!(fx.dispatcher.chunks().is_empty());
}

#[tokio::test]
async fn test_upload_staged_files_with_rename() {
    let fx = Fixture::new().await;
    fx.new_file(&local_root(), "photo.txt", "old").await;
    let staged = fx.dispatcher.staging().new_upload_path();
    std::fs::write(&staged, "new").unwrap();

    let reply = fx
        .ok(json!({
            "cmd": "upload",
            "target": local_root(),
            "renames": ["photo.txt"],
            "files": [{ "name": "photo.txt", "path": staged.to_string_lossy() }],
        }))
        .await;
    let name = reply.added[0].name.clone();
    assert_ne!(name, "photo.txt");
    assert_eq!(std::fs::read_to_string(fx.share.join(name)).unwrap(), "new");
    assert_eq!(std::fs::read_to_string(fx.share.join("photo.txt")).unwrap(), "old");
    assert!(!staged.exists());
}

#[tokio::test]
async fn test_search_and_listtree() {
    let fx = Fixture::new().await;
    let dir = fx.ok(json!({ "cmd": "mkdir", "target": local_root(), "name": "nested" })).await;
    let dir = dir.added[0].hash.clone();
    fx.new_file(&dir, "needle.txt", "x").await;
    fx.new_file(&local_root(), "hay.txt", "y").await;

    let found = fx.ok(json!({ "cmd": "search", "q": "needle" })).await;
    let files = found.extra["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["name"], "needle.txt");

    let tree = fx.ok(json!({ "cmd": "listtree", "targets": [local_root()] })).await;
    assert_eq!(tree.extra["ids"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_abort_unknown_request() {
    let fx = Fixture::new().await;
    let reply = fx
        .output(json!({ "cmd": "abort", "id": "nope" }))
        .await
        .into_reply()
        .unwrap();
    assert_eq!(reply.error, Some(json!(0)));
    assert_eq!(fx.dispatcher.in_flight(), 0);
}

#[tokio::test]
async fn test_cancelled_walk_stops() {
    let fx = Fixture::new().await;
    let dir = fx.ok(json!({ "cmd": "mkdir", "target": local_root(), "name": "deep" })).await;
    fx.new_file(&dir.added[0].hash, "leaf.txt", "z").await;

    let volume = fx.dispatcher.volumes().get("l1_").unwrap();
    let token = CancellationToken::new();
    let driver = volume.open_driver(&token).await.unwrap();
    token.cancel();
    let err = driver.walk("/").await.unwrap_err();
    assert!(matches!(err, filedeck_kernel::VfsError::Aborted));
    driver.destroy().await;
}

#[tokio::test]
async fn test_netmount_errors() {
    let fx = Fixture::new().await;
    let unknown = fx
        .output(json!({ "cmd": "netmount", "protocol": "gopher", "host": "h" }))
        .await
        .into_reply()
        .unwrap();
    assert_eq!(
        unknown.error,
        Some(json!(["errNetMount", "h", "Not NetMount driver."]))
    );

    let unmount = fx
        .output(json!({ "cmd": "netmount", "protocol": "netunmount", "host": "h", "user": "zz_" }))
        .await
        .into_reply()
        .unwrap();
    assert_eq!(unmount.error, Some(json!("errNetUnMount")));
    assert_eq!(unmount.extra["sync"], true);
}

#[tokio::test]
async fn test_open_surfaces_listing_failure() {
    let fx = Fixture::new().await;
    let file = fx.new_file(&local_root(), "plain.txt", "x").await;

    let open = fx
        .output(json!({ "cmd": "open", "target": file }))
        .await
        .into_reply()
        .unwrap();
    assert!(open.error.is_some());
    assert!(open.extra.get("files").is_none());
}
