//! Newline-delimited JSON over a byte pipe.
//!
//! ```text
//! → {"cmd":"open","init":1,"reqid":"r1"}
//! ← {"cwd":{...},"files":[...],"api":"2.161","reqid":"r1"}
//! → {"cmd":"upload","target":"v0_Lw","files":[{"name":"a.txt","data":"aGk="}]}
//! → {"cmd":"file","target":"v0_L2EudHh0"}
//! ← {"download":{"name":"a.txt","mime":"text/plain","size":2,"data":"aGk="}}
//! ```
//!
//! Requests run concurrently so that an `abort` line can reach a request
//! that is still in flight. Responses are written in completion order and
//! echo the request's `reqid`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use filedeck_kernel::staging::StagingArea;
use filedeck_kernel::vfs::FileDownload;
use filedeck_kernel::{CommandOutput, Dispatcher, Params};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Failures of the transport itself. Command failures are replies.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("invalid base64 upload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Serve requests from `input` until it closes, then drain in-flight work.
pub async fn serve<R, W>(dispatcher: Arc<Dispatcher>, input: R, mut output: W) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let mut tasks = JoinSet::new();
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let dispatcher = dispatcher.clone();
        let tx = tx.clone();
        tasks.spawn(async move {
            let response = handle_line(&dispatcher, &line).await;
            if tx.send(response.to_string()).await.is_err() {
                debug!("response dropped, writer closed");
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!("request task failed: {e}");
        }
    }
    drop(tx);
    writer
        .await
        .map_err(|e| TransportError::Invalid(format!("writer task failed: {e}")))??;
    Ok(())
}

/// One request line to one response value.
pub async fn handle_line(dispatcher: &Dispatcher, line: &str) -> Value {
    let params = match decode_request(dispatcher.staging(), line).await {
        Ok(params) => params,
        Err(e) => {
            warn!("rejecting request: {e}");
            return json!({ "error": "errCmdParams" });
        }
    };
    let reqid = params.get("reqid").cloned();
    let mut response = match dispatcher.dispatch(params).await {
        CommandOutput::Reply(reply) => reply.to_value(),
        CommandOutput::Download(download) => match encode_download(download).await {
            Ok(value) => value,
            Err(e) => {
                warn!("download failed: {e}");
                json!({ "error": ["errFileNotFound", e.to_string()] })
            }
        },
    };
    if let (Some(reqid), Value::Object(map)) = (reqid, &mut response) {
        map.insert("reqid".to_string(), reqid);
    }
    response
}

/// Parse a request line and stage any inline upload content.
///
/// `files: [{name, data}]` entries are written to the uploads directory and
/// replaced by `{name, path}` as the `upload` command expects.
pub async fn decode_request(staging: &StagingArea, line: &str) -> Result<Params, TransportError> {
    let mut value: Value = serde_json::from_str(line)?;
    let Value::Object(fields) = &mut value else {
        return Err(TransportError::Invalid("request is not a JSON object".into()));
    };
    for key in ["files", "files[]"] {
        if let Some(Value::Array(files)) = fields.get_mut(key) {
            for file in files.iter_mut() {
                stage_inline(staging, file).await?;
            }
        }
    }
    Params::from_json(value).ok_or_else(|| TransportError::Invalid("request is not a JSON object".into()))
}

async fn stage_inline(staging: &StagingArea, file: &mut Value) -> Result<(), TransportError> {
    let Value::Object(entry) = file else {
        return Err(TransportError::Invalid("file entries must be objects".into()));
    };
    let Some(data) = entry.remove("data") else {
        return Ok(());
    };
    let data = data
        .as_str()
        .ok_or_else(|| TransportError::Invalid("file data must be a base64 string".into()))?;
    let bytes = STANDARD.decode(data)?;
    let path = staging.new_upload_path();
    tokio::fs::write(&path, bytes).await?;
    entry.insert("path".to_string(), Value::String(path.to_string_lossy().into_owned()));
    Ok(())
}

async fn encode_download(mut download: FileDownload) -> Result<Value, TransportError> {
    let mut data = Vec::with_capacity(download.length as usize);
    download.body.read_to_end(&mut data).await?;

    let mut body = Map::new();
    body.insert("name".into(), json!(download.name));
    body.insert("mime".into(), json!(download.mime));
    body.insert("size".into(), json!(download.size));
    body.insert("length".into(), json!(data.len()));
    if let Some(range) = download.range {
        body.insert("range".into(), json!(range.header()));
    }
    if let Some(disposition) = download.disposition() {
        body.insert("disposition".into(), json!(disposition));
    }
    body.insert("data".into(), json!(STANDARD.encode(&data)));
    Ok(json!({ "download": body }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use filedeck_kernel::config::{KernelConfig, VolumeConfig};
    use filedeck_kernel::hash;
    use tempfile::TempDir;
    use tokio::io::BufReader;

    async fn dispatcher(dir: &TempDir) -> Arc<Dispatcher> {
        let share = dir.path().join("share");
        std::fs::create_dir_all(&share).unwrap();
        let config = KernelConfig {
            staging_dir: Some(dir.path().join("staging")),
            volumes: vec![VolumeConfig::local(share.to_string_lossy())],
            ..Default::default()
        };
        Arc::new(Dispatcher::from_config(config).await.unwrap())
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir).await;
        let root = hash::encode("v0_", "/");

        let upload = json!({
            "cmd": "upload",
            "target": root,
            "reqid": "u1",
            "files": [{ "name": "hi.txt", "data": STANDARD.encode("hi there") }],
        });
        let reply = handle_line(&d, &upload.to_string()).await;
        assert_eq!(reply["reqid"], "u1");
        assert_eq!(reply["added"][0]["name"], "hi.txt");
        let file = reply["added"][0]["hash"].as_str().unwrap().to_string();

        let fetch = json!({ "cmd": "file", "target": file, "download": 1 });
        let download = handle_line(&d, &fetch.to_string()).await;
        let body = &download["download"];
        assert_eq!(body["name"], "hi.txt");
        assert_eq!(body["disposition"], "attachment;filename=\"hi.txt\"");
        assert_eq!(STANDARD.decode(body["data"].as_str().unwrap()).unwrap(), b"hi there");
    }

    #[tokio::test]
    async fn test_serve_answers_every_line() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir).await;
        let input = "{\"cmd\":\"open\",\"init\":1}\n\nnot json\n{\"cmd\":\"editor\"}\n";
        let (client, server) = tokio::io::duplex(64 * 1024);
        serve(d, BufReader::new(input.as_bytes()), server).await.unwrap();

        let mut out = String::new();
        let mut client = client;
        client.read_to_string(&mut out).await.unwrap();
        let replies: Vec<Value> = out.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().any(|r| r["api"] == "2.161"));
        assert!(replies.iter().any(|r| r["error"] == "errCmdParams"));
        assert!(replies.iter().any(|r| r["error"] == json!(["errUnknownCmd", "editor"])));
    }
}
