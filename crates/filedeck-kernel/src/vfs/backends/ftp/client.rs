//! [`FtpSession`] over suppaftp's tokio client.
//!
//! Passive binary transfers. Ranged downloads never send `REST`: servers
//! disagree on whether a restart marker survives the `PASV` that opens the
//! data connection, so the leading bytes are read and dropped instead.

use async_trait::async_trait;
use std::time::UNIX_EPOCH;
use suppaftp::list::File as ListLine;
use suppaftp::tokio::AsyncFtpStream;
use suppaftp::types::FileType;
use suppaftp::FtpError;
use tokio::io::{AsyncReadExt, AsyncWrite};
use tracing::debug;

use super::{FtpConnector, FtpParams, FtpSession, RemoteEntry};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::ByteStream;
use crate::vfs::types::ByteRange;

/// Translate a client failure for the entry `id`.
fn ftp_error(err: FtpError, id: &str) -> VfsError {
    match err {
        FtpError::ConnectionError(e) => e.into(),
        FtpError::UnexpectedResponse(response) => {
            let text = String::from_utf8_lossy(&response.body).trim_end().to_string();
            match response.status.code() {
                450 | 550 => VfsError::not_found(id),
                530 | 532 => VfsError::permission_denied(text),
                553 => VfsError::invalid_path(id),
                _ => VfsError::protocol(text),
            }
        }
        other => VfsError::protocol(other.to_string()),
    }
}

fn remote_entry(line: &str) -> Option<RemoteEntry> {
    let parsed = match ListLine::try_from(line.trim_end()) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(line, "skipping unparsable listing line: {e}");
            return None;
        }
    };
    let name = parsed.name();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    let modified = parsed
        .modified()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64);
    Some(RemoteEntry {
        name: name.to_string(),
        is_dir: parsed.is_directory(),
        size: parsed.size() as u64,
        modified,
    })
}

/// One logged-in control connection.
pub struct ClientSession {
    stream: AsyncFtpStream,
    params: FtpParams,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("host", &self.params.host)
            .field("port", &self.params.port)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Connect, log in and switch to binary mode.
    pub async fn connect(params: &FtpParams) -> VfsResult<Self> {
        let stream = Self::open(params).await?;
        debug!(host = %params.host, "ftp session established");
        Ok(Self {
            stream,
            params: params.clone(),
        })
    }

    async fn open(params: &FtpParams) -> VfsResult<AsyncFtpStream> {
        let mut stream = AsyncFtpStream::connect((params.host.as_str(), params.port))
            .await
            .map_err(|e| ftp_error(e, "/"))?;
        stream
            .login(params.user.as_str(), params.pass.as_str())
            .await
            .map_err(|e| ftp_error(e, "/"))?;
        stream
            .transfer_type(FileType::Binary)
            .await
            .map_err(|e| ftp_error(e, "/"))?;
        Ok(stream)
    }
}

#[async_trait]
impl FtpSession for ClientSession {
    async fn list(&mut self, dir: &str) -> VfsResult<Vec<RemoteEntry>> {
        let lines = self
            .stream
            .list(Some(dir))
            .await
            .map_err(|e| ftp_error(e, dir))?;
        Ok(lines.iter().filter_map(|l| remote_entry(l)).collect())
    }

    async fn retrieve(
        &mut self,
        id: &str,
        range: Option<ByteRange>,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> VfsResult<u64> {
        let mut data = self
            .stream
            .retr_as_stream(id)
            .await
            .map_err(|e| ftp_error(e, id))?;
        let copied = match range {
            Some(range) => {
                let mut prefix = (&mut data).take(range.start);
                let skipped = tokio::io::copy(&mut prefix, &mut tokio::io::sink()).await?;
                if skipped < range.start {
                    0
                } else {
                    tokio::io::copy(&mut (&mut data).take(range.len()), sink).await?
                }
            }
            None => tokio::io::copy(&mut data, sink).await?,
        };

        match self.stream.finalize_retr_stream(data).await {
            Ok(()) => Ok(copied),
            // A range that stops short of the end leaves the server reporting
            // an aborted transfer; start over on a clean control channel.
            Err(e) if range.is_some() => {
                debug!(id, "ranged download cut short, reconnecting: {e}");
                self.stream = Self::open(&self.params).await?;
                Ok(copied)
            }
            Err(e) => Err(ftp_error(e, id)),
        }
    }

    async fn store(&mut self, id: &str, mut data: ByteStream) -> VfsResult<()> {
        self.stream
            .put_file(id, &mut data)
            .await
            .map(drop)
            .map_err(|e| ftp_error(e, id))
    }

    async fn mkdir(&mut self, id: &str) -> VfsResult<()> {
        self.stream.mkdir(id).await.map_err(|e| ftp_error(e, id))
    }

    async fn rename(&mut self, from: &str, to: &str) -> VfsResult<()> {
        self.stream
            .rename(from, to)
            .await
            .map_err(|e| ftp_error(e, from))
    }

    async fn delete(&mut self, id: &str) -> VfsResult<()> {
        self.stream.rm(id).await.map_err(|e| ftp_error(e, id))
    }

    async fn rmdir(&mut self, id: &str) -> VfsResult<()> {
        self.stream.rmdir(id).await.map_err(|e| ftp_error(e, id))
    }

    async fn site(&mut self, command: &str) -> VfsResult<()> {
        self.stream
            .site(command)
            .await
            .map(drop)
            .map_err(|e| ftp_error(e, "/"))
    }

    async fn quit(&mut self) {
        if let Err(e) = self.stream.quit().await {
            debug!("ftp quit failed: {e}");
        }
    }
}

/// Connects [`ClientSession`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientConnector;

#[async_trait]
impl FtpConnector for ClientConnector {
    async fn connect(&self, params: &FtpParams) -> VfsResult<Box<dyn FtpSession>> {
        Ok(Box::new(ClientSession::connect(params).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    const CONTENT: &[u8] = b"0123456789abcdefghij";

    /// Single-client server that answers the commands a session sends and
    /// records them in order.
    async fn scripted_server(control: TcpListener, data: TcpListener) -> Vec<String> {
        let port = data.local_addr().unwrap().port();
        let (sock, _) = control.accept().await.unwrap();
        let mut sock = BufReader::new(sock);
        let mut seen = Vec::new();
        sock.get_mut().write_all(b"220 ready\r\n").await.unwrap();
        loop {
            let mut line = String::new();
            if sock.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let cmd = line.trim_end().to_string();
            seen.push(cmd.clone());
            let verb = cmd.split(' ').next().unwrap_or_default().to_ascii_uppercase();
            let reply = match verb.as_str() {
                "USER" => "331 need password\r\n".to_string(),
                "PASS" => "230 ok\r\n".to_string(),
                "TYPE" => "200 binary\r\n".to_string(),
                "PASV" => format!("227 Entering Passive Mode (127,0,0,1,{},{})\r\n", port / 256, port % 256),
                "LIST" | "RETR" => {
                    sock.get_mut().write_all(b"150 here it comes\r\n").await.unwrap();
                    let (mut d, _) = data.accept().await.unwrap();
                    let body: &[u8] = if verb == "LIST" {
                        b"drwxr-xr-x 2 ftp ftp 4096 Mar 03 2021 sub\r\n-rw-r--r-- 1 ftp ftp 20 Jan 01 2024 a b.txt\r\n"
                    } else {
                        CONTENT
                    };
                    // The client may hang up early on a ranged read.
                    let _ = d.write_all(body).await;
                    let _ = d.shutdown().await;
                    "226 done\r\n".to_string()
                }
                "QUIT" => {
                    sock.get_mut().write_all(b"221 bye\r\n").await.unwrap();
                    break;
                }
                _ => "502 not implemented\r\n".to_string(),
            };
            sock.get_mut().write_all(reply.as_bytes()).await.unwrap();
        }
        seen
    }

    async fn start() -> (FtpParams, tokio::task::JoinHandle<Vec<String>>) {
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let params = FtpParams {
            host: "127.0.0.1".to_string(),
            port: control.local_addr().unwrap().port(),
            user: "alice".to_string(),
            pass: "secret".to_string(),
        };
        (params, tokio::spawn(scripted_server(control, data)))
    }

    #[tokio::test]
    async fn test_ranged_retrieve_reads_from_start_without_rest() {
        let (params, server) = start().await;
        let mut session = ClientSession::connect(&params).await.unwrap();

        let mut out = Vec::new();
        let copied = session
            .retrieve("/f", Some(ByteRange::new(10, 14)), &mut out)
            .await
            .unwrap();
        assert_eq!(copied, 4);
        assert_eq!(out, b"abcd");
        session.quit().await;

        let seen = server.await.unwrap();
        assert!(seen.iter().all(|c| !c.starts_with("REST")), "{seen:?}");
        assert!(seen.contains(&"RETR /f".to_string()));
        assert_eq!(seen.first().map(String::as_str), Some("USER alice"));
    }

    #[tokio::test]
    async fn test_full_retrieve_and_listing() {
        let (params, server) = start().await;
        let mut session = ClientSession::connect(&params).await.unwrap();

        let mut out = Vec::new();
        session.retrieve("/f", None, &mut out).await.unwrap();
        assert_eq!(out, CONTENT);

        let entries = session.list("/pub").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "sub");
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].name, "a b.txt");
        assert_eq!(entries[1].size, 20);
        session.quit().await;

        let seen = server.await.unwrap();
        assert!(seen.contains(&"LIST /pub".to_string()));
    }
}
