//! Unix socket server for IPC

use crate::events::Event;
use crate::protocol::{Request, Response};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub struct SocketServer {
    path: PathBuf,
    listener: UnixListener,
}

impl SocketServer {
    pub async fn bind(path: &Path) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        info!("Socket server listening on {:?}", path);
        Ok(Self { path: path.to_path_buf(), listener })
    }

    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn socket_path() -> PathBuf {
        // SAFETY: getuid has no preconditions and cannot fail.
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/run/user/{}/minerguard.sock", uid))
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn encode(response: &Response) -> Option<String> {
    match serde_json::to_string(response) {
        Ok(json) => Some(json + "\n"),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            None
        }
    }
}

/// Serve one client: answer its requests and forward every event to it.
pub async fn handle_client<H>(
    stream: UnixStream,
    mut events: broadcast::Receiver<Event>,
    handler: Arc<H>,
) where
    H: RequestHandler + Send + Sync + 'static,
{
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        tokio::select! {
            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => break,
                    Ok(_) => {
                        let response = match serde_json::from_str::<Request>(&line) {
                            Ok(request) => handler.handle(request).await,
                            Err(e) => {
                                warn!("Invalid request: {}", e);
                                Response::error(e)
                            }
                        };
                        line.clear();
                        let Some(json) = encode(&response) else { continue };
                        if let Err(e) = writer.write_all(json.as_bytes()).await {
                            error!("Failed to write response: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Read error: {}", e);
                        break;
                    }
                }
            }
            result = events.recv() => {
                match result {
                    Ok(event) => {
                        let Some(json) = encode(&Response::Event { data: event }) else { continue };
                        if let Err(e) = writer.write_all(json.as_bytes()).await {
                            error!("Failed to forward event: {}", e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Client fell behind, dropped {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

#[async_trait::async_trait]
pub trait RequestHandler {
    async fn handle(&self, request: Request) -> Response;
}
