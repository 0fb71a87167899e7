//! Direct channel
//!
//! Length-delimited frames over a Unix socket. Each frame is one kind byte
//! followed by the payload (see [`crate::message`]). The origin process is
//! taken from the socket's peer credentials. The coordinator answers a
//! `start` frame with an acknowledgement frame; nothing else is answered.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crashrelay_core::domain::ProcessId;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::message::{IpcMessage, MessageKind};
use crate::registry::{Binding, Origin};
use crate::IpcError;

/// Frame sent back for an accepted `start`
fn ack_frame() -> Bytes {
    Bytes::from_static(&[MessageKind::Start as u8])
}

// ============================================================================
// Server
// ============================================================================

/// Coordinator side of the direct channel
pub struct DirectServer {
    socket_path: PathBuf,
    dispatcher: Arc<Dispatcher>,
}

impl DirectServer {
    pub fn new(socket_path: impl Into<PathBuf>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            socket_path: socket_path.into(),
            dispatcher,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the socket, replacing a stale socket file left by a previous run
    pub fn bind(&self) -> Result<UnixListener, IpcError> {
        remove_stale_socket(&self.socket_path)?;
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(UnixListener::bind(&self.socket_path)?)
    }

    /// Binds and serves until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), IpcError> {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(&self, listener: UnixListener, shutdown: CancellationToken) -> Result<(), IpcError> {
        info!(path = %self.socket_path.display(), "Direct channel listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let Some((stream, _)) = crate::accepted(result, Binding::Direct).await else {
                        continue;
                    };
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, dispatcher, shutdown).await;
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("Direct channel shutting down");
                    break;
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %e, "Failed to remove socket file");
        }
        Ok(())
    }
}

fn remove_stale_socket(path: &Path) -> Result<(), IpcError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    use std::os::unix::fs::FileTypeExt;
    if !metadata.file_type().is_socket() {
        return Err(IpcError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} exists but is not a socket", path.display()),
        )));
    }
    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "Removed stale socket file");
    Ok(())
}

async fn handle_connection(stream: UnixStream, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
    let pid = stream
        .peer_cred()
        .ok()
        .and_then(|cred| cred.pid())
        .and_then(|pid| u32::try_from(pid).ok())
        .map(ProcessId::new);
    let origin = Origin {
        pid,
        binding: Binding::Direct,
    };
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    loop {
        let next = tokio::select! {
            next = framed.next() => next,
            _ = shutdown.cancelled() => break,
        };
        let frame = match next {
            Some(Ok(frame)) => frame.freeze(),
            Some(Err(e)) => {
                warn!(pid = ?pid, error = %e, "Direct channel read failed");
                break;
            }
            None => break,
        };

        let message = match IpcMessage::from_frame(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(pid = ?pid, error = %e, "Dropping malformed message");
                continue;
            }
        };

        let is_start = message.kind() == MessageKind::Start;
        dispatcher.dispatch(origin, message).await;
        if is_start {
            if let Err(e) = framed.send(ack_frame()).await {
                warn!(pid = ?pid, error = %e, "Failed to acknowledge start");
                break;
            }
        }
    }
    debug!(pid = ?pid, "Direct connection closed");
}

// ============================================================================
// Client
// ============================================================================

/// Subordinate side of the direct channel
pub struct DirectClient {
    framed: Mutex<Framed<UnixStream, LengthDelimitedCodec>>,
    handshake_timeout: Duration,
}

impl DirectClient {
    pub async fn connect(socket_path: impl AsRef<Path>, handshake_timeout: Duration) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(socket_path.as_ref()).await?;
        Ok(Self {
            framed: Mutex::new(Framed::new(stream, LengthDelimitedCodec::new())),
            handshake_timeout,
        })
    }

    /// Sends `start` and waits a bounded time for the acknowledgement
    pub async fn start(&self) -> Result<(), IpcError> {
        let mut framed = self.framed.lock().await;
        framed.send(IpcMessage::Start.to_frame()?).await?;

        match tokio::time::timeout(self.handshake_timeout, framed.next()).await {
            Ok(Some(Ok(_))) => Ok(()),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => Err(IpcError::Closed),
            Err(_) => {
                warn!(
                    timeout_ms = self.handshake_timeout.as_millis() as u64,
                    "Could not connect to coordinator. Check that the coordinator is running \
                     and serves the direct channel"
                );
                Err(IpcError::HandshakeTimeout(self.handshake_timeout))
            }
        }
    }

    /// Fire-and-forget send
    pub async fn send(&self, message: &IpcMessage) -> Result<(), IpcError> {
        let frame = message.to_frame()?;
        self.framed.lock().await.send(frame).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::dispatch::tests::Recorder;
    use crate::registry::tests::FakeHost;
    use crate::registry::ProcessRegistry;

    fn server(path: &Path) -> (DirectServer, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(
            Arc::new(ProcessRegistry::new()),
            FakeHost::with(&[]),
            recorder.clone(),
        );
        (DirectServer::new(path, Arc::new(dispatcher)), recorder)
    }

    #[tokio::test]
    async fn test_handshake_and_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let (server, recorder) = server(&path);
        let shutdown = CancellationToken::new();
        let listener = server.bind().unwrap();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { server.serve(listener, token).await });

        let client = DirectClient::connect(&path, Duration::from_secs(1)).await.unwrap();
        client.start().await.unwrap();
        client
            .send(&IpcMessage::Event(json!({"message": "boom"})))
            .await
            .unwrap();
        recorder.wait_for(2).await;

        let received = recorder.received.lock().unwrap().clone();
        assert_eq!(received[0].1, IpcMessage::Start);
        assert_eq!(received[1].0.binding, Binding::Direct);
        assert_eq!(received[1].0.pid, Some(ProcessId::new(std::process::id())));

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_close_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let (server, recorder) = server(&path);
        let listener = server.bind().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move { server.serve(listener, shutdown).await }
        });

        let stream = UnixStream::connect(&path).await.unwrap();
        let mut raw = Framed::new(stream, LengthDelimitedCodec::new());
        raw.send(Bytes::from_static(&[MessageKind::Event as u8, b'{'])).await.unwrap();
        raw.send(Bytes::from_static(&[0xff])).await.unwrap();
        raw.send(IpcMessage::StructuredLog(json!({"body": "ok"})).to_frame().unwrap())
            .await
            .unwrap();

        recorder.wait_for(1).await;
        assert_eq!(recorder.kinds(), vec![MessageKind::StructuredLog]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_handshake_times_out_without_ack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _accepted = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let client = DirectClient::connect(&path, Duration::from_millis(50)).await.unwrap();
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, IpcError::HandshakeTimeout(_)));
    }

    #[test]
    fn test_bind_refuses_to_replace_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"x").unwrap();
        assert!(remove_stale_socket(&path).is_err());
        assert!(path.exists());
    }
}
