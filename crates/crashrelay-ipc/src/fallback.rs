//! Fallback channel
//!
//! Each message kind is a well-known route: `POST /{namespace}/{kind}` with
//! the payload as request body. Requests carry the subordinate's identifier
//! in [`PROCESS_HEADER`]; the coordinator maps it to a process id through
//! the [`TokenResolver`]. Requests without a resolvable identifier are still
//! processed, with no origin process.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatch::Dispatcher;
use crate::message::{IpcMessage, MessageKind};
use crate::registry::{Binding, Origin, TokenResolver};
use crate::IpcError;

/// Header carrying the per-process identifier
pub const PROCESS_HEADER: &str = "x-crashrelay-process";

// ============================================================================
// Server
// ============================================================================

/// Coordinator side of the fallback channel
pub struct FallbackServer {
    namespace: String,
    dispatcher: Arc<Dispatcher>,
    resolver: Arc<TokenResolver>,
}

impl FallbackServer {
    pub fn new(namespace: impl Into<String>, dispatcher: Arc<Dispatcher>, resolver: Arc<TokenResolver>) -> Self {
        Self {
            namespace: namespace.into(),
            dispatcher,
            resolver,
        }
    }

    /// Binds the loopback listener; `127.0.0.1:0` picks a free port
    pub async fn bind(addr: &str) -> Result<TcpListener, IpcError> {
        let addr: SocketAddr = addr.parse().map_err(|e| {
            IpcError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid fallback address {addr}: {e}"),
            ))
        })?;
        Ok(TcpListener::bind(addr).await?)
    }

    pub async fn run(self: Arc<Self>, addr: &str, shutdown: CancellationToken) -> Result<(), IpcError> {
        let listener = Self::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<(), IpcError> {
        info!(addr = %listener.local_addr()?, namespace = %self.namespace, "Fallback channel listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let Some((stream, _)) = crate::accepted(result, Binding::Fallback).await else {
                        continue;
                    };
                    let io = TokioIo::new(stream);
                    let server = Arc::clone(&self);

                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let server = Arc::clone(&server);
                            async move { server.handle_request(req).await }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            error!(error = %e, "Fallback HTTP connection error");
                        }
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("Fallback channel shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_request(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let Some(kind) = self.route_kind(req.uri().path()) else {
            return Ok(respond(StatusCode::NOT_FOUND, "Not Found"));
        };
        if req.method() != Method::POST {
            return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"));
        }

        let token = req
            .headers()
            .get(PROCESS_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = req.into_body().collect().await?.to_bytes();

        let message = match IpcMessage::from_payload(kind, body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message");
                return Ok(respond(StatusCode::BAD_REQUEST, "Malformed payload"));
            }
        };

        let pid = match token {
            Some(token) => self.resolver.resolve(&token).await,
            None => None,
        };
        let origin = Origin {
            pid,
            binding: Binding::Fallback,
        };
        // Subordinates only wait for the request to be accepted
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            dispatcher.dispatch(origin, message).await;
        });
        Ok(respond(StatusCode::OK, ""))
    }

    /// Maps `/{namespace}/{route}` to a message kind
    fn route_kind(&self, path: &str) -> Option<MessageKind> {
        let rest = path.strip_prefix('/')?.strip_prefix(self.namespace.as_str())?;
        MessageKind::from_route(rest.strip_prefix('/')?)
    }
}

fn respond(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

// ============================================================================
// Client
// ============================================================================

/// Subordinate side of the fallback channel
#[derive(Clone)]
pub struct FallbackClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl FallbackClient {
    pub fn new(addr: &str, namespace: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("http://{addr}/{namespace}"),
            token,
        }
    }

    pub async fn send(&self, message: &IpcMessage) -> Result<(), IpcError> {
        let url = format!("{}/{}", self.base_url, message.kind().route());
        let mut request = self.client.post(url).body(message.to_payload()?);
        if let Some(token) = &self.token {
            request = request.header(PROCESS_HEADER, token);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::dispatch::tests::Recorder;
    use crate::dispatch::IMessageHandler;
    use crate::registry::tests::FakeHost;
    use crate::registry::ProcessRegistry;
    use crashrelay_core::domain::ProcessId;

    async fn start_server() -> (String, Arc<Recorder>, CancellationToken) {
        let host = FakeHost::with(&[(42, "renderer", Some("tok-42"))]);
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ProcessRegistry::new()),
            host.clone(),
            recorder.clone(),
        ));
        let resolver = Arc::new(TokenResolver::new(host));
        let server = Arc::new(FallbackServer::new("crashrelay-ipc", dispatcher, resolver));

        let listener = FallbackServer::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(listener, shutdown.clone()));
        (addr, recorder, shutdown)
    }

    #[test]
    fn test_route_kind() {
        let host = FakeHost::with(&[]);
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ProcessRegistry::new()),
            host.clone(),
            recorder,
        ));
        let server = FallbackServer::new("ns", dispatcher, Arc::new(TokenResolver::new(host)));

        assert_eq!(server.route_kind("/ns/structured-log"), Some(MessageKind::StructuredLog));
        assert_eq!(server.route_kind("/ns/start"), Some(MessageKind::Start));
        assert_eq!(server.route_kind("/ns/unknown"), None);
        assert_eq!(server.route_kind("/other/event"), None);
        assert_eq!(server.route_kind("/nsx/event"), None);
    }

    #[tokio::test]
    async fn test_messages_attributed_by_token() {
        let (addr, recorder, shutdown) = start_server().await;
        let client = FallbackClient::new(&addr, "crashrelay-ipc", Some("tok-42".into()));

        client.send(&IpcMessage::Start).await.unwrap();
        client
            .send(&IpcMessage::Event(json!({"message": "boom"})))
            .await
            .unwrap();
        recorder.wait_for(2).await;

        // dispatch is detached from the response, so arrival order is not fixed
        let received = recorder.received.lock().unwrap().clone();
        assert_eq!(received.len(), 2);
        for (origin, _) in &received {
            assert_eq!(origin.pid, Some(ProcessId::new(42)));
            assert_eq!(origin.binding, Binding::Fallback);
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_token_still_processed() {
        let (addr, recorder, shutdown) = start_server().await;
        let client = FallbackClient::new(&addr, "crashrelay-ipc", Some("nobody".into()));

        client
            .send(&IpcMessage::StructuredLog(json!({"body": "hi"})))
            .await
            .unwrap();
        recorder.wait_for(1).await;
        assert_eq!(recorder.received.lock().unwrap()[0].0.pid, None);
        shutdown.cancel();
    }

    /// Handler that takes a while before recording
    struct SlowHandler {
        delay: std::time::Duration,
        inner: Arc<Recorder>,
    }

    #[async_trait::async_trait]
    impl IMessageHandler for SlowHandler {
        async fn handle(&self, origin: Origin, message: IpcMessage) {
            tokio::time::sleep(self.delay).await;
            self.inner.handle(origin, message).await;
        }
    }

    #[tokio::test]
    async fn test_send_returns_before_handling_completes() {
        let host = FakeHost::with(&[]);
        let recorder = Arc::new(Recorder::default());
        let handler = Arc::new(SlowHandler {
            delay: std::time::Duration::from_millis(1500),
            inner: recorder.clone(),
        });
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ProcessRegistry::new()),
            host.clone(),
            handler,
        ));
        let server = Arc::new(FallbackServer::new(
            "crashrelay-ipc",
            dispatcher,
            Arc::new(TokenResolver::new(host)),
        ));
        let listener = FallbackServer::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(listener, shutdown.clone()));

        let client = FallbackClient::new(&addr, "crashrelay-ipc", None);
        let started = std::time::Instant::now();
        client
            .send(&IpcMessage::Event(json!({"message": "slow"})))
            .await
            .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(1000));
        assert!(recorder.received.lock().unwrap().is_empty());

        recorder.wait_for(1).await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (addr, recorder, shutdown) = start_server().await;
        let http = reqwest::Client::new();

        let missing = http
            .post(format!("http://{addr}/crashrelay-ipc/bogus"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let malformed = http
            .post(format!("http://{addr}/crashrelay-ipc/event"))
            .body("[1,2]")
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);

        let get = http
            .get(format!("http://{addr}/crashrelay-ipc/event"))
            .send()
            .await
            .unwrap();
        assert_eq!(get.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

        assert!(recorder.received.lock().unwrap().is_empty());
        shutdown.cancel();
    }
}
