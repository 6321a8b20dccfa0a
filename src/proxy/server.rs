//! Proxy server implementation using hyper
//!
//! Accepts plain HTTP/1.1 on a local address and relays every request to the
//! root node's upstream.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::headers::strip_hop_by_hop;
use super::node::ProxyNode;
use crate::error::{RelayError, Result};

/// Body type of every response the server writes
pub type ProxyBody = BoxBody<Bytes, RelayError>;

/// Proxy server bound to one root node
pub struct ProxyServer {
    root: ProxyNode,
    addr: String,
}

impl ProxyServer {
    pub fn new(root: ProxyNode, addr: impl Into<String>) -> Self {
        Self {
            root,
            addr: addr.into(),
        }
    }

    /// Bind the listener and start accepting in the background
    #[instrument(skip(self), fields(addr = %self.addr))]
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|source| RelayError::ListenerBindFailed {
                addr: self.addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            "Proxy server listening on {} (upstream {:?})",
            local_addr, self.root
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Self::run(listener, self.root, shutdown_rx));

        Ok(ProxyHandle {
            shutdown_tx,
            local_addr,
            task,
        })
    }

    async fn run(listener: TcpListener, root: ProxyNode, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let root = root.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, client_addr, root).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        root: ProxyNode,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let root = root.clone();
            async move { Ok::<_, Infallible>(handle_request(&root, req, client_addr).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(io, service)
            .await?;

        Ok(())
    }
}

/// Relay a request through the root node. Failures become an error response
/// carrying the error's status.
#[instrument(
    skip(root, req),
    fields(request_id = %Uuid::new_v4(), method = %req.method(), uri = %req.uri(), client = %client_addr)
)]
pub async fn handle_request<B>(
    root: &ProxyNode,
    req: Request<B>,
    client_addr: SocketAddr,
) -> Response<ProxyBody>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match root.forward(req).await {
        Ok(response) => {
            debug!(status = %response.status(), "Relaying upstream response");
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            Response::from_parts(parts, body.boxed())
        }
        Err(e) => {
            warn!("Request failed: {}", e);
            error_response(e.status_code(), &e.to_string())
        }
    }
}

/// Plain-text response for a failed request
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Keeps the proxy listener up.
///
/// [`ensure_running`](Self::ensure_running) binds a new listener when there
/// is none or the previous one has stopped, so a failed bind at startup can
/// be retried later.
pub struct ListenerSupervisor {
    root: ProxyNode,
    addr: String,
    handle: Mutex<Option<ProxyHandle>>,
}

impl ListenerSupervisor {
    pub fn new(root: ProxyNode, addr: impl Into<String>) -> Self {
        Self {
            root,
            addr: addr.into(),
            handle: Mutex::new(None),
        }
    }

    /// Start the listener unless one is already accepting
    pub async fn ensure_running(&self) -> Result<SocketAddr> {
        let mut handle = self.handle.lock().await;
        if let Some(running) = handle.as_ref().filter(|h| h.is_running()) {
            return Ok(running.local_addr());
        }

        let started = ProxyServer::new(self.root.clone(), self.addr.clone())
            .start()
            .await?;
        let local_addr = started.local_addr();
        *handle = Some(started);
        Ok(local_addr)
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| h.is_running())
    }

    /// Stop the listener, if any, and wait for it to exit
    pub async fn shutdown(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.stop();
            handle.stopped().await;
        }
    }
}

/// Running proxy listener
pub struct ProxyHandle {
    shutdown_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Requests already in flight run to
    /// completion. Calling this more than once is harmless.
    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Stopping proxy listener on {}", self.local_addr);
        }
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow() && !self.task.is_finished()
    }

    /// Wait for the accept loop to exit
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            error!("Proxy listener task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::headers::HeaderInjector;
    use crate::proxy::node::ProxySettings;
    use crate::proxy::rewrite::{PathRewriter, RewriteRule};
    use crate::test_support::{
        body_string, refused_addr, send_request, spawn_raw_upstream, spawn_upstream,
    };
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn relay_root(upstream: SocketAddr) -> ProxyNode {
        let mut settings = ProxySettings::new("127.0.0.1", upstream.port(), false);
        settings.rewriter = PathRewriter::new(vec![RewriteRule::new(
            "/tracker/announce$",
            "/tracker/uannounce",
        )
        .unwrap()]);
        settings.injector = HeaderInjector::from_pairs([
            ("X-Relay-Key", "secret"),
            ("User-Agent", "authrelay/test"),
        ])
        .unwrap();
        ProxyNode::new(settings).unwrap()
    }

    async fn start(root: ProxyNode) -> ProxyHandle {
        ProxyServer::new(root, "127.0.0.1:0").start().await.unwrap()
    }

    #[tokio::test]
    async fn test_relays_rewritten_request() {
        let mut upstream = spawn_upstream(vec![(StatusCode::OK, "d8:completei5ee")]).await;
        let handle = start(relay_root(upstream.addr)).await;
        let proxy = handle.local_addr();

        let req = Request::builder()
            .uri("/tracker/announce?info_hash=%12%34&port=6881")
            .header("host", proxy.to_string())
            .header("x-relay-key", "client-guess")
            .header("user-agent", "torrent-client/1.0")
            .header("x-client-id", "abc")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = send_request(proxy, req).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "d8:completei5ee");

        let seen = upstream.requests.recv().await.unwrap();
        assert_eq!(seen.uri, "/tracker/uannounce?info_hash=%12%34&port=6881");
        assert_eq!(
            seen.headers.get("host").unwrap().to_str().unwrap(),
            format!("127.0.0.1:{}", upstream.addr.port())
        );
        assert_eq!(seen.headers.get_all("x-relay-key").iter().count(), 1);
        assert_eq!(seen.headers.get("x-relay-key").unwrap(), "secret");
        assert_eq!(seen.headers.get("user-agent").unwrap(), "authrelay/test");
        assert_eq!(seen.headers.get("x-client-id").unwrap(), "abc");

        handle.stop();
        handle.stopped().await;
    }

    #[tokio::test]
    async fn test_inbound_path_is_forwarded_verbatim() {
        let mut upstream = spawn_upstream(vec![(StatusCode::OK, "")]).await;
        let mut settings = ProxySettings::new("127.0.0.1", upstream.addr.port(), false);
        settings.rewriter =
            PathRewriter::new(vec![RewriteRule::new("^/scrape:all$", "/scrape").unwrap()]);
        let handle = start(ProxyNode::new(settings).unwrap()).await;

        for path in ["/torrent/a:b+c;v=1.torrent", "/scrape:all"] {
            let req = Request::builder()
                .uri(path)
                .body(Full::new(Bytes::new()))
                .unwrap();
            let response = send_request(handle.local_addr(), req).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(
            upstream.requests.recv().await.unwrap().uri,
            "/torrent/a:b+c;v=1.torrent"
        );
        assert_eq!(upstream.requests.recv().await.unwrap().uri, "/scrape");

        handle.stop();
        handle.stopped().await;
    }

    #[tokio::test]
    async fn test_stalled_upstream_body_ends_relayed_response() {
        let addr = spawn_raw_upstream(|mut stream| async move {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\nx")
                .await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        })
        .await;
        let mut settings = ProxySettings::new("127.0.0.1", addr.port(), false);
        settings.response_timeout = Duration::from_millis(50);
        let handle = start(ProxyNode::new(settings).unwrap()).await;

        let req = Request::builder()
            .uri("/feed")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = send_request(handle.local_addr(), req).await;
        assert_eq!(response.status(), StatusCode::OK);

        // The local connection is torn down instead of hanging
        let body = tokio::time::timeout(Duration::from_secs(3), response.into_body().collect())
            .await
            .expect("relayed body should end");
        assert!(body.is_err());
    }

    #[tokio::test]
    async fn test_upstream_status_is_relayed() {
        let upstream = spawn_upstream(vec![(StatusCode::NOT_FOUND, "no such torrent")]).await;
        let handle = start(relay_root(upstream.addr)).await;

        let req = Request::builder()
            .uri("/torrent/99")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = send_request(handle.local_addr(), req).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "no such torrent");
    }

    #[tokio::test]
    async fn test_post_body_is_forwarded() {
        let mut upstream = spawn_upstream(vec![(StatusCode::CREATED, "")]).await;
        let handle = start(relay_root(upstream.addr)).await;

        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .header("content-type", "application/x-bittorrent")
            .body(Full::new(Bytes::from_static(b"d4:infod4:name3:fooee")))
            .unwrap();
        let response = send_request(handle.local_addr(), req).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let seen = upstream.requests.recv().await.unwrap();
        assert_eq!(seen.method, "POST");
        assert_eq!(seen.uri, "/upload");
        assert_eq!(seen.body, Bytes::from_static(b"d4:infod4:name3:fooee"));
        assert_eq!(
            seen.headers.get("content-type").unwrap(),
            "application/x-bittorrent"
        );
    }

    #[tokio::test]
    async fn test_dead_upstream_gives_bad_gateway() {
        let dead = refused_addr().await;
        let handle = start(relay_root(dead)).await;

        let req = Request::builder()
            .uri("/tracker/announce")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = send_request(handle.local_addr(), req).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_string(response).await.contains("refused"));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let upstream = spawn_upstream(vec![(StatusCode::OK, "")]).await;
        let handle = start(relay_root(upstream.addr)).await;
        let addr = handle.local_addr();
        assert!(handle.is_running());

        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
        handle.stopped().await;

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let upstream = spawn_upstream(vec![(StatusCode::OK, "")]).await;
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let result = ProxyServer::new(relay_root(upstream.addr), addr.to_string())
            .start()
            .await;

        match result {
            Err(RelayError::ListenerBindFailed { addr: failed, .. }) => {
                assert_eq!(failed, addr.to_string());
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("bind should have failed"),
        }
    }

    #[tokio::test]
    async fn test_supervisor_restarts_stopped_listener() {
        let upstream = spawn_upstream(vec![(StatusCode::OK, "")]).await;
        let supervisor = ListenerSupervisor::new(relay_root(upstream.addr), "127.0.0.1:0");
        assert!(!supervisor.is_running().await);

        let first = supervisor.ensure_running().await.unwrap();
        assert!(supervisor.is_running().await);
        assert_eq!(supervisor.ensure_running().await.unwrap(), first);

        supervisor.shutdown().await;
        assert!(!supervisor.is_running().await);

        let second = supervisor.ensure_running().await.unwrap();
        let req = Request::builder()
            .uri("/status")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(send_request(second, req).await.status(), StatusCode::OK);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_supervisor_retries_after_bind_failure() {
        let upstream = spawn_upstream(vec![(StatusCode::OK, "")]).await;
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let supervisor = ListenerSupervisor::new(relay_root(upstream.addr), addr.to_string());

        assert!(matches!(
            supervisor.ensure_running().await,
            Err(RelayError::ListenerBindFailed { .. })
        ));
        assert!(!supervisor.is_running().await);

        drop(taken);
        assert_eq!(supervisor.ensure_running().await.unwrap(), addr);
        assert!(supervisor.is_running().await);

        supervisor.shutdown().await;
    }

    #[test]
    fn test_error_response() {
        let response = error_response(StatusCode::GATEWAY_TIMEOUT, "upstream timed out");
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
