//! Upstream connections
//!
//! Opens one plain or TLS connection per request, runs a single HTTP/1.1
//! exchange over it, and hands back the response with its body still
//! streaming from the socket.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant, Sleep};
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use crate::error::{RelayError, Result};

/// Byte stream to an upstream, plain or TLS
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> UpstreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Upstream response body that fails with [`RelayError::Timeout`] when the
/// upstream leaves a read pending for longer than the idle window.
///
/// The window only runs while the reader is waiting on the socket, so a
/// slow local consumer never trips it.
pub struct UpstreamBody {
    inner: Incoming,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
    waiting: bool,
}

impl UpstreamBody {
    fn new(inner: Incoming, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            deadline: Box::pin(sleep(idle)),
            waiting: false,
        }
    }
}

impl fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamBody")
            .field("idle", &self.idle)
            .finish()
    }
}

impl Body for UpstreamBody {
    type Data = Bytes;
    type Error = RelayError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, RelayError>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(frame) => {
                this.waiting = false;
                Poll::Ready(frame.map(|result| result.map_err(RelayError::from)))
            }
            Poll::Pending => {
                if !this.waiting {
                    this.waiting = true;
                    let next = Instant::now() + this.idle;
                    this.deadline.as_mut().reset(next);
                }
                match this.deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        debug!("Upstream body idle for {:?}", this.idle);
                        Poll::Ready(Some(Err(RelayError::Timeout)))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Connects to a single upstream host
#[derive(Clone)]
pub struct UpstreamConnector {
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

impl UpstreamConnector {
    /// Create a connector. `connect_timeout` bounds TCP connect and TLS
    /// handshake together; `response_timeout` bounds the wait for the
    /// response head and then every wait between body frames.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        use_tls: bool,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self> {
        let tls = if use_tls {
            Some(tls_connector()?)
        } else {
            None
        };

        Ok(Self {
            host: host.into(),
            port,
            tls,
            connect_timeout,
            response_timeout,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// `host:port` as used for connecting and in error messages
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Send one request over a fresh connection.
    ///
    /// Resolves once the response head has arrived; the body is read from the
    /// upstream socket as the caller polls it.
    #[instrument(skip(self, req), fields(upstream = %self.addr(), method = %req.method(), uri = %req.uri()))]
    pub async fn send<B>(&self, req: Request<B>) -> Result<Response<UpstreamBody>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let io = timeout(self.connect_timeout, self.open())
            .await
            .map_err(|_| RelayError::Timeout)??;

        let (mut sender, conn) = http1::handshake(TokioIo::new(io)).await?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection ended: {}", e);
            }
        });

        let response = timeout(self.response_timeout, sender.send_request(req))
            .await
            .map_err(|_| RelayError::Timeout)??;

        debug!(status = %response.status(), "Upstream responded");
        let idle = self.response_timeout;
        Ok(response.map(|body| UpstreamBody::new(body, idle)))
    }

    async fn open(&self) -> Result<Box<dyn UpstreamIo>> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::ConnectionRefused => RelayError::UpstreamConnectionRefused {
                    addr: self.addr(),
                },
                _ => RelayError::UpstreamConnectFailed(format!("{}: {}", self.addr(), e)),
            })?;
        stream.set_nodelay(true)?;

        let Some(tls) = &self.tls else {
            return Ok(Box::new(stream));
        };

        let server_name = ServerName::try_from(self.host.clone()).map_err(|e| {
            RelayError::UpstreamTlsHandshakeFailed(format!("invalid server name {}: {}", self.host, e))
        })?;
        let stream = tls
            .connect(server_name, stream)
            .await
            .map_err(|e| RelayError::UpstreamTlsHandshakeFailed(e.to_string()))?;

        debug!("TLS session established");
        Ok(Box::new(stream))
    }
}

/// Client TLS configuration using the webpki root set
fn tls_connector() -> Result<TlsConnector> {
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| RelayError::Internal(format!("TLS setup failed: {}", e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}
