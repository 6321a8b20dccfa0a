//! Proxy nodes
//!
//! A node stands for one position in the inbound path tree. The root node is
//! built from [`ProxySettings`]; every child shares the root's upstream and
//! differs only in its base path.
//!
//! The tree is for addressing only. What goes upstream is the configured
//! prefix followed by the inbound path exactly as the client sent it, so
//! characters such as `:` `+` `;` and stray `%` reach the rewrite rules and
//! the upstream unchanged.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Body;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri, Version};
use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::{debug, instrument};

use super::connector::{UpstreamBody, UpstreamConnector};
use super::headers::{copy_forwardable, HeaderInjector};
use super::rewrite::PathRewriter;
use crate::error::{RelayError, Result};

/// Everything but the unreserved characters gets escaped in a segment
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Settings for the root proxy node
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub upstream_host: String,
    pub upstream_port: u16,
    pub use_tls: bool,
    /// Path prefix on the upstream, empty or starting with `/`
    pub base_path: String,
    pub rewriter: PathRewriter,
    pub injector: HeaderInjector,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl ProxySettings {
    pub fn new(upstream_host: impl Into<String>, upstream_port: u16, use_tls: bool) -> Self {
        Self {
            upstream_host: upstream_host.into(),
            upstream_port,
            use_tls,
            base_path: String::new(),
            rewriter: PathRewriter::default(),
            injector: HeaderInjector::default(),
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
        }
    }
}

struct Upstream {
    /// Configured base path without its trailing `/`
    prefix: String,
    host_header: HeaderValue,
    rewriter: PathRewriter,
    injector: HeaderInjector,
    connector: UpstreamConnector,
}

/// Forwards requests to a fixed upstream under a base path
#[derive(Clone)]
pub struct ProxyNode {
    upstream: Arc<Upstream>,
    base_path: String,
}

impl fmt::Debug for ProxyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyNode")
            .field("upstream", &self.upstream.connector.addr())
            .field("tls", &self.upstream.connector.uses_tls())
            .field("base_path", &self.base_path)
            .finish()
    }
}

impl ProxyNode {
    /// Build the root node
    pub fn new(settings: ProxySettings) -> Result<Self> {
        if settings.upstream_host.is_empty() {
            return Err(RelayError::InvalidConfig(
                "upstream host must not be empty".to_string(),
            ));
        }
        if settings.upstream_port == 0 {
            return Err(RelayError::InvalidConfig(
                "upstream port must not be 0".to_string(),
            ));
        }
        if !settings.base_path.is_empty() && !settings.base_path.starts_with('/') {
            return Err(RelayError::InvalidConfig(format!(
                "base path must start with '/': {:?}",
                settings.base_path
            )));
        }

        let host_header = HeaderValue::from_str(&host_header(
            &settings.upstream_host,
            settings.upstream_port,
            settings.use_tls,
        ))
        .map_err(|_| {
            RelayError::InvalidConfig(format!("invalid upstream host: {:?}", settings.upstream_host))
        })?;

        let connector = UpstreamConnector::new(
            settings.upstream_host,
            settings.upstream_port,
            settings.use_tls,
            settings.connect_timeout,
            settings.response_timeout,
        )?;

        let prefix = settings.base_path.trim_end_matches('/').to_string();

        Ok(Self {
            upstream: Arc::new(Upstream {
                prefix: prefix.clone(),
                host_header,
                rewriter: settings.rewriter,
                injector: settings.injector,
                connector,
            }),
            base_path: prefix,
        })
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn upstream_host(&self) -> &str {
        self.upstream.connector.host()
    }

    pub fn upstream_port(&self) -> u16 {
        self.upstream.connector.port()
    }

    pub fn uses_tls(&self) -> bool {
        self.upstream.connector.uses_tls()
    }

    /// Host header sent upstream; the port is left out when it is the
    /// scheme default
    pub fn host_header(&self) -> &HeaderValue {
        &self.upstream.host_header
    }

    /// Child node one segment deeper. The raw segment is percent-encoded, so
    /// a `/` inside it never introduces a new path level.
    pub fn get_child(&self, segment: impl AsRef<[u8]>) -> ProxyNode {
        let mut base_path = String::with_capacity(self.base_path.len() + 16);
        base_path.push_str(&self.base_path);
        base_path.push('/');
        base_path.extend(percent_encode(segment.as_ref(), SEGMENT));

        ProxyNode {
            upstream: Arc::clone(&self.upstream),
            base_path,
        }
    }

    /// Walk an inbound request path segment by segment
    pub fn resolve(&self, path: &str) -> ProxyNode {
        let path = path.strip_prefix('/').unwrap_or(path);
        path.split('/').fold(self.clone(), |node, segment| {
            let decoded: Cow<'_, [u8]> = percent_decode_str(segment).into();
            node.get_child(decoded)
        })
    }

    /// Rewritten upstream path and query for an inbound request path.
    ///
    /// `path` is taken verbatim from the request line and appended to the
    /// configured prefix before the rewrite rules run.
    pub fn upstream_path(&self, path: &str, query: Option<&str>) -> String {
        let mut full = String::with_capacity(self.upstream.prefix.len() + path.len() + 1);
        full.push_str(&self.upstream.prefix);
        if !path.starts_with('/') {
            full.push('/');
        }
        full.push_str(path);

        let mut target = self.upstream.rewriter.apply(&full);
        if !target.starts_with('/') {
            target.insert(0, '/');
        }
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    /// Turn an inbound request into the one sent upstream: same method and
    /// body, end-to-end headers copied, then Host set, then injected headers
    /// laid over the top.
    pub fn upstream_request<B>(&self, req: Request<B>) -> Result<Request<B>> {
        let (parts, body) = req.into_parts();

        let target = self.upstream_path(parts.uri.path(), parts.uri.query());
        let uri: Uri = target.parse().map_err(|e| {
            RelayError::InvalidRequest(format!("invalid upstream path {:?}: {}", target, e))
        })?;

        let mut upstream_req = Request::new(body);
        *upstream_req.method_mut() = parts.method;
        *upstream_req.uri_mut() = uri;
        *upstream_req.version_mut() = Version::HTTP_11;

        let headers = upstream_req.headers_mut();
        copy_forwardable(&parts.headers, headers);
        headers.insert(HOST, self.upstream.host_header.clone());
        self.upstream.injector.apply(headers);

        Ok(upstream_req)
    }

    /// Forward a request and return the upstream response with its body
    /// still streaming
    #[instrument(skip(self, req), fields(base_path = %self.base_path))]
    pub async fn forward<B>(&self, req: Request<B>) -> Result<Response<UpstreamBody>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let upstream_req = self.upstream_request(req)?;
        debug!(target_path = %upstream_req.uri(), "Forwarding request upstream");
        self.upstream.connector.send(upstream_req).await
    }
}

fn host_header(host: &str, port: u16, use_tls: bool) -> String {
    let host = if host.contains(':') {
        Cow::Owned(format!("[{}]", host))
    } else {
        Cow::Borrowed(host)
    };

    let default_port = if use_tls { 443 } else { 80 };
    if port == default_port {
        host.into_owned()
    } else {
        format!("{}:{}", host, port)
    }
}
