//! Reverse proxy
//!
//! - `node`: path tree nodes and upstream request building
//! - `rewrite`: ordered regex rewrites applied to upstream paths
//! - `headers`: injected headers and hop-by-hop filtering
//! - `connector`: plain/TLS upstream connections
//! - `server`: the local listener, its handle and supervisor

pub mod connector;
pub mod headers;
pub mod node;
pub mod rewrite;
pub mod server;

pub use connector::{UpstreamBody, UpstreamConnector};
pub use headers::{is_hop_by_hop_header, HeaderInjector};
pub use node::{ProxyNode, ProxySettings};
pub use rewrite::{PathRewriter, RewriteRule};
pub use server::{ListenerSupervisor, ProxyBody, ProxyHandle, ProxyServer};
