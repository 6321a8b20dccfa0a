//! authrelay - authenticating reverse proxy
//!
//! Relays plain HTTP from local clients to a credential-protected upstream.
//!
//! ## Features
//!
//! - Single-hop reverse proxy with optional TLS to the upstream
//! - Ordered regex path rewrites and injected headers
//! - Streaming request and response bodies
//! - Generic retry-with-backoff with pluggable failure classifiers
//! - Scheduled feed polling through the proxy

pub mod config;
pub mod error;
pub mod proxy;
pub mod retry;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::{RelayError, Result};
