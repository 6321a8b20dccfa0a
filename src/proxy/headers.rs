//! Header handling for forwarded requests

use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION};

use crate::error::{RelayError, Result};

/// Fixed set of headers laid over every forwarded request
#[derive(Debug, Clone, Default)]
pub struct HeaderInjector {
    headers: HeaderMap,
}

impl HeaderInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from name/value pairs, rejecting invalid names and values
    /// containing control characters
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut injector = Self::new();
        for (name, value) in pairs {
            injector.insert(name.as_ref(), value.as_ref())?;
        }
        Ok(injector)
    }

    /// Add or replace one injected header
    pub fn insert(&mut self, name: &str, value: &str) -> Result<()> {
        self.insert_value(name, value, false)
    }

    /// Like [`insert`](Self::insert), but the value is masked in debug output
    pub fn insert_sensitive(&mut self, name: &str, value: &str) -> Result<()> {
        self.insert_value(name, value, true)
    }

    fn insert_value(&mut self, name: &str, value: &str, sensitive: bool) -> Result<()> {
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| {
            RelayError::InvalidConfig(format!("invalid injected header name: {:?}", name))
        })?;
        let mut value = HeaderValue::from_str(value).map_err(|_| {
            RelayError::InvalidConfig(format!("invalid value for injected header {}", name))
        })?;
        value.set_sensitive(sensitive);
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Overlay the injected headers; each replaces every existing value of
    /// the same name
    pub fn apply(&self, target: &mut HeaderMap) {
        for (name, value) in &self.headers {
            target.insert(name.clone(), value.clone());
        }
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Header names listed in the `Connection` values, lowercased
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Copy end-to-end headers from an inbound request. Besides the fixed
/// hop-by-hop set, anything the client named in `Connection` stays local.
pub fn copy_forwardable(source: &HeaderMap, target: &mut HeaderMap) {
    let listed = connection_tokens(source);
    for (name, value) in source {
        let name_str = name.as_str();
        if !is_hop_by_hop_header(name_str) && !listed.iter().any(|t| t == name_str) {
            target.append(name.clone(), value.clone());
        }
    }
}

/// Drop hop-by-hop headers from a relayed response
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(name);
    }
}
