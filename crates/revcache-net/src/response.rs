//! Buffered responses as handed to strategies and stored in caches.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A fully buffered HTTP response.
///
/// HTTP error statuses are ordinary responses here; only a transport failure
/// is an error, and that never produces a `FetchResponse` from the loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// Final URL after redirects. Empty for synthesized responses.
    pub url: String,

    /// Status code. `0` marks a network error response.
    pub status: u16,

    /// Status text.
    pub status_text: String,

    /// Response headers in arrival order, names lowercased.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Bytes,

    /// Whether this response was served out of a cache store.
    #[serde(skip)]
    pub from_cache: bool,
}

impl FetchResponse {
    /// Create a response with the given status and body.
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            status,
            status_text: default_status_text(status).to_string(),
            headers: Vec::new(),
            body: body.into(),
            from_cache: false,
        }
    }

    /// An empty `200 OK` with no body, used as a placeholder when the
    /// network is unreachable.
    pub fn empty() -> Self {
        Self::new("", 200, Bytes::new())
    }

    /// A network error response.
    pub fn network_error() -> Self {
        Self {
            status_text: "Network Error".to_string(),
            ..Self::new("", 0, Bytes::new())
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    /// Mark the response as served from a cache store.
    pub fn into_cached(mut self) -> Self {
        self.from_cache = true;
        self
    }

    /// Check if the status is 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if this is a network error response.
    pub fn is_network_error(&self) -> bool {
        self.status == 0
    }

    /// Get a header value, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn default_status_text(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}
