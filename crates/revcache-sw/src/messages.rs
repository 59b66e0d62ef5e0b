//! Messages exchanged with foreground contexts.
//!
//! Both directions are JSON objects of the shape `{type, payload}`.

use serde::{Deserialize, Serialize};
use url::Url;

/// Foreground → worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundMessage {
    /// Start a prefetch of every manifest key matching the pattern.
    CacheRoutes {
        #[serde(rename = "routeRegex")]
        route_regex: String,
    },
    /// Cancel the current prefetch, if any.
    CancelCacheRoutes,
    /// Wipe all caches and deregister.
    Reset,
}

impl InboundMessage {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Kind of resource that failed to load, used to pick the right warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchErrorCategory {
    Generic,
    Json,
    Image,
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "gif", "webm", "jpg", "webp", "jpeg", "svg"];

impl FetchErrorCategory {
    /// Classify by the file extension of the URL path.
    pub fn classify(url: &Url) -> Self {
        let ext = url
            .path()
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.contains('/'));
        match ext {
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => Self::Image,
            Some("json") => Self::Json,
            _ => Self::Generic,
        }
    }
}

/// Progress of one prefetch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    pub fetched: usize,
    #[serde(rename = "fetchTotal")]
    pub total: usize,
}

impl ProgressState {
    pub fn is_complete(&self) -> bool {
        self.fetched == self.total
    }
}

/// One failed unit of prefetch work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchFailure {
    /// Cache key being worked on; empty if the run failed before any item.
    pub key: String,
    pub reason: String,
}

impl PrefetchFailure {
    pub fn new(key: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Worker → every foreground context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    FetchError(FetchErrorCategory),
    CacheRoutesProgress(ProgressState),
    CacheRoutesError { errors: Vec<PrefetchFailure> },
}

impl OutboundMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
