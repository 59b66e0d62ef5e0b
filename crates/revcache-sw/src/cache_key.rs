//! Versioned cache keys.
//!
//! A key is the request URL with the revision appended as the
//! `__WB_REVISION__` query parameter. An entry without a revision is keyed by
//! its bare URL. Two revisions of one URL therefore never share a key, and a
//! stale revision simply becomes unreachable until it is reaped.

use std::fmt;

use url::Url;

use crate::error::{SwError, SwResult};

/// Query parameter carrying the revision.
pub const REVISION_PARAM: &str = "__WB_REVISION__";

/// A storage key bound to one (url, revision) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for `url` at `revision`.
    ///
    /// `url` must not already carry the revision parameter.
    pub fn encode(url: &Url, revision: Option<&str>) -> Self {
        debug_assert!(
            !url.query_pairs().any(|(name, _)| name == REVISION_PARAM),
            "url already carries a revision: {url}"
        );
        match revision {
            Some(revision) => {
                let mut keyed = url.clone();
                keyed.query_pairs_mut().append_pair(REVISION_PARAM, revision);
                Self(keyed.into())
            }
            None => Self(url.as_str().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The plain URL to fetch for this key.
    pub fn fetch_url(&self) -> SwResult<Url> {
        strip_revision(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Remove the revision parameter from a stored key, leaving every other
/// query segment byte-for-byte as it was.
pub fn strip_revision(key: &str) -> SwResult<Url> {
    let mut url = Url::parse(key).map_err(|e| SwError::invalid_url(key, e))?;
    let Some(query) = url.query() else {
        return Ok(url);
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|segment| segment.split('=').next() != Some(REVISION_PARAM))
        .collect();
    let rebuilt = if kept.is_empty() || kept.iter().all(|s| s.is_empty()) {
        None
    } else {
        Some(kept.join("&"))
    };
    url.set_query(rebuilt.as_deref());
    Ok(url)
}
