//! # Revcache Net
//!
//! Network access for the revcache background worker.
//!
//! ## Design Goals
//!
//! 1. **One seam**: strategies and the prefetch pool only see the [`Fetcher`] trait
//! 2. **Fixed credentials policy**: same-origin credentials are always attached
//! 3. **Transport failures only**: HTTP error statuses come back as responses

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

pub mod response;

pub use response::FetchResponse;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// What the requesting context intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestDestination {
    #[default]
    #[serde(rename = "")]
    Empty,
    Document,
    Script,
    Style,
    Font,
    Image,
    Audio,
    Video,
    Manifest,
    Worker,
}

/// Credentials mode for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsMode {
    /// Never send credentials.
    Omit,
    /// Send credentials only for same-origin requests.
    #[default]
    SameOrigin,
    /// Always send credentials.
    Include,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub destination: RequestDestination,
    pub credentials: CredentialsMode,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            destination: RequestDestination::Empty,
            credentials: CredentialsMode::SameOrigin,
            timeout: None,
        }
    }

    /// Parse a URL and create a GET request for it.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the destination.
    pub fn destination(mut self, destination: RequestDestination) -> Self {
        self.destination = destination;
        self
    }

    /// Set the credentials mode.
    pub fn credentials(mut self, credentials: CredentialsMode) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

/// Check whether two URLs share scheme, host and port.
pub fn is_same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

/// Anything that can turn a request into a buffered response.
///
/// Implementations return `Err` only when the transport fails; a 404 or 500
/// is a successful fetch.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<FetchResponse, NetError>;
}

/// HTTP basic credentials attached according to the request's credentials mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: Option<String>,
}

/// Resource loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Per-request timeout. `None` leaves timing to the network stack.
    #[serde(with = "optional_secs")]
    pub timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Keep a cookie jar across requests. Cookies only travel with
    /// requests whose credentials mode allows credentials.
    pub cookies_enabled: bool,
    /// Origin the worker is deployed at; decides what "same origin" means.
    pub origin: Option<Url>,
    /// Credentials for installations behind authentication.
    pub basic_auth: Option<BasicAuth>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("revcache/{}", env!("CARGO_PKG_VERSION")),
            timeout: None,
            max_redirects: 10,
            cookies_enabled: true,
            origin: None,
            basic_auth: None,
        }
    }
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Resource loader backed by reqwest.
pub struct ResourceLoader {
    /// Carries the cookie jar; used when credentials are attached.
    client: Client,
    /// No cookie store at all.
    anonymous: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Self::build_client(&config, config.cookies_enabled)?;
        let anonymous = Self::build_client(&config, false)?;

        info!(origin = ?config.origin.as_ref().map(Url::as_str), "ResourceLoader initialized");

        Ok(Self {
            client,
            anonymous,
            config,
        })
    }

    fn build_client(config: &LoaderConfig, cookies: bool) -> Result<Client, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(cookies);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Decide whether credentials go out with this request.
    fn attaches_credentials(&self, request: &Request) -> bool {
        match request.credentials {
            CredentialsMode::Omit => false,
            CredentialsMode::Include => true,
            CredentialsMode::SameOrigin => self
                .config
                .origin
                .as_ref()
                .is_some_and(|origin| is_same_origin(origin, &request.url)),
        }
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: Request) -> Result<FetchResponse, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let credentialed = self.attaches_credentials(&request);
        let client = if credentialed {
            &self.client
        } else {
            &self.anonymous
        };
        let mut req_builder = client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if credentialed {
            if let Some(ref auth) = self.config.basic_auth {
                req_builder = req_builder.basic_auth(&auth.username, auth.password.as_ref());
            }
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await.map_err(|e| match request.timeout {
            Some(t) if e.is_timeout() => NetError::Timeout(t),
            _ => NetError::HttpError(e),
        })?;

        let status = response.status();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        trace!(url = %url, status = %status, body_len = body.len(), "Response received");

        Ok(FetchResponse {
            url,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
            from_cache: false,
        })
    }
}
