use crate::util::validate_url;
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// User-Agent sent on every discovery, scrape and refresh request.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; NewsAggregator/1.0)";

/// Errors that can occur while fetching a URL.
///
/// Non-2xx responses are *not* errors at this layer: callers get the
/// [`FetchedPage`] back so challenge pages can still be inspected.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The target (or a redirect hop) failed the SSRF policy
    #[error("Blocked URL {url}: {reason}")]
    Blocked { url: String, reason: String },
    /// Network-level error (DNS, connection, TLS, redirect policy, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Request did not complete within its time bound
    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    /// Response body exceeded the configured size limit
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    /// HTTP response with non-2xx status code (raised by [`FetchedPage::error_for_status`])
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
}

/// Process-wide fetch settings.
///
/// Built once at startup (see [`crate::config::Config::fetch_config`]) and
/// shared read-only by every component through [`Fetcher`].
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub default_timeout: Duration,
    pub synthesis_timeout: Duration,
    pub feed_timeout: Duration,
    pub webhook_timeout: Duration,
    pub max_response_bytes: usize,
    pub max_redirects: usize,
    /// Skip the SSRF host check. Tests point this at a loopback mock server.
    pub allow_private_hosts: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            default_timeout: Duration::from_secs(10),
            synthesis_timeout: Duration::from_secs(15),
            feed_timeout: Duration::from_secs(30),
            webhook_timeout: Duration::from_secs(10),
            max_response_bytes: 10 * 1024 * 1024,
            max_redirects: 10,
            allow_private_hosts: false,
        }
    }
}

impl FetchConfig {
    /// Default settings with the SSRF host check disabled.
    pub fn permissive() -> Self {
        Self {
            allow_private_hosts: true,
            ..Self::default()
        }
    }
}

/// A fully-read HTTP response.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL after following redirects
    pub final_url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchedPage {
    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Lowercased `Content-Type` header, or an empty string.
    pub fn content_type(&self) -> String {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Converts a non-2xx page into [`FetchError::HttpStatus`].
    pub fn error_for_status(self) -> Result<Self, FetchError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(FetchError::HttpStatus(self.status.as_u16()))
        }
    }
}

/// Bounded HTTP client shared by discovery, scraping, refresh and webhooks.
///
/// Every request carries the configured User-Agent, passes the SSRF guard,
/// and is wrapped in a timeout that covers both the request and the body
/// read; on expiry the in-flight future is dropped, which cancels it.
///
/// Cloning is cheap (the inner `reqwest::Client` and config are shared).
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    config: Arc<FetchConfig>,
}

impl Fetcher {
    /// Builds the shared client from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Network`] if the TLS backend cannot be initialised.
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let max_redirects = config.max_redirects;
        let allow_private = config.allow_private_hosts;

        // Redirect hops are re-checked so a public URL cannot bounce us into
        // the private network.
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= max_redirects {
                return attempt.error("too many redirects");
            }
            if !allow_private {
                if let Err(e) = validate_url(attempt.url().as_str()) {
                    return attempt.error(format!("redirect blocked: {e}"));
                }
            }
            attempt.follow()
        });

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(policy)
            .build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// GET with the default (discovery) time bound.
    pub async fn get(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.get_with_timeout(url, self.config.default_timeout).await
    }

    /// GET with an explicit time bound.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Blocked`] - URL failed the SSRF policy
    /// - [`FetchError::Timeout`] - request plus body read exceeded `timeout`
    /// - [`FetchError::Network`] - connection, TLS or redirect failure
    /// - [`FetchError::ResponseTooLarge`] - body exceeded `max_response_bytes`
    pub async fn get_with_timeout(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedPage, FetchError> {
        let target = self.guard(url)?;
        tracing::debug!(url = %target, timeout_secs = timeout.as_secs(), "GET");

        let request = self.client.get(target);
        self.execute(request, timeout).await
    }

    /// POST a pre-serialized JSON body.
    ///
    /// The body is sent exactly as given so signatures computed over it stay
    /// valid. `headers` override client defaults (including User-Agent).
    pub async fn post_json(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<FetchedPage, FetchError> {
        let target = self.guard(url)?;
        tracing::debug!(url = %target, bytes = body.len(), "POST");

        let request = self
            .client
            .post(target)
            .headers(headers)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        self.execute(request, timeout).await
    }

    fn guard(&self, url: &str) -> Result<Url, FetchError> {
        if self.config.allow_private_hosts {
            return Url::parse(url).map_err(|e| FetchError::Blocked {
                url: url.to_owned(),
                reason: e.to_string(),
            });
        }
        validate_url(url).map_err(|e| FetchError::Blocked {
            url: url.to_owned(),
            reason: e.to_string(),
        })
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<FetchedPage, FetchError> {
        let limit = self.config.max_response_bytes;
        let work = async move {
            let response = request.send().await?;
            let final_url = response.url().clone();
            let status = response.status();
            let headers = response.headers().clone();
            let body = read_limited_bytes(response, limit).await?;
            Ok::<_, FetchError>(FetchedPage {
                final_url,
                status,
                headers,
                body,
            })
        };

        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| FetchError::Timeout(timeout))?
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
