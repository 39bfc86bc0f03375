use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
///
/// These errors cover both parsing failures and security policy violations
/// designed to prevent SSRF (Server-Side Request Forgery) attacks. Every URL
/// this crate fetches is attacker-controlled (user input, feed links, link
/// tags in scraped HTML), so the same policy is applied everywhere.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string was empty after trimming.
    #[error("Empty URL")]
    Empty,
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
}

/// Validates a URL string for use as a fetch target.
///
/// Rejects:
/// - Non-HTTP(S) schemes (e.g., `file://`, `ftp://`)
/// - Localhost addresses (`localhost`, `127.0.0.1`, `::1`)
/// - The unspecified address `0.0.0.0`
/// - Private IP ranges (RFC 1918, link-local, unique local IPv6)
///
/// Unlike [`normalize_url`], the input must already carry a scheme.
///
/// # Examples
///
/// ```
/// use news_aggregator::util::validate_url;
///
/// let url = validate_url("https://example.com/feed.xml").unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_url("http://localhost/feed").is_err());
/// assert!(validate_url("http://192.168.1.1/feed").is_err());
/// assert!(validate_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;

    if host.eq_ignore_ascii_case("localhost") || host.ends_with(".localhost") {
        return Err(UrlValidationError::Localhost);
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
        if ip.is_loopback() {
            return Err(UrlValidationError::Localhost);
        }
        if is_private_ip(&ip) {
            return Err(UrlValidationError::PrivateIp(ip.to_string()));
        }
    }

    Ok(url)
}

/// Canonicalizes a user-supplied URL, or returns `None` if it is unusable.
///
/// A missing scheme defaults to `https://`. The result is the `url` crate's
/// serialization with any trailing slash removed, so `example.com` and
/// `https://example.com/` both become `https://example.com`.
///
/// Rejection is a normal outcome, not a fault: callers skip the unit of work
/// when this returns `None`.
///
/// ```
/// use news_aggregator::util::normalize_url;
///
/// assert_eq!(normalize_url("example.com/blog/").as_deref(), Some("https://example.com/blog"));
/// assert_eq!(normalize_url("http://10.0.0.8/feed"), None);
/// ```
pub fn normalize_url(raw: &str) -> Option<String> {
    match try_normalize(raw) {
        Ok(normalized) => Some(normalized),
        Err(e) => {
            tracing::debug!(url = %raw, error = %e, "URL rejected by normalizer");
            None
        }
    }
}

fn try_normalize(raw: &str) -> Result<String, UrlValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UrlValidationError::Empty);
    }

    let with_scheme = if has_scheme(trimmed) {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };

    let url = validate_url(&with_scheme)?;
    let serialized = url.to_string();
    Ok(serialized.trim_end_matches('/').to_owned())
}

/// True when the string starts with an RFC 3986 scheme followed by `:`.
///
/// `example.com:8080/path` is treated as scheme-less (a host with a port),
/// matching what users type into an "add source" box.
fn has_scheme(s: &str) -> bool {
    let Some(colon) = s.find(':') else {
        return false;
    };
    let scheme = &s[..colon];
    let rest = &s[colon + 1..];

    let valid_chars = !scheme.is_empty()
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));

    if !valid_chars {
        return false;
    }

    // host:port form
    if rest.chars().take_while(|c| *c != '/').all(|c| c.is_ascii_digit())
        && !rest.is_empty()
        && !rest.starts_with('/')
    {
        return false;
    }

    true
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            if let Some(mapped) = ipv6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(mapped));
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}
