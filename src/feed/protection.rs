//! Bot-protection (Cloudflare-style) detection.
//!
//! A heuristic scorer over response headers and body text. Results only
//! annotate discovery output and source metadata; nothing here blocks or
//! retries a request.

use reqwest::header::{HeaderMap, SERVER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// How strongly the signals point at a bot-protection layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of interstitial a protected origin answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    /// 403 behind a Cloudflare edge
    RateLimit,
    /// 503 "checking your browser" page
    BrowserVerification,
}

/// Outcome of [`detect_protection`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionReport {
    pub is_protected: bool,
    pub confidence: Confidence,
    /// Human-readable signals, in detection order
    pub indicators: Vec<String>,
    pub challenge_type: Option<ChallengeType>,
}

/// Body phrases (lowercase) seen on challenge and block pages.
const HTML_SIGNALS: &[(&str, &str)] = &[
    ("just a moment", "challenge page: \"just a moment\""),
    ("checking your browser", "challenge page: \"checking your browser\""),
    ("cf-chl-bypass", "challenge bypass token"),
    ("cf-browser-verification", "browser verification form"),
    ("challenge-platform", "challenge platform script"),
    ("ray id", "Cloudflare Ray ID in body"),
    ("attention required", "block page: \"attention required\""),
    ("rate limited", "rate-limit message"),
    ("too many requests", "rate-limit message"),
];

/// Phrases that mark the body itself as an interstitial rather than content.
const CHALLENGE_MARKERS: &[&str] = &[
    "just a moment",
    "checking your browser",
    "cf-browser-verification",
    "cf-chl-bypass",
    "challenge-platform",
];

/// Indicator count that lifts confidence to at least medium / to high.
const MEDIUM_INDICATORS: usize = 2;
const HIGH_INDICATORS: usize = 3;

/// Scores a response for bot-protection signatures.
///
/// # Arguments
///
/// * `status` - HTTP status of the response
/// * `headers` - Response headers
/// * `html` - Response body, when it was read
///
/// # Returns
///
/// A [`ProtectionReport`]; `is_protected` is true whenever confidence is
/// above [`Confidence::Low`].
pub fn detect_protection(
    status: StatusCode,
    headers: &HeaderMap,
    html: Option<&str>,
) -> ProtectionReport {
    let mut confidence = Confidence::Low;
    let mut indicators = Vec::new();
    let mut cloudflare_header = false;

    // Strong header signals
    if headers.contains_key("cf-ray") {
        indicators.push("cf-ray header".to_owned());
        confidence = Confidence::High;
        cloudflare_header = true;
    }
    let server = headers
        .get(SERVER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();
    if server.contains("cloudflare") {
        indicators.push("server: cloudflare".to_owned());
        confidence = Confidence::High;
        cloudflare_header = true;
    }

    // Weaker header signals
    if headers.contains_key("cf-cache-status") {
        indicators.push("cf-cache-status header".to_owned());
        confidence = confidence.max(Confidence::Medium);
        cloudflare_header = true;
    }
    let other_cf = headers
        .keys()
        .map(|name| name.as_str())
        .filter(|name| name.starts_with("cf-") && *name != "cf-ray" && *name != "cf-cache-status")
        .count();
    if other_cf > 0 {
        indicators.push(format!("{other_cf} other cf-* header(s)"));
        confidence = confidence.max(Confidence::Medium);
        cloudflare_header = true;
    }

    if let Some(body) = html {
        let lower = body.to_lowercase();
        let mut seen = Vec::new();
        for (needle, label) in HTML_SIGNALS {
            if lower.contains(needle) && !seen.contains(label) {
                seen.push(*label);
                indicators.push((*label).to_owned());
            }
        }
    }

    let challenge_type = if cloudflare_header {
        match status {
            StatusCode::FORBIDDEN => Some(ChallengeType::RateLimit),
            StatusCode::SERVICE_UNAVAILABLE => Some(ChallengeType::BrowserVerification),
            _ => None,
        }
    } else {
        None
    };
    if let Some(kind) = challenge_type {
        indicators.push(format!("HTTP {} with Cloudflare headers", status.as_u16()));
        tracing::debug!(status = status.as_u16(), ?kind, "Challenge response");
    }

    if indicators.len() >= HIGH_INDICATORS {
        confidence = Confidence::High;
    } else if indicators.len() >= MEDIUM_INDICATORS {
        confidence = confidence.max(Confidence::Medium);
    }

    ProtectionReport {
        is_protected: confidence != Confidence::Low,
        confidence,
        indicators,
        challenge_type,
    }
}

/// True when the response is a bot-challenge interstitial rather than the page.
///
/// A challenge marker in the body only counts when the response also carries
/// Cloudflare headers or a non-2xx status; ordinary pages may quote the same
/// phrases.
pub fn is_challenge_page(status: StatusCode, headers: &HeaderMap, html: &str) -> bool {
    if status.is_success() && !has_cloudflare_headers(headers) {
        return false;
    }
    let lower = html.to_lowercase();
    CHALLENGE_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn has_cloudflare_headers(headers: &HeaderMap) -> bool {
    let cf_server = headers
        .get(SERVER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|server| server.to_lowercase().contains("cloudflare"));
    cf_server || headers.keys().any(|name| name.as_str().starts_with("cf-"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_plain_response_not_protected() {
        let report = detect_protection(
            StatusCode::OK,
            &headers(&[("server", "nginx")]),
            Some("<html><body>Hello</body></html>"),
        );
        assert!(!report.is_protected);
        assert_eq!(report.confidence, Confidence::Low);
        assert!(report.indicators.is_empty());
        assert_eq!(report.challenge_type, None);
    }

    #[test]
    fn test_cf_ray_is_high() {
        let report = detect_protection(StatusCode::OK, &headers(&[("cf-ray", "8abc-LHR")]), None);
        assert!(report.is_protected);
        assert_eq!(report.confidence, Confidence::High);
    }

    #[test]
    fn test_server_cloudflare_is_high() {
        let report =
            detect_protection(StatusCode::OK, &headers(&[("server", "Cloudflare")]), None);
        assert_eq!(report.confidence, Confidence::High);
    }

    #[test]
    fn test_cache_status_alone_is_medium() {
        let report =
            detect_protection(StatusCode::OK, &headers(&[("cf-cache-status", "HIT")]), None);
        assert!(report.is_protected);
        assert_eq!(report.confidence, Confidence::Medium);
        assert_eq!(report.indicators.len(), 1);
    }

    #[test]
    fn test_single_html_signal_stays_low() {
        let report = detect_protection(
            StatusCode::OK,
            &HeaderMap::new(),
            Some("<p>Too many requests, slow down</p>"),
        );
        assert_eq!(report.indicators.len(), 1);
        assert_eq!(report.confidence, Confidence::Low);
        assert!(!report.is_protected);
    }

    #[test]
    fn test_two_html_signals_medium() {
        let report = detect_protection(
            StatusCode::OK,
            &HeaderMap::new(),
            Some("<title>Just a moment...</title><p>Checking your browser</p>"),
        );
        assert_eq!(report.indicators.len(), 2);
        assert_eq!(report.confidence, Confidence::Medium);
    }

    #[test]
    fn test_three_html_signals_high() {
        let report = detect_protection(
            StatusCode::OK,
            &HeaderMap::new(),
            Some("Just a moment. Checking your browser. Ray ID: 8abc"),
        );
        assert_eq!(report.confidence, Confidence::High);
    }

    #[test]
    fn test_challenge_type_from_status() {
        let cf = headers(&[("cf-ray", "1")]);
        let forbidden = detect_protection(StatusCode::FORBIDDEN, &cf, None);
        assert_eq!(forbidden.challenge_type, Some(ChallengeType::RateLimit));

        let unavailable = detect_protection(StatusCode::SERVICE_UNAVAILABLE, &cf, None);
        assert_eq!(
            unavailable.challenge_type,
            Some(ChallengeType::BrowserVerification)
        );

        // 503 without a Cloudflare header is just an outage
        let outage = detect_protection(StatusCode::SERVICE_UNAVAILABLE, &HeaderMap::new(), None);
        assert_eq!(outage.challenge_type, None);
    }

    #[test]
    fn test_rate_limit_phrases_share_one_indicator() {
        let report = detect_protection(
            StatusCode::OK,
            &HeaderMap::new(),
            Some("rate limited: too many requests"),
        );
        assert_eq!(report.indicators.len(), 1);
    }

    #[test]
    fn test_is_challenge_page() {
        let cf = headers(&[("cf-ray", "8a1b2c3d")]);
        assert!(is_challenge_page(
            StatusCode::OK,
            &cf,
            "<html><title>Just a moment...</title></html>"
        ));
        assert!(is_challenge_page(
            StatusCode::SERVICE_UNAVAILABLE,
            &HeaderMap::new(),
            "<form id=\"cf-browser-verification\">"
        ));
        assert!(!is_challenge_page(
            StatusCode::FORBIDDEN,
            &cf,
            "<html><body>Ray ID in footer</body></html>"
        ));
    }

    #[test]
    fn test_challenge_phrase_on_normal_page_is_content() {
        let html = "<html><body><h1>Just a moment with our editor</h1></body></html>";
        assert!(!is_challenge_page(StatusCode::OK, &HeaderMap::new(), html));
        assert!(!is_challenge_page(
            StatusCode::OK,
            &headers(&[("server", "nginx")]),
            html
        ));
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = detect_protection(StatusCode::OK, &headers(&[("cf-ray", "1")]), None);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["isProtected"], true);
        assert_eq!(json["confidence"], "high");
    }
}
