use super::fetcher::{FetchedPage, Fetcher};
use super::protection::{detect_protection, is_challenge_page, Confidence, ProtectionReport};
use futures::stream::{self, StreamExt};
use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use std::sync::OnceLock;
use url::Url;

/// Paths probed when the homepage advertises no usable feed, in order.
const COMMON_FEED_PATHS: &[&str] = &[
    "/feed",
    "/rss",
    "/rss.xml",
    "/feed.xml",
    "/atom.xml",
    "/index.xml",
    "/news/rss.xml",
    "/blog/feed",
    "/blog/rss.xml",
    "/feeds/posts/default",
    "/?feed=rss2",
];

/// Concurrent verification requests per discovery run.
const VERIFY_CONCURRENCY: usize = 4;

/// A verified feed found for a site. Never persisted directly; the
/// add-source flow turns the chosen one into a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredFeed {
    /// Absolute feed URL
    pub url: String,
    /// Feed title, from the feed itself or the advertising `<link title>`
    pub title: Option<String>,
    /// "rss", "atom", "rdf" or "json"
    pub feed_type: Option<String>,
    pub cloudflare_protected: bool,
    pub protection_confidence: Confidence,
}

/// Result of [`FeedDiscoverer::discover_all_feeds`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub feeds: Vec<DiscoveredFeed>,
    pub cloudflare_protected: bool,
    pub confidence: Confidence,
    pub indicators: Vec<String>,
}

impl DiscoveryReport {
    fn with_protection(protection: &ProtectionReport) -> Self {
        Self {
            feeds: Vec::new(),
            cloudflare_protected: protection.is_protected,
            confidence: protection.confidence,
            indicators: protection.indicators.clone(),
        }
    }
}

/// Finds RSS/Atom feeds for arbitrary sites.
///
/// Discovery is best-effort: every failure degrades to fewer (or zero)
/// feeds, never to an error, so callers can fall back to synthesis.
#[derive(Clone)]
pub struct FeedDiscoverer {
    fetcher: Fetcher,
}

impl FeedDiscoverer {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }

    /// Discovers every verified feed for `site_url`.
    ///
    /// 1. If the URL itself serves a feed, it is the only result.
    /// 2. Otherwise the page is checked for bot protection and, unless it is
    ///    a challenge page, scanned for `<link rel="alternate|feed">` tags.
    /// 3. With no verified link candidates, conventional paths are probed.
    ///
    /// Results are deduplicated by resolved URL.
    pub async fn discover_all_feeds(&self, site_url: &str) -> DiscoveryReport {
        let page = match self.fetcher.get(site_url).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(url = %site_url, error = %e, "Discovery fetch failed");
                return DiscoveryReport::default();
            }
        };

        if let Some(feed) = feed_from_page(&page) {
            tracing::debug!(url = %feed.url, "Submitted URL is a feed");
            return DiscoveryReport {
                feeds: vec![feed],
                ..DiscoveryReport::default()
            };
        }

        let body = page.text();
        let protection = detect_protection(page.status, &page.headers, Some(&*body));
        let challenged = is_challenge_page(page.status, &page.headers, &body)
            || protection.challenge_type.is_some();
        let mut report = DiscoveryReport::with_protection(&protection);

        if protection.is_protected {
            tracing::info!(
                url = %site_url,
                confidence = %protection.confidence,
                indicators = protection.indicators.len(),
                "Bot protection detected"
            );
        }

        let mut found = Vec::new();
        if !challenged && page.is_success() {
            let candidates = find_feed_links(&body, &page.final_url);
            tracing::debug!(count = candidates.len(), "Feed link candidates");
            found = self.verify_all(candidates).await;
        }

        if found.is_empty() {
            let probes = COMMON_FEED_PATHS
                .iter()
                .filter_map(|path| page.final_url.join(path).ok())
                .map(|url| LinkCandidate {
                    url: url.to_string(),
                    title: None,
                })
                .collect();
            found = self.verify_all(probes).await;
        }

        for mut feed in found {
            if report.feeds.iter().any(|f| f.url == feed.url) {
                continue;
            }
            feed.cloudflare_protected = report.cloudflare_protected;
            feed.protection_confidence = report.confidence;
            report.feeds.push(feed);
        }

        tracing::info!(url = %site_url, feeds = report.feeds.len(), "Discovery complete");
        report
    }

    /// First discovered feed URL, if any.
    pub async fn discover_feed_url(&self, site_url: &str) -> Option<String> {
        self.discover_all_feeds(site_url)
            .await
            .feeds
            .into_iter()
            .next()
            .map(|feed| feed.url)
    }

    /// Verifies candidates concurrently, keeping their order.
    async fn verify_all(&self, candidates: Vec<LinkCandidate>) -> Vec<DiscoveredFeed> {
        stream::iter(candidates)
            .map(|candidate| self.verify(candidate))
            .buffered(VERIFY_CONCURRENCY)
            .filter_map(|feed| async move { feed })
            .collect::<Vec<_>>()
            .await
    }

    async fn verify(&self, candidate: LinkCandidate) -> Option<DiscoveredFeed> {
        match self.fetcher.get(&candidate.url).await {
            Ok(page) => feed_from_page(&page).map(|mut feed| {
                if feed.title.is_none() {
                    feed.title = candidate.title;
                }
                feed
            }),
            Err(e) => {
                tracing::debug!(url = %candidate.url, error = %e, "Feed candidate rejected");
                None
            }
        }
    }
}

/// A `<link>` (or probe path) that may point at a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LinkCandidate {
    url: String,
    title: Option<String>,
}

/// Accepts a fetched page as a feed when it looks like one and `feed-rs`
/// parses it as RSS, Atom, RDF or JSON Feed.
fn feed_from_page(page: &FetchedPage) -> Option<DiscoveredFeed> {
    if !page.is_success() {
        return None;
    }

    let content_type = page.content_type();
    let feed_type_header = content_type.contains("xml") || content_type.contains("feed+json");
    let feed_like_path = feed_path_re().is_match(page.final_url.path());
    let xml_prolog = page.text().trim_start().starts_with("<?xml");
    if !(feed_type_header || feed_like_path || xml_prolog) {
        return None;
    }

    // Markup that merely mentions <rss> or <feed...> is not enough
    let parsed = match feed_rs::parser::parse(page.body.as_slice()) {
        Ok(feed) => feed,
        Err(e) => {
            tracing::debug!(url = %page.final_url, error = %e, "Not a parseable feed");
            return None;
        }
    };
    let title = parsed
        .title
        .as_ref()
        .map(|t| t.content.trim().to_owned())
        .filter(|t| !t.is_empty());

    Some(DiscoveredFeed {
        url: page.final_url.to_string(),
        title,
        feed_type: Some(feed_type_name(&parsed.feed_type).to_owned()),
        cloudflare_protected: false,
        protection_confidence: Confidence::Low,
    })
}

fn feed_type_name(kind: &feed_rs::model::FeedType) -> &'static str {
    use feed_rs::model::FeedType;
    match kind {
        FeedType::Atom => "atom",
        FeedType::JSON => "json",
        FeedType::RSS1 => "rdf",
        FeedType::RSS0 | FeedType::RSS2 => "rss",
    }
}

/// Matched against the URL path only; hostnames like `rss.example.com` say
/// nothing about the document.
fn feed_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:feed|rss|atom|\.xml$|\.rss$)").expect("feed path pattern is valid")
    })
}

/// Scans `<link rel="alternate">` / `<link rel="feed">` tags.
///
/// A tag qualifies when its `type` mentions rss/atom/xml, or its `href`
/// mentions feed/rss/atom or ends in `.xml`/`.rss`. Hrefs are resolved
/// against `base`; non-http(s) results are dropped.
fn find_feed_links(html: &str, base: &Url) -> Vec<LinkCandidate> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("link[rel][href]") else {
        return Vec::new();
    };

    let mut candidates: Vec<LinkCandidate> = Vec::new();
    for link in document.select(&selector) {
        let el = link.value();
        let rel = el.attr("rel").unwrap_or("").to_lowercase();
        if !rel
            .split_whitespace()
            .any(|token| token == "alternate" || token == "feed")
        {
            continue;
        }

        let Some(href) = el.attr("href").map(str::trim).filter(|h| !h.is_empty()) else {
            continue;
        };
        let kind = el.attr("type").unwrap_or("").to_lowercase();
        let href_lower = href.to_lowercase();

        let typed = ["rss", "atom", "xml"].iter().any(|t| kind.contains(t));
        let named = ["feed", "rss", "atom"].iter().any(|t| href_lower.contains(t))
            || href_lower.ends_with(".xml")
            || href_lower.ends_with(".rss");
        if !(typed || named) {
            continue;
        }

        let Ok(resolved) = base.join(href) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }

        let url = resolved.to_string();
        if candidates.iter().any(|c| c.url == url) {
            continue;
        }
        candidates.push(LinkCandidate {
            url,
            title: el
                .attr("title")
                .map(|t| t.trim().to_owned())
                .filter(|t| !t.is_empty()),
        });
    }
    candidates
}
