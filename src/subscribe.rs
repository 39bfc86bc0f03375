//! Add-source flow: turn a user-supplied site URL into a stored source.
//!
//! The URL is normalized, then feed discovery runs. A discovered feed makes a
//! `NATIVE` source. Otherwise article structure detection runs and, if it
//! finds a repeating article pattern, the detected selectors are stored as a
//! `CUSTOM` source's scrape configuration.

use anyhow::Result;
use thiserror::Error;
use url::Url;

use crate::feed::{FeedDiscoverer, Fetcher, SynthesisError, Synthesizer};
use crate::storage::{Database, FeedType, NewSource, Source};
use crate::util::normalize_url;

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("Invalid or disallowed URL: {0}")]
    InvalidUrl(String),

    #[error("Project {0} not found")]
    ProjectNotFound(i64),

    #[error("No feed found and no articles detected for {url}: {source}")]
    Unsupported {
        url: String,
        #[source]
        source: SynthesisError,
    },

    #[error("Store error while adding source: {0}")]
    Database(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct Subscriber {
    db: Database,
    discoverer: FeedDiscoverer,
    synthesizer: Synthesizer,
    allow_private_hosts: bool,
    max_items: usize,
}

impl Subscriber {
    /// # Arguments
    ///
    /// * `max_items` - article cap written into detected scrape configs
    pub fn new(db: Database, fetcher: Fetcher, max_items: usize) -> Self {
        Self {
            allow_private_hosts: fetcher.config().allow_private_hosts,
            discoverer: FeedDiscoverer::new(fetcher.clone()),
            synthesizer: Synthesizer::new(fetcher),
            db,
            max_items,
        }
    }

    /// Adds a source for `raw_url` to a project.
    ///
    /// `title` overrides any title found in the feed or page.
    ///
    /// # Errors
    ///
    /// - [`SubscribeError::InvalidUrl`] - the URL normalizer rejected the input
    /// - [`SubscribeError::ProjectNotFound`] - unknown project
    /// - [`SubscribeError::Unsupported`] - no feed and no article structure
    /// - [`SubscribeError::Database`] - store failure
    pub async fn add_source(
        &self,
        project_id: i64,
        raw_url: &str,
        title: Option<&str>,
    ) -> Result<Source, SubscribeError> {
        let site_url = self
            .normalize_site_url(raw_url)
            .ok_or_else(|| SubscribeError::InvalidUrl(raw_url.trim().to_owned()))?;
        if self.db.find_project(project_id).await?.is_none() {
            return Err(SubscribeError::ProjectNotFound(project_id));
        }

        let report = self.discoverer.discover_all_feeds(&site_url).await;
        let protection_confidence = (report.cloudflare_protected).then_some(report.confidence);

        let new_source = match report.feeds.first() {
            Some(feed) => {
                tracing::info!(project_id, site_url = %site_url, feed_url = %feed.url, "Adding native source");
                NewSource {
                    project_id,
                    site_url: site_url.clone(),
                    feed_url: Some(feed.url.clone()),
                    feed_type: FeedType::Native,
                    title: title.map(str::to_owned).or_else(|| feed.title.clone()),
                    description: None,
                    custom_config: None,
                    cloudflare_protected: report.cloudflare_protected || feed.cloudflare_protected,
                    protection_confidence: protection_confidence
                        .or((feed.cloudflare_protected).then_some(feed.protection_confidence)),
                    protection_indicators: report.indicators.clone(),
                }
            }
            None => {
                let mut config = self
                    .synthesizer
                    .detect_config(&site_url)
                    .await
                    .map_err(|source| SubscribeError::Unsupported {
                        url: site_url.clone(),
                        source,
                    })?;
                config.max_items = self.max_items;
                if let Some(title) = title {
                    config.title = Some(title.to_owned());
                }
                tracing::info!(
                    project_id,
                    site_url = %site_url,
                    list_url = %config.list_url(),
                    article_selector = %config.selectors.article,
                    "Adding custom source"
                );

                NewSource {
                    project_id,
                    site_url: site_url.clone(),
                    feed_url: None,
                    feed_type: FeedType::Custom,
                    title: config.title.clone(),
                    description: config.description.clone(),
                    custom_config: Some(config),
                    cloudflare_protected: report.cloudflare_protected,
                    protection_confidence,
                    protection_indicators: report.indicators.clone(),
                }
            }
        };

        let source_id = self.db.create_source(&new_source).await?;
        let source = self
            .db
            .find_source(source_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Source {source_id} vanished after insert"))?;
        Ok(source)
    }

    /// The normalizer refuses private hosts; trusted deployments that allow
    /// them only get scheme defaulting and trailing-slash trimming.
    fn normalize_site_url(&self, raw: &str) -> Option<String> {
        if !self.allow_private_hosts {
            return normalize_url(raw);
        }
        let trimmed = raw.trim();
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_owned()
        } else {
            format!("https://{trimmed}")
        };
        let url = Url::parse(&with_scheme).ok()?;
        matches!(url.scheme(), "http" | "https")
            .then(|| url.to_string().trim_end_matches('/').to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FetchConfig;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Mock Feed</title><link>https://example.com</link>
<description>d</description></channel></rss>"#;

    async fn subscriber() -> (Subscriber, Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let project = db.create_project("P", "p").await.unwrap();
        let fetcher = Fetcher::new(FetchConfig::permissive()).unwrap();
        (Subscriber::new(db.clone(), fetcher, 15), db, project.id)
    }

    fn html(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/html")
            .set_body_string(body.to_owned())
    }

    #[tokio::test]
    async fn test_adds_native_source_from_discovered_feed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html(
                r#"<html><head><link rel="alternate" type="application/rss+xml" href="/feed"></head></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/rss+xml")
                    .set_body_string(FEED),
            )
            .mount(&server)
            .await;

        let (subscriber, _db, project_id) = subscriber().await;
        let source = subscriber
            .add_source(project_id, &server.uri(), None)
            .await
            .unwrap();

        assert_eq!(source.feed_type, FeedType::Native);
        assert_eq!(source.feed_url, Some(format!("{}/feed", server.uri())));
        assert_eq!(source.title.as_deref(), Some("Mock Feed"));
        assert!(source.custom_config.is_none());
    }

    #[tokio::test]
    async fn test_adds_custom_source_when_no_feed() {
        let server = MockServer::start().await;
        let articles: String = (1..=4)
            .map(|i| {
                format!(
                    r#"<article class="post"><h2><a href="/post/{i}">Post number {i}</a></h2>
                    <time datetime="2025-11-2{i}">Nov 2{i}</time><p>Summary {i}</p></article>"#
                )
            })
            .collect();
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html(&format!("<html><body><main>{articles}</main></body></html>")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (subscriber, _db, project_id) = subscriber().await;
        let source = subscriber
            .add_source(project_id, &server.uri(), Some("Custom Blog"))
            .await
            .unwrap();

        assert_eq!(source.feed_type, FeedType::Custom);
        assert_eq!(source.feed_url, None);
        assert_eq!(source.title.as_deref(), Some("Custom Blog"));
        let config = source.custom_config.unwrap();
        assert_eq!(config.max_items, 15);
        assert_eq!(config.title.as_deref(), Some("Custom Blog"));
    }

    #[tokio::test]
    async fn test_unsupported_site() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html("<html><body><p>Nothing here</p></body></html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (subscriber, db, project_id) = subscriber().await;
        let err = subscriber
            .add_source(project_id, &server.uri(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SubscribeError::Unsupported { .. }));
        assert!(db.list_sources(project_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_url_and_unknown_project() {
        let db = Database::open(":memory:").await.unwrap();
        let fetcher = Fetcher::new(FetchConfig::default()).unwrap();
        let subscriber = Subscriber::new(db, fetcher, 20);

        let err = subscriber
            .add_source(1, "http://192.168.0.10", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SubscribeError::InvalidUrl(_)));

        let err = subscriber
            .add_source(42, "https://example.com", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SubscribeError::ProjectNotFound(42)));
    }
}
