//! Synthetic RSS for sites that publish no feed.
//!
//! A [`ScrapeConfig`] names the listing page and the selectors for each
//! article block. Scraped articles are written out with
//! [`generate_rss`](super::generator::generate_rss) so that refresh can
//! parse synthetic and native feeds through the same code path.

use super::dates::extract_date_from_element;
use super::fetcher::{FetchError, Fetcher};
use super::generator::{generate_rss, RssChannel, RssItem};
use super::structure::{ArticleStructure, StructureDetector};
use crate::util::{collapse_whitespace, truncate_chars, MAX_SNIPPET_CHARS};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Listing paths tried by [`Synthesizer::auto_build_rss`] when the site
/// root has no recognisable article structure.
const LIST_PATHS: &[&str] = &["/blog", "/news", "/articles", "/posts"];

fn default_max_items() -> usize {
    20
}

/// Errors that can occur while synthesizing a feed.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    /// A configured selector is not valid CSS
    #[error("Invalid selector for {field}: {selector:?}")]
    InvalidSelector {
        field: &'static str,
        selector: String,
    },
    /// Selectors matched nothing usable; usually means the site changed
    #[error("No articles found at {0}")]
    NoArticles(String),
    #[error("Could not detect an article structure for {0}")]
    NoStructure(String),
    #[error("Failed to generate RSS: {0}")]
    Generate(#[from] anyhow::Error),
}

/// Selectors applied inside a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleSelectors {
    /// Repeating article block
    pub article: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl From<&ArticleStructure> for ArticleSelectors {
    fn from(structure: &ArticleStructure) -> Self {
        Self {
            article: structure.article_selector.clone(),
            title: structure.title_selector.clone(),
            link: Some(structure.link_selector.clone()),
            date: structure.date_selector.clone(),
            content: structure.content_selector.clone(),
            author: structure.author_selector.clone(),
        }
    }
}

/// Scrape configuration, persisted as a custom source's JSON config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeConfig {
    pub site_url: String,
    /// Listing page, when it differs from the site root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_list_url: Option<String>,
    pub selectors: ArticleSelectors,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

impl ScrapeConfig {
    /// Builds a config from detected selectors.
    pub fn from_structure(
        site_url: &str,
        article_list_url: Option<String>,
        structure: &ArticleStructure,
    ) -> Self {
        Self {
            site_url: site_url.to_owned(),
            article_list_url,
            selectors: ArticleSelectors::from(structure),
            title: None,
            description: None,
            max_items: default_max_items(),
        }
    }

    /// The page the selectors apply to.
    pub fn list_url(&self) -> &str {
        self.article_list_url.as_deref().unwrap_or(&self.site_url)
    }
}

/// Builds synthetic RSS by scraping listing pages.
#[derive(Clone)]
pub struct Synthesizer {
    fetcher: Fetcher,
    detector: StructureDetector,
}

impl Synthesizer {
    pub fn new(fetcher: Fetcher) -> Self {
        let detector = StructureDetector::new(fetcher.clone());
        Self { fetcher, detector }
    }

    /// Scrapes the configured listing page and returns RSS 2.0 XML.
    ///
    /// # Errors
    ///
    /// - [`SynthesisError::Fetch`] - page unreachable or non-2xx
    /// - [`SynthesisError::InvalidSelector`] - a selector is not valid CSS
    /// - [`SynthesisError::NoArticles`] - nothing with a title and link matched
    pub async fn scrape_and_build_rss(&self, config: &ScrapeConfig) -> Result<String, SynthesisError> {
        let list_url = config.list_url();
        let timeout = self.fetcher.config().synthesis_timeout;

        let page = self
            .fetcher
            .get_with_timeout(list_url, timeout)
            .await
            .and_then(|page| page.error_for_status())
            .map_err(|source| SynthesisError::Fetch {
                url: list_url.to_owned(),
                source,
            })?;

        let channel = build_channel(config, &page.text(), &page.final_url)?;
        tracing::info!(
            url = %list_url,
            items = channel.items.len(),
            "Synthesized feed"
        );
        Ok(generate_rss(&channel)?)
    }

    /// Detects a structure for `site_url` and returns the config that
    /// scrapes it, trying conventional listing paths after the root.
    ///
    /// # Errors
    ///
    /// [`SynthesisError::InvalidUrl`] or [`SynthesisError::NoStructure`].
    pub async fn detect_config(&self, site_url: &str) -> Result<ScrapeConfig, SynthesisError> {
        let base = Url::parse(site_url).map_err(|e| SynthesisError::InvalidUrl(e.to_string()))?;

        if let Some(structure) = self.detector.detect_article_structure(site_url).await {
            return Ok(ScrapeConfig::from_structure(site_url, None, &structure));
        }

        for path in LIST_PATHS {
            let Ok(list_url) = base.join(path) else {
                continue;
            };
            if let Some(structure) = self.detector.detect_article_structure(list_url.as_str()).await
            {
                tracing::debug!(url = %list_url, "Article structure found on listing path");
                return Ok(ScrapeConfig::from_structure(
                    site_url,
                    Some(list_url.to_string()),
                    &structure,
                ));
            }
        }

        Err(SynthesisError::NoStructure(site_url.to_owned()))
    }

    /// Structure detection followed by [`Self::scrape_and_build_rss`].
    pub async fn auto_build_rss(&self, site_url: &str) -> Result<String, SynthesisError> {
        let config = self.detect_config(site_url).await?;
        self.scrape_and_build_rss(&config).await
    }
}

/// Compiled [`ArticleSelectors`].
struct CompiledSelectors {
    article: Selector,
    title: Selector,
    link: Option<Selector>,
    date: Option<String>,
    content: Option<Selector>,
    author: Option<Selector>,
    paragraph: Selector,
    anchor: Selector,
}

impl CompiledSelectors {
    fn compile(selectors: &ArticleSelectors) -> Result<Self, SynthesisError> {
        let date = match &selectors.date {
            Some(date) => {
                compile("date", date)?;
                Some(date.clone())
            }
            None => None,
        };
        Ok(Self {
            article: compile("article", &selectors.article)?,
            title: compile("title", &selectors.title)?,
            link: selectors.link.as_deref().map(|s| compile("link", s)).transpose()?,
            date,
            content: selectors
                .content
                .as_deref()
                .map(|s| compile("content", s))
                .transpose()?,
            author: selectors
                .author
                .as_deref()
                .map(|s| compile("author", s))
                .transpose()?,
            paragraph: compile("content", "p")?,
            anchor: compile("link", "a[href]")?,
        })
    }
}

fn compile(field: &'static str, selector: &str) -> Result<Selector, SynthesisError> {
    Selector::parse(selector).map_err(|_| SynthesisError::InvalidSelector {
        field,
        selector: selector.to_owned(),
    })
}

/// Applies the selectors to a fetched listing page.
///
/// Articles without a title or a resolvable http(s) link are skipped; the
/// first `max_items` survivors become the channel's items.
fn build_channel(config: &ScrapeConfig, html: &str, page_url: &Url) -> Result<RssChannel, SynthesisError> {
    let selectors = CompiledSelectors::compile(&config.selectors)?;
    let document = Html::parse_document(html);

    let mut items: Vec<RssItem> = Vec::new();
    for article in document.select(&selectors.article) {
        if items.len() >= config.max_items {
            break;
        }
        let Some(item) = scrape_article(article, &selectors, page_url) else {
            continue;
        };
        if items.iter().any(|existing| existing.link == item.link) {
            continue;
        }
        items.push(item);
    }

    if items.is_empty() {
        return Err(SynthesisError::NoArticles(config.list_url().to_owned()));
    }

    let page_title = Selector::parse("title")
        .ok()
        .and_then(|sel| document.select(&sel).next().map(|el| text_of(&el)))
        .filter(|t| !t.is_empty());
    let title = config
        .title
        .clone()
        .or(page_title)
        .unwrap_or_else(|| config.site_url.clone());
    let description = config
        .description
        .clone()
        .unwrap_or_else(|| format!("Articles scraped from {}", config.site_url));
    let last_build_date = items.iter().filter_map(|item| item.pub_date).max();

    Ok(RssChannel {
        title,
        link: config.site_url.clone(),
        description,
        language: None,
        last_build_date,
        items,
    })
}

fn scrape_article(
    article: ElementRef<'_>,
    selectors: &CompiledSelectors,
    page_url: &Url,
) -> Option<RssItem> {
    let title_el = article.select(&selectors.title).next()?;
    let title = text_of(&title_el);
    if title.is_empty() {
        return None;
    }

    let href = selectors
        .link
        .as_ref()
        .and_then(|sel| article.select(sel).next())
        .and_then(|el| href_of(el, &selectors.anchor))
        .or_else(|| enclosing_anchor(title_el).and_then(|a| a.value().attr("href")))
        .or_else(|| href_of(title_el, &selectors.anchor))?;
    let link = page_url.join(href.trim()).ok()?;
    if !matches!(link.scheme(), "http" | "https") {
        return None;
    }

    let pub_date = extract_date_from_element(article, selectors.date.as_deref());

    let content_el = selectors
        .content
        .as_ref()
        .and_then(|sel| article.select(sel).next())
        .or_else(|| article.select(&selectors.paragraph).next());
    let description = content_el
        .map(|el| truncate_chars(&text_of(&el), MAX_SNIPPET_CHARS).into_owned())
        .filter(|d| !d.is_empty());
    let content = content_el
        .map(|el| el.inner_html().trim().to_owned())
        .filter(|c| !c.is_empty());

    let author = selectors
        .author
        .as_ref()
        .and_then(|sel| article.select(sel).next())
        .map(|el| text_of(&el))
        .filter(|a| !a.is_empty());

    Some(RssItem {
        title,
        link: link.to_string(),
        description,
        content,
        author,
        pub_date,
        guid: None,
    })
}

/// `href` of the element itself, else of its first descendant anchor.
fn href_of<'a>(el: ElementRef<'a>, anchor: &Selector) -> Option<&'a str> {
    el.value()
        .attr("href")
        .or_else(|| el.select(anchor).next().and_then(|a| a.value().attr("href")))
        .filter(|href| !href.trim().is_empty())
}

/// Nearest `<a href>` ancestor (card layouts wrap the whole block in a link).
fn enclosing_anchor(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| a.value().name() == "a" && a.value().attr("href").is_some())
}

fn text_of(el: &ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" ")).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{parse_feed, FetchConfig};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LISTING: &str = r#"<html><head><title>Example News</title></head><body>
        <article>
            <h2><a href="/posts/one">The first headline today</a></h2>
            <time datetime="2025-11-24T09:00:00Z">Nov 24</time>
            <p>First summary &amp; more</p>
            <span class="author">Jane Doe</span>
        </article>
        <article>
            <h2><a href="https://example.com/posts/two">A second long headline</a></h2>
            <span class="date">November 20, 2025</span>
            <p>Second summary</p>
            <span class="author">John Roe</span>
        </article>
        <article>
            <h2>No link anywhere in this one</h2>
        </article>
        <article>
            <h2><a href="/posts/three">Third headline without date</a></h2>
            <p>Third summary</p>
        </article>
        <article><h2><a href="/posts/empty">   </a></h2></article>
    </body></html>"#;

    fn config(site_url: &str) -> ScrapeConfig {
        ScrapeConfig {
            site_url: site_url.to_owned(),
            article_list_url: None,
            selectors: ArticleSelectors {
                article: "article".to_owned(),
                title: "h2".to_owned(),
                link: Some("h2 a".to_owned()),
                date: None,
                content: None,
                author: Some(".author".to_owned()),
            },
            title: None,
            description: None,
            max_items: 20,
        }
    }

    fn page_url() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    #[test]
    fn test_build_channel_extracts_articles() {
        let channel =
            build_channel(&config("https://example.com"), LISTING, &page_url()).unwrap();

        assert_eq!(channel.title, "Example News");
        let links: Vec<&str> = channel.items.iter().map(|i| i.link.as_str()).collect();
        assert_eq!(
            links,
            vec![
                "https://example.com/posts/one",
                "https://example.com/posts/two",
                "https://example.com/posts/three",
            ]
        );

        let first = &channel.items[0];
        assert_eq!(first.title, "The first headline today");
        assert_eq!(
            first.pub_date,
            Some(Utc.with_ymd_and_hms(2025, 11, 24, 9, 0, 0).unwrap())
        );
        assert_eq!(first.description.as_deref(), Some("First summary & more"));
        assert_eq!(first.author.as_deref(), Some("Jane Doe"));

        assert_eq!(
            channel.items[1].pub_date,
            Some(Utc.with_ymd_and_hms(2025, 11, 20, 0, 0, 0).unwrap())
        );
        assert_eq!(channel.items[2].pub_date, None);
        assert_eq!(channel.last_build_date, first.pub_date);
    }

    #[test]
    fn test_max_items_cap() {
        let mut cfg = config("https://example.com");
        cfg.max_items = 2;
        let channel = build_channel(&cfg, LISTING, &page_url()).unwrap();
        assert_eq!(channel.items.len(), 2);
    }

    #[test]
    fn test_link_from_enclosing_anchor() {
        let html = r#"<div class="card"><a href="/c/1"><h3>Card headline one</h3></a></div>"#;
        let cfg = ScrapeConfig {
            selectors: ArticleSelectors {
                article: ".card".to_owned(),
                title: "h3".to_owned(),
                link: None,
                date: None,
                content: None,
                author: None,
            },
            ..config("https://example.com")
        };
        let channel = build_channel(&cfg, html, &page_url()).unwrap();
        assert_eq!(channel.items[0].link, "https://example.com/c/1");
    }

    #[test]
    fn test_zero_articles_is_hard_error() {
        let err = build_channel(
            &config("https://example.com"),
            "<html><body><p>Redesigned site</p></body></html>",
            &page_url(),
        )
        .unwrap_err();
        assert!(matches!(err, SynthesisError::NoArticles(_)));
    }

    #[test]
    fn test_invalid_selector() {
        let mut cfg = config("https://example.com");
        cfg.selectors.article = "div[".to_owned();
        let err = build_channel(&cfg, LISTING, &page_url()).unwrap_err();
        assert!(matches!(
            err,
            SynthesisError::InvalidSelector { field: "article", .. }
        ));
    }

    #[test]
    fn test_config_json_shape() {
        let json = r#"{
            "siteUrl": "https://example.com",
            "articleListUrl": "https://example.com/blog",
            "selectors": {"article": "article", "title": "h2 a", "date": "time"}
        }"#;
        let cfg: ScrapeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.max_items, 20);
        assert_eq!(cfg.list_url(), "https://example.com/blog");
        assert_eq!(cfg.selectors.date.as_deref(), Some("time"));

        let back = serde_json::to_value(&cfg).unwrap();
        assert_eq!(back["maxItems"], 20);
        assert_eq!(back["selectors"]["title"], "h2 a");
    }

    #[tokio::test]
    async fn test_synthesis_round_trips_through_parser() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .mount(&server)
            .await;

        let synthesizer = Synthesizer::new(Fetcher::new(FetchConfig::permissive()).unwrap());
        let xml = synthesizer
            .scrape_and_build_rss(&config(&server.uri()))
            .await
            .unwrap();
        let parsed = parse_feed(xml.as_bytes()).unwrap();

        let scraped = build_channel(
            &config(&server.uri()),
            LISTING,
            &Url::parse(&server.uri()).unwrap(),
        )
        .unwrap();
        assert_eq!(parsed.items.len(), scraped.items.len());
        for (item, expected) in parsed.items.iter().zip(&scraped.items) {
            assert_eq!(item.title.as_deref(), Some(expected.title.as_str()));
            assert_eq!(item.link.as_deref(), Some(expected.link.as_str()));
            assert_eq!(item.published, expected.pub_date);
            assert_eq!(item.authors.first(), expected.author.as_ref());
        }
    }

    #[tokio::test]
    async fn test_auto_build_uses_listing_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>Home</body></html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/news"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .mount(&server)
            .await;

        let synthesizer = Synthesizer::new(Fetcher::new(FetchConfig::permissive()).unwrap());
        let config = synthesizer.detect_config(&server.uri()).await.unwrap();
        assert_eq!(
            config.article_list_url,
            Some(format!("{}/news", server.uri()))
        );
        assert_eq!(config.selectors.article, "article");

        let xml = synthesizer.auto_build_rss(&server.uri()).await.unwrap();
        assert!(xml.contains("The first headline today"));
    }

    #[tokio::test]
    async fn test_auto_build_without_structure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>Nothing</body></html>"))
            .mount(&server)
            .await;

        let synthesizer = Synthesizer::new(Fetcher::new(FetchConfig::permissive()).unwrap());
        let err = synthesizer.auto_build_rss(&server.uri()).await.unwrap_err();
        assert!(matches!(err, SynthesisError::NoStructure(_)));
    }
}
