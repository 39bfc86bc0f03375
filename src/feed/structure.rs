//! Article structure inference for sites without a feed.
//!
//! Given a listing page, guess the CSS selectors of its repeating article
//! blocks and the title/link/date/content/author inside each. The rules are
//! ordered tables: earlier entries win, and each table can be tuned or tested
//! on its own.

use super::dates::parse_date;
use super::fetcher::Fetcher;
use super::protection::Confidence;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

// ============================================================================
// Rule tables
// ============================================================================

/// Repeating-block selectors, most specific first.
pub const CONTAINER_SELECTORS: &[&str] = &[
    "article",
    "[role=\"article\"]",
    ".post",
    ".entry",
    ".article",
    ".blog-post",
    ".news-item",
    ".story",
    ".card",
    "main li",
];

/// Title candidates inside a container. Anchor entries double as the link.
pub const TITLE_SELECTORS: &[&str] = &[
    "h1 a",
    "h2 a",
    "h3 a",
    "h4 a",
    ".title a",
    ".entry-title a",
    ".post-title a",
    "h1",
    "h2",
    "h3",
    "h4",
    ".title",
    ".entry-title",
    ".post-title",
    "a",
];

pub const DATE_SELECTORS: &[&str] = &[
    "time[datetime]",
    "time",
    "[itemprop=\"datePublished\"]",
    ".date",
    ".published",
    ".post-date",
    ".entry-date",
];

/// Class-name substrings that mark a date element.
pub const DATE_CLASS_KEYWORDS: &[&str] = &["date", "published", "posted", "time"];

pub const CONTENT_SELECTORS: &[&str] = &[".content", ".excerpt", ".summary", "p"];

pub const AUTHOR_SELECTORS: &[&str] = &[
    "[rel=\"author\"]",
    "[itemprop=\"author\"]",
    ".author",
    ".byline",
    ".post-author",
];

/// Minimum container matches for a selector to qualify.
pub const MIN_MATCHES: usize = 3;
/// Container matches at which confidence becomes high.
pub const HIGH_CONFIDENCE_MATCHES: usize = 5;

/// Anchor text must be longer than this to count as a headline.
const MIN_HEADLINE_CHARS: usize = 10;
/// Containers inspected when choosing inner selectors.
const SAMPLE_SIZE: usize = 5;

/// Selectors inferred for one listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleStructure {
    pub article_selector: String,
    pub title_selector: String,
    pub link_selector: String,
    pub date_selector: Option<String>,
    pub content_selector: Option<String>,
    pub author_selector: Option<String>,
    pub confidence: Confidence,
    /// Number of containers the article selector matched
    pub match_count: usize,
}

/// Fetches pages and runs [`detect_structure`] on them.
#[derive(Clone)]
pub struct StructureDetector {
    fetcher: Fetcher,
}

impl StructureDetector {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }

    /// Fetches `url` and infers its article structure.
    ///
    /// Fetch failures and non-2xx pages yield `None`, like a page with no
    /// repeating structure.
    pub async fn detect_article_structure(&self, url: &str) -> Option<ArticleStructure> {
        let timeout = self.fetcher.config().synthesis_timeout;
        let page = match self.fetcher.get_with_timeout(url, timeout).await {
            Ok(page) if page.is_success() => page,
            Ok(page) => {
                tracing::debug!(url = %url, status = page.status.as_u16(), "Structure page not OK");
                return None;
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Structure page fetch failed");
                return None;
            }
        };

        let structure = detect_structure(&page.text());
        match &structure {
            Some(s) => tracing::info!(
                url = %url,
                selector = %s.article_selector,
                matches = s.match_count,
                confidence = %s.confidence,
                "Detected article structure"
            ),
            None => tracing::debug!(url = %url, "No article structure detected"),
        }
        structure
    }
}

/// Infers article selectors from a listing page's HTML.
///
/// Returns `None` when no container selector matches at least
/// [`MIN_MATCHES`] elements and the `li` fallback does not either.
pub fn detect_structure(html: &str) -> Option<ArticleStructure> {
    let document = Html::parse_document(html);

    for &selector in CONTAINER_SELECTORS {
        let Some(parsed) = parse_selector(selector) else {
            continue;
        };
        let containers: Vec<ElementRef<'_>> = document.select(&parsed).collect();
        if let Some(confidence) = tier(containers.len()) {
            return Some(build_structure(selector, &containers, confidence));
        }
    }

    // Fallback: list items that carry a link, one tier less confident
    let li = parse_selector("li")?;
    let anchor = parse_selector("a[href]")?;
    let items: Vec<ElementRef<'_>> = document
        .select(&li)
        .filter(|el| el.select(&anchor).next().is_some())
        .collect();
    let confidence = tier(items.len()).map(lower_tier)?;
    Some(build_structure("li", &items, confidence))
}

fn tier(matches: usize) -> Option<Confidence> {
    if matches >= HIGH_CONFIDENCE_MATCHES {
        Some(Confidence::High)
    } else if matches >= MIN_MATCHES {
        Some(Confidence::Medium)
    } else {
        None
    }
}

fn lower_tier(confidence: Confidence) -> Confidence {
    match confidence {
        Confidence::High => Confidence::Medium,
        Confidence::Medium | Confidence::Low => Confidence::Low,
    }
}

fn build_structure(
    article_selector: &str,
    containers: &[ElementRef<'_>],
    confidence: Confidence,
) -> ArticleStructure {
    let sample = &containers[..containers.len().min(SAMPLE_SIZE)];

    let title_selector = detect_title(sample).unwrap_or("a");
    let link_selector = detect_link(sample, title_selector);

    ArticleStructure {
        article_selector: article_selector.to_owned(),
        title_selector: title_selector.to_owned(),
        link_selector,
        date_selector: detect_date(sample),
        content_selector: first_present(sample, CONTENT_SELECTORS).map(str::to_owned),
        author_selector: first_present(sample, AUTHOR_SELECTORS).map(str::to_owned),
        confidence,
        match_count: containers.len(),
    }
}

/// First title candidate present in at least half the sampled containers.
fn detect_title(sample: &[ElementRef<'_>]) -> Option<&'static str> {
    TITLE_SELECTORS.iter().copied().find(|&candidate| {
        let Some(selector) = parse_selector(candidate) else {
            return false;
        };
        let hits = sample
            .iter()
            .filter(|container| {
                container.select(&selector).any(|el| {
                    let text = element_text(&el);
                    if el.value().name() == "a" {
                        text.chars().count() > MIN_HEADLINE_CHARS
                    } else {
                        !text.is_empty()
                    }
                })
            })
            .count();
        hits > 0 && hits * 2 >= sample.len()
    })
}

/// Link selector: the title itself when it is an anchor, an anchor inside
/// the title, or any anchor in the container.
fn detect_link(sample: &[ElementRef<'_>], title_selector: &str) -> String {
    let ends_in_anchor = title_selector == "a" || title_selector.ends_with(" a");
    if ends_in_anchor {
        return title_selector.to_owned();
    }

    let nested = format!("{title_selector} a[href]");
    if let Some(selector) = parse_selector(&nested) {
        if sample.iter().any(|c| c.select(&selector).next().is_some()) {
            return nested;
        }
    }
    "a[href]".to_owned()
}

/// Three strategies, first hit wins: a known date selector, an element
/// whose class mentions a date keyword, then the tag of the first element
/// whose own text parses as a date.
fn detect_date(sample: &[ElementRef<'_>]) -> Option<String> {
    if let Some(direct) = first_present(sample, DATE_SELECTORS) {
        return Some(direct.to_owned());
    }

    for container in sample {
        for el in container.descendants().skip(1).filter_map(ElementRef::wrap) {
            let matched = el.value().classes().find(|class| {
                let lower = class.to_lowercase();
                DATE_CLASS_KEYWORDS.iter().any(|kw| lower.contains(kw))
            });
            if let Some(class) = matched {
                let selector = format!(".{class}");
                if parse_selector(&selector).is_some() {
                    return Some(selector);
                }
            }
        }
    }

    for container in sample {
        for el in container.descendants().skip(1).filter_map(ElementRef::wrap) {
            let own_text: String = el
                .children()
                .filter_map(|child| child.value().as_text().map(|t| t.to_string()))
                .collect();
            if own_text.trim().is_empty() {
                continue;
            }
            if parse_date(&own_text).is_some() {
                return Some(el.value().name().to_owned());
            }
        }
    }

    None
}

fn first_present(sample: &[ElementRef<'_>], candidates: &[&'static str]) -> Option<&'static str> {
    candidates.iter().copied().find(|&candidate| {
        parse_selector(candidate)
            .is_some_and(|selector| sample.iter().any(|c| c.select(&selector).next().is_some()))
    })
}

fn parse_selector(selector: &str) -> Option<Selector> {
    Selector::parse(selector).ok()
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn repeat(block: &str, n: usize) -> String {
        let body: String = (0..n).map(|i| block.replace("{i}", &i.to_string())).collect();
        format!("<html><body>{body}</body></html>")
    }

    #[test]
    fn test_articles_high_confidence() {
        let html = repeat(
            r#"<article>
                <h2><a href="/posts/{i}">A long enough headline number {i}</a></h2>
                <time datetime="2025-11-2{i}T10:00:00Z">Nov 2{i}</time>
                <p>Summary text {i}</p>
                <span class="author">Jane</span>
            </article>"#,
            6,
        );

        let structure = detect_structure(&html).unwrap();
        assert_eq!(
            structure,
            ArticleStructure {
                article_selector: "article".to_owned(),
                title_selector: "h2 a".to_owned(),
                link_selector: "h2 a".to_owned(),
                date_selector: Some("time[datetime]".to_owned()),
                content_selector: Some("p".to_owned()),
                author_selector: Some(".author".to_owned()),
                confidence: Confidence::High,
                match_count: 6,
            }
        );
    }

    #[test]
    fn test_post_class_medium_with_class_keyword_date() {
        let html = repeat(
            r#"<div class="post">
                <h3><a href="/p/{i}">Another reasonably long title</a></h3>
                <span class="post-meta-date">Nov 24, 2025</span>
                <div class="excerpt">Excerpt</div>
            </div>"#,
            3,
        );

        let structure = detect_structure(&html).unwrap();
        assert_eq!(structure.article_selector, ".post");
        assert_eq!(structure.confidence, Confidence::Medium);
        assert_eq!(structure.date_selector.as_deref(), Some(".post-meta-date"));
        assert_eq!(structure.content_selector.as_deref(), Some(".excerpt"));
        assert_eq!(structure.author_selector, None);
    }

    #[test]
    fn test_short_anchor_not_a_headline() {
        let html = repeat(
            r#"<article>
                <h2>Heading without a link {i}</h2>
                <a href="/read/{i}">Read more</a>
            </article>"#,
            3,
        );

        let structure = detect_structure(&html).unwrap();
        assert_eq!(structure.title_selector, "h2");
        assert_eq!(structure.link_selector, "a[href]");
    }

    #[test]
    fn test_heading_with_nested_anchor_link() {
        let html = repeat(
            r#"<div class="entry">
                <div class="title">Story {i}<a href="/s/{i}">link</a></div>
            </div>"#,
            4,
        );

        let structure = detect_structure(&html).unwrap();
        assert_eq!(structure.article_selector, ".entry");
        assert_eq!(structure.title_selector, ".title");
        assert_eq!(structure.link_selector, ".title a[href]");
    }

    #[test]
    fn test_date_inferred_from_tag() {
        let html = repeat(
            r#"<article>
                <h2><a href="/n/{i}">Headline that is long enough</a></h2>
                <span>24 Nov 2025</span>
            </article>"#,
            3,
        );

        let structure = detect_structure(&html).unwrap();
        assert_eq!(structure.date_selector.as_deref(), Some("span"));
    }

    #[test]
    fn test_li_fallback_is_one_tier_lower() {
        let html = repeat(
            r#"<ul><li><a href="/item/{i}">List headline number {i}</a></li></ul>"#,
            5,
        );

        let structure = detect_structure(&html).unwrap();
        assert_eq!(structure.article_selector, "li");
        assert_eq!(structure.title_selector, "a");
        assert_eq!(structure.confidence, Confidence::Medium);
        assert_eq!(structure.match_count, 5);
    }

    #[test]
    fn test_li_fallback_low_tier() {
        let html = repeat(r#"<ul><li><a href="/{i}">Only three of these</a></li></ul>"#, 3);
        let structure = detect_structure(&html).unwrap();
        assert_eq!(structure.confidence, Confidence::Low);
    }

    #[test]
    fn test_too_few_matches_is_none() {
        let html = repeat(r#"<article><h2>Lonely</h2></article>"#, 2);
        assert_eq!(detect_structure(&html), None);
        assert_eq!(detect_structure("<html><body><p>Nothing</p></body></html>"), None);
    }

    #[test]
    fn test_tier_thresholds() {
        assert_eq!(tier(2), None);
        assert_eq!(tier(MIN_MATCHES), Some(Confidence::Medium));
        assert_eq!(tier(HIGH_CONFIDENCE_MATCHES), Some(Confidence::High));
    }

    #[test]
    fn test_rule_tables_parse() {
        for table in [
            CONTAINER_SELECTORS,
            TITLE_SELECTORS,
            DATE_SELECTORS,
            CONTENT_SELECTORS,
            AUTHOR_SELECTORS,
        ] {
            for selector in table {
                assert!(parse_selector(selector).is_some(), "bad selector {selector}");
            }
        }
    }
}
