use chrono::{DateTime, Utc};
use thiserror::Error;

/// Feed bytes that are not RSS, Atom, RDF or JSON Feed.
#[derive(Debug, Error)]
#[error("Failed to parse feed: {0}")]
pub struct ParseError(#[from] feed_rs::parser::ParseFeedError);

/// Channel-level fields plus entries, independent of the source format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub items: Vec<ParsedItem>,
}

/// One entry as the item processor sees it.
///
/// Nothing is validated here: missing links/titles are skipped by the
/// processor, and dates are whatever the feed library could parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub guid: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    /// `<description>` / `<summary>`, usually HTML
    pub summary: Option<String>,
    /// `<content:encoded>` / `<content>`
    pub content: Option<String>,
    /// Author names (RSS `author`/`dc:creator`, Atom `author`)
    pub authors: Vec<String>,
}

/// Parses RSS 0.9x/1.0/2.0, Atom or JSON Feed bytes.
///
/// # Errors
///
/// Returns [`ParseError`] when the bytes are not a recognisable feed.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let feed = feed_rs::parser::parse(bytes)?;

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry
                .links
                .iter()
                .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
                .or_else(|| entry.links.first())
                .map(|l| l.href.trim().to_owned())
                .filter(|href| !href.is_empty());
            let title = non_empty(entry.title.map(|t| t.content));
            let guid = non_empty(Some(entry.id));
            let summary = non_empty(entry.summary.map(|s| s.content));
            let content = non_empty(entry.content.and_then(|c| c.body));
            let authors = entry
                .authors
                .into_iter()
                .map(|person| person.name.trim().to_owned())
                .filter(|name| !name.is_empty())
                .collect();

            ParsedItem {
                title,
                link,
                guid,
                published: entry.published,
                updated: entry.updated,
                summary,
                content,
                authors,
            }
        })
        .collect();

    Ok(ParsedFeed {
        title: non_empty(feed.title.map(|t| t.content)),
        description: non_empty(feed.description.map(|d| d.content)),
        items,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
