//! Turns parsed feed entries into stored items.

use anyhow::Result;
use std::collections::HashSet;

use crate::feed::ParsedItem;
use crate::storage::{Database, Item, NewItem};
use crate::util::{collapse_whitespace, normalize_url, strip_html, truncate_chars, MAX_SNIPPET_CHARS};

/// What one batch changed in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Number of items created by this batch
    pub items_added: usize,
    /// The created items, in feed order (updates are not included)
    pub new_items: Vec<Item>,
}

/// Normalizes and upserts a batch of parsed entries for one source.
///
/// Entries without a link or title, or whose link the URL normalizer
/// rejects, are skipped. Links repeated within the batch are processed once
/// (first occurrence wins).
///
/// # Errors
///
/// Returns an error only for store failures; malformed entries never fail
/// the batch.
pub async fn process_feed_items(
    db: &Database,
    items: &[ParsedItem],
    project_id: i64,
    source_id: i64,
) -> Result<ProcessOutcome> {
    let mut outcome = ProcessOutcome::default();
    let mut seen = HashSet::new();

    for parsed in items {
        let Some(item) = normalize_item(parsed, source_id) else {
            continue;
        };
        if !seen.insert(item.url.clone()) {
            tracing::debug!(url = %item.url, "Duplicate link within batch");
            continue;
        }

        let (stored, created) = db.upsert_item(project_id, &item).await?;
        if created {
            outcome.items_added += 1;
            outcome.new_items.push(stored);
        }
    }

    tracing::debug!(
        project_id,
        source_id,
        received = items.len(),
        added = outcome.items_added,
        "Processed feed items"
    );
    Ok(outcome)
}

/// Maps a parsed entry to a storable item, or `None` if it must be skipped.
pub(crate) fn normalize_item(parsed: &ParsedItem, source_id: i64) -> Option<NewItem> {
    let link = parsed.link.as_deref()?;
    let title = parsed
        .title
        .as_deref()
        .map(|t| collapse_whitespace(t).into_owned())
        .filter(|t| !t.is_empty())?;
    let url = normalize_url(link)?;

    let content_snippet = parsed
        .summary
        .as_deref()
        .or(parsed.content.as_deref())
        .map(strip_html)
        .filter(|text| !text.is_empty())
        .map(|text| truncate_chars(&text, MAX_SNIPPET_CHARS).into_owned());
    let content_html = parsed.content.clone().or_else(|| parsed.summary.clone());
    let author = parsed.authors.iter().find(|a| !a.trim().is_empty()).cloned();

    Some(NewItem {
        source_id,
        url,
        guid: parsed.guid.clone(),
        title,
        author,
        published_at: parsed.published.or(parsed.updated),
        content_snippet,
        content_html,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn parsed(link: &str, title: &str) -> ParsedItem {
        ParsedItem {
            title: Some(title.to_owned()),
            link: Some(link.to_owned()),
            ..ParsedItem::default()
        }
    }

    #[test]
    fn test_requires_link_and_title() {
        assert!(normalize_item(&ParsedItem::default(), 1).is_none());
        assert!(normalize_item(
            &ParsedItem {
                link: None,
                ..parsed("https://example.com/a", "A")
            },
            1
        )
        .is_none());
        assert!(normalize_item(&parsed("https://example.com/a", "  "), 1).is_none());
        assert!(normalize_item(&parsed("http://192.168.1.1/a", "Private"), 1).is_none());
    }

    #[test]
    fn test_field_fallbacks() {
        let updated = Utc.with_ymd_and_hms(2025, 11, 20, 0, 0, 0).unwrap();
        let item = normalize_item(
            &ParsedItem {
                content: Some("<p>Full <b>body</b></p>".to_owned()),
                updated: Some(updated),
                authors: vec![String::new(), "Jane".to_owned()],
                ..parsed("example.com/post/", "  Spaced\n title ")
            },
            7,
        )
        .unwrap();

        assert_eq!(item.url, "https://example.com/post");
        assert_eq!(item.title, "Spaced title");
        assert_eq!(item.published_at, Some(updated));
        assert_eq!(item.content_snippet.as_deref(), Some("Full body"));
        assert_eq!(item.content_html.as_deref(), Some("<p>Full <b>body</b></p>"));
        assert_eq!(item.author.as_deref(), Some("Jane"));
        assert_eq!(item.source_id, 7);
    }

    #[test]
    fn test_snippet_prefers_summary_and_is_bounded() {
        let long = format!("<p>{}</p>", "é".repeat(MAX_SNIPPET_CHARS + 50));
        let item = normalize_item(
            &ParsedItem {
                summary: Some(long),
                content: Some("<div>content</div>".to_owned()),
                ..parsed("https://example.com/a", "A")
            },
            1,
        )
        .unwrap();

        let snippet = item.content_snippet.unwrap();
        assert_eq!(snippet.chars().count(), MAX_SNIPPET_CHARS);
        assert!(snippet.chars().all(|c| c == 'é'));
        assert_eq!(item.content_html.as_deref(), Some("<div>content</div>"));
    }
}
