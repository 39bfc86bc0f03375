use scraper::{Html, Node};
use std::borrow::Cow;

/// Collapses runs of whitespace into single spaces and trims both ends.
///
/// Scraped text nodes carry the page's indentation and line breaks; titles
/// and snippets are stored in this collapsed form.
///
/// Returns `Cow::Borrowed` when the input is already clean.
///
/// ```
/// use news_aggregator::util::collapse_whitespace;
///
/// assert_eq!(collapse_whitespace("  Hello\n\t  world "), "Hello world");
/// assert_eq!(collapse_whitespace("tidy"), "tidy");
/// ```
pub fn collapse_whitespace(s: &str) -> Cow<'_, str> {
    let trimmed = s.trim();
    let mut prev_space = false;
    let needs_work = trimmed.chars().any(|c| {
        let bad = c.is_whitespace() && (c != ' ' || prev_space);
        prev_space = c.is_whitespace();
        bad
    });

    if !needs_work {
        return Cow::Borrowed(trimmed);
    }

    let mut out = String::with_capacity(trimmed.len());
    for word in trimmed.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    Cow::Owned(out)
}

/// Truncates a string to at most `max_chars` characters.
///
/// Counts Unicode scalar values, so multi-byte text is never cut
/// mid-codepoint. No ellipsis is appended: snippets are data, not display.
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => Cow::Owned(s[..byte_idx].to_owned()),
        None => Cow::Borrowed(s),
    }
}

/// Reduces an HTML fragment to its visible text.
///
/// The fragment is parsed with html5ever, so entities are decoded and
/// malformed markup is recovered the way a browser would. Text inside
/// `<script>`, `<style>`, `<noscript>` and `<template>` is dropped. Used to
/// derive plain-text content snippets from feed descriptions.
pub fn strip_html(html: &str) -> String {
    if !html.contains('<') && !html.contains('&') {
        return collapse_whitespace(html).into_owned();
    }

    let fragment = Html::parse_fragment(html);
    let mut text = String::with_capacity(html.len());
    for node in fragment.tree.root().descendants() {
        let Node::Text(chunk) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| match ancestor.value() {
            Node::Element(el) => HIDDEN_ELEMENTS.contains(&el.name()),
            _ => false,
        });
        if hidden {
            continue;
        }
        text.push_str(&chunk.text);
        // Element boundaries separate words visually
        text.push(' ');
    }

    collapse_whitespace(&text).into_owned()
}

const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];
