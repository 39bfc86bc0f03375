//! Utility functions for common operations.
//!
//! This module provides reusable utilities for:
//!
//! - **URL validation**: SSRF-safe validation and canonicalization of
//!   user-supplied and scraped URLs
//! - **Text processing**: whitespace collapsing, HTML stripping and
//!   char-safe truncation for titles and snippets
//!
//! # Examples
//!
//! ```
//! use news_aggregator::util::{normalize_url, strip_html, truncate_chars};
//!
//! let url = normalize_url("example.com/news/").unwrap();
//! assert_eq!(url, "https://example.com/news");
//!
//! let text = strip_html("<p>Breaking <em>news</em></p>");
//! assert_eq!(text, "Breaking news");
//!
//! assert_eq!(truncate_chars("abcdef", 3), "abc");
//! ```

mod text;
mod url_validator;

pub use text::{collapse_whitespace, strip_html, truncate_chars};
pub use url_validator::{normalize_url, validate_url, UrlValidationError};

/// Maximum stored length of an item's plain-text snippet, in characters.
pub const MAX_SNIPPET_CHARS: usize = 500;
