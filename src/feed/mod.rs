//! Feed discovery, synthesis and parsing.
//!
//! This module turns an arbitrary site URL into feed items:
//!
//! - **Fetching**: bounded, SSRF-guarded HTTP shared by every component
//! - **Discovery**: find advertised or conventional RSS/Atom feeds
//! - **Protection**: annotate responses that look like bot challenges
//! - **Structure detection**: infer article selectors for feedless sites
//! - **Synthesis**: scrape those selectors into generated RSS 2.0
//! - **Parsing**: RSS/Atom/JSON Feed bytes into [`ParsedItem`]s
//!
//! # Architecture
//!
//! - [`fetcher`] - the [`Fetcher`] every network call goes through
//! - [`dates`] - free-text date cascade used when scraping
//! - [`protection`] - header/body bot-protection scoring
//! - [`discovery`] - [`FeedDiscoverer`]
//! - [`structure`] - [`StructureDetector`] and its rule tables
//! - [`synthesizer`] / [`generator`] - HTML to RSS XML
//! - [`parser`] - `feed-rs` wrapper
//!
//! # Example
//!
//! ```no_run
//! use news_aggregator::feed::{FeedDiscoverer, FetchConfig, Fetcher, Synthesizer};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let fetcher = Fetcher::new(FetchConfig::default())?;
//!
//! let discoverer = FeedDiscoverer::new(fetcher.clone());
//! match discoverer.discover_feed_url("https://example.com").await {
//!     Some(feed_url) => println!("feed: {feed_url}"),
//!     None => {
//!         let xml = Synthesizer::new(fetcher).auto_build_rss("https://example.com").await?;
//!         println!("{xml}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod dates;
pub mod discovery;
pub mod fetcher;
pub mod generator;
pub mod parser;
pub mod protection;
pub mod structure;
pub mod synthesizer;

pub use dates::{extract_date_from_element, parse_date, parse_date_at};
pub use discovery::{DiscoveredFeed, DiscoveryReport, FeedDiscoverer};
pub use fetcher::{FetchConfig, FetchError, FetchedPage, Fetcher, DEFAULT_USER_AGENT};
pub use generator::{generate_rss, RssChannel, RssItem};
pub use parser::{parse_feed, ParseError, ParsedFeed, ParsedItem};
pub use protection::{detect_protection, is_challenge_page, ChallengeType, Confidence, ProtectionReport};
pub use structure::{detect_structure, ArticleStructure, StructureDetector};
pub use synthesizer::{ArticleSelectors, ScrapeConfig, SynthesisError, Synthesizer};
