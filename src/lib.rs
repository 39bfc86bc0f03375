//! Per-project news aggregation: feed discovery, RSS synthesis for sites
//! without feeds, concurrent refresh into SQLite, and signed webhooks.
//!
//! The binary (`newsagg`) is a thin CLI over these modules.

pub mod config;
pub mod feed;
pub mod ingest;
pub mod refresh;
pub mod storage;
pub mod subscribe;
pub mod util;
pub mod webhook;

pub use config::Config;
pub use ingest::{process_feed_items, ProcessOutcome};
pub use refresh::{ProjectRefreshSummary, RefreshError, RefreshResult, Refresher};
pub use storage::Database;
pub use subscribe::{SubscribeError, Subscriber};
pub use webhook::{WebhookDispatcher, WebhookError};
