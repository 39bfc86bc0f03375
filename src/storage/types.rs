use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::feed::{Confidence, ScrapeConfig};

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("The database is locked by another news-aggregator process. Try again shortly.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A stored enum column held a value this version does not know
    #[error("Unexpected value {value:?} in column {column}")]
    InvalidValue { column: &'static str, value: String },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

/// Converts a stored unix timestamp (seconds) to UTC.
pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Implements `as_str`, `Display` and `FromStr` for a column-backed enum.
macro_rules! column_enum {
    ($ty:ident, $column:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(DatabaseError::InvalidValue {
                        column: $column,
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

// ============================================================================
// Projects
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ProjectDbRow {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub created_at: i64,
}

impl ProjectDbRow {
    pub(crate) fn into_project(self) -> Project {
        Project {
            id: self.id,
            name: self.name,
            slug: self.slug,
            created_at: from_unix(self.created_at),
        }
    }
}

// ============================================================================
// Sources
// ============================================================================

/// Where a source's items come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeedType {
    /// The site publishes RSS/Atom at `feed_url`
    Native,
    /// Items are scraped with the source's [`ScrapeConfig`]
    Custom,
}

column_enum!(FeedType, "feed_type", { Native => "NATIVE", Custom => "CUSTOM" });

/// Refresh-driven health of a source.
///
/// Refresh moves sources between `Active` and `Error`. `Inactive` is set
/// administratively and is never changed by refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceStatus {
    Active,
    Error,
    Inactive,
}

column_enum!(SourceStatus, "status", {
    Active => "ACTIVE",
    Error => "ERROR",
    Inactive => "INACTIVE",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: i64,
    pub project_id: i64,
    pub site_url: String,
    pub feed_url: Option<String>,
    pub feed_type: FeedType,
    pub status: SourceStatus,
    pub title: Option<String>,
    pub description: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub custom_config: Option<ScrapeConfig>,
    pub cloudflare_protected: bool,
    pub protection_confidence: Option<Confidence>,
    pub protection_indicators: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Source {
    /// Title for display and webhook payloads, falling back to the site URL.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.site_url)
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SourceDbRow {
    pub id: i64,
    pub project_id: i64,
    pub site_url: String,
    pub feed_url: Option<String>,
    pub feed_type: String,
    pub status: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub last_fetched_at: Option<i64>,
    pub last_error: Option<String>,
    pub custom_rss_config: Option<String>,
    pub cloudflare_protected: bool,
    pub protection_confidence: Option<String>,
    pub protection_indicators: Option<String>,
    pub created_at: i64,
}

impl SourceDbRow {
    pub(crate) fn into_source(self) -> Result<Source, DatabaseError> {
        // A malformed stored config surfaces later as a refresh error on this
        // source instead of failing every query that loads it
        let custom_config = self.custom_rss_config.as_deref().and_then(|json| {
            serde_json::from_str::<ScrapeConfig>(json)
                .map_err(|e| {
                    tracing::warn!(source_id = self.id, error = %e, "Unreadable custom RSS config");
                })
                .ok()
        });
        let protection_confidence = self
            .protection_confidence
            .as_deref()
            .and_then(|c| serde_json::from_value(serde_json::Value::from(c)).ok());
        let protection_indicators = self
            .protection_indicators
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default();

        Ok(Source {
            id: self.id,
            project_id: self.project_id,
            site_url: self.site_url,
            feed_url: self.feed_url,
            feed_type: self.feed_type.parse()?,
            status: self.status.parse()?,
            title: self.title,
            description: self.description,
            last_fetched_at: self.last_fetched_at.map(from_unix),
            last_error: self.last_error,
            custom_config,
            cloudflare_protected: self.cloudflare_protected,
            protection_confidence,
            protection_indicators,
            created_at: from_unix(self.created_at),
        })
    }
}

/// Fields for [`Database::create_source`](super::Database::create_source).
#[derive(Debug, Clone)]
pub struct NewSource {
    pub project_id: i64,
    pub site_url: String,
    pub feed_url: Option<String>,
    pub feed_type: FeedType,
    pub title: Option<String>,
    pub description: Option<String>,
    pub custom_config: Option<ScrapeConfig>,
    pub cloudflare_protected: bool,
    pub protection_confidence: Option<Confidence>,
    pub protection_indicators: Vec<String>,
}

/// Outcome of one refresh, written by
/// [`Database::update_source_refresh`](super::Database::update_source_refresh).
#[derive(Debug, Clone)]
pub struct SourceRefreshUpdate {
    /// `None` leaves the status untouched (inactive sources)
    pub status: Option<SourceStatus>,
    pub last_error: Option<String>,
    pub last_fetched_at: DateTime<Utc>,
    /// Applied only while the stored title is unset
    pub title: Option<String>,
    /// Applied only while the stored description is unset
    pub description: Option<String>,
}

// ============================================================================
// Items
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: i64,
    pub project_id: i64,
    pub source_id: i64,
    pub url: String,
    pub guid: Option<String>,
    pub title: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub content_snippet: Option<String>,
    pub content_html: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemDbRow {
    pub id: i64,
    pub project_id: i64,
    pub source_id: i64,
    pub url: String,
    pub guid: Option<String>,
    pub title: String,
    pub author: Option<String>,
    pub published_at: Option<i64>,
    pub content_snippet: Option<String>,
    pub content_html: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ItemDbRow {
    pub(crate) fn into_item(self) -> Item {
        Item {
            id: self.id,
            project_id: self.project_id,
            source_id: self.source_id,
            url: self.url,
            guid: self.guid,
            title: self.title,
            author: self.author,
            published_at: self.published_at.map(from_unix),
            content_snippet: self.content_snippet,
            content_html: self.content_html,
            created_at: from_unix(self.created_at),
            updated_at: from_unix(self.updated_at),
        }
    }
}

/// A normalized item ready for upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub source_id: i64,
    /// Normalized link; the dedup key within a project
    pub url: String,
    pub guid: Option<String>,
    pub title: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub content_snippet: Option<String>,
    pub content_html: Option<String>,
}

// ============================================================================
// Webhooks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    NewItems,
    SourceRefresh,
}

column_enum!(WebhookEvent, "event", {
    NewItems => "new_items",
    SourceRefresh => "source_refresh",
});

/// A webhook subscription. Not `Clone`: the secret is moved into the task
/// that signs with it.
#[derive(Debug)]
pub struct Webhook {
    pub id: i64,
    pub project_id: i64,
    pub url: String,
    pub secret: Option<SecretString>,
    pub events: Vec<WebhookEvent>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribes_to(&self, event: WebhookEvent) -> bool {
        self.events.contains(&event)
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct WebhookDbRow {
    pub id: i64,
    pub project_id: i64,
    pub url: String,
    pub secret: Option<String>,
    pub events: String,
    pub active: bool,
    pub created_at: i64,
}

impl WebhookDbRow {
    pub(crate) fn into_webhook(self) -> Result<Webhook, DatabaseError> {
        let events = self
            .events
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<WebhookEvent>, _>>()?;
        Ok(Webhook {
            id: self.id,
            project_id: self.project_id,
            url: self.url,
            secret: self
                .secret
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            events,
            active: self.active,
            created_at: from_unix(self.created_at),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

column_enum!(DeliveryStatus, "status", {
    Pending => "PENDING",
    Success => "SUCCESS",
    Failed => "FAILED",
});

/// One entry of the append-only delivery log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    pub id: i64,
    pub webhook_id: i64,
    pub event: WebhookEvent,
    pub payload: String,
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct DeliveryDbRow {
    pub id: i64,
    pub webhook_id: i64,
    pub event: String,
    pub payload: String,
    pub status: String,
    pub status_code: Option<i64>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl DeliveryDbRow {
    pub(crate) fn into_delivery(self) -> Result<WebhookDelivery, DatabaseError> {
        Ok(WebhookDelivery {
            id: self.id,
            webhook_id: self.webhook_id,
            event: self.event.parse()?,
            payload: self.payload,
            status: self.status.parse()?,
            status_code: self.status_code.and_then(|c| u16::try_from(c).ok()),
            response_body: self.response_body,
            error: self.error,
            created_at: from_unix(self.created_at),
            completed_at: self.completed_at.map(from_unix),
        })
    }
}

/// Final state of a delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_enums_round_trip_text() {
        for status in [SourceStatus::Active, SourceStatus::Error, SourceStatus::Inactive] {
            assert_eq!(status.as_str().parse::<SourceStatus>().unwrap(), status);
        }
        assert_eq!("CUSTOM".parse::<FeedType>().unwrap(), FeedType::Custom);
        assert_eq!(
            "source_refresh".parse::<WebhookEvent>().unwrap(),
            WebhookEvent::SourceRefresh
        );
    }

    #[test]
    fn test_unknown_column_value() {
        let err = "PAUSED".parse::<SourceStatus>().unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::InvalidValue { column: "status", .. }
        ));
    }

    #[test]
    fn test_webhook_row_events() {
        let row = WebhookDbRow {
            id: 1,
            project_id: 2,
            url: "https://hooks.example.com".to_owned(),
            secret: Some(String::new()),
            events: "new_items, source_refresh".to_owned(),
            active: true,
            created_at: 0,
        };
        let webhook = row.into_webhook().unwrap();
        assert!(webhook.subscribes_to(WebhookEvent::NewItems));
        assert!(webhook.subscribes_to(WebhookEvent::SourceRefresh));
        assert!(webhook.secret.is_none());
    }
}
