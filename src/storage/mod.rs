//! SQLite persistence for projects, sources, items and webhooks.
//!
//! [`Database`] wraps a `sqlx` pool; each submodule adds one group of
//! operations to it. Methods return `anyhow::Result`, except
//! [`Database::open`] which reports [`DatabaseError`] so callers can tell a
//! locked database apart from other failures.

mod items;
mod projects;
mod schema;
mod sources;
mod types;
mod webhooks;

pub use schema::Database;
pub use types::{
    DatabaseError, DeliveryResult, DeliveryStatus, FeedType, Item, NewItem, NewSource, Project,
    Source, SourceRefreshUpdate, SourceStatus, Webhook, WebhookDelivery, WebhookEvent,
};
