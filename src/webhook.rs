//! Outbound webhook notifications.
//!
//! Each event is serialized once, then POSTed concurrently to every active
//! webhook of the project that subscribes to it. Every attempt is logged in
//! `webhook_deliveries`: a `PENDING` row before the request, completed as
//! `SUCCESS` or `FAILED` afterwards.
//!
//! There is no retry queue. A failed delivery stays `FAILED`.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::Sha256;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::feed::Fetcher;
use crate::storage::{
    Database, DeliveryResult, DeliveryStatus, Item, Project, Source, Webhook, WebhookEvent,
};
use crate::util::truncate_chars;

pub const WEBHOOK_USER_AGENT: &str = "News-Aggregator-Webhook/1.0";
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Stored response bodies are cut to this many characters.
const MAX_RESPONSE_BODY_CHARS: usize = 1000;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Failed to serialize webhook payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Webhook store error: {0}")]
    Database(#[from] anyhow::Error),
}

// ============================================================================
// Payload
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectRef {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

impl From<&Project> for ProjectRef {
    fn from(project: &Project) -> Self {
        Self {
            id: project.id,
            name: project.name.clone(),
            slug: project.slug.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub id: i64,
    pub title: String,
    pub site_url: String,
}

impl From<&Source> for SourceRef {
    fn from(source: &Source) -> Self {
        Self {
            id: source.id,
            title: source.display_title().to_owned(),
            site_url: source.site_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSummary {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub content_snippet: Option<String>,
    pub source: SourceRef,
}

impl ItemSummary {
    pub fn new(item: &Item, source: &SourceRef) -> Self {
        Self {
            id: item.id,
            title: item.title.clone(),
            url: item.url.clone(),
            author: item.author.clone(),
            published_at: item.published_at,
            content_snippet: item.content_snippet.clone(),
            source: source.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewItemsData {
    pub count: usize,
    pub items: Vec<ItemSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRefreshData {
    pub source: SourceRef,
    pub success: bool,
    pub items_added: usize,
    pub error: Option<String>,
}

/// Event-specific `data` object. The variant selects the event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    NewItems(NewItemsData),
    SourceRefresh(SourceRefreshData),
}

impl EventData {
    pub fn event(&self) -> WebhookEvent {
        match self {
            EventData::NewItems(_) => WebhookEvent::NewItems,
            EventData::SourceRefresh(_) => WebhookEvent::SourceRefresh,
        }
    }
}

/// Body POSTed to webhook endpoints.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub event: WebhookEvent,
    pub project: &'a ProjectRef,
    pub timestamp: DateTime<Utc>,
    pub data: &'a EventData,
}

/// HMAC-SHA256 of `body` keyed by `secret`, lowercase hex.
pub fn sign_payload(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Result of one delivery attempt, as recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub webhook_id: i64,
    pub delivery_id: i64,
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

/// Count of detached dispatch tasks still running.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when a dispatch task ends, even by panic.
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    db: Database,
    fetcher: Fetcher,
    timeout: Duration,
    in_flight: Arc<InFlight>,
}

impl WebhookDispatcher {
    /// Deliveries use the fetcher's `webhook_timeout` and SSRF guard.
    pub fn new(db: Database, fetcher: Fetcher) -> Self {
        let timeout = fetcher.config().webhook_timeout;
        Self {
            db,
            fetcher,
            timeout,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Delivers in a detached task.
    ///
    /// The caller does not observe completion: failures are logged and
    /// recorded in the delivery log only. The handle is returned for tests
    /// and shutdown paths that want to await it; dropping it is fine.
    pub fn fire(&self, project: &Project, data: EventData) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let project = ProjectRef::from(project);
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        tokio::spawn(async move {
            let _guard = guard;
            let event = data.event();
            if let Err(e) = dispatcher.deliver(&project, &data).await {
                tracing::warn!(project_id = project.id, event = %event, error = %e, "Webhook dispatch failed");
            }
        })
    }

    /// Waits until every task started by [`Self::fire`] (on this dispatcher
    /// or its clones) has finished.
    ///
    /// Short-lived processes call this before exiting so detached deliveries
    /// are not cut off by runtime shutdown.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight.count.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Delivers `data` to every subscribed webhook and waits for all of them.
    ///
    /// # Errors
    ///
    /// Fails only if the subscriptions cannot be loaded or the payload cannot
    /// be serialized. Per-webhook failures are reported as `FAILED` outcomes;
    /// a webhook whose delivery record cannot be written is logged and left
    /// out of the result.
    pub async fn deliver(
        &self,
        project: &ProjectRef,
        data: &EventData,
    ) -> Result<Vec<DeliveryOutcome>, WebhookError> {
        let event = data.event();
        let webhooks = self.db.find_active_webhooks(project.id, event).await?;
        if webhooks.is_empty() {
            return Ok(Vec::new());
        }

        let payload = WebhookPayload {
            event,
            project,
            timestamp: Utc::now(),
            data,
        };
        let body = serde_json::to_string(&payload)?;

        tracing::debug!(project_id = project.id, event = %event, webhooks = webhooks.len(), "Dispatching webhooks");

        let attempts = webhooks
            .into_iter()
            .map(|webhook| self.deliver_one(webhook, event, &body));
        let outcomes = join_all(attempts)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    tracing::warn!(project_id = project.id, error = %e, "Webhook delivery not recorded");
                    None
                }
            })
            .collect();

        Ok(outcomes)
    }

    async fn deliver_one(
        &self,
        webhook: Webhook,
        event: WebhookEvent,
        body: &str,
    ) -> Result<DeliveryOutcome, WebhookError> {
        let delivery_id = self.db.create_delivery(webhook.id, event, body).await?;
        let headers = request_headers(webhook.secret.as_ref(), body.as_bytes());

        let result = match self
            .fetcher
            .post_json(&webhook.url, body.as_bytes().to_vec(), headers, self.timeout)
            .await
        {
            Ok(page) => {
                let status = if page.is_success() {
                    DeliveryStatus::Success
                } else {
                    DeliveryStatus::Failed
                };
                let response_body = truncate_chars(&page.text(), MAX_RESPONSE_BODY_CHARS).into_owned();
                DeliveryResult {
                    status,
                    status_code: Some(page.status.as_u16()),
                    response_body: Some(response_body).filter(|b| !b.is_empty()),
                    error: None,
                }
            }
            Err(e) => DeliveryResult {
                status: DeliveryStatus::Failed,
                status_code: None,
                response_body: None,
                error: Some(e.to_string()),
            },
        };

        match result.status {
            DeliveryStatus::Success => {
                tracing::debug!(webhook_id = webhook.id, delivery_id, "Webhook delivered")
            }
            _ => tracing::warn!(
                webhook_id = webhook.id,
                delivery_id,
                status_code = ?result.status_code,
                error = ?result.error,
                "Webhook delivery failed"
            ),
        }

        self.db.complete_delivery(delivery_id, &result).await?;

        Ok(DeliveryOutcome {
            webhook_id: webhook.id,
            delivery_id,
            status: result.status,
            status_code: result.status_code,
            error: result.error,
        })
    }
}

fn request_headers(secret: Option<&SecretString>, body: &[u8]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(WEBHOOK_USER_AGENT));
    let signature = secret.and_then(|s| sign_payload(s.expose_secret(), body));
    if let Some(value) = signature.and_then(|sig| HeaderValue::from_str(&format!("sha256={sig}")).ok()) {
        headers.insert(SIGNATURE_HEADER, value);
    }
    headers
}
