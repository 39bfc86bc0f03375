//! Source refresh orchestration.
//!
//! A refresh fetches one source (a native feed, or a synthesized feed for
//! custom sources), stores its items, records the outcome on the source and
//! notifies webhooks. Project refreshes fan out over sources with bounded
//! concurrency and always wait for every source to settle: one failing
//! source never affects the others.

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;

use crate::feed::{parse_feed, Fetcher, ParsedFeed, Synthesizer};
use crate::ingest::{process_feed_items, ProcessOutcome};
use crate::storage::{Database, FeedType, Project, Source, SourceRefreshUpdate, SourceStatus};
use crate::webhook::{
    EventData, ItemSummary, NewItemsData, SourceRef, SourceRefreshData, WebhookDispatcher,
};

/// Default number of sources refreshed in parallel within a project.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Source {0} not found")]
    SourceNotFound(i64),

    #[error("Project {0} not found")]
    ProjectNotFound(i64),

    #[error("Store error during refresh: {0}")]
    Database(#[from] anyhow::Error),
}

/// Outcome of refreshing one source. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResult {
    pub source_id: i64,
    pub success: bool,
    pub items_added: usize,
    pub error: Option<String>,
}

impl RefreshResult {
    fn failed(source_id: i64, error: String) -> Self {
        Self {
            source_id,
            success: false,
            items_added: 0,
            error: Some(error),
        }
    }
}

/// Aggregate of a project refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRefreshSummary {
    pub project_id: i64,
    pub sources_processed: usize,
    pub sources_succeeded: usize,
    pub sources_failed: usize,
    pub total_items_added: usize,
    /// True when no source failed (including when there were none)
    pub success: bool,
    /// Per-source results ordered by source id
    pub results: Vec<RefreshResult>,
}

impl ProjectRefreshSummary {
    fn from_results(project_id: i64, mut results: Vec<RefreshResult>) -> Self {
        results.sort_by_key(|r| r.source_id);
        let sources_succeeded = results.iter().filter(|r| r.success).count();
        let sources_failed = results.len() - sources_succeeded;
        Self {
            project_id,
            sources_processed: results.len(),
            sources_succeeded,
            sources_failed,
            total_items_added: results.iter().map(|r| r.items_added).sum(),
            success: sources_failed == 0,
            results,
        }
    }
}

// ============================================================================
// Refresher
// ============================================================================

#[derive(Clone)]
pub struct Refresher {
    db: Database,
    fetcher: Fetcher,
    synthesizer: Synthesizer,
    dispatcher: WebhookDispatcher,
    max_concurrent: usize,
}

impl Refresher {
    /// # Arguments
    ///
    /// * `max_concurrent` - sources refreshed in parallel per project (min 1)
    pub fn new(db: Database, fetcher: Fetcher, max_concurrent: usize) -> Self {
        Self {
            synthesizer: Synthesizer::new(fetcher.clone()),
            dispatcher: WebhookDispatcher::new(db.clone(), fetcher.clone()),
            db,
            fetcher,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Refreshes one source by id.
    ///
    /// Fetch, parse and synthesis failures are recorded on the source
    /// (`ERROR` + `last_error`) and returned as an unsuccessful
    /// [`RefreshResult`]. Inactive sources are refreshed on request but keep
    /// their status.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::SourceNotFound`] for an unknown id, and
    /// [`RefreshError::Database`] if the store fails.
    pub async fn refresh_source(&self, source_id: i64) -> Result<RefreshResult, RefreshError> {
        let source = self
            .db
            .find_source(source_id)
            .await?
            .ok_or(RefreshError::SourceNotFound(source_id))?;
        let project = self
            .db
            .find_project(source.project_id)
            .await?
            .ok_or(RefreshError::ProjectNotFound(source.project_id))?;

        self.refresh_loaded(source, &project).await
    }

    /// Refreshes every non-inactive source of a project.
    ///
    /// At most `max_concurrent` sources run at once. Every source settles
    /// before this returns; store failures on one source are reported as that
    /// source's failed result.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::ProjectNotFound`] for an unknown id, and
    /// [`RefreshError::Database`] if the source list cannot be loaded.
    pub async fn refresh_project(
        &self,
        project_id: i64,
    ) -> Result<ProjectRefreshSummary, RefreshError> {
        let project = self
            .db
            .find_project(project_id)
            .await?
            .ok_or(RefreshError::ProjectNotFound(project_id))?;

        let sources: Vec<Source> = self
            .db
            .list_sources(project_id)
            .await?
            .into_iter()
            .filter(|s| s.status != SourceStatus::Inactive)
            .collect();

        tracing::info!(
            project_id,
            sources = sources.len(),
            max_concurrent = self.max_concurrent,
            "Refreshing project"
        );

        // Each source runs in its own task so a panic settles as that
        // source's failure
        let results: Vec<RefreshResult> = stream::iter(sources)
            .map(|source| {
                let source_id = source.id;
                let refresher = self.clone();
                let project = project.clone();
                let task =
                    tokio::spawn(async move { refresher.refresh_loaded(source, &project).await });
                async move {
                    match task.await {
                        Ok(Ok(result)) => result,
                        Ok(Err(e)) => {
                            tracing::warn!(source_id, error = %e, "Source refresh aborted");
                            RefreshResult::failed(source_id, e.to_string())
                        }
                        Err(e) => {
                            tracing::error!(source_id, error = %e, "Source refresh task failed");
                            RefreshResult::failed(source_id, format!("Refresh task failed: {e}"))
                        }
                    }
                }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let summary = ProjectRefreshSummary::from_results(project_id, results);
        tracing::info!(
            project_id,
            succeeded = summary.sources_succeeded,
            failed = summary.sources_failed,
            items_added = summary.total_items_added,
            "Project refresh complete"
        );
        Ok(summary)
    }

    /// Refreshes all projects one after another (scheduled use).
    ///
    /// A project that cannot be refreshed is logged and skipped.
    pub async fn refresh_all_projects(&self) -> Result<Vec<ProjectRefreshSummary>, RefreshError> {
        let projects = self.db.list_projects().await?;
        let mut summaries = Vec::with_capacity(projects.len());

        for project in projects {
            match self.refresh_project(project.id).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    tracing::warn!(project_id = project.id, error = %e, "Project refresh failed")
                }
            }
        }

        Ok(summaries)
    }

    /// Waits for webhook notifications fired by earlier refreshes.
    pub async fn wait_for_webhooks(&self) {
        self.dispatcher.wait_idle().await;
    }

    async fn refresh_loaded(
        &self,
        source: Source,
        project: &Project,
    ) -> Result<RefreshResult, RefreshError> {
        let source_id = source.id;

        let stored = match self.fetch_feed(&source).await {
            Ok(feed) => self
                .store_feed(&source, project.id, &feed)
                .await
                .map(|outcome| (outcome, feed))
                .map_err(|e| format!("Failed to store feed items: {e:#}")),
            Err(message) => Err(message),
        };
        let (outcome, feed) = match stored {
            Ok(stored) => stored,
            Err(message) => return self.record_failure(&source, project, message).await,
        };

        // Payloads name the source by its title after backfill
        let source = Source {
            title: source.title.or(feed.title),
            ..source
        };

        tracing::info!(
            source_id,
            items_added = outcome.items_added,
            entries = feed.items.len(),
            "Source refreshed"
        );

        if outcome.items_added > 0 {
            let source_ref = SourceRef::from(&source);
            let items = outcome
                .new_items
                .iter()
                .map(|item| ItemSummary::new(item, &source_ref))
                .collect();
            self.dispatcher.fire(
                project,
                EventData::NewItems(NewItemsData {
                    count: outcome.items_added,
                    items,
                }),
            );
        }

        let result = RefreshResult {
            source_id,
            success: true,
            items_added: outcome.items_added,
            error: None,
        };
        self.notify_refresh(project, &source, &result);
        Ok(result)
    }

    /// Stores a fetched feed's items and marks the source as refreshed.
    async fn store_feed(
        &self,
        source: &Source,
        project_id: i64,
        feed: &ParsedFeed,
    ) -> Result<ProcessOutcome> {
        let outcome = process_feed_items(&self.db, &feed.items, project_id, source.id).await?;
        self.db
            .update_source_refresh(
                source.id,
                &SourceRefreshUpdate {
                    status: (source.status != SourceStatus::Inactive).then_some(SourceStatus::Active),
                    last_error: None,
                    last_fetched_at: Utc::now(),
                    title: feed.title.clone(),
                    description: feed.description.clone(),
                },
            )
            .await?;
        Ok(outcome)
    }

    /// Records a failed refresh on the source and reports it.
    ///
    /// Inactive sources keep their administrative status.
    async fn record_failure(
        &self,
        source: &Source,
        project: &Project,
        message: String,
    ) -> Result<RefreshResult, RefreshError> {
        tracing::warn!(source_id = source.id, error = %message, "Source refresh failed");
        self.db
            .update_source_refresh(
                source.id,
                &SourceRefreshUpdate {
                    status: (source.status != SourceStatus::Inactive).then_some(SourceStatus::Error),
                    last_error: Some(message.clone()),
                    last_fetched_at: Utc::now(),
                    title: None,
                    description: None,
                },
            )
            .await?;

        let result = RefreshResult::failed(source.id, message);
        self.notify_refresh(project, source, &result);
        Ok(result)
    }

    /// Fetches and parses a source's entries; the error is the message
    /// stored as `last_error`.
    async fn fetch_feed(&self, source: &Source) -> Result<ParsedFeed, String> {
        match source.feed_type {
            FeedType::Native => {
                let feed_url = source
                    .feed_url
                    .as_deref()
                    .ok_or_else(|| "Source has no feed URL".to_owned())?;
                let timeout = self.fetcher.config().feed_timeout;
                let page = self
                    .fetcher
                    .get_with_timeout(feed_url, timeout)
                    .await
                    .and_then(|page| page.error_for_status())
                    .map_err(|e| e.to_string())?;

                if page.final_url.as_str() != feed_url {
                    tracing::debug!(source_id = source.id, from = %feed_url, to = %page.final_url, "Feed redirected");
                }
                parse_feed(&page.body).map_err(|e| e.to_string())
            }
            FeedType::Custom => {
                let config = source
                    .custom_config
                    .as_ref()
                    .ok_or_else(|| "Custom source has no scrape configuration".to_owned())?;
                let xml = self
                    .synthesizer
                    .scrape_and_build_rss(config)
                    .await
                    .map_err(|e| e.to_string())?;
                parse_feed(xml.as_bytes()).map_err(|e| e.to_string())
            }
        }
    }

    fn notify_refresh(&self, project: &Project, source: &Source, result: &RefreshResult) {
        self.dispatcher.fire(
            project,
            EventData::SourceRefresh(SourceRefreshData {
                source: SourceRef::from(source),
                success: result.success,
                items_added: result.items_added,
                error: result.error.clone(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(source_id: i64, items_added: usize) -> RefreshResult {
        RefreshResult {
            source_id,
            success: true,
            items_added,
            error: None,
        }
    }

    #[test]
    fn test_summary_counts() {
        let summary = ProjectRefreshSummary::from_results(
            1,
            vec![
                ok(3, 1),
                RefreshResult::failed(2, "HTTP 500".to_owned()),
                ok(1, 3),
            ],
        );
        assert_eq!(summary.sources_processed, 3);
        assert_eq!(summary.sources_succeeded, 2);
        assert_eq!(summary.sources_failed, 1);
        assert_eq!(summary.total_items_added, 4);
        assert!(!summary.success);
        let order: Vec<_> = summary.results.iter().map(|r| r.source_id).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_project_summary_succeeds() {
        let summary = ProjectRefreshSummary::from_results(1, Vec::new());
        assert_eq!(summary.sources_processed, 0);
        assert!(summary.success);
    }

    #[tokio::test]
    async fn test_store_failure_marks_source_errored() {
        use crate::feed::{FetchConfig, Fetcher};
        use crate::storage::NewSource;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/rss+xml")
                    .set_body_string(
                        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>T</title>
<link>https://example.com</link><description>d</description>
<item><title>One</title><link>https://example.com/one</link></item></channel></rss>"#,
                    ),
            )
            .mount(&server)
            .await;

        let db = Database::open(":memory:").await.unwrap();
        let project = db.create_project("Tech", "tech").await.unwrap();
        let source_id = db
            .create_source(&NewSource {
                project_id: project.id,
                site_url: "https://example.com".to_owned(),
                feed_url: Some(format!("{}/feed.xml", server.uri())),
                feed_type: FeedType::Native,
                title: None,
                description: None,
                custom_config: None,
                cloudflare_protected: false,
                protection_confidence: None,
                protection_indicators: Vec::new(),
            })
            .await
            .unwrap();
        sqlx::query("DROP TABLE items").execute(&db.pool).await.unwrap();

        let fetcher = Fetcher::new(FetchConfig::permissive()).unwrap();
        let refresher = Refresher::new(db.clone(), fetcher, 2);
        let result = refresher.refresh_source(source_id).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.items_added, 0);
        assert!(result.error.as_deref().unwrap().starts_with("Failed to store feed items"));

        let source = db.find_source(source_id).await.unwrap().unwrap();
        assert_eq!(source.status, SourceStatus::Error);
        assert_eq!(source.last_error, result.error);

        let summary = refresher.refresh_project(project.id).await.unwrap();
        assert_eq!(summary.sources_failed, 1);
        assert!(!summary.success);
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let json = serde_json::to_value(RefreshResult::failed(4, "timeout".to_owned())).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "sourceId": 4,
                "success": false,
                "itemsAdded": 0,
                "error": "timeout"
            })
        );
    }
}
