use anyhow::{Context, Result};

use super::schema::Database;
use super::types::{NewSource, Source, SourceDbRow, SourceRefreshUpdate, SourceStatus};

const SOURCE_COLUMNS: &str = "id, project_id, site_url, feed_url, feed_type, status, title, \
    description, last_fetched_at, last_error, custom_rss_config, cloudflare_protected, \
    protection_confidence, protection_indicators, created_at";

impl Database {
    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Insert a source and return its id. New sources start `ACTIVE`.
    pub async fn create_source(&self, source: &NewSource) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let custom_config = source
            .custom_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize custom RSS config")?;
        let indicators = if source.protection_indicators.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&source.protection_indicators)?)
        };

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sources (
                project_id, site_url, feed_url, feed_type, status, title, description,
                custom_rss_config, cloudflare_protected, protection_confidence,
                protection_indicators, created_at
            )
            VALUES (?, ?, ?, ?, 'ACTIVE', ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(source.project_id)
        .bind(&source.site_url)
        .bind(&source.feed_url)
        .bind(source.feed_type.as_str())
        .bind(&source.title)
        .bind(&source.description)
        .bind(custom_config)
        .bind(source.cloudflare_protected)
        .bind(source.protection_confidence.map(|c| c.as_str()))
        .bind(indicators)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to create source for {}", source.site_url))?;

        Ok(id)
    }

    pub async fn find_source(&self, source_id: i64) -> Result<Option<Source>> {
        let row = sqlx::query_as::<_, SourceDbRow>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?"
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SourceDbRow::into_source).transpose()?)
    }

    /// Sources of one project in creation order
    pub async fn list_sources(&self, project_id: i64) -> Result<Vec<Source>> {
        let rows = sqlx::query_as::<_, SourceDbRow>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE project_id = ? ORDER BY id"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_source().map_err(Into::into))
            .collect()
    }

    /// Record the outcome of a refresh.
    ///
    /// `last_error` and `last_fetched_at` are always written. Status is only
    /// written when `update.status` is set. Title and description only fill
    /// values that are currently unset.
    pub async fn update_source_refresh(
        &self,
        source_id: i64,
        update: &SourceRefreshUpdate,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sources SET
                status = COALESCE(?, status),
                last_error = ?,
                last_fetched_at = ?,
                title = COALESCE(title, ?),
                description = COALESCE(description, ?)
            WHERE id = ?
        "#,
        )
        .bind(update.status.map(SourceStatus::as_str))
        .bind(&update.last_error)
        .bind(update.last_fetched_at.timestamp())
        .bind(&update.title)
        .bind(&update.description)
        .bind(source_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record refresh for source {source_id}"))?;
        Ok(())
    }

    /// Explicit title edit; overwrites any backfilled title
    pub async fn set_source_title(&self, source_id: i64, title: &str) -> Result<()> {
        sqlx::query("UPDATE sources SET title = ? WHERE id = ?")
            .bind(title)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Administrative status change (e.g. pausing a source with `Inactive`)
    pub async fn set_source_status(&self, source_id: i64, status: SourceStatus) -> Result<()> {
        sqlx::query("UPDATE sources SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
