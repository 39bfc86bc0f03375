use anyhow::{Context, Result};

use super::schema::Database;
use super::types::{
    DeliveryDbRow, DeliveryResult, DeliveryStatus, Webhook, WebhookDbRow, WebhookDelivery,
    WebhookEvent,
};

impl Database {
    // ========================================================================
    // Webhook Operations
    // ========================================================================

    /// Register a webhook for a project and return its id.
    ///
    /// An empty secret is stored as no secret (deliveries go unsigned).
    pub async fn create_webhook(
        &self,
        project_id: i64,
        url: &str,
        secret: Option<&str>,
        events: &[WebhookEvent],
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let mut names: Vec<&str> = events.iter().map(|e| e.as_str()).collect();
        names.sort_unstable();
        names.dedup();

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO webhooks (project_id, url, secret, events, active, created_at)
            VALUES (?, ?, ?, ?, 1, ?)
            RETURNING id
        "#,
        )
        .bind(project_id)
        .bind(url)
        .bind(secret.filter(|s| !s.is_empty()))
        .bind(names.join(","))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to create webhook for project {project_id}"))?;

        Ok(id)
    }

    /// Active webhooks of a project subscribed to `event`
    pub async fn find_active_webhooks(
        &self,
        project_id: i64,
        event: WebhookEvent,
    ) -> Result<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, WebhookDbRow>(
            r#"
            SELECT id, project_id, url, secret, events, active, created_at
            FROM webhooks
            WHERE project_id = ? AND active = 1
            ORDER BY id
        "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let mut webhooks = Vec::with_capacity(rows.len());
        for row in rows {
            let webhook = row.into_webhook()?;
            if webhook.subscribes_to(event) {
                webhooks.push(webhook);
            }
        }
        Ok(webhooks)
    }

    /// Enable or disable a webhook without deleting its delivery log
    pub async fn set_webhook_active(&self, webhook_id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE webhooks SET active = ? WHERE id = ?")
            .bind(active)
            .bind(webhook_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Delivery Log
    // ========================================================================

    /// Append a `PENDING` delivery record before the HTTP attempt
    pub async fn create_delivery(
        &self,
        webhook_id: i64,
        event: WebhookEvent,
        payload: &str,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO webhook_deliveries (webhook_id, event, payload, status, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(webhook_id)
        .bind(event.as_str())
        .bind(payload)
        .bind(DeliveryStatus::Pending.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to record delivery for webhook {webhook_id}"))?;

        Ok(id)
    }

    /// Write the final state of a delivery attempt
    pub async fn complete_delivery(&self, delivery_id: i64, result: &DeliveryResult) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE webhook_deliveries SET
                status = ?,
                status_code = ?,
                response_body = ?,
                error = ?,
                completed_at = ?
            WHERE id = ?
        "#,
        )
        .bind(result.status.as_str())
        .bind(result.status_code.map(i64::from))
        .bind(&result.response_body)
        .bind(&result.error)
        .bind(now)
        .bind(delivery_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to complete delivery {delivery_id}"))?;
        Ok(())
    }

    /// Most recent deliveries across all webhooks of a project
    pub async fn list_deliveries(&self, project_id: i64, limit: i64) -> Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, DeliveryDbRow>(
            r#"
            SELECT d.id, d.webhook_id, d.event, d.payload, d.status, d.status_code,
                   d.response_body, d.error, d.created_at, d.completed_at
            FROM webhook_deliveries d
            JOIN webhooks w ON w.id = d.webhook_id
            WHERE w.project_id = ?
            ORDER BY d.created_at DESC, d.id DESC
            LIMIT ?
        "#,
        )
        .bind(project_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_delivery().map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn test_find_active_webhooks_filters_event_and_state() {
        let db = Database::open(":memory:").await.unwrap();
        let project = db.create_project("P", "p").await.unwrap();

        let both = db
            .create_webhook(
                project.id,
                "https://hooks.example.com/both",
                Some("s3cret"),
                &[WebhookEvent::NewItems, WebhookEvent::SourceRefresh],
            )
            .await
            .unwrap();
        db.create_webhook(
            project.id,
            "https://hooks.example.com/refresh",
            None,
            &[WebhookEvent::SourceRefresh],
        )
        .await
        .unwrap();
        let disabled = db
            .create_webhook(
                project.id,
                "https://hooks.example.com/off",
                None,
                &[WebhookEvent::NewItems],
            )
            .await
            .unwrap();
        db.set_webhook_active(disabled, false).await.unwrap();

        let hooks = db
            .find_active_webhooks(project.id, WebhookEvent::NewItems)
            .await
            .unwrap();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].id, both);
        assert_eq!(
            hooks[0].secret.as_ref().map(|s| s.expose_secret().to_owned()),
            Some("s3cret".to_owned())
        );

        let hooks = db
            .find_active_webhooks(project.id, WebhookEvent::SourceRefresh)
            .await
            .unwrap();
        assert_eq!(hooks.len(), 2);
    }

    #[tokio::test]
    async fn test_delivery_lifecycle() {
        let db = Database::open(":memory:").await.unwrap();
        let project = db.create_project("P", "p").await.unwrap();
        let webhook_id = db
            .create_webhook(project.id, "https://hooks.example.com", None, &[WebhookEvent::NewItems])
            .await
            .unwrap();

        let id = db
            .create_delivery(webhook_id, WebhookEvent::NewItems, "{\"event\":\"new_items\"}")
            .await
            .unwrap();
        let pending = db.list_deliveries(project.id, 10).await.unwrap();
        assert_eq!(pending[0].status, DeliveryStatus::Pending);
        assert_eq!(pending[0].completed_at, None);

        db.complete_delivery(
            id,
            &DeliveryResult {
                status: DeliveryStatus::Failed,
                status_code: Some(500),
                response_body: Some("boom".to_owned()),
                error: None,
            },
        )
        .await
        .unwrap();

        let done = db.list_deliveries(project.id, 10).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, DeliveryStatus::Failed);
        assert_eq!(done[0].status_code, Some(500));
        assert_eq!(done[0].response_body.as_deref(), Some("boom"));
        assert_eq!(done[0].event, WebhookEvent::NewItems);
        assert!(done[0].completed_at.is_some());
    }
}
