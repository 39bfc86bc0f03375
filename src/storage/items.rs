use anyhow::{Context, Result};

use super::schema::Database;
use super::types::{Item, ItemDbRow, NewItem};

const ITEM_COLUMNS: &str = "id, project_id, source_id, url, guid, title, author, published_at, \
    content_snippet, content_html, created_at, updated_at";

impl Database {
    // ========================================================================
    // Item Operations
    // ========================================================================

    /// Insert or update an item keyed on `(project_id, url)`.
    ///
    /// Two-phase upsert: `INSERT OR IGNORE` first, then `UPDATE` of the
    /// mutable fields when the row already existed. The stored guid is only
    /// filled if it was unset.
    ///
    /// # Returns
    ///
    /// The stored item and whether this call created it.
    pub async fn upsert_item(&self, project_id: i64, item: &NewItem) -> Result<(Item, bool)> {
        let now = chrono::Utc::now().timestamp();
        let published_at = item.published_at.map(|d| d.timestamp());
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO items (
                project_id, source_id, url, guid, title, author, published_at,
                content_snippet, content_html, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(project_id)
        .bind(item.source_id)
        .bind(&item.url)
        .bind(&item.guid)
        .bind(&item.title)
        .bind(&item.author)
        .bind(published_at)
        .bind(&item.content_snippet)
        .bind(&item.content_html)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to insert item {}", item.url))?;
        let inserted = result.rows_affected() > 0;

        if !inserted {
            sqlx::query(
                r#"
                UPDATE items SET
                    title = ?,
                    author = ?,
                    published_at = ?,
                    content_snippet = ?,
                    content_html = ?,
                    guid = COALESCE(guid, ?),
                    updated_at = ?
                WHERE project_id = ? AND url = ?
            "#,
            )
            .bind(&item.title)
            .bind(&item.author)
            .bind(published_at)
            .bind(&item.content_snippet)
            .bind(&item.content_html)
            .bind(&item.guid)
            .bind(now)
            .bind(project_id)
            .bind(&item.url)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to update item {}", item.url))?;
        }

        let row = sqlx::query_as::<_, ItemDbRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE project_id = ? AND url = ?"
        ))
        .bind(project_id)
        .bind(&item.url)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((row.into_item(), inserted))
    }

    /// Most recent items of a project, undated items last
    pub async fn list_items(&self, project_id: i64, limit: i64) -> Result<Vec<Item>> {
        let rows = sqlx::query_as::<_, ItemDbRow>(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM items
            WHERE project_id = ?
            ORDER BY published_at IS NULL, published_at DESC, created_at DESC, id DESC
            LIMIT ?
        "#
        ))
        .bind(project_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ItemDbRow::into_item).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FeedType, NewSource};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    async fn setup() -> (Database, i64, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let project = db.create_project("P", "p").await.unwrap();
        let source_id = db
            .create_source(&NewSource {
                project_id: project.id,
                site_url: "https://example.com".to_owned(),
                feed_url: Some("https://example.com/feed".to_owned()),
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
        (db, project.id, source_id)
    }

    fn item(source_id: i64, url: &str, title: &str) -> NewItem {
        NewItem {
            source_id,
            url: url.to_owned(),
            guid: Some(format!("guid:{url}")),
            title: title.to_owned(),
            author: None,
            published_at: Some(Utc.with_ymd_and_hms(2025, 11, 24, 10, 0, 0).unwrap()),
            content_snippet: Some("snippet".to_owned()),
            content_html: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let (db, project_id, source_id) = setup().await;

        let (first, created) = db
            .upsert_item(project_id, &item(source_id, "https://example.com/a", "Old"))
            .await
            .unwrap();
        assert!(created);

        let mut changed = item(source_id, "https://example.com/a", "New");
        changed.author = Some("Jane".to_owned());
        let (second, created) = db.upsert_item(project_id, &changed).await.unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.title, "New");
        assert_eq!(second.author.as_deref(), Some("Jane"));
        assert_eq!(second.created_at, first.created_at);

        assert_eq!(db.list_items(project_id, 100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_url_in_other_project_is_distinct() {
        let (db, project_id, source_id) = setup().await;
        let other = db.create_project("Other", "other").await.unwrap();

        let url = "https://example.com/shared";
        let (_, a) = db.upsert_item(project_id, &item(source_id, url, "T")).await.unwrap();
        let (_, b) = db.upsert_item(other.id, &item(source_id, url, "T")).await.unwrap();
        assert!(a && b);
    }

    #[tokio::test]
    async fn test_list_items_orders_undated_last() {
        let (db, project_id, source_id) = setup().await;

        let mut undated = item(source_id, "https://example.com/undated", "Undated");
        undated.published_at = None;
        db.upsert_item(project_id, &undated).await.unwrap();

        let mut older = item(source_id, "https://example.com/older", "Older");
        older.published_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        db.upsert_item(project_id, &older).await.unwrap();
        db.upsert_item(project_id, &item(source_id, "https://example.com/newer", "Newer"))
            .await
            .unwrap();

        let titles: Vec<_> = db
            .list_items(project_id, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.title)
            .collect();
        assert_eq!(titles, vec!["Newer", "Older", "Undated"]);

        assert_eq!(db.list_items(project_id, 1).await.unwrap().len(), 1);
    }
}
