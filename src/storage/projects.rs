use anyhow::{Context, Result};

use super::schema::Database;
use super::types::{Project, ProjectDbRow};

impl Database {
    // ========================================================================
    // Project Operations
    // ========================================================================

    /// Create a project. Slugs are unique.
    ///
    /// # Errors
    ///
    /// Fails if `slug` is already taken.
    pub async fn create_project(&self, name: &str, slug: &str) -> Result<Project> {
        let now = chrono::Utc::now().timestamp();
        let row = sqlx::query_as::<_, ProjectDbRow>(
            r#"
            INSERT INTO projects (name, slug, created_at)
            VALUES (?, ?, ?)
            RETURNING id, name, slug, created_at
        "#,
        )
        .bind(name)
        .bind(slug)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to create project {slug:?}"))?;

        Ok(row.into_project())
    }

    pub async fn find_project(&self, project_id: i64) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectDbRow>(
            "SELECT id, name, slug, created_at FROM projects WHERE id = ?",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ProjectDbRow::into_project))
    }

    pub async fn find_project_by_slug(&self, slug: &str) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectDbRow>(
            "SELECT id, name, slug, created_at FROM projects WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ProjectDbRow::into_project))
    }

    /// All projects, oldest first
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectDbRow>(
            "SELECT id, name, slug, created_at FROM projects ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ProjectDbRow::into_project).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_find_project() {
        let db = Database::open(":memory:").await.unwrap();
        let project = db.create_project("Tech News", "tech").await.unwrap();

        assert_eq!(project.name, "Tech News");
        assert_eq!(project.slug, "tech");
        assert_eq!(db.find_project(project.id).await.unwrap(), Some(project.clone()));
        assert_eq!(db.find_project_by_slug("tech").await.unwrap(), Some(project));
        assert_eq!(db.find_project(9999).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_slug_rejected() {
        let db = Database::open(":memory:").await.unwrap();
        db.create_project("One", "same").await.unwrap();
        let err = db.create_project("Two", "same").await.unwrap_err();
        assert!(err.to_string().contains("same"));
    }

    #[tokio::test]
    async fn test_list_projects_in_creation_order() {
        let db = Database::open(":memory:").await.unwrap();
        db.create_project("B", "b").await.unwrap();
        db.create_project("A", "a").await.unwrap();

        let slugs: Vec<_> = db
            .list_projects()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.slug)
            .collect();
        assert_eq!(slugs, vec!["b", "a"]);
    }
}
