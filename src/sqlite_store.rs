//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation to SQL against the `people` and
//! `attendance` tables created by [`crate::migrate`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use attendance_core::models::{Person, PersonChanges, PunchRecord};
use attendance_core::store::{EmbeddingStore, InsertOutcome, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn person_from_row(row: &SqliteRow) -> Person {
    Person {
        ident: row.get("ident"),
        face_embedding: row.get("face_embedding"),
        time_zone: row.get("time_zone"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn punch_from_row(row: &SqliteRow) -> PunchRecord {
    PunchRecord {
        id: row.get("id"),
        ident: row.get("ident"),
        punch_time: row.get("punch_time"),
        image_url: row.get("image_url"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl EmbeddingStore for SqliteStore {
    async fn list_embeddings(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query(
            "SELECT ident, face_embedding FROM people WHERE face_embedding IS NOT NULL ORDER BY created_at, ident",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("ident"), row.get("face_embedding")))
            .collect())
    }

    async fn write_embedding(&self, ident: &str, blob: &[u8]) -> Result<()> {
        let updated_at = chrono::Utc::now().to_rfc3339();
        let result =
            sqlx::query("UPDATE people SET face_embedding = ?, updated_at = ? WHERE ident = ?")
                .bind(blob)
                .bind(&updated_at)
                .bind(ident)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            bail!("person '{}' not found", ident);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_person(&self, person: &Person) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO people (ident, face_embedding, time_zone, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(ident) DO NOTHING
            "#,
        )
        .bind(&person.ident)
        .bind(&person.face_embedding)
        .bind(&person.time_zone)
        .bind(&person.created_at)
        .bind(&person.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn update_person(
        &self,
        ident: &str,
        changes: &PersonChanges,
        updated_at: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE people SET
                face_embedding = COALESCE(?, face_embedding),
                time_zone = COALESCE(?, time_zone),
                updated_at = ?
            WHERE ident = ?
            "#,
        )
        .bind(&changes.face_embedding)
        .bind(&changes.time_zone)
        .bind(updated_at)
        .bind(ident)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_person(&self, ident: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM people WHERE ident = ?")
            .bind(ident)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_person(&self, ident: &str) -> Result<Option<Person>> {
        let row = sqlx::query(
            "SELECT ident, face_embedding, time_zone, created_at, updated_at FROM people WHERE ident = ?",
        )
        .bind(ident)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(person_from_row))
    }

    async fn list_people(&self) -> Result<Vec<Person>> {
        let rows = sqlx::query(
            "SELECT ident, face_embedding, time_zone, created_at, updated_at FROM people ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(person_from_row).collect())
    }

    async fn insert_punch(&self, ident: &str, punch_time: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO attendance (ident, punch_time, image_url, created_at) VALUES (?, ?, NULL, ?)",
        )
        .bind(ident)
        .bind(punch_time)
        .bind(punch_time)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn set_punch_image_url(&self, id: i64, url: &str) -> Result<()> {
        let result = sqlx::query("UPDATE attendance SET image_url = ? WHERE id = ?")
            .bind(url)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("punch {} not found", id);
        }
        Ok(())
    }

    async fn get_punch(&self, id: i64) -> Result<Option<PunchRecord>> {
        let row = sqlx::query(
            "SELECT id, ident, punch_time, image_url, created_at FROM attendance WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(punch_from_row))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .unwrap();
        crate::migrate::create_schema(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn person(ident: &str, blob: Option<Vec<u8>>) -> Person {
        Person {
            ident: ident.to_string(),
            face_embedding: blob,
            time_zone: "Asia/Taipei".to_string(),
            created_at: format!("2026-01-01T08:00:0{}+08:00", ident.len()),
            updated_at: "2026-01-01T08:00:00+08:00".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_duplicate() {
        let store = memory_store().await;
        assert_eq!(
            store.insert_person(&person("s001", None)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_person(&person("s001", None)).await.unwrap(),
            InsertOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_embedding_roundtrip_through_people() {
        let store = memory_store().await;
        store.insert_person(&person("a", None)).await.unwrap();
        store.insert_person(&person("bb", None)).await.unwrap();
        assert!(store.list_embeddings().await.unwrap().is_empty());

        let blob = attendance_core::vector::vec_to_blob(&[1.0, 0.0]);
        store.write_embedding("a", &blob).await.unwrap();

        let rows = store.list_embeddings().await.unwrap();
        assert_eq!(rows, vec![("a".to_string(), blob)]);
        assert!(store.write_embedding("ghost", &[0, 0, 0, 0]).await.is_err());
    }

    #[tokio::test]
    async fn test_update_keeps_unspecified_columns() {
        let store = memory_store().await;
        let blob = attendance_core::vector::vec_to_blob(&[0.5, 0.5]);
        store
            .insert_person(&person("a", Some(blob.clone())))
            .await
            .unwrap();

        let changes = PersonChanges {
            time_zone: Some("UTC".to_string()),
            ..Default::default()
        };
        assert!(store.update_person("a", &changes, "later").await.unwrap());

        let stored = store.get_person("a").await.unwrap().unwrap();
        assert_eq!(stored.time_zone, "UTC");
        assert_eq!(stored.face_embedding, Some(blob));
        assert_eq!(stored.updated_at, "later");
        assert!(!store.update_person("zz", &changes, "later").await.unwrap());
    }

    #[tokio::test]
    async fn test_punch_lifecycle_and_cascade() {
        let store = memory_store().await;
        store.insert_person(&person("a", None)).await.unwrap();

        let id = store
            .insert_punch("a", "2026-01-01T09:00:00+08:00")
            .await
            .unwrap();
        store.set_punch_image_url(id, "https://img/1.jpg").await.unwrap();
        let punch = store.get_punch(id).await.unwrap().unwrap();
        assert_eq!(punch.image_url.as_deref(), Some("https://img/1.jpg"));

        assert!(store.delete_person("a").await.unwrap());
        assert!(store.get_punch(id).await.unwrap().is_none());
        assert!(!store.delete_person("a").await.unwrap());
    }
}
