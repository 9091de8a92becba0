//! In-memory [`Store`] implementation for tests and embedded use.
//!
//! People live in a `BTreeMap` keyed by ident (so listings are
//! deterministic) and punches in a `Vec`, both behind `parking_lot`
//! locks.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::models::{Person, PersonChanges, PunchRecord};

use super::{EmbeddingStore, InsertOutcome, Store};

#[derive(Default)]
struct Punches {
    rows: Vec<PunchRecord>,
    next_id: i64,
}

/// In-memory store for testing.
#[derive(Default)]
pub struct InMemoryStore {
    people: RwLock<BTreeMap<String, Person>>,
    punches: RwLock<Punches>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored punches.
    pub fn punch_count(&self) -> usize {
        self.punches.read().rows.len()
    }
}

#[async_trait]
impl EmbeddingStore for InMemoryStore {
    async fn list_embeddings(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let people = self.people.read();
        Ok(people
            .values()
            .filter_map(|p| {
                p.face_embedding
                    .as_ref()
                    .map(|blob| (p.ident.clone(), blob.clone()))
            })
            .collect())
    }

    async fn write_embedding(&self, ident: &str, blob: &[u8]) -> Result<()> {
        let mut people = self.people.write();
        match people.get_mut(ident) {
            Some(person) => {
                person.face_embedding = Some(blob.to_vec());
                Ok(())
            }
            None => bail!("person '{}' not found", ident),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_person(&self, person: &Person) -> Result<InsertOutcome> {
        let mut people = self.people.write();
        if people.contains_key(&person.ident) {
            return Ok(InsertOutcome::Duplicate);
        }
        people.insert(person.ident.clone(), person.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn update_person(
        &self,
        ident: &str,
        changes: &PersonChanges,
        updated_at: &str,
    ) -> Result<bool> {
        let mut people = self.people.write();
        let Some(person) = people.get_mut(ident) else {
            return Ok(false);
        };
        if let Some(blob) = &changes.face_embedding {
            person.face_embedding = Some(blob.clone());
        }
        if let Some(tz) = &changes.time_zone {
            person.time_zone = tz.clone();
        }
        person.updated_at = updated_at.to_string();
        Ok(true)
    }

    async fn delete_person(&self, ident: &str) -> Result<bool> {
        let removed = self.people.write().remove(ident).is_some();
        if removed {
            self.punches.write().rows.retain(|p| p.ident != ident);
        }
        Ok(removed)
    }

    async fn get_person(&self, ident: &str) -> Result<Option<Person>> {
        Ok(self.people.read().get(ident).cloned())
    }

    async fn list_people(&self) -> Result<Vec<Person>> {
        let mut people: Vec<Person> = self.people.read().values().cloned().collect();
        people.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(people)
    }

    async fn insert_punch(&self, ident: &str, punch_time: &str) -> Result<i64> {
        if !self.people.read().contains_key(ident) {
            bail!("person '{}' not found", ident);
        }
        let mut punches = self.punches.write();
        punches.next_id += 1;
        let id = punches.next_id;
        punches.rows.push(PunchRecord {
            id,
            ident: ident.to_string(),
            punch_time: punch_time.to_string(),
            image_url: None,
            created_at: punch_time.to_string(),
        });
        Ok(id)
    }

    async fn set_punch_image_url(&self, id: i64, url: &str) -> Result<()> {
        let mut punches = self.punches.write();
        match punches.rows.iter_mut().find(|p| p.id == id) {
            Some(punch) => {
                punch.image_url = Some(url.to_string());
                Ok(())
            }
            None => bail!("punch {} not found", id),
        }
    }

    async fn get_punch(&self, id: i64) -> Result<Option<PunchRecord>> {
        Ok(self.punches.read().rows.iter().find(|p| p.id == id).cloned())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(ident: &str, blob: Option<Vec<u8>>) -> Person {
        Person {
            ident: ident.to_string(),
            face_embedding: blob,
            time_zone: "Asia/Taipei".to_string(),
            created_at: "2026-01-01T08:00:00+08:00".to_string(),
            updated_at: "2026-01-01T08:00:00+08:00".to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_reported() {
        let store = InMemoryStore::new();
        assert_eq!(
            store.insert_person(&person("a", None)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_person(&person("a", None)).await.unwrap(),
            InsertOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_list_embeddings_skips_null() {
        let store = InMemoryStore::new();
        store.insert_person(&person("a", Some(vec![0, 0, 128, 63]))).await.unwrap();
        store.insert_person(&person("b", None)).await.unwrap();

        let rows = store.list_embeddings().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "a");
    }

    #[tokio::test]
    async fn test_write_embedding_requires_person() {
        let store = InMemoryStore::new();
        assert!(store.write_embedding("ghost", &[0, 0, 0, 0]).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_cascades_punches() {
        let store = InMemoryStore::new();
        store.insert_person(&person("a", None)).await.unwrap();
        let id = store.insert_punch("a", "2026-01-01T09:00:00+08:00").await.unwrap();
        store.set_punch_image_url(id, "https://img").await.unwrap();
        assert_eq!(
            store.get_punch(id).await.unwrap().unwrap().image_url.as_deref(),
            Some("https://img")
        );

        assert!(store.delete_person("a").await.unwrap());
        assert_eq!(store.punch_count(), 0);
        assert!(!store.delete_person("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_missing_person() {
        let store = InMemoryStore::new();
        let changes = PersonChanges {
            time_zone: Some("UTC".to_string()),
            ..Default::default()
        };
        assert!(!store.update_person("nobody", &changes, "now").await.unwrap());
    }
}
