//! Storage abstraction for Attendance Harness.
//!
//! [`EmbeddingStore`] is the narrow, durable key → vector interface the
//! similarity index rebuilds itself from. [`Store`] extends it with the
//! people and punch operations used by the request-facing services.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Person, PersonChanges, PunchRecord};

/// Durable source of truth for face embeddings.
///
/// Embeddings travel as raw BLOBs (little-endian `f32`); decoding and
/// validation are the reader's concern.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Every `(ident, blob)` pair whose embedding is not null.
    async fn list_embeddings(&self) -> Result<Vec<(String, Vec<u8>)>>;

    /// Persist (overwrite) the embedding of an existing person.
    ///
    /// Fails when no person with `ident` exists.
    async fn write_embedding(&self, ident: &str, blob: &[u8]) -> Result<()>;
}

/// Result of inserting a person.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A person with the same ident already exists; nothing was written.
    Duplicate,
}

/// Full storage backend for people and attendance punches.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_person`](Store::insert_person) | Create a person |
/// | [`update_person`](Store::update_person) | Apply a partial update |
/// | [`delete_person`](Store::delete_person) | Remove a person and their punches |
/// | [`get_person`](Store::get_person) | Look up one person |
/// | [`list_people`](Store::list_people) | All people, most recently updated first |
/// | [`insert_punch`](Store::insert_punch) | Record a punch |
/// | [`set_punch_image_url`](Store::set_punch_image_url) | Attach an uploaded image |
/// | [`get_punch`](Store::get_punch) | Look up one punch |
/// | [`ping`](Store::ping) | Connectivity probe |
#[async_trait]
pub trait Store: EmbeddingStore {
    async fn insert_person(&self, person: &Person) -> Result<InsertOutcome>;

    /// Returns `false` when no person with `ident` exists.
    async fn update_person(
        &self,
        ident: &str,
        changes: &PersonChanges,
        updated_at: &str,
    ) -> Result<bool>;

    /// Returns `false` when no person with `ident` exists.
    async fn delete_person(&self, ident: &str) -> Result<bool>;

    async fn get_person(&self, ident: &str) -> Result<Option<Person>>;

    async fn list_people(&self) -> Result<Vec<Person>>;

    /// Returns the new punch id.
    async fn insert_punch(&self, ident: &str, punch_time: &str) -> Result<i64>;

    async fn set_punch_image_url(&self, id: i64, url: &str) -> Result<()>;

    async fn get_punch(&self, id: i64) -> Result<Option<PunchRecord>>;

    async fn ping(&self) -> Result<()>;
}
