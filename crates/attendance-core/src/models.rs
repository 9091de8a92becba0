//! Core data models shared by the store, the index, and the services.

use serde::Serialize;

/// Time zone recorded for people created without one.
pub const DEFAULT_TIME_ZONE: &str = "Asia/Taipei";

/// A person known to the attendance system.
///
/// `face_embedding` holds the raw little-endian `f32` BLOB exactly as it is
/// persisted; the index decodes and normalizes it on build.
#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub ident: String,
    pub face_embedding: Option<Vec<u8>>,
    pub time_zone: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Person {
    pub fn has_embedding(&self) -> bool {
        self.face_embedding.is_some()
    }
}

/// Partial update applied to an existing [`Person`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersonChanges {
    pub face_embedding: Option<Vec<u8>>,
    pub time_zone: Option<String>,
}

impl PersonChanges {
    pub fn is_empty(&self) -> bool {
        self.face_embedding.is_none() && self.time_zone.is_none()
    }
}

/// A recorded attendance punch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PunchRecord {
    pub id: i64,
    pub ident: String,
    pub punch_time: String,
    pub image_url: Option<String>,
    pub created_at: String,
}

/// One nearest-neighbor hit from the similarity index.
///
/// `score` is the cosine similarity between the query and the stored
/// embedding, in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub ident: String,
    pub score: f32,
}
