//! Face verification and enrollment.
//!
//! Verification is read-only against the [`VectorIndex`]; enrollment writes
//! the raw embedding to the store first and only then mutates the index, so
//! the index never holds a vector the store does not.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use attendance_core::models::Match;
use attendance_core::store::Store;
use attendance_core::vector::{is_finite, vec_to_blob};

use crate::error::{ServiceError, ServiceResult};
use crate::face::FaceExtractor;
use crate::index::{IndexMutation, VectorIndex};

#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    /// Best candidate, present only when it clears the threshold.
    #[serde(rename = "match")]
    pub matched: Option<Match>,
    pub top_matches: Vec<Match>,
    pub face_count: usize,
    pub used_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ident: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    pub ident: String,
    pub face_count: usize,
    /// Whether an existing embedding was replaced.
    pub overwritten: bool,
    pub used_model: String,
    pub index: IndexMutation,
}

pub struct RecognitionService {
    store: Arc<dyn Store>,
    index: Arc<VectorIndex>,
    extractor: Arc<dyn FaceExtractor>,
}

impl RecognitionService {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<VectorIndex>,
        extractor: Arc<dyn FaceExtractor>,
    ) -> Self {
        Self {
            store,
            index,
            extractor,
        }
    }

    /// Identify the first face in `image`.
    ///
    /// Candidates are returned whatever their score; `matched` is set only
    /// when the best one scores at least `threshold`.
    pub async fn verify(
        &self,
        image: &[u8],
        threshold: f32,
        top_k: usize,
    ) -> ServiceResult<Verification> {
        if !threshold.is_finite() {
            return Err(ServiceError::bad_request("threshold must be a finite number"));
        }
        if top_k == 0 {
            return Err(ServiceError::bad_request("top_k must be >= 1"));
        }

        let faces = self.extractor.extract(image).await?;
        let Some(embedding) = faces.first() else {
            return Err(ServiceError::bad_request("No face detected"));
        };

        let top_matches = self.index.search(embedding, top_k).await;
        let matched = top_matches
            .first()
            .filter(|best| best.score >= threshold)
            .cloned();

        Ok(Verification {
            ident: matched.as_ref().map(|m| m.ident.clone()),
            score: matched.as_ref().map(|m| m.score),
            matched,
            top_matches,
            face_count: faces.len(),
            used_model: format!("{} + cosine index", self.extractor.model_name()),
        })
    }

    /// Attach the single face in `image` to an existing person.
    pub async fn enroll(
        &self,
        image: &[u8],
        ident: &str,
        overwrite: bool,
    ) -> ServiceResult<Enrollment> {
        let ident = ident.trim();
        if ident.is_empty() {
            return Err(ServiceError::bad_request("ident is required"));
        }

        let person = self
            .store
            .get_person(ident)
            .await?
            .ok_or_else(|| ServiceError::not_found("Person with this ident not found"))?;
        let had_embedding = person.has_embedding();
        if had_embedding && !overwrite {
            return Err(ServiceError::conflict(
                "This person already has a face embedding and overwrite=false",
            ));
        }

        let embedding = single_face(self.extractor.extract(image).await?)?;

        self.store
            .write_embedding(ident, &vec_to_blob(&embedding))
            .await?;

        let index = if had_embedding {
            self.index.update_embedding(ident, &embedding).await
        } else {
            self.index.add_embedding(ident, &embedding).await
        };
        info!(%ident, overwritten = had_embedding, ?index, "enrolled face");

        Ok(Enrollment {
            ident: ident.to_string(),
            face_count: 1,
            overwritten: had_embedding,
            used_model: self.extractor.model_name().to_string(),
            index,
        })
    }
}

/// Require exactly one usable face among the extracted embeddings.
pub(crate) fn single_face(mut faces: Vec<Vec<f32>>) -> ServiceResult<Vec<f32>> {
    if faces.len() != 1 {
        return Err(ServiceError::bad_request(format!(
            "Detected {} faces, please ensure only one person in frame",
            faces.len()
        )));
    }
    let embedding = faces.remove(0);
    if embedding.is_empty() || !is_finite(&embedding) {
        return Err(ServiceError::bad_request(
            "Face extraction returned an unusable embedding",
        ));
    }
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_face_rules() {
        assert!(single_face(vec![]).is_err());
        assert!(single_face(vec![vec![1.0], vec![0.5]]).is_err());
        assert!(single_face(vec![vec![f32::NAN, 1.0]]).is_err());
        assert!(single_face(vec![vec![]]).is_err());
        assert_eq!(single_face(vec![vec![0.6, 0.8]]).unwrap(), vec![0.6, 0.8]);
    }
}
