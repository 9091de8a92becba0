//! Face embedding extraction.
//!
//! Detection and feature extraction are delegated to an external model
//! server; this module only defines the [`FaceExtractor`] seam and its
//! implementations:
//! - **[`DisabledExtractor`]**: always fails; used when `face.provider = "disabled"`.
//! - **[`HttpExtractor`]**: posts the image to a DeepFace-style `represent`
//!   endpoint and reads back one embedding per detected face.
//!
//! Use [`create_extractor`] to pick the implementation from config.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use thiserror::Error;

use crate::config::FaceConfig;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The image was readable but contained no usable face.
    #[error("no face detected: {0}")]
    NoFace(String),

    /// The extraction backend failed or could not be reached.
    #[error("face extraction failed: {0}")]
    Backend(String),
}

/// Opaque `image -> embeddings` collaborator.
#[async_trait]
pub trait FaceExtractor: Send + Sync {
    /// Label reported alongside verification results.
    fn model_name(&self) -> &str;

    /// One embedding per detected face, most prominent face first. An empty
    /// detection is reported as [`ExtractError::NoFace`], never as `Ok(vec![])`.
    async fn extract(&self, image: &[u8]) -> std::result::Result<Vec<Vec<f32>>, ExtractError>;
}

// ============ Disabled ============

pub struct DisabledExtractor;

#[async_trait]
impl FaceExtractor for DisabledExtractor {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn extract(&self, _image: &[u8]) -> std::result::Result<Vec<Vec<f32>>, ExtractError> {
        Err(ExtractError::Backend(
            "face extraction is disabled (set face.provider)".to_string(),
        ))
    }
}

// ============ HTTP ============

/// Extractor backed by a DeepFace-compatible HTTP service.
///
/// Sends `POST {endpoint}` with `{"model_name", "img"}` where `img` is a
/// JPEG data URL, and expects `{"results": [{"embedding": [..]}, ..]}`.
/// A 400/422 answer means the service found no face in the image.
pub struct HttpExtractor {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpExtractor {
    pub fn new(config: &FaceConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| anyhow::anyhow!("face.endpoint required for http provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl FaceExtractor for HttpExtractor {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn extract(&self, image: &[u8]) -> std::result::Result<Vec<Vec<f32>>, ExtractError> {
        let body = serde_json::json!({
            "model_name": self.model,
            "img": format!(
                "data:image/jpeg;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(image)
            ),
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ExtractError::Backend(format!(
                    "face service unreachable at {}: {}",
                    self.endpoint, e
                ))
            })?;

        let status = response.status();
        if status.as_u16() == 400 || status.as_u16() == 422 {
            let text = response.text().await.unwrap_or_default();
            return Err(ExtractError::NoFace(text));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExtractError::Backend(format!(
                "face service error {}: {}",
                status, text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ExtractError::Backend(format!("invalid face service response: {}", e)))?;
        let faces = parse_represent_response(&json).map_err(|e| ExtractError::Backend(e.to_string()))?;
        if faces.is_empty() {
            return Err(ExtractError::NoFace("no face detected".to_string()));
        }
        Ok(faces)
    }
}

/// Extract `results[].embedding` from a represent response.
fn parse_represent_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let results = json
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid face response: missing results array"))?;

    let mut faces = Vec::with_capacity(results.len());
    for item in results {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid face response: missing embedding"))?;
        let vec = embedding
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| anyhow::anyhow!("Invalid face response: non-numeric embedding"))
            })
            .collect::<Result<Vec<f32>>>()?;
        faces.push(vec);
    }
    Ok(faces)
}

/// Instantiate the extractor named by `face.provider`.
pub fn create_extractor(config: &FaceConfig) -> Result<Box<dyn FaceExtractor>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledExtractor)),
        "http" => Ok(Box::new(HttpExtractor::new(config)?)),
        other => bail!("Unknown face provider: {}", other),
    }
}

/// Decode a base64 image, accepting an optional `data:...;base64,` prefix.
pub fn decode_image_base64(encoded: &str) -> Result<Vec<u8>> {
    let payload = match encoded.split_once(',') {
        Some((_, data)) => data,
        None => encoded,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .context("image_base64 is not valid base64")?;
    if bytes.is_empty() {
        bail!("image_base64 decoded to an empty image");
    }
    Ok(bytes)
}
