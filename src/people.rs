//! People registry: create, update, delete, and lookups.
//!
//! Every mutation writes the store first and then brings the index in line.
//! Creating a person also mirrors a personnel row to the spreadsheet in the
//! background as task `sheets_personnel_{ident}`.

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use attendance_core::models::{Person, PersonChanges};
use attendance_core::store::InsertOutcome;
use attendance_core::vector::{is_finite, vec_to_blob};

use crate::app::AppContext;
use crate::error::{ServiceError, ServiceResult};
use crate::face::decode_image_base64;
use crate::index::IndexMutation;
use crate::recognition::single_face;
use crate::retry::with_retry;
use crate::sheets::{personnel_row, SheetTab};

/// Body of `POST /api/people` and `PUT /api/people/{ident}`.
///
/// The embedding comes from `face_embedding` when given, otherwise from the
/// single face in `face_photo_base64`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PersonPayload {
    #[serde(default)]
    pub ident: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub face_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub face_photo_base64: Option<String>,
}

/// Person as returned by the API.
#[derive(Debug, Clone, Serialize)]
pub struct PersonView {
    pub ident: String,
    pub time_zone: String,
    pub created_at: String,
    pub updated_at: String,
    pub has_face_embedding: bool,
    /// Base64 of the stored embedding bytes; single-person lookups only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_embedding: Option<String>,
}

impl PersonView {
    fn summary(person: &Person) -> Self {
        Self {
            ident: person.ident.clone(),
            time_zone: person.time_zone.clone(),
            created_at: person.created_at.clone(),
            updated_at: person.updated_at.clone(),
            has_face_embedding: person.has_embedding(),
            face_embedding: None,
        }
    }

    fn detailed(person: &Person) -> Self {
        Self {
            face_embedding: person
                .face_embedding
                .as_ref()
                .map(|blob| base64::engine::general_purpose::STANDARD.encode(blob)),
            ..Self::summary(person)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonWrite {
    pub ident: String,
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexMutation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_task: Option<String>,
}

pub async fn list(ctx: &AppContext) -> ServiceResult<Vec<PersonView>> {
    let people = ctx.store.list_people().await?;
    Ok(people.iter().map(PersonView::summary).collect())
}

pub async fn get(ctx: &AppContext, ident: &str) -> ServiceResult<PersonView> {
    ctx.store
        .get_person(ident)
        .await?
        .map(|p| PersonView::detailed(&p))
        .ok_or_else(|| ServiceError::not_found("Person not found"))
}

/// Resolve the embedding a payload carries, if any.
async fn payload_embedding(
    ctx: &AppContext,
    payload: &PersonPayload,
) -> ServiceResult<Option<Vec<f32>>> {
    if let Some(embedding) = &payload.face_embedding {
        if embedding.is_empty() || !is_finite(embedding) {
            return Err(ServiceError::bad_request(
                "face_embedding must be a non-empty array of finite numbers",
            ));
        }
        return Ok(Some(embedding.clone()));
    }

    let Some(photo) = payload.face_photo_base64.as_deref() else {
        return Ok(None);
    };
    let image = decode_image_base64(photo)
        .map_err(|e| ServiceError::bad_request(format!("Failed to process face photo: {}", e)))?;
    let faces = ctx.extractor.extract(&image).await?;
    single_face(faces).map(Some)
}

/// Register a new person.
pub async fn create(ctx: &AppContext, payload: PersonPayload) -> ServiceResult<PersonWrite> {
    let ident = payload
        .ident
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if ident.is_empty() {
        return Err(ServiceError::bad_request("ident is required"));
    }

    let embedding = payload_embedding(ctx, &payload).await?;
    let time_zone = payload
        .time_zone
        .clone()
        .filter(|tz| !tz.trim().is_empty())
        .unwrap_or_else(|| ctx.config.attendance.default_time_zone.clone());
    let now = ctx.now_iso();

    let person = Person {
        ident: ident.clone(),
        face_embedding: embedding.as_deref().map(vec_to_blob),
        time_zone: time_zone.clone(),
        created_at: now.clone(),
        updated_at: now,
    };
    if ctx.store.insert_person(&person).await? == InsertOutcome::Duplicate {
        return Err(ServiceError::conflict(format!(
            "Creation failed: Person with ident '{}' already exists",
            ident
        )));
    }

    let index = match &embedding {
        Some(embedding) => Some(ctx.index.add_embedding(&ident, embedding).await),
        None => None,
    };
    info!(%ident, with_embedding = embedding.is_some(), "person created");

    let background_task = submit_personnel_sync(ctx, &ident, &time_zone);

    Ok(PersonWrite {
        ident,
        created: true,
        index,
        background_task,
    })
}

fn submit_personnel_sync(ctx: &AppContext, ident: &str, time_zone: &str) -> Option<String> {
    let sheets = ctx.sheets.clone();
    let policy = ctx.retry_policy();
    let row = personnel_row(ident, time_zone);
    let label = format!("personnel append for {}", ident);

    let submitted = ctx.executor.submit(&format!("sheets_personnel_{}", ident), move || async move {
        let appended = with_retry(&policy, &label, || {
            sheets.append(SheetTab::Personnel, row.clone())
        })
        .await?;
        Ok::<_, anyhow::Error>(serde_json::to_value(appended)?)
    });

    match submitted {
        Ok(task_id) => Some(task_id),
        Err(e) => {
            error!(%ident, error = %e, "failed to submit personnel sync task");
            None
        }
    }
}

/// Apply a partial update to an existing person.
pub async fn update(
    ctx: &AppContext,
    ident: &str,
    payload: PersonPayload,
) -> ServiceResult<PersonWrite> {
    let embedding = payload_embedding(ctx, &payload).await?;
    let changes = PersonChanges {
        face_embedding: embedding.as_deref().map(vec_to_blob),
        time_zone: payload.time_zone.clone().filter(|tz| !tz.trim().is_empty()),
    };

    if changes.is_empty() {
        return match ctx.store.get_person(ident).await? {
            Some(_) => Ok(PersonWrite {
                ident: ident.to_string(),
                created: false,
                index: None,
                background_task: None,
            }),
            None => Err(ServiceError::not_found("Person not found")),
        };
    }

    if !ctx
        .store
        .update_person(ident, &changes, &ctx.now_iso())
        .await?
    {
        return Err(ServiceError::not_found("Person not found"));
    }

    let index = match &embedding {
        Some(embedding) => Some(ctx.index.update_embedding(ident, embedding).await),
        None => None,
    };
    info!(%ident, embedding_changed = embedding.is_some(), "person updated");

    Ok(PersonWrite {
        ident: ident.to_string(),
        created: false,
        index,
        background_task: None,
    })
}

/// Update `ident` if it exists, otherwise create it under that ident.
pub async fn upsert(
    ctx: &AppContext,
    ident: &str,
    mut payload: PersonPayload,
) -> ServiceResult<PersonWrite> {
    if ctx.store.get_person(ident).await?.is_some() {
        update(ctx, ident, payload).await
    } else {
        payload.ident = Some(ident.to_string());
        create(ctx, payload).await
    }
}

/// Delete a person and their punches, then drop them from the index.
pub async fn delete(ctx: &AppContext, ident: &str) -> ServiceResult<IndexMutation> {
    if !ctx.store.delete_person(ident).await? {
        return Err(ServiceError::not_found("Person not found"));
    }
    let index = ctx.index.remove_embedding(ident).await;
    info!(%ident, ?index, "person deleted");
    Ok(index)
}
