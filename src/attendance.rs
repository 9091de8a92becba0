//! Punch recording.
//!
//! A punch row is written synchronously; photo upload and the spreadsheet
//! mirror happen in a background task whose id is returned to the caller.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use attendance_core::store::Store;

use crate::app::AppContext;
use crate::error::{ServiceError, ServiceResult};
use crate::face::decode_image_base64;
use crate::retry::{with_retry, RetryPolicy};
use crate::sheets::{attendance_row, SheetSink, SheetTab};
use crate::storage::ObjectSink;

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PunchRequest {
    #[serde(default)]
    pub ident: Option<String>,
    #[serde(default)]
    pub image_base64: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PunchReceipt {
    pub ident: String,
    pub punch_time: String,
    pub attendance_id: i64,
    pub message: String,
    pub background_task: Option<String>,
}

/// Decode the optional punch photo. An undecodable photo does not block the
/// punch; it is logged and the punch proceeds without one.
pub fn punch_image(request: &PunchRequest) -> Option<Vec<u8>> {
    let encoded = request.image_base64.as_deref()?;
    match decode_image_base64(encoded) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(error = %e, "ignoring unreadable punch image");
            None
        }
    }
}

/// Record a punch for `ident` now.
pub async fn punch(
    ctx: &AppContext,
    ident: &str,
    image: Option<Vec<u8>>,
) -> ServiceResult<PunchReceipt> {
    let ident = ident.trim();
    if ident.is_empty() {
        return Err(ServiceError::bad_request("ident is required"));
    }
    if ctx.store.get_person(ident).await?.is_none() {
        return Err(ServiceError::not_found("Person with this ident not found"));
    }

    let punch_time = ctx.now_iso();
    let attendance_id = ctx.store.insert_punch(ident, &punch_time).await?;
    info!(%ident, attendance_id, with_image = image.is_some(), "punch recorded");

    let submitted = match image {
        Some(image) => {
            let job = UploadJob {
                store: ctx.store.clone(),
                objects: ctx.objects.clone(),
                sheets: ctx.sheets.clone(),
                policy: ctx.retry_policy(),
                ident: ident.to_string(),
                punch_time: punch_time.clone(),
                attendance_id,
                image,
            };
            ctx.executor
                .submit(&format!("attendance_upload_{}", ident), move || job.run())
        }
        None => {
            let sheets = ctx.sheets.clone();
            let policy = ctx.retry_policy();
            let row = attendance_row(&punch_time, ident, None);
            let label = format!("attendance append for {}", ident);
            ctx.executor
                .submit(&format!("attendance_sheets_{}", ident), move || async move {
                    let appended = with_retry(&policy, &label, || {
                        sheets.append(SheetTab::Attendance, row.clone())
                    })
                    .await?;
                    Ok::<_, anyhow::Error>(serde_json::to_value(appended)?)
                })
        }
    };

    let background_task = match submitted {
        Ok(task_id) => Some(task_id),
        Err(e) => {
            error!(%ident, attendance_id, error = %e, "failed to submit punch side effects");
            None
        }
    };

    Ok(PunchReceipt {
        ident: ident.to_string(),
        punch_time,
        attendance_id,
        message: "Attendance recorded successfully".to_string(),
        background_task,
    })
}

/// Photo upload, row update, then spreadsheet mirror for one punch.
struct UploadJob {
    store: Arc<dyn Store>,
    objects: Arc<dyn ObjectSink>,
    sheets: Arc<dyn SheetSink>,
    policy: RetryPolicy,
    ident: String,
    punch_time: String,
    attendance_id: i64,
    image: Vec<u8>,
}

impl UploadJob {
    /// Fails if the upload or the row update fails. A spreadsheet failure is
    /// reported in the result instead, since the photo is already stored.
    async fn run(self) -> anyhow::Result<serde_json::Value> {
        let url = with_retry(&self.policy, &format!("image upload for {}", self.ident), || {
            self.objects
                .upload_punch_image(&self.ident, &self.punch_time, &self.image)
        })
        .await?;

        self.store
            .set_punch_image_url(self.attendance_id, &url)
            .await?;

        let row = attendance_row(&self.punch_time, &self.ident, Some(&url));
        let sheets_result = with_retry(
            &self.policy,
            &format!("attendance append for {}", self.ident),
            || self.sheets.append(SheetTab::Attendance, row.clone()),
        )
        .await;

        let sheets_result = match sheets_result {
            Ok(appended) => json!({ "success": true, "append": appended }),
            Err(e) => {
                warn!(ident = %self.ident, error = %e, "spreadsheet append failed after retries");
                json!({ "success": false, "error": e.to_string() })
            }
        };

        Ok(json!({
            "image_url": url,
            "attendance_id": self.attendance_id,
            "sheets_result": sheets_result,
        }))
    }
}
