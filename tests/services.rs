//! End-to-end service flows over an in-memory store with fake collaborators.
//!
//! The fake extractor reads an embedding straight out of the "image" bytes
//! (`face:0.6,0.8`), so tests control exactly what the index sees.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use attendance_core::store::memory::InMemoryStore;
use attendance_core::store::Store;
use attendance_harness::app::AppContext;
use attendance_harness::attendance::{self, PunchRequest};
use attendance_harness::config::Config;
use attendance_harness::error::ServiceError;
use attendance_harness::face::{ExtractError, FaceExtractor};
use attendance_harness::index::IndexMutation;
use attendance_harness::people::{self, PersonPayload};
use attendance_harness::sheets::{SheetAppend, SheetSink, SheetTab};
use attendance_harness::storage::ObjectSink;
use attendance_harness::tasks::{TaskRecord, TaskStatus};

// ============ Fakes ============

struct FakeExtractor;

#[async_trait]
impl FaceExtractor for FakeExtractor {
    fn model_name(&self) -> &str {
        "fake"
    }

    async fn extract(&self, image: &[u8]) -> std::result::Result<Vec<Vec<f32>>, ExtractError> {
        let text = String::from_utf8_lossy(image);
        let Some(values) = text.strip_prefix("face:") else {
            return Err(ExtractError::NoFace("blank image".to_string()));
        };
        Ok(values
            .split(';')
            .map(|face| face.split(',').map(|x| x.parse::<f32>().unwrap()).collect::<Vec<f32>>())
            .collect())
    }
}

#[derive(Default)]
struct RecordingSheets {
    rows: Mutex<Vec<(SheetTab, Vec<String>)>>,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl SheetSink for RecordingSheets {
    async fn append(&self, tab: SheetTab, row: Vec<String>) -> Result<SheetAppend> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("sheet quota exceeded");
        }
        self.rows.lock().push((tab, row));
        Ok(SheetAppend {
            tab: format!("{:?}", tab),
            rows: 1,
            updated_range: None,
        })
    }
}

#[derive(Default)]
struct RecordingObjects {
    uploads: Mutex<Vec<(String, usize)>>,
    broken: bool,
}

#[async_trait]
impl ObjectSink for RecordingObjects {
    async fn upload_punch_image(
        &self,
        ident: &str,
        _punch_time: &str,
        image: &[u8],
    ) -> Result<String> {
        if self.broken {
            bail!("bucket unreachable");
        }
        self.uploads.lock().push((ident.to_string(), image.len()));
        Ok(format!("https://photos.example.com/{}.jpg", ident))
    }
}

// ============ Harness ============

struct Harness {
    ctx: AppContext,
    store: Arc<InMemoryStore>,
    sheets: Arc<RecordingSheets>,
    objects: Arc<RecordingObjects>,
}

fn test_config() -> Config {
    toml::from_str(
        r#"
[db]
path = "unused.sqlite"

[server]
bind = "127.0.0.1:0"

[tasks]
max_workers = 2
max_retries = 2
initial_delay_ms = 1
backoff_factor = 1.0

[attendance]
utc_offset = "+08:00"
default_time_zone = "Asia/Taipei"
"#,
    )
    .unwrap()
}

fn harness_with(sheets: RecordingSheets, objects: RecordingObjects) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let sheets = Arc::new(sheets);
    let objects = Arc::new(objects);
    let ctx = AppContext::from_parts(
        test_config(),
        store.clone(),
        Arc::new(FakeExtractor),
        sheets.clone(),
        objects.clone(),
    )
    .unwrap();
    Harness {
        ctx,
        store,
        sheets,
        objects,
    }
}

fn harness() -> Harness {
    harness_with(RecordingSheets::default(), RecordingObjects::default())
}

fn payload(ident: &str, embedding: Option<Vec<f32>>) -> PersonPayload {
    PersonPayload {
        ident: Some(ident.to_string()),
        face_embedding: embedding,
        ..Default::default()
    }
}

async fn wait_terminal(ctx: &AppContext, task_id: &str) -> TaskRecord {
    for _ in 0..200 {
        if let Some(record) = ctx.executor.status(task_id) {
            if record.status.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} did not finish", task_id);
}

// ============ People ============

#[tokio::test]
async fn create_person_indexes_embedding_and_mirrors_personnel_row() {
    let h = harness();
    let written = people::create(&h.ctx, payload("TEACHER Lin", Some(vec![0.6, 0.8])))
        .await
        .unwrap();

    assert!(written.created);
    assert!(matches!(
        written.index,
        Some(IndexMutation::Rebuilt) | Some(IndexMutation::Appended)
    ));
    assert_eq!(h.ctx.index.idents().await, vec!["TEACHER Lin"]);

    let task_id = written.background_task.unwrap();
    assert!(task_id.starts_with("sheets_personnel_TEACHER Lin_"));
    let record = wait_terminal(&h.ctx, &task_id).await;
    assert_eq!(record.status, TaskStatus::Completed);

    let rows = h.sheets.rows.lock();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, SheetTab::Personnel);
    assert_eq!(rows[0].1, vec!["TEACHER", "Lin", "", "", "Asia/Taipei"]);
}

#[tokio::test]
async fn create_rejects_duplicates_and_missing_ident() {
    let h = harness();
    people::create(&h.ctx, payload("dup", None)).await.unwrap();

    assert!(matches!(
        people::create(&h.ctx, payload("dup", None)).await,
        Err(ServiceError::Conflict(_))
    ));
    assert!(matches!(
        people::create(&h.ctx, payload("   ", None)).await,
        Err(ServiceError::BadRequest(_))
    ));
    assert!(matches!(
        people::create(&h.ctx, payload("nan", Some(vec![f32::NAN]))).await,
        Err(ServiceError::BadRequest(_))
    ));
}

#[tokio::test]
async fn create_from_photo_requires_exactly_one_face() {
    let h = harness();
    let two_faces = PersonPayload {
        ident: Some("crowd".to_string()),
        face_photo_base64: Some(base64_of(b"face:1,0;0,1")),
        ..Default::default()
    };
    assert!(matches!(
        people::create(&h.ctx, two_faces).await,
        Err(ServiceError::BadRequest(_))
    ));
    assert!(h.store.get_person("crowd").await.unwrap().is_none());

    let one_face = PersonPayload {
        ident: Some("solo".to_string()),
        face_photo_base64: Some(format!("data:image/jpeg;base64,{}", base64_of(b"face:0,1"))),
        ..Default::default()
    };
    people::create(&h.ctx, one_face).await.unwrap();
    assert_eq!(h.ctx.index.idents().await, vec!["solo"]);
}

#[tokio::test]
async fn personnel_sync_retries_through_transient_failures() {
    let sheets = RecordingSheets::default();
    sheets.failures_left.store(2, Ordering::SeqCst);
    let h = harness_with(sheets, RecordingObjects::default());

    let written = people::create(&h.ctx, payload("NTU2025 Vincent Cheng", None))
        .await
        .unwrap();
    let record = wait_terminal(&h.ctx, &written.background_task.unwrap()).await;

    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(h.sheets.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        h.sheets.rows.lock()[0].1,
        vec!["NTU2025", "Vincent Cheng", "", "", "Asia/Taipei"]
    );
}

#[tokio::test]
async fn personnel_sync_fails_after_retries_are_spent() {
    let sheets = RecordingSheets::default();
    sheets.failures_left.store(10, Ordering::SeqCst);
    let h = harness_with(sheets, RecordingObjects::default());

    let written = people::create(&h.ctx, payload("flaky", None)).await.unwrap();
    let record = wait_terminal(&h.ctx, &written.background_task.unwrap()).await;

    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.error.unwrap().contains("sheet quota exceeded"));
    assert_eq!(h.sheets.calls.load(Ordering::SeqCst), 3);
    // The person was still created.
    assert!(h.store.get_person("flaky").await.unwrap().is_some());
}

#[tokio::test]
async fn update_and_delete_keep_index_in_line() {
    let h = harness();
    people::create(&h.ctx, payload("a", Some(vec![1.0, 0.0])))
        .await
        .unwrap();
    people::create(&h.ctx, payload("b", Some(vec![0.0, 1.0])))
        .await
        .unwrap();

    let updated = people::update(&h.ctx, "a", payload("a", Some(vec![0.0, 1.0])))
        .await
        .unwrap();
    assert_eq!(updated.index, Some(IndexMutation::Rebuilt));
    assert!(!updated.created);

    let person = people::get(&h.ctx, "a").await.unwrap();
    assert!(person.has_face_embedding);
    assert!(person.face_embedding.is_some());

    assert_eq!(
        people::delete(&h.ctx, "b").await.unwrap(),
        IndexMutation::Rebuilt
    );
    assert_eq!(h.ctx.index.idents().await, vec!["a"]);

    assert!(matches!(
        people::delete(&h.ctx, "b").await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(
        people::update(&h.ctx, "ghost", PersonPayload::default()).await,
        Err(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn update_time_zone_only_leaves_index_alone() {
    let h = harness();
    people::create(&h.ctx, payload("tz", Some(vec![1.0, 0.0])))
        .await
        .unwrap();

    let changes = PersonPayload {
        time_zone: Some("Europe/Berlin".to_string()),
        ..Default::default()
    };
    let updated = people::update(&h.ctx, "tz", changes).await.unwrap();
    assert!(updated.index.is_none());
    assert_eq!(
        people::get(&h.ctx, "tz").await.unwrap().time_zone,
        "Europe/Berlin"
    );
}

#[tokio::test]
async fn upsert_creates_then_updates() {
    let h = harness();
    let first = people::upsert(&h.ctx, "u", PersonPayload::default())
        .await
        .unwrap();
    assert!(first.created);

    let second = people::upsert(&h.ctx, "u", payload("u", Some(vec![1.0, 1.0])))
        .await
        .unwrap();
    assert!(!second.created);
    assert_eq!(h.ctx.index.idents().await, vec!["u"]);
}

// ============ Recognition ============

#[tokio::test]
async fn enroll_then_verify_identifies_the_person() {
    let h = harness();
    people::create(&h.ctx, payload("A", None)).await.unwrap();
    people::create(&h.ctx, payload("B", None)).await.unwrap();

    let enrolled = h
        .ctx
        .recognition
        .enroll(b"face:0.6,0.8,0", "A", false)
        .await
        .unwrap();
    assert!(!enrolled.overwritten);
    assert_eq!(enrolled.used_model, "fake");
    h.ctx
        .recognition
        .enroll(b"face:0,0,1", "B", false)
        .await
        .unwrap();

    let verified = h
        .ctx
        .recognition
        .verify(b"face:0.6,0.8,0", 0.5, 2)
        .await
        .unwrap();
    assert_eq!(verified.ident.as_deref(), Some("A"));
    assert_eq!(verified.top_matches.len(), 2);
    assert_eq!(verified.top_matches[0].ident, "A");
    assert_eq!(verified.top_matches[1].ident, "B");
    assert!((verified.score.unwrap() - 1.0).abs() < 1e-5);

    // Candidates are still reported when nothing clears the threshold.
    let weak = h
        .ctx
        .recognition
        .verify(b"face:0.6,0.8,0", 1.5, 2)
        .await
        .unwrap();
    assert!(weak.matched.is_none());
    assert!(weak.ident.is_none());
    assert_eq!(weak.top_matches.len(), 2);
}

#[tokio::test]
async fn enroll_respects_overwrite_flag() {
    let h = harness();
    people::create(&h.ctx, payload("A", Some(vec![1.0, 0.0])))
        .await
        .unwrap();

    assert!(matches!(
        h.ctx.recognition.enroll(b"face:0,1", "A", false).await,
        Err(ServiceError::Conflict(_))
    ));
    assert!(matches!(
        h.ctx.recognition.enroll(b"face:0,1", "nobody", true).await,
        Err(ServiceError::NotFound(_))
    ));

    let enrolled = h
        .ctx
        .recognition
        .enroll(b"face:0,1", "A", true)
        .await
        .unwrap();
    assert!(enrolled.overwritten);
    assert_eq!(enrolled.index, IndexMutation::Rebuilt);

    let verified = h.ctx.recognition.verify(b"face:0,1", 0.9, 1).await.unwrap();
    assert_eq!(verified.ident.as_deref(), Some("A"));
}

#[tokio::test]
async fn verify_rejects_bad_inputs() {
    let h = harness();
    assert!(matches!(
        h.ctx.recognition.verify(b"blank", 0.5, 3).await,
        Err(ServiceError::BadRequest(_))
    ));
    assert!(matches!(
        h.ctx.recognition.verify(b"face:1,0", f32::NAN, 3).await,
        Err(ServiceError::BadRequest(_))
    ));
    assert!(matches!(
        h.ctx.recognition.verify(b"face:1,0", 0.5, 0).await,
        Err(ServiceError::BadRequest(_))
    ));

    // Empty index: no candidates, no match.
    let verified = h.ctx.recognition.verify(b"face:1,0", 0.5, 3).await.unwrap();
    assert!(verified.top_matches.is_empty());
    assert!(verified.matched.is_none());
}

// ============ Attendance ============

#[tokio::test]
async fn punch_without_image_mirrors_attendance_row() {
    let h = harness();
    people::create(&h.ctx, payload("STAFF Wu", None)).await.unwrap();

    let receipt = attendance::punch(&h.ctx, "STAFF Wu", None).await.unwrap();
    assert!(receipt.punch_time.ends_with("+08:00"));
    let task_id = receipt.background_task.unwrap();
    assert!(task_id.starts_with("attendance_sheets_STAFF Wu_"));
    assert_eq!(
        wait_terminal(&h.ctx, &task_id).await.status,
        TaskStatus::Completed
    );

    let rows = h.sheets.rows.lock();
    let (tab, row) = rows.iter().find(|(tab, _)| *tab == SheetTab::Attendance).unwrap();
    assert_eq!(*tab, SheetTab::Attendance);
    assert_eq!(row[0], receipt.punch_time.trim_end_matches("+08:00"));
    assert_eq!(row[1], "STAFF Wu");
    assert_eq!(row[2], "");
}

#[tokio::test]
async fn punch_with_image_uploads_and_records_url() {
    let h = harness();
    people::create(&h.ctx, payload("p", None)).await.unwrap();

    let receipt = attendance::punch(&h.ctx, "p", Some(b"jpeg bytes".to_vec()))
        .await
        .unwrap();
    let task_id = receipt.background_task.unwrap();
    assert!(task_id.starts_with("attendance_upload_p_"));

    let record = wait_terminal(&h.ctx, &task_id).await;
    assert_eq!(record.status, TaskStatus::Completed);
    let result = record.result.unwrap();
    assert_eq!(result["image_url"], "https://photos.example.com/p.jpg");
    assert_eq!(result["sheets_result"]["success"], true);

    let punch = h
        .store
        .get_punch(receipt.attendance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        punch.image_url.as_deref(),
        Some("https://photos.example.com/p.jpg")
    );
    assert_eq!(h.objects.uploads.lock().as_slice(), &[("p".to_string(), 10)]);

    let rows = h.sheets.rows.lock();
    let (_, row) = rows.iter().find(|(tab, _)| *tab == SheetTab::Attendance).unwrap();
    assert_eq!(row[2], "https://photos.example.com/p.jpg");
}

#[tokio::test]
async fn failed_upload_fails_the_task_but_keeps_the_punch() {
    let objects = RecordingObjects {
        broken: true,
        ..Default::default()
    };
    let h = harness_with(RecordingSheets::default(), objects);
    people::create(&h.ctx, payload("p", None)).await.unwrap();

    let receipt = attendance::punch(&h.ctx, "p", Some(b"jpeg".to_vec()))
        .await
        .unwrap();
    let record = wait_terminal(&h.ctx, &receipt.background_task.unwrap()).await;

    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.error.unwrap().contains("bucket unreachable"));
    let punch = h
        .store
        .get_punch(receipt.attendance_id)
        .await
        .unwrap()
        .unwrap();
    assert!(punch.image_url.is_none());
}

#[tokio::test]
async fn punch_requires_known_person() {
    let h = harness();
    assert!(matches!(
        attendance::punch(&h.ctx, "stranger", None).await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(
        attendance::punch(&h.ctx, "  ", None).await,
        Err(ServiceError::BadRequest(_))
    ));
    assert_eq!(h.store.punch_count(), 0);
}

#[test]
fn unreadable_punch_image_is_dropped() {
    let request = PunchRequest {
        ident: Some("p".to_string()),
        image_base64: Some("%%% not base64 %%%".to_string()),
    };
    assert!(attendance::punch_image(&request).is_none());

    let request = PunchRequest {
        ident: Some("p".to_string()),
        image_base64: Some(base64_of(b"jpeg")),
    };
    assert_eq!(attendance::punch_image(&request), Some(b"jpeg".to_vec()));
}

fn base64_of(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
