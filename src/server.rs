//! HTTP API for the attendance backend.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Static health check with version |
//! | `GET`  | `/liveness` | Process is up |
//! | `GET`  | `/readiness` | Database probe plus index status; 503 when the database is down |
//! | `GET`/`POST` | `/api/people` | List people / create a person |
//! | `GET`/`PUT`/`DELETE` | `/api/people/{ident}` | Fetch / upsert / delete one person |
//! | `POST` | `/api/face/verify` | Identify the face in an image |
//! | `POST` | `/api/face/enroll` | Attach a face to an existing person |
//! | `POST` | `/api/punch` | Record a punch, optionally with a photo |
//! | `GET`  | `/api/tasks/stats` | Background executor counters |
//! | `GET`  | `/api/tasks/{id}` | One background task record |
//! | `GET`  | `/api/index/stats` | Similarity index status |
//! | `POST` | `/api/index/rebuild` | Force an index rebuild from the database |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "Person not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `unavailable` (503), `internal` (500).
//!
//! # Background work
//!
//! Besides serving requests the server builds the index at startup,
//! re-checks its freshness every `index.refresh_interval_secs`, and drains
//! the task executor on graceful shutdown (Ctrl-C or SIGTERM).

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::app::AppContext;
use crate::attendance::{self, PunchRequest};
use crate::config::Config;
use crate::error::ServiceError;
use crate::face::decode_image_base64;
use crate::index::{IndexMutation, IndexStatus};
use crate::people::{self, PersonPayload};

const SERVICE_NAME: &str = "attendance-harness";

type AppState = Arc<AppContext>;

/// Open the database from `config` and serve until shutdown.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let ctx = AppContext::open(config).await?;
    serve(Arc::new(ctx)).await
}

/// Serve the API for an already assembled context.
///
/// Fails if the task executor cannot start or the bind address is
/// unavailable. An index build failure at startup is logged and the index
/// is built lazily on first search instead.
pub async fn serve(ctx: AppState) -> anyhow::Result<()> {
    let config = ctx.config.clone();

    ctx.executor.initialize(config.tasks.max_workers)?;

    match ctx.index.build(false).await {
        Ok(()) => {
            let stats = ctx.index.stats().await;
            info!(
                total_embeddings = stats.total_embeddings,
                dimension = stats.dimension,
                "similarity index built"
            );
        }
        Err(e) => error!(error = %e, "initial index build failed"),
    }

    let refresh = (config.index.refresh_interval_secs > 0).then(|| {
        tokio::spawn(refresh_index_loop(
            ctx.clone(),
            Duration::from_secs(config.index.refresh_interval_secs),
            config.index.max_age_minutes,
        ))
    });

    let app = router(ctx.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "attendance server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = refresh {
        handle.abort();
    }
    info!("draining background tasks");
    ctx.executor.shutdown(true).await;
    Ok(())
}

pub fn router(ctx: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/liveness", get(handle_liveness))
        .route("/readiness", get(handle_readiness))
        .route("/api/people", get(handle_list_people).post(handle_create_person))
        .route(
            "/api/people/{ident}",
            get(handle_get_person)
                .put(handle_upsert_person)
                .delete(handle_delete_person),
        )
        .route("/api/face/verify", post(handle_verify))
        .route("/api/face/enroll", post(handle_enroll))
        .route("/api/punch", post(handle_punch))
        .route("/api/tasks/stats", get(handle_task_stats))
        .route("/api/tasks/{task_id}", get(handle_task_status))
        .route("/api/index/stats", get(handle_index_stats))
        .route("/api/index/rebuild", post(handle_index_rebuild))
        .layer(cors)
        .with_state(ctx)
}

async fn refresh_index_loop(ctx: AppState, every: Duration, max_age_minutes: u64) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        ticker.tick().await;
        match ctx.index.rebuild_if_stale(max_age_minutes).await {
            IndexMutation::Unchanged => {}
            IndexMutation::Failed(e) => warn!(error = %e, "stale index rebuild failed"),
            other => info!(outcome = ?other, "stale index refreshed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        if let ServiceError::Internal(ref e) = err {
            error!(error = ?e, "request failed");
        }
        AppError {
            status: StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

type ApiResult<T> = Result<T, AppError>;

fn required_image(image_base64: Option<&str>) -> ApiResult<Vec<u8>> {
    let encoded = image_base64
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request("Please provide image_base64"))?;
    decode_image_base64(encoded).map_err(|e| bad_request(format!("Image decoding failed: {}", e)))
}

// ============ Health ============

async fn handle_health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_liveness() -> Json<Value> {
    Json(json!({ "status": "alive", "service": SERVICE_NAME }))
}

async fn handle_readiness(State(ctx): State<AppState>) -> (StatusCode, Json<Value>) {
    let (db_ok, database) = match ctx.store.ping().await {
        Ok(()) => (
            true,
            json!({ "status": "healthy", "message": "Database connection successful" }),
        ),
        Err(e) => (
            false,
            json!({ "status": "unhealthy", "message": format!("Database error: {}", e) }),
        ),
    };

    let index = ctx.index.stats().await;
    let vector_index = match index.status {
        IndexStatus::Active => json!({
            "status": "healthy",
            "total_embeddings": index.total_embeddings,
            "message": "Similarity index operational",
        }),
        IndexStatus::NotInitialized => json!({
            "status": "warning",
            "total_embeddings": 0,
            "message": "Similarity index not initialized",
        }),
    };

    let face = &ctx.config.face;
    let face_extractor = if face.is_enabled() {
        json!({ "status": "configured", "model": ctx.extractor.model_name() })
    } else {
        json!({ "status": "disabled" })
    };

    let tasks = ctx.executor.stats();
    let overall = if db_ok { "ready" } else { "unhealthy" };
    let body = json!({
        "status": overall,
        "checks": {
            "database": database,
            "vector_index": vector_index,
            "face_extractor": face_extractor,
            "task_executor": { "status": tasks.executor_status },
        },
    });

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

// ============ People ============

async fn handle_list_people(State(ctx): State<AppState>) -> ApiResult<Json<Value>> {
    let people = people::list(&ctx).await?;
    Ok(Json(json!(people)))
}

async fn handle_create_person(
    State(ctx): State<AppState>,
    payload: Result<Json<PersonPayload>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(payload) = payload?;
    let written = people::create(&ctx, payload).await?;
    Ok((StatusCode::CREATED, Json(json!(written))))
}

async fn handle_get_person(
    State(ctx): State<AppState>,
    Path(ident): Path<String>,
) -> ApiResult<Json<Value>> {
    let person = people::get(&ctx, &ident).await?;
    Ok(Json(json!(person)))
}

async fn handle_upsert_person(
    State(ctx): State<AppState>,
    Path(ident): Path<String>,
    payload: Result<Json<PersonPayload>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(payload) = payload?;
    let written = people::upsert(&ctx, &ident, payload).await?;
    let status = if written.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!(written))))
}

async fn handle_delete_person(
    State(ctx): State<AppState>,
    Path(ident): Path<String>,
) -> ApiResult<Json<Value>> {
    let index = people::delete(&ctx, &ident).await?;
    Ok(Json(json!({ "ident": ident, "deleted": true, "index": index })))
}

// ============ Face ============

#[derive(Deserialize)]
struct VerifyRequest {
    #[serde(default)]
    image_base64: Option<String>,
    #[serde(default)]
    threshold: Option<f32>,
    #[serde(default)]
    top_k: Option<usize>,
}

async fn handle_verify(
    State(ctx): State<AppState>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(req) = payload?;
    let image = required_image(req.image_base64.as_deref())?;
    let threshold = req.threshold.unwrap_or(ctx.config.face.threshold);
    let top_k = req.top_k.unwrap_or(ctx.config.face.top_k);

    let verification = ctx.recognition.verify(&image, threshold, top_k).await?;
    Ok(Json(json!(verification)))
}

#[derive(Deserialize)]
struct EnrollRequest {
    #[serde(default)]
    ident: Option<String>,
    #[serde(default)]
    image_base64: Option<String>,
    #[serde(default)]
    overwrite: Option<bool>,
}

async fn handle_enroll(
    State(ctx): State<AppState>,
    payload: Result<Json<EnrollRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(req) = payload?;
    let ident = req.ident.unwrap_or_default();
    if ident.trim().is_empty() {
        return Err(bad_request("ident is required"));
    }
    let image = required_image(req.image_base64.as_deref())?;

    let enrollment = ctx
        .recognition
        .enroll(&image, &ident, req.overwrite.unwrap_or(true))
        .await?;
    Ok(Json(json!(enrollment)))
}

// ============ Punch ============

async fn handle_punch(
    State(ctx): State<AppState>,
    payload: Result<Json<PunchRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(req) = payload?;
    let ident = req.ident.clone().unwrap_or_default();
    if ident.trim().is_empty() {
        return Err(bad_request("ident is required"));
    }
    let image = attendance::punch_image(&req);

    let receipt = attendance::punch(&ctx, &ident, image).await?;
    Ok(Json(json!(receipt)))
}

// ============ Tasks ============

async fn handle_task_stats(State(ctx): State<AppState>) -> Json<Value> {
    Json(json!({ "success": true, "stats": ctx.executor.stats() }))
}

async fn handle_task_status(
    State(ctx): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = ctx
        .executor
        .status(&task_id)
        .ok_or_else(|| not_found(format!("Task not found: {}", task_id)))?;
    Ok(Json(json!({ "success": true, "task": record })))
}

// ============ Index ============

async fn handle_index_stats(State(ctx): State<AppState>) -> Json<Value> {
    Json(json!(ctx.index.stats().await))
}

async fn handle_index_rebuild(State(ctx): State<AppState>) -> ApiResult<Json<Value>> {
    ctx.index
        .build(true)
        .await
        .map_err(ServiceError::Internal)?;
    Ok(Json(json!(ctx.index.stats().await)))
}
