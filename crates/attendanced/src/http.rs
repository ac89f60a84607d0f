use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use crate::enrollment::{Enrollment, EnrollmentError};
use crate::photos::{PhotoError, PhotoStore};
use crate::pipeline::{MarkRequest, Pipeline, PipelineError};
use crate::recorder::{AttendanceRecorder, ExportError, DATE_FORMAT};
use crate::store::{Store, StoreError};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::{self, TraceLayer};
use tracing::Level;

/// Shared state accessible by HTTP handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: Store,
    pub pipeline: Pipeline,
    pub enrollment: Enrollment,
    pub recorder: AttendanceRecorder,
    pub photos: Arc<dyn PhotoStore>,
}

pub type SharedState = Arc<AppState>;

/// Request body ceiling. Room for several base64 frames per request.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/mark_attendance", post(mark_attendance))
        .route("/api/add_student_with_photo", post(add_student_with_photo))
        .route("/api/replace_photo", post(replace_photo))
        .route("/api/delete_student/:id", delete(delete_student))
        .route("/api/get_attendance", get(get_attendance))
        .route("/api/status", get(status))
        .route("/export_csv", get(export_csv))
        .route("/photos/:filename", get(photo))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// JSON error body: `{"success": false, "message": ..., ...extra}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    extra: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            extra: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, message = %self.message, "request failed");
        }
        let mut body = json!({ "success": false, "message": self.message });
        if let (Some(Value::Object(extra)), Some(map)) = (self.extra, body.as_object_mut()) {
            map.extend(extra);
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        let status = match &e {
            PipelineError::MissingInput | PipelineError::Decode(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotLive(decision) => {
                return Self {
                    status: StatusCode::FORBIDDEN,
                    message: e.to_string(),
                    extra: Some(json!({
                        "liveness_checked": true,
                        "live": false,
                        "motion_pixels": decision.motion_pixels,
                        "rejection": decision.rejection,
                    })),
                };
            }
            PipelineError::Engine(EngineError::Decode(_)) => StatusCode::BAD_REQUEST,
            PipelineError::Engine(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<EnrollmentError> for ApiError {
    fn from(e: EnrollmentError) -> Self {
        let status = match &e {
            EnrollmentError::MissingField(_)
            | EnrollmentError::Decode(_)
            | EnrollmentError::Photo(PhotoError::InvalidName(_)) => StatusCode::BAD_REQUEST,
            EnrollmentError::StudentNotFound(_) => StatusCode::NOT_FOUND,
            EnrollmentError::AlreadyHasPhoto(_)
            | EnrollmentError::FilenameCollision(_)
            | EnrollmentError::Photo(PhotoError::Exists(_))
            | EnrollmentError::Store(StoreError::RollNoConflict(_)) => StatusCode::CONFLICT,
            EnrollmentError::Encode(_)
            | EnrollmentError::Photo(_)
            | EnrollmentError::Store(_)
            | EnrollmentError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<ExportError> for ApiError {
    fn from(e: ExportError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

async fn mark_attendance(
    State(state): State<SharedState>,
    payload: Result<Json<MarkRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    let now = chrono::Local::now().naive_local();
    let outcome = state.pipeline.mark_attendance(request, now).await?;

    if outcome.faces_found == 0 {
        return Ok(Json(json!({
            "success": true,
            "matched": [],
            "liveness_checked": outcome.liveness_checked,
            "message": "No faces found",
        })));
    }
    Ok(Json(json!({
        "success": true,
        "matched": outcome.matched,
        "liveness_checked": outcome.liveness_checked,
    })))
}

#[derive(Debug, Deserialize)]
struct AddStudentRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    roll_no: String,
    #[serde(default)]
    photo: Option<String>,
}

async fn add_student_with_photo(
    State(state): State<SharedState>,
    payload: Result<Json<AddStudentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(req) = payload?;
    let photo = req.photo.as_deref().filter(|p| !p.is_empty());
    let outcome = state
        .enrollment
        .add_student_with_photo(&req.roll_no, &req.name, photo)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "student_id": outcome.student_id,
            "photo_url": outcome.photo_url,
            "message": outcome.message,
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct ReplacePhotoRequest {
    #[serde(default)]
    student_id: Option<i64>,
    #[serde(default)]
    photo: Option<String>,
}

async fn replace_photo(
    State(state): State<SharedState>,
    payload: Result<Json<ReplacePhotoRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload?;
    let (Some(student_id), Some(photo)) = (req.student_id, req.photo.filter(|p| !p.is_empty()))
    else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "student_id and photo required"));
    };
    let outcome = state.enrollment.replace_photo(student_id, &photo).await?;
    Ok(Json(json!({
        "success": true,
        "photo_url": outcome.photo_url,
        "message": "Photo replaced",
    })))
}

async fn delete_student(
    State(state): State<SharedState>,
    Path(student_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    state.enrollment.delete_student(student_id).await?;
    Ok(Json(json!({ "success": true, "message": "Deleted" })))
}

/// Today's attendance, newest first.
async fn get_attendance(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let today = chrono::Local::now().format(DATE_FORMAT).to_string();
    let records = state.store.attendance_for_date(&today).await?;
    Ok(Json(json!(records)))
}

async fn export_csv(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let body = state.recorder.export_csv().await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv"),
            (header::CONTENT_DISPOSITION, "attachment; filename=attendance.csv"),
        ],
        body,
    )
        .into_response())
}

async fn status(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let students = state.store.count_students().await?;
    let photos = state.store.list_gallery_entries().await?.len();
    Ok(Json(json!({
        "success": true,
        "version": env!("CARGO_PKG_VERSION"),
        "workers": state.engine.workers(),
        "cache_entries": state.engine.cache().len(),
        "students": students,
        "gallery_photos": photos,
        "match_threshold": state.config.match_threshold,
        "pixel_diff_threshold": state.config.pixel_diff_threshold,
        "motion_pixel_threshold": state.config.motion_pixel_threshold,
    })))
}

async fn photo(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let photos = Arc::clone(&state.photos);
    let loaded = tokio::task::spawn_blocking(move || {
        let photo_ref = photos.photo_ref(&filename)?;
        photos.load(&photo_ref)
    })
    .await
    .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    match loaded {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response()),
        Err(PhotoError::NotFound(_) | PhotoError::InvalidName(_)) => {
            Err(ApiError::new(StatusCode::NOT_FOUND, "photo not found"))
        }
        Err(e) => Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}
