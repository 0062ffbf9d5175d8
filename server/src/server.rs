//! HTTP server exposing the classification pipeline.
//!
//! Routes:
//!   GET  /api/health        → health check
//!   GET  /api/labels        → label set in model output order
//!   POST /upload            → ranked predictions for an uploaded clip
//!   POST /api/spectrogram   → PNG spectrogram of an uploaded clip
//!   POST /upload-category   → store a user-labelled sample

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use whisp_common::protocol::{ErrorResponse, HealthResponse, PredictionResponse, SubmissionResponse};
use whisp_common::{PipelineError, PipelineResult};
use whisp_processing::Pipeline;

use crate::curation::{Curator, Submission};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub curator: Curator,
    pub start_time: Instant,
    /// Upper bound on one request's pipeline run.
    pub timeout: Option<Duration>,
}

/// Server-level settings that shape the router rather than the handlers.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub max_upload_bytes: usize,
    pub static_dir: Option<PathBuf>,
}

pub fn router(state: AppState, options: &RouterOptions) -> Router {
    let mut app = Router::new()
        .route("/api/health", get(health))
        .route("/api/labels", get(labels))
        .route("/upload", post(upload))
        .route("/api/spectrogram", post(spectrogram))
        .route("/upload-category", post(upload_category));

    if let Some(dir) = &options.static_dir {
        app = app.nest_service("/static", ServeDir::new(dir));
    }

    app.layer(DefaultBodyLimit::max(options.max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.  Blocks until `shutdown` is raised.
pub async fn run(
    state: AppState,
    options: RouterOptions,
    listen_addr: &str,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let app = router(state, &options);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("Whisp HTTP server listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(250)).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

// ── errors ───────────────────────────────────────────────────────────────

/// Every failure a handler can report.  Rendered as a JSON
/// [`ErrorResponse`] with a matching status code.
#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    Timeout(Duration),
    Multipart(StatusCode, String),
    MissingField(&'static str),
    Storage(anyhow::Error),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Pipeline(PipelineError::Decode(_)) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(PipelineError::Feature(_) | PipelineError::Render(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Multipart(status, _) => *status,
            ApiError::MissingField(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorResponse {
        let (error, message) = match self {
            ApiError::Pipeline(e) => (e.kind(), e.to_string()),
            ApiError::Timeout(limit) => (
                "timeout",
                format!("classification did not finish within {}s", limit.as_secs_f32()),
            ),
            ApiError::Multipart(_, msg) => ("bad_request", msg.clone()),
            ApiError::MissingField(name) => {
                ("bad_request", format!("missing multipart field `{name}`"))
            }
            ApiError::Storage(e) => ("storage_error", format!("{e:#}")),
            ApiError::Internal(msg) => ("internal_error", msg.clone()),
        };
        ErrorResponse {
            error: error.to_string(),
            message,
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError::Pipeline(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = self.body();
        if status.is_server_error() {
            error!("{}: {}", body.error, body.message);
        } else {
            warn!("{}: {}", body.error, body.message);
        }
        (status, Json(body)).into_response()
    }
}

// ── helpers ──────────────────────────────────────────────────────────────

/// Collect every multipart field into memory, keyed by field name.
async fn read_form(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<HashMap<String, Bytes>, ApiError> {
    let mut multipart =
        multipart.map_err(|e| ApiError::Multipart(StatusCode::BAD_REQUEST, e.body_text()))?;
    let mut fields = HashMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Multipart(e.status(), e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::Multipart(e.status(), e.body_text()))?;
        fields.insert(name, data);
    }
    Ok(fields)
}

fn take_file(fields: &mut HashMap<String, Bytes>) -> Result<Bytes, ApiError> {
    fields.remove("file").ok_or(ApiError::MissingField("file"))
}

fn take_text(fields: &mut HashMap<String, Bytes>, name: &str) -> String {
    fields
        .remove(name)
        .map(|b| String::from_utf8_lossy(&b).trim().to_string())
        .unwrap_or_default()
}

/// Run `f` on a blocking worker, bounded by the configured timeout.
async fn run_blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Pipeline) -> PipelineResult<T> + Send + 'static,
{
    let pipeline = state.pipeline.clone();
    let task = tokio::task::spawn_blocking(move || f(&pipeline));
    let joined = match state.timeout {
        Some(limit) => tokio::time::timeout(limit, task)
            .await
            .map_err(|_| ApiError::Timeout(limit))?,
        None => task.await,
    };
    let result = joined.map_err(|e| ApiError::Internal(format!("pipeline task failed: {e}")))?;
    Ok(result?)
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        model: state.pipeline.classifier_name().to_string(),
        labels: state.pipeline.labels().len(),
    })
}

async fn labels(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.pipeline.labels().as_slice().to_vec())
}

async fn upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let mut form = read_form(multipart).await?;
    let bytes = take_file(&mut form)?;
    let result = run_blocking(&state, move |p| p.classify(&bytes)).await?;
    Ok(Json(result.into_response()))
}

async fn spectrogram(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let mut form = read_form(multipart).await?;
    let bytes = take_file(&mut form)?;
    let png = run_blocking(&state, move |p| p.spectrogram(&bytes)?.to_png()).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

async fn upload_category(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<SubmissionResponse>, ApiError> {
    let mut form = read_form(multipart).await?;
    let bytes = take_file(&mut form)?;
    if bytes.is_empty() {
        return Err(ApiError::Multipart(
            StatusCode::BAD_REQUEST,
            "field `file` is empty".into(),
        ));
    }
    let submission = Submission {
        guessed_category: take_text(&mut form, "guessed_category"),
        select_category: take_text(&mut form, "select_category"),
        select_category_fill_in: take_text(&mut form, "select_category_fill_in"),
    };

    let curator = state.curator.clone();
    tokio::task::spawn_blocking(move || curator.submit(&bytes, submission))
        .await
        .map_err(|e| ApiError::Internal(format!("curation task failed: {e}")))?
        .map_err(ApiError::Storage)?;

    Ok(Json(SubmissionResponse {
        response: "ok".to_string(),
    }))
}

// ─── tests ───────────────────────────────────────────────────────────────
