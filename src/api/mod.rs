//! HTTP API
//!
//! [`InferenceService`] の薄いアダプタです。失敗時は `{success: false, error}` を返します。

use std::sync::Arc;

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection}, DefaultBodyLimit, Multipart,
        Path, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::error::{ServiceError, StatusSignal};
use crate::service::{InferenceService, Upload};

/// multipart の境界やヘッダー分の余裕
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// ハンドラ共通の状態
pub type AppState = Arc<InferenceService>;

/// API エラー
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match (&self.0, self.0.signal()) {
            (ServiceError::PayloadTooLarge { .. }, _) => StatusCode::PAYLOAD_TOO_LARGE,
            (_, StatusSignal::ValidationRejected) => StatusCode::BAD_REQUEST,
            (_, StatusSignal::NotFound) => StatusCode::NOT_FOUND,
            (_, StatusSignal::ServiceUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
            (_, StatusSignal::ServerError) | (_, StatusSignal::Success) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!("{}: {}", status, self.0);
        }

        let body = Json(json!({
            "success": false,
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

/// ルーターを構築
pub fn create_router(service: AppState) -> Router {
    let body_limit = service.settings().max_upload_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route("/api/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/api/images/:filename", get(get_image))
        .route("/api/info", get(get_info))
        .route("/api/model/reload", post(reload_model))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

async fn health(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.health())
}

async fn get_info(State(service): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "success": true,
        "classifications": service.classifications(),
    }))
}

fn multipart_error(service: &InferenceService, err: MultipartError) -> ServiceError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServiceError::PayloadTooLarge {
            limit: service.settings().max_upload_bytes,
        }
    } else {
        ServiceError::Validation(err.body_text())
    }
}

/// multipart の `file` フィールドを分析
async fn analyze(
    State(service): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    // モデルが無ければボディも Content-Type も見ずに返す
    if !service.is_loaded() {
        return Err(ServiceError::Unavailable.into());
    }
    let mut multipart = multipart.map_err(|e| ServiceError::Validation(e.body_text()))?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(&service, e))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error(&service, e))?;
        upload = Some(Upload {
            filename,
            bytes: bytes.to_vec(),
        });
        break;
    }

    let upload = upload.ok_or_else(|| {
        ServiceError::Validation("No file provided. Please upload an image.".to_string())
    })?;

    let response = service.analyze(upload).await?;
    Ok(Json(response).into_response())
}

async fn get_image(
    State(service): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let (bytes, content_type) = service.image(&filename).await?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

async fn reload_model(State(service): State<AppState>) -> Result<Response, ApiError> {
    service.reload().await.map_err(ServiceError::from)?;
    Ok(Json(json!({
        "success": true,
        "health": service.health(),
    }))
    .into_response())
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "error": "Endpoint not found",
        })),
    )
}
