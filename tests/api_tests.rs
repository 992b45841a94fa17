//! HTTP API の結合テスト

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;

use dermascan::ml::{Augmentor, LesionPredictor};
use dermascan::model::PreprocessSettings;
use dermascan::{create_router, InferenceError, InferenceService, ModelContext, ServiceSettings};

const BOUNDARY: &str = "dermascan-test-boundary";

/// 常に melanoma (クラス 6) を返す予測器
struct FixedPredictor;

impl LesionPredictor for FixedPredictor {
    fn predict(&self, _input: &[f32]) -> Result<Vec<f32>, InferenceError> {
        let mut probs = vec![0.01f32; 8];
        probs[6] = 0.93;
        Ok(probs)
    }
}

fn settings(dir: &Path) -> ServiceSettings {
    ServiceSettings {
        model_path: dir.join("missing.tar.gz"),
        upload_dir: dir.join("uploads"),
        max_upload_bytes: 1024 * 1024,
        allowed_extensions: vec!["png".into(), "jpg".into(), "jpeg".into(), "gif".into()],
        request_timeout: Duration::from_secs(5),
    }
}

fn service(dir: &Path, with_model: bool) -> Arc<InferenceService> {
    let service = InferenceService::new(settings(dir));
    if with_model {
        let augmentor = Augmentor::serve(&PreprocessSettings::default());
        service.install(ModelContext::new(Arc::new(FixedPredictor), augmentor, None));
    }
    Arc::new(service)
}

fn png_bytes() -> Vec<u8> {
    let img = RgbImage::from_pixel(32, 24, Rgb([180, 120, 90]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

fn multipart_body(field: &str, filename: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn analyze_request(field: &str, filename: &str, bytes: &[u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/analyze")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(field, filename, bytes)))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn stored_files(dir: &Path) -> usize {
    std::fs::read_dir(dir.join("uploads"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_health_is_degraded_without_model() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), false));

    let (status, json) = send(&app, get("/api/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["model_loaded"], false);
    assert!(json["model_loaded_at"].is_null());
}

#[tokio::test]
async fn test_health_is_healthy_with_model() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), true));

    let (status, json) = send(&app, get("/api/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["model_loaded"], true);
    let loaded_at = json["model_loaded_at"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(loaded_at).is_ok());
}

#[tokio::test]
async fn test_info_lists_all_classes() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), false));

    let (status, json) = send(&app, get("/api/info")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["classifications"].as_array().unwrap().len(), 8);
}

#[tokio::test]
async fn test_analyze_without_model_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), false));

    let (status, json) = send(&app, analyze_request("file", "lesion.png", &png_bytes())).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["success"], false);
    assert!(json["error"].is_string());
    assert_eq!(stored_files(dir.path()), 0);
}

fn raw_png_request(bytes: &[u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/analyze")
        .header(header::CONTENT_TYPE, "image/png")
        .body(Body::from(bytes.to_vec()))
        .unwrap()
}

#[tokio::test]
async fn test_non_multipart_without_model_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), false));

    let (status, json) = send(&app, raw_png_request(&png_bytes())).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["success"], false);
    assert_eq!(
        json["error"],
        "Model not loaded. Please contact administrator."
    );
}

#[tokio::test]
async fn test_non_multipart_with_model_is_json_bad_request() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), true));

    let (status, json) = send(&app, raw_png_request(&png_bytes())).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert!(json["error"].is_string());
    assert_eq!(stored_files(dir.path()), 0);
}

#[tokio::test]
async fn test_body_over_router_limit_is_payload_too_large() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), true));
    let oversized = vec![0u8; 2 * 1024 * 1024];

    let (status, json) = send(&app, analyze_request("file", "big.png", &oversized)).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json["success"], false);
    assert_eq!(
        json["error"],
        "File exceeds the 1048576 byte upload limit"
    );
    assert_eq!(stored_files(dir.path()), 0);
}

#[tokio::test]
async fn test_file_just_over_upload_limit_is_payload_too_large() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), true));
    let oversized = vec![0u8; 1024 * 1024 + 1];

    let (status, json) = send(&app, analyze_request("file", "big.png", &oversized)).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json["success"], false);
    assert_eq!(stored_files(dir.path()), 0);
}

#[tokio::test]
async fn test_analyze_returns_diagnosis_and_serves_image() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), true));
    let png = png_bytes();

    let (status, json) = send(&app, analyze_request("file", "Lesion.PNG", &png)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["diagnosis_class"], 6);
    assert_eq!(json["diagnosis"], "Melanoma");
    assert!((json["confidence"].as_f64().unwrap() - 0.93).abs() < 1e-4);
    assert_eq!(json["probabilities"].as_object().unwrap().len(), 8);
    assert_eq!(json["image"]["original_filename"], "Lesion.PNG");

    let url = json["image"]["url"].as_str().unwrap().to_string();
    assert!(url.starts_with("/api/images/"));
    assert!(url.ends_with(".png"));

    let response = app.clone().oneshot(get(&url)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "image/png"
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), png.as_slice());
}

#[tokio::test]
async fn test_analyze_rejects_unsupported_extension() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), true));

    let (status, json) = send(&app, analyze_request("file", "notes.txt", b"hello")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert_eq!(stored_files(dir.path()), 0);
}

#[tokio::test]
async fn test_analyze_requires_file_field() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), true));

    let (status, json) = send(&app, analyze_request("photo", "lesion.png", &png_bytes())).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "No file provided. Please upload an image.");
}

#[tokio::test]
async fn test_analyze_undecodable_image_is_rejected_and_cleaned_up() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), true));

    let (status, json) = send(&app, analyze_request("file", "broken.png", b"not a png")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert_eq!(stored_files(dir.path()), 0);
}

#[tokio::test]
async fn test_unknown_image_is_not_found() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), true));

    let (status, json) = send(&app, get("/api/images/does-not-exist.png")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_unknown_route_returns_json_not_found() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), false));

    let (status, json) = send(&app, get("/api/nothing-here")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "Endpoint not found");
}

#[tokio::test]
async fn test_reload_failure_keeps_current_model() {
    let dir = TempDir::new().unwrap();
    let app = create_router(service(dir.path(), true));

    let request = Request::builder()
        .method("POST")
        .uri("/api/model/reload")
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&app, request).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["success"], false);

    let (_, health) = send(&app, get("/api/health")).await;
    assert_eq!(health["model_loaded"], true);
}
