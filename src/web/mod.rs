//! The HTTP surface.

use std::fmt;

use axum::{
    Json, Router,
    extract::{Path as UrlPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::trace::TraceLayer;

use crate::{
    prelude::*,
    service::{OcrParams, OcrService, OcrStatus, RequestOutcome},
};

/// Errors we report to HTTP clients.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::NotFound(message) | ApiError::BadRequest(message) => {
                write!(f, "{message}")
            }
            ApiError::Internal(err) => write!(f, "{err:#}"),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(err) => {
                error!("Request failed: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn unknown_pid(pid: &str) -> ApiError {
    ApiError::NotFound(format!("{pid} not found"))
}

/// Build our router.
pub fn router(service: OcrService) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/version", get(version))
        .route("/healthcheck", get(healthcheck))
        .route("/ocr/{pid}", get(request_ocr))
        .route("/ocr/{pid}/status", get(status))
        .route("/ocr/{pid}/text", get(text))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn index() -> String {
    format!("OCR service version {}", env!("CARGO_PKG_VERSION"))
}

async fn version() -> Json<Value> {
    Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn healthcheck() -> Json<Value> {
    Json(serde_json::json!({ "alive": true }))
}

async fn request_ocr(
    State(service): State<OcrService>,
    UrlPath(pid): UrlPath<String>,
    Query(params): Query<OcrParams>,
) -> Result<&'static str, ApiError> {
    let accepted = service.request_ocr(&pid, &params).await?;
    match accepted.outcome {
        RequestOutcome::UnknownPid => Err(unknown_pid(&pid)),
        RequestOutcome::NotCandidate => Err(ApiError::BadRequest(format!(
            "{pid} is not a candidate for OCR"
        ))),
        RequestOutcome::Started { .. }
        | RequestOutcome::Joined { .. }
        | RequestOutcome::AlreadyDone { .. } => Ok("OK"),
    }
}

async fn status(
    State(service): State<OcrService>,
    UrlPath(pid): UrlPath<String>,
) -> Result<Json<OcrStatus>, ApiError> {
    match service.status(&pid).await? {
        Some(status) => Ok(Json(status)),
        None => Err(unknown_pid(&pid)),
    }
}

#[derive(Debug, Default, Deserialize)]
struct TextParams {
    unit: Option<String>,
}

async fn text(
    State(service): State<OcrService>,
    UrlPath(pid): UrlPath<String>,
    Query(params): Query<TextParams>,
) -> Result<String, ApiError> {
    match service.text(&pid, params.unit.as_deref()).await? {
        Some(document) => Ok(document),
        None => Err(unknown_pid(&pid)),
    }
}
