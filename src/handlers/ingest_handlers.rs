//! HTTP handlers for getting files into the tree: multipart uploads from
//! clients and updates pushed by the messaging platform.

use crate::{
    errors::AppError,
    handlers::{AppState, parse_optional_id},
    models::{node::Node, platform::Update},
    services::ingest_service::UploadRequest,
};
use axum::{
    Json,
    extract::{Multipart, Query, State, multipart::MultipartError},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};

/// Header the platform uses to echo the configured webhook secret.
pub const WEBHOOK_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

fn multipart_error(err: MultipartError) -> AppError {
    tracing::warn!("Failed to read multipart data: {}", err);
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", err.body_text());
    }
    AppError::bad_request(format!("invalid multipart data: {}", err.body_text()))
}

/// POST `/upload` — multipart form with `file`, optional `parent_id` and `caption`.
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut file_name: Option<String> = None;
    let mut mime_type: Option<String> = None;
    let mut payload: Option<BytesMut> = None;
    let mut parent_id = None;
    let mut caption = None;

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                mime_type = field.content_type().map(|s| s.to_string());

                let mut buf = BytesMut::new();
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    state
                        .ingest
                        .check_size((buf.len() + chunk.len()) as u64)?;
                    buf.extend_from_slice(&chunk);
                }
                payload = Some(buf);
            }
            "parent_id" => {
                let raw = field.text().await.map_err(multipart_error)?;
                parent_id = parse_optional_id(Some(&raw))?;
            }
            "caption" => {
                caption = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }

    let payload = payload.ok_or_else(|| AppError::bad_request("No file uploaded"))?;
    let file_name = file_name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("uploaded file has no name"))?;

    let node = state
        .ingest
        .upload(UploadRequest {
            file_name,
            parent_id,
            mime_type,
            caption,
            payload: payload.freeze(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(node)))
}

/// Query params accepted by `POST /webhook`.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    /// Folder that receives pushed files; root level when absent.
    pub parent_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub ok: bool,
    pub node: Option<Node>,
}

/// POST `/webhook` — record the attachment of a pushed update.
pub async fn receive_update(
    State(state): State<AppState>,
    Query(q): Query<WebhookQuery>,
    headers: HeaderMap,
    Json(update): Json<Update>,
) -> Result<Json<WebhookResponse>, AppError> {
    if let Some(secret) = state.settings.webhook_secret.as_deref() {
        let presented = headers
            .get(WEBHOOK_SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(secret) {
            tracing::warn!("Rejected webhook call with missing or wrong secret");
            return Err(AppError::new(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "webhook secret mismatch",
            ));
        }
    }

    let parent_id = parse_optional_id(q.parent_id.as_deref())?;
    let node = state.ingest.ingest_update(update, parent_id).await?;
    Ok(Json(WebhookResponse { ok: true, node }))
}
