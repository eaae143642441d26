//! HTTP endpoints for moderation. All of them require
//! `Authorization: Bearer <admin token>`; without a configured token every
//! request is refused.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{ChatError, ChatResult};
use crate::model::{BlockedIp, GlobalSettings};
use crate::router::AnnouncementKind;
use crate::server::SharedState;

/// Build the admin router (shares state with the main server).
pub fn routes(state: Arc<SharedState>) -> Router<Arc<SharedState>> {
    Router::new()
        .route("/api/admin/messages/{id}", delete(delete_message))
        .route("/api/admin/messages/bulk-delete", post(bulk_delete))
        .route("/api/admin/messages/{id}/pin", post(toggle_pin))
        .route("/api/admin/users", get(list_users))
        .route("/api/admin/users/{id}/ban", post(ban_user))
        .route("/api/admin/users/{id}/unban", post(unban_user))
        .route("/api/admin/users/{id}/kick", post(kick_user))
        .route("/api/admin/announcement", post(announce))
        .route("/api/admin/settings", get(get_settings).put(put_settings))
        .route("/api/admin/blocked-ips", get(list_blocked).post(block_ip))
        .route("/api/admin/blocked-ips/{ip}", delete(unblock_ip))
        .route("/api/admin/stats", get(stats))
        .route_layer(middleware::from_fn_with_state(state, require_admin))
}

async fn require_admin(State(state): State<Arc<SharedState>>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if state.config.admin_token_matches(token.trim()) => next.run(req).await,
        _ => {
            tracing::warn!(path = %req.uri().path(), "Rejected admin request");
            let body = serde_json::json!({ "error": "Admin authentication required" });
            (StatusCode::UNAUTHORIZED, Json(body)).into_response()
        }
    }
}

// ── Request types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkDeleteRequest {
    message_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BanRequest {
    #[serde(default)]
    duration: Option<u32>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KickRequest {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnnouncementRequest {
    content: String,
    #[serde(rename = "type", default = "default_kind")]
    kind: AnnouncementKind,
}

fn default_kind() -> AnnouncementKind {
    AnnouncementKind::Info
}

#[derive(Debug, Deserialize)]
struct BlockRequest {
    ip: String,
    #[serde(default)]
    reason: Option<String>,
}

/// An empty body means "all defaults".
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ChatResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ChatError::validation(format!("Invalid request body: {e}")))
}

// ── Handlers ───────────────────────────────────────────────────────────

fn ok() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true }))
}

async fn delete_message(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> ChatResult<Json<serde_json::Value>> {
    super::delete_message(&state, &id)?;
    Ok(ok())
}

async fn bulk_delete(
    State(state): State<Arc<SharedState>>,
    Json(req): Json<BulkDeleteRequest>,
) -> ChatResult<Json<serde_json::Value>> {
    let deleted = super::delete_messages(&state, &req.message_ids)?;
    Ok(Json(serde_json::json!({ "success": true, "deleted": deleted })))
}

async fn toggle_pin(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> ChatResult<Json<serde_json::Value>> {
    let is_pinned = super::toggle_pin(&state, &id)?;
    Ok(Json(serde_json::json!({ "success": true, "isPinned": is_pinned })))
}

async fn list_users(State(state): State<Arc<SharedState>>) -> ChatResult<Json<Vec<super::AdminUser>>> {
    Ok(Json(super::users(&state)?))
}

/// Body is optional; an empty POST bans for the default duration.
async fn ban_user(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ChatResult<Json<serde_json::Value>> {
    let req: BanRequest = optional_body(&body)?;
    let closed = super::ban_user(&state, &id, req.duration, req.reason.as_deref())?;
    Ok(Json(serde_json::json!({ "success": true, "disconnected": closed })))
}

async fn unban_user(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> ChatResult<Json<serde_json::Value>> {
    super::unban_user(&state, &id)?;
    Ok(ok())
}

async fn kick_user(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ChatResult<Json<serde_json::Value>> {
    let req: KickRequest = optional_body(&body)?;
    let closed = super::kick_user(&state, &id, req.reason.as_deref())?;
    Ok(Json(serde_json::json!({ "success": true, "disconnected": closed })))
}

async fn announce(
    State(state): State<Arc<SharedState>>,
    Json(req): Json<AnnouncementRequest>,
) -> ChatResult<Json<serde_json::Value>> {
    super::announce(&state, &req.content, req.kind)?;
    Ok(ok())
}

async fn get_settings(State(state): State<Arc<SharedState>>) -> ChatResult<Json<GlobalSettings>> {
    Ok(Json(super::settings(&state)?))
}

async fn put_settings(
    State(state): State<Arc<SharedState>>,
    Json(settings): Json<GlobalSettings>,
) -> ChatResult<Json<GlobalSettings>> {
    Ok(Json(super::update_settings(&state, settings)?))
}

async fn list_blocked(State(state): State<Arc<SharedState>>) -> ChatResult<Json<Vec<BlockedIp>>> {
    Ok(Json(super::blocked_ips(&state)?))
}

async fn block_ip(
    State(state): State<Arc<SharedState>>,
    Json(req): Json<BlockRequest>,
) -> ChatResult<(StatusCode, Json<BlockedIp>)> {
    let blocked = super::block_ip(&state, &req.ip, req.reason.as_deref())?;
    Ok((StatusCode::CREATED, Json(blocked)))
}

async fn unblock_ip(
    State(state): State<Arc<SharedState>>,
    Path(ip): Path<String>,
) -> ChatResult<Json<serde_json::Value>> {
    super::unblock_ip(&state, &ip)?;
    Ok(ok())
}

async fn stats(State(state): State<Arc<SharedState>>) -> ChatResult<Json<super::AdminStats>> {
    Ok(Json(super::stats(&state)?))
}
