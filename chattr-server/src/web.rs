//! WebSocket chat transport and REST API.
//!
//! The WebSocket endpoint (`/socket`) upgrades, then hands the client to a
//! connection actor. This module only moves frames: JSON text in becomes a
//! typed [`InboundEvent`], queued [`Frame`]s go out as text frames.
//!
//! The REST API serves read-only history plus the admin surface in
//! [`crate::admin::api`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, Method, header};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::connection::{self, Attached, InboundEvent};
use crate::error::ChatResult;
use crate::model::ChatMessage;
use crate::pipeline;
use crate::router::Frame;
use crate::server::SharedState;

/// Largest inbound WebSocket frame accepted.
const MAX_FRAME_BYTES: usize = 64 * 1024;
const WS_SEND_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PAGE_SIZE: usize = 100;
const PINNED_LIMIT: usize = 50;

// ── Axum router ────────────────────────────────────────────────────────

/// Build the axum router with WebSocket and REST endpoints.
pub fn router(state: Arc<SharedState>) -> Router {
    let mut app = Router::new()
        .route("/socket", get(ws_upgrade))
        .route("/api/v1/health", get(api_health))
        .route("/api/chat/messages", get(api_messages))
        .route("/api/chat/messages/pinned", get(api_pinned))
        .merge(crate::admin::api::routes(Arc::clone(&state)))
        .layer(cors_layer(state.config.client_origin.as_deref()));

    if let Some(ref dir) = state.config.uploads_dir {
        app = app.nest_service("/uploads", tower_http::services::ServeDir::new(dir));
    }

    // Serve the web client if the directory exists
    if let Some(ref web_dir) = state.config.web_static_dir {
        let dir = PathBuf::from(web_dir);
        if dir.exists() {
            tracing::info!("Serving web client from {}", dir.display());
            let serve = tower_http::services::ServeDir::new(&dir)
                .append_index_html_on_directories(true)
                .fallback(tower_http::services::ServeFile::new(dir.join("index.html")));
            app = app.fallback_service(serve);
        } else {
            tracing::warn!("Web static dir not found: {}", dir.display());
        }
    }

    app.with_state(state)
        .layer(axum::middleware::from_fn(security_headers))
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let Some(origin) = origin else {
        return CorsLayer::permissive();
    };
    let allowed = match origin.parse::<HeaderValue>() {
        Ok(value) => AllowOrigin::exact(value),
        Err(_) => {
            tracing::warn!(%origin, "Invalid client origin, cross-origin requests disabled");
            AllowOrigin::list(Vec::<HeaderValue>::new())
        }
    };
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

async fn security_headers(req: axum::extract::Request, next: axum::middleware::Next) -> axum::response::Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("strict-origin-when-cross-origin"));
    resp
}

// ── WebSocket handler ──────────────────────────────────────────────────

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    let ip = crate::gate::client_ip(&headers, peer, state.config.trust_proxy);
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_ws(socket, state, ip.to_string()))
}

/// One task owns the socket: it forwards client frames to the actor and
/// drains the actor's outlet. An idle socket is pinged once, then dropped.
async fn handle_ws(mut socket: WebSocket, state: Arc<SharedState>, ip: String) {
    let idle = Duration::from_secs(state.config.idle_timeout_secs.max(1));
    let Attached { id, inbound, mut outbound, task } = connection::attach(state, ip);

    let mut deadline = tokio::time::Instant::now() + idle;
    let mut awaiting_pong = false;
    loop {
        tokio::select! {
            frame = socket.recv() => {
                deadline = tokio::time::Instant::now() + idle;
                awaiting_pong = false;
                let event = match frame {
                    Some(Ok(WsMessage::Text(text))) => InboundEvent::parse(text.as_str()),
                    Some(Ok(WsMessage::Binary(_))) => {
                        InboundEvent::Malformed("Binary frames are not supported".to_string())
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled by axum
                    Some(Err(e)) => {
                        tracing::debug!(conn_id = %id, "WebSocket read error: {e}");
                        break;
                    }
                };
                if inbound.send(event).await.is_err() {
                    break;
                }
            }
            out = outbound.recv() => {
                match out {
                    Some(Frame::Text(text)) => {
                        match tokio::time::timeout(WS_SEND_TIMEOUT, socket.send(WsMessage::Text(text.into()))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) | Err(_) => {
                                tracing::debug!(conn_id = %id, "WebSocket send failed or timed out");
                                break;
                            }
                        }
                    }
                    Some(Frame::Close) | None => break,
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                if awaiting_pong {
                    tracing::info!(conn_id = %id, "Idle timeout");
                    break;
                }
                awaiting_pong = true;
                deadline = tokio::time::Instant::now() + idle;
                if socket.send(WsMessage::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = socket.send(WsMessage::Close(None)).await;

    // Closing the inbound side lets the actor run its leave handling.
    drop(inbound);
    if let Err(e) = task.await {
        tracing::error!(conn_id = %id, "Connection task failed: {e}");
    }
}

// ── REST types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    online_users: usize,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<usize>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct MessagesResponse {
    messages: Vec<ChatMessage>,
    page: usize,
    limit: usize,
}

// ── REST handlers ──────────────────────────────────────────────────────

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.router.connection_count(),
        online_users: state.registry.online_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// GET /api/chat/messages?page=&limit=: newest page first, each page
/// oldest-first.
async fn api_messages(
    State(state): State<Arc<SharedState>>,
    Query(q): Query<PageQuery>,
) -> ChatResult<Json<MessagesResponse>> {
    let page = q.page.unwrap_or(1).max(1);
    let limit = q.limit.unwrap_or(state.config.recent_messages).clamp(1, MAX_PAGE_SIZE);
    let messages = state.with_db(|db| pipeline::history(db, limit, page, Utc::now()))?;
    Ok(Json(MessagesResponse { messages, page, limit }))
}

async fn api_pinned(State(state): State<Arc<SharedState>>) -> ChatResult<Json<Vec<ChatMessage>>> {
    Ok(Json(state.with_db(|db| pipeline::pinned(db, PINNED_LIMIT, Utc::now()))?))
}
