//! HTTP control and subscriber plane
//!
//! `/reset_stream` is the producer's control endpoint; the stream routes
//! hand each browser-style viewer its own hub subscription: SSE with
//! base64 payloads, multipart JPEG, or a WebSocket that starts pushing
//! after the client's `READY`.

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::hub::Subscriber;
use crate::session::Session;

/// Pause between pushes so one fast subscriber cannot monopolize the loop.
const SEND_YIELD: Duration = Duration::from_millis(5);

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Session>,
}

/// Builds the router; exposed separately so tests can drive it in-process.
pub fn router(session: Arc<Session>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/reset_stream", post(reset_stream_handler))
        .route("/h264_stream", get(h264_stream_handler))
        .route("/jpg_stream", get(jpg_stream_handler))
        .route("/ws_h264_stream", get(ws_h264_stream_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { session })
}

/// Serves the control/subscriber plane until the listener fails.
pub async fn run_server(session: Arc<Session>, addr: String) -> anyhow::Result<()> {
    let app = router(session);
    info!(%addr, "HTTP server starting");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_handler(State(state): State<AppState>) -> String {
    format!(
        "framelink relay | variant {} | subscribers {}",
        state.session.variant(),
        state.session.hub().subscriber_count()
    )
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    subscribers: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        subscribers: state.session.hub().subscriber_count(),
    })
}

#[derive(Deserialize)]
struct ResetRequest {
    #[serde(default)]
    message: String,
    #[serde(default)]
    auth: String,
}

#[derive(Serialize)]
struct ResetResponse {
    error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_time: Option<bool>,
}

/// `INIT_STREAM` with the shared secret: the first call just opens the
/// gate, every later call runs a full transport reset. Anything else
/// leaves the server untouched.
async fn reset_stream_handler(
    State(state): State<AppState>,
    Json(request): Json<ResetRequest>,
) -> Json<ResetResponse> {
    let secret = &state.session.config().server.auth_secret;
    if request.message != "INIT_STREAM" || &request.auth != secret {
        warn!("reset_stream rejected: bad message or auth");
        return Json(ResetResponse {
            error: false,
            message: None,
            first_time: None,
        });
    }

    let first_time = state.session.mark_stream_started();
    if !first_time {
        if let Err(e) = state.session.reset().await {
            warn!(error = %e, "stream reset failed");
            return Json(ResetResponse {
                error: true,
                message: None,
                first_time: None,
            });
        }
    }

    Json(ResetResponse {
        error: false,
        message: Some("STREAM CAN START"),
        first_time: Some(first_time),
    })
}

fn sse_frame_stream(subscriber: Subscriber) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold(subscriber, |mut subscriber| async move {
        let payload = subscriber.recv_fresh().await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&payload);
        let event = Event::default().data(serde_json::json!({ "message": encoded }).to_string());
        tokio::time::sleep(SEND_YIELD).await;
        Some((Ok(event), subscriber))
    })
}

/// Server-sent events; each event's payload is the base64 of
/// `pts_us | is_keyframe | NAL`.
async fn h264_stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscriber = state.session.hub().subscribe();
    Sse::new(sse_frame_stream(subscriber)).keep_alive(KeepAlive::default())
}

fn multipart_frame_stream(subscriber: Subscriber) -> impl Stream<Item = Result<Bytes, Infallible>> {
    futures_util::stream::unfold(subscriber, |mut subscriber| async move {
        let payload = subscriber.recv_fresh().await?;
        let mut part =
            Vec::with_capacity(payload.len() + 64);
        part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        part.extend_from_slice(&payload);
        part.extend_from_slice(b"\r\n\r\n");
        tokio::time::sleep(SEND_YIELD).await;
        Some((Ok(Bytes::from(part)), subscriber))
    })
}

/// Motion JPEG over `multipart/x-mixed-replace`.
async fn jpg_stream_handler(State(state): State<AppState>) -> Response {
    let subscriber = state.session.hub().subscribe();
    Response::builder()
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )
        .body(Body::from_stream(multipart_frame_stream(subscriber)))
        .expect("static multipart response builds")
}

/// Binary frames over WebSocket, same payload as `/h264_stream`. The
/// server pushes nothing until the client sends the literal `READY`.
async fn ws_h264_stream_handler(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: AppState) {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) if text == "READY" => {
                info!("websocket subscriber ready");
                break;
            }
            Some(Ok(_)) => continue,
            _ => return,
        }
    }

    let mut subscriber = state.session.hub().subscribe();
    while let Some(payload) = subscriber.recv_fresh().await {
        if socket.send(Message::Binary(payload.to_vec())).await.is_err() {
            break;
        }
        tokio::time::sleep(SEND_YIELD).await;
    }
    info!("websocket subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Format, Transport, VariantConfig};
    use tower::ServiceExt;

    fn test_session() -> Arc<Session> {
        let mut config = Config::default();
        config.variant = VariantConfig {
            incoming: Format::Jpg,
            outgoing: Format::Jpg,
            transport: Transport::Tcp,
            inference: false,
        };
        config.server.auth_secret = "sekrit".to_string();
        Session::new(config).unwrap()
    }

    async fn post_reset(app: Router, body: serde_json::Value) -> serde_json::Value {
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/reset_stream")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_reset_stream_first_time() {
        let session = test_session();
        let app = router(session);
        let body = serde_json::json!({"message": "INIT_STREAM", "auth": "sekrit"});
        let reply = post_reset(app, body).await;
        assert_eq!(reply["error"], false);
        assert_eq!(reply["message"], "STREAM CAN START");
        assert_eq!(reply["first_time"], true);
    }

    #[tokio::test]
    async fn test_reset_stream_bad_auth_leaves_state() {
        let session = test_session();
        let app = router(Arc::clone(&session));
        let body = serde_json::json!({"message": "INIT_STREAM", "auth": "wrong"});
        let reply = post_reset(app, body).await;
        assert_eq!(reply["error"], false);
        assert!(reply.get("first_time").is_none());

        // The latch was not consumed by the failed attempt.
        assert!(session.mark_stream_started());
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(test_session());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
    }
}
