//! HTTP and duplex-channel surface.
//!
//! Two streaming surfaces share the pipeline's broadcast channels: an
//! MJPEG endpoint for plain `<img>` consumers and a WebSocket carrying
//! tagged JSON messages both ways. Any number of clients may connect;
//! they all observe the same state machine.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use steadyscript_types::{
    ClientCommand, ExerciseMode, HsvRange, MetricsSnapshot, ServerMessage, SessionRecord,
};

use crate::pipeline::ControlRequest;
use crate::store;

#[derive(Clone)]
pub struct AppState {
    pub command_tx: crossbeam_channel::Sender<ControlRequest>,
    pub frame_tx: broadcast::Sender<Arc<Vec<u8>>>,
    pub event_tx: broadcast::Sender<ServerMessage>,
    pub metrics_rx: watch::Receiver<Option<MetricsSnapshot>>,
    pub history: Arc<RwLock<Vec<SessionRecord>>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/video_feed", get(video_feed_handler))
        .route("/tracking_data", get(tracking_data_handler))
        .route("/api/sessions", get(sessions_handler))
        .route("/session/start", post(session_start_handler))
        .route("/session/stop", post(session_stop_handler))
        .route("/hsv", post(hsv_handler))
        .route("/ws/game2", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: &str) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("SteadyScript server listening on http://{addr}/");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "SteadyScript API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "video_feed": "/video_feed",
            "tracking_data": "/tracking_data",
            "websocket": "/ws/game2",
            "sessions": "/api/sessions",
            "session_start": "/session/start",
            "session_stop": "/session/stop",
            "hsv_update": "/hsv",
        },
    }))
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// One part of the multipart/x-mixed-replace stream.
fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

async fn video_feed_handler(State(state): State<AppState>) -> Response {
    let rx = state.frame_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(jpeg) => Some(Ok::<Bytes, std::convert::Infallible>(mjpeg_part(&jpeg))),
            // Lagged receiver: the oldest frames were dropped, keep going.
            Err(_) => None,
        }
    });
    match Response::builder()
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )
        .body(axum::body::Body::from_stream(stream))
    {
        Ok(resp) => resp,
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("stream setup failed: {e}"),
        )
            .into_response(),
    }
}

async fn tracking_data_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot: Option<MetricsSnapshot> = state.metrics_rx.borrow().clone();
    Json(snapshot)
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    limit: Option<usize>,
    session_type: Option<String>,
}

async fn sessions_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let session_type = match query.session_type.as_deref() {
        None => None,
        Some(s) if s.eq_ignore_ascii_case("hold") => Some(ExerciseMode::Hold),
        Some(s) if s.eq_ignore_ascii_case("follow") => Some(ExerciseMode::Follow),
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("unknown session_type {other:?}"),
            )
                .into_response();
        }
    };
    let response = {
        let records = state.history.read();
        store::query(&records, limit, session_type)
    };
    Json(response).into_response()
}

fn enqueue(state: &AppState, command: ClientCommand) -> Result<(), StatusCode> {
    state
        .command_tx
        .send(ControlRequest {
            command,
            reply: None,
        })
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn session_start_handler(State(state): State<AppState>) -> Response {
    match enqueue(&state, ClientCommand::SessionStart) {
        Ok(()) => Json(serde_json::json!({ "status": "accepted" })).into_response(),
        Err(code) => code.into_response(),
    }
}

async fn session_stop_handler(State(state): State<AppState>) -> Response {
    match enqueue(&state, ClientCommand::SessionStop) {
        Ok(()) => Json(serde_json::json!({ "status": "accepted" })).into_response(),
        Err(code) => code.into_response(),
    }
}

async fn hsv_handler(State(state): State<AppState>, Json(range): Json<HsvRange>) -> Response {
    if let Err(e) = range.validate() {
        return (StatusCode::UNPROCESSABLE_ENTITY, e).into_response();
    }
    match enqueue(&state, ClientCommand::HsvUpdate(range)) {
        Ok(()) => Json(serde_json::json!({
            "status": "updated",
            "lower": range.lower,
            "upper": range.upper,
        }))
        .into_response(),
        Err(code) => code.into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

/// Parse one inbound duplex message. Unknown or malformed messages yield
/// `None`; the connection is preserved either way.
fn parse_command(text: &str) -> Option<ClientCommand> {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(cmd) => Some(cmd),
        Err(e) => {
            warn!("ignoring malformed client message: {e}");
            None
        }
    }
}

/// One task per connected duplex client.
async fn client_session(socket: WebSocket, state: AppState) {
    let (mut sink, mut inbound) = socket.split();
    let mut frame_rx = state.frame_tx.subscribe();
    let mut event_rx = state.event_tx.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let hello = ServerMessage::Connected {
        message: "SteadyScript duplex channel established".to_string(),
    };
    if send_message(&mut sink, &hello).await.is_err() {
        return;
    }
    debug!("duplex client connected");

    loop {
        tokio::select! {
            msg = inbound.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(command) = parse_command(&text) {
                        if let ClientCommand::HsvUpdate(range) = &command {
                            if let Err(e) = range.validate() {
                                let _ = reply_tx.send(ServerMessage::Error(e));
                                continue;
                            }
                        }
                        let req = ControlRequest {
                            command,
                            reply: Some(reply_tx.clone()),
                        };
                        if state.command_tx.send(req).is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary / ping / pong: ignored
                Some(Err(e)) => {
                    debug!("client transport error: {e}");
                    break;
                }
            },
            frame = frame_rx.recv() => match frame {
                Ok(jpeg) => {
                    let msg = ServerMessage::Frame(base64::encode(&jpeg[..]));
                    if send_message(&mut sink, &msg).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Backpressure: the oldest queued frames were dropped.
                    debug!("client lagging; skipped {n} frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = event_rx.recv() => match event {
                Ok(msg) => {
                    if send_message(&mut sink, &msg).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("client lagged behind {n} event messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            reply = reply_rx.recv() => {
                if let Some(msg) = reply {
                    if send_message(&mut sink, &msg).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!("duplex client disconnected");
}

async fn send_message(
    sink: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            warn!("failed to serialize server message: {e}");
            return Ok(());
        }
    };
    sink.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjpeg_part_framing() {
        let part = mjpeg_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(part.ends_with(b"\r\n"));
    }

    #[test]
    fn unknown_command_is_ignored_not_fatal() {
        assert!(parse_command(r#"{"type": "warp_drive"}"#).is_none());
        assert!(parse_command("not even json").is_none());
        assert_eq!(
            parse_command(r#"{"type": "session_stop"}"#),
            Some(ClientCommand::SessionStop)
        );
    }

    #[test]
    fn bpm_command_parses_with_data() {
        assert_eq!(
            parse_command(r#"{"type": "bpm_change", "data": {"delta": -5}}"#),
            Some(ClientCommand::BpmChange { delta: -5 })
        );
    }
}
