//! HTTP and WebSocket server using Axum.

use crate::audit::AuditCommand;
use crate::client::{Outbound, Outbox, SessionState};
use crate::error::GatewayError;
use crate::publisher::Publisher;
use crate::server::GatewayContext;
use crate::session::Session;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Path, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// REST API version served under `/api/{version}`.
pub const API_VERSION: &str = "v1";

/// How long the writer gets to flush after a session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub type AppState = Arc<GatewayContext>;

/// Create the HTTP router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/{version}/{symbol}/{resource}", get(rest_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Health check handler.
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(health(&state))
}

fn health(state: &GatewayContext) -> Value {
    json!({
        "status": "ok",
        "connections": state.registry.len(),
        "instruments": state.publishers.len(),
    })
}

async fn rest_handler(
    State(state): State<AppState>,
    Path((version, symbol, resource)): Path<(String, String, String)>,
) -> Response {
    match rest_resource(&state, &version, &symbol, &resource) {
        Ok(body) => Json(body).into_response(),
        Err(message) => (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response(),
    }
}

fn rest_resource(
    state: &GatewayContext,
    version: &str,
    symbol: &str,
    resource: &str,
) -> Result<Value, String> {
    if version != API_VERSION {
        return Err(format!("unknown API version {}", version));
    }
    let publisher = state
        .publishers
        .get(symbol)
        .ok_or_else(|| format!("unknown instrument {}", symbol))?;
    match resource {
        "ticker" => serde_json::to_value(publisher.ticker()).map_err(|e| e.to_string()),
        "trades" => Ok(trades_json(publisher)),
        other => Err(format!("unknown resource {}", other)),
    }
}

fn trades_json(publisher: &Publisher) -> Value {
    let trades: Vec<Value> = publisher
        .recent_trades()
        .iter()
        .map(|t| {
            json!({
                "tid": t.id,
                "price": t.price,
                "amount": t.size,
                "side": t.side,
                "date": format!("{} {}", t.date, t.time),
            })
        })
        .collect();
    json!({ "symbol": publisher.symbol(), "trades": trades })
}

/// Client address, preferring proxy headers.
fn remote_addr(headers: &HeaderMap, peer: SocketAddr) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .unwrap_or_else(|| peer.ip().to_string())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let remote = remote_addr(&headers, peer);
    ws.on_upgrade(move |socket| handle_socket(socket, remote, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, remote: String, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbox, mut rx) = Outbox::channel();
    let mut session = Session::new(state.clone(), remote.clone(), outbox);
    let handle = session.handle().clone();

    info!("Client {} connected", remote);

    // Writer: everything the client receives, in queue order.
    let writer_handle = handle.clone();
    let audit = state.audit.clone();
    let send_task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(text) => {
                    audit.record(AuditCommand::Out, writer_handle.label(), Some(&text));
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    if session.open().await {
        // Reader: frames are queued so a closed socket is noticed even while
        // a handler is still running.
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Result<String, GatewayError>>();
        let reader_handle = handle.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let frame = match msg {
                    Ok(Message::Close(_)) => break,
                    Ok(msg) => match frame_text(msg) {
                        Some(frame) => frame,
                        None => continue,
                    },
                    Err(e) => {
                        debug!("WebSocket error for {}: {:?}", reader_handle.label(), e);
                        break;
                    }
                };
                if frame_tx.send(frame).is_err() {
                    break;
                }
            }
            reader_handle.request_close();
        });

        loop {
            tokio::select! {
                biased;

                Some(frame) = frame_rx.recv() => {
                    match frame {
                        Ok(text) => session.handle_frame(&text).await,
                        Err(e) => session.reject(e).await,
                    }
                    if session.state() == SessionState::Closed {
                        break;
                    }
                }

                _ = handle.closed() => {
                    session.teardown("connection closed").await;
                    break;
                }
            }
        }
        recv_task.abort();
    }

    session.teardown("connection closed").await;
    drop(session);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, send_task).await.is_err() {
        debug!("Writer for {} did not drain in time", remote);
    }

    info!("Client {} disconnected", remote);
}

/// Text of a data frame; `None` for control frames. Binary frames must
/// carry UTF-8.
fn frame_text(msg: Message) -> Option<Result<String, GatewayError>> {
    match msg {
        Message::Text(text) => Some(Ok(text.to_string())),
        Message::Binary(data) => Some(
            String::from_utf8(data.to_vec())
                .map_err(|e| GatewayError::Protocol(format!("binary frame is not UTF-8: {}", e))),
        ),
        _ => None,
    }
}
