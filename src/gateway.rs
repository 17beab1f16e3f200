//! Client-facing WebSocket gateway (ambient; not part of the coordinator
//! core described in §§2-8). Bridges a WebSocket connection to a `ConnIo`,
//! the same way the teacher's `web.rs` bridges a WebSocket to the IRC
//! connection handler, except the wire framing here is one JSON-encoded
//! `CoordinateRequest`/`CoordinateResponse` per text frame rather than a
//! byte stream.
//!
//! Authentication is out of scope: `peer_id` arrives as a query parameter
//! and is trusted as-is, matching deployments that authenticate upstream
//! (a reverse proxy, a service mesh sidecar) and hand the coordinator an
//! already-verified identity.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::Authorizer;
use crate::connio::ConnIo;
use crate::coordinator::Coordinator;
use crate::model::{CoordinateRequest, CoordinateResponse};

const INBOUND_BUFFER: usize = 32;

#[derive(Clone)]
pub struct GatewayState {
    pub coordinator: Arc<Coordinator>,
    pub authorizer: Arc<dyn Authorizer>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/coordinate", get(ws_upgrade))
        .route("/api/v1/health", get(api_health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Deserialize)]
struct CoordinateQuery {
    peer_id: Uuid,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Query(query): Query<CoordinateQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state, query.peer_id))
}

async fn handle_ws(socket: WebSocket, state: GatewayState, peer_id: Uuid) {
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let (conn, outbound_rx, task) = ConnIo::spawn(
        peer_id,
        state.authorizer.clone(),
        inbound_rx,
        state.coordinator.binder_sender(),
        state.coordinator.tunneler_sender(),
        state.coordinator.handshaker_sender(),
    );
    state.coordinator.accept(conn.clone());
    bridge(socket, inbound_tx, outbound_rx).await;
    conn.close();
    let _ = task.await;
    state.coordinator.disconnect(&conn).await;
}

/// Shuttles JSON-framed requests/responses between the WebSocket and the
/// connection's inbound/outbound channels until either side closes.
async fn bridge(
    mut socket: WebSocket,
    inbound_tx: mpsc::Sender<CoordinateRequest>,
    mut outbound_rx: mpsc::Receiver<CoordinateResponse>,
) {
    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<CoordinateRequest>(&text) {
                            Ok(req) => {
                                if inbound_tx.send(req).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping malformed coordinate request"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            msg = outbound_rx.recv() => {
                match msg {
                    Some(resp) => {
                        let text = match serde_json::to_string(&resp) {
                            Ok(t) => t,
                            Err(e) => {
                                warn!(error = %e, "failed to encode coordinate response");
                                continue;
                            }
                        };
                        if socket.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    debug!("websocket bridge closing");
    let _ = socket.send(WsMessage::Close(None)).await;
}

#[derive(Serialize)]
struct HealthResponse {
    self_id: Uuid,
    healthy: bool,
}

async fn api_health(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(HealthResponse {
        self_id: state.coordinator.self_id(),
        healthy: state.coordinator.is_healthy(),
    })
}
