//! HTTP surface: WebSocket upgrades onto the room registry.

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tracing::{debug, warn};

use crate::registry::Registry;
use crate::transport::AxumWebSocket;

/// A router that upgrades every `GET /<room-name>` to a WebSocket served
/// by the registry. The room name is the URL path as received, with its
/// leading `/`.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/*path", get(ws_handler))
        .with_state(registry)
}

async fn ws_handler(
    State(registry): State<Arc<Registry>>,
    Path(path): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let room = format!("/{path}");
    debug!(room = %room, "websocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(registry, socket, room))
}

async fn handle_socket(registry: Arc<Registry>, socket: WebSocket, room: String) {
    let transport = Arc::new(AxumWebSocket::new(socket, room.clone()));
    if let Err(e) = registry.serve(transport).await {
        warn!(room = %room, error = %e, "websocket session ended with error");
    }
}
