use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};

pub mod handler;

pub use handler::WebSocketHandler;

use crate::server::KartonServer;

/// Create a router serving `server` on its configured websocket route
pub fn router(server: KartonServer) -> Router {
    let route = server.config().route.clone();
    Router::new()
        .route(&route, get(websocket_handler))
        .with_state(server)
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(server): State<KartonServer>,
) -> Response {
    ws.on_upgrade(move |socket| WebSocketHandler::new(socket, server).handle())
}
