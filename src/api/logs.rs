use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;

use crate::session::Role;
use crate::AppState;

/// WebSocket upgrade handler for GET /logs.
///
/// The operator UI watches model traffic here and may inject its own model
/// events, including a `session.update` kept for the next call.
pub async fn handle_logs_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| crate::socket::serve(socket, Role::Observer, state.relay))
}
