use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;

use crate::session::Role;
use crate::AppState;

/// WebSocket upgrade handler for GET /call.
///
/// Twilio opens this once the TwiML from `/twiml` is executed. A new call
/// preempts whatever call is still attached.
pub async fn handle_call_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| crate::socket::serve(socket, Role::Telephony, state.relay))
}
