use axum::extract::ws::{Message, WebSocket};

use crate::relay::{RelayEvent, RelayHandle};
use crate::session::{Connection, Outbound, Role};

/// Pump one accepted WebSocket for the relay.
///
/// Inbound text frames become [`RelayEvent::Message`]; frames the relay queues
/// on the connection are written back. Uses `tokio::select!` so reads keep
/// flowing while the relay is writing. Either side closing ends the loop and
/// the relay is told with [`RelayEvent::Closed`].
pub async fn serve(mut socket: WebSocket, role: Role, relay: RelayHandle) {
    let id = relay.next_conn_id();
    let (conn, mut outbound) = Connection::open(id, role);
    relay.send(RelayEvent::Connected(conn));

    loop {
        tokio::select! {
            ws_msg = socket.recv() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => relay.send(RelayEvent::Message {
                        role,
                        id,
                        text: text.as_str().to_owned(),
                    }),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(%role, conn = id, "Peer closed socket");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(%role, conn = id, "WebSocket error: {e}");
                        break;
                    }
                    _ => continue,
                }
            }

            frame = outbound.recv() => {
                match frame {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = socket.send(Message::Text(text.into())).await {
                            tracing::warn!(%role, conn = id, "Failed to send frame: {e}");
                            break;
                        }
                    }
                    // Closed by the relay, or the relay dropped the connection
                    Some(Outbound::Close) | None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    relay.send(RelayEvent::Closed { role, id });
}
