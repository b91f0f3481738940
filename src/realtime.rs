//! Client side of the realtime model socket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::config::OpenAiConfig;
use crate::relay::{RelayEvent, RelayHandle};
use crate::session::{ConnId, Connection, Outbound, Role};

/// Opens model sockets on behalf of the relay.
#[async_trait]
pub trait ModelDialer: Send + Sync {
    /// Connect the model socket `id`.
    ///
    /// On success the dialer must send [`RelayEvent::ModelOpened`] before
    /// forwarding any inbound frame, then report every text frame as a
    /// [`RelayEvent::Message`] and the end of the socket as
    /// [`RelayEvent::Closed`].
    async fn dial(&self, api_key: &str, id: ConnId, relay: RelayHandle) -> Result<(), DialError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("invalid realtime request: {0}")]
    Request(String),
    #[error("failed to connect to realtime model: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Dials the OpenAI Realtime WebSocket API.
pub struct RealtimeDialer {
    url: String,
}

impl RealtimeDialer {
    pub fn new(config: &OpenAiConfig) -> Self {
        Self {
            url: realtime_url(&config.realtime_url, &config.model),
        }
    }
}

fn realtime_url(base: &str, model: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}model={model}")
}

#[async_trait]
impl ModelDialer for RealtimeDialer {
    async fn dial(&self, api_key: &str, id: ConnId, relay: RelayHandle) -> Result<(), DialError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| DialError::Request(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| DialError::Request(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws_stream, _) = connect_async(request).await?;
        let (mut sink, mut stream) = ws_stream.split();
        tracing::info!(conn = id, url = %self.url, "Connected to realtime model");

        let (conn, mut outbound) = Connection::open(id, Role::Model);
        relay.send(RelayEvent::ModelOpened(conn));

        // Writer: drain frames queued by the relay
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                match frame {
                    Outbound::Text(text) => {
                        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                            tracing::warn!(conn = id, "Failed to send to model: {e}");
                            break;
                        }
                    }
                    Outbound::Close => break,
                }
            }
            let _ = sink.close().await;
        });

        // Reader: forward model events to the relay
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => relay.send(RelayEvent::Message {
                        role: Role::Model,
                        id,
                        text: text.as_str().to_owned(),
                    }),
                    Ok(WsMessage::Close(frame)) => {
                        tracing::info!(conn = id, ?frame, "Model closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(conn = id, "Model socket error: {e}");
                        break;
                    }
                }
            }
            relay.send(RelayEvent::Closed {
                role: Role::Model,
                id,
            });
        });

        Ok(())
    }
}
