use std::sync::Arc;

use crate::codec::{parse_message, ModelCommand, ModelEvent, OutputItem, TelephonyCommand};
use crate::session::{AssistantTurn, ConnId, Connection, ModelLink};

use super::{Relay, RelayEvent};

impl Relay {
    /// Dial the model once the call has a stream and a credential.
    ///
    /// At most one dial per call: an open or in-flight link is left alone and
    /// a dropped link is not redialled.
    pub(super) fn try_connect_model(&mut self) {
        let session = &mut self.session;
        if session.telephony.is_none() || session.stream_sid.is_none() {
            return;
        }
        let Some(api_key) = session.api_key.clone() else {
            return;
        };
        if session.model.is_attached() {
            tracing::debug!("Model connection already established");
            return;
        }

        let id = self.handle.next_conn_id();
        session.model = ModelLink::Connecting(id);
        tracing::info!(conn = id, "Connecting to realtime model");

        let dialer = Arc::clone(&self.dialer);
        let relay = self.handle.clone();
        tokio::spawn(async move {
            if let Err(e) = dialer.dial(&api_key, id, relay.clone()).await {
                relay.send(RelayEvent::ModelDialFailed {
                    id,
                    error: e.to_string(),
                });
            }
        });
    }

    /// Initialise a freshly opened model socket: session config, then ask
    /// for the first turn.
    pub(super) fn on_model_opened(&mut self, conn: Connection) {
        let expected = matches!(self.session.model, ModelLink::Connecting(id) if id == conn.id());
        if !expected {
            tracing::info!(conn = conn.id(), "Model connected after its call ended, closing");
            conn.close();
            return;
        }

        let defaults = &self.settings.session_defaults;
        let config = match &self.session.saved_config {
            Some(overrides) => defaults.merge(overrides).unwrap_or_else(|e| {
                tracing::warn!("Saved session config rejected, using defaults: {e}");
                defaults.clone()
            }),
            None => defaults.clone(),
        };

        conn.send(&ModelCommand::SessionUpdate { session: &config });
        conn.send(&ModelCommand::CreateResponse);
        tracing::info!(conn = conn.id(), voice = %config.voice, "Model session initialised");

        self.session.model = ModelLink::Open(conn);
    }

    pub(super) fn on_model_message(&mut self, id: ConnId, text: &str) {
        let Some(value) = parse_message(text) else {
            return;
        };

        if let Some(observer) = &self.session.observer {
            observer.send_text(text.to_string());
        }

        match ModelEvent::classify(&value) {
            ModelEvent::SpeechStarted => self.truncate_assistant_turn(),
            ModelEvent::AudioDelta { item_id, delta } => self.on_audio_delta(item_id, &delta),
            ModelEvent::OutputItemDone {
                item: OutputItem::FunctionCall(call),
            } => self.dispatch_function_call(id, call),
            ModelEvent::OutputItemDone { .. } | ModelEvent::Other => {}
        }
    }

    /// Relay one chunk of assistant audio to the caller.
    fn on_audio_delta(&mut self, item_id: Option<String>, delta: &str) {
        let session = &mut self.session;
        if session.telephony.is_none() || session.stream_sid.is_none() {
            return;
        }

        // The turn starts on the telephony clock, not wall time, so barge-in
        // offsets line up with what the caller has actually heard.
        if let Some(item_id) = item_id {
            if let Some(turn) = session.assistant_turn.as_mut() {
                turn.item_id = item_id;
            } else {
                tracing::debug!(
                    item_id = %item_id,
                    started_at_ms = session.latest_media_timestamp_ms,
                    "Assistant turn started"
                );
                session.assistant_turn = Some(AssistantTurn {
                    item_id,
                    started_at_ms: session.latest_media_timestamp_ms,
                });
            }
        }

        if let (Some(telephony), Some(stream_sid)) = (&session.telephony, &session.stream_sid) {
            telephony.send(&TelephonyCommand::media(stream_sid, delta));
            telephony.send(&TelephonyCommand::Mark { stream_sid });
        }
    }
}
