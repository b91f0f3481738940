use crate::codec::{ModelCommand, TelephonyEvent};

use super::Relay;

impl Relay {
    pub(super) fn on_telephony_message(&mut self, text: &str) {
        let Some(event) = TelephonyEvent::parse(text) else {
            return;
        };

        match event {
            TelephonyEvent::Start { start } => {
                tracing::info!(
                    stream_sid = %start.stream_sid,
                    call_sid = start.call_sid.as_deref().unwrap_or(""),
                    "Stream started"
                );
                self.session.stream_sid = Some(start.stream_sid);
                self.session.latest_media_timestamp_ms = 0;
                self.session.assistant_turn = None;
                self.try_connect_model();
            }
            TelephonyEvent::Media { media } => {
                self.session.latest_media_timestamp_ms = media.timestamp;
                match self.session.model.connection() {
                    Some(model) => model.send(&ModelCommand::AppendAudio {
                        audio: &media.payload,
                    }),
                    // Not buffered: audio before the model is ready is lost
                    None => tracing::trace!(
                        timestamp = media.timestamp,
                        "Model not open, dropping media frame"
                    ),
                }
            }
            TelephonyEvent::Close => {
                tracing::info!("Telephony requested close");
                self.session.close_all();
            }
            TelephonyEvent::Connected => tracing::debug!("Telephony stream connected"),
            TelephonyEvent::Mark => tracing::trace!("Playback mark reached"),
            TelephonyEvent::Stop => tracing::info!("Stream stopped"),
            TelephonyEvent::Unknown => tracing::trace!("Ignoring telephony event"),
        }
    }
}
