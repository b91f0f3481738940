use crate::codec::{ModelCommand, TelephonyCommand};

use super::Relay;

/// How far into the assistant's audio the caller got before interrupting,
/// in milliseconds. Never negative, whatever order the clocks arrive in.
pub fn truncation_offset(started_at_ms: u64, latest_media_ms: u64) -> u64 {
    latest_media_ms.saturating_sub(started_at_ms)
}

impl Relay {
    /// Barge-in: cut the in-flight assistant item at the point the caller has
    /// heard and flush audio Twilio still has queued.
    ///
    /// Without a recorded turn this does nothing, so repeated speech-started
    /// events are harmless.
    pub(super) fn truncate_assistant_turn(&mut self) {
        let session = &mut self.session;
        let Some(turn) = session.assistant_turn.take() else {
            tracing::trace!("Speech started with no assistant audio in flight");
            return;
        };

        let audio_end_ms = truncation_offset(turn.started_at_ms, session.latest_media_timestamp_ms);

        if let Some(model) = session.model.connection() {
            model.send(&ModelCommand::TruncateItem {
                item_id: &turn.item_id,
                content_index: 0,
                audio_end_ms,
            });
        }

        if let (Some(telephony), Some(stream_sid)) = (&session.telephony, &session.stream_sid) {
            telephony.send(&TelephonyCommand::Clear { stream_sid });
        }

        tracing::info!(item_id = %turn.item_id, audio_end_ms, "Caller barged in, assistant turn truncated");
    }
}
