//! JSON envelopes exchanged on the telephony, observer and model sockets.
//!
//! Inbound parsing never fails loudly: anything that is not a JSON object
//! yields `None` and the caller drops the frame. Model and observer traffic is
//! otherwise passed through untouched; only the handful of kinds the relay
//! acts on are typed here.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::session::config::SessionConfig;

/// Parse a socket frame as a JSON object, or `None` if it is malformed.
pub fn parse_message(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => {
            tracing::debug!("Dropping non-object message");
            None
        }
        Err(e) => {
            tracing::debug!("Dropping malformed message: {e}");
            None
        }
    }
}

/// The `type` field of a model or observer message, if any.
pub fn message_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

// ---------------------------------------------------------------------------
// Telephony (Twilio Media Streams)
// ---------------------------------------------------------------------------

/// Twilio Media Stream WebSocket event types.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event")]
#[serde(rename_all = "lowercase")]
pub enum TelephonyEvent {
    Connected,
    Start {
        start: StartMetadata,
    },
    Media {
        media: MediaFrame,
    },
    Mark,
    Stop,
    Close,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct MediaFrame {
    /// Milliseconds since the stream started. Twilio sends this as a string.
    #[serde(default, deserialize_with = "timestamp_ms")]
    pub timestamp: u64,
    /// base64-encoded mu-law audio, forwarded untouched
    pub payload: String,
}

impl TelephonyEvent {
    pub fn parse(text: &str) -> Option<Self> {
        let value = parse_message(text)?;
        match serde_json::from_value(value) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!("Dropping unrecognised telephony event: {e}");
                None
            }
        }
    }
}

fn timestamp_ms<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(n) => Ok(n),
        Raw::Float(f) if f.is_finite() && f >= 0.0 => Ok(f as u64),
        Raw::Float(f) => Err(serde::de::Error::custom(format!("invalid timestamp {f}"))),
        Raw::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|e| serde::de::Error::custom(format!("invalid timestamp {s:?}: {e}"))),
    }
}

/// Messages sent back to Twilio.
#[derive(Debug, Serialize)]
#[serde(tag = "event")]
#[serde(rename_all = "lowercase")]
pub enum TelephonyCommand<'a> {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
        media: OutboundMedia<'a>,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
    },
}

#[derive(Debug, Serialize)]
pub struct OutboundMedia<'a> {
    pub payload: &'a str,
}

impl<'a> TelephonyCommand<'a> {
    pub fn media(stream_sid: &'a str, payload: &'a str) -> Self {
        Self::Media {
            stream_sid,
            media: OutboundMedia { payload },
        }
    }
}

// ---------------------------------------------------------------------------
// Realtime model
// ---------------------------------------------------------------------------

/// Client events the relay itself originates on the model socket.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ModelCommand<'a> {
    #[serde(rename = "session.update")]
    SessionUpdate { session: &'a SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: &'a str },
    #[serde(rename = "response.create")]
    CreateResponse,
    #[serde(rename = "conversation.item.truncate")]
    TruncateItem {
        item_id: &'a str,
        content_index: u32,
        audio_end_ms: u64,
    },
    #[serde(rename = "conversation.item.create")]
    CreateItem { item: ConversationItem<'a> },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ConversationItem<'a> {
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: &'a str, output: String },
}

/// Server events the relay interprets. Everything else is `Other` and only
/// mirrored to the observer.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ModelEvent {
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta {
        #[serde(default)]
        item_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item: OutputItem },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum OutputItem {
    #[serde(rename = "function_call")]
    FunctionCall(FunctionCall),
    #[serde(other)]
    Other,
}

/// A completed function call item issued by the model.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as produced by the model
    #[serde(default)]
    pub arguments: String,
    pub call_id: String,
}

impl ModelEvent {
    /// Classify an already-parsed model message. Shapes the relay does not
    /// understand (including malformed known kinds) become `Other`.
    pub fn classify(value: &Value) -> Self {
        match ModelEvent::deserialize(value) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(
                    kind = message_type(value).unwrap_or("<none>"),
                    "Model event not interpreted: {e}"
                );
                ModelEvent::Other
            }
        }
    }
}

pub fn to_text<T: Serialize>(message: &T) -> String {
    // Serializing these types cannot fail: all keys are strings and there are
    // no non-finite floats.
    serde_json::to_string(message).unwrap_or_default()
}
