//! The realtime `session` object sent to the model when it connects.
//!
//! Defaults come from the `[model]` config section. The observer may push a
//! `session.update`; its fields replace the defaults one by one, and any keys
//! the relay does not model (temperature, tool_choice, ...) are carried along
//! untouched.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::config::ModelConfig;

const MODALITIES: &[&str] = &["text", "audio"];
const AUDIO_FORMATS: &[&str] = &["pcm16", "g711_ulaw", "g711_alaw"];

/// Telephony audio is 8 kHz mu-law in both directions.
const TELEPHONY_AUDIO_FORMAT: &str = "g711_ulaw";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub turn_detection: Value,
    pub voice: String,
    pub input_audio_transcription: Value,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub instructions: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Observer-supplied overrides. Absent fields keep the default; a field that
/// is present replaces it, `null` included. `null` is only meaningful for
/// the object-valued fields (it turns VAD or transcription off) and is
/// rejected for the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOverrides {
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A key that appears in the object is `Some`, even when its value is `null`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SessionConfigError {
    #[error("session config is not an object: {0}")]
    Malformed(String),
    #[error("voice must not be empty")]
    EmptyVoice,
    #[error("modalities must not be empty")]
    NoModalities,
    #[error("unsupported modality {0:?}")]
    Modality(String),
    #[error("unsupported audio format {0:?}")]
    AudioFormat(String),
}

impl SessionConfig {
    /// Relay defaults. `tools` is advertised when non-empty.
    pub fn defaults(model: &ModelConfig, tools: Vec<Value>) -> Self {
        let mut extra = Map::new();
        if !tools.is_empty() {
            extra.insert("tools".to_string(), Value::Array(tools));
        }
        Self {
            modalities: MODALITIES.iter().map(|m| m.to_string()).collect(),
            turn_detection: json!({ "type": "server_vad" }),
            voice: model.voice.clone(),
            input_audio_transcription: json!({ "model": model.transcription_model }),
            input_audio_format: TELEPHONY_AUDIO_FORMAT.to_string(),
            output_audio_format: TELEPHONY_AUDIO_FORMAT.to_string(),
            instructions: model.instructions.clone(),
            extra,
        }
    }

    /// Layer `overrides` over `self`, field by field, and validate the result.
    pub fn merge(&self, overrides: &SessionOverrides) -> Result<Self, SessionConfigError> {
        let mut merged = self.clone();
        if let Some(v) = &overrides.modalities {
            merged.modalities = v.clone();
        }
        if let Some(v) = &overrides.turn_detection {
            merged.turn_detection = v.clone();
        }
        if let Some(v) = &overrides.voice {
            merged.voice = v.clone();
        }
        if let Some(v) = &overrides.input_audio_transcription {
            merged.input_audio_transcription = v.clone();
        }
        if let Some(v) = &overrides.input_audio_format {
            merged.input_audio_format = v.clone();
        }
        if let Some(v) = &overrides.output_audio_format {
            merged.output_audio_format = v.clone();
        }
        if let Some(v) = &overrides.instructions {
            merged.instructions = v.clone();
        }
        for (key, value) in &overrides.extra {
            merged.extra.insert(key.clone(), value.clone());
        }
        merged.validate()?;
        Ok(merged)
    }

    fn validate(&self) -> Result<(), SessionConfigError> {
        if self.voice.trim().is_empty() {
            return Err(SessionConfigError::EmptyVoice);
        }
        if self.modalities.is_empty() {
            return Err(SessionConfigError::NoModalities);
        }
        if let Some(m) = self
            .modalities
            .iter()
            .find(|m| !MODALITIES.contains(&m.as_str()))
        {
            return Err(SessionConfigError::Modality(m.clone()));
        }
        for format in [&self.input_audio_format, &self.output_audio_format] {
            if !AUDIO_FORMATS.contains(&format.as_str()) {
                return Err(SessionConfigError::AudioFormat(format.clone()));
            }
        }
        Ok(())
    }
}

impl SessionOverrides {
    /// Read the `session` object of an observer `session.update`.
    pub fn from_value(value: &Value) -> Result<Self, SessionConfigError> {
        if !value.is_object() {
            return Err(SessionConfigError::Malformed(value.to_string()));
        }
        SessionOverrides::deserialize(value)
            .map_err(|e| SessionConfigError::Malformed(e.to_string()))
    }
}
