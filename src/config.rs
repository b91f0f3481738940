use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub call: CallConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Publicly reachable base URL (e.g. an ngrok tunnel) used to build the
    /// media stream URL handed to Twilio.
    #[serde(default)]
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: String::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,
    #[serde(default = "default_realtime_model")]
    pub model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            realtime_url: default_realtime_url(),
            model: default_realtime_model(),
        }
    }
}

fn default_realtime_url() -> String {
    "wss://api.openai.com/v1/realtime".to_string()
}

fn default_realtime_model() -> String {
    "gpt-realtime".to_string()
}

/// Defaults for the `session.update` sent when the model connection opens.
/// Observer-supplied configuration is layered on top of these.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_instructions")]
    pub instructions: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    /// Include the registered capability schemas as `tools` in the defaults.
    #[serde(default = "default_true")]
    pub advertise_tools: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            voice: default_voice(),
            instructions: default_instructions(),
            transcription_model: default_transcription_model(),
            advertise_tools: true,
        }
    }
}

fn default_voice() -> String {
    "ash".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_instructions() -> String {
    "You are a friendly, concise voice assistant answering a phone call. \
     Speak naturally and keep replies short enough to be comfortable over the phone. \
     Greet the caller first and ask how you can help. \
     If the caller wants to leave feedback about a vehicle they bought, collect the vehicle, \
     a rating from 1 to 5 and their comments, then record it with the record_vehicle_experience tool. \
     Use get_weather_from_coords when the caller asks about the weather somewhere. \
     When the caller says goodbye or asks to end the call, say a brief farewell and call disconnect_call."
        .to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CallConfig {
    /// Text spoken by Twilio before the stream connects. `off`, `none`,
    /// `false` or `0` disable it.
    #[serde(default)]
    pub greeting: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file from same directory as config.toml
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                // Fall back to a .env in the working directory
                if dotenvy::dotenv().is_err() {
                    tracing::debug!(
                        "No .env file at {}, using environment only",
                        env_path.display()
                    );
                }
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        let mut config: Config = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!("Loading config from {}", path.display());
                toml::from_str(&contents)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "No config file at {}, using defaults and environment",
                    path.display()
                );
                Config::default()
            }
            Err(e) => {
                return Err(format!("Failed to read config at {}: {}", path.display(), e).into())
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(v) = var("OPENAI_API_KEY") {
            self.openai.api_key = v;
        }
        if let Some(v) = var("PUBLIC_URL") {
            self.server.public_url = v;
        }
        if let Some(v) = var("PORT") {
            self.server.port = v
                .parse()
                .map_err(|e| format!("Invalid PORT value {v:?}: {e}"))?;
        }
        if let Some(v) = var("CALL_GREETING") {
            self.call.greeting = Some(v);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.openai.api_key.trim().is_empty() {
            return Err("OPENAI_API_KEY is required (set it in the environment or [openai].api_key)".into());
        }
        Ok(())
    }
}

fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("CALL_RELAY_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".call-relay")
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("CALL_RELAY_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}
