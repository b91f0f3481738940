use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::registry::{CallContext, Capability, CapabilityError, FunctionSchema};

const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";

/// Current temperature at a coordinate, from Open-Meteo (no API key needed).
pub struct WeatherFromCoords {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct Coords {
    latitude: f64,
    longitude: f64,
}

impl Default for WeatherFromCoords {
    fn default() -> Self {
        Self::new()
    }
}

impl WeatherFromCoords {
    pub fn new() -> Self {
        Self::with_base_url(FORECAST_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl Capability for WeatherFromCoords {
    fn schema(&self) -> FunctionSchema {
        FunctionSchema::new(
            "get_weather_from_coords",
            "Get the current weather",
            json!({
                "type": "object",
                "properties": {
                    "latitude": { "type": "number" },
                    "longitude": { "type": "number" }
                },
                "required": ["latitude", "longitude"]
            }),
        )
    }

    async fn call(&self, args: Value, _ctx: &CallContext) -> Result<Value, CapabilityError> {
        let coords: Coords =
            serde_json::from_value(args).map_err(|e| CapabilityError::InvalidInput(e.to_string()))?;

        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("latitude", coords.latitude.to_string()),
                ("longitude", coords.longitude.to_string()),
                ("current", "temperature_2m,wind_speed_10m".to_string()),
                (
                    "hourly",
                    "temperature_2m,relative_humidity_2m,wind_speed_10m".to_string(),
                ),
            ])
            .send()
            .await
            .map_err(|e| CapabilityError::Upstream(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CapabilityError::Upstream(format!("{status}: {body}")));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| CapabilityError::Upstream(e.to_string()))?;

        let temp = body
            .pointer("/current/temperature_2m")
            .cloned()
            .unwrap_or(Value::Null);
        tracing::debug!(
            latitude = coords.latitude,
            longitude = coords.longitude,
            %temp,
            "Weather fetched"
        );

        Ok(json!({ "temp": temp }))
    }
}
