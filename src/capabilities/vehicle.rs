use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::registry::{CallContext, Capability, CapabilityError, FunctionSchema};

/// Captures a caller's rating and feedback about a vehicle they bought.
///
/// The result is echoed back so the observer can store the function call and
/// its output pair.
pub struct RecordVehicleExperience;

#[derive(Debug, Deserialize)]
struct Args {
    vehicle: String,
    rating: f64,
    feedback: String,
}

/// Round to the nearest integer and clamp into 1..=5.
fn clamp_rating(rating: f64) -> i64 {
    rating.round().clamp(1.0, 5.0) as i64
}

#[async_trait]
impl Capability for RecordVehicleExperience {
    fn schema(&self) -> FunctionSchema {
        FunctionSchema::new(
            "record_vehicle_experience",
            "Record a customer's rating (1-5) and free-form feedback about a vehicle they purchased.",
            json!({
                "type": "object",
                "properties": {
                    "vehicle": { "type": "string", "description": "Vehicle model or identifier" },
                    "rating": { "type": "number", "description": "Integer rating 1-5" },
                    "feedback": { "type": "string", "description": "Customer feedback text" }
                },
                "required": ["vehicle", "rating", "feedback"]
            }),
        )
    }

    async fn call(&self, args: Value, _ctx: &CallContext) -> Result<Value, CapabilityError> {
        let args: Args =
            serde_json::from_value(args).map_err(|e| CapabilityError::InvalidInput(e.to_string()))?;
        if !args.rating.is_finite() {
            return Err(CapabilityError::InvalidInput(format!(
                "rating must be a number, got {}",
                args.rating
            )));
        }
        let rating = clamp_rating(args.rating);
        tracing::info!(vehicle = %args.vehicle, rating, "Vehicle experience recorded");

        Ok(json!({
            "status": "received",
            "vehicle": args.vehicle,
            "rating": rating,
            "feedback": args.feedback,
            "serverTimestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }))
    }
}
