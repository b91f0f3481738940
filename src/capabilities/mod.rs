//! Tools shipped with the relay.

mod disconnect;
mod vehicle;
mod weather;

pub use disconnect::DisconnectCall;
pub use vehicle::RecordVehicleExperience;
pub use weather::WeatherFromCoords;

use crate::registry::{CapabilityRegistry, RegistryError};

/// Registry holding every built-in capability.
pub fn builtin() -> Result<CapabilityRegistry, RegistryError> {
    let mut registry = CapabilityRegistry::new();
    registry.register(WeatherFromCoords::new())?;
    registry.register(DisconnectCall)?;
    registry.register(RecordVehicleExperience)?;
    Ok(registry)
}
