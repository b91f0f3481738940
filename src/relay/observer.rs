use serde_json::Value;

use crate::codec::{message_type, parse_message};
use crate::session::config::{SessionConfigError, SessionOverrides};

use super::Relay;

impl Relay {
    /// Operator traffic goes to the model as-is; a `session.update` is also
    /// remembered for the next model connection.
    pub(super) fn on_observer_message(&mut self, text: &str) {
        let Some(value) = parse_message(text) else {
            return;
        };

        if let Some(model) = self.session.model.connection() {
            model.send_text(text.to_string());
        }

        if message_type(&value) != Some("session.update") {
            return;
        }

        let session = value.get("session").unwrap_or(&Value::Null);
        match self.validated_overrides(session) {
            Ok(overrides) => {
                tracing::info!("Saved observer session config");
                self.session.saved_config = Some(overrides);
            }
            Err(e) => tracing::warn!("Ignoring observer session config: {e}"),
        }
    }

    fn validated_overrides(&self, session: &Value) -> Result<SessionOverrides, SessionConfigError> {
        let overrides = SessionOverrides::from_value(session)?;
        self.settings.session_defaults.merge(&overrides)?;
        Ok(overrides)
    }
}
