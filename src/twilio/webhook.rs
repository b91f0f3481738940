use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::AppState;

const DEFAULT_GREETING: &str = "Hi";

/// Greeting values that turn the spoken preamble off.
const GREETING_DISABLED: &[&str] = &["off", "none", "false", "0"];

#[derive(Debug, Default, Deserialize)]
pub struct TwimlQuery {
    /// Per-call greeting override.
    #[serde(default)]
    g: Option<String>,
}

/// Handle GET|POST /twiml: Twilio webhook for incoming calls.
///
/// Responds with TwiML that greets the caller and connects the call to the
/// `/call` media stream.
pub async fn handle_twiml(
    State(state): State<AppState>,
    Query(query): Query<TwimlQuery>,
) -> Response {
    let twiml = render_twiml(
        &state.config.server.public_url,
        query.g.as_deref(),
        state.config.call.greeting.as_deref(),
    );
    ([("Content-Type", "text/xml")], twiml).into_response()
}

/// Build the TwiML document. The query greeting wins over the configured one.
pub fn render_twiml(public_url: &str, requested: Option<&str>, configured: Option<&str>) -> String {
    let ws_url = media_stream_url(public_url);

    let chosen = requested
        .filter(|g| !g.is_empty())
        .or(configured.filter(|g| !g.is_empty()));
    let say = match chosen {
        Some(g) if is_disabled(g) => String::new(),
        Some(g) => format!("\n    <Say>{}</Say>", escape_xml(g)),
        None => format!("\n    <Say>{DEFAULT_GREETING}</Say>"),
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>{say}
    <Connect>
        <Stream url="{ws_url}" />
    </Connect>
</Response>"#
    )
}

fn is_disabled(greeting: &str) -> bool {
    GREETING_DISABLED
        .iter()
        .any(|d| greeting.eq_ignore_ascii_case(d))
}

/// `wss://<host>/call` for whatever scheme and path the public URL has.
fn media_stream_url(public_url: &str) -> String {
    let rest = public_url
        .split_once("://")
        .map_or(public_url, |(_, rest)| rest);
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    format!("wss://{host}/call")
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
