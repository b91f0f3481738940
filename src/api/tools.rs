use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::registry::FunctionSchema;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUrlResponse {
    pub public_url: String,
}

/// GET /tools: schemas of every registered capability.
pub async fn handle_tools(State(state): State<AppState>) -> Json<Vec<FunctionSchema>> {
    Json(state.registry.schemas())
}

/// GET /public-url: the externally reachable base URL the server was given.
pub async fn handle_public_url(State(state): State<AppState>) -> Json<PublicUrlResponse> {
    Json(PublicUrlResponse {
        public_url: state.config.server.public_url.clone(),
    })
}
