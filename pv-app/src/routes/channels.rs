use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::routing::get;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/channels", get(list_channels))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_channels(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut channels: Vec<serde_json::Value> = state
        .capability_matrix
        .iter()
        .map(|(id, caps)| {
            serde_json::json!({
                "id": id,
                "supports_message_edits": caps.supports_message_edits,
            })
        })
        .collect();
    channels.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
    Json(serde_json::json!({ "channels": channels }))
}
