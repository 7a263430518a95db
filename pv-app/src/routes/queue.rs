use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use pv_sched::SchedulerSnapshot;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/queue", get(get_queue))
}

/// Admission counters plus the conversation keys still inside a debounce window.
#[tracing::instrument(level = "debug", skip_all)]
async fn get_queue(Extension(state): Extension<Arc<AppState>>) -> Json<SchedulerSnapshot> {
    Json(state.scheduler.snapshot())
}
