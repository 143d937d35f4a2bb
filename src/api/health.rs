use crate::api::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;

pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/health/status", get(status))
		.route("/health/ready", get(ready))
}

/// Running state of every background service.
async fn status(State(state): State<AppState>) -> impl IntoResponse {
	let services: serde_json::Map<String, serde_json::Value> = state
		.orchestrator
		.statuses()
		.into_iter()
		.map(|(name, status)| (name.to_owned(), json!(status)))
		.collect();

	Json(json!({ "services": services }))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
	if state.orchestrator.all_running() {
		(StatusCode::OK, "Healthy")
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "Unhealthy")
	}
}
