use crate::api::AppState;
use crate::config::default_grouping_timeout;
use crate::storage::{DataKind, CONTENT_TYPE_FHIR_JSON};
use crate::types::{DataOrigin, DataService};
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use serde_json::json;
use tracing::{error, instrument, warn};
use uuid::Uuid;

/// FHIR ingress. Resources take the same post-processing path as every
/// other protocol; the gateway does not validate them beyond the resource
/// type.
pub fn routes() -> Router<AppState> {
	Router::new().route("/fhir/{resource_type}", post(create_resource))
}

#[instrument(skip_all, fields(resource_type))]
async fn create_resource(
	State(state): State<AppState>,
	Path(resource_type): Path<String>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	if !state.storage_info.has_space_to_store() {
		error!("Rejecting FHIR resource: insufficient storage");
		return StatusCode::INSUFFICIENT_STORAGE.into_response();
	}
	if body.is_empty() {
		return (StatusCode::BAD_REQUEST, "Request body is empty").into_response();
	}

	let content_type = headers
		.get(CONTENT_TYPE)
		.and_then(|value| value.to_str().ok())
		.unwrap_or(CONTENT_TYPE_FHIR_JSON)
		.to_owned();

	// For JSON bodies the resource type must match the path; XML payloads
	// are stored as-is.
	let mut resource_id = Uuid::new_v4().to_string();
	if content_type.contains("json") {
		let parsed: serde_json::Value = match serde_json::from_slice(&body) {
			Ok(parsed) => parsed,
			Err(err) => {
				warn!("Resource is not valid JSON: {err}");
				return (StatusCode::BAD_REQUEST, "Malformed JSON resource").into_response();
			}
		};
		let body_type = parsed
			.get("resourceType")
			.and_then(|v| v.as_str())
			.unwrap_or_default();
		if !body_type.eq_ignore_ascii_case(&resource_type) {
			return (
				StatusCode::BAD_REQUEST,
				format!("Resource type {body_type:?} does not match the request path"),
			)
				.into_response();
		}
		if let Some(id) = parsed.get("id").and_then(|v| v.as_str()) {
			resource_id = id.to_owned();
		}
	}

	let correlation_id = Uuid::new_v4().to_string();
	let origin = DataOrigin {
		data_service: DataService::Fhir,
		source: String::from("FHIR"),
		destination: String::from("FHIR"),
	};

	let result = state
		.processor
		.process_raw(
			body,
			DataKind::Fhir {
				resource_type: resource_type.clone(),
				resource_id: resource_id.clone(),
			},
			&resource_id,
			&content_type,
			&correlation_id,
			origin,
			Vec::new(),
			default_grouping_timeout(),
		)
		.await;

	match result {
		Ok(payload_id) => (
			StatusCode::CREATED,
			Json(json!({
				"resourceType": resource_type,
				"id": resource_id,
				"payloadId": payload_id,
			})),
		)
			.into_response(),
		Err(err) => {
			error!("Failed to ingest FHIR resource: {err}");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		}
	}
}
