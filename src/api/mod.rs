pub mod fhir;
pub mod health;
pub mod stow;

use crate::ingest::InstanceProcessor;
use crate::lifecycle::Orchestrator;
use crate::repository::AeRepository;
use crate::storage::info::StorageInfoProvider;
use axum::extract::DefaultBodyLimit;
use axum::Router;
use std::sync::Arc;

/// Shared handles for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
	pub processor: Arc<InstanceProcessor>,
	pub entities: Arc<AeRepository>,
	pub storage_info: Arc<StorageInfoProvider>,
	pub orchestrator: Arc<Orchestrator>,
}

pub fn routes(state: AppState, max_upload_size: usize) -> Router {
	Router::new()
		.merge(stow::routes())
		.merge(fhir::routes())
		.merge(health::routes())
		.layer(DefaultBodyLimit::max(max_upload_size))
		.layer(tower_http::trace::TraceLayer::new_for_http())
		.with_state(state)
}
