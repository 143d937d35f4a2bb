use crate::ae::DestinationApplicationEntity;
use crate::dimse::pool::{DestinationManager, DestinationPool, Pool};
use crate::dimse::scu::StoreServiceClassUser;
use crate::dimse::StatusType;
use crate::events::{ExportRequestEvent, FileExportStatus};
use crate::export::{ExportRequestDataMessage, ExportSender};
use crate::repository::AeRepository;
use crate::types::AE;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Ships export-task files to destination AEs over DIMSE C-STORE,
/// resolving destinations by name and pooling one association set per
/// destination.
pub struct DimseExportSender {
	entities: Arc<AeRepository>,
	calling_aet: AE,
	max_associations: usize,
	timeout: Duration,
	pools: Mutex<HashMap<String, DestinationPool>>,
}

impl DimseExportSender {
	pub fn new(
		entities: Arc<AeRepository>,
		calling_aet: impl Into<AE>,
		max_associations: usize,
		timeout: Duration,
	) -> Self {
		Self {
			entities,
			calling_aet: calling_aet.into(),
			max_associations: max_associations.max(1),
			timeout,
			pools: Mutex::new(HashMap::new()),
		}
	}

	async fn pool_for(
		&self,
		destination: &DestinationApplicationEntity,
	) -> Option<DestinationPool> {
		let mut pools = self.pools.lock().await;
		if let Some(pool) = pools.get(&destination.name) {
			return Some(pool.clone());
		}

		let manager = match DestinationManager::for_destination(&self.calling_aet, destination) {
			Ok(manager) => manager,
			Err(err) => {
				error!(
					destination = destination.name,
					"Cannot resolve destination: {err}"
				);
				return None;
			}
		};
		let pool = Pool::new(manager, self.max_associations, self.timeout);
		pools.insert(destination.name.clone(), pool.clone());
		Some(pool)
	}
}

#[async_trait]
impl ExportSender for DimseExportSender {
	fn agent(&self) -> &'static str {
		"dimse-export"
	}

	async fn send(
		&self,
		request: &ExportRequestEvent,
		message: &ExportRequestDataMessage,
	) -> FileExportStatus {
		if request.destinations.is_empty() {
			error!("Export request names no destinations");
			return FileExportStatus::ConfigurationError;
		}

		let file = match dicom::object::from_reader(message.bytes.as_ref()) {
			Ok(file) => file,
			Err(err) => {
				error!(file = message.file_path, "Stored object is not DICOM: {err}");
				return FileExportStatus::ServiceError;
			}
		};

		for name in &request.destinations {
			let Some(destination) = self.entities.destination_by_name(name) else {
				error!(destination = name, "Unknown destination AE");
				return FileExportStatus::ConfigurationError;
			};
			let Some(pool) = self.pool_for(&destination).await else {
				return FileExportStatus::ConfigurationError;
			};

			let scu = StoreServiceClassUser::new(pool, self.timeout);
			match scu.store(file.clone()).await {
				Ok(StatusType::Success) => {
					info!(
						destination = destination.name,
						file = message.file_path,
						"Instance exported via C-STORE"
					);
				}
				Ok(status) => {
					warn!(
						destination = destination.name,
						?status,
						"Remote rejected the instance"
					);
					return FileExportStatus::ServiceError;
				}
				Err(err) => {
					error!(destination = destination.name, "C-STORE failed: {err}");
					return FileExportStatus::ServiceError;
				}
			}
		}
		FileExportStatus::Success
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use uuid::Uuid;

	#[tokio::test]
	async fn unknown_destination_is_a_configuration_error() {
		let sender = DimseExportSender::new(
			Arc::new(AeRepository::new()),
			"GATEWAY",
			2,
			Duration::from_secs(5),
		);

		let request = ExportRequestEvent {
			export_task_id: Uuid::new_v4(),
			correlation_id: String::from("corr"),
			workflow_instance_id: None,
			files: vec![String::from("f1")],
			destinations: vec![String::from("missing")],
		};
		let message = ExportRequestDataMessage {
			export_task_id: request.export_task_id,
			correlation_id: request.correlation_id.clone(),
			file_path: String::from("f1"),
			bytes: crate::testing::dicom_bytes("1.2.3", "1.2.3.1", "1.2.3.1.1"),
			status: None,
		};

		let status = sender.send(&request, &message).await;
		assert_eq!(status, FileExportStatus::ConfigurationError);
	}
}
