use crate::types::DataOrigin;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One object referenced by a workflow request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStorageInfo {
	/// Object key relative to the bucket.
	pub path: String,
	/// Optional DICOM-JSON sidecar key.
	pub metadata_path: Option<String>,
}

/// Announcement of an assembled payload, published once per payload id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRequestEvent {
	pub payload_id: Uuid,
	pub bucket: String,
	pub correlation_id: String,
	pub workflows: Vec<String>,
	pub data_trigger: DataOrigin,
	pub data_origins: Vec<DataOrigin>,
	pub files: Vec<BlockStorageInfo>,
	pub file_count: u32,
	pub timestamp: DateTime<Utc>,
}

/// Request to ship a set of stored objects to one or more destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequestEvent {
	pub export_task_id: Uuid,
	pub correlation_id: String,
	pub workflow_instance_id: Option<String>,
	/// Object keys relative to the payload bucket.
	pub files: Vec<String>,
	/// Destination names; their meaning is exporter-specific.
	pub destinations: Vec<String>,
}

/// Terminal status of one exported file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileExportStatus {
	Success,
	DownloadError,
	ConfigurationError,
	ServiceError,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportStatus {
	Success,
	Failure,
}

/// Outcome of a processed export request, one per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportCompleteEvent {
	pub export_task_id: Uuid,
	pub correlation_id: String,
	pub workflow_instance_id: Option<String>,
	pub status: ExportStatus,
	pub file_statuses: HashMap<String, FileExportStatus>,
}

impl ExportCompleteEvent {
	/// Overall status is `Success` iff every file succeeded.
	pub fn from_file_statuses(
		request: &ExportRequestEvent,
		file_statuses: HashMap<String, FileExportStatus>,
	) -> Self {
		let status = if !file_statuses.is_empty()
			&& file_statuses
				.values()
				.all(|s| *s == FileExportStatus::Success)
		{
			ExportStatus::Success
		} else {
			ExportStatus::Failure
		};

		Self {
			export_task_id: request.export_task_id,
			correlation_id: request.correlation_id.clone(),
			workflow_instance_id: request.workflow_instance_id.clone(),
			status,
			file_statuses,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request() -> ExportRequestEvent {
		ExportRequestEvent {
			export_task_id: Uuid::new_v4(),
			correlation_id: String::from("corr"),
			workflow_instance_id: None,
			files: vec![String::from("f1"), String::from("f2")],
			destinations: vec![String::from("d1")],
		}
	}

	#[test]
	fn all_success_is_success() {
		let statuses = HashMap::from([
			(String::from("f1"), FileExportStatus::Success),
			(String::from("f2"), FileExportStatus::Success),
		]);
		let event = ExportCompleteEvent::from_file_statuses(&request(), statuses);
		assert_eq!(event.status, ExportStatus::Success);
	}

	#[test]
	fn any_failure_is_failure() {
		let statuses = HashMap::from([
			(String::from("f1"), FileExportStatus::Success),
			(String::from("f2"), FileExportStatus::ServiceError),
		]);
		let event = ExportCompleteEvent::from_file_statuses(&request(), statuses);
		assert_eq!(event.status, ExportStatus::Failure);
	}

	#[test]
	fn no_files_is_failure() {
		let event = ExportCompleteEvent::from_file_statuses(&request(), HashMap::new());
		assert_eq!(event.status, ExportStatus::Failure);
	}

	#[test]
	fn workflow_request_round_trips_as_json() {
		let event = WorkflowRequestEvent {
			payload_id: Uuid::new_v4(),
			bucket: String::from("gateway"),
			correlation_id: String::from("corr"),
			workflows: vec![String::from("wf")],
			data_trigger: DataOrigin {
				data_service: crate::types::DataService::Dimse,
				source: String::from("MODALITY"),
				destination: String::from("GATEWAY"),
			},
			data_origins: Vec::new(),
			files: vec![BlockStorageInfo {
				path: String::from("p/1.dcm"),
				metadata_path: Some(String::from("p/1.dcm.json")),
			}],
			file_count: 1,
			timestamp: Utc::now(),
		};

		let json = serde_json::to_string(&event).unwrap();
		let parsed: WorkflowRequestEvent = serde_json::from_str(&json).unwrap();
		assert_eq!(parsed.payload_id, event.payload_id);
		assert_eq!(parsed.files, event.files);
	}
}
