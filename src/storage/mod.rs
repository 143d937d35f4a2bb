pub mod info;
pub mod object_store;
pub mod upload;

use crate::config::TemporaryDataStorage;
use crate::types::{DataOrigin, DataService};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

pub const CONTENT_TYPE_DICOM: &str = "application/dicom";
pub const CONTENT_TYPE_DICOM_JSON: &str = "application/json";
pub const CONTENT_TYPE_FHIR_JSON: &str = "application/fhir+json";
pub const CONTENT_TYPE_HL7: &str = "x-application/hl7-v2+er7";

/// Protocol-specific identity of a received object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataKind {
	#[serde(rename_all = "camelCase")]
	Dicom {
		study_instance_uid: String,
		series_instance_uid: String,
		sop_instance_uid: String,
	},
	#[serde(rename_all = "camelCase")]
	Fhir {
		resource_type: String,
		resource_id: String,
	},
	#[serde(rename_all = "camelCase")]
	Hl7 { message_control_id: String },
}

/// Upload lifecycle of a buffered object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
	Pending,
	Uploaded,
	Failed,
}

/// One file attached to a metadata record: the temporary buffer it lives in
/// now and, once uploaded, where it ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageFile {
	pub temporary_location: String,
	pub content_type: String,
	pub remote_path: Option<String>,
}

impl StorageFile {
	pub fn new(temporary_location: String, content_type: &str) -> Self {
		Self {
			temporary_location,
			content_type: content_type.to_owned(),
			remote_path: None,
		}
	}
}

/// Metadata record for a single received object. Created by an ingestor,
/// mutated by the upload worker, consumed by the payload assembler and
/// deleted once the owning payload is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStorageMetadata {
	/// Stable identity within the correlation scope, e.g. the SOP instance
	/// UID or the HL7 message control id.
	pub identifier: String,
	pub correlation_id: String,
	pub payload_id: Option<Uuid>,
	pub kind: DataKind,
	pub source: String,
	pub destination: String,
	pub data_service: DataService,
	pub workflows: Vec<String>,
	pub file: StorageFile,
	/// Optional DICOM-JSON sidecar, uploaded before the primary file.
	pub json_file: Option<StorageFile>,
	pub upload_state: UploadState,
	pub date_created: DateTime<Utc>,
}

impl FileStorageMetadata {
	pub fn new(
		identifier: impl Into<String>,
		correlation_id: impl Into<String>,
		kind: DataKind,
		origin: &DataOrigin,
		file: StorageFile,
	) -> Self {
		Self {
			identifier: identifier.into(),
			correlation_id: correlation_id.into(),
			payload_id: None,
			kind,
			source: origin.source.clone(),
			destination: origin.destination.clone(),
			data_service: origin.data_service,
			workflows: Vec::new(),
			file,
			json_file: None,
			upload_state: UploadState::Pending,
			date_created: Utc::now(),
		}
	}

	pub fn is_uploaded(&self) -> bool {
		self.upload_state == UploadState::Uploaded
	}

	/// Object key below the destination bucket. Before a payload id is
	/// assigned the correlation id scopes the key.
	pub fn remote_key(&self, extension: &str) -> String {
		let scope = self
			.payload_id
			.map_or_else(|| self.correlation_id.clone(), |id| id.to_string());
		format!("{scope}/{}{extension}", self.identifier)
	}

	pub fn file_extension(&self) -> &'static str {
		match self.kind {
			DataKind::Dicom { .. } => ".dcm",
			DataKind::Fhir { .. } => ".json",
			DataKind::Hl7 { .. } => ".hl7",
		}
	}
}

/// Where incoming bytes are buffered before the object store accepts them.
///
/// Memory mode keeps the bytes in a process-local map; disk mode spools to
/// the configured temporary directory. Locations are self-describing so a
/// record read back from the store can always find (or miss) its buffer.
pub struct TemporaryStore {
	mode: TemporaryDataStorage,
	root: PathBuf,
	buffers: Mutex<HashMap<String, Bytes>>,
}

const MEMORY_SCHEME: &str = "mem:";

impl TemporaryStore {
	pub fn new(mode: TemporaryDataStorage, root: impl Into<PathBuf>) -> Self {
		Self {
			mode,
			root: root.into(),
			buffers: Mutex::new(HashMap::new()),
		}
	}

	pub async fn write(&self, key: &str, bytes: Bytes) -> Result<String, TempStorageError> {
		match self.mode {
			TemporaryDataStorage::Memory => {
				let location = format!("{MEMORY_SCHEME}{key}");
				self.buffers.lock().unwrap().insert(location.clone(), bytes);
				Ok(location)
			}
			TemporaryDataStorage::Disk => {
				let path = self.root.join(key);
				if let Some(parent) = path.parent() {
					tokio::fs::create_dir_all(parent).await?;
				}
				tokio::fs::write(&path, &bytes).await?;
				Ok(path.to_string_lossy().into_owned())
			}
		}
	}

	pub async fn read(&self, location: &str) -> Result<Bytes, TempStorageError> {
		if location.starts_with(MEMORY_SCHEME) {
			self.buffers
				.lock()
				.unwrap()
				.get(location)
				.cloned()
				.ok_or_else(|| TempStorageError::Missing(location.to_owned()))
		} else {
			let bytes = tokio::fs::read(location).await?;
			Ok(Bytes::from(bytes))
		}
	}

	pub async fn remove(&self, location: &str) {
		if location.starts_with(MEMORY_SCHEME) {
			self.buffers.lock().unwrap().remove(location);
		} else {
			// Removal failures only delay cleanup of the spool directory.
			let _ = tokio::fs::remove_file(location).await;
		}
	}

	/// Whether the buffered bytes survived a restart. Memory buffers never do.
	pub fn survives_restart(&self, location: &str) -> bool {
		!location.starts_with(MEMORY_SCHEME) && Path::new(location).exists()
	}
}

#[derive(Debug, Error)]
pub enum TempStorageError {
	#[error("no buffered data at {0}")]
	Missing(String),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
	use super::*;

	fn dicom_kind() -> DataKind {
		DataKind::Dicom {
			study_instance_uid: String::from("1.2.3"),
			series_instance_uid: String::from("1.2.3.4"),
			sop_instance_uid: String::from("1.2.3.4.5"),
		}
	}

	fn origin() -> DataOrigin {
		DataOrigin {
			data_service: DataService::Dimse,
			source: String::from("MODALITY"),
			destination: String::from("GATEWAY"),
		}
	}

	#[test]
	fn remote_key_prefers_payload_scope() {
		let mut metadata = FileStorageMetadata::new(
			"1.2.3.4.5",
			"corr-1",
			dicom_kind(),
			&origin(),
			StorageFile::new(String::from("mem:x"), CONTENT_TYPE_DICOM),
		);
		assert_eq!(metadata.remote_key(".dcm"), "corr-1/1.2.3.4.5.dcm");

		let payload_id = Uuid::new_v4();
		metadata.payload_id = Some(payload_id);
		assert_eq!(
			metadata.remote_key(".dcm"),
			format!("{payload_id}/1.2.3.4.5.dcm")
		);
	}

	#[tokio::test]
	async fn memory_buffers_round_trip_and_vanish() {
		let store = TemporaryStore::new(TemporaryDataStorage::Memory, "/unused");
		let location = store
			.write("corr/file.dcm", Bytes::from_static(b"DICM"))
			.await
			.unwrap();

		assert_eq!(store.read(&location).await.unwrap(), Bytes::from_static(b"DICM"));
		assert!(!store.survives_restart(&location));

		store.remove(&location).await;
		assert!(store.read(&location).await.is_err());
	}

	#[tokio::test]
	async fn disk_buffers_survive_restart_checks() {
		let dir = tempfile::tempdir().unwrap();
		let store = TemporaryStore::new(TemporaryDataStorage::Disk, dir.path());
		let location = store
			.write("corr/file.dcm", Bytes::from_static(b"DICM"))
			.await
			.unwrap();

		assert!(store.survives_restart(&location));
		assert_eq!(store.read(&location).await.unwrap(), Bytes::from_static(b"DICM"));

		store.remove(&location).await;
		assert!(!store.survives_restart(&location));
	}
}
