use crate::ae::{
	AeValidationError, DestinationApplicationEntity, MonaiApplicationEntity,
	SourceApplicationEntity, VirtualApplicationEntity,
};
use crate::payload::{Payload, PayloadState};
use crate::storage::{FileStorageMetadata, UploadState};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
	#[error("record {0} already exists")]
	Duplicate(String),
	#[error("record {0} does not exist")]
	NotFound(String),
	#[error("entity is invalid: {0}")]
	Validation(#[from] AeValidationError),
	#[error("storage backend error: {0}")]
	Backend(String),
}

/// Audit record written when a DICOM association reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DicomAssociationInfo {
	pub id: Uuid,
	pub correlation_id: String,
	pub calling_aet: String,
	pub called_aet: String,
	pub remote_host: String,
	pub remote_port: u16,
	pub file_count: u32,
	pub created_at: DateTime<Utc>,
	pub disconnected_at: Option<DateTime<Utc>>,
	pub errors: Vec<String>,
}

impl DicomAssociationInfo {
	pub fn duration(&self) -> Option<Duration> {
		self.disconnected_at.map(|end| end - self.created_at)
	}
}

/// Book-keeping row for instances proxied to an external application: the
/// rewritten outgoing UID and what it replaced. Rows expire after
/// [`REMOTE_APP_EXECUTION_TTL_DAYS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAppExecution {
	pub outgoing_uid: String,
	pub request_time: DateTime<Utc>,
	pub original_values: HashMap<String, String>,
}

pub const REMOTE_APP_EXECUTION_TTL_DAYS: i64 = 7;

/// Per-object metadata rows, keyed by `(correlation_id, identifier)`.
#[async_trait]
pub trait MetadataRepository: Send + Sync {
	async fn save(&self, metadata: &FileStorageMetadata) -> Result<(), RepositoryError>;
	async fn update(&self, metadata: &FileStorageMetadata) -> Result<(), RepositoryError>;
	async fn get(
		&self,
		correlation_id: &str,
		identifier: &str,
	) -> Result<Option<FileStorageMetadata>, RepositoryError>;
	/// Every record still waiting for its upload, oldest first.
	async fn pending_uploads(&self) -> Result<Vec<FileStorageMetadata>, RepositoryError>;
	async fn delete(&self, correlation_id: &str, identifier: &str) -> Result<(), RepositoryError>;
}

/// Durable payload rows backing the assembler's crash recovery.
#[async_trait]
pub trait PayloadRepository: Send + Sync {
	async fn save(&self, payload: &Payload) -> Result<(), RepositoryError>;
	async fn update(&self, payload: &Payload) -> Result<(), RepositoryError>;
	async fn get(&self, payload_id: Uuid) -> Result<Option<Payload>, RepositoryError>;
	/// Payloads in a non-terminal state, for rehydration after a restart.
	async fn unpublished(&self) -> Result<Vec<Payload>, RepositoryError>;
	async fn delete(&self, payload_id: Uuid) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait AssociationRepository: Send + Sync {
	async fn add(&self, info: &DicomAssociationInfo) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait RemoteAppExecutionRepository: Send + Sync {
	async fn add(&self, execution: &RemoteAppExecution) -> Result<(), RepositoryError>;
	async fn get(&self, outgoing_uid: &str) -> Result<Option<RemoteAppExecution>, RepositoryError>;
	async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError>;
}

/// The application-entity registry consumed by the ingress and export
/// paths. CRUD beyond seeding belongs to the admin plane.
pub struct AeRepository {
	monai: Mutex<Vec<MonaiApplicationEntity>>,
	sources: Mutex<Vec<SourceApplicationEntity>>,
	destinations: Mutex<Vec<DestinationApplicationEntity>>,
	virtuals: Mutex<Vec<VirtualApplicationEntity>>,
}

impl AeRepository {
	pub fn new() -> Self {
		Self {
			monai: Mutex::new(Vec::new()),
			sources: Mutex::new(Vec::new()),
			destinations: Mutex::new(Vec::new()),
			virtuals: Mutex::new(Vec::new()),
		}
	}

	pub fn insert_monai(&self, mut entity: MonaiApplicationEntity) -> Result<(), RepositoryError> {
		entity.set_default_values();
		entity.validate()?;
		let mut entities = self.monai.lock().unwrap();
		if entities.iter().any(|e| e.name == entity.name) {
			return Err(RepositoryError::Duplicate(entity.name));
		}
		entities.push(entity);
		Ok(())
	}

	pub fn insert_source(&self, entity: SourceApplicationEntity) -> Result<(), RepositoryError> {
		entity.validate()?;
		let mut entities = self.sources.lock().unwrap();
		if entities.iter().any(|e| e.name == entity.name) {
			return Err(RepositoryError::Duplicate(entity.name));
		}
		entities.push(entity);
		Ok(())
	}

	pub fn insert_destination(
		&self,
		entity: DestinationApplicationEntity,
	) -> Result<(), RepositoryError> {
		entity.validate()?;
		let mut entities = self.destinations.lock().unwrap();
		if entities.iter().any(|e| e.name == entity.name) {
			return Err(RepositoryError::Duplicate(entity.name));
		}
		entities.push(entity);
		Ok(())
	}

	pub fn insert_virtual(&self, entity: VirtualApplicationEntity) -> Result<(), RepositoryError> {
		let mut entities = self.virtuals.lock().unwrap();
		if entities.iter().any(|e| e.name == entity.name) {
			return Err(RepositoryError::Duplicate(entity.name));
		}
		entities.push(entity);
		Ok(())
	}

	pub fn monai_by_aet(&self, aet: &str) -> Option<MonaiApplicationEntity> {
		self.monai
			.lock()
			.unwrap()
			.iter()
			.find(|e| e.ae_title == aet)
			.cloned()
	}

	pub fn all_monai(&self) -> Vec<MonaiApplicationEntity> {
		self.monai.lock().unwrap().clone()
	}

	pub fn source_matches(&self, calling_aet: &str, host: &str) -> bool {
		self.sources
			.lock()
			.unwrap()
			.iter()
			.any(|e| e.matches(calling_aet, host))
	}

	pub fn has_sources(&self) -> bool {
		!self.sources.lock().unwrap().is_empty()
	}

	pub fn destination_by_name(&self, name: &str) -> Option<DestinationApplicationEntity> {
		self.destinations
			.lock()
			.unwrap()
			.iter()
			.find(|e| e.name == name)
			.cloned()
	}

	pub fn virtual_by_name(&self, name: &str) -> Option<VirtualApplicationEntity> {
		self.virtuals
			.lock()
			.unwrap()
			.iter()
			.find(|e| e.name == name)
			.cloned()
	}
}

impl Default for AeRepository {
	fn default() -> Self {
		Self::new()
	}
}

/// In-memory metadata rows. The trait seam keeps the door open for a
/// durable engine without touching the callers.
#[derive(Default)]
pub struct InMemoryMetadataRepository {
	rows: Mutex<HashMap<(String, String), FileStorageMetadata>>,
}

impl InMemoryMetadataRepository {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.rows.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait]
impl MetadataRepository for InMemoryMetadataRepository {
	async fn save(&self, metadata: &FileStorageMetadata) -> Result<(), RepositoryError> {
		self.rows.lock().unwrap().insert(
			(metadata.correlation_id.clone(), metadata.identifier.clone()),
			metadata.clone(),
		);
		Ok(())
	}

	async fn update(&self, metadata: &FileStorageMetadata) -> Result<(), RepositoryError> {
		let key = (metadata.correlation_id.clone(), metadata.identifier.clone());
		let mut rows = self.rows.lock().unwrap();
		if !rows.contains_key(&key) {
			return Err(RepositoryError::NotFound(format!(
				"{}/{}",
				key.0, key.1
			)));
		}
		rows.insert(key, metadata.clone());
		Ok(())
	}

	async fn get(
		&self,
		correlation_id: &str,
		identifier: &str,
	) -> Result<Option<FileStorageMetadata>, RepositoryError> {
		Ok(self
			.rows
			.lock()
			.unwrap()
			.get(&(correlation_id.to_owned(), identifier.to_owned()))
			.cloned())
	}

	async fn pending_uploads(&self) -> Result<Vec<FileStorageMetadata>, RepositoryError> {
		let mut pending: Vec<FileStorageMetadata> = self
			.rows
			.lock()
			.unwrap()
			.values()
			.filter(|m| m.upload_state == UploadState::Pending)
			.cloned()
			.collect();
		pending.sort_by_key(|m| m.date_created);
		Ok(pending)
	}

	async fn delete(&self, correlation_id: &str, identifier: &str) -> Result<(), RepositoryError> {
		self.rows
			.lock()
			.unwrap()
			.remove(&(correlation_id.to_owned(), identifier.to_owned()));
		Ok(())
	}
}

#[derive(Default)]
pub struct InMemoryPayloadRepository {
	rows: Mutex<HashMap<Uuid, Payload>>,
}

impl InMemoryPayloadRepository {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl PayloadRepository for InMemoryPayloadRepository {
	async fn save(&self, payload: &Payload) -> Result<(), RepositoryError> {
		self.rows
			.lock()
			.unwrap()
			.insert(payload.payload_id, payload.clone());
		Ok(())
	}

	async fn update(&self, payload: &Payload) -> Result<(), RepositoryError> {
		let mut rows = self.rows.lock().unwrap();
		if !rows.contains_key(&payload.payload_id) {
			return Err(RepositoryError::NotFound(payload.payload_id.to_string()));
		}
		rows.insert(payload.payload_id, payload.clone());
		Ok(())
	}

	async fn get(&self, payload_id: Uuid) -> Result<Option<Payload>, RepositoryError> {
		Ok(self.rows.lock().unwrap().get(&payload_id).cloned())
	}

	async fn unpublished(&self) -> Result<Vec<Payload>, RepositoryError> {
		let mut payloads: Vec<Payload> = self
			.rows
			.lock()
			.unwrap()
			.values()
			.filter(|p| !matches!(p.state, PayloadState::Published | PayloadState::Failed))
			.cloned()
			.collect();
		payloads.sort_by_key(|p| p.date_created);
		Ok(payloads)
	}

	async fn delete(&self, payload_id: Uuid) -> Result<(), RepositoryError> {
		self.rows.lock().unwrap().remove(&payload_id);
		Ok(())
	}
}

#[derive(Default)]
pub struct InMemoryAssociationRepository {
	rows: Mutex<Vec<DicomAssociationInfo>>,
}

impl InMemoryAssociationRepository {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn all(&self) -> Vec<DicomAssociationInfo> {
		self.rows.lock().unwrap().clone()
	}
}

#[async_trait]
impl AssociationRepository for InMemoryAssociationRepository {
	async fn add(&self, info: &DicomAssociationInfo) -> Result<(), RepositoryError> {
		self.rows.lock().unwrap().push(info.clone());
		Ok(())
	}
}

#[derive(Default)]
pub struct InMemoryRemoteAppExecutionRepository {
	rows: Mutex<HashMap<String, RemoteAppExecution>>,
}

impl InMemoryRemoteAppExecutionRepository {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl RemoteAppExecutionRepository for InMemoryRemoteAppExecutionRepository {
	async fn add(&self, execution: &RemoteAppExecution) -> Result<(), RepositoryError> {
		let mut rows = self.rows.lock().unwrap();
		if rows.contains_key(&execution.outgoing_uid) {
			return Err(RepositoryError::Duplicate(execution.outgoing_uid.clone()));
		}
		rows.insert(execution.outgoing_uid.clone(), execution.clone());
		Ok(())
	}

	async fn get(&self, outgoing_uid: &str) -> Result<Option<RemoteAppExecution>, RepositoryError> {
		Ok(self.rows.lock().unwrap().get(outgoing_uid).cloned())
	}

	async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError> {
		let cutoff = now - Duration::days(REMOTE_APP_EXECUTION_TTL_DAYS);
		let mut rows = self.rows.lock().unwrap();
		let before = rows.len();
		rows.retain(|_, execution| execution.request_time > cutoff);
		Ok(before - rows.len())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ae::{AuditStamp, GroupingTag};
	use crate::storage::{DataKind, StorageFile, CONTENT_TYPE_DICOM};
	use crate::types::{DataOrigin, DataService};

	fn metadata(correlation: &str, identifier: &str) -> FileStorageMetadata {
		FileStorageMetadata::new(
			identifier,
			correlation,
			DataKind::Dicom {
				study_instance_uid: String::from("1.2.3"),
				series_instance_uid: String::from("1.2.3.4"),
				sop_instance_uid: identifier.to_owned(),
			},
			&DataOrigin {
				data_service: DataService::Dimse,
				source: String::from("MODALITY"),
				destination: String::from("GATEWAY"),
			},
			StorageFile::new(String::from("mem:x"), CONTENT_TYPE_DICOM),
		)
	}

	#[tokio::test]
	async fn metadata_pending_scan_skips_uploaded() {
		let repo = InMemoryMetadataRepository::new();
		let mut a = metadata("corr", "1.1");
		let b = metadata("corr", "1.2");
		repo.save(&a).await.unwrap();
		repo.save(&b).await.unwrap();

		a.upload_state = UploadState::Uploaded;
		repo.update(&a).await.unwrap();

		let pending = repo.pending_uploads().await.unwrap();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].identifier, "1.2");
	}

	#[tokio::test]
	async fn ae_repository_enforces_unique_names() {
		let repo = AeRepository::new();
		let entity = MonaiApplicationEntity {
			name: String::new(),
			ae_title: String::from("GATEWAY"),
			port: None,
			grouping: GroupingTag::default(),
			timeout: 5,
			workflows: Vec::new(),
			allowed_sop_classes: Vec::new(),
			ignored_sop_classes: Vec::new(),
			plug_in_assemblies: Vec::new(),
			audit: AuditStamp::default(),
		};

		// the empty name defaults to the AE title, so a second insert collides
		repo.insert_monai(entity.clone()).unwrap();
		let err = repo.insert_monai(entity).unwrap_err();
		assert!(matches!(err, RepositoryError::Duplicate(name) if name == "GATEWAY"));
	}

	#[tokio::test]
	async fn remote_app_executions_expire() {
		let repo = InMemoryRemoteAppExecutionRepository::new();
		repo.add(&RemoteAppExecution {
			outgoing_uid: String::from("9.9.9"),
			request_time: Utc::now() - Duration::days(REMOTE_APP_EXECUTION_TTL_DAYS + 1),
			original_values: HashMap::new(),
		})
		.await
		.unwrap();

		let removed = repo.remove_expired(Utc::now()).await.unwrap();
		assert_eq!(removed, 1);
		assert!(repo.get("9.9.9").await.unwrap().is_none());
	}
}
