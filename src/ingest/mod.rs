use crate::ae::GroupingTag;
use crate::payload::assembler::{AssemblerError, PayloadAssembler};
use crate::plugins::{DicomFile, PluginError, PluginRegistry, PluginResolveError};
use crate::storage::upload::{ObjectUploadQueue, QueueClosedError};
use crate::storage::{
	DataKind, FileStorageMetadata, StorageFile, TempStorageError, TemporaryStore,
	CONTENT_TYPE_DICOM, CONTENT_TYPE_DICOM_JSON,
};
use crate::types::DataOrigin;
use bytes::Bytes;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::Tag;
use dicom_json::DicomJson;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

/// The post-admission path every received object takes: plug-in chain,
/// temporary buffering (plus DICOM-JSON sidecar for DICOM), upload
/// enqueueing and payload grouping.
pub struct InstanceProcessor {
	temp_store: Arc<TemporaryStore>,
	upload_queue: Arc<ObjectUploadQueue>,
	assembler: Arc<PayloadAssembler>,
	registry: Arc<PluginRegistry>,
}

#[derive(Debug, Error)]
pub enum IngestError {
	/// Configured plug-in identifiers did not resolve.
	#[error(transparent)]
	Configuration(#[from] PluginResolveError),
	/// The instance is missing data the gateway depends on.
	#[error("instance is not usable: {0}")]
	Validation(String),
	#[error(transparent)]
	Plugin(#[from] PluginError),
	#[error(transparent)]
	TempStorage(#[from] TempStorageError),
	#[error(transparent)]
	Assembler(#[from] AssemblerError),
	#[error(transparent)]
	UploadQueue(#[from] QueueClosedError),
	#[error("failed to serialize instance: {0}")]
	Serialize(String),
}

impl InstanceProcessor {
	pub fn new(
		temp_store: Arc<TemporaryStore>,
		upload_queue: Arc<ObjectUploadQueue>,
		assembler: Arc<PayloadAssembler>,
		registry: Arc<PluginRegistry>,
	) -> Self {
		Self {
			temp_store,
			upload_queue,
			assembler,
			registry,
		}
	}

	/// Runs one DICOM instance through the ingest path and returns the
	/// payload it was grouped into.
	///
	/// DIMSE callers group by a configured DICOM tag; DICOMweb callers pass
	/// `None` and group by the request's correlation id instead.
	#[allow(clippy::too_many_arguments)]
	#[instrument(skip_all, fields(correlation_id))]
	pub async fn process_dicom(
		&self,
		file: DicomFile,
		correlation_id: &str,
		origin: DataOrigin,
		grouping: Option<GroupingTag>,
		plug_ins: &[String],
		workflows: Vec<String>,
		timeout_secs: u64,
	) -> Result<Uuid, IngestError> {
		let chain = self.registry.input_chain(plug_ins)?;

		let sop_instance_uid = element_str(&file, tags::SOP_INSTANCE_UID)
			.or_else(|| Some(file.meta().media_storage_sop_instance_uid().to_owned()))
			.filter(|uid| !uid.is_empty())
			.ok_or_else(|| IngestError::Validation(String::from("missing SOPInstanceUID")))?;
		let study_instance_uid = element_str(&file, tags::STUDY_INSTANCE_UID).unwrap_or_default();
		let series_instance_uid = element_str(&file, tags::SERIES_INSTANCE_UID).unwrap_or_default();

		let mut metadata = FileStorageMetadata::new(
			sop_instance_uid.clone(),
			correlation_id,
			DataKind::Dicom {
				study_instance_uid,
				series_instance_uid,
				sop_instance_uid,
			},
			&origin,
			StorageFile::new(String::new(), CONTENT_TYPE_DICOM),
		);
		metadata.workflows = workflows;

		let (file, mut metadata) = chain.execute(file, metadata).await?;

		let key = match grouping {
			Some(grouping) => element_str(&file, grouping.tag())
				.filter(|value| !value.is_empty())
				.ok_or_else(|| {
					IngestError::Validation(format!("missing grouping value for tag {grouping}"))
				})?,
			None => correlation_id.to_owned(),
		};

		let mut bytes = Vec::new();
		file.write_all(&mut bytes)
			.map_err(|e| IngestError::Serialize(e.to_string()))?;
		let location = self
			.temp_store
			.write(
				&format!("{correlation_id}/{}.dcm", metadata.identifier),
				Bytes::from(bytes),
			)
			.await?;
		metadata.file.temporary_location = location;

		let json = serde_json::to_vec(&DicomJson::from(file.into_inner()))
			.map_err(|e| IngestError::Serialize(e.to_string()))?;
		let json_location = self
			.temp_store
			.write(
				&format!("{correlation_id}/{}.dcm.json", metadata.identifier),
				Bytes::from(json),
			)
			.await?;
		metadata.json_file = Some(StorageFile::new(json_location, CONTENT_TYPE_DICOM_JSON));

		let payload_id = self
			.assembler
			.queue(&key, metadata.clone(), origin, timeout_secs)
			.await?;
		metadata.payload_id = Some(payload_id);

		self.upload_queue.enqueue(metadata).await?;
		info!(payload_id = %payload_id, key, "Instance accepted");
		Ok(payload_id)
	}

	/// Ingests a non-DICOM object (HL7 message, FHIR resource). The
	/// correlation id doubles as the grouping key.
	#[instrument(skip_all, fields(correlation_id))]
	pub async fn process_raw(
		&self,
		bytes: Bytes,
		kind: DataKind,
		identifier: &str,
		content_type: &str,
		correlation_id: &str,
		origin: DataOrigin,
		workflows: Vec<String>,
		timeout_secs: u64,
	) -> Result<Uuid, IngestError> {
		let mut metadata = FileStorageMetadata::new(
			identifier,
			correlation_id,
			kind,
			&origin,
			StorageFile::new(String::new(), content_type),
		);
		metadata.workflows = workflows;

		let location = self
			.temp_store
			.write(
				&format!("{correlation_id}/{identifier}{}", metadata.file_extension()),
				bytes,
			)
			.await?;
		metadata.file.temporary_location = location;

		let payload_id = self
			.assembler
			.queue(correlation_id, metadata.clone(), origin, timeout_secs)
			.await?;
		metadata.payload_id = Some(payload_id);

		self.upload_queue.enqueue(metadata).await?;
		Ok(payload_id)
	}
}

fn element_str(file: &DicomFile, tag: Tag) -> Option<String> {
	file.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
}
