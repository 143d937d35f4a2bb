use crate::export::ExportRequestDataMessage;
use crate::repository::{RemoteAppExecution, RemoteAppExecutionRepository};
use crate::storage::{DataKind, FileStorageMetadata};
use async_trait::async_trait;
use chrono::Utc;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::{FileDicomObject, InMemDicomObject};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub type DicomFile = FileDicomObject<InMemDicomObject>;

/// Transforms applied to each instance on its way into the gateway.
#[async_trait]
pub trait InputPlugin: Send + Sync {
	fn id(&self) -> &'static str;

	async fn execute(
		&self,
		file: DicomFile,
		metadata: FileStorageMetadata,
	) -> Result<(DicomFile, FileStorageMetadata), PluginError>;
}

/// Transforms applied to each file before it leaves through an exporter.
#[async_trait]
pub trait OutputPlugin: Send + Sync {
	fn id(&self) -> &'static str;

	async fn execute(
		&self,
		message: ExportRequestDataMessage,
	) -> Result<ExportRequestDataMessage, PluginError>;
}

#[derive(Debug, Error)]
pub enum PluginError {
	#[error("plug-in failed: {0}")]
	Execution(String),
	#[error(transparent)]
	Dicom(#[from] dicom::object::ReadError),
}

/// One or more configured identifiers did not resolve to a registered
/// plug-in. All misses are reported together.
#[derive(Debug, Error)]
#[error("unknown plug-in identifier(s): {}", .0.join(", "))]
pub struct PluginResolveError(pub Vec<String>);

/// Compile-time plug-in registry.
///
/// Plug-ins are registered under stable string identifiers; configuration
/// refers to those identifiers only. There is no dynamic loading.
pub struct PluginRegistry {
	input: HashMap<&'static str, Arc<dyn InputPlugin>>,
	output: HashMap<&'static str, Arc<dyn OutputPlugin>>,
}

impl PluginRegistry {
	pub fn new() -> Self {
		Self {
			input: HashMap::new(),
			output: HashMap::new(),
		}
	}

	/// Registry with the built-in plug-ins registered.
	pub fn with_defaults(remote_executions: Arc<dyn RemoteAppExecutionRepository>) -> Self {
		let mut registry = Self::new();
		registry.register_input(Arc::new(ExternalAppIncoming {
			executions: Arc::clone(&remote_executions),
		}));
		registry.register_output(Arc::new(ExternalAppOutgoing {
			executions: remote_executions,
		}));
		registry
	}

	pub fn register_input(&mut self, plugin: Arc<dyn InputPlugin>) {
		info!(plugin.id = plugin.id(), "Registered input plug-in");
		self.input.insert(plugin.id(), plugin);
	}

	pub fn register_output(&mut self, plugin: Arc<dyn OutputPlugin>) {
		info!(plugin.id = plugin.id(), "Registered output plug-in");
		self.output.insert(plugin.id(), plugin);
	}

	pub fn input_chain(&self, ids: &[String]) -> Result<InputPluginChain, PluginResolveError> {
		let mut plugins = Vec::with_capacity(ids.len());
		let mut unknown = Vec::new();
		for id in ids {
			match self.input.get(id.as_str()) {
				Some(plugin) => plugins.push(Arc::clone(plugin)),
				None => unknown.push(id.clone()),
			}
		}
		if unknown.is_empty() {
			Ok(InputPluginChain { plugins })
		} else {
			Err(PluginResolveError(unknown))
		}
	}

	pub fn output_chain(&self, ids: &[String]) -> Result<OutputPluginChain, PluginResolveError> {
		let mut plugins = Vec::with_capacity(ids.len());
		let mut unknown = Vec::new();
		for id in ids {
			match self.output.get(id.as_str()) {
				Some(plugin) => plugins.push(Arc::clone(plugin)),
				None => unknown.push(id.clone()),
			}
		}
		if unknown.is_empty() {
			Ok(OutputPluginChain { plugins })
		} else {
			Err(PluginResolveError(unknown))
		}
	}
}

impl Default for PluginRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Ordered input transforms. A failure fails only the in-flight instance.
#[derive(Clone)]
pub struct InputPluginChain {
	plugins: Vec<Arc<dyn InputPlugin>>,
}

impl std::fmt::Debug for InputPluginChain {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("InputPluginChain")
			.field("plugins", &self.plugins.iter().map(|p| p.id()).collect::<Vec<_>>())
			.finish()
	}
}

impl InputPluginChain {
	pub fn empty() -> Self {
		Self {
			plugins: Vec::new(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.plugins.is_empty()
	}

	pub async fn execute(
		&self,
		mut file: DicomFile,
		mut metadata: FileStorageMetadata,
	) -> Result<(DicomFile, FileStorageMetadata), PluginError> {
		for plugin in &self.plugins {
			(file, metadata) = plugin.execute(file, metadata).await?;
		}
		Ok((file, metadata))
	}
}

#[derive(Clone)]
pub struct OutputPluginChain {
	plugins: Vec<Arc<dyn OutputPlugin>>,
}

impl OutputPluginChain {
	pub fn empty() -> Self {
		Self {
			plugins: Vec::new(),
		}
	}

	pub async fn execute(
		&self,
		mut message: ExportRequestDataMessage,
	) -> Result<ExportRequestDataMessage, PluginError> {
		for plugin in &self.plugins {
			message = plugin.execute(message).await?;
		}
		Ok(message)
	}
}

/// Derives a DICOM UID from a random UUID (the `2.25.` OID arc).
fn new_uid() -> String {
	format!("2.25.{}", Uuid::new_v4().as_u128())
}

const STUDY_UID_KEY: &str = "0020,000D";

/// Rewrites the Study Instance UID of outbound instances so a remote
/// application sees an anonymous study, and records the mapping for the
/// return trip.
pub struct ExternalAppOutgoing {
	executions: Arc<dyn RemoteAppExecutionRepository>,
}

#[async_trait]
impl OutputPlugin for ExternalAppOutgoing {
	fn id(&self) -> &'static str {
		"external-app-outgoing"
	}

	async fn execute(
		&self,
		mut message: ExportRequestDataMessage,
	) -> Result<ExportRequestDataMessage, PluginError> {
		let mut file = dicom::object::from_reader(message.bytes.as_ref())
			.map_err(|e| PluginError::Execution(e.to_string()))?;
		let original = study_instance_uid(&file)
			.ok_or_else(|| PluginError::Execution(String::from("missing StudyInstanceUID")))?;

		let outgoing = new_uid();
		file.put(DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, outgoing.clone()),
		));

		let execution = RemoteAppExecution {
			outgoing_uid: outgoing.clone(),
			request_time: Utc::now(),
			original_values: HashMap::from([(String::from(STUDY_UID_KEY), original)]),
		};
		self.executions
			.add(&execution)
			.await
			.map_err(|e| PluginError::Execution(e.to_string()))?;

		let mut bytes = Vec::new();
		file.write_all(&mut bytes)
			.map_err(|e| PluginError::Execution(e.to_string()))?;
		message.bytes = bytes.into();
		info!(outgoing_uid = outgoing, "Rewrote study UID for remote execution");
		Ok(message)
	}
}

/// Restores the original Study Instance UID on instances returning from a
/// remote application.
pub struct ExternalAppIncoming {
	executions: Arc<dyn RemoteAppExecutionRepository>,
}

#[async_trait]
impl InputPlugin for ExternalAppIncoming {
	fn id(&self) -> &'static str {
		"external-app-incoming"
	}

	async fn execute(
		&self,
		mut file: DicomFile,
		mut metadata: FileStorageMetadata,
	) -> Result<(DicomFile, FileStorageMetadata), PluginError> {
		let Some(incoming) = study_instance_uid(&file) else {
			return Ok((file, metadata));
		};

		let execution = self
			.executions
			.get(&incoming)
			.await
			.map_err(|e| PluginError::Execution(e.to_string()))?;
		let Some(execution) = execution else {
			// Not one of ours; pass through untouched.
			return Ok((file, metadata));
		};

		let Some(original) = execution.original_values.get(STUDY_UID_KEY).cloned() else {
			warn!(outgoing_uid = incoming, "Execution record has no original study UID");
			return Ok((file, metadata));
		};

		file.put(DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, original.clone()),
		));
		if let DataKind::Dicom {
			study_instance_uid, ..
		} = &mut metadata.kind
		{
			*study_instance_uid = original.clone();
		}
		info!(outgoing_uid = incoming, restored_uid = original, "Restored study UID");
		Ok((file, metadata))
	}
}

fn study_instance_uid(file: &DicomFile) -> Option<String> {
	file.get(tags::STUDY_INSTANCE_UID)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|uid| uid.trim_end_matches('\0').to_owned())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::repository::InMemoryRemoteAppExecutionRepository;
	use crate::storage::{StorageFile, CONTENT_TYPE_DICOM};
	use crate::types::{DataOrigin, DataService};

	fn metadata() -> FileStorageMetadata {
		FileStorageMetadata::new(
			"1.2.3.4.5",
			"corr",
			DataKind::Dicom {
				study_instance_uid: String::from("9.9.9"),
				series_instance_uid: String::from("1.2.3.4"),
				sop_instance_uid: String::from("1.2.3.4.5"),
			},
			&DataOrigin {
				data_service: DataService::Dimse,
				source: String::from("MODALITY"),
				destination: String::from("GATEWAY"),
			},
			StorageFile::new(String::from("mem:x"), CONTENT_TYPE_DICOM),
		)
	}

	fn dicom_file(study_uid: &str) -> DicomFile {
		use dicom::object::FileMetaTableBuilder;
		use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;

		let mut object = InMemDicomObject::new_empty();
		object.put(DataElement::new(
			tags::SOP_CLASS_UID,
			VR::UI,
			dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.7"),
		));
		object.put(DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, "1.2.3.4.5"),
		));
		object.put(DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, study_uid),
		));

		object.with_exact_meta(
			FileMetaTableBuilder::new()
				.media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
				.media_storage_sop_instance_uid("1.2.3.4.5")
				.transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
				.build()
				.expect("meta table should build"),
		)
	}

	#[test]
	fn unknown_identifiers_are_aggregated() {
		let registry =
			PluginRegistry::with_defaults(Arc::new(InMemoryRemoteAppExecutionRepository::new()));

		let err = registry
			.input_chain(&[
				String::from("external-app-incoming"),
				String::from("nope-1"),
				String::from("nope-2"),
			])
			.unwrap_err();
		assert_eq!(err.0, vec![String::from("nope-1"), String::from("nope-2")]);
	}

	#[tokio::test]
	async fn incoming_restores_recorded_study_uid() {
		let executions = Arc::new(InMemoryRemoteAppExecutionRepository::new());
		executions
			.add(&RemoteAppExecution {
				outgoing_uid: String::from("2.25.42"),
				request_time: Utc::now(),
				original_values: HashMap::from([(
					String::from(STUDY_UID_KEY),
					String::from("9.9.9"),
				)]),
			})
			.await
			.unwrap();

		let registry = PluginRegistry::with_defaults(executions);
		let chain = registry
			.input_chain(&[String::from("external-app-incoming")])
			.unwrap();

		let (file, metadata) = chain
			.execute(dicom_file("2.25.42"), metadata())
			.await
			.unwrap();

		assert_eq!(study_instance_uid(&file).as_deref(), Some("9.9.9"));
		match metadata.kind {
			DataKind::Dicom {
				study_instance_uid, ..
			} => assert_eq!(study_instance_uid, "9.9.9"),
			_ => panic!("expected DICOM metadata"),
		}
	}

	#[tokio::test]
	async fn incoming_passes_through_unknown_studies() {
		let registry =
			PluginRegistry::with_defaults(Arc::new(InMemoryRemoteAppExecutionRepository::new()));
		let chain = registry
			.input_chain(&[String::from("external-app-incoming")])
			.unwrap();

		let (file, _metadata) = chain
			.execute(dicom_file("1.2.3"), metadata())
			.await
			.unwrap();
		assert_eq!(study_instance_uid(&file).as_deref(), Some("1.2.3"));
	}
}
