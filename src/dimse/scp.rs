use crate::ae::{MonaiApplicationEntity, SopFilterDecision};
use crate::config::ScpConfig;
use crate::dimse::channel::{ServerChannel, ServerChannelOptions};
use crate::dimse::{
	CompositeEchoResponse, CompositeStoreResponse, DicomMessage, Exchange,
	COMMAND_FIELD_COMPOSITE_ECHO_REQUEST, COMMAND_FIELD_COMPOSITE_STORE_REQUEST,
	STATUS_CANNOT_UNDERSTAND, STATUS_OUT_OF_RESOURCES, STATUS_PROCESSING_FAILURE, STATUS_SUCCESS,
};
use crate::ingest::{IngestError, InstanceProcessor};
use crate::lifecycle::Component;
use crate::repository::{AeRepository, AssociationRepository, DicomAssociationInfo};
use crate::retry::RetryPolicy;
use crate::storage::info::StorageInfoProvider;
use crate::types::{DataOrigin, DataService, US};
use async_trait::async_trait;
use chrono::Utc;
use dicom::dictionary_std::tags;
use dicom::object::FileMetaTableBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// The inbound DICOM service: one listener per configured Monai AE, a
/// shared cap on simultaneous associations, and the admission policy in
/// front of the ingest path.
pub struct ScpService {
	config: ScpConfig,
	entities: Arc<AeRepository>,
	associations: Arc<dyn AssociationRepository>,
	storage_info: Arc<StorageInfoProvider>,
	processor: Arc<InstanceProcessor>,
	database_retry: RetryPolicy,
	active: Arc<Semaphore>,
}

impl ScpService {
	pub fn new(
		config: ScpConfig,
		entities: Arc<AeRepository>,
		associations: Arc<dyn AssociationRepository>,
		storage_info: Arc<StorageInfoProvider>,
		processor: Arc<InstanceProcessor>,
		database_retry: RetryPolicy,
	) -> Self {
		let active = Arc::new(Semaphore::new(config.max_associations));
		Self {
			config,
			entities,
			associations,
			storage_info,
			processor,
			database_retry,
			active,
		}
	}

	/// Maps every Monai AE to the port it listens on. AEs without an
	/// explicit port share the default, which only works for one of them.
	fn listener_ports(
		default_port: u16,
		entities: &[MonaiApplicationEntity],
	) -> Result<Vec<(MonaiApplicationEntity, u16)>, ListenerConflict> {
		let mut by_port: HashMap<u16, &str> = HashMap::new();
		let mut assignments = Vec::with_capacity(entities.len());

		for entity in entities {
			let port = entity.port.unwrap_or(default_port);
			if let Some(existing) = by_port.insert(port, &entity.name) {
				return Err(ListenerConflict {
					port,
					first: existing.to_owned(),
					second: entity.name.clone(),
				});
			}
			assignments.push((entity.clone(), port));
		}
		Ok(assignments)
	}

	#[instrument(skip_all, fields(aet = %entity.ae_title, %peer))]
	async fn process(
		self: Arc<Self>,
		stream: TcpStream,
		peer: SocketAddr,
		entity: MonaiApplicationEntity,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// The dicom-ul crate reads and writes synchronously; the actual IO
		// happens on the channel's actor thread.
		tcp_stream.set_nonblocking(false)?;

		// A mismatched called AE title is rejected here, during negotiation.
		let channel = ServerChannel::accept(ServerChannelOptions {
			aet: entity.ae_title.clone(),
			tcp_stream,
			uncompressed: self.config.uncompressed,
		})
		.await?;

		let mut record = DicomAssociationInfo {
			id: Uuid::new_v4(),
			correlation_id: Uuid::new_v4().to_string(),
			calling_aet: channel.calling_aet().to_owned(),
			called_aet: entity.ae_title.clone(),
			remote_host: peer.ip().to_string(),
			remote_port: peer.port(),
			file_count: 0,
			created_at: Utc::now(),
			disconnected_at: None,
			errors: Vec::new(),
		};

		if self.config.reject_unknown_sources
			&& !self
				.entities
				.source_matches(&record.calling_aet, &record.remote_host)
		{
			warn!(
				calling_aet = record.calling_aet,
				host = record.remote_host,
				"Rejecting association from unknown source"
			);
			record
				.errors
				.push(String::from("calling AE title is not a known source"));
			self.finish(record).await;
			// Dropping the channel aborts the association.
			return Ok(());
		}

		self.serve(&channel, &entity, &mut record).await;
		self.finish(record).await;
		Ok(())
	}

	/// Message loop for one accepted association.
	async fn serve(
		&self,
		channel: &ServerChannel,
		entity: &MonaiApplicationEntity,
		record: &mut DicomAssociationInfo,
	) {
		loop {
			let message = match channel.read(Duration::MAX).await {
				Ok(Exchange::Message(message)) => message,
				Ok(Exchange::Released) => {
					info!("Association released");
					break;
				}
				Ok(Exchange::Aborted) => {
					warn!("Association aborted by peer");
					record.errors.push(String::from("aborted by peer"));
					break;
				}
				Err(err) => {
					record.errors.push(err.to_string());
					break;
				}
			};

			match message.command_field() {
				Some(COMMAND_FIELD_COMPOSITE_ECHO_REQUEST) => {
					let status = if self.config.verification_enabled {
						STATUS_SUCCESS
					} else {
						record
							.errors
							.push(String::from("verification service is disabled"));
						STATUS_PROCESSING_FAILURE
					};
					let response = CompositeEchoResponse {
						message_id: message.message_id(),
						status,
					};
					if let Err(err) = channel
						.write(response, message.presentation_context_id, RESPONSE_TIMEOUT)
						.await
					{
						record.errors.push(err.to_string());
						break;
					}
				}
				Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST) => {
					let presentation_context_id = message.presentation_context_id;
					let (response, stored) =
						self.handle_store(channel, entity, record, message).await;
					if stored {
						record.file_count += 1;
					}
					if let Err(err) = channel
						.write(response, presentation_context_id, RESPONSE_TIMEOUT)
						.await
					{
						record.errors.push(err.to_string());
						break;
					}
				}
				other => {
					warn!(command_field = ?other, "Unsupported DIMSE operation");
					record
						.errors
						.push(format!("unsupported command field {other:?}"));
					break;
				}
			}
		}
	}

	/// Runs the C-STORE admission and ingest steps, returning the response
	/// to send and whether an instance was stored.
	async fn handle_store(
		&self,
		channel: &ServerChannel,
		entity: &MonaiApplicationEntity,
		record: &mut DicomAssociationInfo,
		message: DicomMessage,
	) -> (CompositeStoreResponse, bool) {
		let message_id = message.message_id();
		let sop_class_uid = message
			.string(tags::AFFECTED_SOP_CLASS_UID)
			.unwrap_or_default();
		let sop_instance_uid = message
			.string(tags::AFFECTED_SOP_INSTANCE_UID)
			.unwrap_or_default();

		let respond = |status: US, stored: bool| {
			(
				CompositeStoreResponse {
					message_id,
					sop_class_uid: sop_class_uid.clone(),
					sop_instance_uid: sop_instance_uid.clone(),
					status,
				},
				stored,
			)
		};

		if !self.storage_info.has_space_to_store() {
			error!("Rejecting C-STORE: insufficient storage");
			record.errors.push(String::from("insufficient storage"));
			return respond(STATUS_OUT_OF_RESOURCES, false);
		}

		match entity.filter_decision(&sop_class_uid) {
			SopFilterDecision::Accept => {}
			decision => {
				// Filtered instances are acknowledged but never stored.
				warn!(sop_class_uid, ?decision, "Instance filtered by SOP class");
				return respond(STATUS_SUCCESS, false);
			}
		}

		let Some(data) = message.data else {
			record.errors.push(String::from("C-STORE-RQ without data set"));
			return respond(STATUS_CANNOT_UNDERSTAND, false);
		};

		let Some(pctx) = message
			.presentation_context_id
			.and_then(|id| channel.negotiated().iter().find(|pctx| pctx.id == id))
			.or_else(|| channel.negotiated().first())
		else {
			record
				.errors
				.push(String::from("no negotiated presentation context"));
			return respond(STATUS_PROCESSING_FAILURE, false);
		};

		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(sop_class_uid.as_str())
			.media_storage_sop_instance_uid(sop_instance_uid.as_str())
			.transfer_syntax(&pctx.transfer_syntax)
			.build();
		let file = match meta.map(|meta| data.with_exact_meta(meta)) {
			Ok(file) => file,
			Err(err) => {
				record.errors.push(err.to_string());
				return respond(STATUS_CANNOT_UNDERSTAND, false);
			}
		};

		let origin = DataOrigin {
			data_service: DataService::Dimse,
			source: record.calling_aet.clone(),
			destination: entity.ae_title.clone(),
		};
		let result = self
			.processor
			.process_dicom(
				file,
				&record.correlation_id,
				origin,
				Some(entity.grouping),
				&entity.plug_in_assemblies,
				entity.workflows.clone(),
				entity.timeout,
			)
			.await;

		match result {
			Ok(_payload_id) => respond(STATUS_SUCCESS, true),
			Err(IngestError::Validation(reason)) => {
				record.errors.push(reason.clone());
				warn!(reason, "Instance rejected");
				respond(STATUS_CANNOT_UNDERSTAND, false)
			}
			Err(err) => {
				record.errors.push(err.to_string());
				error!("Failed to ingest instance: {err}");
				respond(STATUS_PROCESSING_FAILURE, false)
			}
		}
	}

	async fn finish(&self, mut record: DicomAssociationInfo) {
		record.disconnected_at = Some(Utc::now());
		info!(
			calling_aet = record.calling_aet,
			file_count = record.file_count,
			errors = record.errors.len(),
			duration_ms = record.duration().map(|d| d.num_milliseconds()).unwrap_or(0),
			"Association closed"
		);

		let persisted = self
			.database_retry
			.run("association-record", || async {
				self.associations.add(&record).await
			})
			.await;
		if let Err(err) = persisted {
			error!("Failed to persist association record: {err}");
		}
	}

	async fn listen(
		self: Arc<Self>,
		listener: TcpListener,
		entity: MonaiApplicationEntity,
		token: CancellationToken,
	) {
		loop {
			let accepted = tokio::select! {
				() = token.cancelled() => break,
				accepted = listener.accept() => accepted,
			};

			match accepted {
				Ok((stream, peer)) => {
					// Admission: the association cap is enforced before the
					// handshake; over-capacity peers get a closed socket,
					// which DIMSE clients treat as a transient rejection.
					let Ok(permit) = Arc::clone(&self.active).try_acquire_owned() else {
						warn!(%peer, "Rejecting association: at capacity");
						drop(stream);
						continue;
					};

					info!(%peer, aet = %entity.ae_title, "Accepted incoming connection");
					let service = Arc::clone(&self);
					let entity = entity.clone();
					tokio::spawn(
						async move {
							if let Err(err) = service.process(stream, peer, entity).await {
								warn!("Association ended with error: {err:#}");
							}
							drop(permit);
						}
						.instrument(info_span!("association")),
					);
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			}
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("Monai AEs {first} and {second} both listen on port {port}")]
pub struct ListenerConflict {
	pub port: u16,
	pub first: String,
	pub second: String,
}

#[async_trait]
impl Component for ScpService {
	fn name(&self) -> &'static str {
		"dicom-scp"
	}

	async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
		let entities = self.entities.all_monai();
		if entities.is_empty() {
			warn!("No Monai application entities configured; SCP is idle");
			token.cancelled().await;
			return Ok(());
		}

		let assignments = Self::listener_ports(self.config.port, &entities)?;
		let mut tasks = Vec::with_capacity(assignments.len());
		for (entity, port) in assignments {
			let address = SocketAddr::from((self.config.interface, port));
			let listener = TcpListener::bind(&address).await?;
			info!(aet = %entity.ae_title, %address, "Started DICOM SCP listener");
			tasks.push(tokio::spawn(Arc::clone(&self).listen(
				listener,
				entity,
				token.clone(),
			)));
		}

		for task in tasks {
			let _ = task.await;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ae::{AuditStamp, GroupingTag};

	fn entity(name: &str, port: Option<u16>) -> MonaiApplicationEntity {
		MonaiApplicationEntity {
			name: name.to_owned(),
			ae_title: name.to_owned(),
			port,
			grouping: GroupingTag::default(),
			timeout: 5,
			workflows: Vec::new(),
			allowed_sop_classes: Vec::new(),
			ignored_sop_classes: Vec::new(),
			plug_in_assemblies: Vec::new(),
			audit: AuditStamp::default(),
		}
	}

	#[test]
	fn assigns_default_port_to_single_entity() {
		let assignments =
			ScpService::listener_ports(104, &[entity("A", None), entity("B", Some(11112))])
				.unwrap();
		assert_eq!(assignments[0].1, 104);
		assert_eq!(assignments[1].1, 11112);
	}

	#[test]
	fn duplicate_ports_are_rejected() {
		let err = ScpService::listener_ports(104, &[entity("A", None), entity("B", None)])
			.unwrap_err();
		assert_eq!(err.port, 104);
	}
}
