use imaging_gateway::ae::{
	DestinationApplicationEntity, MonaiApplicationEntity, SourceApplicationEntity,
	VirtualApplicationEntity,
};
use imaging_gateway::api::{self, AppState};
use imaging_gateway::broker::rabbit::RabbitBroker;
use imaging_gateway::broker::{InMemoryBroker, MessageBroker};
use imaging_gateway::config::{AppConfig, SeedEntities};
use imaging_gateway::dimse::scp::ScpService;
use imaging_gateway::export::dicomweb::DicomWebExportSender;
use imaging_gateway::export::dimse::DimseExportSender;
use imaging_gateway::export::{ExportSender, ExportService};
use imaging_gateway::hl7::MllpService;
use imaging_gateway::inference::{InMemoryInferenceRequestRepository, InferenceRequestRepository};
use imaging_gateway::ingest::InstanceProcessor;
use imaging_gateway::lifecycle::Orchestrator;
use imaging_gateway::payload::assembler::PayloadAssembler;
use imaging_gateway::payload::notifier::PayloadNotifier;
use imaging_gateway::plugins::{OutputPluginChain, PluginRegistry};
use imaging_gateway::repository::{
	AeRepository, AssociationRepository, InMemoryAssociationRepository,
	InMemoryMetadataRepository, InMemoryPayloadRepository,
	InMemoryRemoteAppExecutionRepository, MetadataRepository, PayloadRepository,
	RemoteAppExecutionRepository,
};
use imaging_gateway::retry::RetryPolicy;
use imaging_gateway::storage::info::{StorageInfoProvider, SystemDiskStats};
use imaging_gateway::storage::object_store::{InMemoryObjectStore, ObjectStore, S3ObjectStore};
use imaging_gateway::storage::upload::{ObjectUploadQueue, ObjectUploadWorker};
use imaging_gateway::storage::TemporaryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

fn init_logger(level: tracing::Level) -> anyhow::Result<()> {
	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_target(false)
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}

fn seed_entities(repository: &AeRepository, entities: SeedEntities) {
	for config in entities.monai_aets {
		let result = repository.insert_monai(MonaiApplicationEntity {
			name: config.name,
			ae_title: config.aet,
			port: config.port,
			grouping: config.grouping,
			timeout: config.timeout,
			workflows: config.workflows,
			allowed_sop_classes: config.allowed_sop_classes,
			ignored_sop_classes: config.ignored_sop_classes,
			plug_in_assemblies: config.plug_in_assemblies,
			audit: Default::default(),
		});
		if let Err(err) = result {
			error!("Skipping Monai AE: {err}");
		}
	}
	for config in entities.source_aets {
		let result = repository.insert_source(SourceApplicationEntity {
			name: config.name,
			ae_title: config.aet,
			host_ip: config.host_ip,
			audit: Default::default(),
		});
		if let Err(err) = result {
			error!("Skipping source AE: {err}");
		}
	}
	for config in entities.destination_aets {
		let result = repository.insert_destination(DestinationApplicationEntity {
			name: config.name,
			ae_title: config.aet,
			host_ip: config.host_ip,
			port: config.port,
			audit: Default::default(),
		});
		if let Err(err) = result {
			error!("Skipping destination AE: {err}");
		}
	}
	for config in entities.virtual_aets {
		let result = repository.insert_virtual(VirtualApplicationEntity {
			name: config.name,
			workflows: config.workflows,
			plug_in_assemblies: config.plug_in_assemblies,
			audit: Default::default(),
		});
		if let Err(err) = result {
			error!("Skipping virtual AE: {err}");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level)?;
	config.validate()?;

	let entities = Arc::new(AeRepository::new());
	seed_entities(&entities, SeedEntities::new()?);

	// Repository seams; the durable engine behind them is deployment-specific.
	let metadata_repository: Arc<dyn MetadataRepository> =
		Arc::new(InMemoryMetadataRepository::new());
	let payload_repository: Arc<dyn PayloadRepository> =
		Arc::new(InMemoryPayloadRepository::new());
	let association_repository: Arc<dyn AssociationRepository> =
		Arc::new(InMemoryAssociationRepository::new());
	let remote_executions: Arc<dyn RemoteAppExecutionRepository> =
		Arc::new(InMemoryRemoteAppExecutionRepository::new());
	let inference_repository = Arc::new(InMemoryInferenceRequestRepository::new(
		config.database.retries.delays_milliseconds.len() as u32,
	));

	let database_retry = RetryPolicy::new(&config.database.retries.delays_milliseconds);
	let storage_retry = RetryPolicy::new(&config.storage.retries.delays_milliseconds);
	let messaging_retry = RetryPolicy::new(&config.messaging.retries.delays_milliseconds);
	let export_retry = RetryPolicy::new(&config.export.retries.delays_milliseconds);

	let object_store: Arc<dyn ObjectStore> = match &config.storage.s3 {
		Some(s3_config) => Arc::new(S3ObjectStore::from_config(s3_config).await?),
		None => {
			warn!("No S3 endpoint configured; using the in-process object store");
			Arc::new(InMemoryObjectStore::new())
		}
	};
	let broker: Arc<dyn MessageBroker> =
		match RabbitBroker::connect(&config.messaging.endpoint, &config.messaging.exchange).await
		{
			Ok(broker) => Arc::new(broker),
			Err(err) => {
				warn!("Message broker unreachable ({err}); using the in-process broker");
				Arc::new(InMemoryBroker::new())
			}
		};

	let temp_store = Arc::new(TemporaryStore::new(
		config.storage.temporary_data_storage,
		&config.storage.local_temporary_storage_path,
	));
	let storage_info = Arc::new(StorageInfoProvider::new(
		config.storage.watermark_percent,
		config.storage.reserve_space_gb,
		&config.storage.local_temporary_storage_path,
		Box::new(SystemDiskStats),
	));

	let upload_queue = Arc::new(ObjectUploadQueue::new(config.storage.concurrent_uploads));
	let upload_worker = Arc::new(ObjectUploadWorker::new(
		Arc::clone(&upload_queue),
		Arc::clone(&object_store),
		Arc::clone(&temp_store),
		Arc::clone(&metadata_repository),
		config.storage.bucket_name.clone(),
		config.storage.concurrent_uploads,
		storage_retry.clone(),
		database_retry.clone(),
	));

	let (assembler, completed_payloads) = PayloadAssembler::new(
		Arc::clone(&payload_repository),
		Arc::clone(&metadata_repository),
		database_retry.clone(),
	);
	let notifier = Arc::new(PayloadNotifier::new(
		completed_payloads,
		Arc::clone(&payload_repository),
		Arc::clone(&metadata_repository),
		Arc::clone(&broker),
		config.storage.bucket_name.clone(),
		config.messaging.workflow_request_topic.clone(),
		config.storage.payload_process_threads,
		messaging_retry.clone(),
		database_retry.clone(),
	));

	let registry = Arc::new(PluginRegistry::with_defaults(Arc::clone(&remote_executions)));
	let processor = Arc::new(InstanceProcessor::new(
		Arc::clone(&temp_store),
		Arc::clone(&upload_queue),
		Arc::clone(&assembler),
		Arc::clone(&registry),
	));

	let scp = Arc::new(ScpService::new(
		config.dicom.scp.clone(),
		Arc::clone(&entities),
		Arc::clone(&association_repository),
		Arc::clone(&storage_info),
		Arc::clone(&processor),
		database_retry.clone(),
	));
	let mllp = Arc::new(MllpService::new(
		config.hl7.clone(),
		Arc::clone(&processor),
		Arc::clone(&storage_info),
	));

	let dicomweb_sender = Arc::new(DicomWebExportSender::new(
		Arc::clone(&inference_repository) as Arc<dyn InferenceRequestRepository>,
		config.dicom_web.client_timeout(),
	)?);
	let dimse_sender = Arc::new(DimseExportSender::new(
		Arc::clone(&entities),
		config.dicom.scu.aet.clone(),
		config.dicom.scu.max_associations,
		Duration::from_millis(config.dicom.scu.timeout),
	));

	let orchestrator = Arc::new(Orchestrator::new(CancellationToken::new()));
	orchestrator.start(upload_worker);
	orchestrator.start(notifier);
	orchestrator.start(assembler);
	orchestrator.start(scp);
	orchestrator.start(mllp);
	for sender in [
		Arc::clone(&dicomweb_sender) as Arc<dyn ExportSender>,
		dimse_sender as Arc<dyn ExportSender>,
	] {
		let agent = sender.agent();
		orchestrator.start(Arc::new(ExportService::new(
			Arc::clone(&broker),
			sender,
			Arc::clone(&object_store),
			Arc::clone(&storage_info),
			OutputPluginChain::empty(),
			config.storage.bucket_name.clone(),
			config.messaging.export_request_topic(agent),
			config.messaging.export_complete_topic.clone(),
			config.export.concurrency,
			export_retry.clone(),
			messaging_retry.clone(),
		)));
	}

	// Hourly sweep of expired remote-app execution records.
	{
		let executions = Arc::clone(&remote_executions);
		let token = orchestrator.root_token();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(Duration::from_secs(3600));
			loop {
				tokio::select! {
					() = token.cancelled() => break,
					_ = ticker.tick() => {
						match executions.remove_expired(chrono::Utc::now()).await {
							Ok(0) => {}
							Ok(removed) => info!(removed, "Purged expired remote-app executions"),
							Err(err) => warn!("Failed to purge remote-app executions: {err}"),
						}
					}
				}
			}
		});
	}

	let state = AppState {
		processor,
		entities,
		storage_info,
		orchestrator: Arc::clone(&orchestrator),
	};
	let app = api::routes(state, config.http.max_upload_size);
	let listener =
		TcpListener::bind((config.http.interface, config.http.port)).await?;
	info!(
		"Serving DICOMweb/FHIR/health endpoints on http://{}:{}",
		config.http.interface, config.http.port
	);

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await?;

	info!("Shutting down");
	orchestrator.stop(SHUTDOWN_GRACE).await;
	Ok(())
}

async fn shutdown_signal() {
	if let Err(err) = tokio::signal::ctrl_c().await {
		error!("Failed to listen for shutdown signal: {err}");
	}
}
