//! Whole-pipeline tests: ingest through upload and assembly to the
//! workflow-request announcement, using the in-process object store and
//! broker.

use bytes::Bytes;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use imaging_gateway::ae::GroupingTag;
use imaging_gateway::broker::{InMemoryBroker, MessageBroker};
use imaging_gateway::config::TemporaryDataStorage;
use imaging_gateway::events::WorkflowRequestEvent;
use imaging_gateway::ingest::InstanceProcessor;
use imaging_gateway::lifecycle::Component;
use imaging_gateway::payload::assembler::PayloadAssembler;
use imaging_gateway::payload::notifier::PayloadNotifier;
use imaging_gateway::plugins::PluginRegistry;
use imaging_gateway::repository::{
	InMemoryMetadataRepository, InMemoryPayloadRepository, InMemoryRemoteAppExecutionRepository,
	MetadataRepository, PayloadRepository,
};
use imaging_gateway::retry::RetryPolicy;
use imaging_gateway::storage::object_store::{InMemoryObjectStore, ObjectStore};
use imaging_gateway::storage::upload::{ObjectUploadQueue, ObjectUploadWorker};
use imaging_gateway::storage::TemporaryStore;
use imaging_gateway::types::{DataOrigin, DataService};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn dicom_file(study_uid: &str, sop_uid: &str) -> FileDicomObject<InMemDicomObject> {
	let mut object = InMemDicomObject::new_empty();
	object.put(DataElement::new(
		tags::SOP_CLASS_UID,
		VR::UI,
		dicom_value!(Str, uids::SECONDARY_CAPTURE_IMAGE_STORAGE),
	));
	object.put(DataElement::new(
		tags::SOP_INSTANCE_UID,
		VR::UI,
		dicom_value!(Str, sop_uid),
	));
	object.put(DataElement::new(
		tags::SERIES_INSTANCE_UID,
		VR::UI,
		dicom_value!(Str, format!("{study_uid}.99")),
	));
	object.put(DataElement::new(
		tags::STUDY_INSTANCE_UID,
		VR::UI,
		dicom_value!(Str, study_uid),
	));

	object.with_exact_meta(
		FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
			.media_storage_sop_instance_uid(sop_uid)
			.transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
			.build()
			.expect("meta table should build"),
	)
}

struct Gateway {
	processor: Arc<InstanceProcessor>,
	broker: Arc<InMemoryBroker>,
	store: Arc<InMemoryObjectStore>,
	token: CancellationToken,
	tasks: Vec<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

fn gateway() -> Gateway {
	let payloads = Arc::new(InMemoryPayloadRepository::new());
	let metadata = Arc::new(InMemoryMetadataRepository::new());
	let broker = Arc::new(InMemoryBroker::new());
	let store = Arc::new(InMemoryObjectStore::new());
	let temp = Arc::new(TemporaryStore::new(TemporaryDataStorage::Memory, "/unused"));
	let retry = RetryPolicy::new(&[1]);

	let queue = Arc::new(ObjectUploadQueue::new(4));
	let worker = Arc::new(ObjectUploadWorker::new(
		Arc::clone(&queue),
		Arc::clone(&store) as Arc<dyn ObjectStore>,
		Arc::clone(&temp),
		Arc::clone(&metadata) as Arc<dyn MetadataRepository>,
		"bucket",
		2,
		retry.clone(),
		retry.clone(),
	));

	let (assembler, completed) = PayloadAssembler::new(
		Arc::clone(&payloads) as Arc<dyn PayloadRepository>,
		Arc::clone(&metadata) as Arc<dyn MetadataRepository>,
		retry.clone(),
	);
	let notifier = Arc::new(PayloadNotifier::new(
		completed,
		Arc::clone(&payloads) as Arc<dyn PayloadRepository>,
		Arc::clone(&metadata) as Arc<dyn MetadataRepository>,
		Arc::clone(&broker) as Arc<dyn MessageBroker>,
		"bucket",
		"md.workflow.request",
		1,
		retry.clone(),
		retry.clone(),
	));

	let processor = Arc::new(InstanceProcessor::new(
		temp,
		queue,
		Arc::clone(&assembler),
		Arc::new(PluginRegistry::with_defaults(Arc::new(
			InMemoryRemoteAppExecutionRepository::new(),
		))),
	));

	let token = CancellationToken::new();
	let tasks = vec![
		tokio::spawn(worker.run(token.clone())),
		tokio::spawn(assembler.run(token.clone())),
		tokio::spawn(notifier.run(token.clone())),
	];

	Gateway {
		processor,
		broker,
		store,
		token,
		tasks,
	}
}

fn origin() -> DataOrigin {
	DataOrigin {
		data_service: DataService::Dimse,
		source: String::from("MODALITY"),
		destination: String::from("GATEWAY"),
	}
}

async fn workflow_requests(gateway: &Gateway) -> Vec<WorkflowRequestEvent> {
	gateway
		.broker
		.published("md.workflow.request")
		.iter()
		.map(|m| m.decode().unwrap())
		.collect()
}

async fn shutdown(gateway: Gateway) {
	gateway.token.cancel();
	for task in gateway.tasks {
		task.await.unwrap().unwrap();
	}
}

#[tokio::test]
async fn two_instances_of_one_study_become_one_workflow_request() {
	let gateway = gateway();

	for sop in ["1.2.3.1.1", "1.2.3.2.1"] {
		gateway
			.processor
			.process_dicom(
				dicom_file("1.2.3", sop),
				"assoc-1",
				origin(),
				Some(GroupingTag::StudyInstanceUid),
				&[],
				vec![String::from("wf-1")],
				1,
			)
			.await
			.unwrap();
	}

	// window (1 s) + tick + upload + notification
	let mut requests = Vec::new();
	for _ in 0..40 {
		tokio::time::sleep(Duration::from_millis(100)).await;
		requests = workflow_requests(&gateway).await;
		if !requests.is_empty() {
			break;
		}
	}

	assert_eq!(requests.len(), 1, "exactly one workflow request is published");
	let request = &requests[0];
	assert_eq!(request.file_count, 2);
	assert_eq!(request.workflows, vec![String::from("wf-1")]);
	assert_eq!(request.data_trigger.source, "MODALITY");

	// both objects (and their sidecars) live under the payload id
	let prefix = request.payload_id.to_string();
	assert!(request.files.iter().all(|f| f.path.starts_with(&prefix)));
	let keys = gateway.store.keys("bucket");
	assert_eq!(keys.len(), 4); // 2 instances + 2 DICOM-JSON sidecars
	assert!(keys.iter().all(|k| k.starts_with(&prefix)));

	shutdown(gateway).await;
}

#[tokio::test]
async fn replayed_instance_keeps_the_payload_stable() {
	let gateway = gateway();

	let first = gateway
		.processor
		.process_dicom(
			dicom_file("1.2.9", "1.2.9.1.1"),
			"assoc-2",
			origin(),
			Some(GroupingTag::StudyInstanceUid),
			&[],
			Vec::new(),
			1,
		)
		.await
		.unwrap();

	// the client retries the same instance after a transient failure
	let replay = gateway
		.processor
		.process_dicom(
			dicom_file("1.2.9", "1.2.9.1.1"),
			"assoc-2",
			origin(),
			Some(GroupingTag::StudyInstanceUid),
			&[],
			Vec::new(),
			1,
		)
		.await
		.unwrap();
	assert_eq!(first, replay);

	let mut requests = Vec::new();
	for _ in 0..40 {
		tokio::time::sleep(Duration::from_millis(100)).await;
		requests = workflow_requests(&gateway).await;
		if !requests.is_empty() {
			break;
		}
	}

	assert_eq!(requests.len(), 1);
	assert_eq!(requests[0].payload_id, first);
	assert_eq!(requests[0].file_count, 1);

	shutdown(gateway).await;
}
