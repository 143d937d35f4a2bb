pub mod dicomweb;
pub mod dimse;

use crate::broker::{BusMessage, Delivery, MessageBroker};
use crate::events::{ExportCompleteEvent, ExportRequestEvent, FileExportStatus};
use crate::lifecycle::Component;
use crate::plugins::OutputPluginChain;
use crate::retry::RetryPolicy;
use crate::storage::info::StorageInfoProvider;
use crate::storage::object_store::ObjectStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const STAGE_CAPACITY: usize = 2;

/// One file moving through an export task's pipeline.
#[derive(Debug, Clone)]
pub struct ExportRequestDataMessage {
	pub export_task_id: Uuid,
	pub correlation_id: String,
	/// Object key below the payload bucket.
	pub file_path: String,
	pub bytes: Bytes,
	/// Set as soon as a stage fails; later stages pass the message through.
	pub status: Option<FileExportStatus>,
}

impl ExportRequestDataMessage {
	pub fn failed(mut self, status: FileExportStatus) -> Self {
		self.status = Some(status);
		self
	}
}

/// Protocol-specific last stage of the export pipeline.
#[async_trait]
pub trait ExportSender: Send + Sync + 'static {
	/// Name of the export agent; also the routing-key suffix it serves.
	fn agent(&self) -> &'static str;

	/// Ships one downloaded, transformed file and returns its terminal
	/// status.
	async fn send(
		&self,
		request: &ExportRequestEvent,
		message: &ExportRequestDataMessage,
	) -> FileExportStatus;
}

/// Base export service: subscribes to its agent's routing key and runs a
/// three-stage dataflow per task (download, output plug-ins, remote send)
/// with an aggregator that reports one `ExportComplete` per task.
pub struct ExportService {
	broker: Arc<dyn MessageBroker>,
	sender: Arc<dyn ExportSender>,
	object_store: Arc<dyn ObjectStore>,
	storage_info: Arc<StorageInfoProvider>,
	chain: OutputPluginChain,
	bucket: String,
	request_topic: String,
	complete_topic: String,
	concurrency: usize,
	download_retry: RetryPolicy,
	publish_retry: RetryPolicy,
	in_flight: Mutex<HashSet<Uuid>>,
}

impl ExportService {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		broker: Arc<dyn MessageBroker>,
		sender: Arc<dyn ExportSender>,
		object_store: Arc<dyn ObjectStore>,
		storage_info: Arc<StorageInfoProvider>,
		chain: OutputPluginChain,
		bucket: impl Into<String>,
		request_topic: impl Into<String>,
		complete_topic: impl Into<String>,
		concurrency: usize,
		download_retry: RetryPolicy,
		publish_retry: RetryPolicy,
	) -> Self {
		Self {
			broker,
			sender,
			object_store,
			storage_info,
			chain,
			bucket: bucket.into(),
			request_topic: request_topic.into(),
			complete_topic: complete_topic.into(),
			concurrency: concurrency.max(1),
			download_retry,
			publish_retry,
			in_flight: Mutex::new(HashSet::new()),
		}
	}

	/// The per-task dataflow. Stages are connected by bounded channels so a
	/// slow remote applies back-pressure to the downloader.
	#[instrument(skip_all, fields(export_task_id = %request.export_task_id))]
	async fn process_task(
		self: Arc<Self>,
		request: ExportRequestEvent,
		delivery: Delivery,
		token: CancellationToken,
	) {
		let (transform_tx, mut transform_rx) =
			mpsc::channel::<ExportRequestDataMessage>(STAGE_CAPACITY);
		let (send_tx, mut send_rx) = mpsc::channel::<ExportRequestDataMessage>(STAGE_CAPACITY);
		let (result_tx, mut result_rx) =
			mpsc::channel::<(String, FileExportStatus)>(STAGE_CAPACITY);

		// Stage 1: download from the object store.
		let downloader = {
			let service = Arc::clone(&self);
			let request = request.clone();
			let token = token.clone();
			tokio::spawn(async move {
				for file_path in &request.files {
					if token.is_cancelled() {
						break;
					}
					let message = service.download(&request, file_path).await;
					if transform_tx.send(message).await.is_err() {
						break;
					}
				}
			})
		};

		// Stage 2: output plug-in chain.
		let transformer = {
			let service = Arc::clone(&self);
			tokio::spawn(async move {
				while let Some(message) = transform_rx.recv().await {
					let message = if message.status.is_some() {
						message
					} else {
						match service.chain.execute(message.clone()).await {
							Ok(message) => message,
							Err(err) => {
								error!(file = message.file_path, "Output plug-in failed: {err}");
								message.failed(FileExportStatus::ServiceError)
							}
						}
					};
					if send_tx.send(message).await.is_err() {
						break;
					}
				}
			})
		};

		// Stage 3: remote send.
		let remote = {
			let service = Arc::clone(&self);
			let request = request.clone();
			tokio::spawn(async move {
				while let Some(message) = send_rx.recv().await {
					let status = match message.status {
						Some(status) => status,
						None => service.sender.send(&request, &message).await,
					};
					if result_tx.send((message.file_path, status)).await.is_err() {
						break;
					}
				}
			})
		};

		// Aggregator: the task is done when every file has a status.
		let mut file_statuses: HashMap<String, FileExportStatus> = HashMap::new();
		while file_statuses.len() < request.files.len() {
			match result_rx.recv().await {
				Some((file_path, status)) => {
					file_statuses.insert(file_path, status);
				}
				None => break,
			}
		}

		let _ = downloader.await;
		let _ = transformer.await;
		let _ = remote.await;

		let event = ExportCompleteEvent::from_file_statuses(&request, file_statuses);
		info!(status = ?event.status, files = event.file_statuses.len(), "Export task finished");

		delivery.ack().await;
		self.publish_complete(event).await;
		self.in_flight.lock().unwrap().remove(&request.export_task_id);
	}

	async fn download(
		&self,
		request: &ExportRequestEvent,
		file_path: &str,
	) -> ExportRequestDataMessage {
		let message = ExportRequestDataMessage {
			export_task_id: request.export_task_id,
			correlation_id: request.correlation_id.clone(),
			file_path: file_path.to_owned(),
			bytes: Bytes::new(),
			status: None,
		};

		let downloaded = self
			.download_retry
			.run("export-download", || async {
				self.object_store.get(&self.bucket, file_path).await
			})
			.await;

		match downloaded {
			Ok(bytes) => ExportRequestDataMessage { bytes, ..message },
			Err(err) => {
				error!(file = file_path, "Download failed terminally: {err}");
				message.failed(FileExportStatus::DownloadError)
			}
		}
	}

	async fn publish_complete(&self, event: ExportCompleteEvent) {
		let message = match BusMessage::json(event.correlation_id.clone(), &event) {
			Ok(message) => message,
			Err(err) => {
				error!("Failed to encode export-complete event: {err}");
				return;
			}
		};

		let published = self
			.publish_retry
			.run("export-complete-publish", || {
				let message = message.clone();
				async move { self.broker.publish(&self.complete_topic, message).await }
			})
			.await;
		if let Err(err) = published {
			error!("Export-complete publication exhausted retries: {err}");
		}
	}
}

#[async_trait]
impl Component for ExportService {
	fn name(&self) -> &'static str {
		self.sender.agent()
	}

	async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
		let mut deliveries = self
			.broker
			.subscribe(&self.request_topic, self.concurrency as u16)
			.await
			.map_err(|e| anyhow::anyhow!(e))?;
		info!(topic = self.request_topic, "Subscribed to export requests");

		let semaphore = Arc::new(Semaphore::new(self.concurrency));
		loop {
			let delivery = tokio::select! {
				() = token.cancelled() => break,
				maybe = deliveries.recv() => match maybe {
					Some(delivery) => delivery,
					None => break,
				},
			};

			let request: ExportRequestEvent = match delivery.message.decode() {
				Ok(request) => request,
				Err(err) => {
					warn!("Dropping undecodable export request: {err}");
					delivery.ack().await;
					continue;
				}
			};

			// Admission: no spool space means the broker keeps the message.
			if !self.storage_info.has_space_for_export() {
				warn!("Requeueing export request: insufficient storage");
				delivery.nack(true).await;
				continue;
			}

			// Deduplication: a task already in flight is dropped.
			if !self
				.in_flight
				.lock()
				.unwrap()
				.insert(request.export_task_id)
			{
				warn!(export_task_id = %request.export_task_id, "Duplicate export task dropped");
				delivery.ack().await;
				continue;
			}

			let permit = Arc::clone(&semaphore)
				.acquire_owned()
				.await
				.expect("Semaphore should not be closed");
			let service = Arc::clone(&self);
			let task_token = token.clone();
			tokio::spawn(async move {
				service.process_task(request, delivery, task_token).await;
				drop(permit);
			});
		}

		let _ = semaphore.acquire_many(self.concurrency as u32).await;
		warn!(agent = self.sender.agent(), "Export service stopped");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::broker::InMemoryBroker;
	use crate::events::ExportStatus;
	use crate::storage::info::{DiskStats, StorageInfoProvider};
	use crate::storage::object_store::InMemoryObjectStore;
	use std::path::Path;
	use std::time::Duration;

	struct RoomyDisk;

	impl DiskStats for RoomyDisk {
		fn capacity(&self, _path: &Path) -> Option<(u64, u64)> {
			Some((1_000_000_000_000, 900_000_000_000))
		}
	}

	struct RecordingSender {
		calls: Mutex<Vec<String>>,
		status: FileExportStatus,
	}

	#[async_trait]
	impl ExportSender for RecordingSender {
		fn agent(&self) -> &'static str {
			"test-exporter"
		}

		async fn send(
			&self,
			_request: &ExportRequestEvent,
			message: &ExportRequestDataMessage,
		) -> FileExportStatus {
			self.calls.lock().unwrap().push(message.file_path.clone());
			self.status
		}
	}

	struct Fixture {
		service: Arc<ExportService>,
		broker: Arc<InMemoryBroker>,
		store: Arc<InMemoryObjectStore>,
		sender: Arc<RecordingSender>,
	}

	fn fixture(status: FileExportStatus) -> Fixture {
		let broker = Arc::new(InMemoryBroker::new());
		let store = Arc::new(InMemoryObjectStore::new());
		let sender = Arc::new(RecordingSender {
			calls: Mutex::new(Vec::new()),
			status,
		});
		let service = Arc::new(ExportService::new(
			Arc::clone(&broker) as Arc<dyn MessageBroker>,
			Arc::clone(&sender) as Arc<dyn ExportSender>,
			Arc::clone(&store) as Arc<dyn ObjectStore>,
			Arc::new(StorageInfoProvider::new(75, 1, "/spool", Box::new(RoomyDisk))),
			OutputPluginChain::empty(),
			"bucket",
			"md.export.request.test-exporter",
			"md.export.complete",
			2,
			RetryPolicy::new(&[1]),
			RetryPolicy::new(&[1]),
		));
		Fixture {
			service,
			broker,
			store,
			sender,
		}
	}

	async fn publish_request(f: &Fixture, request: &ExportRequestEvent) {
		f.broker
			.publish(
				"md.export.request.test-exporter",
				BusMessage::json(request.correlation_id.clone(), request).unwrap(),
			)
			.await
			.unwrap();
	}

	fn request(files: &[&str]) -> ExportRequestEvent {
		ExportRequestEvent {
			export_task_id: Uuid::new_v4(),
			correlation_id: String::from("corr"),
			workflow_instance_id: None,
			files: files.iter().map(|f| (*f).to_owned()).collect(),
			destinations: vec![String::from("d1")],
		}
	}

	/// Starts the service, waits for the subscription to exist, publishes
	/// the request, and collects completions until the service is stopped.
	async fn run_with_request(f: &Fixture, request: &ExportRequestEvent) -> Vec<ExportCompleteEvent> {
		let token = CancellationToken::new();
		let handle = tokio::spawn(Arc::clone(&f.service).run(token.clone()));
		tokio::time::sleep(Duration::from_millis(100)).await;

		publish_request(f, request).await;
		for _ in 0..50 {
			tokio::time::sleep(Duration::from_millis(50)).await;
			if !f.broker.published("md.export.complete").is_empty() {
				break;
			}
		}
		token.cancel();
		handle.await.unwrap().unwrap();
		f.broker
			.published("md.export.complete")
			.iter()
			.map(|m| m.decode().unwrap())
			.collect()
	}

	#[tokio::test]
	async fn happy_path_reports_success() {
		let f = fixture(FileExportStatus::Success);
		f.store
			.put("bucket", "f1", Bytes::from_static(b"DICM"), "application/dicom", &[])
			.await
			.unwrap();

		let request = request(&["f1"]);
		let completes = run_with_request(&f, &request).await;
		assert_eq!(completes.len(), 1);
		assert_eq!(completes[0].export_task_id, request.export_task_id);
		assert_eq!(completes[0].status, ExportStatus::Success);
		assert_eq!(
			completes[0].file_statuses.get("f1"),
			Some(&FileExportStatus::Success)
		);
		assert_eq!(f.sender.calls.lock().unwrap().as_slice(), ["f1"]);
	}

	#[tokio::test]
	async fn missing_object_is_a_download_error() {
		let f = fixture(FileExportStatus::Success);
		let request = request(&["gone"]);
		let completes = run_with_request(&f, &request).await;
		assert_eq!(completes[0].status, ExportStatus::Failure);
		assert_eq!(
			completes[0].file_statuses.get("gone"),
			Some(&FileExportStatus::DownloadError)
		);
		// the failed file never reaches the sender
		assert!(f.sender.calls.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn duplicate_tasks_are_dropped() {
		let f = fixture(FileExportStatus::Success);
		f.store
			.put("bucket", "f1", Bytes::from_static(b"DICM"), "application/dicom", &[])
			.await
			.unwrap();

		let request = request(&["f1"]);
		// mark the task as already in flight
		f.service
			.in_flight
			.lock()
			.unwrap()
			.insert(request.export_task_id);

		let token = CancellationToken::new();
		let handle = tokio::spawn(Arc::clone(&f.service).run(token.clone()));
		tokio::time::sleep(Duration::from_millis(100)).await;
		publish_request(&f, &request).await;
		tokio::time::sleep(Duration::from_millis(300)).await;
		token.cancel();
		handle.await.unwrap().unwrap();

		assert!(f.broker.published("md.export.complete").is_empty());
		assert!(f.sender.calls.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn mixed_results_are_failure_overall() {
		let f = fixture(FileExportStatus::Success);
		f.store
			.put("bucket", "ok", Bytes::from_static(b"DICM"), "application/dicom", &[])
			.await
			.unwrap();

		let request = request(&["ok", "missing"]);
		let completes = run_with_request(&f, &request).await;
		assert_eq!(completes[0].status, ExportStatus::Failure);
		assert_eq!(completes[0].file_statuses.len(), 2);
	}
}
