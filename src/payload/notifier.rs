use crate::broker::{BusMessage, MessageBroker};
use crate::events::{BlockStorageInfo, WorkflowRequestEvent};
use crate::lifecycle::Component;
use crate::payload::{Payload, PayloadState};
use crate::repository::{MetadataRepository, PayloadRepository};
use crate::retry::RetryPolicy;
use crate::storage::UploadState;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const UPLOAD_POLL: Duration = Duration::from_millis(500);

/// Walks completed payloads through `Created → Move → Notify → Published`
/// and announces each on the bus exactly once per successful walk.
///
/// Each transition is written before the work it gates, so a crash replays
/// from the last durable state; receivers dedupe on the payload id.
pub struct PayloadNotifier {
	completed: Mutex<mpsc::Receiver<Payload>>,
	payloads: Arc<dyn PayloadRepository>,
	metadata: Arc<dyn MetadataRepository>,
	broker: Arc<dyn MessageBroker>,
	bucket: String,
	topic: String,
	concurrency: usize,
	publish_retry: RetryPolicy,
	database_retry: RetryPolicy,
}

impl PayloadNotifier {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		completed: mpsc::Receiver<Payload>,
		payloads: Arc<dyn PayloadRepository>,
		metadata: Arc<dyn MetadataRepository>,
		broker: Arc<dyn MessageBroker>,
		bucket: impl Into<String>,
		topic: impl Into<String>,
		concurrency: usize,
		publish_retry: RetryPolicy,
		database_retry: RetryPolicy,
	) -> Self {
		Self {
			completed: Mutex::new(completed),
			payloads,
			metadata,
			broker,
			bucket: bucket.into(),
			topic: topic.into(),
			concurrency: concurrency.max(1),
			publish_retry,
			database_retry,
		}
	}

	#[instrument(skip_all, fields(payload_id = %payload.payload_id))]
	async fn process(&self, mut payload: Payload, token: &CancellationToken) {
		if payload.state == PayloadState::Created {
			payload.state = PayloadState::Move;
			if self.persist(&payload).await.is_err() {
				return;
			}
		}

		if payload.state == PayloadState::Move {
			match self.await_uploads(&mut payload, token).await {
				UploadOutcome::Ready => {
					payload.state = PayloadState::Notify;
					if self.persist(&payload).await.is_err() {
						return;
					}
				}
				UploadOutcome::Failed(identifier) => {
					error!(identifier, "Member upload failed; payload abandoned");
					payload.state = PayloadState::Failed;
					let _ = self.persist(&payload).await;
					return;
				}
				UploadOutcome::Cancelled => return,
			}
		}

		if payload.state == PayloadState::Notify {
			self.publish(payload).await;
		}
	}

	/// Blocks until every member file is uploaded, refreshing the payload's
	/// file records so the event carries the final object keys.
	async fn await_uploads(
		&self,
		payload: &mut Payload,
		token: &CancellationToken,
	) -> UploadOutcome {
		loop {
			let mut all_uploaded = true;
			for file in &mut payload.files {
				let current = match self
					.metadata
					.get(&file.correlation_id, &file.identifier)
					.await
				{
					Ok(Some(current)) => current,
					Ok(None) => {
						// The record vanished; treat as a terminal failure.
						return UploadOutcome::Failed(file.identifier.clone());
					}
					Err(err) => {
						warn!("Failed to read upload state: {err}");
						all_uploaded = false;
						continue;
					}
				};

				match current.upload_state {
					UploadState::Uploaded => *file = current,
					UploadState::Failed => {
						return UploadOutcome::Failed(file.identifier.clone())
					}
					UploadState::Pending => all_uploaded = false,
				}
			}

			if all_uploaded {
				return UploadOutcome::Ready;
			}

			tokio::select! {
				() = token.cancelled() => return UploadOutcome::Cancelled,
				() = tokio::time::sleep(UPLOAD_POLL) => {}
			}
		}
	}

	async fn publish(&self, mut payload: Payload) {
		let event = WorkflowRequestEvent {
			payload_id: payload.payload_id,
			bucket: self.bucket.clone(),
			correlation_id: payload.correlation_id.clone(),
			workflows: payload.workflows.clone(),
			data_trigger: payload
				.data_origins
				.first()
				.cloned()
				.unwrap_or_else(|| crate::types::DataOrigin {
					data_service: crate::types::DataService::Dimse,
					source: String::new(),
					destination: String::new(),
				}),
			data_origins: payload.data_origins.clone(),
			files: payload
				.files
				.iter()
				.map(|f| BlockStorageInfo {
					path: f
						.file
						.remote_path
						.clone()
						.unwrap_or_else(|| f.remote_key(f.file_extension())),
					metadata_path: f.json_file.as_ref().and_then(|j| j.remote_path.clone()),
				})
				.collect(),
			file_count: payload.file_count() as u32,
			timestamp: Utc::now(),
		};

		let message = match BusMessage::json(payload.correlation_id.clone(), &event) {
			Ok(message) => message,
			Err(err) => {
				error!("Failed to encode workflow request: {err}");
				payload.state = PayloadState::Failed;
				let _ = self.persist(&payload).await;
				return;
			}
		};

		let published = self
			.publish_retry
			.run("workflow-request-publish", || {
				let message = message.clone();
				async move { self.broker.publish(&self.topic, message).await }
			})
			.await;

		match published {
			Ok(()) => {
				payload.state = PayloadState::Published;
				payload.retry_count = 0;
				if self.persist(&payload).await.is_ok() {
					info!(
						payload_id = %payload.payload_id,
						files = payload.file_count(),
						"Workflow request published"
					);
					self.cleanup(&payload).await;
				}
			}
			Err(err) => {
				error!("Workflow request publication exhausted retries: {err}");
				payload.state = PayloadState::Failed;
				payload.retry_count = self.publish_retry.max_retries();
				let _ = self.persist(&payload).await;
			}
		}
	}

	/// Metadata rows are only needed until the payload is announced.
	async fn cleanup(&self, payload: &Payload) {
		for file in &payload.files {
			if let Err(err) = self
				.metadata
				.delete(&file.correlation_id, &file.identifier)
				.await
			{
				warn!(identifier = %file.identifier, "Failed to delete metadata row: {err}");
			}
		}
	}

	async fn persist(&self, payload: &Payload) -> Result<(), ()> {
		self.database_retry
			.run("payload-update", || async {
				self.payloads.update(payload).await
			})
			.await
			.map_err(|err| {
				error!("Failed to persist payload state: {err}");
			})
	}
}

enum UploadOutcome {
	Ready,
	Failed(String),
	Cancelled,
}

#[async_trait]
impl Component for PayloadNotifier {
	fn name(&self) -> &'static str {
		"payload-notifier"
	}

	async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
		let semaphore = Arc::new(Semaphore::new(self.concurrency));
		loop {
			let payload = {
				let mut completed = self.completed.lock().await;
				tokio::select! {
					() = token.cancelled() => break,
					maybe = completed.recv() => match maybe {
						Some(payload) => payload,
						None => break,
					},
				}
			};

			let permit = Arc::clone(&semaphore)
				.acquire_owned()
				.await
				.expect("Semaphore should not be closed");
			let notifier = Arc::clone(&self);
			let task_token = token.clone();
			tokio::spawn(async move {
				notifier.process(payload, &task_token).await;
				drop(permit);
			});
		}

		let _ = semaphore.acquire_many(self.concurrency as u32).await;
		warn!("Payload notifier stopped");
		Ok(())
	}
}
