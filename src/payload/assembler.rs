use crate::lifecycle::Component;
use crate::payload::{Payload, PayloadState};
use crate::repository::{MetadataRepository, PayloadRepository, RepositoryError};
use crate::retry::RetryPolicy;
use crate::storage::FileStorageMetadata;
use crate::types::DataOrigin;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const TICK: Duration = Duration::from_millis(500);

/// Buckets are scoped by source endpoint as well as the grouping key so two
/// modalities pushing the same study do not share a window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
	source: String,
	key: String,
}

struct Bucket {
	payload: Payload,
	deadline: Instant,
}

/// Groups per-instance metadata into payloads bounded by a sliding
/// inactivity window.
///
/// Buckets live behind a single mutex; every durable write happens before
/// the in-memory state it covers becomes visible, so a crash at any point
/// either replays the instance (idempotent) or rehydrates the bucket.
pub struct PayloadAssembler {
	buckets: Mutex<HashMap<BucketKey, Bucket>>,
	payloads: Arc<dyn PayloadRepository>,
	metadata: Arc<dyn MetadataRepository>,
	completed: mpsc::Sender<Payload>,
	database_retry: RetryPolicy,
}

#[derive(Debug, Error)]
pub enum AssemblerError {
	#[error(transparent)]
	Repository(#[from] RepositoryError),
	#[error("the assembler output channel is closed")]
	Closed,
}

impl PayloadAssembler {
	pub fn new(
		payloads: Arc<dyn PayloadRepository>,
		metadata: Arc<dyn MetadataRepository>,
		database_retry: RetryPolicy,
	) -> (Arc<Self>, mpsc::Receiver<Payload>) {
		let (tx, rx) = mpsc::channel(64);
		let assembler = Arc::new(Self {
			buckets: Mutex::new(HashMap::new()),
			payloads,
			metadata,
			completed: tx,
			database_retry,
		});
		(assembler, rx)
	}

	/// Adds `metadata` to the bucket for `key`, opening one if needed, and
	/// returns the owning payload id.
	///
	/// Idempotent per `(key, metadata.identifier)`: replaying an instance
	/// after a crash refreshes the window but does not duplicate the file.
	#[instrument(skip_all, fields(key, identifier = %metadata.identifier))]
	pub async fn queue(
		&self,
		key: &str,
		mut metadata: FileStorageMetadata,
		origin: DataOrigin,
		timeout_secs: u64,
	) -> Result<Uuid, AssemblerError> {
		let bucket_key = BucketKey {
			source: origin.source.clone(),
			key: key.to_owned(),
		};
		let window = Duration::from_secs(timeout_secs);

		let mut buckets = self.buckets.lock().await;
		if !buckets.contains_key(&bucket_key) {
			let mut payload = Payload::new(key, metadata.correlation_id.clone(), timeout_secs);
			payload.data_origins.push(origin.clone());
			payload.workflows = metadata.workflows.clone();

			// The durable row must exist before the bucket becomes visible.
			self.database_retry
				.run("payload-create", || async {
					self.payloads.save(&payload).await
				})
				.await?;

			info!(payload_id = %payload.payload_id, key, "Opened payload bucket");
			buckets.insert(
				bucket_key.clone(),
				Bucket {
					payload,
					deadline: Instant::now() + window,
				},
			);
		}

		let bucket = buckets.get_mut(&bucket_key).expect("bucket was just inserted");
		bucket.deadline = bucket.deadline.max(Instant::now() + window);
		if !bucket.payload.data_origins.contains(&origin) {
			bucket.payload.data_origins.push(origin);
		}
		for workflow in &metadata.workflows {
			if !bucket.payload.workflows.contains(workflow) {
				bucket.payload.workflows.push(workflow.clone());
			}
		}

		let payload_id = bucket.payload.payload_id;
		let duplicate = bucket
			.payload
			.files
			.iter()
			.any(|f| f.identifier == metadata.identifier);
		if duplicate {
			return Ok(payload_id);
		}

		metadata.payload_id = Some(payload_id);
		self.database_retry
			.run("metadata-save", || async {
				self.metadata.save(&metadata).await
			})
			.await?;

		bucket.payload.files.push(metadata);
		let payload = bucket.payload.clone();
		self.database_retry
			.run("payload-append", || async {
				self.payloads.update(&payload).await
			})
			.await?;

		Ok(payload_id)
	}

	/// Reopens buckets for payloads that were mid-assembly when the process
	/// died. Anything already past its window is handed straight to the
	/// notifier; publication is idempotent by payload id.
	async fn restore(&self) -> Result<(), AssemblerError> {
		let unpublished = self.payloads.unpublished().await?;
		if unpublished.is_empty() {
			return Ok(());
		}

		info!(count = unpublished.len(), "Rehydrating unpublished payloads");
		let mut buckets = self.buckets.lock().await;
		for payload in unpublished {
			match payload.state {
				PayloadState::Created => {
					let bucket_key = BucketKey {
						source: payload
							.data_origins
							.first()
							.map(|o| o.source.clone())
							.unwrap_or_default(),
						key: payload.key.clone(),
					};
					let deadline = Instant::now() + Duration::from_secs(payload.timeout);
					buckets.insert(bucket_key, Bucket { payload, deadline });
				}
				PayloadState::Move | PayloadState::Notify => {
					self.completed
						.send(payload)
						.await
						.map_err(|_| AssemblerError::Closed)?;
				}
				PayloadState::Published | PayloadState::Failed => {}
			}
		}
		Ok(())
	}

	async fn emit_expired(&self) -> Result<(), AssemblerError> {
		let expired: Vec<Payload> = {
			let mut buckets = self.buckets.lock().await;
			let now = Instant::now();
			let keys: Vec<BucketKey> = buckets
				.iter()
				.filter(|(_, b)| b.deadline <= now)
				.map(|(k, _)| k.clone())
				.collect();
			keys.into_iter()
				.filter_map(|k| buckets.remove(&k))
				.map(|b| b.payload)
				.collect()
		};

		for payload in expired {
			info!(
				payload_id = %payload.payload_id,
				files = payload.file_count(),
				"Payload window closed"
			);
			self.completed
				.send(payload)
				.await
				.map_err(|_| AssemblerError::Closed)?;
		}
		Ok(())
	}

	#[cfg(test)]
	pub async fn open_buckets(&self) -> usize {
		self.buckets.lock().await.len()
	}
}

#[async_trait]
impl Component for PayloadAssembler {
	fn name(&self) -> &'static str {
		"payload-assembler"
	}

	async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
		self.restore().await?;

		let mut ticker = tokio::time::interval(TICK);
		loop {
			tokio::select! {
				() = token.cancelled() => break,
				_ = ticker.tick() => {
					if let Err(err) = self.emit_expired().await {
						error!("Failed to emit expired buckets: {err}");
					}
				}
			}
		}

		warn!("Payload assembler stopped");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::repository::{InMemoryMetadataRepository, InMemoryPayloadRepository};
	use crate::storage::{DataKind, StorageFile, CONTENT_TYPE_DICOM};
	use crate::types::DataService;

	fn origin() -> DataOrigin {
		DataOrigin {
			data_service: DataService::Dimse,
			source: String::from("MODALITY"),
			destination: String::from("GATEWAY"),
		}
	}

	fn metadata(identifier: &str) -> FileStorageMetadata {
		FileStorageMetadata::new(
			identifier,
			"corr",
			DataKind::Dicom {
				study_instance_uid: String::from("1.2.3"),
				series_instance_uid: String::from("1.2.3.4"),
				sop_instance_uid: identifier.to_owned(),
			},
			&origin(),
			StorageFile::new(String::from("mem:x"), CONTENT_TYPE_DICOM),
		)
	}

	fn assembler() -> (
		Arc<PayloadAssembler>,
		mpsc::Receiver<Payload>,
		Arc<InMemoryPayloadRepository>,
		Arc<InMemoryMetadataRepository>,
	) {
		let payloads = Arc::new(InMemoryPayloadRepository::new());
		let metadata = Arc::new(InMemoryMetadataRepository::new());
		let (assembler, rx) = PayloadAssembler::new(
			Arc::clone(&payloads) as Arc<dyn PayloadRepository>,
			Arc::clone(&metadata) as Arc<dyn MetadataRepository>,
			RetryPolicy::new(&[1]),
		);
		(assembler, rx, payloads, metadata)
	}

	#[tokio::test]
	async fn same_key_shares_a_payload() {
		let (assembler, _rx, _payloads, metadata_repo) = assembler();

		let first = assembler
			.queue("1.2.3", metadata("1.1"), origin(), 5)
			.await
			.unwrap();
		let second = assembler
			.queue("1.2.3", metadata("1.2"), origin(), 5)
			.await
			.unwrap();

		assert_eq!(first, second);
		assert_eq!(metadata_repo.len(), 2);
		let stored = metadata_repo.get("corr", "1.1").await.unwrap().unwrap();
		assert_eq!(stored.payload_id, Some(first));
	}

	#[tokio::test]
	async fn different_sources_use_separate_buckets() {
		let (assembler, _rx, _payloads, _metadata) = assembler();

		let a = assembler
			.queue("1.2.3", metadata("1.1"), origin(), 5)
			.await
			.unwrap();
		let other = DataOrigin {
			source: String::from("OTHER"),
			..origin()
		};
		let b = assembler
			.queue("1.2.3", metadata("1.2"), other, 5)
			.await
			.unwrap();

		assert_ne!(a, b);
		assert_eq!(assembler.open_buckets().await, 2);
	}

	#[tokio::test]
	async fn replay_does_not_duplicate_files() {
		let (assembler, _rx, payloads, _metadata) = assembler();

		let id = assembler
			.queue("1.2.3", metadata("1.1"), origin(), 5)
			.await
			.unwrap();
		let replay = assembler
			.queue("1.2.3", metadata("1.1"), origin(), 5)
			.await
			.unwrap();

		assert_eq!(id, replay);
		let stored = payloads.get(id).await.unwrap().unwrap();
		assert_eq!(stored.file_count(), 1);
	}

	#[tokio::test]
	async fn window_close_emits_the_payload() {
		let (assembler, mut rx, payloads, _metadata) = assembler();

		let id = assembler
			.queue("1.2.3", metadata("1.1"), origin(), 1)
			.await
			.unwrap();

		let token = CancellationToken::new();
		let handle = tokio::spawn(Arc::clone(&assembler).run(token.clone()));

		let emitted = tokio::time::timeout(Duration::from_secs(5), rx.recv())
			.await
			.expect("window should close within the timeout")
			.unwrap();
		assert_eq!(emitted.payload_id, id);
		assert_eq!(emitted.file_count(), 1);
		assert_eq!(assembler.open_buckets().await, 0);

		// the durable row is still Created; the notifier owns the transitions
		let stored = payloads.get(id).await.unwrap().unwrap();
		assert_eq!(stored.state, PayloadState::Created);

		token.cancel();
		handle.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn restore_reopens_created_buckets() {
		let payloads = Arc::new(InMemoryPayloadRepository::new());
		let metadata_repo = Arc::new(InMemoryMetadataRepository::new());

		// first incarnation receives one instance and dies
		{
			let (assembler, _rx) = PayloadAssembler::new(
				Arc::clone(&payloads) as Arc<dyn PayloadRepository>,
				Arc::clone(&metadata_repo) as Arc<dyn MetadataRepository>,
				RetryPolicy::new(&[1]),
			);
			assembler
				.queue("1.2.3", metadata("1.1"), origin(), 5)
				.await
				.unwrap();
		}

		// second incarnation restores and receives the second instance
		let (assembler, _rx) = PayloadAssembler::new(
			Arc::clone(&payloads) as Arc<dyn PayloadRepository>,
			Arc::clone(&metadata_repo) as Arc<dyn MetadataRepository>,
			RetryPolicy::new(&[1]),
		);
		assembler.restore().await.unwrap();
		assert_eq!(assembler.open_buckets().await, 1);

		let id = assembler
			.queue("1.2.3", metadata("1.2"), origin(), 5)
			.await
			.unwrap();
		let stored = payloads.get(id).await.unwrap().unwrap();
		assert_eq!(stored.file_count(), 2);
	}

	#[tokio::test]
	async fn restore_forwards_payloads_past_assembly() {
		let payloads = Arc::new(InMemoryPayloadRepository::new());
		let metadata_repo = Arc::new(InMemoryMetadataRepository::new());

		let mut stuck = Payload::new("1.2.3", "corr", 5);
		stuck.state = PayloadState::Notify;
		payloads.save(&stuck).await.unwrap();

		let (assembler, mut rx) = PayloadAssembler::new(
			Arc::clone(&payloads) as Arc<dyn PayloadRepository>,
			metadata_repo as Arc<dyn MetadataRepository>,
			RetryPolicy::new(&[1]),
		);
		assembler.restore().await.unwrap();

		let forwarded = rx.recv().await.unwrap();
		assert_eq!(forwarded.payload_id, stuck.payload_id);
		assert_eq!(assembler.open_buckets().await, 0);
	}
}
