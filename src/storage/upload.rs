use crate::lifecycle::Component;
use crate::repository::MetadataRepository;
use crate::retry::RetryPolicy;
use crate::storage::object_store::ObjectStore;
use crate::storage::{FileStorageMetadata, TemporaryStore, UploadState};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Bounded FIFO between the ingestors and the upload worker.
///
/// The capacity equals the worker concurrency, so a stalled object store
/// back-pressures `enqueue` and, through it, the ingress protocols.
pub struct ObjectUploadQueue {
	tx: mpsc::Sender<FileStorageMetadata>,
	rx: Mutex<mpsc::Receiver<FileStorageMetadata>>,
}

impl ObjectUploadQueue {
	pub fn new(capacity: usize) -> Self {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		Self {
			tx,
			rx: Mutex::new(rx),
		}
	}

	pub async fn enqueue(&self, metadata: FileStorageMetadata) -> Result<(), QueueClosedError> {
		self.tx.send(metadata).await.map_err(|_| QueueClosedError)
	}

	async fn dequeue(&self) -> Option<FileStorageMetadata> {
		self.rx.lock().await.recv().await
	}
}

#[derive(Debug, thiserror::Error)]
#[error("the upload queue is closed")]
pub struct QueueClosedError;

/// Moves buffered bytes into the object store with bounded parallelism.
///
/// On start the worker re-seeds the queue from metadata rows still marked
/// pending; rows whose temporary buffer did not survive the restart are
/// deleted instead, leaving the source to push the instance again.
pub struct ObjectUploadWorker {
	queue: Arc<ObjectUploadQueue>,
	object_store: Arc<dyn ObjectStore>,
	temp_store: Arc<TemporaryStore>,
	repository: Arc<dyn MetadataRepository>,
	bucket: String,
	concurrency: usize,
	upload_retry: RetryPolicy,
	database_retry: RetryPolicy,
}

impl ObjectUploadWorker {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		queue: Arc<ObjectUploadQueue>,
		object_store: Arc<dyn ObjectStore>,
		temp_store: Arc<TemporaryStore>,
		repository: Arc<dyn MetadataRepository>,
		bucket: impl Into<String>,
		concurrency: usize,
		upload_retry: RetryPolicy,
		database_retry: RetryPolicy,
	) -> Self {
		Self {
			queue,
			object_store,
			temp_store,
			repository,
			bucket: bucket.into(),
			concurrency: concurrency.max(1),
			upload_retry,
			database_retry,
		}
	}

	/// Restores queue state after a restart.
	async fn seed(&self) -> anyhow::Result<()> {
		let pending = self.repository.pending_uploads().await?;
		let mut restored = 0usize;
		let mut dropped = 0usize;

		for metadata in pending {
			if self.temp_store.survives_restart(&metadata.file.temporary_location) {
				restored += 1;
				self.queue
					.enqueue(metadata)
					.await
					.map_err(|e| anyhow::anyhow!(e))?;
			} else {
				dropped += 1;
				self.repository
					.delete(&metadata.correlation_id, &metadata.identifier)
					.await?;
			}
		}

		info!(restored, dropped, "Seeded upload queue from pending metadata");
		Ok(())
	}

	#[instrument(skip_all, fields(correlation_id = %metadata.correlation_id, identifier = %metadata.identifier))]
	async fn upload(&self, mut metadata: FileStorageMetadata) {
		let result = self.upload_files(&mut metadata).await;

		match result {
			Ok(()) => {
				metadata.upload_state = UploadState::Uploaded;
				self.temp_store.remove(&metadata.file.temporary_location).await;
				if let Some(json) = &metadata.json_file {
					self.temp_store.remove(&json.temporary_location).await;
				}
			}
			Err(err) => {
				error!("Upload failed terminally: {err}");
				metadata.upload_state = UploadState::Failed;
			}
		}

		let persisted = self
			.database_retry
			.run("metadata-update", || async {
				self.repository.update(&metadata).await
			})
			.await;
		if let Err(err) = persisted {
			error!("Failed to persist upload state: {err}");
		}
	}

	async fn upload_files(&self, metadata: &mut FileStorageMetadata) -> anyhow::Result<()> {
		let user_metadata = [
			(String::from("Source"), metadata.source.clone()),
			(String::from("Workflows"), metadata.workflows.join(",")),
		];

		// Sidecar first so a consumer never sees a primary without it.
		if metadata.json_file.is_some() {
			let key = metadata.remote_key(&format!("{}.json", metadata.file_extension()));
			let json = metadata.json_file.as_ref().unwrap();
			let bytes = self.temp_store.read(&json.temporary_location).await?;
			let content_type = json.content_type.clone();
			self.upload_retry
				.run("upload-sidecar", || {
					let bytes = bytes.clone();
					let key = key.clone();
					let content_type = content_type.clone();
					let user_metadata = &user_metadata;
					async move {
						self.object_store
							.put(&self.bucket, &key, bytes, &content_type, user_metadata)
							.await
					}
				})
				.await?;
			metadata.json_file.as_mut().unwrap().remote_path = Some(key);
		}

		let key = metadata.remote_key(metadata.file_extension());
		let bytes = self.temp_store.read(&metadata.file.temporary_location).await?;
		let content_type = metadata.file.content_type.clone();
		self.upload_retry
			.run("upload-object", || {
				let bytes = bytes.clone();
				let key = key.clone();
				let content_type = content_type.clone();
				let user_metadata = &user_metadata;
				async move {
					self.object_store
						.put(&self.bucket, &key, bytes, &content_type, user_metadata)
						.await
				}
			})
			.await?;
		metadata.file.remote_path = Some(key);
		Ok(())
	}
}

#[async_trait]
impl Component for ObjectUploadWorker {
	fn name(&self) -> &'static str {
		"object-upload"
	}

	async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
		// Restoration competes with live ingress for queue slots, so it runs
		// concurrently with the consume loop below.
		let seeder = Arc::clone(&self);
		tokio::spawn(async move {
			if let Err(err) = seeder.seed().await {
				error!("Failed to seed upload queue: {err:#}");
			}
		});

		let semaphore = Arc::new(Semaphore::new(self.concurrency));
		loop {
			tokio::select! {
				() = token.cancelled() => break,
				maybe_metadata = self.queue.dequeue() => {
					let Some(metadata) = maybe_metadata else { break };
					let permit = Arc::clone(&semaphore)
						.acquire_owned()
						.await
						.expect("Semaphore should not be closed");
					let worker = Arc::clone(&self);
					tokio::spawn(async move {
						worker.upload(metadata).await;
						drop(permit);
					});
				}
			}
		}

		// Let in-flight uploads persist their terminal state.
		let _ = semaphore.acquire_many(self.concurrency as u32).await;
		warn!("Upload worker stopped");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::TemporaryDataStorage;
	use crate::repository::InMemoryMetadataRepository;
	use crate::storage::object_store::{InMemoryObjectStore, ObjectStoreError};
	use crate::storage::{DataKind, StorageFile, CONTENT_TYPE_DICOM, CONTENT_TYPE_DICOM_JSON};
	use crate::types::{DataOrigin, DataService};
	use bytes::Bytes;
	use std::time::Duration;

	struct BrokenStore;

	#[async_trait]
	impl ObjectStore for BrokenStore {
		async fn put(
			&self,
			_bucket: &str,
			_key: &str,
			_bytes: Bytes,
			_content_type: &str,
			_user_metadata: &[(String, String)],
		) -> Result<(), ObjectStoreError> {
			Err(ObjectStoreError::Sdk("unreachable endpoint".into()))
		}

		async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError> {
			Err(ObjectStoreError::Missing {
				bucket: bucket.to_owned(),
				key: key.to_owned(),
			})
		}

		async fn delete(&self, _bucket: &str, _key: &str) -> Result<(), ObjectStoreError> {
			Ok(())
		}
	}

	fn origin() -> DataOrigin {
		DataOrigin {
			data_service: DataService::Dimse,
			source: String::from("MODALITY"),
			destination: String::from("GATEWAY"),
		}
	}

	async fn buffered_metadata(temp: &TemporaryStore, identifier: &str) -> FileStorageMetadata {
		let location = temp
			.write(&format!("corr/{identifier}.dcm"), Bytes::from_static(b"DICM"))
			.await
			.unwrap();
		let mut metadata = FileStorageMetadata::new(
			identifier,
			"corr",
			DataKind::Dicom {
				study_instance_uid: String::from("1.2.3"),
				series_instance_uid: String::from("1.2.3.4"),
				sop_instance_uid: identifier.to_owned(),
			},
			&origin(),
			StorageFile::new(location, CONTENT_TYPE_DICOM),
		);
		metadata.workflows.push(String::from("wf-1"));
		metadata
	}

	fn worker(
		queue: Arc<ObjectUploadQueue>,
		store: Arc<dyn ObjectStore>,
		temp: Arc<TemporaryStore>,
		repo: Arc<InMemoryMetadataRepository>,
	) -> Arc<ObjectUploadWorker> {
		Arc::new(ObjectUploadWorker::new(
			queue,
			store,
			temp,
			repo,
			"bucket",
			2,
			RetryPolicy::new(&[1]),
			RetryPolicy::new(&[1]),
		))
	}

	#[tokio::test]
	async fn uploads_and_marks_metadata() {
		let queue = Arc::new(ObjectUploadQueue::new(2));
		let store = Arc::new(InMemoryObjectStore::new());
		let temp = Arc::new(TemporaryStore::new(TemporaryDataStorage::Memory, "/unused"));
		let repo = Arc::new(InMemoryMetadataRepository::new());

		let metadata = buffered_metadata(&temp, "1.2.3.4.5").await;
		repo.save(&metadata).await.unwrap();
		queue.enqueue(metadata).await.unwrap();

		let token = CancellationToken::new();
		let handle = tokio::spawn(
			worker(Arc::clone(&queue), store.clone(), temp, Arc::clone(&repo))
				.run(token.clone()),
		);

		tokio::time::sleep(Duration::from_millis(200)).await;
		token.cancel();
		handle.await.unwrap().unwrap();

		let stored = repo.get("corr", "1.2.3.4.5").await.unwrap().unwrap();
		assert_eq!(stored.upload_state, UploadState::Uploaded);
		assert_eq!(
			stored.file.remote_path.as_deref(),
			Some("corr/1.2.3.4.5.dcm")
		);

		let object = store.object("bucket", "corr/1.2.3.4.5.dcm").unwrap();
		assert_eq!(object.content_type, CONTENT_TYPE_DICOM);
		assert!(object
			.user_metadata
			.contains(&(String::from("Source"), String::from("MODALITY"))));
		assert!(object
			.user_metadata
			.contains(&(String::from("Workflows"), String::from("wf-1"))));
	}

	#[tokio::test]
	async fn sidecar_is_uploaded_before_primary() {
		let queue = Arc::new(ObjectUploadQueue::new(2));
		let store = Arc::new(InMemoryObjectStore::new());
		let temp = Arc::new(TemporaryStore::new(TemporaryDataStorage::Memory, "/unused"));
		let repo = Arc::new(InMemoryMetadataRepository::new());

		let mut metadata = buffered_metadata(&temp, "1.2.3.4.6").await;
		let json_location = temp
			.write("corr/1.2.3.4.6.dcm.json", Bytes::from_static(b"{}"))
			.await
			.unwrap();
		metadata.json_file = Some(StorageFile::new(json_location, CONTENT_TYPE_DICOM_JSON));
		repo.save(&metadata).await.unwrap();
		queue.enqueue(metadata).await.unwrap();

		let token = CancellationToken::new();
		let handle = tokio::spawn(
			worker(Arc::clone(&queue), store.clone(), temp, Arc::clone(&repo))
				.run(token.clone()),
		);
		tokio::time::sleep(Duration::from_millis(200)).await;
		token.cancel();
		handle.await.unwrap().unwrap();

		let stored = repo.get("corr", "1.2.3.4.6").await.unwrap().unwrap();
		assert_eq!(
			stored.json_file.unwrap().remote_path.as_deref(),
			Some("corr/1.2.3.4.6.dcm.json")
		);
		assert!(store.object("bucket", "corr/1.2.3.4.6.dcm.json").is_some());
	}

	#[tokio::test]
	async fn exhausted_retries_mark_failed() {
		let queue = Arc::new(ObjectUploadQueue::new(2));
		let temp = Arc::new(TemporaryStore::new(TemporaryDataStorage::Memory, "/unused"));
		let repo = Arc::new(InMemoryMetadataRepository::new());

		let metadata = buffered_metadata(&temp, "1.2.3.4.7").await;
		repo.save(&metadata).await.unwrap();
		queue.enqueue(metadata).await.unwrap();

		let token = CancellationToken::new();
		let handle = tokio::spawn(
			worker(
				Arc::clone(&queue),
				Arc::new(BrokenStore),
				temp,
				Arc::clone(&repo),
			)
			.run(token.clone()),
		);
		tokio::time::sleep(Duration::from_millis(200)).await;
		token.cancel();
		handle.await.unwrap().unwrap();

		let stored = repo.get("corr", "1.2.3.4.7").await.unwrap().unwrap();
		assert_eq!(stored.upload_state, UploadState::Failed);
	}

	#[tokio::test]
	async fn seed_drops_records_without_surviving_buffers() {
		let queue = Arc::new(ObjectUploadQueue::new(2));
		let store = Arc::new(InMemoryObjectStore::new());
		// memory buffers never survive a restart
		let temp = Arc::new(TemporaryStore::new(TemporaryDataStorage::Memory, "/unused"));
		let repo = Arc::new(InMemoryMetadataRepository::new());

		let metadata = FileStorageMetadata::new(
			"1.9.9",
			"corr",
			DataKind::Dicom {
				study_instance_uid: String::from("1.2.3"),
				series_instance_uid: String::from("1.2.3.4"),
				sop_instance_uid: String::from("1.9.9"),
			},
			&origin(),
			StorageFile::new(String::from("mem:gone"), CONTENT_TYPE_DICOM),
		);
		repo.save(&metadata).await.unwrap();

		let token = CancellationToken::new();
		let handle = tokio::spawn(
			worker(queue, store, temp, Arc::clone(&repo)).run(token.clone()),
		);
		tokio::time::sleep(Duration::from_millis(100)).await;
		token.cancel();
		handle.await.unwrap().unwrap();

		assert!(repo.get("corr", "1.9.9").await.unwrap().is_none());
	}
}
