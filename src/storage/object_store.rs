use crate::config::S3Config;
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::Bytes;
use s3::primitives::ByteStream;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Object-store seam used by the upload worker and the export pipeline.
#[async_trait]
pub trait ObjectStore: Send + Sync {
	async fn put(
		&self,
		bucket: &str,
		key: &str,
		bytes: Bytes,
		content_type: &str,
		user_metadata: &[(String, String)],
	) -> Result<(), ObjectStoreError>;

	async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError>;

	async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError>;
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
	#[error("object {bucket}/{key} does not exist")]
	Missing { bucket: String, key: String },
	#[error(transparent)]
	Sdk(Box<dyn std::error::Error + Send + Sync>),
}

/// S3-compatible implementation (AWS, MinIO, and friends).
pub struct S3ObjectStore {
	client: s3::Client,
}

impl S3ObjectStore {
	pub async fn from_config(config: &S3Config) -> Result<Self, ObjectStoreError> {
		let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
			.endpoint_url(&config.endpoint);
		if let Some(region) = &config.region {
			loader = loader.region(aws_config::Region::new(region.clone()));
		}
		if let Some(credentials) = &config.credentials {
			let resolved = credentials
				.resolve()
				.map_err(|e| ObjectStoreError::Sdk(Box::new(e)))?;
			loader = loader.credentials_provider(resolved);
		}
		let sdk_config = loader.load().await;

		// MinIO and most self-hosted endpoints require path-style access.
		let s3_config = s3::config::Builder::from(&sdk_config)
			.force_path_style(true)
			.build();

		Ok(Self {
			client: s3::Client::from_conf(s3_config),
		})
	}
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
	async fn put(
		&self,
		bucket: &str,
		key: &str,
		bytes: Bytes,
		content_type: &str,
		user_metadata: &[(String, String)],
	) -> Result<(), ObjectStoreError> {
		let mut request = self
			.client
			.put_object()
			.bucket(bucket)
			.key(key)
			.content_type(content_type)
			.body(ByteStream::from(bytes));
		for (name, value) in user_metadata {
			request = request.metadata(name, value);
		}

		request
			.send()
			.await
			.map_err(|e| ObjectStoreError::Sdk(Box::new(e)))?;
		debug!(bucket, key, "Stored object");
		Ok(())
	}

	async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError> {
		let output = self
			.client
			.get_object()
			.bucket(bucket)
			.key(key)
			.send()
			.await
			.map_err(|e| ObjectStoreError::Sdk(Box::new(e)))?;

		let data = output
			.body
			.collect()
			.await
			.map_err(|e| ObjectStoreError::Sdk(Box::new(e)))?;
		Ok(data.into_bytes())
	}

	async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
		self.client
			.delete_object()
			.bucket(bucket)
			.key(key)
			.send()
			.await
			.map_err(|e| ObjectStoreError::Sdk(Box::new(e)))?;
		Ok(())
	}
}

/// Process-local store used by tests and broker-less development setups.
#[derive(Default)]
pub struct InMemoryObjectStore {
	objects: Mutex<HashMap<(String, String), StoredObject>>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
	pub bytes: Bytes,
	pub content_type: String,
	pub user_metadata: Vec<(String, String)>,
}

impl InMemoryObjectStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
		self.objects
			.lock()
			.unwrap()
			.get(&(bucket.to_owned(), key.to_owned()))
			.cloned()
	}

	pub fn keys(&self, bucket: &str) -> Vec<String> {
		self.objects
			.lock()
			.unwrap()
			.keys()
			.filter(|(b, _)| b == bucket)
			.map(|(_, k)| k.clone())
			.collect()
	}

	pub fn len(&self) -> usize {
		self.objects.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
	async fn put(
		&self,
		bucket: &str,
		key: &str,
		bytes: Bytes,
		content_type: &str,
		user_metadata: &[(String, String)],
	) -> Result<(), ObjectStoreError> {
		self.objects.lock().unwrap().insert(
			(bucket.to_owned(), key.to_owned()),
			StoredObject {
				bytes,
				content_type: content_type.to_owned(),
				user_metadata: user_metadata.to_vec(),
			},
		);
		Ok(())
	}

	async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError> {
		self.object(bucket, key)
			.map(|o| o.bytes)
			.ok_or_else(|| ObjectStoreError::Missing {
				bucket: bucket.to_owned(),
				key: key.to_owned(),
			})
	}

	async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
		self.objects
			.lock()
			.unwrap()
			.remove(&(bucket.to_owned(), key.to_owned()));
		Ok(())
	}
}
