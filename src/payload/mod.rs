pub mod assembler;
pub mod notifier;

use crate::storage::FileStorageMetadata;
use crate::types::DataOrigin;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Assembly lifecycle. The state only ever advances; `Failed` is terminal
/// and reached when publication retries are exhausted or a member file
/// cannot be uploaded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadState {
	Created,
	Move,
	Notify,
	Published,
	Failed,
}

/// A set of received objects grouped under one key, published downstream as
/// a single workflow request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
	pub payload_id: Uuid,
	/// Opaque grouping key chosen by the ingestor (DICOM tag value or
	/// correlation id).
	pub key: String,
	pub correlation_id: String,
	pub workflow_instance_id: Option<String>,
	pub files: Vec<FileStorageMetadata>,
	pub state: PayloadState,
	pub retry_count: u32,
	/// Inactivity window in seconds.
	pub timeout: u64,
	pub date_created: DateTime<Utc>,
	pub machine_name: String,
	pub data_origins: Vec<DataOrigin>,
	pub workflows: Vec<String>,
}

impl Payload {
	pub fn new(key: impl Into<String>, correlation_id: impl Into<String>, timeout: u64) -> Self {
		Self {
			payload_id: Uuid::new_v4(),
			key: key.into(),
			correlation_id: correlation_id.into(),
			workflow_instance_id: None,
			files: Vec::new(),
			state: PayloadState::Created,
			retry_count: 0,
			timeout,
			date_created: Utc::now(),
			machine_name: hostname(),
			data_origins: Vec::new(),
			workflows: Vec::new(),
		}
	}

	pub fn file_count(&self) -> usize {
		self.files.len()
	}
}

fn hostname() -> String {
	std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("localhost"))
}
