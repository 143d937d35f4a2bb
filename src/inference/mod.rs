use crate::repository::RepositoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const TAKE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InferenceState {
	Queued,
	InProcess,
	Completed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InferenceStatus {
	Unknown,
	Success,
	Fail,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
	DicomWeb,
	#[serde(rename = "DIMSE")]
	Dimse,
	Fhir,
	Algorithm,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
	None,
	Basic,
	Bearer,
}

/// How to reach one input or output endpoint of an inference job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
	pub uri: String,
	pub auth_type: AuthType,
	/// Credential: `user:password` for Basic, the token for Bearer.
	pub auth_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResource {
	pub resource_type: ResourceType,
	pub connection: ConnectionDetails,
}

/// Descriptor of a remote inference job, leased FIFO by the exporters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
	pub transaction_id: String,
	pub inference_request_id: String,
	pub priority: u8,
	pub input_resources: Vec<RequestResource>,
	pub output_resources: Vec<RequestResource>,
	pub input_metadata: HashMap<String, String>,
	pub state: InferenceState,
	pub status: InferenceStatus,
	pub try_count: u32,
	pub date_created: DateTime<Utc>,
}

impl InferenceRequest {
	pub fn new(transaction_id: impl Into<String>, inference_request_id: impl Into<String>) -> Self {
		Self {
			transaction_id: transaction_id.into(),
			inference_request_id: inference_request_id.into(),
			priority: 128,
			input_resources: Vec::new(),
			output_resources: Vec::new(),
			input_metadata: HashMap::new(),
			state: InferenceState::Queued,
			status: InferenceStatus::Unknown,
			try_count: 0,
			date_created: Utc::now(),
		}
	}

	pub fn output_resources_of(&self, resource_type: ResourceType) -> Vec<&RequestResource> {
		self.output_resources
			.iter()
			.filter(|r| r.resource_type == resource_type)
			.collect()
	}
}

/// FIFO leasing queue over the durable inference-request store.
#[async_trait]
pub trait InferenceRequestRepository: Send + Sync {
	/// Persists a new request as `Queued` with a zero try count; the
	/// transaction id must be unique.
	async fn add(&self, request: InferenceRequest) -> Result<(), RepositoryError>;

	/// Leases the oldest `Queued` request, atomically marking it
	/// `InProcess`. Polls until one appears or the token fires.
	async fn take(&self, token: &CancellationToken) -> Option<InferenceRequest>;

	/// Settles a lease. Success completes the request; failure re-queues
	/// it until the retry cap forces `Completed`/`Fail`.
	async fn update(
		&self,
		transaction_id: &str,
		success: bool,
	) -> Result<InferenceRequest, RepositoryError>;

	async fn get_by_transaction_id(
		&self,
		transaction_id: &str,
	) -> Result<Option<InferenceRequest>, RepositoryError>;

	async fn get_by_request_id(
		&self,
		inference_request_id: &str,
	) -> Result<Option<InferenceRequest>, RepositoryError>;

	async fn exists(&self, transaction_id: &str) -> Result<bool, RepositoryError>;

	async fn status(
		&self,
		transaction_id: &str,
	) -> Result<Option<(InferenceState, InferenceStatus)>, RepositoryError>;
}

/// In-memory implementation; insertion order doubles as queue order.
pub struct InMemoryInferenceRequestRepository {
	rows: Mutex<Vec<InferenceRequest>>,
	retry_cap: u32,
}

impl InMemoryInferenceRequestRepository {
	/// `retry_cap` mirrors the length of the configured database retry
	/// delay table.
	pub fn new(retry_cap: u32) -> Self {
		Self {
			rows: Mutex::new(Vec::new()),
			retry_cap,
		}
	}
}

#[async_trait]
impl InferenceRequestRepository for InMemoryInferenceRequestRepository {
	async fn add(&self, mut request: InferenceRequest) -> Result<(), RepositoryError> {
		let mut rows = self.rows.lock().unwrap();
		if rows
			.iter()
			.any(|r| r.transaction_id == request.transaction_id)
		{
			return Err(RepositoryError::Duplicate(request.transaction_id));
		}
		request.state = InferenceState::Queued;
		request.status = InferenceStatus::Unknown;
		request.try_count = 0;
		rows.push(request);
		Ok(())
	}

	async fn take(&self, token: &CancellationToken) -> Option<InferenceRequest> {
		loop {
			{
				let mut rows = self.rows.lock().unwrap();
				if let Some(request) = rows
					.iter_mut()
					.filter(|r| r.state == InferenceState::Queued)
					.min_by_key(|r| r.date_created)
				{
					request.state = InferenceState::InProcess;
					return Some(request.clone());
				}
			}

			tokio::select! {
				() = token.cancelled() => return None,
				() = tokio::time::sleep(TAKE_POLL) => {}
			}
		}
	}

	async fn update(
		&self,
		transaction_id: &str,
		success: bool,
	) -> Result<InferenceRequest, RepositoryError> {
		let mut rows = self.rows.lock().unwrap();
		let request = rows
			.iter_mut()
			.find(|r| r.transaction_id == transaction_id)
			.ok_or_else(|| RepositoryError::NotFound(transaction_id.to_owned()))?;

		if success {
			request.state = InferenceState::Completed;
			request.status = InferenceStatus::Success;
		} else {
			request.try_count += 1;
			if request.try_count > self.retry_cap {
				request.state = InferenceState::Completed;
				request.status = InferenceStatus::Fail;
				info!(transaction_id, "Inference request failed permanently");
			} else {
				request.state = InferenceState::Queued;
			}
		}
		Ok(request.clone())
	}

	async fn get_by_transaction_id(
		&self,
		transaction_id: &str,
	) -> Result<Option<InferenceRequest>, RepositoryError> {
		Ok(self
			.rows
			.lock()
			.unwrap()
			.iter()
			.find(|r| r.transaction_id == transaction_id)
			.cloned())
	}

	async fn get_by_request_id(
		&self,
		inference_request_id: &str,
	) -> Result<Option<InferenceRequest>, RepositoryError> {
		Ok(self
			.rows
			.lock()
			.unwrap()
			.iter()
			.find(|r| r.inference_request_id == inference_request_id)
			.cloned())
	}

	async fn exists(&self, transaction_id: &str) -> Result<bool, RepositoryError> {
		Ok(self
			.rows
			.lock()
			.unwrap()
			.iter()
			.any(|r| r.transaction_id == transaction_id))
	}

	async fn status(
		&self,
		transaction_id: &str,
	) -> Result<Option<(InferenceState, InferenceStatus)>, RepositoryError> {
		Ok(self
			.rows
			.lock()
			.unwrap()
			.iter()
			.find(|r| r.transaction_id == transaction_id)
			.map(|r| (r.state, r.status)))
	}
}
