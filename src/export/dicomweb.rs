use crate::events::{ExportRequestEvent, FileExportStatus};
use crate::export::{ExportRequestDataMessage, ExportSender};
use crate::inference::{AuthType, ConnectionDetails, InferenceRequestRepository, ResourceType};
use async_trait::async_trait;
use base64::Engine;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Ships export-task files to the DICOMweb endpoints named by the owning
/// inference request, one STOW-RS transaction per file and destination.
pub struct DicomWebExportSender {
	inference: Arc<dyn InferenceRequestRepository>,
	client: reqwest::Client,
}

impl DicomWebExportSender {
	pub fn new(
		inference: Arc<dyn InferenceRequestRepository>,
		client_timeout: Duration,
	) -> Result<Self, reqwest::Error> {
		let client = reqwest::Client::builder().timeout(client_timeout).build()?;
		Ok(Self { inference, client })
	}

	async fn post_instance(
		&self,
		connection: &ConnectionDetails,
		study_uid: &str,
		bytes: &[u8],
	) -> FileExportStatus {
		let url = stow_url(&connection.uri, study_uid);
		let boundary = Uuid::new_v4().simple().to_string();
		let body = multipart_related_body(&boundary, bytes);

		let mut request = self
			.client
			.post(&url)
			.header(CONTENT_TYPE, multipart_related_content_type(&boundary))
			.body(body);
		request = match (&connection.auth_type, &connection.auth_id) {
			(AuthType::None, _) | (_, None) => request,
			(AuthType::Basic, Some(credentials)) => {
				let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
				request.header(reqwest::header::AUTHORIZATION, format!("Basic {encoded}"))
			}
			(AuthType::Bearer, Some(token)) => {
				request.header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"))
			}
		};

		match request.send().await {
			Ok(response) => match response.status() {
				StatusCode::OK => FileExportStatus::Success,
				// Partial acceptance is not success for this gateway.
				status => {
					warn!(%status, url, "Remote STOW-RS did not accept the instance");
					FileExportStatus::ServiceError
				}
			},
			Err(err) => {
				error!(url, "STOW-RS request failed: {err}");
				FileExportStatus::ServiceError
			}
		}
	}
}

#[async_trait]
impl ExportSender for DicomWebExportSender {
	fn agent(&self) -> &'static str {
		"dicomweb-export"
	}

	async fn send(
		&self,
		request: &ExportRequestEvent,
		message: &ExportRequestDataMessage,
	) -> FileExportStatus {
		// The export task is bound to an inference request by correlation id.
		let inference = match self
			.inference
			.get_by_transaction_id(&request.correlation_id)
			.await
		{
			Ok(Some(inference)) => inference,
			Ok(None) => {
				error!(
					transaction_id = request.correlation_id,
					"No inference request for export task"
				);
				return FileExportStatus::ConfigurationError;
			}
			Err(err) => {
				error!("Failed to load inference request: {err}");
				return FileExportStatus::ConfigurationError;
			}
		};

		let destinations = inference.output_resources_of(ResourceType::DicomWeb);
		if destinations.is_empty() {
			error!(
				transaction_id = inference.transaction_id,
				"Inference request has no DICOMweb output resource"
			);
			return FileExportStatus::ConfigurationError;
		}

		let file = match dicom::object::from_reader(message.bytes.as_ref()) {
			Ok(file) => file,
			Err(err) => {
				error!(file = message.file_path, "Stored object is not DICOM: {err}");
				return FileExportStatus::ServiceError;
			}
		};
		let study_uid = file
			.get(tags::STUDY_INSTANCE_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|uid| uid.trim_end_matches('\0').to_owned())
			.unwrap_or_default();

		for destination in destinations {
			let status = self
				.post_instance(&destination.connection, &study_uid, &message.bytes)
				.await;
			if status != FileExportStatus::Success {
				return status;
			}
			info!(
				uri = destination.connection.uri,
				file = message.file_path,
				"Instance exported via STOW-RS"
			);
		}
		FileExportStatus::Success
	}
}

fn stow_url(base: &str, study_uid: &str) -> String {
	let base = base.trim_end_matches('/');
	if study_uid.is_empty() {
		format!("{base}/studies")
	} else {
		format!("{base}/studies/{study_uid}")
	}
}

fn multipart_related_content_type(boundary: &str) -> String {
	format!("multipart/related; type=\"application/dicom\"; boundary={boundary}")
}

fn multipart_related_body(boundary: &str, bytes: &[u8]) -> Vec<u8> {
	let mut body =
		Vec::with_capacity(bytes.len() + boundary.len() * 2 + 128);
	body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
	body.extend_from_slice(b"Content-Type: application/dicom\r\n\r\n");
	body.extend_from_slice(bytes);
	body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
	body
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::inference::{InMemoryInferenceRequestRepository, InferenceRequest, RequestResource};
	use bytes::Bytes;

	fn message() -> ExportRequestDataMessage {
		ExportRequestDataMessage {
			export_task_id: Uuid::new_v4(),
			correlation_id: String::from("tx-1"),
			file_path: String::from("f1"),
			bytes: Bytes::from_static(b"not dicom"),
			status: None,
		}
	}

	fn request() -> ExportRequestEvent {
		ExportRequestEvent {
			export_task_id: Uuid::new_v4(),
			correlation_id: String::from("tx-1"),
			workflow_instance_id: None,
			files: vec![String::from("f1")],
			destinations: vec![String::from("d1")],
		}
	}

	#[tokio::test]
	async fn missing_inference_request_is_a_configuration_error() {
		let sender = DicomWebExportSender::new(
			Arc::new(InMemoryInferenceRequestRepository::new(3)),
			Duration::from_secs(5),
		)
		.unwrap();

		let status = sender.send(&request(), &message()).await;
		assert_eq!(status, FileExportStatus::ConfigurationError);
	}

	#[tokio::test]
	async fn inference_request_without_dicomweb_destination_is_a_configuration_error() {
		let repository = Arc::new(InMemoryInferenceRequestRepository::new(3));
		let mut inference = InferenceRequest::new("tx-1", "req-1");
		inference.output_resources.push(RequestResource {
			resource_type: ResourceType::Dimse,
			connection: ConnectionDetails {
				uri: String::from("PACS"),
				auth_type: AuthType::None,
				auth_id: None,
			},
		});
		repository.add(inference).await.unwrap();

		let sender =
			DicomWebExportSender::new(repository, Duration::from_secs(5)).unwrap();
		let status = sender.send(&request(), &message()).await;
		assert_eq!(status, FileExportStatus::ConfigurationError);
	}

	#[test]
	fn stow_urls() {
		assert_eq!(
			stow_url("http://pacs/dicomweb/", "1.2.3"),
			"http://pacs/dicomweb/studies/1.2.3"
		);
		assert_eq!(stow_url("http://pacs/dicomweb", ""), "http://pacs/dicomweb/studies");
	}

	#[test]
	fn multipart_body_is_well_formed() {
		let body = multipart_related_body("b0und", b"DICM");
		let text = String::from_utf8_lossy(&body);
		assert!(text.starts_with("--b0und\r\nContent-Type: application/dicom\r\n\r\nDICM"));
		assert!(text.ends_with("\r\n--b0und--\r\n"));
		assert_eq!(
			multipart_related_content_type("b0und"),
			"multipart/related; type=\"application/dicom\"; boundary=b0und"
		);
	}
}
