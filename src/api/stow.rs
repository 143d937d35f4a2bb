use crate::api::AppState;
use crate::config::default_grouping_timeout;
use crate::ingest::IngestError;
use crate::plugins::DicomFile;
use crate::types::{DataOrigin, DataService, UI, US};
use crate::utils::multipart::DicomMultipart;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Buf;
use dicom::core::value::{DataSetSequence, Value};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::{FileDicomObject, InMemDicomObject};
use dicom_json::DicomJson;
use tracing::{error, instrument, warn};
use uuid::Uuid;

/// Store-transaction failure reasons.
/// <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.5>
const REASON_PROCESSING_FAILURE: US = 0x0110;
const REASON_CANNOT_UNDERSTAND: US = 0xC000;
const REASON_MISMATCHED_STUDY: US = 0xA900;

/// HTTP router for the Store Transaction
/// <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.5>
pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/dicomweb/studies", post(studies))
		.route("/dicomweb/studies/{study}", post(study))
		.route("/dicomweb/{workflow}/studies", post(workflow_studies))
		.route("/dicomweb/{workflow}/studies/{study}", post(workflow_study))
}

async fn studies(
	State(state): State<AppState>,
	multipart: DicomMultipart<'static>,
) -> Response {
	store(state, None, None, multipart).await
}

async fn study(
	State(state): State<AppState>,
	Path(study): Path<String>,
	multipart: DicomMultipart<'static>,
) -> Response {
	store(state, None, Some(study), multipart).await
}

async fn workflow_studies(
	State(state): State<AppState>,
	Path(workflow): Path<String>,
	multipart: DicomMultipart<'static>,
) -> Response {
	store(state, Some(workflow), None, multipart).await
}

async fn workflow_study(
	State(state): State<AppState>,
	Path((workflow, study)): Path<(String, String)>,
	multipart: DicomMultipart<'static>,
) -> Response {
	store(state, Some(workflow), Some(study), multipart).await
}

#[instrument(skip_all, fields(workflow, study))]
async fn store(
	state: AppState,
	workflow: Option<String>,
	study: Option<String>,
	mut multipart: DicomMultipart<'static>,
) -> Response {
	if !state.storage_info.has_space_to_store() {
		error!("Rejecting STOW-RS request: insufficient storage");
		return (
			StatusCode::INSUFFICIENT_STORAGE,
			"Not enough storage space to accept new data",
		)
			.into_response();
	}

	// The workflow path segment names a virtual AE.
	let virtual_ae = match &workflow {
		Some(name) => match state.entities.virtual_by_name(name) {
			Some(entity) => Some(entity),
			None => {
				return (
					StatusCode::NOT_FOUND,
					format!("Unknown virtual application entity {name}"),
				)
					.into_response()
			}
		},
		None => None,
	};

	let correlation_id = Uuid::new_v4().to_string();
	let destination = virtual_ae
		.as_ref()
		.map_or_else(|| String::from("DICOMWEB"), |ae| ae.name.clone());
	let origin = DataOrigin {
		data_service: DataService::DicomWeb,
		source: String::from("DICOMWEB"),
		destination,
	};
	let workflows = virtual_ae
		.as_ref()
		.map(|ae| ae.workflows.clone())
		.unwrap_or_default();
	let plug_ins = virtual_ae
		.as_ref()
		.map(|ae| ae.plug_in_assemblies.clone())
		.unwrap_or_default();

	let mut response = StoreResponse::default();
	let mut received = 0usize;
	while let Some(field) = multipart.next_field().await.unwrap_or_default() {
		received += 1;
		let data = match field.bytes().await {
			Ok(data) => data,
			Err(err) => {
				warn!("Failed to read multipart part: {err}");
				response.failed.push(FailedReference::unknown(REASON_CANNOT_UNDERSTAND));
				continue;
			}
		};
		if data.is_empty() {
			response.failed.push(FailedReference::unknown(REASON_CANNOT_UNDERSTAND));
			continue;
		}

		let file: DicomFile = match FileDicomObject::from_reader(data.reader()) {
			Ok(file) => file,
			Err(err) => {
				warn!("Part is not a DICOM instance: {err}");
				response.failed.push(FailedReference::unknown(REASON_CANNOT_UNDERSTAND));
				continue;
			}
		};

		let reference = InstanceReference::of(&file);
		if let Some(expected_study) = &study {
			let actual = instance_study_uid(&file);
			if &actual != expected_study {
				warn!(
					expected = expected_study,
					actual, "Instance does not belong to the addressed study"
				);
				response
					.failed
					.push(reference.failed(REASON_MISMATCHED_STUDY));
				continue;
			}
		}

		let result = state
			.processor
			.process_dicom(
				file,
				&correlation_id,
				origin.clone(),
				None,
				&plug_ins,
				workflows.clone(),
				default_grouping_timeout(),
			)
			.await;

		match result {
			Ok(_payload_id) => response.referenced.push(reference),
			Err(IngestError::Validation(reason)) => {
				warn!(reason, "Instance rejected");
				response.failed.push(reference.failed(REASON_CANNOT_UNDERSTAND));
			}
			Err(err) => {
				error!("Failed to ingest instance: {err}");
				response
					.failed
					.push(reference.failed(REASON_PROCESSING_FAILURE));
			}
		}
	}

	if received == 0 {
		return StatusCode::NO_CONTENT.into_response();
	}

	let status = response.status_code();
	let json = DicomJson::from(InMemDicomObject::from(response));
	match serde_json::to_string(&json) {
		Ok(body) => Response::builder()
			.status(status)
			.header(CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
			.body(Body::from(body))
			.expect("response builder with valid parts"),
		Err(err) => {
			error!("Failed to encode store response: {err}");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		}
	}
}

/// <https://dicom.nema.org/medical/dicom/current/output/html/part03.html#table_10-11>
#[derive(Debug, Clone)]
struct InstanceReference {
	sop_class_uid: UI,
	sop_instance_uid: UI,
}

impl InstanceReference {
	fn of(file: &DicomFile) -> Self {
		Self {
			sop_class_uid: UI::from(file.meta().media_storage_sop_class_uid()),
			sop_instance_uid: UI::from(file.meta().media_storage_sop_instance_uid()),
		}
	}

	fn failed(&self, reason: US) -> FailedReference {
		FailedReference {
			reference: self.clone(),
			reason,
		}
	}
}

#[derive(Debug)]
struct FailedReference {
	reference: InstanceReference,
	reason: US,
}

impl FailedReference {
	/// Parts that never parsed far enough to expose their UIDs.
	fn unknown(reason: US) -> Self {
		Self {
			reference: InstanceReference {
				sop_class_uid: UI::new(),
				sop_instance_uid: UI::new(),
			},
			reason,
		}
	}
}

#[derive(Debug, Default)]
struct StoreResponse {
	referenced: Vec<InstanceReference>,
	failed: Vec<FailedReference>,
}

impl StoreResponse {
	/// `200` all stored, `202` partial, `409` all failed.
	fn status_code(&self) -> StatusCode {
		match (self.referenced.is_empty(), self.failed.is_empty()) {
			(false, true) => StatusCode::OK,
			(false, false) => StatusCode::ACCEPTED,
			_ => StatusCode::CONFLICT,
		}
	}
}

impl From<StoreResponse> for InMemDicomObject {
	fn from(response: StoreResponse) -> Self {
		let mut object = Self::new_empty();

		let mut referenced_sequence = InMemElement::new(
			tags::REFERENCED_SOP_SEQUENCE,
			VR::SQ,
			Value::Sequence(DataSetSequence::empty()),
		);
		let referenced_items = referenced_sequence.items_mut().expect("Sequence exists");
		for referenced in response.referenced {
			referenced_items.push(Self::from_element_iter([
				DataElement::new(
					tags::REFERENCED_SOP_CLASS_UID,
					VR::UI,
					dicom_value!(Str, referenced.sop_class_uid),
				),
				DataElement::new(
					tags::REFERENCED_SOP_INSTANCE_UID,
					VR::UI,
					dicom_value!(Str, referenced.sop_instance_uid),
				),
			]));
		}

		let mut failed_sequence = InMemElement::new(
			tags::FAILED_SOP_SEQUENCE,
			VR::SQ,
			Value::Sequence(DataSetSequence::empty()),
		);
		let failed_items = failed_sequence.items_mut().expect("Sequence exists");
		for failed in response.failed {
			failed_items.push(Self::from_element_iter([
				DataElement::new(
					tags::REFERENCED_SOP_CLASS_UID,
					VR::UI,
					dicom_value!(Str, failed.reference.sop_class_uid),
				),
				DataElement::new(
					tags::REFERENCED_SOP_INSTANCE_UID,
					VR::UI,
					dicom_value!(Str, failed.reference.sop_instance_uid),
				),
				DataElement::new(
					tags::FAILURE_REASON,
					VR::US,
					dicom_value!(U16, [failed.reason]),
				),
			]));
		}

		object.put(referenced_sequence);
		object.put(failed_sequence);
		object
	}
}

fn instance_study_uid(file: &DicomFile) -> String {
	file.get(tags::STUDY_INSTANCE_UID)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|uid| uid.trim_end_matches('\0').to_owned())
		.unwrap_or_default()
}
