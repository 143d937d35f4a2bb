//! DIMSE support shared by the ingress SCP and the export SCU.
//!
//! The gateway only speaks C-STORE and C-ECHO, so this module deals in
//! those two conversations: command-set builders and parsers, the status
//! codes the services answer with, and the error taxonomy that flows up
//! into the ingest and export paths. The blocking wire handling lives in
//! [`channel`] and [`codec`].

pub mod channel;
mod codec;
pub mod pool;
pub mod scp;
pub mod scu;

pub use codec::{Exchange, NegotiatedContext};

use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU16, Ordering};
use thiserror::Error;

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message contains a data set.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message has no data set.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

// Command fields defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;
pub const COMMAND_FIELD_COMPOSITE_ECHO_REQUEST: US = 0x0030;
pub const COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE: US = 0x8030;

// Status codes returned by the store service.
pub const STATUS_SUCCESS: US = 0x0000;
pub const STATUS_PROCESSING_FAILURE: US = 0x0110;
pub const STATUS_OUT_OF_RESOURCES: US = 0xA700;
pub const STATUS_CANNOT_UNDERSTAND: US = 0xC000;

/// Everything that can go wrong between the gateway and a DIMSE peer.
///
/// One taxonomy for both directions: the SCP records these on the
/// association audit row, the exporters map them to per-file statuses.
#[derive(Debug, Error)]
pub enum DimseError {
	#[error("failed to establish association: {0}")]
	Establish(Box<dyn std::error::Error + Send + Sync>),
	#[error("transport failure: {0}")]
	Transport(Box<dyn std::error::Error + Send + Sync>),
	#[error("failed to encode data set: {0}")]
	Encode(#[from] dicom::object::WriteError),
	#[error("failed to decode data set: {0}")]
	Decode(#[from] dicom::object::ReadError),
	#[error("no negotiated presentation context matches id {0:?}")]
	NoPresentationContext(Option<u8>),
	#[error("transfer syntax '{0}' is not supported")]
	UnsupportedTransferSyntax(UI),
	#[error("peer sent fragments out of order")]
	FragmentOrder,
	#[error("peer sent an unexpected {0} PDU")]
	UnexpectedPdu(&'static str),
	#[error("peer ended the association mid-conversation")]
	PeerClosed,
	#[error("response is missing tag {0}")]
	MissingAttribute(Tag),
	#[error("failed to write chunked P-DATA: {0}")]
	ChunkWriter(std::io::Error),
	#[error("the association actor is gone")]
	ActorGone,
	#[error("timed out waiting for the peer")]
	Timeout,
	#[error("failed to spawn association thread: {0}")]
	Thread(std::io::Error),
}

/// Represents a DICOM message composed of a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	/// The command set.
	pub command: InMemDicomObject,
	/// The data set.
	pub data: Option<InMemDicomObject>,
	/// The presentation context id
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

impl DicomMessage {
	pub fn command_field(&self) -> Option<US> {
		self.command
			.get(tags::COMMAND_FIELD)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
	}

	pub fn message_id(&self) -> US {
		self.command
			.get(tags::MESSAGE_ID)
			.map(InMemElement::to_int)
			.and_then(Result::ok)
			.unwrap_or(0)
	}

	pub fn status(&self) -> Option<US> {
		self.command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
	}

	pub fn string(&self, tag: Tag) -> Option<String> {
		self.command
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value| value.trim_end_matches('\0').to_owned())
	}
}

/// Status types supported by the DIMSE services.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF | 0xC000..=0xCFFF => {
				Ok(Self::Failure)
			}
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

/// C-STORE-RQ
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub message_id: US,
	pub priority: US,
	pub data_set: InMemDicomObject,
}

impl From<CompositeStoreRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeStoreRequest) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_REQUEST])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
            DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
        ]);

        Self {
            command,
            data: Some(request.data_set),
            presentation_context_id: None,
        }
    }
}

/// C-STORE-RSP
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub status: US,
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
            DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: None,
        }
    }
}

/// C-ECHO-RQ
#[derive(Debug)]
pub struct CompositeEchoRequest {
	pub message_id: US,
}

impl From<CompositeEchoRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeEchoRequest) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_REQUEST])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: None,
        }
    }
}

/// C-ECHO-RSP
#[derive(Debug)]
pub struct CompositeEchoResponse {
	pub message_id: US,
	pub status: US,
}

impl From<CompositeEchoResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeEchoResponse) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: None,
        }
    }
}

/// Returns a new message id by incrementing a global counter.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(0);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_type_classification() {
		assert_eq!(StatusType::try_from(STATUS_SUCCESS), Ok(StatusType::Success));
		assert_eq!(
			StatusType::try_from(STATUS_OUT_OF_RESOURCES),
			Ok(StatusType::Failure)
		);
		assert_eq!(
			StatusType::try_from(STATUS_PROCESSING_FAILURE),
			Ok(StatusType::Failure)
		);
		assert_eq!(
			StatusType::try_from(STATUS_CANNOT_UNDERSTAND),
			Ok(StatusType::Failure)
		);
		assert_eq!(StatusType::try_from(0xB006), Ok(StatusType::Warning));
		assert_eq!(StatusType::try_from(0xFF00), Ok(StatusType::Pending));
	}

	#[test]
	fn store_response_round_trips_through_command_set() {
		let response = CompositeStoreResponse {
			message_id: 7,
			sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.1.7"),
			sop_instance_uid: UI::from("1.2.3.4.5"),
			status: STATUS_OUT_OF_RESOURCES,
		};

		let message = DicomMessage::from(response);
		assert_eq!(
			message.command_field(),
			Some(COMMAND_FIELD_COMPOSITE_STORE_RESPONSE)
		);
		assert_eq!(message.status(), Some(STATUS_OUT_OF_RESOURCES));
		assert_eq!(
			message.string(tags::AFFECTED_SOP_INSTANCE_UID).as_deref(),
			Some("1.2.3.4.5")
		);
		assert!(message.data.is_none());
	}
}
