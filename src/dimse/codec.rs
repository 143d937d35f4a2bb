//! Blocking message codec used on the association actor threads.
//!
//! Commands always travel as Implicit VR Little Endian; data sets use the
//! transfer syntax negotiated for their presentation context. Decoding
//! treats A-RELEASE-RQ and A-ABORT as ordinary outcomes so the callers can
//! wind an association down without special-casing error values.

use crate::dimse::{DicomMessage, DimseError, DATA_SET_MISSING};
use crate::types::{UI, US};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType, PresentationContextResult};
use dicom::ul::Pdu;
use tracing::trace;

/// What arrived on the association next.
#[derive(Debug)]
pub enum Exchange {
	Message(DicomMessage),
	/// The peer asked to release the association.
	Released,
	/// The peer aborted the association.
	Aborted,
}

/// The slice of a negotiated presentation context the gateway acts on.
#[derive(Debug, Clone)]
pub struct NegotiatedContext {
	pub id: u8,
	pub transfer_syntax: String,
}

impl From<&PresentationContextResult> for NegotiatedContext {
	fn from(pctx: &PresentationContextResult) -> Self {
		Self {
			id: pctx.id,
			transfer_syntax: pctx.transfer_syntax.clone(),
		}
	}
}

/// A message encoded for one presentation context. The actor decides how
/// to put the data buffer on the wire (single P-DATA or chunked writer).
#[derive(Debug)]
pub(crate) struct EncodedMessage {
	pub presentation_context_id: u8,
	pub command: Vec<u8>,
	pub data: Option<Vec<u8>>,
}

impl EncodedMessage {
	pub fn command_pdu(&self) -> Pdu {
		Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Command,
				presentation_context_id: self.presentation_context_id,
				is_last: true,
				data: self.command.clone(),
			}],
		}
	}

	pub fn data_pdu(&self, data: Vec<u8>) -> Pdu {
		Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Data,
				presentation_context_id: self.presentation_context_id,
				is_last: true,
				data,
			}],
		}
	}
}

/// Encoder/decoder bound to the association's negotiated contexts.
pub(crate) struct MessageCodec {
	contexts: Vec<NegotiatedContext>,
}

impl MessageCodec {
	pub fn new(contexts: Vec<NegotiatedContext>) -> Self {
		Self { contexts }
	}

	pub fn negotiated(&self) -> &[NegotiatedContext] {
		&self.contexts
	}

	fn context(&self, id: Option<u8>) -> Result<&NegotiatedContext, DimseError> {
		match id {
			None => self.contexts.first(),
			Some(id) => self.contexts.iter().find(|pctx| pctx.id == id),
		}
		.ok_or(DimseError::NoPresentationContext(id))
	}

	pub fn encode(&self, message: DicomMessage) -> Result<EncodedMessage, DimseError> {
		let context = self.context(message.presentation_context_id)?;

		let mut command = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

		let data = match message.data {
			None => None,
			Some(data_set) => {
				let transfer_syntax = TransferSyntaxRegistry
					.get(&context.transfer_syntax)
					.ok_or_else(|| {
						DimseError::UnsupportedTransferSyntax(UI::from(&context.transfer_syntax))
					})?;
				let mut buffer = Vec::new();
				data_set.write_dataset_with_ts(&mut buffer, transfer_syntax)?;
				Some(buffer)
			}
		};

		Ok(EncodedMessage {
			presentation_context_id: context.id,
			command,
			data,
		})
	}

	/// Pulls PDUs from `next_pdu` until a whole message (or an association
	/// wind-down) arrives.
	pub fn decode(
		&self,
		mut next_pdu: impl FnMut() -> Result<Pdu, DimseError>,
	) -> Result<Exchange, DimseError> {
		let mut pending = PendingMessage::default();

		loop {
			match next_pdu()? {
				Pdu::PData { data } => {
					for fragment in data {
						if let Some(message) = pending.push(self, fragment)? {
							return Ok(Exchange::Message(message));
						}
					}
				}
				Pdu::ReleaseRQ => return Ok(Exchange::Released),
				Pdu::AbortRQ { .. } => return Ok(Exchange::Aborted),
				other => return Err(DimseError::UnexpectedPdu(pdu_name(&other))),
			}
		}
	}
}

/// Accumulates command and data fragments for the message being received.
#[derive(Default)]
struct PendingMessage {
	command_fragments: Vec<u8>,
	data_fragments: Vec<u8>,
	command: Option<InMemDicomObject>,
	presentation_context_id: Option<u8>,
}

impl PendingMessage {
	/// Feeds one fragment; returns the finished message once complete.
	fn push(
		&mut self,
		codec: &MessageCodec,
		mut fragment: PDataValue,
	) -> Result<Option<DicomMessage>, DimseError> {
		self.presentation_context_id = Some(fragment.presentation_context_id);

		match fragment.value_type {
			PDataValueType::Command => {
				trace!("Received command fragment (last={})", fragment.is_last);
				if self.command.is_some() {
					// The command set is already complete; a second one
					// cannot belong to this message.
					return Err(DimseError::FragmentOrder);
				}
				self.command_fragments.append(&mut fragment.data);
				if !fragment.is_last {
					return Ok(None);
				}

				let command = InMemDicomObject::read_dataset_with_ts(
					self.command_fragments.as_slice(),
					&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
				)?;
				if has_data_set(&command) {
					self.command = Some(command);
					Ok(None)
				} else {
					Ok(Some(DicomMessage {
						command,
						data: None,
						presentation_context_id: self.presentation_context_id,
					}))
				}
			}
			PDataValueType::Data => {
				trace!("Received data fragment (last={})", fragment.is_last);
				if self.command.is_none() {
					// Data before the command set finished is a protocol
					// violation.
					return Err(DimseError::FragmentOrder);
				}
				self.data_fragments.append(&mut fragment.data);
				if !fragment.is_last {
					return Ok(None);
				}

				let context = codec.context(self.presentation_context_id)?;
				let transfer_syntax = TransferSyntaxRegistry
					.get(&context.transfer_syntax)
					.ok_or_else(|| {
						DimseError::UnsupportedTransferSyntax(UI::from(&context.transfer_syntax))
					})?;
				let data = InMemDicomObject::read_dataset_with_ts(
					self.data_fragments.as_slice(),
					transfer_syntax,
				)?;

				Ok(Some(DicomMessage {
					command: self.command.take().expect("command set is complete"),
					data: Some(data),
					presentation_context_id: self.presentation_context_id,
				}))
			}
		}
	}
}

fn has_data_set(command: &InMemDicomObject) -> bool {
	command
		.get(tags::COMMAND_DATA_SET_TYPE)
		.map(InMemElement::to_int::<US>)
		.and_then(Result::ok)
		.is_some_and(|value| value != DATA_SET_MISSING)
}

fn pdu_name(pdu: &Pdu) -> &'static str {
	match pdu {
		Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
		Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
		Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
		Pdu::PData { .. } => "P-DATA",
		Pdu::ReleaseRQ => "A-RELEASE-RQ",
		Pdu::ReleaseRP => "A-RELEASE-RP",
		Pdu::AbortRQ { .. } => "A-ABORT",
		_ => "unknown",
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::{CompositeEchoRequest, CompositeStoreRequest};
	use crate::types::Priority;
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;
	use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;

	fn codec() -> MessageCodec {
		MessageCodec::new(vec![NegotiatedContext {
			id: 1,
			transfer_syntax: EXPLICIT_VR_LITTLE_ENDIAN.uid().to_owned(),
		}])
	}

	fn store_request() -> CompositeStoreRequest {
		let mut data_set = InMemDicomObject::new_empty();
		data_set.put(DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, "1.2.3.4.5"),
		));
		CompositeStoreRequest {
			affected_sop_class_uid: UI::from("1.2.840.10008.5.1.4.1.1.7"),
			affected_sop_instance_uid: UI::from("1.2.3.4.5"),
			message_id: 1,
			priority: Priority::Medium as US,
			data_set,
		}
	}

	#[test]
	fn command_only_message_round_trips() {
		let codec = codec();
		let encoded = codec
			.encode(CompositeEchoRequest { message_id: 3 }.into())
			.unwrap();
		assert!(encoded.data.is_none());

		let mut pdus = vec![encoded.command_pdu()].into_iter();
		let exchange = codec
			.decode(|| pdus.next().ok_or(DimseError::PeerClosed))
			.unwrap();
		match exchange {
			Exchange::Message(message) => assert_eq!(message.message_id(), 3),
			_ => panic!("expected a message"),
		}
	}

	#[test]
	fn command_and_data_round_trip() {
		let codec = codec();
		let encoded = codec.encode(store_request().into()).unwrap();
		let data = encoded.data.clone().expect("store request carries data");

		let mut pdus = vec![encoded.command_pdu(), encoded.data_pdu(data)].into_iter();
		let exchange = codec
			.decode(|| pdus.next().ok_or(DimseError::PeerClosed))
			.unwrap();
		match exchange {
			Exchange::Message(message) => {
				let data = message.data.expect("data set survives the round trip");
				assert_eq!(
					data.get(tags::SOP_INSTANCE_UID)
						.and_then(|e| e.to_str().ok())
						.as_deref(),
					Some("1.2.3.4.5")
				);
			}
			_ => panic!("expected a message"),
		}
	}

	#[test]
	fn release_request_is_not_an_error() {
		let codec = codec();
		let mut pdus = vec![Pdu::ReleaseRQ].into_iter();
		let exchange = codec
			.decode(|| pdus.next().ok_or(DimseError::PeerClosed))
			.unwrap();
		assert!(matches!(exchange, Exchange::Released));
	}

	#[test]
	fn data_before_command_is_a_fragment_order_error() {
		let codec = codec();
		let rogue = Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Data,
				presentation_context_id: 1,
				is_last: true,
				data: vec![0u8; 4],
			}],
		};
		let mut pdus = vec![rogue].into_iter();
		let err = codec
			.decode(|| pdus.next().ok_or(DimseError::PeerClosed))
			.unwrap_err();
		assert!(matches!(err, DimseError::FragmentOrder));
	}

	#[test]
	fn unknown_context_id_is_rejected_on_encode() {
		let codec = codec();
		let mut message: DicomMessage = CompositeEchoRequest { message_id: 1 }.into();
		message.presentation_context_id = Some(42);

		let err = codec.encode(message).unwrap_err();
		assert!(matches!(err, DimseError::NoPresentationContext(Some(42))));
	}
}
