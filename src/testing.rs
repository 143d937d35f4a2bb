//! Builders shared by the unit tests.

use crate::plugins::DicomFile;
use bytes::Bytes;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;

/// Minimal secondary-capture instance with the given UID hierarchy.
pub fn dicom_file(study_uid: &str, series_uid: &str, sop_uid: &str) -> DicomFile {
	let mut object = InMemDicomObject::new_empty();
	object.put(DataElement::new(
		tags::SOP_CLASS_UID,
		VR::UI,
		dicom_value!(Str, uids::SECONDARY_CAPTURE_IMAGE_STORAGE),
	));
	object.put(DataElement::new(
		tags::SOP_INSTANCE_UID,
		VR::UI,
		dicom_value!(Str, sop_uid),
	));
	object.put(DataElement::new(
		tags::SERIES_INSTANCE_UID,
		VR::UI,
		dicom_value!(Str, series_uid),
	));
	object.put(DataElement::new(
		tags::STUDY_INSTANCE_UID,
		VR::UI,
		dicom_value!(Str, study_uid),
	));
	object.put(DataElement::new(
		tags::PATIENT_ID,
		VR::LO,
		dicom_value!(Str, "TEST-PATIENT"),
	));

	object.with_exact_meta(
		FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
			.media_storage_sop_instance_uid(sop_uid)
			.transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
			.build()
			.expect("meta table should build"),
	)
}

/// The same instance serialized the way the gateway persists DICOM data.
pub fn dicom_bytes(study_uid: &str, series_uid: &str, sop_uid: &str) -> Bytes {
	let file = dicom_file(study_uid, series_uid, sop_uid);
	let mut bytes = Vec::new();
	file.write_all(&mut bytes).expect("serialization succeeds");
	Bytes::from(bytes)
}
