use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone)]
pub enum Priority {
	Low = 0x0002,
	Medium = 0x0000,
	High = 0x0001,
}

impl Default for Priority {
	fn default() -> Self {
		Self::Medium
	}
}

/// The protocol a piece of data entered (or leaves) the gateway through.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataService {
	#[serde(rename = "DIMSE")]
	Dimse,
	DicomWeb,
	Fhir,
	Hl7,
	#[serde(rename = "ACR")]
	Acr,
}

impl Display for DataService {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Dimse => write!(f, "DIMSE"),
			Self::DicomWeb => write!(f, "DicomWeb"),
			Self::Fhir => write!(f, "Fhir"),
			Self::Hl7 => write!(f, "Hl7"),
			Self::Acr => write!(f, "ACR"),
		}
	}
}

/// Identifies where a piece of data came from and where it was addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataOrigin {
	pub data_service: DataService,
	/// Source identity, e.g. the calling AE title of the pushing modality.
	pub source: String,
	/// Destination identity, e.g. the called AE title or virtual AE name.
	pub destination: String,
}
