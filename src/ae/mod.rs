use chrono::{DateTime, Utc};
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// An AE title is 1..16 ASCII characters from `[A-Za-z0-9._-]`, trimmed.
pub fn is_valid_ae_title(value: &str) -> bool {
	let trimmed = value.trim();
	(1..=16).contains(&trimmed.len())
		&& trimmed
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// The DICOM tag instances are grouped by.
///
/// Only the study and series level make sense as payload boundaries, so the
/// accepted set is a whitelist rather than any parseable tag.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub enum GroupingTag {
	#[default]
	#[serde(rename = "0020,000D")]
	StudyInstanceUid,
	#[serde(rename = "0020,000E")]
	SeriesInstanceUid,
}

impl GroupingTag {
	pub const fn tag(self) -> Tag {
		match self {
			Self::StudyInstanceUid => tags::STUDY_INSTANCE_UID,
			Self::SeriesInstanceUid => tags::SERIES_INSTANCE_UID,
		}
	}

	pub fn parse(value: &str) -> Option<Self> {
		match value.trim().to_ascii_uppercase().as_str() {
			"0020,000D" => Some(Self::StudyInstanceUid),
			"0020,000E" => Some(Self::SeriesInstanceUid),
			_ => None,
		}
	}
}

impl Display for GroupingTag {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::StudyInstanceUid => write!(f, "0020,000D"),
			Self::SeriesInstanceUid => write!(f, "0020,000E"),
		}
	}
}

impl<'de> Deserialize<'de> for GroupingTag {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Self::parse(&value)
			.ok_or_else(|| DeError::unknown_variant(&value, &["0020,000D", "0020,000E"]))
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EditMode {
	Create,
	Update,
}

/// Audit fields shared by every application-entity flavor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStamp {
	pub created_by: Option<String>,
	pub updated_by: Option<String>,
	pub date_time_created: Option<DateTime<Utc>>,
	pub date_time_updated: Option<DateTime<Utc>>,
}

impl AuditStamp {
	/// `created_by` is only written on create; `updated_by` and the update
	/// timestamp only on update. An update therefore never backfills the
	/// creator. This mirrors the behavior of the original admin plane.
	pub fn apply(&mut self, mode: EditMode, user: &str) {
		match mode {
			EditMode::Create => {
				self.created_by = Some(user.to_owned());
				self.date_time_created = Some(Utc::now());
			}
			EditMode::Update => {
				self.updated_by = Some(user.to_owned());
				self.date_time_updated = Some(Utc::now());
			}
		}
	}
}

/// A locally hosted SCP target. Instances stored towards its AE title are
/// grouped and forwarded to the configured workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonaiApplicationEntity {
	pub name: String,
	pub ae_title: String,
	/// Listener port override; the shared SCP port is used when unset.
	pub port: Option<u16>,
	pub grouping: GroupingTag,
	/// Grouping window in seconds.
	pub timeout: u64,
	pub workflows: Vec<String>,
	pub allowed_sop_classes: Vec<String>,
	pub ignored_sop_classes: Vec<String>,
	pub plug_in_assemblies: Vec<String>,
	#[serde(flatten)]
	pub audit: AuditStamp,
}

/// What the SOP-class filter decided for one incoming instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SopFilterDecision {
	Accept,
	/// The instance's SOP class is on the ignored list.
	Ignored,
	/// An allowed list exists and the instance's SOP class is not on it.
	NotAllowed,
}

impl MonaiApplicationEntity {
	/// An empty name is replaced by the AE title. Name collisions that this
	/// produces surface as uniqueness errors at insert time.
	pub fn set_default_values(&mut self) {
		if self.name.trim().is_empty() {
			self.name = self.ae_title.clone();
		}
	}

	pub fn validate(&self) -> Result<(), AeValidationError> {
		if !is_valid_ae_title(&self.ae_title) {
			return Err(AeValidationError::InvalidAeTitle(self.ae_title.clone()));
		}
		if !self.allowed_sop_classes.is_empty() && !self.ignored_sop_classes.is_empty() {
			return Err(AeValidationError::ConflictingSopFilters(self.name.clone()));
		}
		Ok(())
	}

	pub fn filter_decision(&self, sop_class_uid: &str) -> SopFilterDecision {
		if !self.allowed_sop_classes.is_empty() {
			if self
				.allowed_sop_classes
				.iter()
				.any(|uid| uid == sop_class_uid)
			{
				SopFilterDecision::Accept
			} else {
				SopFilterDecision::NotAllowed
			}
		} else if self
			.ignored_sop_classes
			.iter()
			.any(|uid| uid == sop_class_uid)
		{
			SopFilterDecision::Ignored
		} else {
			SopFilterDecision::Accept
		}
	}
}

/// A remote peer allowed to push to the gateway, matched by AE title and
/// host address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceApplicationEntity {
	pub name: String,
	pub ae_title: String,
	pub host_ip: String,
	#[serde(flatten)]
	pub audit: AuditStamp,
}

impl SourceApplicationEntity {
	pub fn validate(&self) -> Result<(), AeValidationError> {
		if !is_valid_ae_title(&self.ae_title) {
			return Err(AeValidationError::InvalidAeTitle(self.ae_title.clone()));
		}
		if self.host_ip.trim().is_empty() {
			return Err(AeValidationError::MissingHost(self.name.clone()));
		}
		Ok(())
	}

	pub fn matches(&self, calling_aet: &str, host: &str) -> bool {
		self.ae_title == calling_aet && self.host_ip == host
	}
}

/// A remote DIMSE destination the export pipeline can ship to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationApplicationEntity {
	pub name: String,
	pub ae_title: String,
	pub host_ip: String,
	pub port: u16,
	#[serde(flatten)]
	pub audit: AuditStamp,
}

impl DestinationApplicationEntity {
	pub fn validate(&self) -> Result<(), AeValidationError> {
		if !is_valid_ae_title(&self.ae_title) {
			return Err(AeValidationError::InvalidAeTitle(self.ae_title.clone()));
		}
		if self.host_ip.trim().is_empty() {
			return Err(AeValidationError::MissingHost(self.name.clone()));
		}
		Ok(())
	}
}

/// A DICOMweb endpoint without a network identity of its own; requests are
/// routed to it by the workflow path segment of the STOW-RS URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualApplicationEntity {
	pub name: String,
	pub workflows: Vec<String>,
	pub plug_in_assemblies: Vec<String>,
	#[serde(flatten)]
	pub audit: AuditStamp,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AeValidationError {
	#[error("'{0}' is not a valid AE title")]
	InvalidAeTitle(String),
	#[error("entity {0}: allowed and ignored SOP class lists are mutually exclusive")]
	ConflictingSopFilters(String),
	#[error("entity {0}: host address is required")]
	MissingHost(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	fn monai_ae() -> MonaiApplicationEntity {
		MonaiApplicationEntity {
			name: String::from("brain-mri"),
			ae_title: String::from("BRAIN_MRI"),
			port: None,
			grouping: GroupingTag::default(),
			timeout: 5,
			workflows: Vec::new(),
			allowed_sop_classes: Vec::new(),
			ignored_sop_classes: Vec::new(),
			plug_in_assemblies: Vec::new(),
			audit: AuditStamp::default(),
		}
	}

	#[test]
	fn ae_title_rules() {
		assert!(is_valid_ae_title("PACS"));
		assert!(is_valid_ae_title("  PACS  ")); // trimmed before length check
		assert!(is_valid_ae_title("A1.b_c-2"));
		assert!(!is_valid_ae_title(""));
		assert!(!is_valid_ae_title("     "));
		assert!(!is_valid_ae_title("SEVENTEEN_CHARS__"));
		assert!(!is_valid_ae_title("SPACES IN TITLE"));
		assert!(!is_valid_ae_title("UNICODE_ÆT"));
	}

	#[test]
	fn grouping_tag_whitelist() {
		assert_eq!(GroupingTag::parse("0020,000D"), Some(GroupingTag::StudyInstanceUid));
		assert_eq!(GroupingTag::parse("0020,000e"), Some(GroupingTag::SeriesInstanceUid));
		assert_eq!(GroupingTag::parse("0010,0010"), None);
		assert_eq!(GroupingTag::parse("garbage"), None);
	}

	#[test]
	fn sop_filters_are_mutually_exclusive() {
		let mut ae = monai_ae();
		ae.allowed_sop_classes = vec![String::from("1.2.840.10008.5.1.4.1.1.2")];
		ae.ignored_sop_classes = vec![String::from("1.2.840.10008.5.1.4.1.1.7")];

		assert_eq!(
			ae.validate(),
			Err(AeValidationError::ConflictingSopFilters(String::from(
				"brain-mri"
			)))
		);
	}

	#[test]
	fn filter_decisions() {
		let ct = "1.2.840.10008.5.1.4.1.1.2";
		let sc = "1.2.840.10008.5.1.4.1.1.7";

		let mut ae = monai_ae();
		assert_eq!(ae.filter_decision(ct), SopFilterDecision::Accept);

		ae.allowed_sop_classes = vec![ct.to_owned()];
		assert_eq!(ae.filter_decision(ct), SopFilterDecision::Accept);
		assert_eq!(ae.filter_decision(sc), SopFilterDecision::NotAllowed);

		ae.allowed_sop_classes.clear();
		ae.ignored_sop_classes = vec![sc.to_owned()];
		assert_eq!(ae.filter_decision(sc), SopFilterDecision::Ignored);
		assert_eq!(ae.filter_decision(ct), SopFilterDecision::Accept);
	}

	#[test]
	fn empty_name_defaults_to_ae_title() {
		let mut ae = monai_ae();
		ae.name = String::from("  ");
		ae.set_default_values();
		assert_eq!(ae.name, "BRAIN_MRI");
	}

	#[test]
	fn update_does_not_backfill_creator() {
		let mut stamp = AuditStamp::default();
		stamp.apply(EditMode::Update, "alice");
		assert_eq!(stamp.created_by, None);
		assert_eq!(stamp.updated_by.as_deref(), Some("alice"));
		assert!(stamp.date_time_updated.is_some());
		assert!(stamp.date_time_created.is_none());
	}
}
