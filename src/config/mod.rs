use crate::ae::{is_valid_ae_title, GroupingTag};
use serde::de::Error;
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Top-level application configuration.
///
/// Loaded from the following sources, later sources overriding earlier ones:
/// 1. Defaults (defined in `defaults.yaml`)
/// 2. `config.yaml` in the working directory
/// 3. Environment variables, prefixed with `GATEWAY`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
	#[serde(default)]
	pub telemetry: TelemetryConfig,
	#[serde(default)]
	pub http: HttpServerConfig,
	#[serde(default)]
	pub dicom: DicomConfig,
	#[serde(default)]
	pub dicom_web: DicomWebConfig,
	#[serde(default)]
	pub storage: StorageConfig,
	#[serde(default)]
	pub hl7: Hl7Config,
	#[serde(default)]
	pub database: DatabaseConfig,
	#[serde(default)]
	pub messaging: MessagingConfig,
	#[serde(default)]
	pub export: ExportConfig,
}

impl AppConfig {
	/// # Errors
	/// Returns a [`config::ConfigError`] if source collection fails.
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::{Config, Environment, File, FileFormat};
		Config::builder()
			.add_source(File::from_str(
				include_str!("defaults.yaml"),
				FileFormat::Yaml,
			))
			.add_source(File::with_name("config.yaml").required(false))
			.add_source(Environment::with_prefix("GATEWAY").separator("_"))
			.build()?
			.try_deserialize()
	}

	/// Checks every range constraint the runtime relies on.
	///
	/// All violations are collected so an operator sees the full list at
	/// once instead of fixing them one restart at a time.
	pub fn validate(&self) -> Result<(), ValidationErrors> {
		let mut errors = Vec::new();

		if !(1..=1000).contains(&self.dicom.scp.max_associations) {
			errors.push(format!(
				"dicom.scp.max-associations must be within 1..1000, got {}",
				self.dicom.scp.max_associations
			));
		}
		if !is_valid_ae_title(&self.dicom.scu.aet) {
			errors.push(format!(
				"dicom.scu.aet is not a valid AE title: {:?}",
				self.dicom.scu.aet
			));
		}
		if self.dicom_web.client_timeout_seconds == 0 {
			errors.push(String::from("dicom-web.client-timeout-seconds must be > 0"));
		}
		if !(1..=100).contains(&self.storage.watermark_percent) {
			errors.push(format!(
				"storage.watermark-percent must be within 1..100, got {}",
				self.storage.watermark_percent
			));
		}
		if !(1..=999).contains(&self.storage.reserve_space_gb) {
			errors.push(format!(
				"storage.reserve-space-gb must be within 1..999, got {}",
				self.storage.reserve_space_gb
			));
		}
		if !(1..=128).contains(&self.storage.concurrent_uploads) {
			errors.push(format!(
				"storage.concurrent-uploads must be within 1..128, got {}",
				self.storage.concurrent_uploads
			));
		}
		if !(1..=128).contains(&self.storage.payload_process_threads) {
			errors.push(format!(
				"storage.payload-process-threads must be within 1..128, got {}",
				self.storage.payload_process_threads
			));
		}
		for bucket in [&self.storage.bucket_name, &self.storage.temporary_bucket_name] {
			if !is_valid_bucket_name(bucket) {
				errors.push(format!("invalid S3 bucket name: {bucket:?}"));
			}
		}
		if !(1..=128).contains(&self.export.concurrency) {
			errors.push(format!(
				"export.concurrency must be within 1..128, got {}",
				self.export.concurrency
			));
		}

		if errors.is_empty() {
			Ok(())
		} else {
			Err(ValidationErrors(errors))
		}
	}
}

#[derive(Debug, Error)]
#[error("invalid configuration: {}", .0.join("; "))]
pub struct ValidationErrors(pub Vec<String>);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
	#[serde(deserialize_with = "deserialize_log_level")]
	pub level: tracing::Level,
}

impl Default for TelemetryConfig {
	fn default() -> Self {
		Self {
			level: tracing::Level::INFO,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpServerConfig {
	pub interface: IpAddr,
	pub port: u16,
	pub max_upload_size: usize,
}

impl Default for HttpServerConfig {
	fn default() -> Self {
		Self {
			interface: IpAddr::from([0, 0, 0, 0]),
			port: 5000,
			max_upload_size: 50_000_000, // 50 MB
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DicomConfig {
	#[serde(default)]
	pub scp: ScpConfig,
	#[serde(default)]
	pub scu: ScuConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScpConfig {
	pub interface: IpAddr,
	/// Default listener port; a Monai AE without an explicit port uses it.
	pub port: u16,
	pub max_associations: usize,
	/// When set, associations from peers without a matching source AE are rejected.
	pub reject_unknown_sources: bool,
	/// When unset, C-ECHO requests are rejected.
	pub verification_enabled: bool,
	/// Only codec-free transfer syntaxes are proposed when set.
	pub uncompressed: bool,
}

impl Default for ScpConfig {
	fn default() -> Self {
		Self {
			interface: IpAddr::from([0, 0, 0, 0]),
			port: 104,
			max_associations: 25,
			reject_unknown_sources: true,
			verification_enabled: true,
			uncompressed: true,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScuConfig {
	pub aet: String,
	/// Maximum simultaneous outbound associations per destination.
	pub max_associations: usize,
	pub timeout: u64,
}

impl Default for ScuConfig {
	fn default() -> Self {
		Self {
			aet: String::from("GATEWAY"),
			max_associations: 8,
			timeout: 30_000,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DicomWebConfig {
	pub client_timeout_seconds: u64,
}

impl DicomWebConfig {
	pub fn client_timeout(&self) -> Duration {
		Duration::from_secs(self.client_timeout_seconds)
	}
}

impl Default for DicomWebConfig {
	fn default() -> Self {
		Self {
			client_timeout_seconds: 60,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TemporaryDataStorage {
	Memory,
	Disk,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
	pub watermark_percent: u8,
	pub reserve_space_gb: u32,
	pub concurrent_uploads: usize,
	pub payload_process_threads: usize,
	pub temporary_data_storage: TemporaryDataStorage,
	pub local_temporary_storage_path: String,
	pub bucket_name: String,
	pub temporary_bucket_name: String,
	#[serde(default)]
	pub retries: RetriesConfig,
	#[serde(default)]
	pub s3: Option<S3Config>,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			watermark_percent: 75,
			reserve_space_gb: 5,
			concurrent_uploads: 2,
			payload_process_threads: 1,
			temporary_data_storage: TemporaryDataStorage::Disk,
			local_temporary_storage_path: String::from("/tmp/gateway"),
			bucket_name: String::from("gateway"),
			temporary_bucket_name: String::from("gateway"),
			retries: RetriesConfig::default(),
			s3: None,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct S3Config {
	pub endpoint: String,
	#[serde(default)]
	pub region: Option<String>,
	#[serde(default)]
	pub credentials: Option<S3CredentialsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum S3CredentialsConfig {
	#[serde(rename_all = "kebab-case")]
	Env {
		access_key_env: String,
		secret_key_env: String,
	},
	#[serde(rename_all = "kebab-case")]
	Plain {
		access_key: String,
		secret_key: String,
	},
}

impl S3CredentialsConfig {
	pub fn resolve(&self) -> Result<aws_credential_types::Credentials, std::env::VarError> {
		match &self {
			Self::Plain {
				access_key,
				secret_key,
			} => Ok(aws_credential_types::Credentials::new(
				access_key,
				secret_key,
				None,
				None,
				"AppConfigProvider",
			)),
			Self::Env {
				access_key_env,
				secret_key_env,
			} => {
				let access_key = std::env::var(access_key_env)?;
				let secret_key = std::env::var(secret_key_env)?;
				Ok(aws_credential_types::Credentials::new(
					access_key,
					secret_key,
					None,
					None,
					"EnvVarProvider",
				))
			}
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetriesConfig {
	pub delays_milliseconds: Vec<u64>,
}

impl Default for RetriesConfig {
	fn default() -> Self {
		Self {
			delays_milliseconds: vec![250, 500, 1000],
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Hl7Config {
	pub interface: IpAddr,
	pub port: u16,
	pub client_timeout: u64,
}

impl Default for Hl7Config {
	fn default() -> Self {
		Self {
			interface: IpAddr::from([0, 0, 0, 0]),
			port: 2575,
			client_timeout: 60_000,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseConfig {
	#[serde(default)]
	pub retries: RetriesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MessagingConfig {
	pub endpoint: String,
	pub exchange: String,
	pub workflow_request_topic: String,
	pub export_complete_topic: String,
	pub export_request_prefix: String,
	#[serde(default)]
	pub retries: RetriesConfig,
}

impl MessagingConfig {
	/// Routing key the export service for `agent` subscribes to.
	pub fn export_request_topic(&self, agent: &str) -> String {
		format!("{}.{agent}", self.export_request_prefix)
	}
}

impl Default for MessagingConfig {
	fn default() -> Self {
		Self {
			endpoint: String::from("amqp://localhost:5672"),
			exchange: String::from("gateway"),
			workflow_request_topic: String::from("md.workflow.request"),
			export_complete_topic: String::from("md.export.complete"),
			export_request_prefix: String::from("md.export.request"),
			retries: RetriesConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExportConfig {
	pub concurrency: usize,
	#[serde(default)]
	pub retries: RetriesConfig,
}

impl Default for ExportConfig {
	fn default() -> Self {
		Self {
			concurrency: 2,
			retries: RetriesConfig::default(),
		}
	}
}

/// Application entity set handed to the repositories at startup.
///
/// The admin plane owns these entities at runtime; the configuration only
/// seeds an initial set so the gateway is usable without the admin API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SeedEntities {
	#[serde(default)]
	pub monai_aets: Vec<MonaiAeConfig>,
	#[serde(default)]
	pub source_aets: Vec<SourceAeConfig>,
	#[serde(default)]
	pub destination_aets: Vec<DestinationAeConfig>,
	#[serde(default)]
	pub virtual_aets: Vec<VirtualAeConfig>,
}

impl SeedEntities {
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::{Config, File};
		Config::builder()
			.add_source(File::with_name("entities.yaml").required(false))
			.build()?
			.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MonaiAeConfig {
	pub name: String,
	pub aet: String,
	#[serde(default)]
	pub port: Option<u16>,
	#[serde(default = "GroupingTag::default")]
	pub grouping: GroupingTag,
	#[serde(default = "default_grouping_timeout")]
	pub timeout: u64,
	#[serde(default)]
	pub workflows: Vec<String>,
	#[serde(default)]
	pub allowed_sop_classes: Vec<String>,
	#[serde(default)]
	pub ignored_sop_classes: Vec<String>,
	#[serde(default)]
	pub plug_in_assemblies: Vec<String>,
}

pub const fn default_grouping_timeout() -> u64 {
	5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceAeConfig {
	pub name: String,
	pub aet: String,
	pub host_ip: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DestinationAeConfig {
	pub name: String,
	pub aet: String,
	pub host_ip: String,
	pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VirtualAeConfig {
	pub name: String,
	#[serde(default)]
	pub workflows: Vec<String>,
	#[serde(default)]
	pub plug_in_assemblies: Vec<String>,
}

/// Deserializer for [`tracing::Level`] as it does not implement [Deserialize]
fn deserialize_log_level<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
where
	D: Deserializer<'de>,
{
	let value = String::deserialize(deserializer)?;

	tracing::Level::from_str(&value)
		.map_err(|_| Error::unknown_variant(&value, &["TRACE", "DEBUG", "INFO", "WARN", "ERROR"]))
}

/// S3 bucket naming rules: 3..63 chars, lowercase alphanumeric plus `-` and
/// `.`, starting and ending alphanumeric.
pub fn is_valid_bucket_name(name: &str) -> bool {
	let len_ok = (3..=63).contains(&name.len());
	let chars_ok = name
		.chars()
		.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
	let edges_ok = name
		.chars()
		.next()
		.zip(name.chars().last())
		.is_some_and(|(first, last)| {
			first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric()
		});
	len_ok && chars_ok && edges_ok
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_valid() {
		let config = AppConfig::default();
		config.validate().expect("default configuration is valid");
	}

	#[test]
	fn bucket_name_rules() {
		assert!(is_valid_bucket_name("gateway"));
		assert!(is_valid_bucket_name("my-bucket.01"));
		assert!(!is_valid_bucket_name("ab"));
		assert!(!is_valid_bucket_name("Uppercase"));
		assert!(!is_valid_bucket_name("-leading"));
		assert!(!is_valid_bucket_name("trailing-"));
	}

	#[test]
	fn rejects_out_of_range_values() {
		let mut config = AppConfig::default();
		config.storage.watermark_percent = 0;
		config.storage.concurrent_uploads = 200;
		config.dicom.scp.max_associations = 1001;

		let errors = config.validate().unwrap_err();
		assert_eq!(errors.0.len(), 3);
	}
}
