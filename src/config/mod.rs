use crate::types::AE;
use crate::DEFAULT_AET;

use serde::de::Error;
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
	#[serde(default)]
	pub telemetry: TelemetryConfig,
	#[serde(default)]
	pub server: ServerConfig,
	#[serde(default)]
	pub storage: StorageConfig,
	#[serde(default)]
	pub jobs: JobsConfig,
	#[serde(default)]
	pub modalities: Vec<RemoteModalityConfig>,
	#[serde(default)]
	pub peers: Vec<PeerConfig>,
}

impl AppConfig {
	/// Loads the application configuration from the following sources:
	/// 1. Defaults (defined in `defaults.yaml`)
	/// 2. `config.yaml` in the working directory
	/// 3. Environment variables, prefixed with `DICOM_ARC`
	///
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
			.add_source(Environment::with_prefix("DICOM_ARC").separator("_"))
			.build()?
			.try_deserialize()
	}

	pub fn modality(&self, aet: &str) -> Option<&RemoteModalityConfig> {
		self.modalities.iter().find(|m| m.aet == aet)
	}

	pub fn peer(&self, name: &str) -> Option<&PeerConfig> {
		self.peers.iter().find(|p| p.name == name)
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
	pub aet: AE,
	pub http: HttpServerConfig,
	pub dimse: DimseServerConfig,
	/// When true, incoming C-MOVE requests are served inline on the
	/// association; otherwise a store job is submitted and the C-MOVE
	/// completes immediately.
	pub synchronous_c_move: bool,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			aet: AE::from(DEFAULT_AET),
			http: HttpServerConfig::default(),
			dimse: DimseServerConfig::default(),
			synchronous_c_move: true,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpServerConfig {
	pub interface: IpAddr,
	pub port: u16,
	pub request_timeout: u64,
}

impl Default for HttpServerConfig {
	fn default() -> Self {
		Self {
			interface: IpAddr::from([0, 0, 0, 0]),
			port: 8042,
			request_timeout: 60_000,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DimseServerConfig {
	pub interface: IpAddr,
	#[serde(default = "DimseServerConfig::default_port")]
	pub port: u16,
	/// Accept only codec-free transfer syntaxes when true.
	#[serde(default = "DimseServerConfig::default_uncompressed")]
	pub uncompressed: bool,
	/// DIMSE timeout in milliseconds; 0 means blocking calls.
	#[serde(default = "DimseServerConfig::default_timeout")]
	pub timeout: u64,
}

impl DimseServerConfig {
	pub const fn default_port() -> u16 {
		4242
	}
	pub const fn default_uncompressed() -> bool {
		true
	}
	pub const fn default_timeout() -> u64 {
		30_000
	}
}

impl Default for DimseServerConfig {
	fn default() -> Self {
		Self {
			interface: IpAddr::from([0, 0, 0, 0]),
			port: Self::default_port(),
			uncompressed: Self::default_uncompressed(),
			timeout: Self::default_timeout(),
		}
	}
}

/// Query-rewrite policy for remote modalities that mishandle wildcard
/// matching.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModalityManufacturer {
	Generic,
	GenericNoWildcardInDates,
	GenericNoUniversalWildcard,
	#[serde(rename = "ge")]
	Ge,
}

impl Default for ModalityManufacturer {
	fn default() -> Self {
		Self::Generic
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteModalityConfig {
	pub aet: AE,
	pub host: String,
	pub port: u16,
	#[serde(default)]
	pub manufacturer: ModalityManufacturer,
	#[serde(default)]
	pub pool: PoolConfig,
	/// DIMSE timeout in milliseconds; 0 means blocking calls.
	#[serde(default = "RemoteModalityConfig::default_timeout")]
	pub timeout: u64,
}

impl RemoteModalityConfig {
	pub const fn default_timeout() -> u64 {
		30_000
	}

	pub const fn has_timeout(&self) -> bool {
		self.timeout != 0
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerConfig {
	pub name: String,
	pub url: String,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PoolConfig {
	pub size: usize,
	pub timeout: u64,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			size: 16,
			timeout: 10_000,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
	pub path: PathBuf,
	/// Maximum total compressed size in bytes; 0 disables the quota.
	pub max_size: u64,
	/// Maximum number of patients; 0 disables the quota.
	pub max_patient_count: u64,
	/// Compress attachment blobs with zlib before writing them.
	pub compression: bool,
	pub overwrite_instances: bool,
	/// SOP class UIDs rejected at admission with `FilteredOut`.
	#[serde(default)]
	pub reject_sop_classes: Vec<String>,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			path: PathBuf::from("dicom-arc-storage"),
			max_size: 0,
			max_patient_count: 0,
			compression: false,
			overwrite_instances: true,
			reject_sop_classes: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobsConfig {
	pub workers: usize,
	/// Interval between registry snapshots written to the index, in
	/// milliseconds.
	pub persist_interval: u64,
}

impl Default for JobsConfig {
	fn default() -> Self {
		Self {
			workers: 2,
			persist_interval: 10_000,
		}
	}
}

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

/// Deserializer for [`tracing::Level`] as it does not implement [Deserialize]
fn deserialize_log_level<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
where
	D: Deserializer<'de>,
{
	let value = String::deserialize(deserializer)?;

	tracing::Level::from_str(&value)
		.map_err(|_| Error::unknown_variant(&value, &["TRACE", "DEBUG", "INFO", "WARN", "ERROR"]))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_deserialize() {
		let config = AppConfig::new().expect("defaults.yaml should deserialize");
		assert_eq!(config.server.aet, DEFAULT_AET);
		assert!(config.server.synchronous_c_move);
		assert_eq!(config.jobs.workers, 2);
	}

	#[test]
	fn manufacturer_kebab_case() {
		let m: ModalityManufacturer =
			serde_json::from_str("\"generic-no-universal-wildcard\"").unwrap();
		assert_eq!(m, ModalityManufacturer::GenericNoUniversalWildcard);
	}
}
