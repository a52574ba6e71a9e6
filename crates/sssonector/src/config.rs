//! Runtime configuration consumed by the tunnel core.
//!
//! File discovery and format negotiation belong to the embedding layer; this
//! module only defines the fields the core reads, validates their ranges, and
//! publishes updates over a single watch channel so subscribers always see
//! the latest value.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use tokio::sync::watch;

use crate::serdes::serde_dur;

pub const MTU_MIN: u16 = 1280;
pub const MTU_MAX: u16 = 9000;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
	#[error("missing field: {0}")]
	MissingField(&'static str),
	#[error("{field}: {reason}")]
	OutOfRange { field: &'static str, reason: String },
	#[error("unsupported protocol {0:?} (only \"tcp\")")]
	UnsupportedProtocol(String),
	#[error("invalid address {0:?}: {1}")]
	InvalidAddress(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
	Server,
	Client,
}

/// TUN interface parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
	/// Interface name, e.g. `tun0`.
	pub interface: String,
	pub mtu: u16,
	/// Interface address in CIDR form, e.g. `10.0.0.1/24`.
	pub address: IpNet,
}

fn default_protocol() -> String {
	"tcp".to_string()
}

fn default_max_clients() -> usize {
	16
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
	/// Server side: bind address/port. Older config revisions used the split
	/// fields; newer ones a unified `server` ("host:port"). Both are accepted
	/// and the unified form wins when present.
	#[serde(default)]
	pub listen_address: Option<IpAddr>,
	#[serde(default)]
	pub listen_port: Option<u16>,
	#[serde(default)]
	pub server_address: Option<IpAddr>,
	#[serde(default)]
	pub server_port: Option<u16>,
	#[serde(default)]
	pub server: Option<String>,
	/// Expected name on the server certificate, when it differs from the
	/// dialed host (e.g. dialing by IP).
	#[serde(default)]
	pub server_name: Option<String>,
	#[serde(default = "default_protocol")]
	pub protocol: String,
	#[serde(default = "default_max_clients")]
	pub max_clients: usize,
	/// Rate limits in kbit/s. Zero disables shaping for that direction.
	#[serde(default)]
	pub upload_kbps: i64,
	#[serde(default)]
	pub download_kbps: i64,
	#[serde(default)]
	pub cert_file: Option<PathBuf>,
	#[serde(default)]
	pub key_file: Option<PathBuf>,
	#[serde(default)]
	pub ca_file: Option<PathBuf>,
	#[serde(default)]
	pub keep_alive: bool,
	#[serde(default = "TunnelConfig::default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "TunnelConfig::default_retry_delay", with = "serde_dur")]
	pub retry_delay: Duration,
}

impl TunnelConfig {
	fn default_max_retries() -> u32 {
		5
	}

	fn default_retry_delay() -> Duration {
		Duration::from_secs(1)
	}

	/// Resolved server bind address (server mode).
	pub fn listen(&self) -> Result<SocketAddr, ConfigError> {
		if let Some(unified) = &self.server {
			return unified
				.parse()
				.map_err(|e: std::net::AddrParseError| ConfigError::InvalidAddress(unified.clone(), e.to_string()));
		}
		let addr = self
			.listen_address
			.ok_or(ConfigError::MissingField("tunnel.listen_address"))?;
		let port = self
			.listen_port
			.ok_or(ConfigError::MissingField("tunnel.listen_port"))?;
		Ok(SocketAddr::new(addr, port))
	}

	/// Resolved peer to dial (client mode). Hostnames are preserved so the
	/// dialer can resolve them and TLS can verify the name.
	pub fn peer_target(&self) -> Result<(String, u16), ConfigError> {
		if let Some(unified) = &self.server {
			let (host, port) = unified.rsplit_once(':').ok_or_else(|| {
				ConfigError::InvalidAddress(unified.clone(), "expected host:port".to_string())
			})?;
			let port: u16 = port.parse().map_err(|e: std::num::ParseIntError| {
				ConfigError::InvalidAddress(unified.clone(), e.to_string())
			})?;
			if host.is_empty() {
				return Err(ConfigError::InvalidAddress(
					unified.clone(),
					"empty host".to_string(),
				));
			}
			return Ok((host.trim_matches(['[', ']']).to_string(), port));
		}
		let addr = self
			.server_address
			.ok_or(ConfigError::MissingField("tunnel.server_address"))?;
		let port = self
			.server_port
			.ok_or(ConfigError::MissingField("tunnel.server_port"))?;
		Ok((addr.to_string(), port))
	}

	/// Name presented for server certificate verification: the explicit
	/// override when set, the dialed host otherwise.
	pub fn tls_server_name(&self) -> Result<String, ConfigError> {
		if let Some(name) = &self.server_name {
			return Ok(name.clone());
		}
		self.peer_target().map(|(host, _)| host)
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AdapterConfig {
	pub retry_attempts: u32,
	#[serde(with = "serde_dur")]
	pub retry_delay: Duration,
	#[serde(with = "serde_dur")]
	pub cleanup_timeout: Duration,
}

impl Default for AdapterConfig {
	fn default() -> Self {
		AdapterConfig {
			retry_attempts: 3,
			retry_delay: Duration::from_millis(500),
			cleanup_timeout: Duration::from_secs(5),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
	/// TLS 1.3 only, AEAD suites only. The default.
	#[default]
	Modern,
	/// Allows TLS 1.2 with a restricted suite list.
	Intermediate,
	/// Interop-only; documented as insecure.
	Old,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum KeyAlgorithm {
	#[default]
	#[serde(rename = "ecdsa-p384")]
	EcdsaP384,
	#[serde(rename = "ecdsa-p256")]
	EcdsaP256,
	#[serde(rename = "rsa-2048")]
	Rsa2048,
	#[serde(rename = "rsa-4096")]
	Rsa4096,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TlsPolicyConfig {
	pub min_version: Option<String>,
	pub max_version: Option<String>,
	pub ciphers: Vec<String>,
	pub security_level: SecurityLevel,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CertRotationConfig {
	pub enabled: bool,
	#[serde(with = "serde_dur")]
	pub interval: Duration,
}

impl Default for CertRotationConfig {
	fn default() -> Self {
		CertRotationConfig {
			enabled: false,
			interval: Duration::from_secs(3600),
		}
	}
}

fn default_auth_method() -> String {
	"certificate".to_string()
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SecurityConfig {
	pub tls: TlsPolicyConfig,
	#[serde(rename = "auth_method")]
	pub auth_method: String,
	pub cert_rotation: CertRotationConfig,
	pub key_algorithm: KeyAlgorithm,
	/// When set, OCSP transport failures are treated as validation failures
	/// instead of soft warnings.
	pub ocsp_strict: bool,
	/// Certificate store location; `certs/` is created beneath it.
	pub cert_store_dir: Option<PathBuf>,
	/// File whose contents derive the at-rest encryption key for stored
	/// private keys.
	pub store_key_file: Option<PathBuf>,
}

impl Default for SecurityConfig {
	fn default() -> Self {
		SecurityConfig {
			tls: TlsPolicyConfig::default(),
			auth_method: default_auth_method(),
			cert_rotation: CertRotationConfig::default(),
			key_algorithm: KeyAlgorithm::default(),
			ocsp_strict: false,
			cert_store_dir: None,
			store_key_file: None,
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MemoryConfig {
	pub max_mb: u64,
	#[serde(with = "serde_dur")]
	pub check_interval: Duration,
	#[serde(with = "serde_dur")]
	pub cleanup_interval: Duration,
	pub soft_limit_ratio: f64,
}

impl Default for MemoryConfig {
	fn default() -> Self {
		MemoryConfig {
			max_mb: 256,
			check_interval: Duration::from_secs(10),
			cleanup_interval: Duration::from_secs(60),
			soft_limit_ratio: 0.85,
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	pub mode: Mode,
	pub network: NetworkConfig,
	pub tunnel: TunnelConfig,
	#[serde(default)]
	pub adapter: AdapterConfig,
	#[serde(default)]
	pub security: SecurityConfig,
	#[serde(default)]
	pub memory: MemoryConfig,
}

impl Config {
	pub fn from_yaml(raw: &str) -> Result<Self, anyhow::Error> {
		let cfg: Config = serde_yaml::from_str(raw)?;
		cfg.validate()?;
		Ok(cfg)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if !(MTU_MIN..=MTU_MAX).contains(&self.network.mtu) {
			return Err(ConfigError::OutOfRange {
				field: "network.mtu",
				reason: format!(
					"{} outside [{MTU_MIN}, {MTU_MAX}]",
					self.network.mtu
				),
			});
		}
		if self.network.interface.is_empty() {
			return Err(ConfigError::MissingField("network.interface"));
		}
		if self.tunnel.protocol != "tcp" {
			return Err(ConfigError::UnsupportedProtocol(self.tunnel.protocol.clone()));
		}
		if self.tunnel.upload_kbps < 0 {
			return Err(ConfigError::OutOfRange {
				field: "tunnel.upload_kbps",
				reason: "negative rate".to_string(),
			});
		}
		if self.tunnel.download_kbps < 0 {
			return Err(ConfigError::OutOfRange {
				field: "tunnel.download_kbps",
				reason: "negative rate".to_string(),
			});
		}
		if self.tunnel.max_clients == 0 {
			return Err(ConfigError::OutOfRange {
				field: "tunnel.max_clients",
				reason: "must be at least 1".to_string(),
			});
		}
		match self.mode {
			Mode::Server => {
				self.tunnel.listen()?;
			},
			Mode::Client => {
				self.tunnel.peer_target()?;
			},
		}
		if self.security.auth_method != "certificate" {
			return Err(ConfigError::OutOfRange {
				field: "security.auth_method",
				reason: format!("unsupported method {:?}", self.security.auth_method),
			});
		}
		if !(self.memory.soft_limit_ratio > 0.0 && self.memory.soft_limit_ratio <= 1.0) {
			return Err(ConfigError::OutOfRange {
				field: "memory.soft_limit_ratio",
				reason: "must be in (0, 1]".to_string(),
			});
		}
		if self.memory.max_mb == 0 {
			return Err(ConfigError::OutOfRange {
				field: "memory.max_mb",
				reason: "must be at least 1".to_string(),
			});
		}
		Ok(())
	}
}

/// Publishes configuration updates. Subscribers get the current value at
/// subscribe time and every change after; slow subscribers may skip
/// intermediate values but never block the publisher.
#[derive(Clone)]
pub struct ConfigPublisher {
	tx: Arc<watch::Sender<Arc<Config>>>,
}

impl ConfigPublisher {
	pub fn new(initial: Config) -> Self {
		let (tx, _) = watch::channel(Arc::new(initial));
		ConfigPublisher { tx: Arc::new(tx) }
	}

	pub fn current(&self) -> Arc<Config> {
		self.tx.borrow().clone()
	}

	pub fn publish(&self, cfg: Config) -> Result<(), ConfigError> {
		cfg.validate()?;
		let _ = self.tx.send(Arc::new(cfg));
		Ok(())
	}

	pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
		self.tx.subscribe()
	}
}
