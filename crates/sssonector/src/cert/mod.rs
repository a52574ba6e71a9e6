//! Certificate lifecycle: data model, encrypted store, issuance, validation,
//! rotation and CRL publication.

pub mod crl;
pub mod manager;
pub mod rotation;
pub mod store;
pub mod validator;

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::serdes::{serde_rfc3339, serde_rfc3339_option};

#[derive(Debug, Clone, thiserror::Error)]
pub enum CertError {
	#[error("certificate parse: {0}")]
	Parse(String),
	#[error("certificate not found: {0}")]
	NotFound(String),
	#[error("issuer not found: {0}")]
	IssuerNotFound(String),
	#[error("issuance: {0}")]
	Issuance(String),
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("store: {0}")]
	Store(String),
	#[error("key material: {0}")]
	Key(String),
	#[error("already revoked: {0}")]
	AlreadyRevoked(String),
	#[error("chain verification failed: {0}")]
	ChainVerification(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertKind {
	Ca,
	Intermediate,
	Server,
	Client,
}

impl CertKind {
	pub fn is_authority(&self) -> bool {
		matches!(self, CertKind::Ca | CertKind::Intermediate)
	}
}

impl fmt::Display for CertKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			CertKind::Ca => "ca",
			CertKind::Intermediate => "intermediate",
			CertKind::Server => "server",
			CertKind::Client => "client",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertStatus {
	Valid,
	Expired,
	Revoked,
	NotYetValid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
	Unspecified,
	KeyCompromise,
	CaCompromise,
	AffiliationChanged,
	Superseded,
	CessationOfOperation,
}

impl FromStr for RevocationReason {
	type Err = CertError;
	fn from_str(s: &str) -> Result<Self, CertError> {
		match s {
			"unspecified" => Ok(RevocationReason::Unspecified),
			"key_compromise" => Ok(RevocationReason::KeyCompromise),
			"ca_compromise" => Ok(RevocationReason::CaCompromise),
			"affiliation_changed" => Ok(RevocationReason::AffiliationChanged),
			"superseded" => Ok(RevocationReason::Superseded),
			"cessation_of_operation" => Ok(RevocationReason::CessationOfOperation),
			other => Err(CertError::InvalidRequest(format!(
				"unknown revocation reason {other:?}"
			))),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
	DigitalSignature,
	KeyEncipherment,
	KeyAgreement,
	CertSign,
	CrlSign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtKeyUsage {
	ServerAuth,
	ClientAuth,
}

/// Subject alternative name; serialized as `dns:host` / `ip:addr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum San {
	Dns(String),
	Ip(IpAddr),
}

impl fmt::Display for San {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			San::Dns(d) => write!(f, "dns:{d}"),
			San::Ip(ip) => write!(f, "ip:{ip}"),
		}
	}
}

impl FromStr for San {
	type Err = CertError;
	fn from_str(s: &str) -> Result<Self, CertError> {
		if let Some(d) = s.strip_prefix("dns:") {
			return Ok(San::Dns(d.to_string()));
		}
		if let Some(ip) = s.strip_prefix("ip:") {
			return ip
				.parse()
				.map(San::Ip)
				.map_err(|e| CertError::Parse(format!("bad ip SAN {ip:?}: {e}")));
		}
		// Bare values: IP if it parses, DNS otherwise.
		match s.parse::<IpAddr>() {
			Ok(ip) => Ok(San::Ip(ip)),
			Err(_) => Ok(San::Dns(s.to_string())),
		}
	}
}

impl serde::Serialize for San {
	fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&self.to_string())
	}
}

impl<'de> serde::Deserialize<'de> for San {
	fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let raw = <String as serde::Deserialize>::deserialize(d)?;
		raw.parse().map_err(serde::de::Error::custom)
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Subject {
	pub common_name: String,
	pub organization: Option<String>,
	pub organizational_unit: Option<String>,
	pub country: Option<String>,
	pub state: Option<String>,
	pub locality: Option<String>,
}

impl Subject {
	pub fn with_common_name(cn: impl Into<String>) -> Subject {
		Subject {
			common_name: cn.into(),
			..Default::default()
		}
	}
}

/// Issuance request handed to the certificate manager.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CertificateRequest {
	pub kind: CertKind,
	pub subject: Subject,
	#[serde(default)]
	pub sans: Vec<San>,
	#[serde(default)]
	pub key_usages: Vec<KeyUsage>,
	#[serde(default)]
	pub ext_key_usages: Vec<ExtKeyUsage>,
	#[serde(with = "serde_rfc3339")]
	pub not_before: OffsetDateTime,
	#[serde(with = "serde_rfc3339")]
	pub not_after: OffsetDateTime,
	#[serde(default)]
	pub metadata: BTreeMap<String, String>,
}

impl CertificateRequest {
	pub fn validate(&self, max_validity: std::time::Duration) -> Result<(), CertError> {
		if self.subject.common_name.is_empty() {
			return Err(CertError::InvalidRequest("empty common name".into()));
		}
		if self.not_before >= self.not_after {
			return Err(CertError::InvalidRequest(
				"not_before must precede not_after".into(),
			));
		}
		let window = self.not_after - self.not_before;
		if window > time::Duration::try_from(max_validity).unwrap_or(time::Duration::MAX) {
			return Err(CertError::InvalidRequest(format!(
				"validity window {window} exceeds policy maximum"
			)));
		}
		Ok(())
	}
}

/// One issued certificate as tracked by the store. The private key lives
/// beside the record (see [`store::StoredCertificate`]), never inside it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CertificateRecord {
	/// DER bytes of the certificate.
	#[serde(with = "base64_bytes")]
	pub raw: Vec<u8>,
	/// Lowercase hex serial, the store key.
	pub serial_number: String,
	#[serde(rename = "type")]
	pub kind: CertKind,
	pub status: CertStatus,
	pub sans: Vec<San>,
	pub key_usage: Vec<KeyUsage>,
	pub ext_key_usage: Vec<ExtKeyUsage>,
	/// Serial of the issuing CA/intermediate; `None` only for self-signed CAs.
	pub issuer_serial: Option<String>,
	#[serde(with = "serde_rfc3339")]
	pub not_before: OffsetDateTime,
	#[serde(with = "serde_rfc3339")]
	pub not_after: OffsetDateTime,
	#[serde(with = "serde_rfc3339")]
	pub created_at: OffsetDateTime,
	#[serde(with = "serde_rfc3339")]
	pub updated_at: OffsetDateTime,
	#[serde(default, with = "serde_rfc3339_option")]
	pub revoked_at: Option<OffsetDateTime>,
	#[serde(default)]
	pub revocation_reason: Option<RevocationReason>,
	#[serde(default)]
	pub metadata: BTreeMap<String, String>,
}

impl CertificateRecord {
	/// Decode the raw DER. The borrow is tied to `self`.
	pub fn parse(&self) -> Result<X509Certificate<'_>, CertError> {
		let (_, cert) = x509_parser::parse_x509_certificate(&self.raw)
			.map_err(|e| CertError::Parse(e.to_string()))?;
		Ok(cert)
	}

	/// Status as of `now`. Revocation is sticky; expiry and not-yet-valid are
	/// derived from the validity window.
	pub fn effective_status(&self, now: OffsetDateTime) -> CertStatus {
		if self.status == CertStatus::Revoked {
			return CertStatus::Revoked;
		}
		if now < self.not_before {
			CertStatus::NotYetValid
		} else if now > self.not_after {
			CertStatus::Expired
		} else {
			CertStatus::Valid
		}
	}

	pub fn remaining_validity(&self, now: OffsetDateTime) -> time::Duration {
		(self.not_after - now).max(time::Duration::ZERO)
	}

	/// Mark revoked. Valid→Revoked only; never reversed.
	pub fn revoke(&mut self, reason: RevocationReason, now: OffsetDateTime) -> Result<(), CertError> {
		if self.status == CertStatus::Revoked {
			return Err(CertError::AlreadyRevoked(self.serial_number.clone()));
		}
		self.status = CertStatus::Revoked;
		self.revoked_at = Some(now);
		self.revocation_reason = Some(reason);
		self.updated_at = now;
		Ok(())
	}

	pub fn pem(&self) -> String {
		pem_encode("CERTIFICATE", &self.raw)
	}
}

pub(crate) fn pem_encode(label: &str, der: &[u8]) -> String {
	use base64::Engine;
	let b64 = base64::engine::general_purpose::STANDARD.encode(der);
	let mut out = format!("-----BEGIN {label}-----\n");
	for chunk in b64.as_bytes().chunks(64) {
		out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
		out.push('\n');
	}
	out.push_str(&format!("-----END {label}-----\n"));
	out
}

/// SANs of a decoded certificate in record form.
pub(crate) fn decode_sans(cert: &X509Certificate<'_>) -> Vec<San> {
	let Ok(Some(ext)) = cert.subject_alternative_name() else {
		return Vec::new();
	};
	ext.value
		.general_names
		.iter()
		.filter_map(|n| match n {
			GeneralName::DNSName(d) => Some(San::Dns(d.to_string())),
			GeneralName::IPAddress(bytes) => match bytes.len() {
				4 => {
					let octets: [u8; 4] = (*bytes).try_into().ok()?;
					Some(San::Ip(IpAddr::from(octets)))
				},
				16 => {
					let octets: [u8; 16] = (*bytes).try_into().ok()?;
					Some(San::Ip(IpAddr::from(octets)))
				},
				_ => None,
			},
			_ => None,
		})
		.collect()
}

/// Validity window of a decoded certificate as `OffsetDateTime`s.
pub(crate) fn decode_validity(cert: &X509Certificate<'_>) -> (OffsetDateTime, OffsetDateTime) {
	let nb = OffsetDateTime::from_unix_timestamp(cert.validity().not_before.timestamp())
		.unwrap_or(OffsetDateTime::UNIX_EPOCH);
	let na = OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp())
		.unwrap_or(OffsetDateTime::UNIX_EPOCH);
	(nb, na)
}

mod base64_bytes {
	use base64::Engine;
	use serde::{Deserialize, Deserializer, Serializer, de::Error};

	pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
		let raw = String::deserialize(d)?;
		base64::engine::general_purpose::STANDARD
			.decode(raw.as_bytes())
			.map_err(D::Error::custom)
	}
}
