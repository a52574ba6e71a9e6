//! Certificate issuance, revocation, verification and PEM import/export.
//!
//! ECDSA P-384 by default; P-256 and RSA are configurable. Serial numbers are
//! 128 random bits (top bit cleared so the DER integer stays 16 bytes and the
//! hex serial matches the store key). Every issuance persists the record and
//! its encrypted private key through the store before returning.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
	IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rcgen::string::Ia5String;
use rustls_pki_types::CertificateDer;
use time::OffsetDateTime;
use tracing::info;

use super::store::{CertificateStore, SecretDer, StoredCertificate};
use super::{
	CertError, CertKind, CertStatus, CertificateRecord, CertificateRequest, ExtKeyUsage, KeyUsage,
	RevocationReason, San, Subject, decode_sans, decode_validity,
};
use crate::config::KeyAlgorithm;

#[derive(Debug, Clone)]
pub struct IssuancePolicy {
	/// Cap on any requested validity window.
	pub max_validity: Duration,
	pub key_algorithm: KeyAlgorithm,
	/// MaxPathLen for CA certificates.
	pub ca_path_len: u8,
}

impl Default for IssuancePolicy {
	fn default() -> Self {
		IssuancePolicy {
			max_validity: Duration::from_secs(365 * 86400),
			key_algorithm: KeyAlgorithm::EcdsaP384,
			ca_path_len: 0,
		}
	}
}

pub struct CertificateManager {
	store: Arc<CertificateStore>,
	policy: IssuancePolicy,
}

/// PEM bundle produced by [`CertificateManager::export_pem`].
pub struct CertExport {
	pub cert_pem: String,
	pub key_pem: String,
}

impl CertificateManager {
	pub fn new(store: Arc<CertificateStore>, policy: IssuancePolicy) -> CertificateManager {
		CertificateManager { store, policy }
	}

	pub fn store(&self) -> &Arc<CertificateStore> {
		&self.store
	}

	pub fn policy(&self) -> &IssuancePolicy {
		&self.policy
	}

	fn new_serial() -> (SerialNumber, String) {
		let mut bytes: [u8; 16] = rand::random();
		// Keep the DER INTEGER positive so its content bytes equal ours and
		// the hex serial matches the store key.
		bytes[0] &= 0x7f;
		(SerialNumber::from_slice(&bytes), hex::encode(bytes))
	}

	fn generate_key(&self) -> Result<(KeyPair, SecretDer), CertError> {
		let key = match self.policy.key_algorithm {
			KeyAlgorithm::EcdsaP384 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384),
			KeyAlgorithm::EcdsaP256 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256),
			KeyAlgorithm::Rsa2048 => Self::generate_rsa(aws_lc_rs::rsa::KeySize::Rsa2048),
			KeyAlgorithm::Rsa4096 => Self::generate_rsa(aws_lc_rs::rsa::KeySize::Rsa4096),
		}
		.map_err(|e| CertError::Key(e.to_string()))?;
		let der = SecretDer::new(key.serialize_der());
		Ok((key, der))
	}

	fn generate_rsa(size: aws_lc_rs::rsa::KeySize) -> Result<KeyPair, rcgen::Error> {
		use aws_lc_rs::encoding::AsDer;
		let rsa = aws_lc_rs::signature::RsaKeyPair::generate(size)
			.map_err(|_| rcgen::Error::KeyGenerationUnavailable)?;
		let pkcs8 = rsa
			.as_der()
			.map_err(|_| rcgen::Error::KeyGenerationUnavailable)?;
		KeyPair::try_from(pkcs8.as_ref())
	}

	fn distinguished_name(subject: &Subject) -> DistinguishedName {
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, subject.common_name.as_str());
		if let Some(o) = &subject.organization {
			dn.push(DnType::OrganizationName, o.as_str());
		}
		if let Some(ou) = &subject.organizational_unit {
			dn.push(DnType::OrganizationalUnitName, ou.as_str());
		}
		if let Some(c) = &subject.country {
			dn.push(DnType::CountryName, c.as_str());
		}
		if let Some(st) = &subject.state {
			dn.push(DnType::StateOrProvinceName, st.as_str());
		}
		if let Some(l) = &subject.locality {
			dn.push(DnType::LocalityName, l.as_str());
		}
		dn
	}

	fn san_types(sans: &[San]) -> Result<Vec<SanType>, CertError> {
		sans.iter()
			.map(|san| match san {
				San::Dns(d) => Ia5String::try_from(d.as_str())
					.map(SanType::DnsName)
					.map_err(|e| CertError::InvalidRequest(format!("bad DNS SAN {d:?}: {e}"))),
				San::Ip(ip) => Ok(SanType::IpAddress(*ip)),
			})
			.collect()
	}

	fn key_usage_purposes(usages: &[KeyUsage]) -> Vec<KeyUsagePurpose> {
		usages
			.iter()
			.map(|u| match u {
				KeyUsage::DigitalSignature => KeyUsagePurpose::DigitalSignature,
				KeyUsage::KeyEncipherment => KeyUsagePurpose::KeyEncipherment,
				KeyUsage::KeyAgreement => KeyUsagePurpose::KeyAgreement,
				KeyUsage::CertSign => KeyUsagePurpose::KeyCertSign,
				KeyUsage::CrlSign => KeyUsagePurpose::CrlSign,
			})
			.collect()
	}

	/// Kind-specific usages merged with whatever the request asked for.
	fn effective_usages(
		kind: CertKind,
		req: &CertificateRequest,
	) -> (Vec<KeyUsage>, Vec<ExtKeyUsage>) {
		let mut ku = req.key_usages.clone();
		let mut eku = req.ext_key_usages.clone();
		let need_ku: &[KeyUsage] = match kind {
			CertKind::Ca | CertKind::Intermediate => &[KeyUsage::CertSign, KeyUsage::CrlSign],
			CertKind::Server => &[KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
			CertKind::Client => &[KeyUsage::DigitalSignature],
		};
		for u in need_ku {
			if !ku.contains(u) {
				ku.push(*u);
			}
		}
		let need_eku: &[ExtKeyUsage] = match kind {
			CertKind::Server => &[ExtKeyUsage::ServerAuth],
			CertKind::Client => &[ExtKeyUsage::ClientAuth],
			_ => &[],
		};
		for u in need_eku {
			if !eku.contains(u) {
				eku.push(*u);
			}
		}
		(ku, eku)
	}

	fn build_params(
		&self,
		kind: CertKind,
		req: &CertificateRequest,
		serial: SerialNumber,
		ku: &[KeyUsage],
		eku: &[ExtKeyUsage],
	) -> Result<CertificateParams, CertError> {
		let mut params = CertificateParams::default();
		params.distinguished_name = Self::distinguished_name(&req.subject);
		params.serial_number = Some(serial);
		params.not_before = req.not_before;
		params.not_after = req.not_after;
		params.subject_alt_names = Self::san_types(&req.sans)?;
		params.key_identifier_method = rcgen::KeyIdMethod::Sha256;
		params.is_ca = if kind.is_authority() {
			IsCa::Ca(BasicConstraints::Constrained(self.policy.ca_path_len))
		} else {
			IsCa::ExplicitNoCa
		};
		params.key_usages = Self::key_usage_purposes(ku);
		params.extended_key_usages = eku
			.iter()
			.map(|u| match u {
				ExtKeyUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
				ExtKeyUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
			})
			.collect();
		Ok(params)
	}

	fn record_from_issued(
		&self,
		kind: CertKind,
		req: &CertificateRequest,
		serial_hex: String,
		raw: Vec<u8>,
		issuer_serial: Option<String>,
		ku: Vec<KeyUsage>,
		eku: Vec<ExtKeyUsage>,
	) -> CertificateRecord {
		let now = OffsetDateTime::now_utc();
		CertificateRecord {
			raw,
			serial_number: serial_hex,
			kind,
			status: CertStatus::Valid,
			sans: req.sans.clone(),
			key_usage: ku,
			ext_key_usage: eku,
			issuer_serial,
			not_before: req.not_before,
			not_after: req.not_after,
			created_at: now,
			updated_at: now,
			revoked_at: None,
			revocation_reason: None,
			metadata: req.metadata.clone(),
		}
	}

	fn load_issuer(&self, serial: &str) -> Result<(StoredCertificate, Issuer<'static, KeyPair>), CertError> {
		let parent = self
			.store
			.load(serial)
			.map_err(|_| CertError::IssuerNotFound(serial.to_string()))?;
		if !parent.record.kind.is_authority() {
			return Err(CertError::Issuance(format!(
				"issuer {serial} is a {} certificate, not an authority",
				parent.record.kind
			)));
		}
		if parent.record.effective_status(OffsetDateTime::now_utc()) != CertStatus::Valid {
			return Err(CertError::Issuance(format!(
				"issuer {serial} is not currently valid"
			)));
		}
		let key = KeyPair::try_from(parent.private_key.expose())
			.map_err(|e| CertError::Key(e.to_string()))?;
		let der = CertificateDer::from(parent.record.raw.clone());
		let issuer = Issuer::from_ca_cert_der(&der, key).map_err(|e| CertError::Issuance(e.to_string()))?;
		Ok((parent, issuer))
	}

	/// Self-signed root CA.
	pub fn create_ca(&self, req: &CertificateRequest) -> Result<StoredCertificate, CertError> {
		req.validate(self.policy.max_validity)?;
		let (serial, serial_hex) = Self::new_serial();
		let (key, key_der) = self.generate_key()?;
		let (ku, eku) = Self::effective_usages(CertKind::Ca, req);
		let params = self.build_params(CertKind::Ca, req, serial, &ku, &eku)?;
		let cert = params
			.self_signed(&key)
			.map_err(|e| CertError::Issuance(e.to_string()))?;
		let record = self.record_from_issued(
			CertKind::Ca,
			req,
			serial_hex,
			cert.der().to_vec(),
			None,
			ku,
			eku,
		);
		let stored = StoredCertificate {
			record,
			private_key: key_der,
		};
		self.store.store(&stored)?;
		info!(serial = %stored.record.serial_number, "issued root CA certificate");
		Ok(stored)
	}

	pub fn create_intermediate(
		&self,
		req: &CertificateRequest,
		parent_serial: &str,
	) -> Result<StoredCertificate, CertError> {
		self.issue_signed(CertKind::Intermediate, req, parent_serial)
	}

	pub fn create_server(
		&self,
		req: &CertificateRequest,
		parent_serial: &str,
	) -> Result<StoredCertificate, CertError> {
		self.issue_signed(CertKind::Server, req, parent_serial)
	}

	pub fn create_client(
		&self,
		req: &CertificateRequest,
		parent_serial: &str,
	) -> Result<StoredCertificate, CertError> {
		self.issue_signed(CertKind::Client, req, parent_serial)
	}

	fn issue_signed(
		&self,
		kind: CertKind,
		req: &CertificateRequest,
		parent_serial: &str,
	) -> Result<StoredCertificate, CertError> {
		req.validate(self.policy.max_validity)?;
		let (parent, issuer) = self.load_issuer(parent_serial)?;
		let (serial, serial_hex) = Self::new_serial();
		let (key, key_der) = self.generate_key()?;
		let (ku, eku) = Self::effective_usages(kind, req);
		let params = self.build_params(kind, req, serial, &ku, &eku)?;
		let cert = params
			.signed_by(&key, &issuer)
			.map_err(|e| CertError::Issuance(e.to_string()))?;
		let record = self.record_from_issued(
			kind,
			req,
			serial_hex,
			cert.der().to_vec(),
			Some(parent.record.serial_number.clone()),
			ku,
			eku,
		);
		let stored = StoredCertificate {
			record,
			private_key: key_der,
		};
		self.store.store(&stored)?;
		info!(
			serial = %stored.record.serial_number,
			kind = %kind,
			issuer = %parent.record.serial_number,
			"issued certificate"
		);
		Ok(stored)
	}

	/// Mark a certificate revoked. The transition is one-way.
	pub fn revoke(&self, serial: &str, reason: RevocationReason) -> Result<CertificateRecord, CertError> {
		let record = self
			.store
			.update_status(serial, CertStatus::Revoked, Some(reason))?;
		info!(serial, reason = ?reason, "revoked certificate");
		Ok(record)
	}

	/// Chain verification against the store: walks issuer links, requires
	/// every link time-valid and unrevoked, and checks each signature.
	pub fn verify(&self, serial: &str) -> Result<(), CertError> {
		let stored = self.store.load(serial)?;
		self.verify_record(&stored.record)
	}

	pub fn verify_record(&self, record: &CertificateRecord) -> Result<(), CertError> {
		let now = OffsetDateTime::now_utc();
		if record.effective_status(now) != CertStatus::Valid {
			return Err(CertError::ChainVerification(format!(
				"certificate {} is {:?}",
				record.serial_number,
				record.effective_status(now)
			)));
		}
		let mut current = record.clone();
		// Bounded walk; issuer loops would otherwise spin forever.
		for _ in 0..8 {
			let cert = current.parse()?;
			match &current.issuer_serial {
				None => {
					// Self-signed root: signature must verify under its own key.
					cert
						.verify_signature(None)
						.map_err(|e| CertError::ChainVerification(format!("root self-signature: {e}")))?;
					return Ok(());
				},
				Some(issuer_serial) => {
					let issuer = self
						.store
						.load(issuer_serial)
						.map_err(|_| CertError::IssuerNotFound(issuer_serial.clone()))?;
					if !issuer.record.kind.is_authority() {
						return Err(CertError::ChainVerification(format!(
							"issuer {issuer_serial} is not an authority"
						)));
					}
					if issuer.record.effective_status(now) != CertStatus::Valid {
						return Err(CertError::ChainVerification(format!(
							"issuer {issuer_serial} is {:?}",
							issuer.record.effective_status(now)
						)));
					}
					let issuer_cert = issuer.record.parse()?;
					if cert.issuer() != issuer_cert.subject() {
						return Err(CertError::ChainVerification(format!(
							"issuer DN mismatch for {}",
							current.serial_number
						)));
					}
					cert
						.verify_signature(Some(issuer_cert.public_key()))
						.map_err(|e| CertError::ChainVerification(format!("signature: {e}")))?;
					current = issuer.record.clone();
				},
			}
		}
		Err(CertError::ChainVerification("chain too deep".into()))
	}

	/// PEM bundle for operator use: certificate plus decrypted PKCS#8 key.
	pub fn export_pem(&self, serial: &str) -> Result<CertExport, CertError> {
		let stored = self.store.load(serial)?;
		Ok(CertExport {
			cert_pem: stored.record.pem(),
			key_pem: super::pem_encode("PRIVATE KEY", stored.private_key.expose()),
		})
	}

	/// Import an externally provisioned cert + PKCS#8 key pair. Kind and
	/// derived fields come from the certificate itself; the issuer link is
	/// resolved against the store when the issuing authority is present.
	pub fn import_pem(&self, cert_pem: &str, key_pem: &str) -> Result<StoredCertificate, CertError> {
		let raw = parse_single_cert_pem(cert_pem)?;
		let key = parse_pkcs8_pem(key_pem)?;
		let (_, cert) = x509_parser::parse_x509_certificate(&raw)
			.map_err(|e| CertError::Parse(e.to_string()))?;

		let serial_hex = hex::encode(cert.raw_serial());
		let (not_before, not_after) = decode_validity(&cert);
		let sans = decode_sans(&cert);
		let is_ca = cert.is_ca();
		let self_signed = cert.subject() == cert.issuer();
		let eku = decode_eku(&cert);
		let kind = if is_ca {
			if self_signed { CertKind::Ca } else { CertKind::Intermediate }
		} else if eku.contains(&ExtKeyUsage::ServerAuth) {
			CertKind::Server
		} else {
			CertKind::Client
		};
		let issuer_serial = if self_signed {
			None
		} else {
			self.find_issuer_serial(&cert)?
		};

		let now = OffsetDateTime::now_utc();
		let record = CertificateRecord {
			raw: raw.clone(),
			serial_number: serial_hex,
			kind,
			status: CertStatus::Valid,
			sans,
			key_usage: decode_ku(&cert),
			ext_key_usage: eku,
			issuer_serial,
			not_before,
			not_after,
			created_at: now,
			updated_at: now,
			revoked_at: None,
			revocation_reason: None,
			metadata: BTreeMap::new(),
		};
		let stored = StoredCertificate {
			record,
			private_key: key,
		};
		self.store.store(&stored)?;
		Ok(stored)
	}

	/// Import a CA/intermediate certificate we do not hold the key for (peer
	/// trust anchors from `ca_file`). Stored with empty key material.
	pub fn import_trust_anchor(&self, cert_pem: &str) -> Result<StoredCertificate, CertError> {
		let raw = parse_single_cert_pem(cert_pem)?;
		let (_, cert) = x509_parser::parse_x509_certificate(&raw)
			.map_err(|e| CertError::Parse(e.to_string()))?;
		if !cert.is_ca() {
			return Err(CertError::InvalidRequest(
				"trust anchor is not a CA certificate".into(),
			));
		}
		let self_signed = cert.subject() == cert.issuer();
		let (not_before, not_after) = decode_validity(&cert);
		let now = OffsetDateTime::now_utc();
		let record = CertificateRecord {
			serial_number: hex::encode(cert.raw_serial()),
			kind: if self_signed { CertKind::Ca } else { CertKind::Intermediate },
			status: CertStatus::Valid,
			sans: decode_sans(&cert),
			key_usage: decode_ku(&cert),
			ext_key_usage: decode_eku(&cert),
			issuer_serial: if self_signed { None } else { self.find_issuer_serial(&cert)? },
			not_before,
			not_after,
			created_at: now,
			updated_at: now,
			revoked_at: None,
			revocation_reason: None,
			metadata: BTreeMap::new(),
			raw,
		};
		let stored = StoredCertificate {
			record,
			private_key: SecretDer::new(Vec::new()),
		};
		self.store.store(&stored)?;
		Ok(stored)
	}

	fn find_issuer_serial(
		&self,
		cert: &x509_parser::certificate::X509Certificate<'_>,
	) -> Result<Option<String>, CertError> {
		for candidate in self.store.list()? {
			if !candidate.kind.is_authority() {
				continue;
			}
			let ca = candidate.parse()?;
			if ca.subject() == cert.issuer()
				&& cert.verify_signature(Some(ca.public_key())).is_ok()
			{
				return Ok(Some(candidate.serial_number.clone()));
			}
		}
		Ok(None)
	}
}

fn parse_single_cert_pem(pem: &str) -> Result<Vec<u8>, CertError> {
	let mut reader = std::io::BufReader::new(pem.as_bytes());
	match rustls_pemfile::read_one(&mut reader).map_err(|e| CertError::Parse(e.to_string()))? {
		Some(rustls_pemfile::Item::X509Certificate(der)) => Ok(der.to_vec()),
		_ => Err(CertError::Parse("no certificate in PEM input".into())),
	}
}

fn parse_pkcs8_pem(pem: &str) -> Result<SecretDer, CertError> {
	let mut reader = std::io::BufReader::new(pem.as_bytes());
	match rustls_pemfile::read_one(&mut reader).map_err(|e| CertError::Parse(e.to_string()))? {
		Some(rustls_pemfile::Item::Pkcs8Key(der)) => Ok(SecretDer::new(der.secret_pkcs8_der().to_vec())),
		Some(rustls_pemfile::Item::Sec1Key(_)) => Err(CertError::Key(
			"SEC1 keys are not supported; re-encode as PKCS#8".into(),
		)),
		_ => Err(CertError::Parse("no private key in PEM input".into())),
	}
}

fn decode_ku(cert: &x509_parser::certificate::X509Certificate<'_>) -> Vec<KeyUsage> {
	let Ok(Some(ku)) = cert.key_usage() else {
		return Vec::new();
	};
	let mut out = Vec::new();
	if ku.value.digital_signature() {
		out.push(KeyUsage::DigitalSignature);
	}
	if ku.value.key_encipherment() {
		out.push(KeyUsage::KeyEncipherment);
	}
	if ku.value.key_agreement() {
		out.push(KeyUsage::KeyAgreement);
	}
	if ku.value.key_cert_sign() {
		out.push(KeyUsage::CertSign);
	}
	if ku.value.crl_sign() {
		out.push(KeyUsage::CrlSign);
	}
	out
}

fn decode_eku(cert: &x509_parser::certificate::X509Certificate<'_>) -> Vec<ExtKeyUsage> {
	let Ok(Some(eku)) = cert.extended_key_usage() else {
		return Vec::new();
	};
	let mut out = Vec::new();
	if eku.value.server_auth {
		out.push(ExtKeyUsage::ServerAuth);
	}
	if eku.value.client_auth {
		out.push(ExtKeyUsage::ClientAuth);
	}
	out
}

