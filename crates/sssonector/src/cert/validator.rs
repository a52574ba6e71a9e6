//! Certificate, chain, CRL and OCSP validation.
//!
//! Standalone validation walks issuer signatures directly (x509-parser);
//! handshake-time validation is separately delegated to rustls' WebPKI
//! verifier by the TLS manager. OCSP is soft-fail: transport problems yield
//! `Unknown` with a warning unless strict mode is enabled.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::warn;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::revocation_list::CertificateRevocationList;

use super::{CertKind, CertStatus, CertificateRecord, ExtKeyUsage, KeyUsage};

pub const DEFAULT_OCSP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
	#[error("no certificate provided")]
	Missing,
	#[error("certificate {serial} not valid at {now}: {status:?}")]
	NotValidNow {
		serial: String,
		now: OffsetDateTime,
		status: CertStatus,
	},
	#[error("certificate {0} is revoked")]
	Revoked(String),
	#[error("certificate {serial} missing required usage: {missing}")]
	MissingUsage { serial: String, missing: String },
	#[error("chain: {0}")]
	Chain(String),
	#[error("crl: {0}")]
	Crl(String),
	#[error("crl expired or not yet valid")]
	CrlWindow,
	#[error("listed on crl: {0}")]
	ListedOnCrl(String),
	#[error("ocsp responder reported revoked: {0}")]
	OcspRevoked(String),
	#[error("ocsp: {0}")]
	Ocsp(String),
	#[error("parse: {0}")]
	Parse(String),
}

/// Per-certificate checks in order: presence, time window, revocation
/// status, kind-specific usage bits.
pub fn validate_certificate(
	record: &CertificateRecord,
	now: OffsetDateTime,
) -> Result<(), ValidationError> {
	if record.raw.is_empty() {
		return Err(ValidationError::Missing);
	}
	// Window first, then revocation.
	if now < record.not_before {
		return Err(ValidationError::NotValidNow {
			serial: record.serial_number.clone(),
			now,
			status: CertStatus::NotYetValid,
		});
	}
	if now > record.not_after {
		return Err(ValidationError::NotValidNow {
			serial: record.serial_number.clone(),
			now,
			status: CertStatus::Expired,
		});
	}
	if record.status == CertStatus::Revoked {
		return Err(ValidationError::Revoked(record.serial_number.clone()));
	}
	let require =
		|ok: bool, missing: &str| -> Result<(), ValidationError> {
			if ok {
				Ok(())
			} else {
				Err(ValidationError::MissingUsage {
					serial: record.serial_number.clone(),
					missing: missing.to_string(),
				})
			}
		};
	match record.kind {
		CertKind::Server => {
			require(
				record.key_usage.contains(&KeyUsage::DigitalSignature)
					|| record.key_usage.contains(&KeyUsage::KeyEncipherment),
				"digital_signature|key_encipherment",
			)?;
			require(
				record.ext_key_usage.contains(&ExtKeyUsage::ServerAuth),
				"server_auth",
			)?;
		},
		CertKind::Client => {
			require(
				record.key_usage.contains(&KeyUsage::DigitalSignature),
				"digital_signature",
			)?;
			require(
				record.ext_key_usage.contains(&ExtKeyUsage::ClientAuth),
				"client_auth",
			)?;
		},
		CertKind::Ca | CertKind::Intermediate => {
			require(record.key_usage.contains(&KeyUsage::CertSign), "cert_sign")?;
			let cert = record
				.parse()
				.map_err(|e| ValidationError::Parse(e.to_string()))?;
			require(cert.is_ca(), "basic_constraints ca")?;
		},
	}
	Ok(())
}

/// Chain validation from explicit pools: the leaf must chain by subject/DN
/// and signature to a root, through the given intermediates, with every link
/// time-valid and unrevoked.
pub fn validate_chain(
	leaf: &CertificateRecord,
	intermediates: &[CertificateRecord],
	roots: &[CertificateRecord],
	now: OffsetDateTime,
) -> Result<(), ValidationError> {
	validate_certificate(leaf, now)?;
	let mut current = leaf.clone();
	for _ in 0..8 {
		let cert = current
			.parse()
			.map_err(|e| ValidationError::Parse(e.to_string()))?;
		// Root reached: self-signed and present in the trusted pool.
		if let Some(root) = roots
			.iter()
			.find(|r| r.serial_number == current.serial_number)
		{
			let root_cert = root
				.parse()
				.map_err(|e| ValidationError::Parse(e.to_string()))?;
			return root_cert
				.verify_signature(None)
				.map_err(|e| ValidationError::Chain(format!("root self-signature: {e}")));
		}
		let issuer = intermediates
			.iter()
			.chain(roots.iter())
			.find(|c| {
				c.parse()
					.map(|ic| ic.subject() == cert.issuer())
					.unwrap_or(false)
			})
			.ok_or_else(|| {
				ValidationError::Chain(format!("no issuer found for {}", current.serial_number))
			})?;
		if issuer.effective_status(now) != CertStatus::Valid {
			return Err(ValidationError::Chain(format!(
				"issuer {} is {:?}",
				issuer.serial_number,
				issuer.effective_status(now)
			)));
		}
		let issuer_cert = issuer
			.parse()
			.map_err(|e| ValidationError::Parse(e.to_string()))?;
		cert
			.verify_signature(Some(issuer_cert.public_key()))
			.map_err(|e| ValidationError::Chain(format!("signature: {e}")))?;
		current = issuer.clone();
	}
	Err(ValidationError::Chain("chain too deep".into()))
}

/// CRL window and listing check for one certificate.
pub fn validate_crl(
	record: &CertificateRecord,
	crl: &CertificateRevocationList<'_>,
	now: OffsetDateTime,
) -> Result<(), ValidationError> {
	let this_update = OffsetDateTime::from_unix_timestamp(crl.last_update().timestamp())
		.map_err(|e| ValidationError::Crl(e.to_string()))?;
	if now < this_update {
		return Err(ValidationError::CrlWindow);
	}
	if let Some(next) = crl.next_update() {
		let next_update = OffsetDateTime::from_unix_timestamp(next.timestamp())
			.map_err(|e| ValidationError::Crl(e.to_string()))?;
		if now > next_update {
			return Err(ValidationError::CrlWindow);
		}
	}
	let serial = normalize_serial(&record.serial_number)?;
	for revoked in crl.iter_revoked_certificates() {
		if revoked.user_certificate.to_bytes_be() == serial {
			return Err(ValidationError::ListedOnCrl(record.serial_number.clone()));
		}
	}
	Ok(())
}

/// Hex serial to big-endian bytes with leading zeros stripped, matching
/// `BigUint::to_bytes_be` form.
fn normalize_serial(hex_serial: &str) -> Result<Vec<u8>, ValidationError> {
	let bytes = hex::decode(hex_serial).map_err(|e| ValidationError::Parse(e.to_string()))?;
	let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
	Ok(bytes[first..].to_vec())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspStatus {
	Good,
	Revoked,
	Unknown,
}

#[derive(Debug, Clone)]
pub struct OcspOptions {
	pub timeout: Duration,
	/// Strict mode turns transport failures into errors instead of Unknown.
	pub strict: bool,
}

impl Default for OcspOptions {
	fn default() -> Self {
		OcspOptions {
			timeout: DEFAULT_OCSP_TIMEOUT,
			strict: false,
		}
	}
}

/// OCSP responder URL from the Authority Information Access extension.
pub fn ocsp_responder_url(cert: &X509Certificate<'_>) -> Option<String> {
	for ext in cert.extensions() {
		if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
			for desc in &aia.accessdescs {
				if desc.access_method == x509_parser::oid_registry::OID_PKIX_ACCESS_DESCRIPTOR_OCSP
					&& let GeneralName::URI(uri) = &desc.access_location
				{
					return Some(uri.to_string());
				}
			}
		}
	}
	None
}

/// Query the certificate's OCSP responder, if it names one.
///
/// `Revoked` is authoritative and should fail validation; `Unknown` (no
/// responder, malformed answer, transport failure in non-strict mode) is
/// advisory only.
pub async fn check_ocsp(
	record: &CertificateRecord,
	issuer: &CertificateRecord,
	opts: &OcspOptions,
) -> Result<OcspStatus, ValidationError> {
	let cert = record
		.parse()
		.map_err(|e| ValidationError::Parse(e.to_string()))?;
	let Some(url) = ocsp_responder_url(&cert) else {
		return Ok(OcspStatus::Unknown);
	};
	let issuer_cert = issuer
		.parse()
		.map_err(|e| ValidationError::Parse(e.to_string()))?;
	let request = ocsp::build_request(&cert, &issuer_cert);

	let client = reqwest::Client::builder()
		.timeout(opts.timeout)
		.build()
		.map_err(|e| ValidationError::Ocsp(e.to_string()))?;
	let response = client
		.post(&url)
		.header("content-type", "application/ocsp-request")
		.body(request)
		.send()
		.await;
	let body = match response {
		Ok(resp) => resp.bytes().await,
		Err(e) => Err(e),
	};
	let body = match body {
		Ok(b) => b,
		Err(e) => {
			if opts.strict {
				return Err(ValidationError::Ocsp(format!("transport: {e}")));
			}
			warn!(serial = %record.serial_number, url, error = %e, "ocsp transport failure, treating as unknown");
			return Ok(OcspStatus::Unknown);
		},
	};
	match ocsp::parse_response(&body) {
		Some(OcspStatus::Revoked) => Err(ValidationError::OcspRevoked(record.serial_number.clone())),
		Some(status) => Ok(status),
		None => {
			warn!(serial = %record.serial_number, url, "unparseable ocsp response, treating as unknown");
			Ok(OcspStatus::Unknown)
		},
	}
}

/// Minimal OCSP wire handling (RFC 6960): an unsigned single-cert request
/// and a status-only read of the response.
mod ocsp {
	use aws_lc_rs::digest;
	use x509_parser::certificate::X509Certificate;

	use super::OcspStatus;

	fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
		let mut out = vec![tag];
		let len = content.len();
		if len < 0x80 {
			out.push(len as u8);
		} else {
			let len_bytes: Vec<u8> = len.to_be_bytes().iter().copied().skip_while(|&b| b == 0).collect();
			out.push(0x80 | len_bytes.len() as u8);
			out.extend_from_slice(&len_bytes);
		}
		out.extend_from_slice(content);
		out
	}

	fn der_seq(content: &[u8]) -> Vec<u8> {
		der_tlv(0x30, content)
	}

	/// OCSPRequest with a single CertID, SHA-1 hashes, no extensions.
	pub fn build_request(cert: &X509Certificate<'_>, issuer: &X509Certificate<'_>) -> Vec<u8> {
		// AlgorithmIdentifier: { sha1 (1.3.14.3.2.26), NULL }
		let alg = der_seq(
			&[
				der_tlv(0x06, &[0x2b, 0x0e, 0x03, 0x02, 0x1a]),
				der_tlv(0x05, &[]),
			]
			.concat(),
		);
		let name_hash = digest::digest(
			&digest::SHA1_FOR_LEGACY_USE_ONLY,
			issuer.subject().as_raw(),
		);
		let key_hash = digest::digest(
			&digest::SHA1_FOR_LEGACY_USE_ONLY,
			&issuer.public_key().subject_public_key.data,
		);
		let cert_id = der_seq(
			&[
				alg,
				der_tlv(0x04, name_hash.as_ref()),
				der_tlv(0x04, key_hash.as_ref()),
				der_tlv(0x02, cert.raw_serial()),
			]
			.concat(),
		);
		let request = der_seq(&cert_id);
		let request_list = der_seq(&request);
		let tbs_request = der_seq(&request_list);
		der_seq(&tbs_request)
	}

	struct Reader<'a> {
		data: &'a [u8],
	}

	impl<'a> Reader<'a> {
		fn new(data: &'a [u8]) -> Reader<'a> {
			Reader { data }
		}

		/// Next TLV: (tag, content); advances past it.
		fn tlv(&mut self) -> Option<(u8, &'a [u8])> {
			let (&tag, rest) = self.data.split_first()?;
			let (&first_len, mut rest) = rest.split_first()?;
			let len = if first_len < 0x80 {
				first_len as usize
			} else {
				let n = (first_len & 0x7f) as usize;
				if n == 0 || n > 4 || rest.len() < n {
					return None;
				}
				let mut len = 0usize;
				for &b in &rest[..n] {
					len = (len << 8) | b as usize;
				}
				rest = &rest[n..];
				len
			};
			if rest.len() < len {
				return None;
			}
			let (content, tail) = rest.split_at(len);
			self.data = tail;
			Some((tag, content))
		}

		fn expect(&mut self, tag: u8) -> Option<&'a [u8]> {
			let (t, content) = self.tlv()?;
			(t == tag).then_some(content)
		}
	}

	/// Extract the certStatus of the first SingleResponse, without verifying
	/// the responder signature; callers treat the result as advisory.
	pub fn parse_response(body: &[u8]) -> Option<OcspStatus> {
		let mut r = Reader::new(body);
		let mut outer = Reader::new(r.expect(0x30)?);
		// responseStatus ENUMERATED: 0 = successful
		let status = outer.expect(0x0a)?;
		if status != [0] {
			return None;
		}
		// responseBytes [0] EXPLICIT
		let mut response_bytes = Reader::new(outer.expect(0xa0)?);
		let mut rb_seq = Reader::new(response_bytes.expect(0x30)?);
		let _oid = rb_seq.expect(0x06)?;
		let basic_der = rb_seq.expect(0x04)?;
		let mut basic = Reader::new(Reader::new(basic_der).expect(0x30)?);
		let mut tbs = Reader::new(basic.expect(0x30)?);
		// Skip optional version [0], responderID [1]/[2], producedAt.
		loop {
			let (tag, _) = tbs.tlv()?;
			if tag == 0x18 {
				break;
			}
		}
		let mut responses = Reader::new(tbs.expect(0x30)?);
		let mut single = Reader::new(responses.expect(0x30)?);
		let _cert_id = single.expect(0x30)?;
		let (status_tag, _) = single.tlv()?;
		match status_tag {
			0x80 => Some(OcspStatus::Good),
			0xa1 => Some(OcspStatus::Revoked),
			0x82 => Some(OcspStatus::Unknown),
			_ => None,
		}
	}

}
