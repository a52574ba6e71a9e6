//! TLS policy and config construction for the tunnel path.
//!
//! TLS 1.3 only by default, AEAD suites only, X25519/P-384/P-256 key
//! exchange, tickets and resumption disabled, mutual certificate
//! authentication both ways. The server verifier carries the current CRL so
//! revoked clients fail at the handshake. A post-handshake hook re-asserts
//! the negotiated version and cipher as defense in depth.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::{NoServerSessionStorage, VerifierBuilderError, WebPkiClientVerifier};
use rustls::client::Resumption;
use rustls::{CipherSuite, ClientConfig, CommonState, ProtocolVersion, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;

use crate::cert::crl::CrlGenerator;
use crate::cert::rotation::Rotator;
use crate::cert::store::CertificateStore;
use crate::cert::{CertError, CertKind, CertStatus};
use crate::config::SecurityLevel;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
	#[error("rustls: {0}")]
	Rustls(#[from] rustls::Error),
	#[error("client verifier: {0}")]
	Verifier(#[from] VerifierBuilderError),
	#[error("certificate: {0}")]
	Cert(#[from] CertError),
	#[error("no active {0} certificate")]
	NoActiveCert(CertKind),
	#[error("policy violation: {0}")]
	Policy(String),
}

/// AEAD suites allowed on the tunnel path.
pub const ALLOWED_TLS13_SUITES: &[CipherSuite] = &[
	CipherSuite::TLS13_AES_128_GCM_SHA256,
	CipherSuite::TLS13_AES_256_GCM_SHA384,
	CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
];

pub struct TlsManager {
	rotator: Arc<Rotator>,
	store: Arc<CertificateStore>,
	crl: Option<Arc<CrlGenerator>>,
	level: SecurityLevel,
}

impl TlsManager {
	pub fn new(
		rotator: Arc<Rotator>,
		store: Arc<CertificateStore>,
		crl: Option<Arc<CrlGenerator>>,
		level: SecurityLevel,
	) -> TlsManager {
		TlsManager {
			rotator,
			store,
			crl,
			level,
		}
	}

	fn provider(&self) -> Arc<CryptoProvider> {
		let base = rustls::crypto::aws_lc_rs::default_provider();
		let cipher_suites = match self.level {
			SecurityLevel::Modern => base
				.cipher_suites
				.iter()
				.filter(|s| ALLOWED_TLS13_SUITES.contains(&s.suite()))
				.copied()
				.collect(),
			// Interop levels keep the full provider list; the version floor
			// still comes from `versions`.
			SecurityLevel::Intermediate | SecurityLevel::Old => base.cipher_suites.clone(),
		};
		let kx_groups = vec![
			rustls::crypto::aws_lc_rs::kx_group::X25519,
			rustls::crypto::aws_lc_rs::kx_group::SECP384R1,
			rustls::crypto::aws_lc_rs::kx_group::SECP256R1,
		];
		Arc::new(CryptoProvider {
			cipher_suites,
			kx_groups,
			..base
		})
	}

	fn versions(&self) -> &'static [&'static rustls::SupportedProtocolVersion] {
		static MODERN: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];
		static INTERMEDIATE_OR_OLD: &[&rustls::SupportedProtocolVersion] =
			&[&rustls::version::TLS13, &rustls::version::TLS12];
		match self.level {
			SecurityLevel::Modern => MODERN,
			SecurityLevel::Intermediate | SecurityLevel::Old => INTERMEDIATE_OR_OLD,
		}
	}

	/// Trusted pool: every currently valid CA/intermediate in the store.
	fn root_store(&self) -> Result<Arc<RootCertStore>, TlsError> {
		let now = OffsetDateTime::now_utc();
		let mut roots = RootCertStore::empty();
		let mut added = 0usize;
		for kind in [CertKind::Ca, CertKind::Intermediate] {
			for record in self.store.list_by_kind(kind)? {
				if record.effective_status(now) != CertStatus::Valid {
					continue;
				}
				roots
					.add(CertificateDer::from(record.raw.clone()))
					.map_err(TlsError::Rustls)?;
				added += 1;
			}
		}
		if added == 0 {
			return Err(TlsError::Policy("no trusted CA certificates in store".into()));
		}
		Ok(Arc::new(roots))
	}

	/// The presented chain for our own side: current cert for `kind`, then
	/// any intermediates up to (excluding) the self-signed root.
	fn identity(&self, kind: CertKind) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
		let current = self
			.rotator
			.current(kind)
			.ok_or(TlsError::NoActiveCert(kind))?;
		let mut chain = vec![CertificateDer::from(current.record.raw.clone())];
		let mut issuer_serial = current.record.issuer_serial.clone();
		while let Some(serial) = issuer_serial {
			let link = self.store.load(&serial)?;
			if link.record.issuer_serial.is_none() {
				break;
			}
			chain.push(CertificateDer::from(link.record.raw.clone()));
			issuer_serial = link.record.issuer_serial.clone();
		}
		let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
			current.private_key.expose().to_vec(),
		));
		Ok((chain, key))
	}

	/// Server side: mutual TLS, client certs verified against the store's CA
	/// pool with the current CRL attached; tickets and session cache off.
	pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
		let provider = self.provider();
		let roots = self.root_store()?;
		let mut verifier_builder = WebPkiClientVerifier::builder_with_provider(roots, provider.clone());
		if let Some(crl) = &self.crl {
			let der = crl.der()?;
			verifier_builder = verifier_builder.with_crls([CertificateRevocationListDer::from(der)]);
		}
		let verifier = verifier_builder.build()?;

		let (chain, key) = self.identity(CertKind::Server)?;
		let mut config = ServerConfig::builder_with_provider(provider)
			.with_protocol_versions(self.versions())?
			.with_client_cert_verifier(verifier)
			.with_single_cert(chain, key)?;
		config.session_storage = Arc::new(NoServerSessionStorage {});
		config.send_tls13_tickets = 0;
		Ok(Arc::new(config))
	}

	/// Client side: verifies the server chain and name, presents our client
	/// certificate, resumption disabled for forward secrecy.
	pub fn client_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
		let provider = self.provider();
		let roots = self.root_store()?;
		let (chain, key) = self.identity(CertKind::Client)?;
		let mut config = ClientConfig::builder_with_provider(provider)
			.with_protocol_versions(self.versions())?
			.with_root_certificates(roots)
			.with_client_auth_cert(chain, key)?;
		config.resumption = Resumption::disabled();
		Ok(Arc::new(config))
	}

	/// Post-handshake assertion of the negotiated parameters. rustls already
	/// enforces these at config level; this hook catches config drift.
	pub fn verify_connection(&self, conn: &CommonState) -> Result<(), TlsError> {
		let version = conn
			.protocol_version()
			.ok_or_else(|| TlsError::Policy("handshake incomplete".into()))?;
		if self.level == SecurityLevel::Modern && version != ProtocolVersion::TLSv1_3 {
			return Err(TlsError::Policy(format!(
				"negotiated {version:?}, policy requires TLS 1.3"
			)));
		}
		let suite = conn
			.negotiated_cipher_suite()
			.ok_or_else(|| TlsError::Policy("no cipher suite negotiated".into()))?;
		if self.level == SecurityLevel::Modern && !ALLOWED_TLS13_SUITES.contains(&suite.suite()) {
			return Err(TlsError::Policy(format!(
				"negotiated suite {:?} outside allowed set",
				suite.suite()
			)));
		}
		Ok(())
	}
}

