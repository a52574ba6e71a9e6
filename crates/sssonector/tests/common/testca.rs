//! Throwaway CA hierarchy for tests, issued through the production manager.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sssonector::cert::crl::CrlGenerator;
use sssonector::cert::manager::{CertificateManager, IssuancePolicy};
use sssonector::cert::rotation::{RotationPolicy, Rotator};
use sssonector::cert::store::{CertificateStore, StoredCertificate};
use sssonector::cert::{CertKind, CertificateRequest, San, Subject};
use sssonector::config::{KeyAlgorithm, SecurityLevel};
use sssonector::tls::TlsManager;
use time::OffsetDateTime;

pub const TEST_KEY_MATERIAL: &[u8] = b"test operator key material";

pub fn request(kind: CertKind, cn: &str, sans: &[&str]) -> CertificateRequest {
	let now = OffsetDateTime::now_utc();
	CertificateRequest {
		kind,
		subject: Subject {
			common_name: cn.to_string(),
			organization: Some("SSSonector Test".to_string()),
			..Default::default()
		},
		sans: sans
			.iter()
			.map(|s| s.parse::<San>().expect("valid SAN"))
			.collect(),
		key_usages: vec![],
		ext_key_usages: vec![],
		not_before: now - time::Duration::minutes(5),
		not_after: now + time::Duration::days(30),
		metadata: BTreeMap::new(),
	}
}

pub struct TestCa {
	// Held so the store directory outlives the test.
	_dir: tempfile::TempDir,
	pub store: Arc<CertificateStore>,
	pub manager: Arc<CertificateManager>,
	pub ca: StoredCertificate,
}

impl TestCa {
	pub fn new() -> TestCa {
		Self::with_algorithm(KeyAlgorithm::EcdsaP256)
	}

	pub fn with_algorithm(algorithm: KeyAlgorithm) -> TestCa {
		let dir = tempfile::tempdir().expect("tempdir");
		let store = Arc::new(CertificateStore::open(dir.path(), TEST_KEY_MATERIAL).expect("store"));
		let manager = Arc::new(CertificateManager::new(
			store.clone(),
			IssuancePolicy {
				max_validity: Duration::from_secs(365 * 86400),
				key_algorithm: algorithm,
				ca_path_len: 1,
			},
		));
		let ca = manager
			.create_ca(&request(CertKind::Ca, "SSSonector Test Root", &[]))
			.expect("create ca");
		TestCa {
			_dir: dir,
			store,
			manager,
			ca,
		}
	}

	/// A fresh store/manager that trusts the same root CA (record and key
	/// copied over), for import and cross-peer scenarios.
	pub fn sharing_ca(other: &TestCa) -> TestCa {
		let dir = tempfile::tempdir().expect("tempdir");
		let store = Arc::new(CertificateStore::open(dir.path(), TEST_KEY_MATERIAL).expect("store"));
		store.store(&other.ca).expect("copy ca");
		let manager = Arc::new(CertificateManager::new(
			store.clone(),
			other.manager.policy().clone(),
		));
		TestCa {
			_dir: dir,
			store,
			manager,
			ca: other.ca.clone(),
		}
	}

	pub fn server_cert(&self, cn: &str) -> StoredCertificate {
		let san = format!("dns:{cn}");
		self
			.manager
			.create_server(
				&request(CertKind::Server, cn, &[&san]),
				&self.ca.record.serial_number,
			)
			.expect("issue server cert")
	}

	pub fn server_cert_expiring_in(&self, cn: &str, remaining: time::Duration) -> StoredCertificate {
		let san = format!("dns:{cn}");
		let mut req = request(CertKind::Server, cn, &[&san]);
		req.not_after = OffsetDateTime::now_utc() + remaining;
		self
			.manager
			.create_server(&req, &self.ca.record.serial_number)
			.expect("issue short-lived server cert")
	}

	pub fn client_cert(&self, cn: &str) -> StoredCertificate {
		self
			.manager
			.create_client(
				&request(CertKind::Client, cn, &[]),
				&self.ca.record.serial_number,
			)
			.expect("issue client cert")
	}

	pub fn generate_crl(&self) -> Vec<u8> {
		let generator = CrlGenerator::new(
			self.manager.clone(),
			self.ca.record.serial_number.clone(),
			None,
		);
		generator.der().expect("generate crl")
	}

	/// A TLS manager with freshly issued server and client identities and a
	/// live CRL generator.
	pub fn tls_manager(&self, level: SecurityLevel) -> TlsManager {
		self.tls_stack(level, RotationPolicy::default()).0
	}

	/// Same, but exposing the rotator so tests can drive rotation.
	pub fn tls_stack(
		&self,
		level: SecurityLevel,
		rotation: RotationPolicy,
	) -> (TlsManager, Arc<Rotator>) {
		let server = self.server_cert("vpn.example.com");
		let client = self.client_cert("test-client");
		let rotator = Rotator::new(self.manager.clone(), rotation);
		rotator
			.initialize(CertKind::Server, &server.record.serial_number)
			.expect("pin server cert");
		rotator
			.initialize(CertKind::Client, &client.record.serial_number)
			.expect("pin client cert");
		let crl = Arc::new(CrlGenerator::new(
			self.manager.clone(),
			self.ca.record.serial_number.clone(),
			None,
		));
		(
			TlsManager::new(rotator.clone(), self.store.clone(), Some(crl), level),
			rotator,
		)
	}
}

impl Default for TestCa {
	fn default() -> Self {
		TestCa::new()
	}
}
