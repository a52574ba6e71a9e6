//! Certificate lifecycle: issuance, validation, rotation and CRL behavior
//! against a real on-disk store.

use std::time::Duration;

use sssonector::cert::crl::CrlGenerator;
use sssonector::cert::rotation::{RotationPolicy, Rotator};
use sssonector::cert::validator::{
	OcspOptions, OcspStatus, ValidationError, check_ocsp, validate_certificate, validate_chain,
	validate_crl,
};
use sssonector::cert::{CertError, CertKind, CertStatus, ExtKeyUsage, RevocationReason};
use sssonector::config::KeyAlgorithm;
use time::OffsetDateTime;

mod common;
use common::testca::{TestCa, request};

#[test]
fn issues_full_chain() {
	let ca = TestCa::new();
	let server = ca.server_cert("vpn.example.com");
	let client = ca.client_cert("client-1");

	assert_eq!(server.record.kind, CertKind::Server);
	assert!(server.record.ext_key_usage.contains(&ExtKeyUsage::ServerAuth));
	assert!(client.record.ext_key_usage.contains(&ExtKeyUsage::ClientAuth));
	assert_eq!(
		server.record.issuer_serial,
		Some(ca.ca.record.serial_number.clone())
	);

	ca.manager.verify(&server.record.serial_number).unwrap();
	ca.manager.verify(&client.record.serial_number).unwrap();
}

#[test]
fn issued_der_matches_record_serial() {
	let ca = TestCa::new();
	let server = ca.server_cert("vpn.example.com");
	let parsed = server.record.parse().unwrap();
	assert_eq!(hex::encode(parsed.raw_serial()), server.record.serial_number);
	assert_eq!(server.record.serial_number.len(), 32);
}

#[test]
fn intermediate_chain_verifies() {
	let ca = TestCa::new();
	let inter = ca
		.manager
		.create_intermediate(
			&request(CertKind::Intermediate, "intermediate", &[]),
			&ca.ca.record.serial_number,
		)
		.unwrap();
	let leaf = ca
		.manager
		.create_server(
			&request(CertKind::Server, "leaf", &["dns:leaf.example.com"]),
			&inter.record.serial_number,
		)
		.unwrap();
	ca.manager.verify(&leaf.record.serial_number).unwrap();
}

#[test]
fn verify_rejects_revoked_chain_member() {
	let ca = TestCa::new();
	let server = ca.server_cert("vpn.example.com");
	ca.manager
		.revoke(&server.record.serial_number, RevocationReason::KeyCompromise)
		.unwrap();
	assert!(ca.manager.verify(&server.record.serial_number).is_err());

	let client = ca.client_cert("c1");
	ca.manager
		.revoke(&ca.ca.record.serial_number, RevocationReason::CaCompromise)
		.unwrap();
	assert!(ca.manager.verify(&client.record.serial_number).is_err());
}

#[test]
fn issuance_requires_valid_authority() {
	let ca = TestCa::new();
	let server = ca.server_cert("vpn.example.com");
	// A leaf cannot issue.
	let err = ca
		.manager
		.create_client(
			&request(CertKind::Client, "nope", &[]),
			&server.record.serial_number,
		)
		.unwrap_err();
	assert!(matches!(err, CertError::Issuance(_)));
}

#[test]
fn export_import_round_trip() {
	let ca = TestCa::new();
	let server = ca.server_cert("vpn.example.com");
	let exported = ca.manager.export_pem(&server.record.serial_number).unwrap();

	// Import into a fresh store that already knows the CA.
	let other = TestCa::sharing_ca(&ca);
	let imported = other
		.manager
		.import_pem(&exported.cert_pem, &exported.key_pem)
		.unwrap();
	assert_eq!(imported.record.raw, server.record.raw);
	assert_eq!(imported.record.serial_number, server.record.serial_number);
	assert_eq!(imported.record.kind, CertKind::Server);
	assert_eq!(imported.record.sans, server.record.sans);
	assert_eq!(
		imported.record.issuer_serial,
		Some(ca.ca.record.serial_number.clone())
	);
}

#[test]
fn p256_issuance_works() {
	let ca = TestCa::with_algorithm(KeyAlgorithm::EcdsaP256);
	let server = ca.server_cert("vpn.example.com");
	ca.manager.verify(&server.record.serial_number).unwrap();
}

#[test]
fn kind_specific_usage_enforced() {
	let ca = TestCa::new();
	let now = OffsetDateTime::now_utc();
	let server = ca.server_cert("vpn.example.com");
	validate_certificate(&server.record, now).unwrap();

	let mut stripped = server.record.clone();
	stripped.ext_key_usage.clear();
	assert!(matches!(
		validate_certificate(&stripped, now),
		Err(ValidationError::MissingUsage { .. })
	));
}

#[test]
fn time_window_enforced() {
	let ca = TestCa::new();
	let server = ca.server_cert("vpn.example.com");
	let before = server.record.not_before - time::Duration::hours(1);
	let after = server.record.not_after + time::Duration::hours(1);
	assert!(matches!(
		validate_certificate(&server.record, before),
		Err(ValidationError::NotValidNow { .. })
	));
	assert!(matches!(
		validate_certificate(&server.record, after),
		Err(ValidationError::NotValidNow { .. })
	));
}

#[test]
fn chain_from_explicit_pools() {
	let ca = TestCa::new();
	let now = OffsetDateTime::now_utc();
	let server = ca.server_cert("vpn.example.com");
	validate_chain(&server.record, &[], &[ca.ca.record.clone()], now).unwrap();
	// Empty pools: no issuer.
	assert!(validate_chain(&server.record, &[], &[], now).is_err());
}

#[test]
fn crl_listing_and_window() {
	let ca = TestCa::new();
	let now = OffsetDateTime::now_utc();
	let server = ca.server_cert("vpn.example.com");
	let victim = ca.client_cert("victim");
	ca.manager
		.revoke(&victim.record.serial_number, RevocationReason::KeyCompromise)
		.unwrap();
	let crl_der = ca.generate_crl();
	let (_, crl) = x509_parser::parse_x509_crl(&crl_der).unwrap();
	validate_crl(&server.record, &crl, now).unwrap();
	assert!(matches!(
		validate_crl(&victim.record, &crl, now),
		Err(ValidationError::ListedOnCrl(_))
	));
	assert!(matches!(
		validate_crl(&server.record, &crl, now + time::Duration::days(30)),
		Err(ValidationError::CrlWindow)
	));
}

#[tokio::test]
async fn ocsp_without_responder_is_unknown() {
	let ca = TestCa::new();
	let server = ca.server_cert("vpn.example.com");
	let status = check_ocsp(&server.record, &ca.ca.record, &OcspOptions::default())
		.await
		.unwrap();
	assert_eq!(status, OcspStatus::Unknown);
}

fn policy(grace: Duration) -> RotationPolicy {
	RotationPolicy {
		minimum_validity: Duration::from_secs(3600),
		maximum_validity: Duration::from_secs(30 * 86400),
		renew_before: Duration::from_secs(3600),
		retry_interval: Duration::from_secs(1),
		grace_period: grace,
		rotation_interval: Duration::from_secs(60),
		kinds: vec![CertKind::Server],
	}
}

#[test]
fn should_rotate_boundary() {
	let ca = TestCa::new();
	let rotator = Rotator::new(ca.manager.clone(), policy(Duration::from_secs(2)));
	let server = ca.server_cert("vpn.example.com");
	// remaining == minimum_validity triggers renewal.
	let at_boundary = server.record.not_after - time::Duration::hours(1);
	assert!(rotator.should_rotate(&server.record, at_boundary));
	// remaining > minimum_validity does not.
	let before_boundary = at_boundary - time::Duration::seconds(10);
	assert!(!rotator.should_rotate(&server.record, before_boundary));
}

#[test]
fn rotate_swaps_and_pins_previous() {
	let ca = TestCa::new();
	let rotator = Rotator::new(ca.manager.clone(), policy(Duration::from_secs(2)));
	let server = ca.server_cert("vpn.example.com");
	rotator
		.initialize(CertKind::Server, &server.record.serial_number)
		.unwrap();

	let new = rotator.rotate(&server.record).unwrap();
	assert_ne!(new.serial_number, server.record.serial_number);
	assert_eq!(
		rotator.current(CertKind::Server).unwrap().record.serial_number,
		new.serial_number
	);
	assert_eq!(
		rotator.previous(CertKind::Server).unwrap().record.serial_number,
		server.record.serial_number
	);
	// Same subject and SANs on the reissued certificate.
	assert_eq!(new.sans, server.record.sans);
}

#[test]
fn grace_expiry_revokes_old() {
	let ca = TestCa::new();
	let rotator = Rotator::new(ca.manager.clone(), policy(Duration::from_secs(2)));
	let server = ca.server_cert("vpn.example.com");
	rotator
		.initialize(CertKind::Server, &server.record.serial_number)
		.unwrap();
	rotator.rotate(&server.record).unwrap();

	let now = OffsetDateTime::now_utc();
	// Before the grace deadline nothing expires.
	assert!(rotator.expire_grace(now).is_empty());
	assert!(rotator.previous(CertKind::Server).is_some());

	let revoked = rotator.expire_grace(now + time::Duration::seconds(3));
	assert_eq!(revoked, vec![server.record.serial_number.clone()]);
	assert!(rotator.previous(CertKind::Server).is_none());
	let old = ca.manager.store().load(&server.record.serial_number).unwrap();
	assert_eq!(old.record.status, CertStatus::Revoked);
	assert_eq!(
		old.record.revocation_reason,
		Some(RevocationReason::Superseded)
	);
}

#[test]
fn tick_rotates_due_certificates() {
	let ca = TestCa::new();
	let rotator = Rotator::new(ca.manager.clone(), policy(Duration::from_secs(0)));
	// Expires within renew_before.
	let server = ca.server_cert_expiring_in("vpn.example.com", time::Duration::minutes(30));
	rotator
		.initialize(CertKind::Server, &server.record.serial_number)
		.unwrap();

	rotator.tick(OffsetDateTime::now_utc());
	assert_eq!(rotator.rotations(), 1);
	let current = rotator.current(CertKind::Server).unwrap();
	assert_ne!(current.record.serial_number, server.record.serial_number);
	// current is never left empty.
	assert!(rotator.current(CertKind::Server).is_some());
}

#[tokio::test]
async fn rotation_loop_start_stop() {
	let ca = TestCa::new();
	let rotator = Rotator::new(ca.manager.clone(), policy(Duration::from_secs(1)));
	rotator.start();
	rotator.start(); // idempotent
	rotator.stop().await;
	// Reads still work after stop; nothing was ever initialized here.
	assert!(rotator.current(CertKind::Server).is_none());
}

#[test]
fn crl_lists_revoked_and_verifies_against_ca() {
	let ca = TestCa::new();
	let victim = ca.client_cert("victim");
	let bystander = ca.client_cert("bystander");
	ca.manager
		.revoke(&victim.record.serial_number, RevocationReason::KeyCompromise)
		.unwrap();

	let generator = CrlGenerator::new(ca.manager.clone(), ca.ca.record.serial_number.clone(), None);
	let der = generator.der().unwrap();
	let (_, crl) = x509_parser::parse_x509_crl(&der).unwrap();

	// Signed by the CA.
	let ca_cert = ca.ca.record.parse().unwrap();
	crl.verify_signature(ca_cert.public_key()).unwrap();

	let now = OffsetDateTime::now_utc();
	assert!(validate_crl(&victim.record, &crl, now).is_err());
	assert!(validate_crl(&bystander.record, &crl, now).is_ok());
}

#[test]
fn revocation_reflected_in_crl_count() {
	let ca = TestCa::new();
	let generator = CrlGenerator::new(ca.manager.clone(), ca.ca.record.serial_number.clone(), None);
	assert_eq!(generator.revoked_count().unwrap(), 0);

	let victim = ca.client_cert("victim");
	ca.manager
		.revoke(&victim.record.serial_number, RevocationReason::Superseded)
		.unwrap();
	// Manager-side revocations are picked up without an explicit regenerate.
	assert_eq!(generator.revoked_count().unwrap(), 1);
}

#[test]
fn crl_refresh_needed_after_next_update() {
	let ca = TestCa::new();
	let generator = CrlGenerator::new(
		ca.manager.clone(),
		ca.ca.record.serial_number.clone(),
		Some(Duration::from_secs(3600)),
	);
	assert!(generator.needs_refresh(OffsetDateTime::now_utc()));
	generator.regenerate().unwrap();
	let now = OffsetDateTime::now_utc();
	assert!(!generator.needs_refresh(now));
	assert!(generator.needs_refresh(now + time::Duration::hours(2)));
}

#[tokio::test]
async fn crl_http_surface() {
	use std::sync::Arc;

	use sssonector::cert::crl::CrlService;

	let ca = TestCa::new();
	let victim = ca.client_cert("victim");
	let generator = Arc::new(CrlGenerator::new(
		ca.manager.clone(),
		ca.ca.record.serial_number.clone(),
		None,
	));
	let service = CrlService::new(generator.clone(), ca.manager.clone());

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let router = service.router();
	let server = tokio::spawn(async move {
		axum::serve(listener, router).await.unwrap();
	});

	let client = reqwest::Client::new();
	let base = format!("http://{addr}");

	// DER by default, PEM when asked.
	let der = client.get(format!("{base}/crl")).send().await.unwrap();
	assert_eq!(der.status(), 200);
	assert_eq!(
		der.headers().get("content-type").unwrap(),
		"application/pkix-crl"
	);
	let pem = client
		.get(format!("{base}/crl"))
		.header("accept", "application/x-pem-file")
		.send()
		.await
		.unwrap();
	assert!(
		pem.text()
			.await
			.unwrap()
			.contains("-----BEGIN X509 CRL-----")
	);

	// Revoke then status reflects it.
	let resp = client
		.post(format!("{base}/revoke"))
		.json(&serde_json::json!({
			"serial": victim.record.serial_number,
			"reason": "key_compromise",
			"revoked_by": "ops",
		}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);

	let status: serde_json::Value = client
		.get(format!("{base}/status"))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert_eq!(status["revoked_count"], 1);

	// Bad input is a 400.
	let resp = client
		.post(format!("{base}/revoke"))
		.json(&serde_json::json!({"serial": "zz", "reason": "nope"}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 400);

	server.abort();
}
