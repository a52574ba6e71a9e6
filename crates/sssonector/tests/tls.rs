//! mTLS policy: handshakes over in-memory streams against the test CA.

use std::sync::Arc;

use rustls::{ClientConfig, ServerConfig};
use sssonector::cert::{CertKind, RevocationReason};
use sssonector::config::SecurityLevel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};

mod common;
use common::testca::TestCa;

async fn handshake(
	server: Arc<ServerConfig>,
	client: Arc<ClientConfig>,
) -> Result<
	(
		tokio_rustls::server::TlsStream<tokio::io::DuplexStream>,
		tokio_rustls::client::TlsStream<tokio::io::DuplexStream>,
	),
	std::io::Error,
> {
	let (client_io, server_io) = tokio::io::duplex(16 * 1024);
	let acceptor = TlsAcceptor::from(server);
	let connector = TlsConnector::from(client);
	let server_name = rustls_pki_types::ServerName::try_from("vpn.example.com").unwrap();
	let (s, c) = tokio::join!(
		acceptor.accept(server_io),
		connector.connect(server_name, client_io),
	);
	Ok((s?, c?))
}

#[tokio::test]
async fn mutual_tls13_handshake() {
	let ca = TestCa::new();
	let tls = ca.tls_manager(SecurityLevel::Modern);
	let (mut server_stream, mut client_stream) =
		handshake(tls.server_config().unwrap(), tls.client_config().unwrap())
			.await
			.unwrap();

	// Both ends pass the post-handshake policy hook.
	tls.verify_connection(server_stream.get_ref().1).unwrap();
	tls.verify_connection(client_stream.get_ref().1).unwrap();

	// Client cert was actually presented and verified.
	assert!(server_stream.get_ref().1.peer_certificates().is_some());

	client_stream.write_all(b"ping").await.unwrap();
	client_stream.flush().await.unwrap();
	let mut buf = [0u8; 4];
	server_stream.read_exact(&mut buf).await.unwrap();
	assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn revoked_client_fails_handshake() {
	let ca = TestCa::new();
	let tls = ca.tls_manager(SecurityLevel::Modern);
	// Build the client config before revocation; the cert itself is still in
	// the client's hands.
	let client_config = tls.client_config().unwrap();
	let client_serial = ca
		.manager
		.store()
		.list_by_kind(CertKind::Client)
		.unwrap()
		.first()
		.unwrap()
		.serial_number
		.clone();
	ca.manager
		.revoke(&client_serial, RevocationReason::KeyCompromise)
		.unwrap();
	// Server rebuilds its config and picks up the fresh CRL.
	let server_config = tls.server_config().unwrap();
	assert!(handshake(server_config, client_config).await.is_err());
}

#[tokio::test]
async fn wrong_server_name_rejected() {
	let ca = TestCa::new();
	let tls = ca.tls_manager(SecurityLevel::Modern);
	let (client_io, server_io) = tokio::io::duplex(16 * 1024);
	let acceptor = TlsAcceptor::from(tls.server_config().unwrap());
	let connector = TlsConnector::from(tls.client_config().unwrap());
	let bogus = rustls_pki_types::ServerName::try_from("other.example.com").unwrap();
	let (_, c) = tokio::join!(acceptor.accept(server_io), connector.connect(bogus, client_io));
	assert!(c.is_err());
}

#[tokio::test]
async fn client_without_cert_rejected() {
	let ca = TestCa::new();
	let tls = ca.tls_manager(SecurityLevel::Modern);
	// A client that trusts the CA but presents no certificate.
	let mut roots = rustls::RootCertStore::empty();
	roots
		.add(rustls_pki_types::CertificateDer::from(ca.ca.record.raw.clone()))
		.unwrap();
	let bare = ClientConfig::builder_with_provider(Arc::new(
		rustls::crypto::aws_lc_rs::default_provider(),
	))
	.with_protocol_versions(&[&rustls::version::TLS13])
	.unwrap()
	.with_root_certificates(roots)
	.with_no_client_auth();
	let result = handshake(tls.server_config().unwrap(), Arc::new(bare)).await;
	assert!(result.is_err());
}
