//! End-to-end tunnel scenarios: real TLS over localhost TCP, in-memory TUN
//! adapters on both sides.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sssonector::adapter::{AdapterError, TunAdapter, create_with_retry};
use sssonector::cert::RevocationReason;
use sssonector::cert::rotation::RotationPolicy;
use sssonector::config::{Config, SecurityLevel};
use sssonector::memory::MemoryManager;
use sssonector::tls::TlsManager;
use sssonector::tunnel::client::TunnelClient;
use sssonector::tunnel::server::TunnelServer;
use sssonector::tunnel::{AdapterFactory, EndpointState};

mod common;
use common::mock::{FlakyFactory, MockHandle, mock_adapter};
use common::testca::TestCa;

struct FixedFactory(Arc<dyn TunAdapter>);

#[async_trait]
impl AdapterFactory for FixedFactory {
	async fn create(&self) -> Result<Arc<dyn TunAdapter>, AdapterError> {
		Ok(self.0.clone())
	}
}

/// Factory whose device is "busy" for the first two attempts.
struct RetryingFactory {
	inner: Arc<FlakyFactory>,
	cfg: sssonector::config::AdapterConfig,
}

#[async_trait]
impl AdapterFactory for RetryingFactory {
	async fn create(&self) -> Result<Arc<dyn TunAdapter>, AdapterError> {
		let inner = self.inner.clone();
		create_with_retry(&self.cfg, move || {
			let inner = inner.clone();
			async move { inner.create().await }
		})
		.await
	}
}

fn server_config(port: u16, mtu: u16) -> Arc<Config> {
	let raw = format!(
		r#"
mode: server
network:
  interface: tun-srv
  mtu: {mtu}
  address: 10.0.0.1/24
tunnel:
  listen_address: 127.0.0.1
  listen_port: {port}
  max_clients: 4
"#
	);
	Arc::new(Config::from_yaml(&raw).unwrap())
}

fn client_config(server_port: u16, mtu: u16) -> Arc<Config> {
	let raw = format!(
		r#"
mode: client
network:
  interface: tun-cli
  mtu: {mtu}
  address: 10.0.0.2/24
tunnel:
  server: 127.0.0.1:{server_port}
  server_name: vpn.example.com
  max_retries: 3
  retry_delay: 100ms
"#
	);
	Arc::new(Config::from_yaml(&raw).unwrap())
}

struct Tunnel {
	server: TunnelServer,
	client: TunnelClient,
	server_tun: MockHandle,
	client_tun: MockHandle,
	tls: Arc<TlsManager>,
	ca: TestCa,
}

async fn establish(level: SecurityLevel, rotation: RotationPolicy) -> Tunnel {
	let ca = TestCa::new();
	let (tls, _) = ca.tls_stack(level, rotation);
	let tls = Arc::new(tls);
	let memory = MemoryManager::new(&Default::default());

	let (server_adapter, server_tun) = mock_adapter("tun-srv", 1500, "10.0.0.1/24");
	let (client_adapter, client_tun) = mock_adapter("tun-cli", 1500, "10.0.0.2/24");

	let server = TunnelServer::new(
		server_config(0, 1500),
		tls.clone(),
		Arc::new(FixedFactory(server_adapter)),
		memory.clone(),
	);
	server.start().await.unwrap();
	let port = server.local_addr().unwrap().port();

	let client = TunnelClient::new(
		client_config(port, 1500),
		tls.clone(),
		Arc::new(FixedFactory(client_adapter)),
		memory,
	);
	client.start().await.unwrap();

	Tunnel {
		server,
		client,
		server_tun,
		client_tun,
		tls,
		ca,
	}
}

/// Push one packet client→server through the tunnel and assert delivery.
async fn ping(t: &mut Tunnel, payload: &[u8]) {
	t.client_tun.to_adapter.send(payload.to_vec()).await.unwrap();
	let received = tokio::time::timeout(Duration::from_secs(5), t.server_tun.from_adapter.recv())
		.await
		.expect("packet crosses the tunnel")
		.unwrap();
	assert_eq!(received, payload);
}

#[tokio::test]
async fn handshake_and_ping() {
	let mut t = establish(SecurityLevel::Modern, RotationPolicy::default()).await;
	assert_eq!(t.server.state(), EndpointState::Running);
	assert_eq!(t.client.state(), EndpointState::Running);

	// Twenty pings, zero loss, in order.
	for i in 0..20u8 {
		ping(&mut t, &[i; 64]).await;
	}

	// And the reverse direction.
	t.server_tun.to_adapter.send(vec![0xEE; 128]).await.unwrap();
	let back = tokio::time::timeout(Duration::from_secs(5), t.client_tun.from_adapter.recv())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(back, vec![0xEE; 128]);

	let up = t.client.metrics().snapshot();
	assert_eq!(up.packets_up, 20);
	assert_eq!(up.packets_down, 1);

	t.client.stop().await.unwrap();
	t.server.stop().await.unwrap();
	assert_eq!(t.server.state(), EndpointState::Stopped);
}

#[tokio::test]
async fn lifecycle_is_idempotent_and_restartable() {
	let t = establish(SecurityLevel::Modern, RotationPolicy::default()).await;
	let server = t.server;
	// Stop twice: second is a no-op.
	server.stop().await.unwrap();
	server.stop().await.unwrap();
	assert_eq!(server.state(), EndpointState::Stopped);
	// Start after stop succeeds (fresh run state).
	server.start().await.unwrap();
	assert_eq!(server.state(), EndpointState::Running);
	// Start while running is rejected.
	assert!(server.start().await.is_err());
	server.stop().await.unwrap();
}

#[tokio::test]
async fn revoked_client_rejected_on_next_dial_but_session_survives() {
	let mut t = establish(SecurityLevel::Modern, RotationPolicy::default()).await;
	ping(&mut t, b"before revocation").await;

	// Revoke the client certificate mid-session.
	let client_serial = t
		.ca
		.store
		.list_by_kind(sssonector::cert::CertKind::Client)
		.unwrap()
		.first()
		.unwrap()
		.serial_number
		.clone();
	t.ca
		.manager
		.revoke(&client_serial, RevocationReason::KeyCompromise)
		.unwrap();

	// The established session keeps flowing.
	ping(&mut t, b"after revocation").await;

	// A fresh dial by the same client is rejected at the handshake.
	let port = t.server.local_addr().unwrap().port();
	let (second_adapter, _h) = mock_adapter("tun-cli2", 1500, "10.0.0.3/24");
	let second = TunnelClient::new(
		client_config(port, 1500),
		t.tls.clone(),
		Arc::new(FixedFactory(second_adapter)),
		MemoryManager::new(&Default::default()),
	);
	assert!(second.start().await.is_err());
	assert_eq!(second.state(), EndpointState::Stopped);

	t.client.stop().await.unwrap();
	t.server.stop().await.unwrap();
}

#[tokio::test]
async fn rotation_presents_new_serial_to_new_dials_only() {
	let ca = TestCa::new();
	let (tls, rotator) = ca.tls_stack(
		SecurityLevel::Modern,
		RotationPolicy {
			grace_period: Duration::from_secs(2),
			..Default::default()
		},
	);
	let tls = Arc::new(tls);
	let memory = MemoryManager::new(&Default::default());
	let (server_adapter, mut server_tun) = mock_adapter("tun-srv", 1500, "10.0.0.1/24");
	let (client_adapter, mut client_tun) = mock_adapter("tun-cli", 1500, "10.0.0.2/24");

	let server = TunnelServer::new(
		server_config(0, 1500),
		tls.clone(),
		Arc::new(FixedFactory(server_adapter)),
		memory.clone(),
	);
	server.start().await.unwrap();
	let port = server.local_addr().unwrap().port();

	let client = TunnelClient::new(
		client_config(port, 1500),
		tls.clone(),
		Arc::new(FixedFactory(client_adapter)),
		memory.clone(),
	);
	client.start().await.unwrap();

	let old = rotator
		.current(sssonector::cert::CertKind::Server)
		.unwrap();
	let new = rotator.rotate(&old.record).unwrap();
	assert_ne!(new.serial_number, old.record.serial_number);
	// Old cert still pinned for the grace interval.
	assert!(
		rotator
			.previous(sssonector::cert::CertKind::Server)
			.is_some()
	);

	// The long-lived session is unaffected.
	client_tun.to_adapter.send(b"still alive".to_vec()).await.unwrap();
	let got = tokio::time::timeout(Duration::from_secs(5), server_tun.from_adapter.recv())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(got, b"still alive");

	// A new dial sees the new serial.
	let tcp = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
	let connector = tokio_rustls::TlsConnector::from(tls.client_config().unwrap());
	let name = rustls_pki_types::ServerName::try_from("vpn.example.com").unwrap();
	let stream = connector.connect(name, tcp).await.unwrap();
	let presented = stream.get_ref().1.peer_certificates().unwrap()[0].clone();
	let (_, parsed) = x509_parser::parse_x509_certificate(&presented).unwrap();
	assert_eq!(hex::encode(parsed.raw_serial()), new.serial_number);

	client.stop().await.unwrap();
	server.stop().await.unwrap();
}

#[tokio::test]
async fn adapter_busy_then_ready_within_deadline() {
	let ca = TestCa::new();
	let (tls, _) = ca.tls_stack(SecurityLevel::Modern, RotationPolicy::default());
	let tls = Arc::new(tls);
	let (flaky, _handle_rx) = FlakyFactory::new(2, 1500, "10.0.0.1/24");
	let factory = RetryingFactory {
		inner: flaky.clone(),
		cfg: sssonector::config::AdapterConfig {
			retry_attempts: 3,
			retry_delay: Duration::from_millis(200),
			cleanup_timeout: Duration::from_secs(5),
		},
	};
	let server = TunnelServer::new(
		server_config(0, 1500),
		tls,
		Arc::new(factory),
		MemoryManager::new(&Default::default()),
	);
	let started = std::time::Instant::now();
	server.start().await.unwrap();
	assert_eq!(server.state(), EndpointState::Running);
	assert!(started.elapsed() < Duration::from_secs(2));
	assert_eq!(flaky.calls(), 3);
	server.stop().await.unwrap();
}

#[tokio::test]
async fn adapter_create_failure_is_fatal_and_restores_stopped() {
	let ca = TestCa::new();
	let (tls, _) = ca.tls_stack(SecurityLevel::Modern, RotationPolicy::default());
	let (flaky, _rx) = FlakyFactory::new(u32::MAX, 1500, "10.0.0.1/24");
	let factory = RetryingFactory {
		inner: flaky,
		cfg: sssonector::config::AdapterConfig {
			retry_attempts: 2,
			retry_delay: Duration::from_millis(10),
			cleanup_timeout: Duration::from_secs(1),
		},
	};
	let server = TunnelServer::new(
		server_config(0, 1500),
		Arc::new(tls),
		Arc::new(factory),
		MemoryManager::new(&Default::default()),
	);
	assert!(server.start().await.is_err());
	assert_eq!(server.state(), EndpointState::Stopped);
	// A later start may proceed.
	assert!(server.start().await.is_err());
}
