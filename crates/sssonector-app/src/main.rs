use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sssonector::adapter::AdapterError;
use sssonector::cert::crl::{CrlGenerator, CrlService};
use sssonector::cert::manager::{CertificateManager, IssuancePolicy};
use sssonector::cert::rotation::{RotationPolicy, Rotator};
use sssonector::cert::store::CertificateStore;
use sssonector::cert::CertKind;
use sssonector::config::{Config, Mode, SecurityLevel};
use sssonector::memory::MemoryManager;
use sssonector::tls::TlsManager;
use sssonector::tunnel::client::TunnelClient;
use sssonector::tunnel::server::TunnelServer;
use sssonector::tunnel::AdapterFactory;
use sssonector::{Error, ErrorKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "sssonector", about = "Point-to-point layer-3 VPN over mutual TLS")]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(short, long)]
	config: PathBuf,

	/// Serve the CRL endpoints on this address.
	#[arg(long)]
	crl_listen: Option<SocketAddr>,

	/// Log filter, e.g. "info" or "sssonector=debug".
	#[arg(long, default_value = "info")]
	log_level: String,
}

fn init_logging(filter: &str) {
	use tracing_subscriber::prelude::*;
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer())
		.init();
}

struct NativeFactory {
	network: sssonector::config::NetworkConfig,
	adapter: sssonector::config::AdapterConfig,
}

#[async_trait::async_trait]
impl AdapterFactory for NativeFactory {
	#[cfg(feature = "tun-device")]
	async fn create(
		&self,
	) -> Result<Arc<dyn sssonector::adapter::TunAdapter>, AdapterError> {
		let adapter =
			sssonector::adapter::device::NativeAdapter::create(&self.network, &self.adapter).await?;
		Ok(adapter)
	}

	#[cfg(not(feature = "tun-device"))]
	async fn create(
		&self,
	) -> Result<Arc<dyn sssonector::adapter::TunAdapter>, AdapterError> {
		let _ = (&self.network, &self.adapter);
		Err(AdapterError::Create {
			attempts: 0,
			last: "built without the tun-device feature".to_string(),
		})
	}
}

fn load_identity(
	cfg: &Config,
	manager: &Arc<CertificateManager>,
	rotator: &Arc<Rotator>,
) -> anyhow::Result<String> {
	let tunnel = &cfg.tunnel;
	let (cert_file, key_file) = match (&tunnel.cert_file, &tunnel.key_file) {
		(Some(c), Some(k)) => (c, k),
		_ => anyhow::bail!("tunnel.cert_file and tunnel.key_file are required"),
	};
	if let Some(ca_file) = &tunnel.ca_file {
		let ca_pem = std::fs::read_to_string(ca_file)
			.with_context(|| format!("reading {}", ca_file.display()))?;
		manager
			.import_trust_anchor(&ca_pem)
			.context("importing CA certificate")?;
	}
	let cert_pem = std::fs::read_to_string(cert_file)
		.with_context(|| format!("reading {}", cert_file.display()))?;
	let key_pem = std::fs::read_to_string(key_file)
		.with_context(|| format!("reading {}", key_file.display()))?;
	let imported = manager
		.import_pem(&cert_pem, &key_pem)
		.context("importing endpoint certificate")?;
	let kind = match cfg.mode {
		Mode::Server => CertKind::Server,
		Mode::Client => CertKind::Client,
	};
	if imported.record.kind != kind {
		anyhow::bail!(
			"configured certificate is a {} certificate, mode needs {}",
			imported.record.kind,
			kind
		);
	}
	rotator.initialize(kind, &imported.record.serial_number)?;
	Ok(imported.record.serial_number)
}

async fn run(args: Args) -> Result<(), Error> {
	let raw = std::fs::read_to_string(&args.config)
		.map_err(|e| Error::new(ErrorKind::Configuration, "config", "read", e))?;
	let cfg = Config::from_yaml(&raw)
		.map_err(|e| Error::new(ErrorKind::Configuration, "config", "parse", e.to_string()))?;
	let cfg = Arc::new(cfg);

	let memory = MemoryManager::new(&cfg.memory);
	memory.start_monitor();

	let store_dir = cfg
		.security
		.cert_store_dir
		.clone()
		.unwrap_or_else(|| PathBuf::from("/var/lib/sssonector"));
	let key_material = match &cfg.security.store_key_file {
		Some(path) => std::fs::read(path)
			.map_err(|e| Error::new(ErrorKind::Configuration, "cert_store", "read_key", e))?,
		None => {
			return Err(Error::new(
				ErrorKind::Configuration,
				"cert_store",
				"read_key",
				"security.store_key_file is required",
			));
		},
	};
	let store = Arc::new(
		CertificateStore::open(&store_dir, &key_material)
			.map_err(|e| Error::new(ErrorKind::Resource, "cert_store", "open", e))?,
	);
	let manager = Arc::new(CertificateManager::new(
		store.clone(),
		IssuancePolicy {
			key_algorithm: cfg.security.key_algorithm,
			..Default::default()
		},
	));
	let rotator = Rotator::new(
		manager.clone(),
		RotationPolicy {
			rotation_interval: cfg.security.cert_rotation.interval,
			..Default::default()
		},
	);

	load_identity(&cfg, &manager, &rotator)
		.map_err(|e| Error::new(ErrorKind::Security, "certificates", "load", e.to_string()))?;
	if cfg.security.cert_rotation.enabled {
		rotator.start();
	}

	let level = cfg.security.tls.security_level;
	if level == SecurityLevel::Old {
		warn!("security level \"old\" is insecure and intended only for interop");
	}

	let crl_cancel = CancellationToken::new();
	let mut crl_task = None;
	let crl_generator = store
		.list_by_kind(CertKind::Ca)
		.ok()
		.and_then(|cas| cas.first().cloned())
		.map(|ca| Arc::new(CrlGenerator::new(manager.clone(), ca.serial_number, None)));
	if let (Some(listen), Some(generator)) = (args.crl_listen, crl_generator.clone()) {
		let service = CrlService::new(generator, manager.clone());
		let cancel = crl_cancel.clone();
		crl_task = Some(tokio::spawn(async move {
			if let Err(e) = service.serve(listen, cancel).await {
				error!(error = %e, "CRL service failed");
			}
		}));
	}

	let tls = Arc::new(TlsManager::new(
		rotator.clone(),
		store.clone(),
		crl_generator,
		level,
	));
	let factory = Arc::new(NativeFactory {
		network: cfg.network.clone(),
		adapter: cfg.adapter.clone(),
	});

	let result = match cfg.mode {
		Mode::Server => {
			let server = TunnelServer::new(cfg.clone(), tls, factory, memory.clone());
			server
				.start()
				.await
				.map_err(|e| Error::new(ErrorKind::Fatal, "tunnel_server", "start", e.to_string()))?;
			info!("server up; press ctrl-c to stop");
			wait_for_shutdown().await;
			server
				.stop()
				.await
				.map_err(|e| Error::new(ErrorKind::State, "tunnel_server", "stop", e.to_string()))
		},
		Mode::Client => {
			let client = TunnelClient::new(cfg.clone(), tls, factory, memory.clone());
			client
				.start()
				.await
				.map_err(|e| Error::new(ErrorKind::Fatal, "tunnel_client", "start", e.to_string()))?;
			info!("client up; press ctrl-c to stop");
			wait_for_shutdown().await;
			client
				.stop()
				.await
				.map_err(|e| Error::new(ErrorKind::State, "tunnel_client", "stop", e.to_string()))
		},
	};

	crl_cancel.cancel();
	if let Some(task) = crl_task {
		let _ = task.await;
	}
	rotator.stop().await;
	memory.stop().await;
	result
}

async fn wait_for_shutdown() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(unix)]
	{
		let mut term =
			tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
				.expect("install SIGTERM handler");
		tokio::select! {
			_ = ctrl_c => {},
			_ = term.recv() => {},
		}
	}
	#[cfg(not(unix))]
	{
		let _ = ctrl_c.await;
	}
}

#[tokio::main]
async fn main() {
	let args = Args::parse();
	init_logging(&args.log_level);
	if let Err(e) = run(args).await {
		// One line naming the failed component and error kind.
		eprintln!("sssonector: {}", e.diagnostic());
		std::process::exit(1);
	}
}
