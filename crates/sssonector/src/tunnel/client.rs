//! Tunnel client: dial with retries, mTLS, single transfer.

use std::sync::Arc;

use parking_lot::Mutex;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::transfer::Transfer;
use super::{
	AdapterFactory, EndpointState, HANDSHAKE_TIMEOUT, StateMachine, TransferMetrics, TunnelError,
};
use crate::adapter::TunAdapter;
use crate::buffers::BufferPool;
use crate::config::Config;
use crate::memory::MemoryManager;
use crate::ratelimit::RateLimiter;
use crate::telemetry::startup::{Phase, StartupLogger};
use crate::tls::TlsManager;

struct Run {
	cancel: CancellationToken,
	adapter: Arc<dyn TunAdapter>,
	transfer_task: tokio::task::JoinHandle<()>,
}

pub struct TunnelClient {
	cfg: Arc<Config>,
	tls: Arc<TlsManager>,
	factory: Arc<dyn AdapterFactory>,
	memory: Arc<MemoryManager>,
	state: StateMachine,
	logger: StartupLogger,
	pool: BufferPool,
	metrics: Arc<TransferMetrics>,
	run: Mutex<Option<Run>>,
}

impl TunnelClient {
	pub fn new(
		cfg: Arc<Config>,
		tls: Arc<TlsManager>,
		factory: Arc<dyn AdapterFactory>,
		memory: Arc<MemoryManager>,
	) -> TunnelClient {
		TunnelClient {
			cfg,
			tls,
			factory,
			memory,
			state: StateMachine::new(),
			logger: StartupLogger::new("tunnel_client"),
			pool: BufferPool::new(),
			metrics: Arc::new(TransferMetrics::default()),
			run: Mutex::new(None),
		}
	}

	pub fn state(&self) -> EndpointState {
		self.state.current()
	}

	pub fn metrics(&self) -> &Arc<TransferMetrics> {
		&self.metrics
	}

	async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, TunnelError> {
		let target = format!("{host}:{port}");
		let attempts = self.cfg.tunnel.max_retries.max(1);
		let mut last = String::new();
		for attempt in 1..=attempts {
			match TcpStream::connect(&target).await {
				Ok(tcp) => {
					info!(%target, attempt, "connected");
					return Ok(tcp);
				},
				Err(e) => {
					warn!(%target, attempt, of = attempts, error = %e, "dial failed");
					last = e.to_string();
				},
			}
			if attempt < attempts {
				tokio::time::sleep(self.cfg.tunnel.retry_delay).await;
			}
		}
		Err(TunnelError::DialExhausted {
			target,
			attempts,
			last,
		})
	}

	pub async fn start(&self) -> Result<(), TunnelError> {
		self
			.logger
			.log_operation_sync("state_start", || self.state.begin_start())?;
		self.logger.enter_phase(Phase::Initialization);

		let adapter = match self
			.logger
			.log_operation("create_adapter", self.factory.create())
			.await
		{
			Ok(adapter) => adapter,
			Err(e) => {
				self.state.set_stopped();
				return Err(e.into());
			},
		};
		info!(
			interface = adapter.name(),
			status = %adapter.status(),
			"adapter ready"
		);

		self.logger.enter_phase(Phase::Connection);
		let result = self.connect().await;
		let stream = match result {
			Ok(stream) => stream,
			Err(e) => {
				let _ = adapter.cleanup().await;
				self.state.set_stopped();
				return Err(e);
			},
		};

		let cancel = CancellationToken::new();
		let transfer = Transfer {
			mtu: self.cfg.network.mtu as usize,
			limiter: RateLimiter::new(self.cfg.tunnel.upload_kbps, self.cfg.tunnel.download_kbps),
			pool: self.pool.clone(),
			memory: Some(self.memory.clone()),
			metrics: self.metrics.clone(),
			cancel: cancel.clone(),
		};
		let transfer_adapter = adapter.clone();
		let transfer_task = tokio::spawn(async move {
			if let Err(e) = transfer.run(transfer_adapter, stream).await {
				warn!(error = %e, "transfer ended with error");
			}
		});

		self.state.set_running()?;
		self.logger.enter_phase(Phase::Ready);
		info!("tunnel client running");
		*self.run.lock() = Some(Run {
			cancel,
			adapter,
			transfer_task,
		});
		Ok(())
	}

	async fn connect(&self) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TunnelError> {
		let (host, port) = self.cfg.tunnel.peer_target()?;
		let tcp = self
			.logger
			.log_operation("dial", self.dial(&host, port))
			.await?;
		tcp.set_nodelay(true)?;
		if self.cfg.tunnel.keep_alive {
			let keepalive = socket2::TcpKeepalive::new().with_time(std::time::Duration::from_secs(30));
			socket2::SockRef::from(&tcp).set_tcp_keepalive(&keepalive)?;
		}

		let server_name = self.cfg.tunnel.tls_server_name()?;
		let server_name = ServerName::try_from(server_name)
			.map_err(|e| TunnelError::State(format!("invalid server name: {e}")))?;
		let connector = TlsConnector::from(self.tls.client_config()?);
		let stream = self
			.logger
			.log_operation("tls_handshake", async {
				tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
					.await
					.map_err(|_| TunnelError::HandshakeTimeout)?
					.map_err(TunnelError::from)
			})
			.await?;
		self.tls.verify_connection(stream.get_ref().1)?;
		Ok(stream)
	}

	/// Close the socket, join the transfer, clean up the adapter. Idempotent.
	pub async fn stop(&self) -> Result<(), TunnelError> {
		if !self.state.begin_stop() {
			return Ok(());
		}
		self.logger.enter_phase(Phase::Shutdown);
		let run = self.run.lock().take();
		if let Some(run) = run {
			run.cancel.cancel();
			let _ = self
				.logger
				.log_operation("join_transfer", async {
					run.transfer_task.await.map_err(std::io::Error::other)
				})
				.await;
			let _ = self
				.logger
				.log_operation("cleanup_adapter", run.adapter.cleanup())
				.await;
		}
		self.state.set_stopped();
		info!("tunnel client stopped");
		Ok(())
	}
}
