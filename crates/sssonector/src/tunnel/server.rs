//! Tunnel server: listener, per-connection mTLS, shared adapter ownership.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
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
	accept_task: tokio::task::JoinHandle<()>,
}

pub struct TunnelServer {
	cfg: Arc<Config>,
	tls: Arc<TlsManager>,
	factory: Arc<dyn AdapterFactory>,
	memory: Arc<MemoryManager>,
	state: StateMachine,
	logger: StartupLogger,
	pool: BufferPool,
	metrics: Arc<TransferMetrics>,
	active_clients: Arc<AtomicUsize>,
	run: Mutex<Option<Run>>,
	local_addr: Mutex<Option<std::net::SocketAddr>>,
}

impl TunnelServer {
	pub fn new(
		cfg: Arc<Config>,
		tls: Arc<TlsManager>,
		factory: Arc<dyn AdapterFactory>,
		memory: Arc<MemoryManager>,
	) -> TunnelServer {
		TunnelServer {
			cfg,
			tls,
			factory,
			memory,
			state: StateMachine::new(),
			logger: StartupLogger::new("tunnel_server"),
			pool: BufferPool::new(),
			metrics: Arc::new(TransferMetrics::default()),
			active_clients: Arc::new(AtomicUsize::new(0)),
			run: Mutex::new(None),
			local_addr: Mutex::new(None),
		}
	}

	pub fn state(&self) -> EndpointState {
		self.state.current()
	}

	pub fn metrics(&self) -> &Arc<TransferMetrics> {
		&self.metrics
	}

	/// Bound listener address, once Running. Useful when the config asked
	/// for port 0.
	pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
		*self.local_addr.lock()
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
				// Adapter failure is fatal to start; restore Stopped.
				self.state.set_stopped();
				return Err(e.into());
			},
		};
		info!(
			interface = adapter.name(),
			status = %adapter.status(),
			mtu = adapter.mtu(),
			"adapter ready"
		);

		self.logger.enter_phase(Phase::Connection);
		let bind = self.cfg.tunnel.listen()?;
		let listener = match self
			.logger
			.log_operation("bind_listener", async { TcpListener::bind(bind).await })
			.await
		{
			Ok(l) => l,
			Err(e) => {
				let _ = adapter.cleanup().await;
				self.state.set_stopped();
				return Err(e.into());
			},
		};
		*self.local_addr.lock() = listener.local_addr().ok();

		// Fail fast if no usable server identity exists; per-connection
		// configs are rebuilt so rotations apply to new handshakes.
		if let Err(e) = self
			.logger
			.log_operation_sync("build_tls_config", || self.tls.server_config())
		{
			let _ = adapter.cleanup().await;
			self.state.set_stopped();
			return Err(e.into());
		}

		let cancel = CancellationToken::new();
		let accept_task = tokio::spawn(accept_loop(
			listener,
			adapter.clone(),
			self.cfg.clone(),
			self.tls.clone(),
			self.pool.clone(),
			self.memory.clone(),
			self.metrics.clone(),
			self.active_clients.clone(),
			cancel.clone(),
		));

		self.state.set_running()?;
		self.logger.enter_phase(Phase::Ready);
		info!(addr = %bind, "tunnel server running");
		*self.run.lock() = Some(Run {
			cancel,
			adapter,
			accept_task,
		});
		Ok(())
	}

	/// Stop the listener, drain transfers, clean up the adapter. Idempotent.
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
				.log_operation("join_accept_loop", async {
					run.accept_task.await.map_err(std::io::Error::other)
				})
				.await;
			let _ = self
				.logger
				.log_operation("cleanup_adapter", run.adapter.cleanup())
				.await;
		}
		self.state.set_stopped();
		info!("tunnel server stopped");
		Ok(())
	}
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
	listener: TcpListener,
	adapter: Arc<dyn TunAdapter>,
	cfg: Arc<Config>,
	tls: Arc<TlsManager>,
	pool: BufferPool,
	memory: Arc<MemoryManager>,
	metrics: Arc<TransferMetrics>,
	active: Arc<AtomicUsize>,
	cancel: CancellationToken,
) {
	let mut connections: JoinSet<()> = JoinSet::new();
	loop {
		let accepted = tokio::select! {
			_ = cancel.cancelled() => break,
			accepted = listener.accept() => accepted,
		};
		let (tcp, peer) = match accepted {
			Ok(pair) => pair,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			},
		};
		if active.load(Ordering::Relaxed) >= cfg.tunnel.max_clients {
			warn!(%peer, max = cfg.tunnel.max_clients, "client limit reached, refusing connection");
			continue;
		}
		active.fetch_add(1, Ordering::Relaxed);
		let conn_active = active.clone();
		let conn = ServerConnection {
			adapter: adapter.clone(),
			cfg: cfg.clone(),
			tls: tls.clone(),
			pool: pool.clone(),
			memory: memory.clone(),
			metrics: metrics.clone(),
			cancel: cancel.child_token(),
		};
		connections.spawn(async move {
			if let Err(e) = conn.handle(tcp, peer).await {
				// Per-connection failures never stop the accept loop.
				warn!(%peer, error = %e, "connection ended with error");
			}
			conn_active.fetch_sub(1, Ordering::Relaxed);
		});
	}
	// Drain in-flight transfers before reporting the loop done.
	connections.shutdown().await;
}

struct ServerConnection {
	adapter: Arc<dyn TunAdapter>,
	cfg: Arc<Config>,
	tls: Arc<TlsManager>,
	pool: BufferPool,
	memory: Arc<MemoryManager>,
	metrics: Arc<TransferMetrics>,
	cancel: CancellationToken,
}

impl ServerConnection {
	async fn handle(self, tcp: TcpStream, peer: std::net::SocketAddr) -> Result<(), TunnelError> {
		tcp.set_nodelay(true)?;
		if self.cfg.tunnel.keep_alive {
			let keepalive = socket2::TcpKeepalive::new().with_time(std::time::Duration::from_secs(30));
			socket2::SockRef::from(&tcp).set_tcp_keepalive(&keepalive)?;
		}
		// Rebuilt per connection so rotated certificates and fresh CRLs
		// apply to every new handshake.
		let acceptor = TlsAcceptor::from(self.tls.server_config()?);
		let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp))
			.await
			.map_err(|_| TunnelError::HandshakeTimeout)??;
		self.tls.verify_connection(stream.get_ref().1)?;
		info!(%peer, "client connected");

		let transfer = Transfer {
			mtu: self.cfg.network.mtu as usize,
			limiter: RateLimiter::new(self.cfg.tunnel.upload_kbps, self.cfg.tunnel.download_kbps),
			pool: self.pool,
			memory: Some(self.memory),
			metrics: self.metrics,
			cancel: self.cancel,
		};
		transfer
			.run(self.adapter, stream)
			.await
			.map_err(|e| TunnelError::Io(std::io::Error::other(e)))?;
		info!(%peer, "client disconnected");
		Ok(())
	}
}
