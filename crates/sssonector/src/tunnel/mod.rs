//! Tunnel endpoints: the shared lifecycle state machine, the packet pump and
//! the server/client implementations.

pub mod client;
pub mod server;
pub mod transfer;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::adapter::{AdapterError, TunAdapter};
use crate::config::ConfigError;
use crate::tls::TlsError;

/// TLS handshake deadline for both accept and dial paths.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
	#[error("adapter: {0}")]
	Adapter(#[from] AdapterError),
	#[error("tls: {0}")]
	Tls(#[from] TlsError),
	#[error("config: {0}")]
	Config(#[from] ConfigError),
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("invalid state: {0}")]
	State(String),
	#[error("all {attempts} dial attempts to {target} failed: {last}")]
	DialExhausted {
		target: String,
		attempts: u32,
		last: String,
	},
	#[error("tls handshake timed out")]
	HandshakeTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
	Stopped,
	Starting,
	Running,
	Stopping,
}

impl fmt::Display for EndpointState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			EndpointState::Stopped => "stopped",
			EndpointState::Starting => "starting",
			EndpointState::Running => "running",
			EndpointState::Stopping => "stopping",
		};
		f.write_str(s)
	}
}

/// Endpoint lifecycle: Stopped→Starting→Running→Stopping→Stopped, no state
/// skipped, transitions totally ordered under the mutex.
pub struct StateMachine {
	state: Mutex<EndpointState>,
}

impl StateMachine {
	pub fn new() -> StateMachine {
		StateMachine {
			state: Mutex::new(EndpointState::Stopped),
		}
	}

	pub fn current(&self) -> EndpointState {
		*self.state.lock()
	}

	/// Stopped→Starting; concurrent starts are rejected.
	pub fn begin_start(&self) -> Result<(), TunnelError> {
		let mut state = self.state.lock();
		match *state {
			EndpointState::Stopped => {
				*state = EndpointState::Starting;
				Ok(())
			},
			other => Err(TunnelError::State(format!(
				"cannot start while {other}"
			))),
		}
	}

	/// Starting→Running.
	pub fn set_running(&self) -> Result<(), TunnelError> {
		let mut state = self.state.lock();
		match *state {
			EndpointState::Starting => {
				*state = EndpointState::Running;
				Ok(())
			},
			other => Err(TunnelError::State(format!(
				"cannot enter running from {other}"
			))),
		}
	}

	/// Running|Starting→Stopping. Returns false when already stopped (stop
	/// is idempotent) or a stop is in flight.
	pub fn begin_stop(&self) -> bool {
		let mut state = self.state.lock();
		match *state {
			EndpointState::Running | EndpointState::Starting => {
				*state = EndpointState::Stopping;
				true
			},
			EndpointState::Stopping | EndpointState::Stopped => false,
		}
	}

	/// Any state → Stopped. Used both by the normal stop path and to restore
	/// Stopped after a failed start.
	pub fn set_stopped(&self) {
		*self.state.lock() = EndpointState::Stopped;
	}
}

impl Default for StateMachine {
	fn default() -> Self {
		StateMachine::new()
	}
}

/// Creates the endpoint's TUN adapter. Injected so tests (and platforms
/// without `/dev/net/tun`) can supply their own device.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
	async fn create(&self) -> Result<Arc<dyn TunAdapter>, AdapterError>;
}

/// Byte/packet counters for one endpoint, shared across its transfers.
#[derive(Debug, Default)]
pub struct TransferMetrics {
	pub bytes_up: AtomicU64,
	pub bytes_down: AtomicU64,
	pub packets_up: AtomicU64,
	pub packets_down: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
	pub bytes_up: u64,
	pub bytes_down: u64,
	pub packets_up: u64,
	pub packets_down: u64,
}

impl TransferMetrics {
	pub fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			bytes_up: self.bytes_up.load(Ordering::Relaxed),
			bytes_down: self.bytes_down.load(Ordering::Relaxed),
			packets_up: self.packets_up.load(Ordering::Relaxed),
			packets_down: self.packets_down.load(Ordering::Relaxed),
		}
	}
}
