//! TUN adapter contract and lifecycle.
//!
//! An adapter is a layer-3 virtual interface: one IP packet per `recv`/`send`
//! call, never coalesced. Only `Ready` accepts traffic; `cleanup` is
//! idempotent and unblocks any in-flight reads or writes with a definite
//! end-of-stream error.

#[cfg(feature = "tun-device")]
pub mod device;

use std::fmt;

use async_trait::async_trait;
use ipnet::IpNet;
use tracing::{info, warn};

use crate::config::AdapterConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
	Uninitialized,
	Initializing,
	Ready,
	/// Terminal until `cleanup` restores `Closed`.
	Error,
	Closing,
	Closed,
}

impl fmt::Display for AdapterState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			AdapterState::Uninitialized => "uninitialized",
			AdapterState::Initializing => "initializing",
			AdapterState::Ready => "ready",
			AdapterState::Error => "error",
			AdapterState::Closing => "closing",
			AdapterState::Closed => "closed",
		};
		f.write_str(s)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
	#[error("device creation failed after {attempts} attempts: {last}")]
	Create { attempts: u32, last: String },
	#[error("adapter is closed")]
	Closed,
	#[error("adapter not ready ({0})")]
	NotReady(AdapterState),
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("packet of {len} bytes exceeds mtu {mtu}")]
	OversizedPacket { len: usize, mtu: u16 },
}

impl AdapterError {
	/// True when the error simply means the device has gone away and the
	/// endpoint should run its stop path.
	pub fn is_end_of_stream(&self) -> bool {
		matches!(self, AdapterError::Closed)
	}
}

/// A layer-3 TUN device. Implementations are safe for one concurrent reader
/// plus one concurrent writer.
#[async_trait]
pub trait TunAdapter: Send + Sync {
	/// Read one packet. Blocks until a packet, cleanup, or device error.
	async fn recv(&self, buf: &mut [u8]) -> Result<usize, AdapterError>;

	/// Write one packet in a single call.
	async fn send(&self, buf: &[u8]) -> Result<usize, AdapterError>;

	fn name(&self) -> &str;

	fn mtu(&self) -> u16;

	fn address(&self) -> IpNet;

	fn status(&self) -> AdapterState;

	/// Tear down the device. Idempotent; unblocks concurrent reads/writes.
	async fn cleanup(&self) -> Result<(), AdapterError>;
}

/// Retry transient device-creation failures (busy device, race with a
/// previous teardown) with fixed spacing, logging each attempt.
pub async fn create_with_retry<T, F, Fut>(
	cfg: &AdapterConfig,
	mut attempt_fn: F,
) -> Result<T, AdapterError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, std::io::Error>>,
{
	let attempts = cfg.retry_attempts.max(1);
	let mut last: Option<std::io::Error> = None;
	let deadline = tokio::time::Instant::now() + cfg.cleanup_timeout + cfg.retry_delay * attempts;
	for n in 1..=attempts {
		match attempt_fn().await {
			Ok(adapter) => {
				info!(attempt = n, "tun device created");
				return Ok(adapter);
			},
			Err(e) => {
				warn!(attempt = n, of = attempts, error = %e, "tun device creation failed");
				last = Some(e);
			},
		}
		if n < attempts {
			if tokio::time::Instant::now() + cfg.retry_delay > deadline {
				break;
			}
			tokio::time::sleep(cfg.retry_delay).await;
		}
	}
	Err(AdapterError::Create {
		attempts,
		last: last
			.map(|e| e.to_string())
			.unwrap_or_else(|| "unknown".to_string()),
	})
}
