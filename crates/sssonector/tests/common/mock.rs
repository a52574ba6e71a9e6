//! In-memory TUN adapter driven by channels.
//!
//! `recv` yields packets injected through the handle (the "kernel" side);
//! `send` forwards packets out through the handle. Packet-per-call semantics
//! match the real device.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use sssonector::adapter::{AdapterError, AdapterState, TunAdapter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct MockAdapter {
	name: String,
	mtu: u16,
	address: IpNet,
	state: Mutex<AdapterState>,
	inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
	outbound: mpsc::Sender<Vec<u8>>,
	closed: CancellationToken,
}

/// Test-side endpoints of a [`MockAdapter`].
pub struct MockHandle {
	/// Inject a packet, as if the kernel routed it into the TUN device.
	pub to_adapter: mpsc::Sender<Vec<u8>>,
	/// Packets the tunnel wrote back to the "kernel".
	pub from_adapter: mpsc::Receiver<Vec<u8>>,
}

pub fn mock_adapter(name: &str, mtu: u16, address: &str) -> (Arc<MockAdapter>, MockHandle) {
	let (inject_tx, inject_rx) = mpsc::channel(128);
	let (out_tx, out_rx) = mpsc::channel(128);
	let adapter = Arc::new(MockAdapter {
		name: name.to_string(),
		mtu,
		address: address.parse().expect("valid CIDR"),
		state: Mutex::new(AdapterState::Ready),
		inbound: tokio::sync::Mutex::new(inject_rx),
		outbound: out_tx,
		closed: CancellationToken::new(),
	});
	(
		adapter,
		MockHandle {
			to_adapter: inject_tx,
			from_adapter: out_rx,
		},
	)
}

#[async_trait]
impl TunAdapter for MockAdapter {
	async fn recv(&self, buf: &mut [u8]) -> Result<usize, AdapterError> {
		{
			let state = *self.state.lock();
			if state != AdapterState::Ready {
				return Err(AdapterError::NotReady(state));
			}
		}
		let mut inbound = self.inbound.lock().await;
		tokio::select! {
			_ = self.closed.cancelled() => Err(AdapterError::Closed),
			packet = inbound.recv() => {
				let packet = packet.ok_or(AdapterError::Closed)?;
				let n = packet.len().min(buf.len());
				buf[..n].copy_from_slice(&packet[..n]);
				Ok(n)
			},
		}
	}

	async fn send(&self, buf: &[u8]) -> Result<usize, AdapterError> {
		{
			let state = *self.state.lock();
			if state != AdapterState::Ready {
				return Err(AdapterError::NotReady(state));
			}
		}
		if buf.len() > self.mtu as usize {
			return Err(AdapterError::OversizedPacket {
				len: buf.len(),
				mtu: self.mtu,
			});
		}
		tokio::select! {
			_ = self.closed.cancelled() => Err(AdapterError::Closed),
			sent = self.outbound.send(buf.to_vec()) => {
				sent.map_err(|_| AdapterError::Closed)?;
				Ok(buf.len())
			},
		}
	}

	fn name(&self) -> &str {
		&self.name
	}

	fn mtu(&self) -> u16 {
		self.mtu
	}

	fn address(&self) -> IpNet {
		self.address
	}

	fn status(&self) -> AdapterState {
		*self.state.lock()
	}

	async fn cleanup(&self) -> Result<(), AdapterError> {
		{
			let mut state = self.state.lock();
			if *state == AdapterState::Closed {
				return Ok(());
			}
			*state = AdapterState::Closing;
		}
		self.closed.cancel();
		*self.state.lock() = AdapterState::Closed;
		Ok(())
	}
}

/// Adapter factory that fails with "device busy" a configured number of
/// times before producing a working mock, for creation-retry scenarios.
pub struct FlakyFactory {
	failures_before_success: u32,
	calls: AtomicU32,
	mtu: u16,
	address: String,
	handle_tx: Mutex<Option<tokio::sync::oneshot::Sender<MockHandle>>>,
}

impl FlakyFactory {
	pub fn new(
		failures_before_success: u32,
		mtu: u16,
		address: &str,
	) -> (Arc<FlakyFactory>, tokio::sync::oneshot::Receiver<MockHandle>) {
		let (tx, rx) = tokio::sync::oneshot::channel();
		(
			Arc::new(FlakyFactory {
				failures_before_success,
				calls: AtomicU32::new(0),
				mtu,
				address: address.to_string(),
				handle_tx: Mutex::new(Some(tx)),
			}),
			rx,
		)
	}

	pub fn calls(&self) -> u32 {
		self.calls.load(Ordering::SeqCst)
	}

	pub async fn create(&self) -> Result<Arc<dyn TunAdapter>, std::io::Error> {
		let n = self.calls.fetch_add(1, Ordering::SeqCst);
		if n < self.failures_before_success {
			return Err(std::io::Error::new(
				std::io::ErrorKind::ResourceBusy,
				"device busy",
			));
		}
		let (adapter, handle) = mock_adapter("tun-test", self.mtu, &self.address);
		if let Some(tx) = self.handle_tx.lock().take() {
			let _ = tx.send(handle);
		}
		Ok(adapter)
	}
}
