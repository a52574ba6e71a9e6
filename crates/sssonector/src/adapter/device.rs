//! Kernel TUN device backed by the `tun` crate.

use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{AdapterError, AdapterState, TunAdapter, create_with_retry};
use crate::config::{AdapterConfig, NetworkConfig};

pub struct NativeAdapter {
	device: tun::AsyncDevice,
	name: String,
	mtu: u16,
	address: IpNet,
	state: Mutex<AdapterState>,
	closed: CancellationToken,
}

impl NativeAdapter {
	/// Create, address and bring up the interface, retrying transient
	/// failures per the adapter config.
	pub async fn create(
		network: &NetworkConfig,
		adapter: &AdapterConfig,
	) -> Result<Arc<NativeAdapter>, AdapterError> {
		let network = network.clone();
		let device = create_with_retry(adapter, move || {
			let network = network.clone();
			async move { open_device(&network) }
		})
		.await?;
		let network_cfg = device.1;
		info!(interface = %network_cfg.interface, mtu = network_cfg.mtu, "tun interface up");
		Ok(Arc::new(NativeAdapter {
			device: device.0,
			name: network_cfg.interface,
			mtu: network_cfg.mtu,
			address: network_cfg.address,
			state: Mutex::new(AdapterState::Ready),
			closed: CancellationToken::new(),
		}))
	}

	fn ensure_ready(&self) -> Result<(), AdapterError> {
		let state = *self.state.lock();
		if state != AdapterState::Ready {
			return Err(AdapterError::NotReady(state));
		}
		Ok(())
	}
}

fn open_device(network: &NetworkConfig) -> Result<(tun::AsyncDevice, NetworkConfig), std::io::Error> {
	let mut config = tun::Configuration::default();
	config
		.tun_name(&network.interface)
		.address(network.address.addr())
		.netmask(network.address.netmask())
		.mtu(network.mtu)
		.up();
	let device = tun::create_as_async(&config).map_err(std::io::Error::other)?;
	Ok((device, network.clone()))
}

#[async_trait]
impl TunAdapter for NativeAdapter {
	async fn recv(&self, buf: &mut [u8]) -> Result<usize, AdapterError> {
		self.ensure_ready()?;
		tokio::select! {
			_ = self.closed.cancelled() => Err(AdapterError::Closed),
			n = self.device.recv(buf) => {
				let n = n?;
				debug!(bytes = n, "tun recv");
				Ok(n)
			},
		}
	}

	async fn send(&self, buf: &[u8]) -> Result<usize, AdapterError> {
		self.ensure_ready()?;
		if buf.len() > self.mtu as usize {
			return Err(AdapterError::OversizedPacket {
				len: buf.len(),
				mtu: self.mtu,
			});
		}
		tokio::select! {
			_ = self.closed.cancelled() => Err(AdapterError::Closed),
			n = self.device.send(buf) => Ok(n?),
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
			match *state {
				AdapterState::Closed => return Ok(()),
				_ => *state = AdapterState::Closing,
			}
		}
		self.closed.cancel();
		*self.state.lock() = AdapterState::Closed;
		info!(interface = %self.name, "tun interface closed");
		Ok(())
	}
}
