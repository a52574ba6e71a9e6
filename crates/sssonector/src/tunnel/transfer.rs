//! Bidirectional packet pump between the TLS stream and the TUN adapter.
//!
//! Two independent tasks, one per direction, joined by a cancellation token.
//! Upload (TUN→TLS): one packet per read, rate-limit charge, one complete
//! write. Download (TLS→TUN): each TLS read of up to one MTU becomes one TUN
//! packet — the wire carries no framing, so both peers must run the same
//! MTU. Either direction ending (error, EOF, cancel) tears down both; the
//! pump returns only after both tasks have exited.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::TransferMetrics;
use crate::adapter::{AdapterError, TunAdapter};
use crate::buffers::BufferPool;
use crate::memory::MemoryManager;
use crate::ratelimit::RateLimiter;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
	#[error("adapter: {0}")]
	Adapter(#[from] AdapterError),
	#[error("stream: {0}")]
	Stream(#[from] std::io::Error),
	#[error("memory reservation denied")]
	MemoryDenied,
}

pub struct Transfer {
	pub mtu: usize,
	pub limiter: RateLimiter,
	pub pool: BufferPool,
	pub memory: Option<Arc<MemoryManager>>,
	pub metrics: Arc<TransferMetrics>,
	pub cancel: CancellationToken,
}

impl Transfer {
	/// Pump until one side closes or `cancel` fires. Resolves when both
	/// directions have exited; the first hard error wins.
	pub async fn run<S>(
		self,
		adapter: Arc<dyn TunAdapter>,
		stream: S,
	) -> Result<(), TransferError>
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (reader, writer) = tokio::io::split(stream);
		let Transfer {
			mtu,
			limiter,
			pool,
			memory,
			metrics,
			cancel,
		} = self;

		let up = tokio::spawn(upload_loop(
			adapter.clone(),
			writer,
			mtu,
			limiter.clone(),
			pool.clone(),
			memory.clone(),
			metrics.clone(),
			cancel.clone(),
		));
		let down = tokio::spawn(download_loop(
			adapter,
			reader,
			mtu,
			limiter,
			pool,
			memory,
			metrics,
			cancel.clone(),
		));

		let (up_result, down_result) = tokio::join!(up, down);
		cancel.cancel();
		let up_result = up_result.unwrap_or_else(|e| Err(TransferError::Stream(std::io::Error::other(e))));
		let down_result =
			down_result.unwrap_or_else(|e| Err(TransferError::Stream(std::io::Error::other(e))));
		up_result.and(down_result)
	}
}

/// TUN → TLS.
#[allow(clippy::too_many_arguments)]
async fn upload_loop<W>(
	adapter: Arc<dyn TunAdapter>,
	mut writer: tokio::io::WriteHalf<W>,
	mtu: usize,
	limiter: RateLimiter,
	pool: BufferPool,
	memory: Option<Arc<MemoryManager>>,
	metrics: Arc<TransferMetrics>,
	cancel: CancellationToken,
) -> Result<(), TransferError>
where
	W: AsyncRead + AsyncWrite + Send + 'static,
{
	let _guard = cancel.clone().drop_guard();
	loop {
		let _reservation = match &memory {
			Some(m) => match m.check_and_reserve(mtu as u64) {
				Some(r) => Some(r),
				None => {
					warn!("memory reservation denied, closing upload direction");
					let _ = writer.shutdown().await;
					return Err(TransferError::MemoryDenied);
				},
			},
			None => None,
		};
		let mut buf = pool.get_with_mtu(mtu);
		let n = tokio::select! {
			_ = cancel.cancelled() => break,
			n = adapter.recv(&mut buf) => match n {
				Ok(n) => n,
				Err(e) if e.is_end_of_stream() => break,
				Err(e) => {
					let _ = writer.shutdown().await;
					return Err(e.into());
				},
			},
		};
		if n == 0 {
			continue;
		}
		limiter.acquire_upload(n).await;
		tokio::select! {
			_ = cancel.cancelled() => break,
			result = async {
				// One packet, one complete write; write_all retries partial
				// TLS writes internally.
				writer.write_all(&buf[..n]).await?;
				writer.flush().await
			} => result?,
		}
		metrics.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
		metrics.packets_up.fetch_add(1, Ordering::Relaxed);
	}
	debug!("upload direction exited");
	let _ = writer.shutdown().await;
	Ok(())
}

/// TLS → TUN.
#[allow(clippy::too_many_arguments)]
async fn download_loop<R>(
	adapter: Arc<dyn TunAdapter>,
	mut reader: tokio::io::ReadHalf<R>,
	mtu: usize,
	limiter: RateLimiter,
	pool: BufferPool,
	memory: Option<Arc<MemoryManager>>,
	metrics: Arc<TransferMetrics>,
	cancel: CancellationToken,
) -> Result<(), TransferError>
where
	R: AsyncRead + AsyncWrite + Send + 'static,
{
	let _guard = cancel.clone().drop_guard();
	loop {
		let _reservation = match &memory {
			Some(m) => match m.check_and_reserve(mtu as u64) {
				Some(r) => Some(r),
				None => {
					warn!("memory reservation denied, closing download direction");
					return Err(TransferError::MemoryDenied);
				},
			},
			None => None,
		};
		let mut buf = pool.get_with_mtu(mtu);
		let n = tokio::select! {
			_ = cancel.cancelled() => break,
			n = reader.read(&mut buf) => n?,
		};
		if n == 0 {
			// Peer closed the TLS stream.
			break;
		}
		limiter.acquire_download(n).await;
		match adapter.send(&buf[..n]).await {
			Ok(_) => {},
			Err(e) if e.is_end_of_stream() => break,
			Err(e) => return Err(e.into()),
		}
		metrics.bytes_down.fetch_add(n as u64, Ordering::Relaxed);
		metrics.packets_down.fetch_add(1, Ordering::Relaxed);
	}
	debug!("download direction exited");
	Ok(())
}

