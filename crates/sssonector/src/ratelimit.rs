//! Token-bucket traffic shaping for the tunnel datapath.
//!
//! Each direction (upload: TUN→TLS, download: TLS→TUN) has an independent
//! bucket. Refill happens on demand from elapsed wall time, with elapsed
//! clamped to [0, 1s] so clock jumps neither drain nor overfill a bucket.
//! A rate of zero disables shaping for that direction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Longest single refill credit. Also bounds the damage of a forward clock
/// jump.
const MAX_ELAPSED: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct BucketState {
	tokens: f64,
	last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
	/// Burst capacity in bytes.
	capacity: f64,
	/// Refill rate in bytes per second.
	rate: f64,
	state: Mutex<BucketState>,
}

impl TokenBucket {
	/// `rate_kbps` in kbit/s; `burst` in bytes. Zero rate means unlimited.
	pub fn new(rate_kbps: i64, burst: Option<usize>) -> Option<TokenBucket> {
		if rate_kbps <= 0 {
			return None;
		}
		let rate = rate_kbps as f64 * 1000.0 / 8.0;
		let capacity = burst.map(|b| b as f64).unwrap_or(rate * 2.0);
		Some(TokenBucket {
			capacity,
			rate,
			state: Mutex::new(BucketState {
				tokens: capacity,
				last_refill: Instant::now(),
			}),
		})
	}

	/// Withdraw `n` tokens, returning how long the caller must sleep first.
	/// Tokens are committed immediately so concurrent callers queue behind
	/// each other rather than double-spending.
	fn reserve(&self, n: usize, now: Instant) -> Duration {
		let mut state = self.state.lock();
		let elapsed = now
			.checked_duration_since(state.last_refill)
			.unwrap_or(Duration::ZERO)
			.min(MAX_ELAPSED);
		state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
		state.last_refill = now;
		state.tokens -= n as f64;
		if state.tokens >= 0.0 {
			Duration::ZERO
		} else {
			Duration::from_secs_f64(-state.tokens / self.rate)
		}
	}

	/// Sleep until `n` bytes may pass.
	pub async fn acquire(&self, n: usize) {
		let wait = self.reserve(n, Instant::now());
		if !wait.is_zero() {
			tokio::time::sleep(wait).await;
		}
	}

	#[cfg(test)]
	fn tokens(&self) -> f64 {
		self.state.lock().tokens
	}
}

/// Per-tunnel shaping with independent upload and download buckets.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
	upload: Option<Arc<TokenBucket>>,
	download: Option<Arc<TokenBucket>>,
}

impl RateLimiter {
	pub fn new(upload_kbps: i64, download_kbps: i64) -> RateLimiter {
		RateLimiter {
			upload: TokenBucket::new(upload_kbps, None).map(Arc::new),
			download: TokenBucket::new(download_kbps, None).map(Arc::new),
		}
	}

	pub fn unlimited() -> RateLimiter {
		RateLimiter::default()
	}

	pub async fn acquire_upload(&self, n: usize) {
		if let Some(bucket) = &self.upload {
			bucket.acquire(n).await;
		}
	}

	pub async fn acquire_download(&self, n: usize) {
		if let Some(bucket) = &self.download {
			bucket.acquire(n).await;
		}
	}
}
