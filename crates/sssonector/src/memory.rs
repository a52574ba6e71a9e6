//! Global byte-reservation limit with soft-limit cleanup callbacks.
//!
//! Reservations are a fast atomic check against the hard limit; a background
//! monitor samples process memory and, above the soft limit, runs each
//! registered cleanup callback so caches can shed weight before reservations
//! start failing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MemoryConfig;

pub type CleanupFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct Counters {
	current: AtomicU64,
	rejections: AtomicU64,
	cleanups: AtomicU64,
}

pub struct MemoryManager {
	max_bytes: u64,
	soft_limit_bytes: u64,
	check_interval: Duration,
	counters: Counters,
	cleanup_fns: Mutex<Vec<CleanupFn>>,
	cancel: CancellationToken,
	monitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Reservation guard: releases its bytes when dropped, so every successful
/// reserve is matched by exactly one release.
pub struct Reservation {
	manager: Arc<MemoryManager>,
	bytes: u64,
}

impl Drop for Reservation {
	fn drop(&mut self) {
		self.manager.release(self.bytes);
	}
}

impl MemoryManager {
	pub fn new(cfg: &MemoryConfig) -> Arc<MemoryManager> {
		let max_bytes = cfg.max_mb * 1024 * 1024;
		Arc::new(MemoryManager {
			max_bytes,
			soft_limit_bytes: (max_bytes as f64 * cfg.soft_limit_ratio) as u64,
			check_interval: cfg.check_interval,
			counters: Counters::default(),
			cleanup_fns: Mutex::new(Vec::new()),
			cancel: CancellationToken::new(),
			monitor: Mutex::new(None),
		})
	}

	/// Atomically reserve `n` bytes if the hard limit allows. Failure
	/// increments the rejection counter.
	pub fn check_and_reserve(self: &Arc<Self>, n: u64) -> Option<Reservation> {
		let mut current = self.counters.current.load(Ordering::Relaxed);
		loop {
			let next = current.saturating_add(n);
			if next > self.max_bytes {
				self.counters.rejections.fetch_add(1, Ordering::Relaxed);
				return None;
			}
			match self.counters.current.compare_exchange_weak(
				current,
				next,
				Ordering::AcqRel,
				Ordering::Relaxed,
			) {
				Ok(_) => {
					return Some(Reservation {
						manager: self.clone(),
						bytes: n,
					});
				},
				Err(observed) => current = observed,
			}
		}
	}

	fn release(&self, n: u64) {
		let prev = self.counters.current.fetch_sub(n, Ordering::AcqRel);
		debug_assert!(prev >= n, "release({n}) without matching reserve");
	}

	pub fn current_bytes(&self) -> u64 {
		self.counters.current.load(Ordering::Relaxed)
	}

	pub fn rejections(&self) -> u64 {
		self.counters.rejections.load(Ordering::Relaxed)
	}

	pub fn cleanups(&self) -> u64 {
		self.counters.cleanups.load(Ordering::Relaxed)
	}

	/// Register a callback invoked whenever memory use exceeds the soft
	/// limit. Callbacks should free caches and return quickly.
	pub fn register_cleanup(&self, f: CleanupFn) {
		self.cleanup_fns.lock().push(f);
	}

	/// Sampled process memory: RSS where the platform exposes it, otherwise
	/// our own reservation counter.
	fn sampled_bytes(&self) -> u64 {
		process_rss_bytes().unwrap_or_else(|| self.current_bytes())
	}

	fn run_cleanups(&self) {
		let fns: Vec<CleanupFn> = self.cleanup_fns.lock().clone();
		for f in &fns {
			f();
		}
		self.counters.cleanups.fetch_add(1, Ordering::Relaxed);
	}

	/// Start the background monitor. Idempotent.
	pub fn start_monitor(self: &Arc<Self>) {
		let mut slot = self.monitor.lock();
		if slot.is_some() {
			return;
		}
		let this = self.clone();
		let cancel = self.cancel.clone();
		*slot = Some(tokio::spawn(async move {
			let mut ticker = tokio::time::interval(this.check_interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = cancel.cancelled() => return,
					_ = ticker.tick() => {},
				}
				let used = this.sampled_bytes();
				if used > this.soft_limit_bytes {
					warn!(
						used_bytes = used,
						soft_limit = this.soft_limit_bytes,
						"memory above soft limit, running cleanup callbacks"
					);
					this.run_cleanups();
				} else {
					debug!(used_bytes = used, "memory sample");
				}
			}
		}));
	}

	/// Stop the monitor and wait for it to exit.
	pub async fn stop(&self) {
		self.cancel.cancel();
		let handle = self.monitor.lock().take();
		if let Some(handle) = handle {
			let _ = handle.await;
			info!("memory monitor stopped");
		}
	}
}

#[cfg(target_os = "linux")]
fn process_rss_bytes() -> Option<u64> {
	let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
	let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
	let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
	if page_size <= 0 {
		return None;
	}
	Some(rss_pages * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
fn process_rss_bytes() -> Option<u64> {
	None
}
