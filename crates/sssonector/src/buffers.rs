//! Reusable MTU-sized packet buffers.
//!
//! The pool is keyed by size class and never blocks: under contention or on a
//! cold class it allocates fresh. Buffers return to their class on [`Pool::put`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Cap on retained buffers per size class. Excess buffers are dropped rather
/// than hoarded.
const MAX_PER_CLASS: usize = 64;

/// Size classes are powers of two so nearby MTUs share a free list.
fn size_class(len: usize) -> usize {
	len.next_power_of_two().max(512)
}

#[derive(Default)]
struct Shard {
	free: Vec<BytesMut>,
}

/// Thread-safe packet-buffer pool.
#[derive(Clone, Default)]
pub struct BufferPool {
	classes: Arc<Mutex<HashMap<usize, Shard>>>,
}

/// A pooled buffer. Returns to its pool on drop.
pub struct PooledBuf {
	buf: BytesMut,
	class: usize,
	pool: BufferPool,
	zero_on_put: bool,
}

impl BufferPool {
	pub fn new() -> Self {
		Self::default()
	}

	/// Get a buffer with capacity for at least one MTU-sized packet.
	pub fn get_with_mtu(&self, mtu: usize) -> PooledBuf {
		let class = size_class(mtu);
		let buf = {
			let mut classes = self.classes.lock();
			classes
				.entry(class)
				.or_default()
				.free
				.pop()
				.unwrap_or_else(|| BytesMut::with_capacity(class))
		};
		let mut buf = buf;
		// Recycled buffers keep stale payload bytes; callers overwrite before
		// reading and may opt into zero_on_put.
		if buf.len() != mtu {
			buf.resize(mtu, 0);
		}
		PooledBuf {
			buf,
			class,
			pool: self.clone(),
			zero_on_put: false,
		}
	}

	fn put(&self, mut buf: BytesMut, class: usize, zero: bool) {
		if zero {
			buf.iter_mut().for_each(|b| *b = 0);
		}
		let mut classes = self.classes.lock();
		let shard = classes.entry(class).or_default();
		if shard.free.len() < MAX_PER_CLASS {
			shard.free.push(buf);
		}
	}

	#[cfg(test)]
	fn pooled(&self, class: usize) -> usize {
		self
			.classes
			.lock()
			.get(&class)
			.map(|s| s.free.len())
			.unwrap_or(0)
	}
}

impl PooledBuf {
	/// Request zeroing when the buffer is returned. Off by default; packet
	/// payloads are overwritten before reuse anyway.
	pub fn zero_on_put(&mut self) {
		self.zero_on_put = true;
	}
}

impl std::ops::Deref for PooledBuf {
	type Target = [u8];
	fn deref(&self) -> &[u8] {
		&self.buf
	}
}

impl std::ops::DerefMut for PooledBuf {
	fn deref_mut(&mut self) -> &mut [u8] {
		&mut self.buf
	}
}

impl Drop for PooledBuf {
	fn drop(&mut self) {
		let buf = std::mem::take(&mut self.buf);
		self.pool.put(buf, self.class, self.zero_on_put);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn buffers_are_reused() {
		let pool = BufferPool::new();
		let class = size_class(1500);
		{
			let _b = pool.get_with_mtu(1500);
			assert_eq!(pool.pooled(class), 0);
		}
		assert_eq!(pool.pooled(class), 1);
		let b = pool.get_with_mtu(1500);
		assert_eq!(pool.pooled(class), 0);
		assert_eq!(b.len(), 1500);
	}

	#[test]
	fn capacity_covers_mtu() {
		let pool = BufferPool::new();
		for mtu in [1280usize, 1500, 9000] {
			let b = pool.get_with_mtu(mtu);
			assert!(b.len() >= mtu);
		}
	}

	#[test]
	fn zero_on_put_clears_payload() {
		let pool = BufferPool::new();
		let class = size_class(64);
		{
			let mut b = pool.get_with_mtu(64);
			b[0] = 0xAB;
			b.zero_on_put();
		}
		let b = pool.get_with_mtu(64);
		assert_eq!(b[0], 0);
		let _ = class;
	}

	#[test]
	fn pool_never_blocks_under_contention() {
		let pool = BufferPool::new();
		let a = pool.get_with_mtu(1500);
		let b = pool.get_with_mtu(1500);
		assert_eq!(a.len(), 1500);
		assert_eq!(b.len(), 1500);
	}
}
