//! Reusable byte buffers for the WebSocket copy loop.
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::{ArrayQueue, SegQueue};

/// Number of buffers kept in the fast tier.
pub const FAST_TIER_CAPACITY: usize = 10;
/// Size of one WebSocket copy buffer.
pub const BUF_SIZE: usize = 1024 * 32;

/// A two-tier pool of byte buffers.
///
/// Checkout prefers the bounded fast tier and falls back to an unbounded
/// general tier, allocating when both are empty. Whether a checkout hits or
/// misses never changes what the caller observes.
#[derive(Clone)]
pub struct BufferPool {
  inner: Arc<PoolInner>,
}

struct PoolInner {
  fast: ArrayQueue<Vec<u8>>,
  general: SegQueue<Vec<u8>>,
}

impl Default for BufferPool {
  fn default() -> Self {
    Self::new()
  }
}

impl BufferPool {
  /// Create an empty pool.
  pub fn new() -> Self {
    Self {
      inner: Arc::new(PoolInner {
        fast: ArrayQueue::new(FAST_TIER_CAPACITY),
        general: SegQueue::new(),
      }),
    }
  }
  /// Check out a buffer whose length is exactly `len`.
  pub fn get(&self, len: usize) -> PooledBuf {
    let mut data = self
      .inner
      .fast
      .pop()
      .or_else(|| self.inner.general.pop())
      .unwrap_or_default();
    if data.capacity() < len {
      data = vec![0; len];
    } else {
      data.resize(len, 0);
    }
    PooledBuf {
      data,
      pool: self.clone(),
    }
  }

  fn put(&self, data: Vec<u8>) {
    if let Err(data) = self.inner.fast.push(data) {
      self.inner.general.push(data);
    }
  }
  /// Buffers currently idle in the pool.
  pub fn idle(&self) -> usize {
    self.inner.fast.len() + self.inner.general.len()
  }
}

/// A checked-out buffer; returns itself to the pool on drop.
pub struct PooledBuf {
  data: Vec<u8>,
  pool: BufferPool,
}

impl Deref for PooledBuf {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    &self.data
  }
}

impl DerefMut for PooledBuf {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.data
  }
}

impl Drop for PooledBuf {
  fn drop(&mut self) {
    let data = std::mem::take(&mut self.data);
    self.pool.put(data);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn checkout_has_requested_length() {
    let pool = BufferPool::new();
    let buf = pool.get(BUF_SIZE);
    assert_eq!(buf.len(), BUF_SIZE);
    drop(buf);
    assert_eq!(pool.idle(), 1);
    let small = pool.get(16);
    assert_eq!(small.len(), 16);
    assert_eq!(pool.idle(), 0);
  }

  #[test]
  fn overflow_goes_to_general_tier() {
    let pool = BufferPool::new();
    let bufs: Vec<_> = (0..FAST_TIER_CAPACITY + 5).map(|_| pool.get(64)).collect();
    drop(bufs);
    assert_eq!(pool.idle(), FAST_TIER_CAPACITY + 5);
    let again = pool.get(128);
    assert_eq!(again.len(), 128);
  }
}
