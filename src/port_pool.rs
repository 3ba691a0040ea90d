//! Listening ports shared between concurrently running proxies

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Range {
  start: u16,
  end: u16,
  in_use: Vec<bool>,
}

/// A fixed inclusive range of ports, each either free or handed out.
///
/// ```
/// use capture_proxy::PortPool;
///
/// let pool = PortPool::new();
/// pool.initialize(9000, 9001);
/// assert_eq!(pool.obtain(), 9000);
/// assert_eq!(pool.obtain(), 9001);
/// assert_eq!(pool.obtain(), 0);
/// pool.release(9000);
/// assert_eq!(pool.obtain(), 9000);
/// ```
#[derive(Debug, Default)]
pub struct PortPool {
  inner: Mutex<Range>,
}

impl PortPool {
  /// An empty pool; `obtain` returns `0` until it is initialized
  pub fn new() -> Self {
    Self::default()
  }

  /// Use the ports `start..=end`, all free.
  ///
  /// Initializing again with the same range keeps the current allocations.
  /// A reversed range is normalized. Port `0` is never handed out, since
  /// `obtain` uses it to report exhaustion; `initialize(0, 0)` leaves the pool
  /// empty.
  pub fn initialize(&self, start: u16, end: u16) {
    let (start, end) = if start <= end { (start, end) } else { (end, start) };
    let start = start.max(1);
    let mut range = self.inner.lock();
    if end < start {
      *range = Range::default();
      tracing::debug!("port pool initialized empty");
      return;
    }
    if range.start == start && range.end == end && !range.in_use.is_empty() {
      return;
    }
    *range = Range {
      start,
      end,
      in_use: vec![false; (end - start) as usize + 1],
    };
    tracing::debug!(start, end, "port pool initialized");
  }

  /// Hand out the lowest free port, or `0` if every port is taken.
  pub fn obtain(&self) -> u16 {
    let mut range = self.inner.lock();
    let start = range.start;
    match range.in_use.iter().position(|used| !used) {
      Some(index) => {
        range.in_use[index] = true;
        start + index as u16
      }
      None => 0,
    }
  }

  /// Return `port` to the pool. Ports outside the range are ignored.
  pub fn release(&self, port: u16) {
    let mut range = self.inner.lock();
    if port < range.start {
      return;
    }
    let index = (port - range.start) as usize;
    if let Some(used) = range.in_use.get_mut(index) {
      *used = false;
    }
  }

  /// Number of ports currently handed out
  pub fn in_use(&self) -> usize {
    self.inner.lock().in_use.iter().filter(|used| **used).count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;
  use std::sync::Arc;

  #[test]
  fn obtain_is_lowest_free() {
    let pool = PortPool::new();
    assert_eq!(pool.obtain(), 0);
    pool.initialize(5000, 5002);
    assert_eq!(pool.obtain(), 5000);
    assert_eq!(pool.obtain(), 5001);
    pool.release(5000);
    assert_eq!(pool.obtain(), 5000);
    assert_eq!(pool.obtain(), 5002);
    assert_eq!(pool.obtain(), 0);
    assert_eq!(pool.in_use(), 3);
  }

  #[test]
  fn same_range_keeps_allocations() {
    let pool = PortPool::new();
    pool.initialize(6000, 6001);
    assert_eq!(pool.obtain(), 6000);
    pool.initialize(6000, 6001);
    assert_eq!(pool.obtain(), 6001);
    pool.initialize(7000, 7000);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.obtain(), 7000);
  }

  #[test]
  fn release_outside_range_is_ignored() {
    let pool = PortPool::new();
    pool.initialize(100, 101);
    pool.release(99);
    pool.release(102);
    pool.release(u16::MAX);
    assert_eq!(pool.in_use(), 0);
  }

  #[test]
  fn port_zero_is_never_handed_out() {
    let pool = PortPool::new();
    pool.initialize(0, 0);
    assert_eq!(pool.obtain(), 0);
    assert_eq!(pool.in_use(), 0);
    pool.initialize(0, 2);
    assert_eq!(pool.obtain(), 1);
    assert_eq!(pool.obtain(), 2);
    assert_eq!(pool.obtain(), 0);
    pool.release(0);
    assert_eq!(pool.in_use(), 2);
  }

  #[test]
  fn full_u16_range_does_not_overflow() {
    let pool = PortPool::new();
    pool.initialize(u16::MAX, u16::MAX);
    assert_eq!(pool.obtain(), u16::MAX);
    assert_eq!(pool.obtain(), 0);
  }

  #[test]
  fn concurrent_obtain_never_duplicates() {
    let pool = Arc::new(PortPool::new());
    pool.initialize(20000, 20063);
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let pool = pool.clone();
        std::thread::spawn(move || (0..8).map(|_| pool.obtain()).collect::<Vec<_>>())
      })
      .collect();
    let mut seen = HashSet::new();
    for handle in handles {
      for port in handle.join().unwrap() {
        assert_ne!(port, 0);
        assert!(seen.insert(port), "port {port} handed out twice");
      }
    }
    assert_eq!(seen.len(), 64);
    assert_eq!(pool.obtain(), 0);
  }
}
