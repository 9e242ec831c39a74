//! # Wait Group
//!
//! Purpose: Counter-based completion primitive for async submissions and for
//! tracking in-flight execution threads during cluster shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct WaitGroupInner {
    count: Mutex<usize>,
    zero: Condvar,
}

/// A cloneable counter that `wait` blocks on until it reaches zero.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

impl WaitGroup {
    /// Creates a wait group with a zero count.
    pub fn new() -> Self {
        WaitGroup {
            inner: Arc::new(WaitGroupInner {
                count: Mutex::new(0),
                zero: Condvar::new(),
            }),
        }
    }

    /// Adds `n` to the count.
    pub fn add(&self, n: usize) {
        *self.inner.count.lock() += n;
    }

    /// Decrements the count, waking waiters at zero.
    pub fn done(&self) {
        let mut count = self.inner.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.zero.notify_all();
        }
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.inner.count.lock();
        while *count > 0 {
            self.inner.zero.wait(&mut count);
        }
    }

    /// Blocks until the count reaches zero or `timeout` elapses.
    ///
    /// Returns true when the count reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.inner.count.lock();
        while *count > 0 {
            if self.inner.zero.wait_for(&mut count, timeout).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    /// Current count; for diagnostics only.
    pub fn count(&self) -> usize {
        *self.inner.count.lock()
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_once_all_done() {
        let wg = WaitGroup::new();
        wg.add(3);
        for _ in 0..3 {
            let wg = wg.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                wg.done();
            });
        }
        wg.wait();
        assert_eq!(wg.count(), 0);
    }

    #[test]
    fn wait_timeout_reports_outcome() {
        let wg = WaitGroup::new();
        wg.add(1);
        assert!(!wg.wait_timeout(Duration::from_millis(20)));
        wg.done();
        assert!(wg.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn wait_on_zero_returns_immediately() {
        let wg = WaitGroup::new();
        wg.wait();
    }
}
