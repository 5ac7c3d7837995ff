//! Millisecond time sources for LRU aging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic millisecond clock. Readings are never 0, which is reserved
/// for "never accessed".
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since an arbitrary epoch.
    fn now_ms(&self) -> u64;
}

/// Wall clock measured from construction.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Starts the clock.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }
}

/// Clock advanced by hand.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Clock reading `start_ms` (clamped to at least 1).
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms.max(1)),
        }
    }

    /// Moves time forward.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jumps to an absolute reading.
    pub fn set(&self, ms: u64) {
        self.now.store(ms.max(1), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
