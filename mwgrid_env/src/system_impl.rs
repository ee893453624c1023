//! Production implementation of KernelContext using the system clock.

use crate::KernelContext;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Production context backed by the OS clock.
///
/// Sleeping really blocks the scheduler thread, which is what a distributed
/// run wants while the remote horizon catches up.
pub struct SystemContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl SystemContext {
    /// Creates a new SystemContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing across threads.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for SystemContext {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelContext for SystemContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }

    fn seed(&self) -> u64 {
        0
    }
}
