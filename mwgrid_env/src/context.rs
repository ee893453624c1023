//! Core environment context trait for the kernel.

use std::time::Duration;

/// The kernel's interface to time.
///
/// The scheduler only needs the clock for two things: measuring how long a
/// run took, and pausing while a remote horizon converges. Both are routed
/// through this trait so simulated runs never block on the wall clock.
///
/// # Implementations
///
/// - **Production**: `SystemContext` - wraps `Instant` and `thread::sleep`
/// - **Simulation**: `SimContext` (mwgrid_sim) - virtual clock, seeded
///
/// # Determinism
///
/// Everything that would introduce non-determinism is owned by the
/// implementation, so a seed is enough to reproduce a run.
pub trait KernelContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    ///
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Suspends the calling thread for the given duration.
    ///
    /// In production: `std::thread::sleep`
    /// In simulation: advances the virtual clock and returns immediately
    fn sleep(&self, duration: Duration);

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
