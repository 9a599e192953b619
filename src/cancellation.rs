//! Cancellation framework: per-layer generation token + snapshot guard.
//! Ensures superseded renders cannot write results to a layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic generation counter owned by one layer. Every cancellation event
/// (new render request, explicit cancel, teardown) advances it by one.
#[derive(Debug, Default)]
pub struct GenerationToken {
    value: AtomicU64,
}

impl GenerationToken {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Current generation (non-blocking read).
    #[inline]
    pub fn snapshot(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Advance the generation, cancelling every guard taken before this call.
    /// Returns the new generation.
    #[inline]
    pub fn advance(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Capture the current generation into a guard that in-flight work polls.
    pub fn guard(self: &Arc<Self>) -> GenerationGuard {
        GenerationGuard {
            token: Arc::clone(self),
            my_generation: self.snapshot(),
        }
    }

    /// Guard pinned to `generation`, typically the value `advance` just
    /// returned, so an advance racing in after it still cancels the guard.
    pub fn guard_at(self: &Arc<Self>, generation: u64) -> GenerationGuard {
        GenerationGuard {
            token: Arc::clone(self),
            my_generation: generation,
        }
    }
}

/// Guard a render checks before writing results.
/// If the token has advanced past `my_generation`, the render is stale.
#[derive(Debug, Clone)]
pub struct GenerationGuard {
    token: Arc<GenerationToken>,
    my_generation: u64,
}

impl GenerationGuard {
    /// Returns true once the owning token has advanced since this guard was taken.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.snapshot() != self.my_generation
    }

    #[inline]
    pub fn is_current(&self) -> bool {
        !self.is_cancelled()
    }

    pub fn my_generation(&self) -> u64 {
        self.my_generation
    }
}

/// Zero-argument cancellation query handed to paint callbacks.
pub trait CancelCheck: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

impl CancelCheck for GenerationGuard {
    #[inline]
    fn is_cancelled(&self) -> bool {
        GenerationGuard::is_cancelled(self)
    }
}

/// Predicate for synchronous renders, which are never superseded mid-flight.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancelled;

impl CancelCheck for NeverCancelled {
    #[inline]
    fn is_cancelled(&self) -> bool {
        false
    }
}
