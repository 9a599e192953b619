//! Per-layer render state machine:
//! Idle → Scheduled → Rendering → Completed/Cancelled → Idle.
//! Only the latest generation's transitions are recorded; older attempts
//! still running in the background are stale and ignored.

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RenderPhase {
    Idle,
    Scheduled,
    Rendering,
    Completed,
    Cancelled,
}

impl std::fmt::Display for RenderPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderPhase::Idle => write!(f, "Idle"),
            RenderPhase::Scheduled => write!(f, "Scheduled"),
            RenderPhase::Rendering => write!(f, "Rendering"),
            RenderPhase::Completed => write!(f, "Completed"),
            RenderPhase::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl RenderPhase {
    /// Returns whether transitioning from `self` to `next` is valid within one generation.
    pub fn can_transition_to(self, next: RenderPhase) -> bool {
        matches!(
            (self, next),
            (RenderPhase::Idle, RenderPhase::Scheduled)
                | (RenderPhase::Scheduled, RenderPhase::Rendering)
                | (RenderPhase::Scheduled, RenderPhase::Completed) // no paint callback, degenerate size
                | (RenderPhase::Scheduled, RenderPhase::Cancelled)
                | (RenderPhase::Rendering, RenderPhase::Completed)
                | (RenderPhase::Rendering, RenderPhase::Cancelled)
                | (RenderPhase::Completed, RenderPhase::Idle)
                | (RenderPhase::Cancelled, RenderPhase::Idle)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RenderPhase::Completed | RenderPhase::Cancelled)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("stale generation {generation} (current {current})")]
    Stale { generation: u64, current: u64 },

    #[error("invalid transition: {from} -> {to}")]
    Invalid { from: RenderPhase, to: RenderPhase },
}

#[derive(Debug)]
pub struct PhaseTracker {
    state: RwLock<(u64, RenderPhase)>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new((0, RenderPhase::Idle)),
        }
    }

    pub fn current(&self) -> RenderPhase {
        self.state.read().1
    }

    /// Generation whose phase is being tracked.
    pub fn generation(&self) -> u64 {
        self.state.read().0
    }

    /// A new request supersedes whatever phase the previous one was in.
    pub fn begin(&self, generation: u64) {
        let mut state = self.state.write();
        let (prev_generation, prev) = *state;
        *state = (generation, RenderPhase::Scheduled);
        debug!(
            generation,
            prev_generation,
            from = %prev,
            "render scheduled"
        );
    }

    /// Attempt a transition for `generation`.
    pub fn transition(
        &self,
        generation: u64,
        next: RenderPhase,
    ) -> Result<RenderPhase, TransitionError> {
        let mut state = self.state.write();
        let (current_generation, current) = *state;
        if generation != current_generation {
            debug!(generation, current_generation, to = %next, "stale phase transition ignored");
            return Err(TransitionError::Stale {
                generation,
                current: current_generation,
            });
        }
        if !current.can_transition_to(next) {
            warn!(generation, from = %current, to = %next, "invalid render transition");
            return Err(TransitionError::Invalid {
                from: current,
                to: next,
            });
        }
        state.1 = next;
        debug!(generation, from = %current, to = %next, "render_transition");
        Ok(next)
    }

    /// Record a terminal outcome and return to Idle.
    pub fn finish(&self, generation: u64, finished: bool) -> Result<RenderPhase, TransitionError> {
        let terminal = if finished {
            RenderPhase::Completed
        } else {
            RenderPhase::Cancelled
        };
        self.transition(generation, terminal)?;
        self.transition(generation, RenderPhase::Idle)
    }
}
