//! Single-Flight Coordinator
//!
//! Guarantees that at most one poke pass runs at a time, and that a poke
//! arriving mid-pass is not lost: it sets `pending`, and the running pass
//! loops once more before releasing.
//!
//! ```text
//!  try_begin()        pass        should_rerun()
//!  ┌─────────┐    ┌──────────┐    ┌──────────────┐  pending  ┌──────────┐
//!  │ running │───►│ work ... │───►│ pending?     │──────────►│ pass ... │
//!  └─────────┘    └──────────┘    └──────────────┘           └──────────┘
//!                                        │ idle
//!                                        ▼
//!                                  running = false
//! ```

use parking_lot::Mutex;

// ============================================================================
// State
// ============================================================================

/// Flags guarded by one mutex so the "check pending, release running" step
/// is atomic with respect to new pokes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PokeState {
    /// A pass is in progress
    pub running: bool,
    /// A poke arrived while a pass was in progress
    pub pending: bool,
}

/// Single-flight gate for the poke loop
#[derive(Debug, Default)]
pub struct SingleFlight {
    state: Mutex<PokeState>,
}

impl SingleFlight {
    /// Create an idle coordinator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to start a pass
    ///
    /// Returns a guard if the caller now owns the pass. If a pass is already
    /// running, records the poke as pending and returns `None`.
    pub fn try_begin(&self) -> Option<FlightGuard<'_>> {
        let mut state = self.state.lock();
        if state.running {
            state.pending = true;
            return None;
        }
        state.running = true;
        state.pending = false;
        Some(FlightGuard {
            flight: self,
            released: false,
        })
    }

    /// Snapshot of the flags
    pub fn state(&self) -> PokeState {
        *self.state.lock()
    }

    /// Whether a pass is in progress
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

// ============================================================================
// Guard
// ============================================================================

/// Ownership of the current pass
///
/// Dropping the guard (including when the pass future is cancelled) clears
/// both flags.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
    released: bool,
}

impl FlightGuard<'_> {
    /// Decide whether to run another pass
    ///
    /// Consumes a pending poke and returns `true`, or releases the pass and
    /// returns `false`. Once this returns `false` the guard no longer holds
    /// the pass.
    pub fn should_rerun(&mut self) -> bool {
        if self.released {
            return false;
        }
        let mut state = self.flight.state.lock();
        if state.pending {
            state.pending = false;
            true
        } else {
            state.running = false;
            self.released = true;
            false
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let mut state = self.flight.state.lock();
            state.running = false;
            state.pending = false;
        }
    }
}
