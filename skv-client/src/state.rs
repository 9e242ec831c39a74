//! # Lifecycle State Cell
//!
//! Purpose: Hold one ordered lifecycle value per component and enforce
//! allowed-state checks at the entry of every public operation.
//!
//! ## Design Principles
//! 1. **Tagged States Over Flags**: Components compare ordered enum values,
//!    never booleans.
//! 2. **Read-Heavy Locking**: Checks take a read lock; transitions take the
//!    write lock.
//! 3. **Observable Transitions**: Every `set` emits a `tracing` event so
//!    tests and operators can follow a component's lifecycle.

use parking_lot::RwLock;
use tracing::debug;

use skv_common::{SkvError, SkvResult};

/// An ordered lifecycle value with a human-readable label.
pub trait LifecycleState: Copy + PartialEq + PartialOrd + Send + Sync + 'static {
    /// Label used in logs and `IllegalState` errors.
    fn label(&self) -> &'static str;
}

/// Per-component lifecycle variable.
pub struct StateCell<S> {
    component: &'static str,
    state: RwLock<S>,
}

impl<S: LifecycleState> StateCell<S> {
    /// Creates a cell for `component` starting in `initial`.
    pub fn new(component: &'static str, initial: S) -> Self {
        StateCell {
            component,
            state: RwLock::new(initial),
        }
    }

    /// Transitions to `next`.
    pub fn set(&self, next: S) {
        let mut state = self.state.write();
        debug!(
            component = self.component,
            from = state.label(),
            to = next.label(),
            "state transition"
        );
        *state = next;
    }

    /// Current state.
    pub fn current(&self) -> S {
        *self.state.read()
    }

    /// True when the current state equals `s`.
    pub fn is_current(&self, s: S) -> bool {
        *self.state.read() == s
    }

    /// True when the current state orders strictly before `s`.
    pub fn is_less_than(&self, s: S) -> bool {
        *self.state.read() < s
    }

    /// Fails with `IllegalState` unless the current state is in `allowed`.
    pub fn check(&self, allowed: &[S]) -> SkvResult<()> {
        let current = *self.state.read();
        if allowed.contains(&current) {
            return Ok(());
        }
        Err(SkvError::IllegalState {
            component: self.component,
            current: current.label(),
            allowed: allowed
                .iter()
                .map(|s| s.label())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}
