//! Level-triggered interrupt signal.
//!
//! Anything outside the loop (a Ctrl-C handler, an input thread) may raise
//! the signal. The loop polls it at turn boundaries and clears it in the same
//! atomic step, so a raise is observed exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A shareable interrupt flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptSignal {
    raised: Arc<AtomicBool>,
}

impl InterruptSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the loop pause for human input at its next checkpoint.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    /// Peek without clearing.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Read and clear in one step. Returns whether the signal was raised.
    pub fn take(&self) -> bool {
        self.raised.swap(false, Ordering::SeqCst)
    }
}
