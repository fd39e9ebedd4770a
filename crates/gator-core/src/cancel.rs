//! Cancellation for a consumer blocked in a drain
//!
//! The read loop polls the token between waits and gives up with
//! `GatorError::Interrupted` once it fires. Clones share one flag, so the
//! thread that wants the reader gone keeps a clone and calls `cancel`.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared one-way cancel flag
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Fire the token. There is no way back.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CancellationToken({})", self.is_cancelled())
    }
}
