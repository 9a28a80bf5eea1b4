//! Cooperative cancellation.
//!
//! Ctrl-C sets a flag; the batch runner stops dispatching new cards and lets
//! in-flight requests drain, and the orchestrator stops before the next
//! batch. Durable state is already flushed incrementally, so there's nothing
//! extra to save on the way out.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::prelude::*;

/// A shared cancellation flag.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a new, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set this flag when the user presses Ctrl-C.
    pub fn install_ctrl_c_handler(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight cards and stopping");
                flag.cancel();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_unset_and_sticks_once_cancelled() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
