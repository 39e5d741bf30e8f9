//! Run token shared by producer and consumer worker loops

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation flag for a data-taking run
///
/// Clones share the same flag. Worker loops check `is_running` at every wait
/// boundary; nothing interrupts a wait that is already in progress.
#[derive(Debug, Clone)]
pub struct RunToken {
    running: Arc<AtomicBool>,
}

impl RunToken {
    /// Create a token in the running state
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the run is still active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// End the run for every holder of this token
    pub fn cancel(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Default for RunToken {
    fn default() -> Self {
        Self::new()
    }
}
