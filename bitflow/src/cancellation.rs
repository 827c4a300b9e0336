//! Cooperative cancellation of long-running analyses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The failure raised when an analysis is abandoned. Whatever facts were accumulated before
/// the cancellation stay in the dataflow store.
#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
#[error("the dataflow analysis was cancelled")]
pub struct Cancelled;

/// A token the analyzer polls once per sweep. Clones share the cancellation state, so the
/// caller keeps one clone and hands the other to the analysis.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn poll(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}
