use crate::errors::DbError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation handle passed into long-running scans.
/// Cloning shares the underlying flag; `cancel()` is sticky.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Checked at leaf-node and document boundaries.
    /// # Errors
    /// Returns `DbError::Cancelled` once `cancel()` has been observed.
    pub fn check(&self) -> Result<(), DbError> {
        if self.is_cancelled() { Err(DbError::Cancelled) } else { Ok(()) }
    }
}
