//! Cooperative cancellation.
//!
//! Long-running operations (walks, comparator scans, the rebuild loop) take a
//! token and poll it between callbacks and node reads. Observing a fired
//! token returns promptly with whatever partial result exists.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{Error, Result};

/// Cheaply cloneable cancellation flag shared between the requesting side and
/// the operation observing it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Poll point: `Err(Cancelled)` once the token fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
