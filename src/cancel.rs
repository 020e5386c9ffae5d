//! Cooperative cancellation shared between the interrupt handler and the
//! long-running stages (download, extraction, composition).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::BuildError;

/// Cloneable flag; all clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the token has been tripped.
    pub fn check(&self) -> Result<(), BuildError> {
        if self.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        Ok(())
    }

    /// Sleep for `total`, waking early (with `Err`) on cancellation.
    pub fn sleep(&self, total: Duration) -> Result<(), BuildError> {
        let deadline = Instant::now() + total;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }
}
