use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::LifecycleError;

/// Shared stop signal polled by long-running archive work.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// # Errors
    /// Returns [`LifecycleError::Cancelled`] once [`CancellationFlag::cancel`] has been called.
    pub fn check(&self) -> Result<(), LifecycleError> {
        if self.is_cancelled() {
            Err(LifecycleError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Guard that trips this flag when dropped unless disarmed first.
    #[must_use]
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop { flag: Some(self.clone()) }
    }
}

pub struct CancelOnDrop {
    flag: Option<CancellationFlag>,
}

impl CancelOnDrop {
    pub fn disarm(mut self) {
        self.flag = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = self.flag.take() {
            flag.cancel();
        }
    }
}
