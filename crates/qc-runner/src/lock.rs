use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation_in_progress: a procedure is already running")]
pub struct RunRejected;

/// Single-slot, non-reentrant run gate. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct RunLock {
    busy: Arc<AtomicBool>,
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Result<RunLockGuard, RunRejected> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RunRejected)?;
        Ok(RunLockGuard {
            busy: Arc::clone(&self.busy),
        })
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the run slot when dropped, including during unwinding.
#[derive(Debug)]
pub struct RunLockGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
