//! Cooperative stop signals shared by a job's workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Pause/cancel/fail flags for one engine run. Workers poll these before
/// every chunk; the queue holds a clone to forward user requests.
///
/// A fresh control is created per run: resume spawns a new engine with a
/// new control rather than clearing the pause flag.
#[derive(Debug, Default)]
pub struct TransferControl {
    pause: AtomicBool,
    cancel: AtomicBool,
    failed: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask workers to flush and exit, keeping part file and sidecar.
    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::Relaxed);
    }

    /// Ask workers to exit; the engine deletes part file and sidecar.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Record a fatal error and signal all peer workers to exit. The first
    /// failure wins; later ones are dropped.
    pub fn fail(&self, message: String) {
        let mut slot = self.failure.lock().unwrap();
        if slot.is_none() {
            *slot = Some(message);
        }
        self.failed.store(true, Ordering::Relaxed);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::Relaxed)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Any reason for workers to stop pulling work.
    pub fn should_stop(&self) -> bool {
        self.pause_requested() || self.cancel_requested() || self.failed()
    }

    pub fn take_failure(&self) -> Option<String> {
        self.failure.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_clear() {
        let c = TransferControl::new();
        assert!(!c.should_stop());
        assert!(!c.pause_requested());
        assert!(!c.cancel_requested());
    }

    #[test]
    fn first_failure_wins() {
        let c = TransferControl::new();
        c.fail("disk full".into());
        c.fail("second".into());
        assert!(c.failed());
        assert_eq!(c.take_failure().as_deref(), Some("disk full"));
    }

    #[test]
    fn any_flag_stops_workers() {
        let c = TransferControl::new();
        c.request_pause();
        assert!(c.should_stop());
        let c = TransferControl::new();
        c.request_cancel();
        assert!(c.should_stop());
    }
}
