//! Cooperative task quiescence for safe reclaim.
//!
//! Before the arbitrator spills a donor's operators it must know that none
//! of the donor task's drivers will touch memory. Drivers cooperate through
//! a per-task token: they register while on thread, declare suspended
//! regions around I/O waits, and a pause request resolves once every
//! on-thread driver sits inside a suspended region.

use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Default)]
struct PauseInner {
    pause_requested: bool,
    drivers_on_thread: u32,
    drivers_suspended: u32,
    terminated: bool,
}

impl PauseInner {
    fn quiesced(&self) -> bool {
        self.drivers_on_thread.saturating_sub(self.drivers_suspended) == 0
    }
}

/// Per-task pause flag plus the condition drivers rendezvous on.
#[derive(Debug, Default)]
pub struct TaskPauseToken {
    inner: Mutex<PauseInner>,
    cv: Condvar,
}

impl TaskPauseToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the calling driver as running. Blocks while a pause is
    /// pending so that no driver enters a running state under a pause.
    pub fn enter_driver(&self) {
        let mut inner = self.inner.lock().expect("pause lock");
        while inner.pause_requested && !inner.terminated {
            inner = self.cv.wait(inner).expect("pause wait");
        }
        inner.drivers_on_thread += 1;
    }

    /// Unregister the calling driver.
    pub fn leave_driver(&self) {
        let mut inner = self.inner.lock().expect("pause lock");
        inner.drivers_on_thread = inner.drivers_on_thread.saturating_sub(1);
        self.cv.notify_all();
    }

    /// Enter a region in which the caller will not touch memory (I/O wait,
    /// arbitration wait). The region counts as paused; the returned guard
    /// re-blocks on exit while a pause is still pending.
    pub fn suspend(self: &Arc<Self>) -> SuspendGuard {
        let mut inner = self.inner.lock().expect("pause lock");
        inner.drivers_suspended += 1;
        self.cv.notify_all();
        SuspendGuard {
            token: Arc::clone(self),
        }
    }

    /// Request quiescence. Blocks until every on-thread driver is inside a
    /// suspended region, then returns a guard that resumes the task on
    /// drop. Returns `None` when the task is already terminating; callers
    /// treat such a donor as contributing zero.
    pub fn request_pause(self: &Arc<Self>) -> Option<PauseGuard> {
        let mut inner = self.inner.lock().expect("pause lock");
        while inner.pause_requested && !inner.terminated {
            // Serialize with a concurrent pauser.
            inner = self.cv.wait(inner).expect("pause wait");
        }
        if inner.terminated {
            return None;
        }
        inner.pause_requested = true;
        while !inner.quiesced() && !inner.terminated {
            inner = self.cv.wait(inner).expect("pause wait");
        }
        if inner.terminated {
            inner.pause_requested = false;
            self.cv.notify_all();
            return None;
        }
        Some(PauseGuard {
            token: Arc::clone(self),
        })
    }

    /// Whether all on-thread drivers could be paused without waiting.
    pub fn can_pause_immediately(&self) -> bool {
        let inner = self.inner.lock().expect("pause lock");
        inner.terminated || inner.quiesced()
    }

    /// Whether a pause is currently pending or held.
    pub fn pause_requested(&self) -> bool {
        self.inner.lock().expect("pause lock").pause_requested
    }

    /// Mark the task as terminating and wake every waiter. Pending pause
    /// requests resolve to `None`; suspended drivers exit freely.
    pub fn terminate(&self) {
        let mut inner = self.inner.lock().expect("pause lock");
        inner.terminated = true;
        self.cv.notify_all();
    }

    fn resume(&self) {
        let mut inner = self.inner.lock().expect("pause lock");
        inner.pause_requested = false;
        self.cv.notify_all();
    }

    fn leave_suspended(&self) {
        let mut inner = self.inner.lock().expect("pause lock");
        while inner.pause_requested && !inner.terminated {
            inner = self.cv.wait(inner).expect("pause wait");
        }
        inner.drivers_suspended = inner.drivers_suspended.saturating_sub(1);
        self.cv.notify_all();
    }
}

/// Scoped suspended region. Dropping leaves the region, waiting out any
/// pause that is still in progress.
#[derive(Debug)]
pub struct SuspendGuard {
    token: Arc<TaskPauseToken>,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.token.leave_suspended();
    }
}

/// Held pause. Dropping resumes the task.
#[derive(Debug)]
pub struct PauseGuard {
    token: Arc<TaskPauseToken>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.token.resume();
    }
}
