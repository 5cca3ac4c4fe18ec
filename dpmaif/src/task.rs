//! Background task plumbing.
//!
//! Every data path task is a named OS thread with a stop flag, woken with
//! park/unpark. Fatal errors a task cannot handle itself are latched in a
//! [`FaultLatch`] and picked up by the control layer on its next entry.
//!
//! # Lifecycle
//! ```text
//!   spawn() ──> RUNNING ──stop()──> STOPPING ──join──> DONE
//!                  │                                    ▲
//!                  └──── task returns (error latched) ──┘
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::error::{DpmaifError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// FAULT LATCH
// ═══════════════════════════════════════════════════════════════════════════

/// First fatal error raised by any task since the last reset.
#[derive(Debug, Default)]
pub struct FaultLatch {
    raised: AtomicBool,
    error: Mutex<Option<DpmaifError>>,
}

impl FaultLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fatal error. Later errors are logged and dropped.
    pub fn raise(&self, err: DpmaifError) {
        let mut slot = self.error.lock();
        if slot.is_some() {
            log::debug!(target: "dpmaif::task", "fault already latched, dropping: {}", err);
            return;
        }
        log::error!(target: "dpmaif::task", "fatal data path fault: {}", err);
        *slot = Some(err);
        self.raised.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Take the latched error, clearing the latch.
    pub fn take(&self) -> Option<DpmaifError> {
        if !self.is_raised() {
            return None;
        }
        let err = self.error.lock().take();
        self.raised.store(false, Ordering::Release);
        err
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WAKER
// ═══════════════════════════════════════════════════════════════════════════

/// Wakes whichever thread is attached. Wakes with nothing attached are
/// lost; attached tasks also poll on a timeout.
#[derive(Debug, Default)]
pub struct TaskWaker {
    thread: Mutex<Option<Thread>>,
}

impl TaskWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, thread: Thread) {
        *self.thread.lock() = Some(thread);
    }

    pub fn detach(&self) {
        *self.thread.lock() = None;
    }

    pub fn wake(&self) {
        if let Some(t) = self.thread.lock().as_ref() {
            t.unpark();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TASK
// ═══════════════════════════════════════════════════════════════════════════

/// View of the stop flag handed to the task body.
#[derive(Debug, Clone)]
pub struct TaskContext {
    running: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn should_stop(&self) -> bool {
        !self.running.load(Ordering::Acquire)
    }

    /// Sleep until woken, stopped or `timeout` elapses.
    pub fn park_timeout(&self, timeout: Duration) {
        if !self.should_stop() {
            thread::park_timeout(timeout);
        }
    }
}

/// Owner of one background thread. Dropping it stops and joins the thread.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Start `body` on a new named thread.
    ///
    /// A fatal error returned by `body` is raised on `latch`; transient
    /// ones are logged.
    pub fn spawn<F>(name: impl Into<String>, latch: Arc<FaultLatch>, body: F) -> Result<Self>
    where
        F: FnOnce(&TaskContext) -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let running = Arc::new(AtomicBool::new(true));
        let ctx = TaskContext {
            running: running.clone(),
        };
        let task_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                log::debug!(target: "dpmaif::task", "{} started", task_name);
                match body(&ctx) {
                    Ok(()) => log::debug!(target: "dpmaif::task", "{} exited", task_name),
                    Err(e) if e.is_fatal() => latch.raise(e),
                    Err(e) => log::warn!(target: "dpmaif::task", "{} exited: {}", task_name, e),
                }
            })
            .map_err(|e| {
                log::error!(target: "dpmaif::task", "spawn {} failed: {}", name, e);
                DpmaifError::TaskSpawn
            })?;
        Ok(Self {
            name,
            running,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread(&self) -> Option<&Thread> {
        self.handle.as_ref().map(|h| h.thread())
    }

    pub fn wake(&self) {
        if let Some(t) = self.thread() {
            t.unpark();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signal stop and wait for the body to return.
    ///
    /// Returns once the thread has exited. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.thread().unpark();
        handle.join().map_err(|_| {
            log::error!(target: "dpmaif::task", "{} panicked", self.name);
            DpmaifError::TaskPanicked(self.name.clone())
        })
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!(target: "dpmaif::task", "{} join error: {}", self.name, e);
        }
    }
}
