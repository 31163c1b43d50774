//! Execution lock for handler code.
//!
//! Handler callbacks never run directly on a reactor thread's stack. They are
//! passed through a [`Runtime`], which guarantees serialized execution no
//! matter which thread raised the event.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::ReentrantMutex;

use crate::metrics;

/// Serializes execution of handler code.
///
/// `enter` runs `f` to completion while holding the runtime's exclusive lock.
/// It may be called from any thread, including one that is already inside
/// `enter`.
pub trait Runtime: Send + Sync + 'static {
    fn enter(&self, f: &mut dyn FnMut());
}

/// Default [`Runtime`]: one process-wide critical section.
///
/// Re-entrant, so handler code that calls back into the bridge on the same
/// thread does not deadlock.
#[derive(Default)]
pub struct ExecutionLock {
    lock: ReentrantMutex<()>,
}

impl ExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Runtime for ExecutionLock {
    fn enter(&self, f: &mut dyn FnMut()) {
        let _guard = self.lock.lock();
        f();
    }
}

/// Run `f` inside the runtime and return its result.
///
/// A panic inside `f` is caught, logged and counted; the caller sees `None`.
/// The reactor thread keeps running.
pub fn call<R, F>(rt: &dyn Runtime, f: F) -> Option<R>
where
    F: FnOnce() -> R,
{
    let mut f = Some(f);
    let mut out = None;
    rt.enter(&mut || {
        if let Some(f) = f.take() {
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(v) => out = Some(v),
                Err(payload) => {
                    metrics::HANDLER_PANICS.increment();
                    tracing::error!(panic = panic_message(&*payload), "handler panicked");
                }
            }
        }
    });
    out
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}
