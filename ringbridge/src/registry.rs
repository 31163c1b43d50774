//! Handler registry: reference-counted native holds on handler objects.
//!
//! Every interval in which native state (a pending connect, a listening
//! socket, a live connection record) refers to a handler is covered by a
//! [`Hold`]. The registry keeps one strong reference per pinned object for as
//! long as at least one hold exists, and drops it when the last hold goes.
//! Holds release on drop, so an early return can never leak a pin.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::metrics;

struct Entry {
    _keepalive: Box<dyn Send + Sync>,
    holds: usize,
}

/// Pin table keyed by object identity. Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: Arc<Mutex<HashMap<usize, Entry>>>,
}

fn identity<T: ?Sized>(obj: &Arc<T>) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a hold on `obj`. Nested pins of the same object are counted;
    /// each returned hold balances exactly one of them.
    pub fn pin<T>(&self, obj: &Arc<T>) -> Hold
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = identity(obj);
        let mut entries = self.entries.lock();
        entries
            .entry(key)
            .or_insert_with(|| Entry {
                _keepalive: Box::new(Arc::clone(obj)),
                holds: 0,
            })
            .holds += 1;
        metrics::REGISTRY_HOLDS.increment();
        Hold {
            registry: self.clone(),
            key,
            active: true,
        }
    }

    fn unpin(&self, key: usize) {
        // The keepalive is dropped after the lock is released: dropping the
        // last strong reference runs arbitrary destructors.
        let released = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&key) else {
                return;
            };
            entry.holds -= 1;
            metrics::REGISTRY_HOLDS.decrement();
            if entry.holds == 0 {
                entries.remove(&key)
            } else {
                None
            }
        };
        drop(released);
    }

    /// Outstanding holds on `obj` (0 when not pinned).
    pub fn holds<T: ?Sized>(&self, obj: &Arc<T>) -> usize {
        self.entries
            .lock()
            .get(&identity(obj))
            .map_or(0, |e| e.holds)
    }

    /// Number of distinct objects currently pinned.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("pinned", &self.len())
            .finish()
    }
}

/// One native hold on a pinned object. Unpins on drop.
#[must_use = "dropping a Hold unpins the object immediately"]
pub struct Hold {
    registry: HandlerRegistry,
    key: usize,
    active: bool,
}

impl Hold {
    /// Release the hold now. Equivalent to dropping it.
    pub fn release(mut self) {
        self.unpin();
    }

    fn unpin(&mut self) {
        if std::mem::take(&mut self.active) {
            self.registry.unpin(self.key);
        }
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        self.unpin();
    }
}

impl fmt::Debug for Hold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hold")
            .field("key", &format_args!("{:#x}", self.key))
            .field("active", &self.active)
            .finish()
    }
}
