use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::handler::Handler;
use crate::reactor::{Reactor, SocketHandle};
use crate::runtime::{self, Runtime};

/// The connection object handed to [`Handler`] callbacks.
///
/// Created once per socket. Cheap to clone; clones refer to the same
/// connection and may be kept by the handler to write from elsewhere.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    handle: SocketHandle,
    handler: Arc<dyn Handler>,
    reactor: Arc<dyn Reactor>,
    runtime: Arc<dyn Runtime>,
    open: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        handle: SocketHandle,
        handler: Arc<dyn Handler>,
        reactor: Arc<dyn Reactor>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        Connection {
            inner: Arc::new(Inner {
                handle,
                handler,
                reactor,
                runtime,
                open: AtomicBool::new(false),
            }),
        }
    }

    pub fn handle(&self) -> SocketHandle {
        self.inner.handle
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.inner.handler
    }

    /// True between `on_open` and `on_close`.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Queue `data` for sending. Fails with `NotConnected` once closed.
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        self.write_bytes(Bytes::copy_from_slice(data))
    }

    pub fn write_bytes(&self, data: Bytes) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }
        self.inner.reactor.write(self.inner.handle, data)
    }

    /// Close once queued writes have been flushed. `on_close` follows.
    pub fn close(&self) {
        if self.is_open() {
            self.inner.reactor.close(self.inner.handle);
        }
    }

    /// Idle timeout in seconds.
    pub fn timeout(&self) -> u8 {
        self.inner.reactor.timeout(self.inner.handle)
    }

    pub fn set_timeout(&self, secs: u8) {
        self.inner.reactor.set_timeout(self.inner.handle, secs);
    }

    /// Bytes queued but not yet written.
    pub fn pending(&self) -> usize {
        self.inner.reactor.pending(self.inner.handle)
    }

    // ── Notification entry points ───────────────────────────────────

    pub(crate) fn runtime(&self) -> &dyn Runtime {
        &*self.inner.runtime
    }

    pub(crate) fn reactor(&self) -> &dyn Reactor {
        &*self.inner.reactor
    }

    pub(crate) fn fire_open(&self) {
        self.inner.open.store(true, Ordering::Release);
        runtime::call(self.runtime(), || self.inner.handler.on_open(self));
    }

    pub(crate) fn fire_message(&self, data: &[u8]) {
        runtime::call(self.runtime(), || self.inner.handler.on_message(self, data));
    }

    pub(crate) fn fire_drained(&self) {
        runtime::call(self.runtime(), || self.inner.handler.on_drained(self));
    }

    pub(crate) fn fire_ping(&self) {
        runtime::call(self.runtime(), || self.inner.handler.ping(self));
    }

    pub(crate) fn fire_shutdown(&self) {
        runtime::call(self.runtime(), || self.inner.handler.on_shutdown(self));
    }

    pub(crate) fn fire_close(&self) {
        self.inner.open.store(false, Ordering::Release);
        runtime::call(self.runtime(), || self.inner.handler.on_close(self));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.inner.handle)
            .field("open", &self.is_open())
            .finish()
    }
}
