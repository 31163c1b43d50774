//! Connection record and event dispatch for raw TCP/Unix sockets.
//!
//! One [`RawProtocol`] lives in the reactor per attached socket. It turns
//! reactor events into handler notifications, in order, through the runtime.

use std::io;
use std::sync::Arc;

use crate::bridge::Core;
use crate::buffer::ReadBuffer;
use crate::connection::Connection;
use crate::handler::Handler;
use crate::metrics;
use crate::reactor::{Protocol, SocketHandle};
use crate::registry::Hold;

const SERVICE: &str = "ringbridge raw TCP/IP connection";

/// Lifecycle of a connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Open,
    ShuttingDown,
    Closed,
}

/// Per-socket record: the connection handed to user code, the hold keeping
/// its handler alive, and the dispatch phase.
pub struct RawProtocol {
    connection: Connection,
    phase: Phase,
    /// Write-ready is only honored once `on_open` has returned.
    ready_installed: bool,
    _hold: Hold,
}

impl RawProtocol {
    fn new(connection: Connection, hold: Hold) -> Self {
        RawProtocol {
            connection,
            phase: Phase::Connecting,
            ready_installed: false,
            _hold: hold,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

impl Protocol for RawProtocol {
    fn service(&self) -> &'static str {
        SERVICE
    }

    fn on_attach(&mut self, handle: SocketHandle) {
        if self.phase != Phase::Connecting {
            return;
        }
        tracing::debug!(handle = handle.index(), service = SERVICE, "open");
        metrics::CONNECTIONS_OPENED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();

        self.connection.fire_open();
        self.phase = Phase::Open;
        self.ready_installed = true;
        self.connection.reactor().arm_write(handle);
    }

    fn on_data(&mut self, handle: SocketHandle) {
        if self.phase != Phase::Open {
            return;
        }
        let mut buf = ReadBuffer::new();
        let n = buf.fill(self.connection.reactor(), handle);
        tracing::trace!(handle = handle.index(), bytes = n, "read");
        if n <= 0 {
            return;
        }

        self.connection.fire_message(buf.as_bytes());
        metrics::MESSAGES_DELIVERED.increment();

        if buf.is_full() {
            // A full read says nothing about what is left on the socket.
            metrics::READS_FORCED.increment();
            tracing::debug!(handle = handle.index(), "full read, forcing data event");
            self.connection.reactor().force_event(handle);
        }
    }

    fn on_ready(&mut self, _handle: SocketHandle) {
        if !self.ready_installed {
            return;
        }
        if matches!(self.phase, Phase::Open | Phase::ShuttingDown) {
            self.connection.fire_drained();
        }
    }

    fn on_shutdown(&mut self, handle: SocketHandle) {
        if self.phase != Phase::Open {
            return;
        }
        tracing::debug!(handle = handle.index(), "shutdown");
        self.connection.fire_shutdown();
        self.phase = Phase::ShuttingDown;
    }

    fn ping(&mut self, _handle: SocketHandle) {
        if self.phase == Phase::Open {
            self.connection.fire_ping();
        }
    }

    fn on_close(mut self: Box<Self>, handle: SocketHandle) {
        tracing::debug!(handle = handle.index(), phase = ?self.phase, "close");
        if self.phase != Phase::Connecting {
            metrics::CONNECTIONS_CLOSED.increment();
            metrics::CONNECTIONS_ACTIVE.decrement();
        }
        self.connection.fire_close();
        self.phase = Phase::Closed;
        // The record and its hold are released here.
    }
}

/// Bind `handler` to `handle` and register the record with the reactor.
///
/// A missing handler means the caller declined the socket: it is closed
/// without any notification. Fails with `NotConnected` when the reactor
/// refuses the record (stale handle or stopped loop); the record and its hold
/// are dropped and the handler hears nothing.
pub(crate) fn attach(
    core: &Core,
    handle: SocketHandle,
    handler: Option<Arc<dyn Handler>>,
) -> io::Result<()> {
    let Some(handler) = handler else {
        tracing::debug!(handle = handle.index(), "declined, closing");
        core.reactor.close(handle);
        return Ok(());
    };

    let hold = core.registry.pin(&handler);
    let connection = Connection::new(
        handle,
        handler,
        Arc::clone(&core.reactor),
        Arc::clone(&core.runtime),
    );
    let record = Box::new(RawProtocol::new(connection, hold));
    if let Err(record) = core.reactor.attach(handle, record) {
        tracing::warn!(
            handle = handle.index(),
            service = record.service(),
            "attach refused"
        );
        return Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "reactor refused the connection",
        ));
    }
    Ok(())
}
