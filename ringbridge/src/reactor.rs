//! The reactor seam.
//!
//! A reactor multiplexes socket readiness on its own thread and raises events
//! against [`SocketHandle`]s. The bridge only needs the surface below; the
//! crate ships one implementation in [`crate::uring`].

use std::io;
use std::os::fd::OwnedFd;

use bytes::Bytes;

/// Opaque handle for a socket owned by a reactor.
///
/// Handles carry a generation so that a handle kept past close never aliases
/// the next socket placed in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl SocketHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        SocketHandle { index, generation }
    }

    /// Slot index. Useful for indexing into per-socket arrays.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Per-socket callback table.
///
/// The reactor serializes every call for a given socket: no two methods of
/// the same protocol object ever run concurrently. `on_attach` is delivered
/// before any other event, and `on_close` is delivered exactly once, last.
pub trait Protocol: Send {
    /// Short name used in logs.
    fn service(&self) -> &'static str;

    /// The socket is ready to raise notifications.
    fn on_attach(&mut self, handle: SocketHandle);

    /// Data is available to read.
    fn on_data(&mut self, handle: SocketHandle);

    /// The outbound queue has been flushed. Only raised after `arm_write`.
    fn on_ready(&mut self, handle: SocketHandle);

    /// The reactor is stopping. The socket will be closed afterwards.
    fn on_shutdown(&mut self, handle: SocketHandle);

    /// The idle timeout elapsed with no activity.
    fn ping(&mut self, handle: SocketHandle);

    /// The socket has been torn down. Consumes the protocol.
    fn on_close(self: Box<Self>, handle: SocketHandle);
}

/// Callbacks for a listening socket.
pub trait ListenSite: Send {
    /// A connection was accepted. The site is expected to attach a protocol
    /// to `handle` or close it.
    fn on_open(&mut self, handle: SocketHandle);

    /// The listener is gone. Called once.
    fn on_finish(self: Box<Self>);
}

/// Callbacks for an outbound connect. Exactly one of them is called.
pub trait ConnectSite: Send {
    fn on_connect(self: Box<Self>, handle: SocketHandle);

    /// Connect failed or timed out.
    fn on_fail(self: Box<Self>);
}

/// Surface a reactor exposes to the bridge.
pub trait Reactor: Send + Sync {
    /// Start listening. `port == None` selects a Unix-domain socket at
    /// `address`; `address == None` binds all interfaces.
    fn listen(
        &self,
        port: Option<&str>,
        address: Option<&str>,
        site: Box<dyn ListenSite>,
    ) -> io::Result<()>;

    /// Start an outbound connect. The result is delivered through `site` on
    /// the reactor thread, never synchronously. `timeout` is in seconds; 0
    /// selects the reactor default.
    fn connect(
        &self,
        port: Option<&str>,
        address: Option<&str>,
        timeout: u8,
        site: Box<dyn ConnectSite>,
    );

    /// Take ownership of a connected descriptor.
    fn open(&self, fd: OwnedFd) -> io::Result<SocketHandle>;

    /// Bind a protocol to a socket. On a stale handle the protocol is handed
    /// back untouched.
    fn attach(
        &self,
        handle: SocketHandle,
        protocol: Box<dyn Protocol>,
    ) -> Result<(), Box<dyn Protocol>>;

    /// Non-blocking read. Returns the byte count, 0 when nothing is pending,
    /// or a negative value on EOF or error.
    fn read(&self, handle: SocketHandle, buf: &mut [u8]) -> isize;

    /// Queue data for sending.
    fn write(&self, handle: SocketHandle, data: Bytes) -> io::Result<()>;

    /// Close after flushing queued writes.
    fn close(&self, handle: SocketHandle);

    /// Re-deliver the data event for `handle` within the current cycle.
    fn force_event(&self, handle: SocketHandle);

    /// Install the write-ready callback for `handle`.
    fn arm_write(&self, handle: SocketHandle);

    /// Set the idle timeout in seconds. 0 disables pings.
    fn set_timeout(&self, handle: SocketHandle, secs: u8);

    fn timeout(&self, handle: SocketHandle) -> u8;

    /// Bytes queued but not yet written.
    fn pending(&self, handle: SocketHandle) -> usize;
}
