//! Single-threaded io_uring reactor.
//!
//! One loop thread owns the ring. Reactor methods may be called from any
//! thread: socket state lives in a shared table, and anything that needs the
//! ring travels to the loop as a [`Command`] with an eventfd wake-up.

mod completion;
mod event_loop;
mod net;
mod ring;
mod table;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::Error;
use crate::metrics;
use crate::reactor::{ConnectSite, ListenSite, Protocol, Reactor, SocketHandle};

use event_loop::EventLoop;
use ring::Ring;
use table::{SlotState, SocketTable};

/// Result type for [`ReactorBuilder::launch`].
type LaunchResult = Result<
    (
        Arc<UringReactor>,
        ShutdownHandle,
        thread::JoinHandle<Result<(), Error>>,
    ),
    Error,
>;

/// Requests handed to the loop thread.
pub(crate) enum Command {
    Listen {
        fd: OwnedFd,
        path: Option<PathBuf>,
        site: Box<dyn ListenSite>,
    },
    Connect {
        handle: SocketHandle,
        timeout: u8,
    },
    ConnectFailed(Box<dyn ConnectSite>),
    Attach(SocketHandle),
    Close(SocketHandle),
    Force(SocketHandle),
    ArmWrite(SocketHandle),
    Flush(SocketHandle),
}

pub(crate) struct Shared {
    pub(crate) table: Mutex<SocketTable>,
    pub(crate) config: Config,
    pub(crate) shutdown: AtomicBool,
    tx: Sender<Command>,
    eventfd: OwnedFd,
    loop_thread: OnceLock<ThreadId>,
}

impl Shared {
    /// Queue a command for the loop. Hands it back if the loop has exited.
    pub(crate) fn send(&self, cmd: Command) -> Result<(), Command> {
        self.tx.send(cmd).map_err(|e| e.into_inner())?;
        self.wake();
        Ok(())
    }

    /// Wake the loop out of `submit_and_wait`. The loop drains its queue
    /// before blocking, so wakes from the loop thread itself are skipped.
    fn wake(&self) {
        if self.loop_thread.get() == Some(&thread::current().id()) {
            return;
        }
        self.kick();
    }

    fn kick(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(
                self.eventfd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            );
        }
    }
}

/// Handle returned by `launch()` to stop the reactor.
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    /// Signal the loop to shut down gracefully.
    ///
    /// Every attached socket sees `on_shutdown`, queued writes get one
    /// flush attempt, then every socket is closed, pending connects fail,
    /// listeners finish and the loop thread returns `Ok(())`.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.kick();
    }
}

/// Builder for launching the reactor thread.
pub struct ReactorBuilder {
    config: Config,
}

impl ReactorBuilder {
    pub fn new(config: Config) -> Self {
        ReactorBuilder { config }
    }

    /// Validate the config, set up the ring and start the loop thread.
    pub fn launch(self) -> LaunchResult {
        self.config.validate()?;

        let ring = Ring::setup(&self.config).map_err(|e| Error::RingSetup(e.to_string()))?;

        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if efd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let eventfd = unsafe { OwnedFd::from_raw_fd(efd) };

        let (tx, rx): (Sender<Command>, Receiver<Command>) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            table: Mutex::new(SocketTable::new(self.config.max_connections)),
            config: self.config,
            shutdown: AtomicBool::new(false),
            tx,
            eventfd,
            loop_thread: OnceLock::new(),
        });

        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("ringbridge-reactor".to_string())
            .spawn(move || {
                let mut event_loop = EventLoop::new(ring, loop_shared, rx);
                event_loop.run()
            })
            .map_err(Error::Io)?;

        tracing::debug!("reactor started");
        Ok((
            Arc::new(UringReactor {
                shared: Arc::clone(&shared),
            }),
            ShutdownHandle { shared },
            handle,
        ))
    }
}

/// [`Reactor`] backed by the io_uring loop thread.
pub struct UringReactor {
    shared: Arc<Shared>,
}

fn stopped() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "reactor stopped")
}

impl UringReactor {
    /// Live sockets, including ones still connecting.
    pub fn active_count(&self) -> usize {
        self.shared.table.lock().active_count()
    }

    fn fail_connect(&self, site: Box<dyn ConnectSite>) {
        // Reported from the loop thread, like any other connect outcome.
        if let Err(Command::ConnectFailed(site)) = self.shared.send(Command::ConnectFailed(site)) {
            site.on_fail();
        }
    }
}

impl Reactor for UringReactor {
    fn listen(
        &self,
        port: Option<&str>,
        address: Option<&str>,
        site: Box<dyn ListenSite>,
    ) -> io::Result<()> {
        let endpoint = net::listen_endpoint(port, address)?;
        let fd = net::listen(&endpoint, self.shared.config.backlog)?;
        let path = match endpoint {
            net::Endpoint::Unix(path) => Some(path),
            net::Endpoint::Tcp(_) => None,
        };
        tracing::debug!(port, address, "listening");
        self.shared
            .send(Command::Listen { fd, path, site })
            .map_err(|_| stopped())
    }

    fn connect(
        &self,
        port: Option<&str>,
        address: Option<&str>,
        timeout: u8,
        site: Box<dyn ConnectSite>,
    ) {
        let fd = match net::connect_endpoint(port, address).and_then(|ep| net::connect(&ep)) {
            Ok(fd) => fd,
            Err(e) => {
                tracing::debug!(port, address, error = %e, "connect refused");
                self.fail_connect(site);
                return;
            }
        };
        if self.shared.config.tcp_nodelay {
            net::set_nodelay(fd.as_raw_fd());
        }
        let timeout = if timeout == 0 {
            self.shared.config.connect_timeout
        } else {
            timeout
        };

        let handle = {
            let mut table = self.shared.table.lock();
            match table.allocate(fd, SlotState::Connecting, self.shared.config.default_timeout) {
                Ok(handle) => {
                    if let Some(slot) = table.get_mut(handle) {
                        slot.connect_site = Some(site);
                    }
                    handle
                }
                Err(_fd) => {
                    tracing::warn!("connection limit reached, failing connect");
                    drop(table);
                    self.fail_connect(site);
                    return;
                }
            }
        };

        if self
            .shared
            .send(Command::Connect { handle, timeout })
            .is_err()
        {
            let released = self.shared.table.lock().release(handle);
            if let Some(site) = released.and_then(|r| r.connect_site) {
                site.on_fail();
            }
        }
    }

    fn open(&self, fd: OwnedFd) -> io::Result<SocketHandle> {
        net::set_nonblocking(fd.as_raw_fd())?;
        if self.shared.config.tcp_nodelay {
            net::set_nodelay(fd.as_raw_fd());
        }
        self.shared
            .table
            .lock()
            .allocate(fd, SlotState::Open, self.shared.config.default_timeout)
            .map_err(|_fd| io::Error::other(Error::ConnectionLimitReached))
    }

    fn attach(
        &self,
        handle: SocketHandle,
        protocol: Box<dyn Protocol>,
    ) -> Result<(), Box<dyn Protocol>> {
        {
            let mut table = self.shared.table.lock();
            match table.get_mut(handle) {
                Some(slot)
                    if slot.state == SlotState::Open
                        && slot.protocol.is_none()
                        && !slot.attach_pending
                        && !slot.close_requested =>
                {
                    slot.protocol = Some(protocol);
                    slot.attach_pending = true;
                }
                _ => return Err(protocol),
            }
        }
        if self.shared.send(Command::Attach(handle)).is_err() {
            let released = self.shared.table.lock().release(handle);
            if let Some(protocol) = released.and_then(|r| r.protocol) {
                return Err(protocol);
            }
        }
        Ok(())
    }

    fn read(&self, handle: SocketHandle, buf: &mut [u8]) -> isize {
        let mut table = self.shared.table.lock();
        let Some(slot) = table.get_mut(handle) else {
            return -1;
        };
        let Some(fd) = slot.raw_fd() else {
            return -1;
        };
        let n = unsafe {
            libc::recv(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n > 0 {
            slot.last_active = std::time::Instant::now();
            metrics::BYTES_RECEIVED.add(n as u64);
            return n;
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => return 0,
                _ => {
                    tracing::debug!(handle = handle.index(), error = %err, "read failed");
                    slot.outbound.clear();
                    slot.pending_bytes = 0;
                }
            }
        }
        // EOF or error: close once queued writes are out.
        if slot.close_requested {
            return -1;
        }
        slot.close_requested = true;
        drop(table);
        let _ = self.shared.send(Command::Close(handle));
        -1
    }

    fn write(&self, handle: SocketHandle, data: Bytes) -> io::Result<()> {
        let schedule = {
            let mut table = self.shared.table.lock();
            let slot = table
                .get_mut(handle)
                .filter(|s| s.state == SlotState::Open && !s.close_requested)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotConnected, "invalid connection")
                })?;
            if data.is_empty() {
                return Ok(());
            }
            slot.pending_bytes += data.len();
            slot.outbound.push_back(data);
            slot.drain_owed = true;
            let schedule = !slot.flush_scheduled && !slot.poll_out;
            if schedule {
                slot.flush_scheduled = true;
            }
            schedule
        };
        if schedule {
            self.shared
                .send(Command::Flush(handle))
                .map_err(|_| stopped())?;
        }
        Ok(())
    }

    fn close(&self, handle: SocketHandle) {
        {
            let mut table = self.shared.table.lock();
            let Some(slot) = table.get_mut(handle) else {
                return;
            };
            if slot.close_requested {
                return;
            }
            slot.close_requested = true;
        }
        let _ = self.shared.send(Command::Close(handle));
    }

    fn force_event(&self, handle: SocketHandle) {
        {
            let mut table = self.shared.table.lock();
            let Some(slot) = table.get_mut(handle) else {
                return;
            };
            if slot.forced || slot.close_requested {
                return;
            }
            slot.forced = true;
        }
        let _ = self.shared.send(Command::Force(handle));
    }

    fn arm_write(&self, handle: SocketHandle) {
        let _ = self.shared.send(Command::ArmWrite(handle));
    }

    fn set_timeout(&self, handle: SocketHandle, secs: u8) {
        if let Some(slot) = self.shared.table.lock().get_mut(handle) {
            slot.timeout = secs;
        }
    }

    fn timeout(&self, handle: SocketHandle) -> u8 {
        self.shared
            .table
            .lock()
            .get(handle)
            .map_or(0, |s| s.timeout)
    }

    fn pending(&self, handle: SocketHandle) -> usize {
        self.shared
            .table
            .lock()
            .get(handle)
            .map_or(0, |s| s.pending_bytes)
    }
}
