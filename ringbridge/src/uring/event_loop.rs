use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Buf;
use crossbeam_channel::Receiver;
use io_uring::types::Timespec;
use slab::Slab;

use super::completion::{OpTag, UserData};
use super::net;
use super::ring::Ring;
use super::table::SlotState;
use super::{Command, Shared};
use crate::error::Error;
use crate::metrics;
use crate::reactor::{ListenSite, Protocol, SocketHandle};

struct Listener {
    fd: OwnedFd,
    path: Option<PathBuf>,
    generation: u32,
    site: Box<dyn ListenSite>,
}

/// The reactor loop. Owns the ring; runs on the reactor thread.
pub(crate) struct EventLoop {
    // Dropped first: in-flight SQEs reference the buffers below.
    ring: Ring,
    shared: Arc<Shared>,
    rx: Receiver<Command>,
    listeners: Slab<Listener>,
    listener_generation: u32,
    eventfd_buf: [u8; 8],
    tick_ts: Timespec,
    tick_armed: bool,
    /// Per-slot connect timeouts; fixed size so pointers stay valid.
    connect_ts: Vec<Timespec>,
    cqe_batch: Vec<(u64, i32)>,
}

impl EventLoop {
    pub(crate) fn new(ring: Ring, shared: Arc<Shared>, rx: Receiver<Command>) -> Self {
        let tick = Duration::from_millis(shared.config.tick_interval_ms);
        let slots = shared.config.max_connections as usize;
        EventLoop {
            ring,
            rx,
            listeners: Slab::new(),
            listener_generation: 0,
            eventfd_buf: [0u8; 8],
            tick_ts: Timespec::new()
                .sec(tick.as_secs())
                .nsec(tick.subsec_nanos()),
            tick_armed: false,
            connect_ts: vec![Timespec::new(); slots],
            cqe_batch: Vec::with_capacity(256),
            shared,
        }
    }

    /// Run the loop. Blocks the current thread until shutdown.
    pub(crate) fn run(&mut self) -> Result<(), Error> {
        let _ = self.shared.loop_thread.set(thread::current().id());

        let eventfd = self.shared.eventfd.as_raw_fd();
        self.ring
            .submit_eventfd_read(eventfd, self.eventfd_buf.as_mut_ptr())?;

        loop {
            self.process_commands();

            if self.shared.shutdown.load(Ordering::Acquire) {
                self.run_shutdown();
                return Ok(());
            }

            // Arm a tick timeout before blocking.
            if !self.tick_armed {
                self.ring.submit_tick_timeout(&self.tick_ts as *const _)?;
                self.tick_armed = true;
            }

            // Commands raised while dispatching (forced reads, flushes) run on
            // the next pass; don't block while any are queued.
            if self.rx.is_empty() {
                self.ring.submit_and_wait(1)?;
            } else {
                self.ring.flush()?;
            }

            self.drain_completions();
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Handle the commands queued so far. Forced data events are replayed
    /// once each, after the rest.
    fn process_commands(&mut self) {
        let mut forced = Vec::new();
        for _ in 0..self.rx.len() {
            let Ok(cmd) = self.rx.try_recv() else {
                break;
            };
            match cmd {
                Command::Force(handle) => forced.push(handle),
                cmd => self.handle_command(cmd),
            }
        }
        for handle in forced {
            self.handle_forced(handle);
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Listen { fd, path, site } => self.add_listener(fd, path, site),
            Command::Connect { handle, timeout } => self.start_connect(handle, timeout),
            Command::ConnectFailed(site) => site.on_fail(),
            Command::Attach(handle) => self.handle_attach(handle),
            Command::Close(handle) => self.handle_close(handle),
            Command::Force(handle) => self.handle_forced(handle),
            Command::ArmWrite(handle) => self.handle_arm_write(handle),
            Command::Flush(handle) => {
                if let Some(slot) = self.shared.table.lock().get_mut(handle) {
                    slot.flush_scheduled = false;
                }
                self.flush(handle);
            }
        }
    }

    fn add_listener(&mut self, fd: OwnedFd, path: Option<PathBuf>, site: Box<dyn ListenSite>) {
        self.listener_generation = self.listener_generation.wrapping_add(1);
        let raw = fd.as_raw_fd();
        let key = self.listeners.insert(Listener {
            fd,
            path,
            generation: self.listener_generation,
            site,
        });
        if let Err(e) = self.ring.submit_accept(raw, key as u32, self.listener_generation) {
            tracing::warn!(error = %e, "failed to arm accept");
            self.finish_listener(key);
        }
    }

    fn start_connect(&mut self, handle: SocketHandle, timeout: u8) {
        let fd = {
            let table = self.shared.table.lock();
            match table.get(handle) {
                Some(slot) if slot.state == SlotState::Connecting => slot.raw_fd(),
                _ => None,
            }
        };
        let Some(fd) = fd else {
            return;
        };

        let ts = if timeout > 0 {
            let idx = handle.index();
            self.connect_ts[idx] = Timespec::new().sec(timeout as u64);
            Some(&self.connect_ts[idx] as *const Timespec)
        } else {
            None
        };
        if let Err(e) = self
            .ring
            .submit_connect_poll(fd, handle.index, handle.generation, ts)
        {
            tracing::warn!(handle = handle.index(), error = %e, "failed to arm connect");
            self.fail_connect(handle);
        }
    }

    fn handle_attach(&mut self, handle: SocketHandle) {
        let protocol = {
            let mut table = self.shared.table.lock();
            let Some(slot) = table.get_mut(handle) else {
                return;
            };
            if !slot.attach_pending {
                return;
            }
            slot.attach_pending = false;
            slot.protocol.take()
        };
        let Some(mut protocol) = protocol else {
            return;
        };
        tracing::debug!(handle = handle.index(), service = protocol.service(), "attach");
        protocol.on_attach(handle);
        self.restore(handle, protocol);
        self.arm_read(handle);
    }

    fn handle_close(&mut self, handle: SocketHandle) {
        let flushed = match self.shared.table.lock().get(handle) {
            Some(slot) => slot.outbound.is_empty(),
            None => return,
        };
        if flushed {
            self.teardown(handle);
        } else {
            // Teardown happens once the queue drains.
            self.flush(handle);
        }
    }

    fn handle_forced(&mut self, handle: SocketHandle) {
        match self.shared.table.lock().get_mut(handle) {
            Some(slot) => slot.forced = false,
            None => return,
        }
        self.with_protocol(handle, |p, h| p.on_data(h));
        self.arm_read(handle);
    }

    fn handle_arm_write(&mut self, handle: SocketHandle) {
        let shared = Arc::clone(&self.shared);
        let mut table = shared.table.lock();
        let Some(slot) = table.get_mut(handle) else {
            return;
        };
        slot.write_armed = true;
        slot.drain_owed = true;
        if slot.poll_out {
            return;
        }
        let Some(fd) = slot.raw_fd() else {
            return;
        };
        slot.poll_out = true;
        let ud = UserData::encode(OpTag::Writable, handle.index, handle.generation);
        if self
            .ring
            .submit_poll(fd, libc::POLLOUT as u32, ud)
            .is_err()
        {
            slot.poll_out = false;
        }
    }

    // ── Completions ──────────────────────────────────────────────────

    fn drain_completions(&mut self) {
        self.cqe_batch.clear();
        {
            let cq = self.ring.ring.completion();
            for cqe in cq {
                self.cqe_batch.push((cqe.user_data(), cqe.result()));
            }
        }
        for i in 0..self.cqe_batch.len() {
            let (user_data, result) = self.cqe_batch[i];
            self.dispatch_cqe(user_data, result);
        }
    }

    fn dispatch_cqe(&mut self, user_data_raw: u64, result: i32) {
        metrics::CQE_PROCESSED.increment();
        let ud = UserData(user_data_raw);
        let Some(tag) = ud.tag() else {
            return;
        };

        match tag {
            OpTag::Readable => self.handle_readable(ud, result),
            OpTag::Writable => self.handle_writable(ud, result),
            OpTag::Connect => self.handle_connect(ud, result),
            OpTag::ConnectTimeout => {}
            OpTag::Accept => self.handle_accept(ud, result),
            OpTag::EventFdRead => self.handle_eventfd_read(),
            OpTag::Tick => {
                self.tick_armed = false;
                self.check_timeouts();
            }
            OpTag::Cancel => {}
        }
    }

    fn handle_readable(&mut self, ud: UserData, result: i32) {
        let handle = SocketHandle::new(ud.index(), ud.generation());
        match self.shared.table.lock().get_mut(handle) {
            Some(slot) => slot.poll_in = false,
            None => return,
        }
        if result == -libc::ECANCELED {
            return;
        }
        self.with_protocol(handle, |p, h| p.on_data(h));
        self.arm_read(handle);
    }

    fn handle_writable(&mut self, ud: UserData, result: i32) {
        let handle = SocketHandle::new(ud.index(), ud.generation());
        match self.shared.table.lock().get_mut(handle) {
            Some(slot) => slot.poll_out = false,
            None => return,
        }
        if result == -libc::ECANCELED {
            return;
        }
        self.flush(handle);
    }

    fn handle_connect(&mut self, ud: UserData, result: i32) {
        let handle = SocketHandle::new(ud.index(), ud.generation());
        let fd = match self.shared.table.lock().get(handle) {
            Some(slot) if slot.state == SlotState::Connecting => slot.raw_fd(),
            _ => return,
        };
        let Some(fd) = fd else {
            return;
        };

        // -ECANCELED here means the linked timeout fired first.
        let outcome = if result < 0 {
            Err(io::Error::from_raw_os_error(-result))
        } else {
            net::take_error(fd)
        };
        if let Err(e) = outcome {
            tracing::debug!(handle = handle.index(), error = %e, "connect failed");
            self.fail_connect(handle);
            return;
        }

        let site = {
            let mut table = self.shared.table.lock();
            let Some(slot) = table.get_mut(handle) else {
                return;
            };
            slot.state = SlotState::Open;
            slot.last_active = Instant::now();
            slot.connect_site.take()
        };
        match site {
            Some(site) => site.on_connect(handle),
            None => self.teardown(handle),
        }
        // Nothing attached: nobody will ever close this socket.
        let orphaned = self
            .shared
            .table
            .lock()
            .get(handle)
            .is_some_and(|s| s.protocol.is_none() && !s.close_requested);
        if orphaned {
            self.teardown(handle);
        }
    }

    fn handle_accept(&mut self, ud: UserData, result: i32) {
        let key = ud.index() as usize;
        let live = self
            .listeners
            .get(key)
            .is_some_and(|l| l.generation == ud.generation());
        if !live {
            if result >= 0 {
                unsafe {
                    libc::close(result);
                }
            }
            return;
        }

        if result < 0 {
            match -result {
                libc::EINTR | libc::EAGAIN | libc::ECONNABORTED => {}
                libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => {
                    tracing::warn!(error = %io::Error::from_raw_os_error(-result), "accept failed");
                }
                _ => {
                    // Listener closed or cancelled.
                    self.finish_listener(key);
                    return;
                }
            }
        } else {
            self.accepted(key, unsafe { OwnedFd::from_raw_fd(result) });
        }

        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let Some(listener) = self.listeners.get(key) else {
            return;
        };
        let (raw, generation) = (listener.fd.as_raw_fd(), listener.generation);
        if let Err(e) = self.ring.submit_accept(raw, key as u32, generation) {
            tracing::warn!(error = %e, "failed to re-arm accept");
            self.finish_listener(key);
        }
    }

    fn accepted(&mut self, key: usize, fd: OwnedFd) {
        if self.shared.config.tcp_nodelay {
            net::set_nodelay(fd.as_raw_fd());
        }
        let allocated = self.shared.table.lock().allocate(
            fd,
            SlotState::Open,
            self.shared.config.default_timeout,
        );
        let handle = match allocated {
            Ok(handle) => handle,
            Err(_fd) => {
                tracing::warn!("connection limit reached, dropping accepted socket");
                return;
            }
        };
        if let Some(listener) = self.listeners.get_mut(key) {
            listener.site.on_open(handle);
        }
        let orphaned = self
            .shared
            .table
            .lock()
            .get(handle)
            .is_some_and(|s| s.protocol.is_none() && !s.close_requested);
        if orphaned {
            self.teardown(handle);
        }
    }

    fn handle_eventfd_read(&mut self) {
        // Commands are drained at the top of the loop.
        if !self.shared.shutdown.load(Ordering::Acquire) {
            let eventfd = self.shared.eventfd.as_raw_fd();
            let _ = self
                .ring
                .submit_eventfd_read(eventfd, self.eventfd_buf.as_mut_ptr());
        }
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();
        let due: Vec<SocketHandle> = {
            let mut table = self.shared.table.lock();
            let mut due = Vec::new();
            for handle in table.handles() {
                let Some(slot) = table.get_mut(handle) else {
                    continue;
                };
                if slot.state != SlotState::Open || slot.timeout == 0 || slot.protocol.is_none() {
                    continue;
                }
                if now.duration_since(slot.last_active) >= Duration::from_secs(slot.timeout as u64)
                {
                    slot.last_active = now;
                    due.push(handle);
                }
            }
            due
        };
        for handle in due {
            self.with_protocol(handle, |p, h| p.ping(h));
        }
    }

    // ── Socket helpers ───────────────────────────────────────────────

    /// Run `f` against the socket's protocol with the table unlocked.
    fn with_protocol<F>(&mut self, handle: SocketHandle, f: F)
    where
        F: FnOnce(&mut Box<dyn Protocol>, SocketHandle),
    {
        let protocol = {
            let mut table = self.shared.table.lock();
            match table.get_mut(handle) {
                Some(slot) if !slot.attach_pending => slot.protocol.take(),
                _ => None,
            }
        };
        if let Some(mut protocol) = protocol {
            f(&mut protocol, handle);
            self.restore(handle, protocol);
        }
    }

    fn restore(&mut self, handle: SocketHandle, protocol: Box<dyn Protocol>) {
        let mut table = self.shared.table.lock();
        match table.get_mut(handle) {
            Some(slot) => slot.protocol = Some(protocol),
            None => {
                drop(table);
                protocol.on_close(handle);
            }
        }
    }

    /// Arm POLLIN unless the socket is closing, unattached, already armed or
    /// has a forced read queued.
    fn arm_read(&mut self, handle: SocketHandle) {
        let shared = Arc::clone(&self.shared);
        let mut table = shared.table.lock();
        let Some(slot) = table.get_mut(handle) else {
            return;
        };
        if slot.state != SlotState::Open
            || slot.protocol.is_none()
            || slot.poll_in
            || slot.forced
            || slot.close_requested
        {
            return;
        }
        let Some(fd) = slot.raw_fd() else {
            return;
        };
        let ud = UserData::encode(OpTag::Readable, handle.index, handle.generation);
        if self.ring.submit_poll(fd, libc::POLLIN as u32, ud).is_ok() {
            slot.poll_in = true;
        }
    }

    /// Write out as much of the queue as the socket takes. Fires `on_ready`
    /// when the queue empties and closes if a close is pending.
    fn flush(&mut self, handle: SocketHandle) {
        let shared = Arc::clone(&self.shared);
        let (fire_ready, close) = {
            let mut table = shared.table.lock();
            let Some(slot) = table.get_mut(handle) else {
                return;
            };
            let Some(fd) = slot.raw_fd() else {
                return;
            };
            let mut failed = false;
            while let Some(front) = slot.outbound.front_mut() {
                match send(fd, front) {
                    Ok(n) => {
                        metrics::BYTES_SENT.add(n as u64);
                        slot.pending_bytes -= n;
                        slot.last_active = Instant::now();
                        if n == front.len() {
                            slot.outbound.pop_front();
                        } else {
                            front.advance(n);
                        }
                    }
                    Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                        if !slot.poll_out {
                            let ud =
                                UserData::encode(OpTag::Writable, handle.index, handle.generation);
                            if self.ring.submit_poll(fd, libc::POLLOUT as u32, ud).is_ok() {
                                slot.poll_out = true;
                            }
                        }
                        return;
                    }
                    Err(e) if e.raw_os_error() == Some(libc::EINTR) => {}
                    Err(e) => {
                        tracing::debug!(handle = handle.index(), error = %e, "send failed");
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                slot.outbound.clear();
                slot.pending_bytes = 0;
                (false, true)
            } else {
                let fire = slot.write_armed && slot.drain_owed;
                if fire {
                    slot.drain_owed = false;
                }
                (fire, slot.close_requested)
            }
        };

        if fire_ready {
            self.with_protocol(handle, |p, h| p.on_ready(h));
        }
        if close {
            self.teardown(handle);
        }
    }

    /// Tear a socket down and deliver its final callback.
    fn teardown(&mut self, handle: SocketHandle) {
        let released = {
            let mut table = self.shared.table.lock();
            if let Some(fd) = table.get(handle).and_then(|s| s.raw_fd()) {
                // Wakes any poll still holding the socket.
                unsafe {
                    libc::shutdown(fd, libc::SHUT_RDWR);
                }
            }
            table.release(handle)
        };
        let Some(released) = released else {
            return;
        };
        drop(released.fd);
        if let Some(protocol) = released.protocol {
            if released.attached {
                protocol.on_close(handle);
            } else {
                tracing::debug!(handle = handle.index(), "dropping unattached record");
            }
        }
        if let Some(site) = released.connect_site {
            site.on_fail();
        }
    }

    fn fail_connect(&mut self, handle: SocketHandle) {
        let released = self.shared.table.lock().release(handle);
        if let Some(site) = released.and_then(|r| r.connect_site) {
            site.on_fail();
        }
    }

    fn finish_listener(&mut self, key: usize) {
        let Some(listener) = self.listeners.try_remove(key) else {
            return;
        };
        let accept = UserData::encode(OpTag::Accept, key as u32, listener.generation);
        let _ = self.ring.submit_async_cancel(accept);
        unsafe {
            libc::shutdown(listener.fd.as_raw_fd(), libc::SHUT_RDWR);
        }
        drop(listener.fd);
        if let Some(path) = listener.path {
            let _ = std::fs::remove_file(path);
        }
        listener.site.on_finish();
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    fn run_shutdown(&mut self) {
        tracing::debug!("reactor shutting down");
        self.drain_for_shutdown();

        let handles = self.shared.table.lock().handles();
        for &handle in &handles {
            self.with_protocol(handle, |p, h| p.on_shutdown(h));
        }
        self.drain_for_shutdown();

        let handles = {
            let mut table = self.shared.table.lock();
            let handles = table.handles();
            for &handle in &handles {
                if let Some(slot) = table.get_mut(handle) {
                    slot.close_requested = true;
                }
            }
            handles
        };
        for handle in handles {
            self.flush(handle);
            self.teardown(handle);
        }
        self.drain_for_shutdown();

        let keys: Vec<usize> = self.listeners.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.finish_listener(key);
        }
        let _ = self.ring.flush();
        tracing::debug!("reactor stopped");
    }

    /// Handle queued commands without replaying forced reads.
    fn drain_for_shutdown(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                Command::Force(handle) => {
                    if let Some(slot) = self.shared.table.lock().get_mut(handle) {
                        slot.forced = false;
                    }
                }
                cmd => self.handle_command(cmd),
            }
        }
    }
}

fn send(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::send(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}
