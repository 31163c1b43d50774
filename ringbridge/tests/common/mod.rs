//! Scripted in-memory reactor and a recording handler.
//!
//! `MockReactor` implements [`Reactor`] without any sockets. Tests drive it
//! explicitly: accept a connection, feed reads, raise write-ready, shutdown,
//! ping and close. Every call the bridge makes into it is recorded.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use ringbridge::{
    Bridge, ConnectSite, Connection, ExecutionLock, Handler, ListenSite, Protocol, Reactor,
    SocketHandle,
};

// ── Mock reactor ───────────────────────────────────────────────────

/// One scripted result for `Reactor::read`.
pub enum Read {
    Data(Vec<u8>),
    Eof,
}

#[derive(Default)]
struct State {
    listeners: Vec<Option<Box<dyn ListenSite>>>,
    connects: Vec<Option<Box<dyn ConnectSite>>>,
    connect_timeouts: Vec<u8>,
    live: HashSet<SocketHandle>,
    protocols: HashMap<SocketHandle, Box<dyn Protocol>>,
    reads: HashMap<SocketHandle, VecDeque<Read>>,
    written: HashMap<SocketHandle, Vec<u8>>,
    timeouts: HashMap<SocketHandle, u8>,
    forced: HashSet<SocketHandle>,
    force_calls: usize,
    closes: Vec<SocketHandle>,
    arm_writes: Vec<SocketHandle>,
    opened_fds: Vec<OwnedFd>,
}

#[derive(Default)]
pub struct MockReactor {
    state: Mutex<State>,
    next_index: AtomicU32,
    /// Make the next `listen` fail.
    pub fail_listen: std::sync::atomic::AtomicBool,
    /// Refuse every `attach`, as a reactor whose loop has exited does.
    pub refuse_attach: std::sync::atomic::AtomicBool,
}

impl MockReactor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn new_handle(&self) -> SocketHandle {
        let h = SocketHandle::new(self.next_index.fetch_add(1, Ordering::Relaxed), 0);
        self.state.lock().live.insert(h);
        h
    }

    // ── Inspection ──

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.iter().flatten().count()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects.iter().flatten().count()
    }

    pub fn connect_timeout(&self, i: usize) -> u8 {
        self.state.lock().connect_timeouts[i]
    }

    pub fn is_attached(&self, h: SocketHandle) -> bool {
        self.state.lock().protocols.contains_key(&h)
    }

    pub fn written(&self, h: SocketHandle) -> Vec<u8> {
        self.state.lock().written.get(&h).cloned().unwrap_or_default()
    }

    pub fn force_calls(&self) -> usize {
        self.state.lock().force_calls
    }

    pub fn closes(&self) -> Vec<SocketHandle> {
        self.state.lock().closes.clone()
    }

    pub fn arm_writes(&self) -> Vec<SocketHandle> {
        self.state.lock().arm_writes.clone()
    }

    pub fn opened_fds(&self) -> usize {
        self.state.lock().opened_fds.len()
    }

    // ── Driving events ──

    /// Run `f` against the protocol bound to `h` with the state unlocked.
    fn with_protocol(&self, h: SocketHandle, f: impl FnOnce(&mut Box<dyn Protocol>)) {
        let Some(mut p) = self.state.lock().protocols.remove(&h) else {
            return;
        };
        f(&mut p);
        self.state.lock().protocols.insert(h, p);
    }

    /// Accept a connection on listener `i`. Delivers `on_attach` when the
    /// site attached a record.
    pub fn accept(&self, i: usize) -> SocketHandle {
        let h = self.accept_deferred(i);
        self.attach_now(h);
        h
    }

    /// Accept on listener `i` but hold back `on_attach`, as a reactor does
    /// until its next cycle.
    pub fn accept_deferred(&self, i: usize) -> SocketHandle {
        let h = self.new_handle();
        let site = self.state.lock().listeners[i].take();
        if let Some(mut site) = site {
            site.on_open(h);
            self.state.lock().listeners[i] = Some(site);
        }
        h
    }

    /// Most recently issued handle.
    pub fn last_handle(&self) -> SocketHandle {
        SocketHandle::new(self.next_index.load(Ordering::Relaxed) - 1, 0)
    }

    /// Complete connect request `i`.
    pub fn connect_ok(&self, i: usize) -> SocketHandle {
        let h = self.new_handle();
        let site = self.state.lock().connects[i].take();
        if let Some(site) = site {
            site.on_connect(h);
        }
        self.attach_now(h);
        h
    }

    pub fn connect_fail(&self, i: usize) {
        let site = self.state.lock().connects[i].take();
        if let Some(site) = site {
            site.on_fail();
        }
    }

    pub fn finish_listener(&self, i: usize) {
        let site = self.state.lock().listeners[i].take();
        if let Some(site) = site {
            site.on_finish();
        }
    }

    /// Deliver `on_attach` for `h`.
    pub fn attach_now(&self, h: SocketHandle) {
        self.with_protocol(h, |p| p.on_attach(h));
    }

    pub fn push_read(&self, h: SocketHandle, read: Read) {
        self.state
            .lock()
            .reads
            .entry(h)
            .or_default()
            .push_back(read);
    }

    /// Raise one data event, then replay forced events until none remain.
    pub fn data(&self, h: SocketHandle) {
        self.with_protocol(h, |p| p.on_data(h));
        loop {
            if !self.state.lock().forced.remove(&h) {
                break;
            }
            self.with_protocol(h, |p| p.on_data(h));
        }
    }

    pub fn ready(&self, h: SocketHandle) {
        self.with_protocol(h, |p| p.on_ready(h));
    }

    pub fn shutdown(&self, h: SocketHandle) {
        self.with_protocol(h, |p| p.on_shutdown(h));
    }

    pub fn ping(&self, h: SocketHandle) {
        self.with_protocol(h, |p| p.ping(h));
    }

    /// Tear the socket down, delivering `on_close` if a record is bound.
    pub fn close_socket(&self, h: SocketHandle) {
        let p = {
            let mut state = self.state.lock();
            state.live.remove(&h);
            state.protocols.remove(&h)
        };
        if let Some(p) = p {
            p.on_close(h);
        }
    }

    /// Close every socket the bridge asked to close.
    pub fn process_closes(&self) {
        for h in self.closes() {
            self.close_socket(h);
        }
    }
}

impl Reactor for MockReactor {
    fn listen(
        &self,
        _port: Option<&str>,
        _address: Option<&str>,
        site: Box<dyn ListenSite>,
    ) -> io::Result<()> {
        if self.fail_listen.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"));
        }
        self.state.lock().listeners.push(Some(site));
        Ok(())
    }

    fn connect(
        &self,
        _port: Option<&str>,
        _address: Option<&str>,
        timeout: u8,
        site: Box<dyn ConnectSite>,
    ) {
        let mut state = self.state.lock();
        state.connects.push(Some(site));
        state.connect_timeouts.push(timeout);
    }

    fn open(&self, fd: OwnedFd) -> io::Result<SocketHandle> {
        self.state.lock().opened_fds.push(fd);
        Ok(self.new_handle())
    }

    fn attach(
        &self,
        handle: SocketHandle,
        protocol: Box<dyn Protocol>,
    ) -> Result<(), Box<dyn Protocol>> {
        if self.refuse_attach.load(Ordering::Relaxed) {
            return Err(protocol);
        }
        let mut state = self.state.lock();
        if !state.live.contains(&handle) || state.protocols.contains_key(&handle) {
            return Err(protocol);
        }
        state.protocols.insert(handle, protocol);
        Ok(())
    }

    fn read(&self, handle: SocketHandle, buf: &mut [u8]) -> isize {
        let mut state = self.state.lock();
        let Some(queue) = state.reads.get_mut(&handle) else {
            return 0;
        };
        match queue.pop_front() {
            None => 0,
            Some(Read::Eof) => -1,
            Some(Read::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    queue.push_front(Read::Data(data.split_off(n)));
                }
                n as isize
            }
        }
    }

    fn write(&self, handle: SocketHandle, data: Bytes) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.live.contains(&handle) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "invalid connection"));
        }
        state.written.entry(handle).or_default().extend_from_slice(&data);
        Ok(())
    }

    fn close(&self, handle: SocketHandle) {
        self.state.lock().closes.push(handle);
    }

    fn force_event(&self, handle: SocketHandle) {
        let mut state = self.state.lock();
        state.force_calls += 1;
        state.forced.insert(handle);
    }

    fn arm_write(&self, handle: SocketHandle) {
        self.state.lock().arm_writes.push(handle);
    }

    fn set_timeout(&self, handle: SocketHandle, secs: u8) {
        self.state.lock().timeouts.insert(handle, secs);
    }

    fn timeout(&self, handle: SocketHandle) -> u8 {
        self.state.lock().timeouts.get(&handle).copied().unwrap_or(0)
    }

    fn pending(&self, _handle: SocketHandle) -> usize {
        0
    }
}

/// Bridge over a fresh mock reactor with the default execution lock.
pub fn mock_bridge() -> (Bridge, Arc<MockReactor>) {
    let reactor = MockReactor::new();
    let bridge = Bridge::new(reactor.clone(), Arc::new(ExecutionLock::new()));
    (bridge, reactor)
}

// ── Recording handler ──────────────────────────────────────────────

/// Handler that logs every notification it receives.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
    messages: Mutex<Vec<Vec<u8>>>,
    conn: Mutex<Option<Connection>>,
    /// Close the connection when a message equals `"bye\n"`.
    pub close_on_bye: bool,
    /// Echo every message back.
    pub echo: bool,
    /// Panic inside `on_message` after recording it.
    pub panic_on_message: bool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().clone()
    }

    /// Connection seen by `on_open`.
    pub fn connection(&self) -> Option<Connection> {
        self.conn.lock().clone()
    }

    fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }
}

impl Handler for Recorder {
    fn on_open(&self, conn: &Connection) {
        self.push("open");
        *self.conn.lock() = Some(conn.clone());
    }

    fn on_message(&self, conn: &Connection, data: &[u8]) {
        self.push("message");
        self.messages.lock().push(data.to_vec());
        if self.echo {
            let _ = conn.write(data);
        }
        if self.close_on_bye && data == b"bye\n" {
            conn.close();
        }
        if self.panic_on_message {
            panic!("handler failure");
        }
    }

    fn on_drained(&self, _conn: &Connection) {
        self.push("drained");
    }

    fn ping(&self, _conn: &Connection) {
        self.push("ping");
    }

    fn on_shutdown(&self, _conn: &Connection) {
        self.push("shutdown");
    }

    fn on_close(&self, _conn: &Connection) {
        self.push("close");
    }

    fn on_closed(&self, conn: Option<&Connection>) {
        self.push(if conn.is_some() { "closed" } else { "closed(none)" });
    }
}
