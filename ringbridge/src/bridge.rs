//! Entry points that create connection records: listen, connect, attach-fd.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::{fmt, io};

use crate::error::Error;
use crate::handler::{Handler, HandlerFactory};
use crate::metrics;
use crate::protocol;
use crate::reactor::{ConnectSite, ListenSite, Reactor, SocketHandle};
use crate::registry::{HandlerRegistry, Hold};
use crate::runtime::{self, Runtime};

/// State shared by every site and connection record created by a [`Bridge`].
pub(crate) struct Core {
    pub(crate) reactor: Arc<dyn Reactor>,
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) registry: HandlerRegistry,
}

/// Arguments for [`Bridge::listen`].
#[derive(Clone, Default)]
pub struct ListenArgs {
    /// Port to listen on. `None` listens on a Unix-domain socket at `address`.
    pub port: Option<String>,
    /// Address to bind. `None` binds all interfaces.
    pub address: Option<String>,
    /// Produces a handler per accepted connection.
    pub handler: Option<Arc<dyn HandlerFactory>>,
}

impl ListenArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn handler(mut self, factory: Arc<dyn HandlerFactory>) -> Self {
        self.handler = Some(factory);
        self
    }
}

/// Arguments for [`Bridge::connect`].
#[derive(Clone, Default)]
pub struct ConnectArgs {
    pub port: Option<String>,
    /// Address to connect to. `None` targets the loopback address (or, with
    /// no port, is an error reported through `on_closed`).
    pub address: Option<String>,
    pub handler: Option<Arc<dyn Handler>>,
    /// Connect timeout in seconds, clamped to 0..=255. 0 or `None` selects the
    /// reactor default.
    pub timeout: Option<u32>,
}

impl ConnectArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn timeout(mut self, secs: u32) -> Self {
        self.timeout = Some(secs);
        self
    }
}

/// Creates connection records on top of a [`Reactor`].
#[derive(Clone)]
pub struct Bridge {
    core: Arc<Core>,
}

impl Bridge {
    pub fn new(reactor: Arc<dyn Reactor>, runtime: Arc<dyn Runtime>) -> Self {
        Bridge {
            core: Arc::new(Core {
                reactor,
                runtime,
                registry: HandlerRegistry::new(),
            }),
        }
    }

    /// Registry holding every handler currently referenced by a site or a
    /// connection record.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.core.registry
    }

    pub fn reactor(&self) -> &Arc<dyn Reactor> {
        &self.core.reactor
    }

    /// Listen for connections. `args.handler` wins over `block`; one of them
    /// is required. Returns the factory in use.
    pub fn listen(
        &self,
        args: ListenArgs,
        block: Option<Arc<dyn HandlerFactory>>,
    ) -> Result<Arc<dyn HandlerFactory>, Error> {
        let factory = args.handler.or(block).ok_or(Error::MissingFactory)?;
        let hold = self.core.registry.pin(&factory);
        let site = Box::new(Listener {
            core: Arc::clone(&self.core),
            factory: Arc::clone(&factory),
            _hold: hold,
        });

        // On failure the site, and with it the hold, is dropped by the reactor.
        if let Err(e) = self
            .core
            .reactor
            .listen(args.port.as_deref(), args.address.as_deref(), site)
        {
            tracing::warn!(
                port = args.port.as_deref(),
                address = args.address.as_deref(),
                error = %e,
                "listen failed"
            );
            return Err(Error::Listen);
        }
        Ok(factory)
    }

    /// Start an outbound connection. Returns the handler immediately; the
    /// outcome is delivered through its notifications.
    pub fn connect(&self, args: ConnectArgs) -> Result<Arc<dyn Handler>, Error> {
        let handler = args.handler.ok_or(Error::MissingHandler)?;
        let timeout = clamp_timeout(args.timeout);
        let hold = self.core.registry.pin(&handler);
        let site = Box::new(Connector {
            core: Arc::clone(&self.core),
            handler: Arc::clone(&handler),
            _hold: hold,
        });
        self.core
            .reactor
            .connect(args.port.as_deref(), args.address.as_deref(), timeout, site);
        Ok(handler)
    }

    /// Attach an already-connected descriptor. The descriptor is duplicated;
    /// the caller keeps ownership of `fd`.
    pub fn attach_fd(
        &self,
        fd: RawFd,
        handler: Option<Arc<dyn Handler>>,
    ) -> Result<Arc<dyn Handler>, Error> {
        let handler = handler.ok_or(Error::MissingHandler)?;
        let _hold = self.core.registry.pin(&handler);

        let owned = dup_fd(fd).map_err(|e| {
            tracing::warn!(fd, error = %e, "attach_fd: invalid fd");
            Error::InvalidFd(e)
        })?;
        let handle = self.core.reactor.open(owned)?;
        protocol::attach(&self.core, handle, Some(Arc::clone(&handler)))?;
        Ok(handler)
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("registry", &self.core.registry)
            .finish()
    }
}

fn clamp_timeout(secs: Option<u32>) -> u8 {
    secs.map_or(0, |t| t.min(u8::MAX as u32) as u8)
}

fn dup_fd(fd: RawFd) -> io::Result<OwnedFd> {
    let new = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if new < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

/// Listening site: asks the factory for a handler per accepted socket.
struct Listener {
    core: Arc<Core>,
    factory: Arc<dyn HandlerFactory>,
    _hold: Hold,
}

impl ListenSite for Listener {
    fn on_open(&mut self, handle: SocketHandle) {
        let handler = runtime::call(&*self.core.runtime, || self.factory.call()).flatten();
        // The new handler is only reachable from this frame until the record
        // takes its own hold.
        let _hold = handler.as_ref().map(|h| self.core.registry.pin(h));
        // Refusal is logged by `attach`; the peer just sees the socket go away.
        let _ = protocol::attach(&self.core, handle, handler);
    }

    fn on_finish(self: Box<Self>) {
        tracing::debug!("listener finished");
    }
}

/// Connect site: attaches on success, reports `on_closed(None)` on failure.
struct Connector {
    core: Arc<Core>,
    handler: Arc<dyn Handler>,
    _hold: Hold,
}

impl ConnectSite for Connector {
    fn on_connect(self: Box<Self>, handle: SocketHandle) {
        tracing::debug!(handle = handle.index(), "connected");
        if protocol::attach(&self.core, handle, Some(Arc::clone(&self.handler))).is_err() {
            metrics::CONNECT_FAILED.increment();
            runtime::call(&*self.core.runtime, || self.handler.on_closed(None));
        }
    }

    fn on_fail(self: Box<Self>) {
        tracing::debug!("connect failed");
        metrics::CONNECT_FAILED.increment();
        runtime::call(&*self.core.runtime, || self.handler.on_closed(None));
    }
}
