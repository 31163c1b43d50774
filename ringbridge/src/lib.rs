//! ringbridge — connection lifecycle bridge between a socket reactor and
//! handler objects.
//!
//! A [`Reactor`] multiplexes raw TCP and Unix socket readiness on its own
//! thread. ringbridge turns its low-level events into an ordered sequence of
//! [`Handler`] notifications, run under a [`Runtime`] execution lock, while a
//! [`HandlerRegistry`] keeps every handler alive for as long as native state
//! refers to it.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ringbridge::{
//!     Bridge, Config, Connection, ExecutionLock, Handler, ListenArgs, ReactorBuilder, handler,
//! };
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&self, conn: &Connection, data: &[u8]) {
//!         if data == b"bye\n" {
//!             conn.close();
//!         } else {
//!             let _ = conn.write(data);
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), ringbridge::Error> {
//!     let (reactor, shutdown, thread) = ReactorBuilder::new(Config::default()).launch()?;
//!     let bridge = Bridge::new(reactor, Arc::new(ExecutionLock::new()));
//!     bridge.listen(
//!         ListenArgs::new().port("3000").handler(handler::shared(Arc::new(Echo))),
//!         None,
//!     )?;
//!     # shutdown.shutdown();
//!     thread.join().expect("reactor thread panicked")?;
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! The bundled reactor ([`UringReactor`]) is Linux-only and needs io_uring
//! (5.6+ for `PollAdd`, `Accept` and linked timeouts).

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod metrics;

// ── Public modules ──────────────────────────────────────────────────────
pub mod bridge;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod reactor;
pub mod registry;
pub mod runtime;
pub mod uring;

// ── Re-exports: bridge ──────────────────────────────────────────────────

/// Connection factory: listen, connect, attach-fd.
pub use bridge::Bridge;
/// Arguments for [`Bridge::connect`].
pub use bridge::ConnectArgs;
/// Arguments for [`Bridge::listen`].
pub use bridge::ListenArgs;
/// Connection object handed to handlers.
pub use connection::Connection;
/// Notifications delivered to user code.
pub use handler::Handler;
/// Produces a handler per accepted connection.
pub use handler::HandlerFactory;

// ── Re-exports: collaborators ───────────────────────────────────────────

/// Read buffer capacity.
pub use buffer::MAX_READ;
/// Connection record phase.
pub use protocol::Phase;
/// Per-socket callback table.
pub use reactor::Protocol;
/// Reactor surface used by the bridge.
pub use reactor::Reactor;
/// Opaque socket handle.
pub use reactor::SocketHandle;
pub use reactor::{ConnectSite, ListenSite};
/// Pin table for handler objects.
pub use registry::{HandlerRegistry, Hold};
/// Default execution lock.
pub use runtime::ExecutionLock;
/// Execution lock for handler code.
pub use runtime::Runtime;

// ── Re-exports: io_uring reactor ────────────────────────────────────────

pub use uring::{ReactorBuilder, ShutdownHandle, UringReactor};

// ── Re-exports: config & errors ─────────────────────────────────────────

pub use config::{Config, ConfigBuilder};
pub use error::Error;
