use std::sync::Arc;

use crate::connection::Connection;

/// Notifications delivered to user code for a connection.
///
/// Every method has a no-op default; leaving one out is how a handler says it
/// does not care about that event. Calls for one connection are serialized
/// and arrive in lifecycle order: `on_open` first, `on_close` last and once.
pub trait Handler: Send + Sync + 'static {
    /// The connection is established and may be written to.
    fn on_open(&self, _conn: &Connection) {}

    /// Bytes arrived. `data` is raw and never text-decoded; it is only valid
    /// for the duration of the call.
    fn on_message(&self, _conn: &Connection, _data: &[u8]) {}

    /// All previously queued writes have been flushed.
    fn on_drained(&self, _conn: &Connection) {}

    /// The idle timeout elapsed. The connection stays open unless the
    /// handler closes it.
    fn ping(&self, _conn: &Connection) {}

    /// The reactor is stopping; the connection closes right after.
    fn on_shutdown(&self, _conn: &Connection) {}

    /// The connection was torn down.
    fn on_close(&self, _conn: &Connection) {}

    /// An outbound connect failed before a connection existed. Called with
    /// `None`, and no other notification is delivered.
    fn on_closed(&self, _conn: Option<&Connection>) {}
}

/// Produces a handler for each accepted connection.
///
/// Returning `None` declines the connection: the socket is closed with no
/// notifications.
pub trait HandlerFactory: Send + Sync + 'static {
    fn call(&self) -> Option<Arc<dyn Handler>>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Option<Arc<dyn Handler>> + Send + Sync + 'static,
{
    fn call(&self) -> Option<Arc<dyn Handler>> {
        self()
    }
}

/// A factory that hands the same handler to every connection.
pub fn shared(handler: Arc<dyn Handler>) -> Arc<dyn HandlerFactory> {
    Arc::new(Shared(handler))
}

struct Shared(Arc<dyn Handler>);

impl HandlerFactory for Shared {
    fn call(&self) -> Option<Arc<dyn Handler>> {
        Some(Arc::clone(&self.0))
    }
}
