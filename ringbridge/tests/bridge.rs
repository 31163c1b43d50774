//! Integration tests: connection factory and event dispatch against the
//! scripted reactor in `common`.

mod common;

use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use ringbridge::{ConnectArgs, Error, Handler, HandlerFactory, ListenArgs, MAX_READ, handler};

use common::{Read, Recorder, mock_bridge};

fn recorder_with(f: impl FnOnce(&mut Recorder)) -> Arc<Recorder> {
    let mut rec = Recorder::default();
    f(&mut rec);
    Arc::new(rec)
}

// ── Listen ──────────────────────────────────────────────────────────

#[test]
fn listen_without_handler_is_argument_error() {
    let (bridge, reactor) = mock_bridge();
    let err = bridge
        .listen(ListenArgs::new().port("3000"), None)
        .err()
        .unwrap();
    assert!(matches!(err, Error::MissingFactory));
    assert!(err.is_argument());
    assert_eq!(reactor.listener_count(), 0);
    assert!(bridge.registry().is_empty());
}

#[test]
fn listen_prefers_explicit_handler_over_block() {
    let (bridge, reactor) = mock_bridge();
    let explicit = handler::shared(Recorder::new());
    let block = handler::shared(Recorder::new());
    let used = bridge
        .listen(
            ListenArgs::new().port("3000").handler(explicit.clone()),
            Some(block.clone()),
        )
        .unwrap();
    assert_eq!(
        Arc::as_ptr(&used) as *const (),
        Arc::as_ptr(&explicit) as *const ()
    );
    assert_eq!(bridge.registry().holds(&explicit), 1);
    assert_eq!(bridge.registry().holds(&block), 0);
    assert_eq!(reactor.listener_count(), 1);
}

#[test]
fn listen_uses_block_when_no_handler() {
    let (bridge, _reactor) = mock_bridge();
    let block = handler::shared(Recorder::new());
    let used = bridge.listen(ListenArgs::new(), Some(block.clone())).unwrap();
    assert_eq!(
        Arc::as_ptr(&used) as *const (),
        Arc::as_ptr(&block) as *const ()
    );
}

#[test]
fn listen_failure_is_opaque_and_unpins() {
    let (bridge, reactor) = mock_bridge();
    reactor.fail_listen.store(true, Ordering::Relaxed);
    let factory = handler::shared(Recorder::new());
    let err = bridge
        .listen(ListenArgs::new().port("3000").handler(factory.clone()), None)
        .err()
        .unwrap();
    assert!(matches!(err, Error::Listen));
    assert_eq!(
        err.to_string(),
        "failed to listen to requested address, unknown error."
    );
    assert_eq!(bridge.registry().holds(&factory), 0);
    assert!(bridge.registry().is_empty());
}

#[test]
fn listener_holds_factory_until_finish() {
    let (bridge, reactor) = mock_bridge();
    let factory = handler::shared(Recorder::new());
    bridge
        .listen(ListenArgs::new().port("3000").handler(factory.clone()), None)
        .unwrap();
    assert_eq!(bridge.registry().holds(&factory), 1);

    reactor.finish_listener(0);
    assert_eq!(bridge.registry().holds(&factory), 0);
    assert!(bridge.registry().is_empty());
}

#[test]
fn bye_scenario() {
    let (bridge, reactor) = mock_bridge();
    let rec = recorder_with(|r| r.close_on_bye = true);
    bridge
        .listen(
            ListenArgs::new().port("3000").handler(handler::shared(rec.clone())),
            None,
        )
        .unwrap();

    let h = reactor.accept(0);
    reactor.push_read(h, Read::Data(b"bye\n".to_vec()));
    reactor.data(h);
    assert_eq!(reactor.closes(), vec![h]);

    reactor.process_closes();
    assert_eq!(rec.events(), vec!["open", "message", "close"]);
    assert_eq!(rec.messages(), vec![b"bye\n".to_vec()]);
    assert_eq!(bridge.registry().holds(&rec), 0);
}

#[test]
fn factory_called_per_connection() {
    let (bridge, reactor) = mock_bridge();
    let made: Arc<Mutex<Vec<Arc<Recorder>>>> = Arc::default();
    let made2 = made.clone();
    let factory: Arc<dyn HandlerFactory> = Arc::new(move || -> Option<Arc<dyn Handler>> {
        let rec = Recorder::new();
        made2.lock().push(rec.clone());
        Some(rec)
    });
    bridge
        .listen(ListenArgs::new().port("3000").handler(factory), None)
        .unwrap();

    let a = reactor.accept(0);
    let b = reactor.accept(0);
    let made = made.lock().clone();
    assert_eq!(made.len(), 2);
    assert_eq!(made[0].events(), vec!["open"]);
    assert_eq!(made[1].events(), vec!["open"]);

    // Each record pins its own handler.
    assert_eq!(bridge.registry().holds(&made[0]), 1);
    reactor.close_socket(a);
    reactor.close_socket(b);
    assert_eq!(bridge.registry().holds(&made[0]), 0);
    assert_eq!(bridge.registry().holds(&made[1]), 0);
}

#[test]
fn declined_factory_closes_silently() {
    let (bridge, reactor) = mock_bridge();
    let factory: Arc<dyn HandlerFactory> = Arc::new(|| None::<Arc<dyn Handler>>);
    bridge
        .listen(ListenArgs::new().port("3000").handler(factory), None)
        .unwrap();

    let h = reactor.accept(0);
    assert!(!reactor.is_attached(h));
    assert_eq!(reactor.closes(), vec![h]);
    assert!(reactor.arm_writes().is_empty());

    // Only the listener's hold remains.
    assert_eq!(bridge.registry().len(), 1);
    reactor.finish_listener(0);
    assert!(bridge.registry().is_empty());
}

#[test]
fn panicking_factory_counts_as_declined() {
    let (bridge, reactor) = mock_bridge();
    let factory: Arc<dyn HandlerFactory> =
        Arc::new(|| -> Option<Arc<dyn Handler>> { panic!("factory failure") });
    bridge
        .listen(ListenArgs::new().port("3000").handler(factory), None)
        .unwrap();

    let h = reactor.accept(0);
    assert!(!reactor.is_attached(h));
    assert_eq!(reactor.closes(), vec![h]);
}

// ── Dispatch ────────────────────────────────────────────────────────

fn listening(rec: &Arc<Recorder>) -> (ringbridge::Bridge, Arc<common::MockReactor>) {
    let (bridge, reactor) = mock_bridge();
    bridge
        .listen(
            ListenArgs::new().port("3000").handler(handler::shared(rec.clone())),
            None,
        )
        .unwrap();
    (bridge, reactor)
}

#[test]
fn write_ready_installed_after_open() {
    let rec = Recorder::new();
    let (_bridge, reactor) = listening(&rec);

    let h = reactor.accept_deferred(0);
    assert!(reactor.is_attached(h));
    assert!(reactor.arm_writes().is_empty());

    // Early readiness and data before the record is attached are ignored.
    reactor.ready(h);
    reactor.push_read(h, Read::Data(b"early".to_vec()));
    reactor.data(h);
    assert!(rec.events().is_empty());

    reactor.attach_now(h);
    assert_eq!(reactor.arm_writes(), vec![h]);
    reactor.ready(h);
    reactor.data(h);
    assert_eq!(rec.events(), vec!["open", "drained", "message"]);
    assert_eq!(rec.messages(), vec![b"early".to_vec()]);
}

#[test]
fn full_read_forces_redelivery() {
    let rec = Recorder::new();
    let (_bridge, reactor) = listening(&rec);
    let h = reactor.accept(0);

    reactor.push_read(h, Read::Data(vec![7u8; MAX_READ * 2 + 5]));
    reactor.data(h);

    let sizes: Vec<usize> = rec.messages().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![MAX_READ, MAX_READ, 5]);
    assert_eq!(reactor.force_calls(), 2);
}

#[test]
fn exact_capacity_read_forces_once() {
    let rec = Recorder::new();
    let (_bridge, reactor) = listening(&rec);
    let h = reactor.accept(0);

    reactor.push_read(h, Read::Data(vec![1u8; MAX_READ]));
    reactor.data(h);

    assert_eq!(rec.messages().len(), 1);
    assert_eq!(reactor.force_calls(), 1);
}

#[test]
fn short_read_does_not_force() {
    let rec = Recorder::new();
    let (_bridge, reactor) = listening(&rec);
    let h = reactor.accept(0);

    reactor.push_read(h, Read::Data(vec![1u8; MAX_READ - 1]));
    reactor.data(h);
    reactor.push_read(h, Read::Data(vec![2u8; 1]));
    reactor.data(h);

    assert_eq!(rec.messages().len(), 2);
    assert_eq!(reactor.force_calls(), 0);
}

#[test]
fn empty_and_failed_reads_deliver_nothing() {
    let rec = Recorder::new();
    let (_bridge, reactor) = listening(&rec);
    let h = reactor.accept(0);

    reactor.data(h);
    reactor.push_read(h, Read::Eof);
    reactor.data(h);

    assert_eq!(rec.events(), vec!["open"]);
    assert_eq!(reactor.force_calls(), 0);
}

#[test]
fn message_bytes_are_binary() {
    let rec = recorder_with(|r| r.echo = true);
    let (_bridge, reactor) = listening(&rec);
    let h = reactor.accept(0);

    let payload = vec![0u8, 0xff, 0xfe, b'\n', 0x80];
    reactor.push_read(h, Read::Data(payload.clone()));
    reactor.data(h);

    assert_eq!(rec.messages(), vec![payload.clone()]);
    assert_eq!(reactor.written(h), payload);
}

#[test]
fn ping_only_while_open() {
    let rec = Recorder::new();
    let (_bridge, reactor) = listening(&rec);
    let h = reactor.accept(0);

    reactor.ping(h);
    reactor.shutdown(h);
    reactor.ping(h);
    assert_eq!(rec.events(), vec!["open", "ping", "shutdown"]);
}

#[test]
fn shutdown_then_close() {
    let rec = Recorder::new();
    let (bridge, reactor) = listening(&rec);
    let h = reactor.accept(0);

    reactor.shutdown(h);
    reactor.shutdown(h);
    reactor.push_read(h, Read::Data(b"late".to_vec()));
    reactor.data(h);
    reactor.ready(h);
    reactor.close_socket(h);

    assert_eq!(rec.events(), vec!["open", "shutdown", "drained", "close"]);
    assert_eq!(bridge.registry().holds(&rec), 0);
}

#[test]
fn close_is_final() {
    let rec = Recorder::new();
    let (_bridge, reactor) = listening(&rec);
    let h = reactor.accept(0);
    let conn = rec.connection().unwrap();
    assert!(conn.is_open());
    assert_eq!(conn.handle(), h);

    reactor.close_socket(h);
    reactor.close_socket(h);
    reactor.push_read(h, Read::Data(b"x".to_vec()));
    reactor.data(h);
    reactor.ready(h);
    reactor.ping(h);

    assert_eq!(rec.events(), vec!["open", "close"]);
    assert!(!conn.is_open());
    let err = conn.write(b"x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    // Closing a closed connection is a no-op.
    conn.close();
    assert!(reactor.closes().is_empty());
}

#[test]
fn panicking_message_handler_still_closes() {
    let rec = recorder_with(|r| r.panic_on_message = true);
    let (bridge, reactor) = listening(&rec);
    let h = reactor.accept(0);

    reactor.push_read(h, Read::Data(b"boom".to_vec()));
    reactor.data(h);
    reactor.push_read(h, Read::Data(b"again".to_vec()));
    reactor.data(h);
    reactor.close_socket(h);

    assert_eq!(rec.events(), vec!["open", "message", "message", "close"]);
    assert_eq!(bridge.registry().holds(&rec), 0);
}

#[test]
fn connection_timeout_round_trip() {
    let rec = Recorder::new();
    let (_bridge, reactor) = listening(&rec);
    reactor.accept(0);
    let conn = rec.connection().unwrap();

    assert_eq!(conn.timeout(), 0);
    conn.set_timeout(15);
    assert_eq!(conn.timeout(), 15);
    assert_eq!(conn.pending(), 0);
}

// ── Connect ─────────────────────────────────────────────────────────

#[test]
fn connect_requires_handler() {
    let (bridge, reactor) = mock_bridge();
    let err = bridge
        .connect(ConnectArgs::new().port("9").address("203.0.113.1"))
        .err()
        .unwrap();
    assert!(matches!(err, Error::MissingHandler));
    assert!(err.is_argument());
    assert_eq!(reactor.connect_count(), 0);
}

#[test]
fn connect_failure_only_reports_closed() {
    let (bridge, reactor) = mock_bridge();
    let rec = Recorder::new();
    let returned = bridge
        .connect(
            ConnectArgs::new()
                .port("9")
                .address("203.0.113.1")
                .handler(rec.clone())
                .timeout(1),
        )
        .unwrap();
    assert_eq!(
        Arc::as_ptr(&returned) as *const (),
        Arc::as_ptr(&rec) as *const ()
    );
    assert_eq!(reactor.connect_timeout(0), 1);
    assert_eq!(bridge.registry().holds(&rec), 1);
    assert!(rec.events().is_empty());

    reactor.connect_fail(0);
    assert_eq!(rec.events(), vec!["closed(none)"]);
    assert!(bridge.registry().is_empty());
}

#[test]
fn connect_success_attaches() {
    let (bridge, reactor) = mock_bridge();
    let rec = Recorder::new();
    bridge
        .connect(ConnectArgs::new().port("6379").handler(rec.clone()))
        .unwrap();

    let h = reactor.connect_ok(0);
    assert_eq!(rec.events(), vec!["open"]);
    assert_eq!(bridge.registry().holds(&rec), 1);

    reactor.close_socket(h);
    assert_eq!(rec.events(), vec!["open", "close"]);
    assert!(bridge.registry().is_empty());
}

#[test]
fn connect_refused_attach_reports_closed() {
    let (bridge, reactor) = mock_bridge();
    let rec = Recorder::new();
    bridge
        .connect(ConnectArgs::new().port("6379").handler(rec.clone()))
        .unwrap();

    reactor.refuse_attach.store(true, Ordering::Relaxed);
    let h = reactor.connect_ok(0);
    assert!(!reactor.is_attached(h));
    assert_eq!(rec.events(), vec!["closed(none)"]);
    assert!(bridge.registry().is_empty());
}

#[test]
fn connect_timeout_clamped() {
    let (bridge, reactor) = mock_bridge();
    bridge
        .connect(ConnectArgs::new().port("1").handler(Recorder::new()).timeout(1000))
        .unwrap();
    bridge
        .connect(ConnectArgs::new().port("1").handler(Recorder::new()))
        .unwrap();
    assert_eq!(reactor.connect_timeout(0), u8::MAX);
    assert_eq!(reactor.connect_timeout(1), 0);
}

// ── Attach fd ───────────────────────────────────────────────────────

#[test]
fn attach_fd_requires_handler() {
    let (bridge, _reactor) = mock_bridge();
    let err = bridge.attach_fd(0, None).err().unwrap();
    assert!(matches!(err, Error::MissingHandler));
}

#[test]
fn attach_fd_invalid_descriptor() {
    let (bridge, reactor) = mock_bridge();
    let rec = Recorder::new();
    let err = bridge.attach_fd(-1, Some(rec.clone())).err().unwrap();
    assert!(matches!(err, Error::InvalidFd(_)));
    assert!(err.is_io());
    assert_eq!(bridge.registry().holds(&rec), 0);
    assert_eq!(reactor.opened_fds(), 0);
    assert!(rec.events().is_empty());
}

#[test]
fn attach_fd_duplicates_descriptor() {
    let (bridge, reactor) = mock_bridge();
    let rec = Recorder::new();
    let (a, _b) = UnixStream::pair().unwrap();

    bridge.attach_fd(a.as_raw_fd(), Some(rec.clone())).unwrap();
    assert_eq!(reactor.opened_fds(), 1);
    assert!(a.peer_addr().is_ok());

    let h = reactor.last_handle();
    assert!(reactor.is_attached(h));
    assert!(rec.events().is_empty());
    reactor.attach_now(h);
    assert_eq!(rec.events(), vec!["open"]);

    reactor.close_socket(h);
    assert_eq!(rec.events(), vec!["open", "close"]);
    assert!(bridge.registry().is_empty());
}

#[test]
fn attach_fd_after_reactor_stopped() {
    let (bridge, reactor) = mock_bridge();
    let rec = Recorder::new();
    let (a, _b) = UnixStream::pair().unwrap();

    reactor.refuse_attach.store(true, Ordering::Relaxed);
    let err = bridge.attach_fd(a.as_raw_fd(), Some(rec.clone())).err().unwrap();
    assert!(matches!(err, Error::Io(ref e) if e.kind() == ErrorKind::NotConnected));
    assert!(err.is_io());
    assert!(!reactor.is_attached(reactor.last_handle()));
    assert!(bridge.registry().is_empty());
    assert!(rec.events().is_empty());
}

#[test]
fn shared_handler_pinned_per_connection() {
    let opened = Arc::new(AtomicUsize::new(0));

    struct Count(Arc<AtomicUsize>);
    impl Handler for Count {
        fn on_open(&self, _conn: &ringbridge::Connection) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let (bridge, reactor) = mock_bridge();
    let shared: Arc<dyn Handler> = Arc::new(Count(opened.clone()));
    bridge
        .listen(
            ListenArgs::new().port("3000").handler(handler::shared(shared.clone())),
            None,
        )
        .unwrap();

    let handles: Vec<_> = (0..8).map(|_| reactor.accept(0)).collect();
    assert_eq!(opened.load(Ordering::SeqCst), 8);
    assert_eq!(bridge.registry().holds(&shared), 8);
    for h in handles {
        reactor.close_socket(h);
    }
    assert_eq!(bridge.registry().holds(&shared), 0);
}
