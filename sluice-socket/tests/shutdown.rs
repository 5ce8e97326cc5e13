//! Half-close semantics, close-time event cancellation and handler swaps.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use sluice_event::{Event, EventHandler, EventLoop, HandlerRef, ThreadPool};
use sluice_socket::{
    AddressFamily, ListenSocket, SocketError, SocketEvent, SocketEventFlag, SocketState,
    StreamSocket,
};

#[derive(Default)]
struct Recorder {
    events: Vec<SocketEvent>,
}

impl EventHandler for Recorder {
    fn on_event(&mut self, _ctx: &HandlerRef, event: Event) {
        if let Some(ev) = event.downcast_ref::<SocketEvent>() {
            self.events.push(*ev);
        }
    }
}

/// Parks its loop for the configured time on each event, so queued entries
/// stay observable.
struct Sleeper(Duration);

impl EventHandler for Sleeper {
    fn on_event(&mut self, _ctx: &HandlerRef, _event: Event) {
        thread::sleep(self.0);
    }
}

fn recorder(event_loop: &EventLoop) -> (HandlerRef, Arc<Mutex<Recorder>>) {
    let recorder = Arc::new(Mutex::new(Recorder::default()));
    let handler = event_loop.handle().register_shared(Arc::clone(&recorder));
    (handler, recorder)
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    pred()
}

/// Listener plus a connected client/server stream pair.
fn connected_pair(
    pool: &ThreadPool,
    client_handler: Option<HandlerRef>,
    server_handler: Option<HandlerRef>,
) -> (ListenSocket, StreamSocket, StreamSocket) {
    let mut listener = ListenSocket::new(pool, server_handler);
    listener.bind("127.0.0.1").unwrap();
    listener.listen(AddressFamily::Ipv4, 0).unwrap();
    let port = listener.local_port().unwrap();

    let mut client = StreamSocket::new(pool, client_handler);
    client
        .connect("127.0.0.1", port, AddressFamily::Ipv4)
        .unwrap();

    // Accept from this thread; readiness may lag the connect slightly.
    let deadline = Instant::now() + Duration::from_secs(10);
    let accepted = loop {
        match listener.accept() {
            Ok(stream) => break stream,
            Err(SocketError::WouldBlock) => {
                assert!(Instant::now() < deadline, "accept timed out");
                thread::sleep(Duration::from_millis(10));
            }
            Err(other) => panic!("accept failed: {other:?}"),
        }
    };
    assert!(wait_until(Duration::from_secs(10), || client.state()
        == SocketState::Connected));
    (listener, client, accepted)
}

fn read_until_eof(stream: &mut StreamSocket, timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut collected = Vec::new();
    loop {
        let mut buf = [0u8; 1024];
        match stream.read(&mut buf) {
            Ok(0) => return collected,
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(SocketError::WouldBlock) => {
                assert!(Instant::now() < deadline, "no EOF before timeout");
                thread::sleep(Duration::from_millis(10));
            }
            Err(other) => panic!("read failed: {other:?}"),
        }
    }
}

#[test]
fn shutdown_keeps_the_read_side_open() {
    let _ = tracing_subscriber::fmt::try_init();
    let pool = ThreadPool::new();
    let event_loop = EventLoop::new();
    let (client_handler, client_events) = recorder(&event_loop);

    let (_listener, mut client, mut server) = connected_pair(&pool, Some(client_handler), None);

    // Local half-close: the peer sees EOF but can keep sending.
    client.shutdown().unwrap();
    assert_eq!(client.state(), SocketState::ShutDown);
    assert!(read_until_eof(&mut server, Duration::from_secs(10)).is_empty());

    let mut pending = &b"after half close"[..];
    while !pending.is_empty() {
        match server.write(pending) {
            Ok(n) => pending = &pending[n..],
            Err(SocketError::WouldBlock) => thread::sleep(Duration::from_millis(5)),
            Err(other) => panic!("write failed: {other:?}"),
        }
    }
    server.shutdown().unwrap();

    let received = read_until_eof(&mut client, Duration::from_secs(10));
    assert_eq!(received, b"after half close");

    client.close();
    assert_eq!(client.state(), SocketState::Closed);

    // The whole exchange must not have produced a single error event.
    let events = client_events.lock();
    assert!(
        events.events.iter().all(|ev| ev.error.is_none()),
        "unexpected error events: {:?}",
        events.events
    );
}

#[test]
fn close_withdraws_queued_events() {
    let _ = tracing_subscriber::fmt::try_init();
    let pool = ThreadPool::new();
    let event_loop = EventLoop::new();
    let (client_handler, client_events) = recorder(&event_loop);
    let sleeper = event_loop.handle().register(Sleeper(Duration::from_millis(400)));

    let (_listener, mut client, mut server) = connected_pair(&pool, Some(client_handler), None);

    // Drain to would-block so read interest is armed.
    let mut buf = [0u8; 1024];
    assert_eq!(client.read(&mut buf), Err(SocketError::WouldBlock));
    client_events.lock().events.clear();

    // Park the loop, let readiness queue up behind the sleeper, then close.
    sleeper.send(Event::new(()));
    thread::sleep(Duration::from_millis(50));
    server.write(b"too late").unwrap();
    thread::sleep(Duration::from_millis(150));
    client.close();

    thread::sleep(Duration::from_millis(600));
    let events = client_events.lock();
    assert!(
        events.events.is_empty(),
        "events delivered after close: {:?}",
        events.events
    );
}

#[test]
fn handler_swap_moves_queued_events_exactly_once() {
    let _ = tracing_subscriber::fmt::try_init();
    let pool = ThreadPool::new();
    let event_loop = EventLoop::new();
    let (old_handler, old_events) = recorder(&event_loop);
    let (new_handler, new_events) = recorder(&event_loop);
    let sleeper = event_loop.handle().register(Sleeper(Duration::from_millis(400)));

    let (_listener, mut client, mut server) = connected_pair(&pool, Some(old_handler), None);

    let mut buf = [0u8; 1024];
    assert_eq!(client.read(&mut buf), Err(SocketError::WouldBlock));
    old_events.lock().events.clear();

    // Queue a read event behind the sleeper, then swap handlers while it is
    // still queued.
    sleeper.send(Event::new(()));
    thread::sleep(Duration::from_millis(50));
    server.write(b"swapped").unwrap();
    thread::sleep(Duration::from_millis(150));
    client.set_event_handler(Some(new_handler));

    assert!(wait_until(Duration::from_secs(5), || {
        new_events
            .lock()
            .events
            .iter()
            .any(|ev| ev.flag == SocketEventFlag::Read)
    }));

    let old_reads = old_events
        .lock()
        .events
        .iter()
        .filter(|ev| ev.flag == SocketEventFlag::Read)
        .count();
    let new_reads = new_events
        .lock()
        .events
        .iter()
        .filter(|ev| ev.flag == SocketEventFlag::Read)
        .count();
    assert_eq!(old_reads, 0, "old handler still received events");
    assert_eq!(new_reads, 1, "event lost or duplicated across the swap");
}

#[test]
fn swapping_onto_a_ready_socket_synthesizes_readiness() {
    let _ = tracing_subscriber::fmt::try_init();
    let pool = ThreadPool::new();
    let event_loop = EventLoop::new();
    let (new_handler, new_events) = recorder(&event_loop);

    // No handler during connect: nothing is queued, nothing is waited for.
    let (_listener, mut client, _server) = connected_pair(&pool, None, None);

    // The connected socket is writable; the fresh handler must find out.
    client.set_event_handler(Some(new_handler));
    assert!(wait_until(Duration::from_secs(5), || {
        new_events
            .lock()
            .events
            .iter()
            .any(|ev| ev.flag == SocketEventFlag::Write && ev.error.is_none())
    }));
}

#[test]
fn accept_reports_would_block_when_queue_is_empty() {
    let pool = ThreadPool::new();
    let mut listener = ListenSocket::new(&pool, None);
    listener.bind("127.0.0.1").unwrap();
    listener.listen(AddressFamily::Ipv4, 0).unwrap();
    assert_eq!(listener.accept().err(), Some(SocketError::WouldBlock));
}
