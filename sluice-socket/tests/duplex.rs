//! Full-duplex exchange of random data between two loops, checked by
//! content digest in both directions.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};

use sluice_event::{Event, EventHandler, EventLoop, HandlerRef, ThreadPool};
use sluice_socket::{
    AddressFamily, ListenSocket, SocketError, SocketEvent, SocketEventFlag, StreamSocket,
};

const MIN_BYTES: u64 = 10 * 1024 * 1024;
const MIN_TIME: Duration = Duration::from_secs(5);

struct Peer {
    socket: Option<StreamSocket>,
    listener: Option<ListenSocket>,
    sent_hash: Sha256,
    received_hash: Sha256,
    sent: u64,
    eof: bool,
    shut: bool,
    failed: Option<String>,
    done: bool,
    start: Instant,
}

impl Peer {
    fn new() -> Self {
        Self {
            socket: None,
            listener: None,
            sent_hash: Sha256::new(),
            received_hash: Sha256::new(),
            sent: 0,
            eof: false,
            shut: false,
            failed: None,
            done: false,
            start: Instant::now(),
        }
    }

    fn fail(&mut self, line: u32, error: Option<SocketError>) {
        if self.failed.is_none() {
            self.failed = Some(format!("line {line}: {error:?}"));
        }
        self.socket = None;
        self.done = true;
    }

    fn check_done(&mut self) {
        if self.eof && self.shut {
            self.done = true;
            self.socket = None;
        }
    }

    fn on_stream_event(&mut self, ctx: &HandlerRef, ev: &SocketEvent) {
        if let Some(error) = ev.error {
            self.fail(line!(), Some(error));
            return;
        }
        match ev.flag {
            SocketEventFlag::Read => {
                let rounds = rand::thread_rng().gen_range(1..=20);
                for _ in 0..rounds {
                    let mut buf = [0u8; 1024];
                    let Some(socket) = self.socket.as_mut() else {
                        return;
                    };
                    match socket.read(&mut buf) {
                        Ok(0) => {
                            self.eof = true;
                            self.check_done();
                            return;
                        }
                        Ok(n) => self.received_hash.update(&buf[..n]),
                        Err(SocketError::WouldBlock) => return,
                        Err(error) => {
                            self.fail(line!(), Some(error));
                            return;
                        }
                    }
                }
                // Yield to other events, then keep draining.
                if let Some(source) = self.socket.as_ref().map(|s| s.source()) {
                    ctx.send(Event::new(SocketEvent {
                        source,
                        flag: SocketEventFlag::Read,
                        error: None,
                    }));
                }
            }
            SocketEventFlag::Write => {
                if self.sent > MIN_BYTES && self.start.elapsed() > MIN_TIME {
                    let Some(socket) = self.socket.as_mut() else {
                        return;
                    };
                    match socket.shutdown() {
                        Ok(()) => {
                            self.shut = true;
                            self.check_done();
                        }
                        Err(SocketError::WouldBlock) => {}
                        Err(error) => self.fail(line!(), Some(error)),
                    }
                    return;
                }
                let rounds = rand::thread_rng().gen_range(1..=20);
                for _ in 0..rounds {
                    let mut buf = [0u8; 1024];
                    rand::thread_rng().fill(&mut buf[..]);
                    let Some(socket) = self.socket.as_mut() else {
                        return;
                    };
                    match socket.write(&buf) {
                        Ok(n) if n > 0 => {
                            self.sent += n as u64;
                            self.sent_hash.update(&buf[..n]);
                        }
                        Ok(_) => return,
                        Err(SocketError::WouldBlock) => return,
                        Err(error) => {
                            self.fail(line!(), Some(error));
                            return;
                        }
                    }
                }
                if let Some(source) = self.socket.as_ref().map(|s| s.source()) {
                    ctx.send(Event::new(SocketEvent {
                        source,
                        flag: SocketEventFlag::Write,
                        error: None,
                    }));
                }
            }
            _ => {}
        }
    }
}

struct Client(Peer);

impl EventHandler for Client {
    fn on_event(&mut self, ctx: &HandlerRef, event: Event) {
        if let Some(ev) = event.downcast_ref::<SocketEvent>() {
            let ev = *ev;
            self.0.on_stream_event(ctx, &ev);
        }
    }
}

struct Server(Peer);

impl EventHandler for Server {
    fn on_event(&mut self, ctx: &HandlerRef, event: Event) {
        let Some(ev) = event.downcast_ref::<SocketEvent>() else {
            return;
        };
        let ev = *ev;

        let listen_source = self.0.listener.as_ref().map(|l| l.source());
        if Some(ev.source) == listen_source {
            if let Some(error) = ev.error {
                self.0.fail(line!(), Some(error));
                return;
            }
            let accepted = self.0.listener.as_mut().map(|l| l.accept());
            match accepted {
                Some(Ok(mut stream)) => {
                    stream.set_event_handler(Some(ctx.clone()));
                    self.0.socket = Some(stream);
                }
                Some(Err(SocketError::WouldBlock)) => {}
                Some(Err(error)) => self.0.fail(line!(), Some(error)),
                None => {}
            }
            return;
        }
        self.0.on_stream_event(ctx, &ev);
    }
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    pred()
}

#[test]
fn full_duplex_echo() {
    let _ = tracing_subscriber::fmt::try_init();
    let pool = ThreadPool::new();
    let server_loop = EventLoop::new();
    let client_loop = EventLoop::new();

    let server = Arc::new(Mutex::new(Server(Peer::new())));
    let server_ref = server_loop.handle().register_shared(Arc::clone(&server));
    {
        let mut guard = server.lock();
        let mut listener = ListenSocket::new(&pool, Some(server_ref.clone()));
        listener.bind("127.0.0.1").unwrap();
        listener.listen(AddressFamily::Ipv4, 0).unwrap();
        guard.0.listener = Some(listener);
    }
    let port = server
        .lock()
        .0
        .listener
        .as_ref()
        .unwrap()
        .local_port()
        .unwrap();

    let client = Arc::new(Mutex::new(Client(Peer::new())));
    let client_ref = client_loop.handle().register_shared(Arc::clone(&client));
    {
        let mut guard = client.lock();
        let mut socket = StreamSocket::new(&pool, Some(client_ref.clone()));
        socket
            .connect("127.0.0.1", port, AddressFamily::Ipv4)
            .unwrap();
        guard.0.socket = Some(socket);
    }

    let finished = wait_until(Duration::from_secs(60), || {
        client.lock().0.done && server.lock().0.done
    });
    assert!(finished, "exchange did not complete in time");

    let client = client.lock();
    let server = server.lock();
    assert_eq!(client.0.failed, None);
    assert_eq!(server.0.failed, None);
    assert!(client.0.sent > MIN_BYTES);
    assert!(server.0.sent > MIN_BYTES);

    let client_sent = client.0.sent_hash.clone().finalize();
    let client_received = client.0.received_hash.clone().finalize();
    let server_sent = server.0.sent_hash.clone().finalize();
    let server_received = server.0.received_hash.clone().finalize();
    assert_eq!(client_sent, server_received);
    assert_eq!(server_sent, client_received);
}
