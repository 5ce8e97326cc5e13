//! The per-socket readiness pump.
//!
//! One worker thread per socket. It idles on the shared condvar while there
//! is nothing to do, performs name resolution and the candidate walk for
//! connects, and otherwise blocks in the multiplexer until a waited-for
//! condition fires or the waker breaks the wait. Readiness is translated
//! into events posted to the owner's handler; a satisfied condition's
//! waiting bit stays clear until the consumer re-arms it by observing a
//! would-block error.

use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll};
use parking_lot::MutexGuard;
use sluice_event::Event;

use crate::address::address_to_string;
use crate::base::{
    Inner, Role, SocketShared, SocketState, ERR_ACCEPT, ERR_CONNECT, ERR_READ, ERR_WRITE,
    SOCKET_TOKEN, WAIT_ACCEPT, WAIT_CONNECT, WAIT_READ, WAIT_WRITE,
};
use crate::options;
use crate::{HostAddressEvent, SocketError, SocketEvent, SocketEventFlag};

struct PumpIo {
    poll: Poll,
    events: Events,
    registered: Option<(RawFd, Interest)>,
}

pub(crate) fn run(shared: Arc<SocketShared>, poll: Poll) {
    let mut io = PumpIo {
        poll,
        events: Events::with_capacity(8),
        registered: None,
    };

    let mut inner = shared.inner.lock();
    loop {
        if !idle_loop(&shared, &mut inner) {
            break;
        }

        let listening = matches!(inner.role, Role::Listen { .. });
        if !listening && inner.role.stream_state() == SocketState::Connecting {
            if !do_connect(&shared, &mut inner, &mut io) {
                continue;
            }
        }

        while idle_loop(&shared, &mut inner) {
            if inner.fd.is_none() {
                inner.waiting = 0;
                io.registered = None;
                break;
            }
            if !do_wait(&shared, &mut inner, &mut io, 0) {
                break;
            }
            send_events(&mut inner);
        }

        if inner.quit {
            break;
        }
    }
    tracing::trace!("socket pump exiting");
}

/// Parks the pump until there is work. Returns `false` on quit.
fn idle_loop(shared: &SocketShared, inner: &mut MutexGuard<'_, Inner>) -> bool {
    if inner.quit {
        return false;
    }
    while inner.waiting == 0 && inner.host.is_empty() {
        inner.threadwait = true;
        shared.cond.wait(inner);
        if inner.quit {
            return false;
        }
    }
    true
}

fn interest_for(waiting: u8) -> Option<Interest> {
    let mut interest = None;
    if waiting & (WAIT_READ | WAIT_ACCEPT) != 0 {
        interest = Some(Interest::READABLE);
    }
    if waiting & (WAIT_WRITE | WAIT_CONNECT) != 0 {
        interest = Some(match interest {
            Some(i) => i | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }
    interest
}

fn ensure_registered(io: &mut PumpIo, fd: RawFd, interest: Interest) -> io::Result<()> {
    if io.registered == Some((fd, interest)) {
        return Ok(());
    }
    let registry = io.poll.registry();
    let result = match io.registered {
        Some((old_fd, _)) if old_fd == fd => {
            registry.reregister(&mut SourceFd(&fd), SOCKET_TOKEN, interest)
        }
        _ => registry
            .register(&mut SourceFd(&fd), SOCKET_TOKEN, interest)
            .or_else(|err| {
                if err.raw_os_error() == Some(libc::EEXIST) {
                    registry.reregister(&mut SourceFd(&fd), SOCKET_TOKEN, interest)
                } else {
                    Err(err)
                }
            }),
    };
    if result.is_ok() {
        io.registered = Some((fd, interest));
    }
    result
}

/// Blocks in the multiplexer until a waited-for condition triggers or the
/// socket goes away. Returns `false` on quit or descriptor loss.
fn do_wait(
    shared: &SocketShared,
    inner: &mut MutexGuard<'_, Inner>,
    io: &mut PumpIo,
    add: u8,
) -> bool {
    inner.waiting |= add;

    loop {
        if inner.quit {
            return false;
        }
        let fd = match &inner.fd {
            Some(sock) => sock.as_raw_fd(),
            None => {
                io.registered = None;
                return false;
            }
        };
        let Some(interest) = interest_for(inner.waiting) else {
            return true;
        };
        if ensure_registered(io, fd, interest).is_err() {
            return false;
        }

        let poll_result = MutexGuard::unlocked(inner, || io.poll.poll(&mut io.events, None));

        if inner.quit {
            return false;
        }
        if inner.fd.is_none() {
            io.registered = None;
            return false;
        }
        match poll_result {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::debug!(error = %err, "multiplexer wait failed");
                return false;
            }
        }

        for event in io.events.iter() {
            if event.token() != SOCKET_TOKEN {
                // The waker drains itself.
                continue;
            }
            if inner.waiting & WAIT_CONNECT != 0 {
                if event.is_writable()
                    || event.is_error()
                    || event.is_read_closed()
                    || event.is_write_closed()
                {
                    let error = inner
                        .fd
                        .as_ref()
                        .and_then(|sock| sock.take_error().ok().flatten())
                        .map(|e| SocketError::from(&e));
                    inner.triggered |= WAIT_CONNECT;
                    inner.triggered_errors[ERR_CONNECT] = error;
                    inner.waiting &= !WAIT_CONNECT;
                }
            } else if inner.waiting & WAIT_ACCEPT != 0 {
                if event.is_readable() {
                    inner.triggered |= WAIT_ACCEPT;
                    inner.waiting &= !WAIT_ACCEPT;
                }
            } else {
                if inner.waiting & WAIT_READ != 0
                    && (event.is_readable() || event.is_read_closed() || event.is_error())
                {
                    inner.triggered |= WAIT_READ;
                    inner.waiting &= !WAIT_READ;
                }
                if inner.waiting & WAIT_WRITE != 0
                    && (event.is_writable() || event.is_write_closed() || event.is_error())
                {
                    inner.triggered |= WAIT_WRITE;
                    inner.waiting &= !WAIT_WRITE;
                }
            }
        }

        if inner.triggered != 0 || inner.waiting == 0 {
            return true;
        }
    }
}

/// Turns triggered conditions into events for the owner's handler.
fn send_events(inner: &mut Inner) {
    let Some(handler) = inner.handler.clone() else {
        return;
    };
    let source = inner.source;

    if inner.triggered & WAIT_READ != 0 {
        handler.send(Event::new(SocketEvent {
            source,
            flag: SocketEventFlag::Read,
            error: inner.triggered_errors[ERR_READ].take(),
        }));
        inner.triggered &= !WAIT_READ;
    }
    if inner.triggered & WAIT_WRITE != 0 {
        handler.send(Event::new(SocketEvent {
            source,
            flag: SocketEventFlag::Write,
            error: inner.triggered_errors[ERR_WRITE].take(),
        }));
        inner.triggered &= !WAIT_WRITE;
    }
    if inner.triggered & WAIT_ACCEPT != 0 {
        handler.send(Event::new(SocketEvent {
            source,
            flag: SocketEventFlag::Connection,
            error: inner.triggered_errors[ERR_ACCEPT].take(),
        }));
        inner.triggered &= !WAIT_ACCEPT;
    }
}

fn emit_connection(inner: &Inner, flag: SocketEventFlag, error: Option<SocketError>) {
    if let Some(handler) = &inner.handler {
        handler.send(Event::new(SocketEvent {
            source: inner.source,
            flag,
            error,
        }));
    }
}

enum Attempt {
    Connected,
    Next,
    Aborted,
}

/// Resolves the pending host and walks the candidate list. Returns `true`
/// once connected; `false` when the attempt failed or was superseded.
fn do_connect(shared: &SocketShared, inner: &mut MutexGuard<'_, Inner>, io: &mut PumpIo) -> bool {
    if inner.host.is_empty() {
        inner.role.set_stream_state(SocketState::Failed);
        return false;
    }

    let host = mem::take(&mut inner.host);
    let port = inner.port;
    let bind = mem::take(&mut inner.bind_addr);
    let bind_ip: Option<IpAddr> = bind.parse().ok();
    let family = inner.family;

    // Resolution blocks; only this worker waits on it.
    let resolved = MutexGuard::unlocked(inner, || {
        (host.as_str(), port)
            .to_socket_addrs()
            .map(|addrs| addrs.collect::<Vec<_>>())
    });

    if inner.quit {
        return false;
    }
    // close(), or close() followed by a fresh connect(), supersedes this
    // attempt.
    if inner.role.stream_state() != SocketState::Connecting || !inner.host.is_empty() {
        return false;
    }

    let candidates: Vec<SocketAddr> = match resolved {
        Ok(addrs) => addrs.into_iter().filter(|a| family.matches(a)).collect(),
        Err(err) => {
            tracing::debug!(host = %host, error = %err, "name resolution failed");
            emit_connection(inner, SocketEventFlag::Connection, Some(SocketError::HostNotFound));
            inner.role.set_stream_state(SocketState::Failed);
            return false;
        }
    };
    if candidates.is_empty() {
        emit_connection(inner, SocketEventFlag::Connection, Some(SocketError::HostNotFound));
        inner.role.set_stream_state(SocketState::Failed);
        return false;
    }
    tracing::debug!(host = %host, port, count = candidates.len(), "resolved connect candidates");

    let last = candidates.len() - 1;
    for (index, addr) in candidates.into_iter().enumerate() {
        match try_connect_host(shared, inner, io, addr, bind_ip, index < last) {
            Attempt::Connected => return true,
            Attempt::Next => continue,
            Attempt::Aborted => return false,
        }
    }

    inner.role.set_stream_state(SocketState::Failed);
    false
}

fn in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

fn try_connect_host(
    shared: &SocketShared,
    inner: &mut MutexGuard<'_, Inner>,
    io: &mut PumpIo,
    addr: SocketAddr,
    bind_ip: Option<IpAddr>,
    more: bool,
) -> Attempt {
    if let Some(handler) = inner.handler.clone() {
        handler.send(Event::new(HostAddressEvent {
            source: inner.source,
            address: address_to_string(&addr, true, false),
        }));
    }

    let next_flag = if more {
        SocketEventFlag::ConnectionNext
    } else {
        SocketEventFlag::Connection
    };

    let socket = match options::create_socket(addr.is_ipv4()) {
        Ok(socket) => socket,
        Err(err) => {
            emit_connection(inner, next_flag, Some(SocketError::from(&err)));
            return Attempt::Next;
        }
    };

    if let Some(ip) = bind_ip {
        if ip.is_ipv4() == addr.is_ipv4() {
            let _ = socket.bind(&SocketAddr::new(ip, 0).into());
        }
    }
    let _ = options::apply_flags(&socket, inner.flags, inner.flags, inner.keepalive_interval);
    let _ = options::apply_buffer_sizes(&socket, inner.recv_buffer.value(), inner.send_buffer);

    tracing::debug!(addr = %addr, "attempting connect");
    let connect_result = socket.connect(&addr.into());
    inner.fd = Some(socket);

    let error: Option<SocketError> = match connect_result {
        Ok(()) => None,
        Err(err) if in_progress(&err) => {
            let mut ok;
            loop {
                ok = do_wait(shared, inner, io, WAIT_CONNECT);
                if inner.triggered & WAIT_CONNECT != 0 || !ok {
                    break;
                }
            }
            if !ok {
                inner.fd = None;
                io.registered = None;
                return Attempt::Aborted;
            }
            inner.triggered &= !WAIT_CONNECT;
            inner.triggered_errors[ERR_CONNECT].take()
        }
        Err(err) => Some(SocketError::from(&err)),
    };

    match error {
        Some(error) => {
            tracing::debug!(addr = %addr, %error, "connect candidate failed");
            emit_connection(inner, next_flag, Some(error));
            inner.fd = None;
            io.registered = None;
            Attempt::Next
        }
        None => {
            inner.role.set_stream_state(SocketState::Connected);

            #[cfg(target_os = "linux")]
            if let Some(sock) = &inner.fd {
                use crate::options::{wscale, BufferRequest};
                if inner.recv_buffer == BufferRequest::Unset {
                    wscale::sample_unmodified(sock.as_raw_fd());
                } else if inner.recv_buffer.value().is_some() {
                    wscale::sample_modified(sock.as_raw_fd());
                }
            }

            emit_connection(inner, SocketEventFlag::Connection, None);
            inner.waiting |= WAIT_READ | WAIT_WRITE;
            Attempt::Connected
        }
    }
}
