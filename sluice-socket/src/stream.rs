use std::io::Read;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;

use sluice_event::{Event, HandlerRef, SourceId, ThreadPool};
use socket2::Socket;

use crate::base::{self, start_pump, Role, SocketShared, SocketState, WAIT_READ, WAIT_WRITE};
use crate::event::{change_socket_event_handler, has_pending_event, remove_socket_events};
use crate::layer::SocketInterface;
use crate::options::{self, BufferRequest, SocketFlags};
use crate::{address_to_string, AddressFamily, SocketError, SocketEvent, SocketEventFlag};

/// An owned, accepted descriptor awaiting adoption by a [`StreamSocket`].
///
/// Closes the descriptor on drop if never adopted.
pub struct SocketDescriptor(pub(crate) Socket);

/// An active TCP stream socket.
///
/// All data-path calls are non-blocking; [`SocketError::WouldBlock`] re-arms
/// readiness interest for the affected direction and a fresh event is
/// delivered once the condition holds again. Consumers must drain reads and
/// writes until would-block: a direction's event is edge-triggered and will
/// not repeat before that.
pub struct StreamSocket {
    shared: Arc<SocketShared>,
    pool: ThreadPool,
}

impl StreamSocket {
    /// Creates an unconnected socket. Events go to `handler` once a
    /// connection is established or adopted.
    pub fn new(pool: &ThreadPool, handler: Option<HandlerRef>) -> Self {
        let shared = SocketShared::new(
            Role::Stream {
                state: SocketState::None,
                peer_host: String::new(),
            },
            handler,
        );
        Self {
            shared,
            pool: pool.clone(),
        }
    }

    /// Adopts an accepted descriptor. The socket starts out `Connected` with
    /// read and write interest armed.
    pub fn from_descriptor(
        desc: SocketDescriptor,
        pool: &ThreadPool,
    ) -> Result<Self, SocketError> {
        let socket = desc.0;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        let _ = socket.set_nosigpipe(true);
        socket
            .set_nonblocking(true)
            .map_err(|e| SocketError::from(&e))?;

        let peer_host = socket
            .peer_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .map(|a| address_to_string(&a, false, true))
            .unwrap_or_default();

        let this = Self::new(pool, None);
        {
            let mut inner = this.shared.inner.lock();
            inner.fd = Some(socket);
            inner.role = Role::Stream {
                state: SocketState::Connected,
                peer_host,
            };
            inner.waiting = WAIT_READ | WAIT_WRITE;
            start_pump(&this.shared, &this.pool, &mut inner)?;
        }
        Ok(this)
    }

    /// Starts an asynchronous connect. Completion is reported through a
    /// `Connection` event; intermediate candidates produce `HostAddress` and
    /// `ConnectionNext` events.
    pub fn connect(
        &mut self,
        host: &str,
        port: u16,
        family: AddressFamily,
    ) -> Result<(), SocketError> {
        if host.is_empty() || port == 0 {
            return Err(SocketError::InvalidInput);
        }

        let mut inner = self.shared.inner.lock();
        if inner.role.stream_state() != SocketState::None {
            return Err(SocketError::AlreadyConnected);
        }

        inner.family = family;
        inner.role = Role::Stream {
            state: SocketState::Connecting,
            peer_host: host.to_owned(),
        };
        inner.host = host.to_owned();
        inner.port = port;
        inner.waiting = 0;

        if let Err(err) = start_pump(&self.shared, &self.pool, &mut inner) {
            inner.role.set_stream_state(SocketState::Failed);
            inner.host.clear();
            return Err(err);
        }
        Ok(())
    }

    /// Non-blocking read. `Ok(0)` is orderly peer close.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let mut inner = self.shared.inner.lock();
        let result = match inner.fd.as_ref() {
            Some(sock) => {
                let mut r: &Socket = sock;
                r.read(buf)
            }
            None => return Err(SocketError::NotConnected),
        };
        match result {
            Ok(n) => Ok(n),
            Err(err) => {
                let err = SocketError::from(&err);
                if err == SocketError::WouldBlock && inner.waiting & WAIT_READ == 0 {
                    inner.waiting |= WAIT_READ;
                    self.shared.wakeup(&mut inner);
                }
                Err(err)
            }
        }
    }

    /// Non-blocking write. SIGPIPE is suppressed per call or per descriptor,
    /// depending on what the platform offers.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        let mut inner = self.shared.inner.lock();
        let result = match inner.fd.as_ref() {
            Some(sock) => send_nosigpipe(sock, buf),
            None => return Err(SocketError::NotConnected),
        };
        match result {
            Ok(n) => Ok(n),
            Err(err) => {
                let err = SocketError::from(&err);
                if err == SocketError::WouldBlock && inner.waiting & WAIT_WRITE == 0 {
                    inner.waiting |= WAIT_WRITE;
                    self.shared.wakeup(&mut inner);
                }
                Err(err)
            }
        }
    }

    /// Half-closes the write side. Reads remain possible; the state moves
    /// `Connected → ShutDown`. Idempotent at the state level.
    pub fn shutdown(&mut self) -> Result<(), SocketError> {
        let mut inner = self.shared.inner.lock();
        let Some(sock) = inner.fd.as_ref() else {
            return Err(SocketError::NotConnected);
        };
        sock.shutdown(Shutdown::Write)
            .map_err(|e| SocketError::from(&e))?;
        if inner.role.stream_state() == SocketState::Connected {
            inner.role.set_stream_state(SocketState::ShutDown);
        }
        inner.waiting &= !WAIT_WRITE;
        inner.triggered &= !WAIT_WRITE;
        Ok(())
    }

    /// Terminates the connection and releases the descriptor. Queued events
    /// for this socket are withdrawn before this returns; no further events
    /// are delivered.
    pub fn close(&mut self) {
        let mut inner = self.shared.inner.lock();
        let fd = inner.fd.take();
        inner.host.clear();
        inner.port = 0;
        self.shared.wakeup(&mut inner);
        drop(fd);

        inner.role.set_stream_state(SocketState::Closed);
        inner.triggered = 0;
        inner.triggered_errors = [None; 4];

        if let Some(handler) = inner.handler.take() {
            let source = inner.source;
            remove_socket_events(&handler, source);
        }
    }

    /// Swaps the event handler. Queued events are retargeted atomically; if
    /// the socket is already readable or writable and no such event is
    /// pending, a fresh one is synthesized so the new handler discovers the
    /// state.
    pub fn set_event_handler(&mut self, handler: Option<HandlerRef>) {
        let mut inner = self.shared.inner.lock();
        if inner.handler == handler {
            return;
        }
        let source = inner.source;
        let old = inner.handler.take();
        match (&old, &handler) {
            (Some(old), Some(new)) => change_socket_event_handler(old, new, source),
            (Some(old), None) => remove_socket_events(old, source),
            _ => {}
        }
        inner.handler.clone_from(&handler);

        if let Some(new) = &handler {
            let state = inner.role.stream_state();
            if state == SocketState::Connected
                && inner.waiting & WAIT_WRITE == 0
                && !has_pending_event(new, source, SocketEventFlag::Write)
            {
                new.send(Event::new(SocketEvent {
                    source,
                    flag: SocketEventFlag::Write,
                    error: None,
                }));
            }
            if matches!(state, SocketState::Connected | SocketState::ShutDown)
                && inner.waiting & WAIT_READ == 0
                && !has_pending_event(new, source, SocketEventFlag::Read)
            {
                new.send(Event::new(SocketEvent {
                    source,
                    flag: SocketEventFlag::Read,
                    error: None,
                }));
            }
        }
    }

    /// Requests a fresh readiness event for `flag` if the state permits and
    /// none is pending or being waited for.
    pub fn retrigger(&mut self, flag: SocketEventFlag) {
        let wait_flag = match flag {
            SocketEventFlag::Read => WAIT_READ,
            SocketEventFlag::Write => WAIT_WRITE,
            _ => return,
        };

        let inner = self.shared.inner.lock();
        let state = inner.role.stream_state();
        if state != SocketState::Connected
            && (state != SocketState::ShutDown || flag == SocketEventFlag::Write)
        {
            return;
        }
        let Some(handler) = &inner.handler else {
            return;
        };
        if has_pending_event(handler, inner.source, flag) {
            return;
        }
        if inner.waiting & wait_flag == 0 {
            handler.send(Event::new(SocketEvent {
                source: inner.source,
                flag,
                error: None,
            }));
        }
    }

    /// Toggles the flags in `mask`. Flags set before a descriptor exists are
    /// applied to every descriptor the socket creates.
    pub fn set_flags(&mut self, mask: SocketFlags, enable: bool) {
        let mut inner = self.shared.inner.lock();
        if let Some(sock) = &inner.fd {
            let desired = if enable { mask } else { SocketFlags::empty() };
            let _ = options::apply_flags(sock, desired, mask, inner.keepalive_interval);
        }
        if enable {
            inner.flags.insert(mask);
        } else {
            inner.flags.remove(mask);
        }
    }

    /// Sets the keepalive idle interval. Values below one minute are
    /// ignored.
    pub fn set_keepalive_interval(&mut self, interval: Duration) {
        if interval < Duration::from_secs(60) {
            return;
        }
        let mut inner = self.shared.inner.lock();
        inner.keepalive_interval = interval;
        if let Some(sock) = &inner.fd {
            let _ = options::apply_flags(sock, inner.flags, SocketFlags::KEEPALIVE, interval);
        }
    }

    /// Requests kernel buffer sizes. `None` leaves the respective direction
    /// at its default.
    pub fn set_buffer_sizes(
        &mut self,
        recv: Option<usize>,
        send: Option<usize>,
    ) -> Result<(), SocketError> {
        let mut inner = self.shared.inner.lock();

        // Receive sizing is not recorded before the unmodified window scale
        // has been sampled; see options::wscale.
        if options::wscale::unmodified_known() {
            inner.recv_buffer = match recv {
                Some(size) => BufferRequest::Set(size),
                None => match inner.recv_buffer {
                    BufferRequest::Unset => BufferRequest::Unset,
                    _ => BufferRequest::Cleared,
                },
            };
        }
        inner.send_buffer = send;

        match &inner.fd {
            Some(sock) => options::apply_buffer_sizes(sock, recv, send),
            None => Ok(()),
        }
    }

    /// Records a source address to bind before connecting. Only usable while
    /// no descriptor exists.
    pub fn bind(&mut self, address: &str) -> Result<(), SocketError> {
        let mut inner = self.shared.inner.lock();
        if inner.fd.is_some() {
            return Err(SocketError::AlreadyConnected);
        }
        inner.bind_addr = address.to_owned();
        Ok(())
    }

    pub fn state(&self) -> SocketState {
        self.shared.inner.lock().role.stream_state()
    }

    /// The chain-wide event routing identity of this socket.
    pub fn source(&self) -> SourceId {
        self.shared.inner.lock().source
    }

    /// The host this socket was asked to connect to, or the peer address of
    /// an adopted connection.
    pub fn peer_host(&self) -> String {
        let inner = self.shared.inner.lock();
        match &inner.role {
            Role::Stream { peer_host, .. } => peer_host.clone(),
            Role::Listen { .. } => String::new(),
        }
    }

    pub fn local_ip(&self, strip_zone_index: bool) -> Option<String> {
        let inner = self.shared.inner.lock();
        base::local_addr(&inner).map(|a| address_to_string(&a, false, strip_zone_index))
    }

    pub fn local_port(&self) -> Result<u16, SocketError> {
        let inner = self.shared.inner.lock();
        base::local_addr(&inner)
            .map(|a| a.port())
            .ok_or(SocketError::NotConnected)
    }

    pub fn peer_ip(&self, strip_zone_index: bool) -> Option<String> {
        let inner = self.shared.inner.lock();
        base::peer_addr(&inner).map(|a| address_to_string(&a, false, strip_zone_index))
    }

    pub fn peer_port(&self) -> Result<u16, SocketError> {
        let inner = self.shared.inner.lock();
        base::peer_addr(&inner)
            .map(|a| a.port())
            .ok_or(SocketError::NotConnected)
    }

    /// Family of the bound descriptor, [`AddressFamily::Unspecified`] while
    /// none exists.
    pub fn address_family(&self) -> AddressFamily {
        let inner = self.shared.inner.lock();
        match base::local_addr(&inner) {
            Some(addr) if addr.is_ipv4() => AddressFamily::Ipv4,
            Some(_) => AddressFamily::Ipv6,
            None => AddressFamily::Unspecified,
        }
    }
}

impl SocketInterface for StreamSocket {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        StreamSocket::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        StreamSocket::write(self, buf)
    }

    fn shutdown(&mut self) -> Result<(), SocketError> {
        StreamSocket::shutdown(self)
    }

    fn connect(
        &mut self,
        host: &str,
        port: u16,
        family: AddressFamily,
    ) -> Result<(), SocketError> {
        StreamSocket::connect(self, host, port, family)
    }

    fn state(&self) -> SocketState {
        StreamSocket::state(self)
    }

    fn set_event_handler(&mut self, handler: Option<HandlerRef>) {
        StreamSocket::set_event_handler(self, handler)
    }

    fn root(&self) -> SourceId {
        self.source()
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        self.close();
        let task = {
            let mut inner = self.shared.inner.lock();
            inner.quit = true;
            let task = inner.task.take();
            if inner.threadwait {
                inner.threadwait = false;
                self.shared.cond.notify_one();
            } else if let Some(waker) = &inner.waker {
                let _ = waker.wake();
            }
            task
        };
        // The pump holds its own reference to the shared state; let it wind
        // down on its own instead of blocking the caller.
        if let Some(task) = task {
            task.detach();
        }
    }
}

#[cfg(all(unix, not(any(target_os = "macos", target_os = "ios"))))]
fn send_nosigpipe(sock: &Socket, buf: &[u8]) -> std::io::Result<usize> {
    sock.send_with_flags(buf, libc::MSG_NOSIGNAL)
}

#[cfg(any(target_os = "macos", target_os = "ios", not(unix)))]
fn send_nosigpipe(sock: &Socket, buf: &[u8]) -> std::io::Result<usize> {
    sock.send(buf)
}
