use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use sluice_event::{HandlerRef, SourceId, ThreadPool};

use crate::base::{self, start_pump, ListenState, Role, SocketShared, WAIT_ACCEPT};
use crate::event::remove_socket_events;
use crate::options::{self, BufferRequest};
use crate::stream::SocketDescriptor;
use crate::{address_to_string, AddressFamily, SocketError, StreamSocket};

/// A passive TCP socket.
///
/// Accept readiness is surfaced as a `Connection` event on this socket's
/// source; consumers distinguish it from a stream socket's connect
/// completion by that identity.
pub struct ListenSocket {
    shared: Arc<SocketShared>,
    pool: ThreadPool,
}

impl ListenSocket {
    pub fn new(pool: &ThreadPool, handler: Option<HandlerRef>) -> Self {
        let shared = SocketShared::new(
            Role::Listen {
                state: ListenState::None,
            },
            handler,
        );
        Self {
            shared,
            pool: pool.clone(),
        }
    }

    /// Records a numeric local address to bind to. Only usable before
    /// [`ListenSocket::listen`].
    pub fn bind(&mut self, address: &str) -> Result<(), SocketError> {
        let mut inner = self.shared.inner.lock();
        if inner.fd.is_some() {
            return Err(SocketError::AlreadyConnected);
        }
        inner.bind_addr = address.to_owned();
        Ok(())
    }

    /// Binds and starts listening with a backlog of 64. Port 0 picks an
    /// ephemeral port; query it with [`ListenSocket::local_port`].
    pub fn listen(&mut self, family: AddressFamily, port: u16) -> Result<(), SocketError> {
        let mut inner = self.shared.inner.lock();
        if !matches!(
            inner.role,
            Role::Listen {
                state: ListenState::None
            }
        ) {
            return Err(SocketError::AlreadyConnected);
        }
        inner.family = family;

        let candidates: Vec<SocketAddr> = if inner.bind_addr.is_empty() {
            match family {
                AddressFamily::Ipv4 => {
                    vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)]
                }
                AddressFamily::Ipv6 => {
                    vec![SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)]
                }
                AddressFamily::Unspecified => vec![
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                ],
            }
        } else {
            let ip: IpAddr = inner
                .bind_addr
                .parse()
                .map_err(|_| SocketError::InvalidInput)?;
            if !family.matches_ip(&ip) {
                return Err(SocketError::InvalidInput);
            }
            vec![SocketAddr::new(ip, port)]
        };

        let mut last_error = SocketError::InvalidInput;
        let mut bound = None;
        for addr in candidates {
            let socket = match options::create_socket(addr.is_ipv4()) {
                Ok(socket) => socket,
                Err(err) => {
                    last_error = SocketError::from(&err);
                    continue;
                }
            };
            match socket.bind(&addr.into()) {
                Ok(()) => {
                    bound = Some(socket);
                    break;
                }
                Err(err) => last_error = SocketError::from(&err),
            }
        }
        let Some(socket) = bound else {
            return Err(last_error);
        };

        socket.listen(64).map_err(|e| SocketError::from(&e))?;
        tracing::debug!(addr = ?socket.local_addr().ok().and_then(|a| a.as_socket()), "listening");

        inner.fd = Some(socket);
        inner.role = Role::Listen {
            state: ListenState::Listening,
        };
        inner.waiting = WAIT_ACCEPT;

        if let Err(err) = start_pump(&self.shared, &self.pool, &mut inner) {
            inner.role = Role::Listen {
                state: ListenState::None,
            };
            inner.fd = None;
            inner.waiting = 0;
            return Err(err);
        }
        Ok(())
    }

    /// Accepts one pending connection as a ready [`StreamSocket`].
    ///
    /// `Err(WouldBlock)` means no connection is pending; accept interest has
    /// been re-armed and another `Connection` event will follow.
    pub fn accept(&mut self) -> Result<StreamSocket, SocketError> {
        let desc = self.fast_accept()?;
        StreamSocket::from_descriptor(desc, &self.pool)
    }

    /// Accepts one pending connection as a raw descriptor, for callers that
    /// defer adoption. The descriptor inherits this socket's buffer-size
    /// knobs.
    pub fn fast_accept(&mut self) -> Result<SocketDescriptor, SocketError> {
        let mut inner = self.shared.inner.lock();
        inner.waiting |= WAIT_ACCEPT;
        self.shared.wakeup(&mut inner);

        let Some(sock) = inner.fd.as_ref() else {
            return Err(SocketError::NotConnected);
        };
        let (accepted, _addr) = sock.accept().map_err(|e| SocketError::from(&e))?;
        #[cfg(unix)]
        let _ = accepted.set_cloexec(true);

        let recv = match inner.recv_buffer {
            BufferRequest::Set(n) => Some(n),
            _ => None,
        };
        let _ = options::apply_buffer_sizes(&accepted, recv, inner.send_buffer);

        Ok(SocketDescriptor(accepted))
    }

    /// Buffer-size knobs inherited by accepted descriptors.
    pub fn set_buffer_sizes(&mut self, recv: Option<usize>, send: Option<usize>) {
        let mut inner = self.shared.inner.lock();
        inner.recv_buffer = match recv {
            Some(size) => BufferRequest::Set(size),
            None => BufferRequest::Unset,
        };
        inner.send_buffer = send;
    }

    /// Stops listening and releases the descriptor. Queued events for this
    /// socket are withdrawn before this returns.
    pub fn close(&mut self) {
        let mut inner = self.shared.inner.lock();
        let fd = inner.fd.take();
        self.shared.wakeup(&mut inner);
        drop(fd);

        inner.role = Role::Listen {
            state: ListenState::None,
        };
        inner.waiting = 0;
        inner.triggered = 0;
        inner.triggered_errors = [None; 4];

        if let Some(handler) = inner.handler.take() {
            let source = inner.source;
            remove_socket_events(&handler, source);
        }
    }

    pub fn state(&self) -> ListenState {
        match self.shared.inner.lock().role {
            Role::Listen { state } => state,
            _ => ListenState::None,
        }
    }

    /// The event routing identity of this socket.
    pub fn source(&self) -> SourceId {
        self.shared.inner.lock().source
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
}

impl Drop for ListenSocket {
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
        if let Some(task) = task {
            task.detach();
        }
    }
}
