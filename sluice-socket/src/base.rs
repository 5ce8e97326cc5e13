use std::sync::Arc;
use std::time::Duration;

use mio::{Poll, Token, Waker};
use parking_lot::{Condvar, Mutex};
use socket2::Socket;

use sluice_event::{AsyncTask, HandlerRef, SourceId, ThreadPool};

use crate::options::{BufferRequest, SocketFlags};
use crate::{AddressFamily, SocketError};

pub(crate) const WAIT_CONNECT: u8 = 0x01;
pub(crate) const WAIT_READ: u8 = 0x02;
pub(crate) const WAIT_WRITE: u8 = 0x04;
pub(crate) const WAIT_ACCEPT: u8 = 0x08;

pub(crate) const ERR_CONNECT: usize = 0;
pub(crate) const ERR_READ: usize = 1;
pub(crate) const ERR_WRITE: usize = 2;
pub(crate) const ERR_ACCEPT: usize = 3;

pub(crate) const WAKER_TOKEN: Token = Token(0);
pub(crate) const SOCKET_TOKEN: Token = Token(1);

/// Stream socket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketState {
    #[default]
    None,
    Connecting,
    Connected,
    /// Write half closed; reads still allowed.
    ShutDown,
    Closed,
    Failed,
}

/// Listen socket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenState {
    #[default]
    None,
    Listening,
}

#[derive(Debug)]
pub(crate) enum Role {
    Stream { state: SocketState, peer_host: String },
    Listen { state: ListenState },
}

impl Role {
    pub(crate) fn stream_state(&self) -> SocketState {
        match self {
            Role::Stream { state, .. } => *state,
            Role::Listen { .. } => SocketState::None,
        }
    }

    pub(crate) fn set_stream_state(&mut self, new: SocketState) {
        if let Role::Stream { state, .. } = self {
            *state = new;
        }
    }
}

/// State shared between a socket handle and its pump thread. One mutex
/// guards everything; the pump releases it around the blocking multiplexer
/// wait.
pub(crate) struct Inner {
    pub fd: Option<Socket>,
    pub family: AddressFamily,
    pub source: SourceId,
    pub handler: Option<HandlerRef>,

    /// Conditions the pump waits for.
    pub waiting: u8,
    /// Conditions the multiplexer reported, not yet turned into events.
    pub triggered: u8,
    pub triggered_errors: [Option<SocketError>; 4],

    /// Pending connect request, consumed by the pump.
    pub host: String,
    pub port: u16,
    pub bind_addr: String,

    pub recv_buffer: BufferRequest,
    pub send_buffer: Option<usize>,
    pub flags: SocketFlags,
    pub keepalive_interval: Duration,

    pub role: Role,

    pub quit: bool,
    /// Pump is idling on the condvar rather than in the multiplexer.
    pub threadwait: bool,
    pub started: bool,
    pub waker: Option<Arc<Waker>>,
    pub task: Option<AsyncTask>,
}

pub(crate) struct SocketShared {
    pub inner: Mutex<Inner>,
    pub cond: Condvar,
}

impl SocketShared {
    pub(crate) fn new(role: Role, handler: Option<HandlerRef>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                fd: None,
                family: AddressFamily::Unspecified,
                source: SourceId::next(),
                handler,
                waiting: 0,
                triggered: 0,
                triggered_errors: [None; 4],
                host: String::new(),
                port: 0,
                bind_addr: String::new(),
                recv_buffer: BufferRequest::Unset,
                send_buffer: None,
                flags: SocketFlags::empty(),
                keepalive_interval: Duration::from_secs(2 * 60 * 60),
                role,
                quit: false,
                threadwait: false,
                started: false,
                waker: None,
                task: None,
            }),
            cond: Condvar::new(),
        })
    }

    /// Breaks the pump out of an idle or multiplexer wait so it re-reads the
    /// waiting mask.
    pub(crate) fn wakeup(&self, inner: &mut Inner) {
        if !inner.started || inner.quit {
            return;
        }
        if inner.threadwait {
            inner.threadwait = false;
            self.cond.notify_one();
            return;
        }
        if let Some(waker) = &inner.waker {
            let _ = waker.wake();
        }
    }
}

pub(crate) fn local_addr(inner: &Inner) -> Option<std::net::SocketAddr> {
    inner.fd.as_ref()?.local_addr().ok()?.as_socket()
}

pub(crate) fn peer_addr(inner: &Inner) -> Option<std::net::SocketAddr> {
    inner.fd.as_ref()?.peer_addr().ok()?.as_socket()
}

/// Starts the pump thread if it is not running yet. Wake-primitive or spawn
/// failure propagates to the caller; nothing is retried.
pub(crate) fn start_pump(
    shared: &Arc<SocketShared>,
    pool: &ThreadPool,
    inner: &mut Inner,
) -> Result<(), SocketError> {
    if inner.started {
        shared.wakeup(inner);
        return Ok(());
    }

    let poll = Poll::new().map_err(|e| SocketError::from(&e))?;
    let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(|e| SocketError::from(&e))?;
    inner.waker = Some(Arc::new(waker));

    let run_shared = Arc::clone(shared);
    let task = pool
        .spawn("sluice-pump", move || crate::pump::run(run_shared, poll))
        .map_err(|e| {
            let err = SocketError::from(&e);
            if let SocketError::Other(_) = err {
                SocketError::ProcessFileLimit
            } else {
                err
            }
        })?;
    inner.task = Some(task);
    inner.started = true;
    Ok(())
}
