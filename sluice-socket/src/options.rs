use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use crate::SocketError;

/// Per-socket TCP flags, settable before or after the descriptor exists.
/// Flags set early are applied to every descriptor the socket creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketFlags(u8);

impl SocketFlags {
    pub const NODELAY: Self = Self(0x01);
    pub const KEEPALIVE: Self = Self(0x02);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for SocketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Requested receive-buffer size. The distinction between "never touched"
/// and "explicitly reset" matters for the receive-window-scale guard below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum BufferRequest {
    #[default]
    Unset,
    Cleared,
    Set(usize),
}

impl BufferRequest {
    pub(crate) fn value(self) -> Option<usize> {
        match self {
            Self::Set(n) => Some(n),
            _ => None,
        }
    }
}

/// Creates a non-blocking, close-on-exec stream descriptor of the given
/// family. SIGPIPE suppression is per-descriptor where the platform offers
/// it; elsewhere the write path passes `MSG_NOSIGNAL`.
pub(crate) fn create_socket(ipv4: bool) -> std::io::Result<Socket> {
    let domain = if ipv4 { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_cloexec(true)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_nosigpipe(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Applies the flags selected by `mask` to the descriptor.
pub(crate) fn apply_flags(
    socket: &Socket,
    flags: SocketFlags,
    mask: SocketFlags,
    keepalive_interval: Duration,
) -> Result<(), SocketError> {
    if mask.contains(SocketFlags::NODELAY) {
        socket
            .set_nodelay(flags.contains(SocketFlags::NODELAY))
            .map_err(|e| SocketError::from(&e))?;
    }
    if mask.contains(SocketFlags::KEEPALIVE) {
        let enable = flags.contains(SocketFlags::KEEPALIVE);
        socket
            .set_keepalive(enable)
            .map_err(|e| SocketError::from(&e))?;
        if enable {
            let params = TcpKeepalive::new().with_time(keepalive_interval);
            socket
                .set_tcp_keepalive(&params)
                .map_err(|e| SocketError::from(&e))?;
        }
    }
    Ok(())
}

/// Applies buffer-size requests to the descriptor. The receive size is
/// skipped when the window-scale probe shows setting it would shrink the TCP
/// receive window scale compared to the unmodified default.
pub(crate) fn apply_buffer_sizes(
    socket: &Socket,
    recv: Option<usize>,
    send: Option<usize>,
) -> Result<(), SocketError> {
    let mut result = Ok(());
    if let Some(size) = recv {
        if !wscale::suppress_recv_sizing() {
            if let Err(e) = socket.set_recv_buffer_size(size) {
                result = Err(SocketError::from(&e));
            }
        }
    }
    if let Some(size) = send {
        if let Err(e) = socket.set_send_buffer_size(size) {
            result = Err(SocketError::from(&e));
        }
    }
    result
}

/// Receive-window-scale probe.
///
/// Setting a small `SO_RCVBUF` before connect can permanently shrink the TCP
/// window scale factor the kernel advertises. `TCP_INFO` exposes the chosen
/// factor, so after the first connects with and without a modified buffer
/// size the two can be compared and receive-buffer sizing suppressed when it
/// would hurt.
#[cfg(target_os = "linux")]
pub(crate) mod wscale {
    use std::os::fd::RawFd;
    use std::sync::atomic::{AtomicI32, Ordering};

    static UNMODIFIED_RCV_WSCALE: AtomicI32 = AtomicI32::new(0);
    static MODIFIED_RCV_WSCALE: AtomicI32 = AtomicI32::new(0);

    // Leading fields of the kernel's tcp_info; the probe only needs the
    // window-scale byte.
    #[repr(C)]
    #[derive(Default)]
    struct TcpInfoPrefix {
        state: u8,
        ca_state: u8,
        retransmits: u8,
        probes: u8,
        backoff: u8,
        options: u8,
        // snd_wscale in the low nibble, rcv_wscale in the high one
        wscale: u8,
        app_limited: u8,
    }

    fn rcv_wscale(fd: RawFd) -> i32 {
        let mut info = TcpInfoPrefix::default();
        let mut len = std::mem::size_of::<TcpInfoPrefix>() as libc::socklen_t;
        let res = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if res != 0 {
            return 0;
        }
        (info.wscale >> 4) as i32
    }

    pub(crate) fn sample_unmodified(fd: RawFd) {
        if UNMODIFIED_RCV_WSCALE.load(Ordering::Relaxed) == 0 {
            UNMODIFIED_RCV_WSCALE.store(rcv_wscale(fd), Ordering::Relaxed);
        }
    }

    pub(crate) fn sample_modified(fd: RawFd) {
        if MODIFIED_RCV_WSCALE.load(Ordering::Relaxed) == 0 {
            MODIFIED_RCV_WSCALE.store(rcv_wscale(fd), Ordering::Relaxed);
        }
    }

    pub(crate) fn unmodified_known() -> bool {
        UNMODIFIED_RCV_WSCALE.load(Ordering::Relaxed) != 0
    }

    pub(crate) fn suppress_recv_sizing() -> bool {
        let modified = MODIFIED_RCV_WSCALE.load(Ordering::Relaxed);
        modified != 0 && modified < UNMODIFIED_RCV_WSCALE.load(Ordering::Relaxed)
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) mod wscale {
    pub(crate) fn unmodified_known() -> bool {
        true
    }

    pub(crate) fn suppress_recv_sizing() -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_set_operations() {
        let mut flags = SocketFlags::empty();
        flags.insert(SocketFlags::NODELAY);
        assert!(flags.contains(SocketFlags::NODELAY));
        assert!(!flags.contains(SocketFlags::KEEPALIVE));
        flags.insert(SocketFlags::KEEPALIVE);
        assert!(flags.contains(SocketFlags::NODELAY | SocketFlags::KEEPALIVE));
        flags.remove(SocketFlags::NODELAY);
        assert!(!flags.intersects(SocketFlags::NODELAY));
        assert!(flags.contains(SocketFlags::KEEPALIVE));
    }

    #[test]
    fn buffer_request_value() {
        assert_eq!(BufferRequest::Unset.value(), None);
        assert_eq!(BufferRequest::Cleared.value(), None);
        assert_eq!(BufferRequest::Set(4096).value(), Some(4096));
    }
}
