use std::io;

use thiserror::Error;

/// Platform-normalized socket errors.
///
/// Every native error code crossing the public surface is translated into
/// this set first, so consumers never see raw platform codes. The mapping is
/// table-driven: [`io::ErrorKind`] where one exists, the raw OS code
/// otherwise, and [`SocketError::Other`] as the escape hatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SocketError {
    /// No progress possible right now; re-arms readiness interest on the
    /// affected direction.
    #[error("operation would block")]
    WouldBlock,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("operation timed out")]
    TimedOut,
    #[error("host is down")]
    HostDown,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("address in use")]
    AddrInUse,
    #[error("process descriptor limit reached")]
    ProcessFileLimit,
    #[error("out of memory")]
    OutOfMemory,
    #[error("interrupted")]
    Interrupted,
    #[error("bad buffer address")]
    BadAddress,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid argument")]
    InvalidInput,
    #[error("socket not connected")]
    NotConnected,
    #[error("socket already connected")]
    AlreadyConnected,
    /// Name resolution produced no usable address.
    #[error("host not found")]
    HostNotFound,
    /// Platform code with no portable equivalent.
    #[error("socket error {0}")]
    Other(i32),
}

impl SocketError {
    /// Translates a std I/O error. `ErrorKind` is consulted first, the raw
    /// OS code second.
    pub fn from_io(err: &io::Error) -> Self {
        use io::ErrorKind;

        match err.kind() {
            ErrorKind::WouldBlock => return Self::WouldBlock,
            ErrorKind::ConnectionRefused => return Self::ConnectionRefused,
            ErrorKind::ConnectionAborted => return Self::ConnectionAborted,
            ErrorKind::ConnectionReset => return Self::ConnectionReset,
            ErrorKind::TimedOut => return Self::TimedOut,
            ErrorKind::AddrInUse => return Self::AddrInUse,
            ErrorKind::Interrupted => return Self::Interrupted,
            ErrorKind::PermissionDenied => return Self::AccessDenied,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => return Self::InvalidInput,
            ErrorKind::NotConnected => return Self::NotConnected,
            ErrorKind::OutOfMemory => return Self::OutOfMemory,
            _ => {}
        }

        match err.raw_os_error() {
            Some(code) => Self::from_raw_os(code),
            None => Self::Other(0),
        }
    }

    /// Translates a raw OS error code.
    #[cfg(unix)]
    pub fn from_raw_os(code: i32) -> Self {
        // EWOULDBLOCK and EAGAIN coincide on most platforms but not all.
        if code == libc::EWOULDBLOCK {
            return Self::WouldBlock;
        }
        match code {
            libc::EAGAIN => Self::WouldBlock,
            libc::ECONNREFUSED => Self::ConnectionRefused,
            libc::ECONNABORTED => Self::ConnectionAborted,
            libc::ECONNRESET => Self::ConnectionReset,
            libc::ETIMEDOUT => Self::TimedOut,
            libc::EHOSTDOWN | libc::EHOSTUNREACH => Self::HostDown,
            libc::ENETUNREACH => Self::NetworkUnreachable,
            libc::EADDRINUSE => Self::AddrInUse,
            libc::EMFILE | libc::ENFILE => Self::ProcessFileLimit,
            libc::ENOMEM | libc::ENOBUFS => Self::OutOfMemory,
            libc::EINTR => Self::Interrupted,
            libc::EFAULT => Self::BadAddress,
            libc::EACCES => Self::AccessDenied,
            libc::EINVAL => Self::InvalidInput,
            libc::ENOTCONN => Self::NotConnected,
            libc::EISCONN | libc::EALREADY => Self::AlreadyConnected,
            libc::EPIPE => Self::ConnectionReset,
            other => Self::Other(other),
        }
    }

    #[cfg(not(unix))]
    pub fn from_raw_os(code: i32) -> Self {
        Self::Other(code)
    }
}

impl From<&io::Error> for SocketError {
    fn from(err: &io::Error) -> Self {
        Self::from_io(err)
    }
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        Self::from_io(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_takes_precedence() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(SocketError::from_io(&err), SocketError::ConnectionRefused);
    }

    #[cfg(unix)]
    #[test]
    fn raw_code_fallback() {
        assert_eq!(
            SocketError::from_raw_os(libc::EHOSTDOWN),
            SocketError::HostDown
        );
        assert_eq!(
            SocketError::from_raw_os(libc::EMFILE),
            SocketError::ProcessFileLimit
        );
        assert_eq!(SocketError::from_raw_os(libc::EPIPE), SocketError::ConnectionReset);
        assert!(matches!(SocketError::from_raw_os(-9999), SocketError::Other(-9999)));
    }

    #[cfg(unix)]
    #[test]
    fn would_block_from_os_error() {
        let err = io::Error::from_raw_os_error(libc::EAGAIN);
        assert_eq!(SocketError::from_io(&err), SocketError::WouldBlock);
    }
}
