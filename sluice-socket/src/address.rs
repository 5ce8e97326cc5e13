use std::net::{IpAddr, SocketAddr};

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    /// Either family; resolution decides.
    #[default]
    Unspecified,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub(crate) fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Unspecified => true,
            Self::Ipv4 => addr.is_ipv4(),
            Self::Ipv6 => addr.is_ipv6(),
        }
    }

    pub(crate) fn matches_ip(self, ip: &IpAddr) -> bool {
        match self {
            Self::Unspecified => true,
            Self::Ipv4 => ip.is_ipv4(),
            Self::Ipv6 => ip.is_ipv6(),
        }
    }
}

/// Formats an address as a printable numeric string.
///
/// IPv6 addresses are bracketed only when the port is included, to keep the
/// colon-separated address unambiguous. The scope id suffix of link-local
/// addresses can be stripped on request.
pub fn address_to_string(addr: &SocketAddr, with_port: bool, strip_zone_index: bool) -> String {
    let host = match addr {
        SocketAddr::V4(v4) => v4.ip().to_string(),
        SocketAddr::V6(v6) => {
            let mut host = v6.ip().to_string();
            if v6.scope_id() != 0 && !strip_zone_index {
                host.push('%');
                host.push_str(&v6.scope_id().to_string());
            }
            host
        }
    };

    if with_port {
        if addr.is_ipv6() {
            format!("[{host}]:{}", addr.port())
        } else {
            format!("{host}:{}", addr.port())
        }
    } else {
        host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv6Addr, SocketAddrV6};

    #[test]
    fn v4_with_and_without_port() {
        let addr: SocketAddr = "127.0.0.1:21".parse().unwrap();
        assert_eq!(address_to_string(&addr, true, false), "127.0.0.1:21");
        assert_eq!(address_to_string(&addr, false, false), "127.0.0.1");
    }

    #[test]
    fn v6_brackets_only_with_port() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        assert_eq!(address_to_string(&addr, true, false), "[::1]:8080");
        assert_eq!(address_to_string(&addr, false, false), "::1");
    }

    #[test]
    fn zone_index_strip() {
        let v6 = SocketAddrV6::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1), 21, 0, 3);
        let addr = SocketAddr::V6(v6);
        assert_eq!(address_to_string(&addr, false, false), "fe80::1%3");
        assert_eq!(address_to_string(&addr, false, true), "fe80::1");
        assert_eq!(address_to_string(&addr, true, true), "[fe80::1]:21");
    }
}
