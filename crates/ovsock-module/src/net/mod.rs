//! Blocking socket syscalls used around the overlapped operations:
//! create, bind, listen, address queries, shutdown, close.
//!
//! Every function takes and returns raw handles; ownership is tracked one
//! level up, in `ovsock::Socket`.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else if #[cfg(windows)] {
        mod windows;
        pub use windows::*;
    }
}

use std::net::SocketAddr;

use ovsock_core::RawSock;

/// `true` when `sock` has a local address with a nonzero port.
pub fn is_bound(sock: RawSock) -> bool {
    matches!(local_addr(sock), Ok(addr) if addr.port() != 0)
}

/// Numeric host text and port of `addr`.
pub fn host_port(addr: &SocketAddr) -> (String, u16) {
    (addr.ip().to_string(), addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovsock_core::{AddressFamily, SocketType, INVALID_SOCK};

    #[test]
    fn test_socket_bind_listen() {
        startup().unwrap();
        let s = socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        assert_ne!(s, INVALID_SOCK);
        assert!(!is_bound(s));

        bind(s, &"127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(is_bound(s));
        listen(s, MAX_BACKLOG).unwrap();

        let addr = local_addr(s).unwrap();
        assert!(addr.ip().is_loopback());
        assert!(peer_addr(s).is_err());
        close(s).unwrap();
    }

    #[test]
    fn test_bind_conflict_reports_os_error() {
        let a = socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        bind(a, &"127.0.0.1:0".parse().unwrap()).unwrap();
        listen(a, MAX_BACKLOG).unwrap();
        let taken = local_addr(a).unwrap();

        let b = socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        let err = bind(b, &taken).unwrap_err();
        assert!(err.os_code().is_some());

        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn test_resource_exhaustion_classes() {
        assert!(is_resource_exhausted(TOO_MANY_FILES));
        assert!(!is_resource_exhausted(CONNECTION_RESET));
        assert!(!is_resource_exhausted(NOT_CONNECTED));
        assert!(!is_resource_exhausted(0));
    }

    #[test]
    fn test_host_port() {
        let (h, p) = host_port(&"[::1]:8080".parse().unwrap());
        assert_eq!(h, "::1");
        assert_eq!(p, 8080);
    }
}
