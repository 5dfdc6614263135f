use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use nix::errno::Errno;
use ovsock_core::{AddressFamily, PortError, PortResult, RawSock, SocketType};

/// Backlog passed to `listen` by default.
pub const MAX_BACKLOG: i32 = libc::SOMAXCONN;

/// Error `shutdown` reports on a handle that never connected.
pub const NOT_CONNECTED: i32 = libc::ENOTCONN;

pub const CONNECTION_RESET: i32 = libc::ECONNRESET;

/// Per-process handle limit reached.
pub const TOO_MANY_FILES: i32 = libc::EMFILE;

/// Errors that clear only once handles or buffers are given back.
pub fn is_resource_exhausted(code: i32) -> bool {
    matches!(code, libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
}

#[inline]
pub fn errno() -> i32 {
    Errno::last() as i32
}

#[inline]
fn cvt(ret: libc::c_int) -> PortResult<libc::c_int> {
    if ret < 0 {
        Err(PortError::Os(errno()))
    } else {
        Ok(ret)
    }
}

/// Nothing to initialise on unix.
pub fn startup() -> PortResult<()> {
    Ok(())
}

/// New non-blocking, close-on-exec socket.
pub fn socket(family: AddressFamily, ty: SocketType) -> PortResult<RawSock> {
    let domain = match family {
        AddressFamily::Inet => libc::AF_INET,
        AddressFamily::Inet6 => libc::AF_INET6,
    };
    let ty = match ty {
        SocketType::Stream => libc::SOCK_STREAM,
        SocketType::Datagram => libc::SOCK_DGRAM,
    };
    let fd = cvt(unsafe { libc::socket(domain, ty, 0) })?;
    if let Err(e) = set_nonblocking(fd).and_then(|_| set_cloexec(fd)) {
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

pub fn set_nonblocking(fd: RawSock) -> PortResult<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

fn set_cloexec(fd: RawSock) -> PortResult<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    Ok(())
}

pub fn set_reuse_addr(fd: RawSock) -> PortResult<()> {
    let opt: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            mem::size_of_val(&opt) as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn bind(fd: RawSock, addr: &SocketAddr) -> PortResult<()> {
    let (storage, len) = sockaddr_from(addr);
    cvt(unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) })?;
    Ok(())
}

pub fn listen(fd: RawSock, backlog: i32) -> PortResult<()> {
    cvt(unsafe { libc::listen(fd, backlog) })?;
    Ok(())
}

pub fn local_addr(fd: RawSock) -> PortResult<SocketAddr> {
    name_query(fd, libc::getsockname)
}

pub fn peer_addr(fd: RawSock) -> PortResult<SocketAddr> {
    name_query(fd, libc::getpeername)
}

fn name_query(
    fd: RawSock,
    f: unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
) -> PortResult<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe { f(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })?;
    sockaddr_to(&storage, len).ok_or(PortError::Unsupported("address family"))
}

/// Pending error on a socket (`SO_ERROR`), `0` when none.
pub fn take_error(fd: RawSock) -> PortResult<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of_val(&err) as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(err)
}

/// Shut down both directions.
pub fn shutdown(fd: RawSock) -> PortResult<()> {
    cvt(unsafe { libc::shutdown(fd, libc::SHUT_RDWR) })?;
    Ok(())
}

pub fn close(fd: RawSock) -> PortResult<()> {
    cvt(unsafe { libc::close(fd) })?;
    Ok(())
}

/// Encode `addr` as a C socket address.
pub fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                ..unsafe { mem::zeroed() }
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
                ..unsafe { mem::zeroed() }
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Decode a C socket address; `None` for families other than IPv4/IPv6.
pub fn sockaddr_to(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_v4() {
        let addr: SocketAddr = "10.1.2.3:4567".parse().unwrap();
        let (storage, len) = sockaddr_from(&addr);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        assert_eq!(sockaddr_to(&storage, len), Some(addr));
    }

    #[test]
    fn test_sockaddr_v6() {
        let addr: SocketAddr = "[fe80::1%3]:80".parse().unwrap();
        let (storage, len) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to(&storage, len), Some(addr));
    }

    #[test]
    fn test_sockaddr_short_len() {
        let addr: SocketAddr = "10.1.2.3:1".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to(&storage, 2), None);
    }

    #[test]
    fn test_socket_is_nonblocking() {
        let fd = socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
        assert_eq!(take_error(fd).unwrap(), 0);
        close(fd).unwrap();
    }
}
