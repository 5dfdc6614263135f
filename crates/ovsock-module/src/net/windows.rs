use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;
use std::sync::OnceLock;

use ovsock_core::{AddressFamily, PortError, PortResult, RawSock, SocketType};
use windows_sys::Win32::Networking::WinSock::{
    bind as ws_bind, closesocket, getpeername, getsockname, listen as ws_listen, setsockopt,
    shutdown as ws_shutdown, WSAGetLastError, WSASocketW, WSAStartup, AF_INET, AF_INET6,
    INVALID_SOCKET, IN6_ADDR, IN6_ADDR_0, IN_ADDR, IN_ADDR_0, IPPROTO_TCP, IPPROTO_UDP, SD_BOTH,
    SOCKADDR, SOCKADDR_IN, SOCKADDR_IN6, SOCKADDR_IN6_0, SOCKADDR_STORAGE, SOCKET_ERROR,
    SOCK_DGRAM, SOCK_STREAM, SOL_SOCKET, SOMAXCONN, SO_EXCLUSIVEADDRUSE, WSADATA,
    WSAECONNRESET, WSAEMFILE, WSAENOBUFS, WSAENOTCONN, WSA_FLAG_OVERLAPPED,
};

/// Backlog passed to `listen` by default.
pub const MAX_BACKLOG: i32 = SOMAXCONN as i32;

/// Error `shutdown` reports on a handle that never connected.
pub const NOT_CONNECTED: i32 = WSAENOTCONN;

pub const CONNECTION_RESET: i32 = WSAECONNRESET;

/// Per-process handle limit reached.
pub const TOO_MANY_FILES: i32 = WSAEMFILE;

/// Errors that clear only once handles or buffers are given back.
pub fn is_resource_exhausted(code: i32) -> bool {
    matches!(code, WSAEMFILE | WSAENOBUFS)
}

#[inline]
pub fn errno() -> i32 {
    unsafe { WSAGetLastError() }
}

#[inline]
fn cvt(ret: i32) -> PortResult<i32> {
    if ret == SOCKET_ERROR {
        Err(PortError::Os(errno()))
    } else {
        Ok(ret)
    }
}

/// Initialise Winsock 2.2 once per process.
pub fn startup() -> PortResult<()> {
    static STARTED: OnceLock<i32> = OnceLock::new();
    let code = *STARTED.get_or_init(|| {
        let mut data: WSADATA = unsafe { mem::zeroed() };
        unsafe { WSAStartup(0x0202, &mut data) }
    });
    match code {
        0 => Ok(()),
        code => Err(PortError::Os(code)),
    }
}

/// New overlapped-capable socket.
pub fn socket(family: AddressFamily, ty: SocketType) -> PortResult<RawSock> {
    startup()?;
    let af = match family {
        AddressFamily::Inet => AF_INET,
        AddressFamily::Inet6 => AF_INET6,
    };
    let (ty, proto) = match ty {
        SocketType::Stream => (SOCK_STREAM, IPPROTO_TCP),
        SocketType::Datagram => (SOCK_DGRAM, IPPROTO_UDP),
    };
    let s = unsafe {
        WSASocketW(
            af as i32,
            ty,
            proto,
            ptr::null(),
            0,
            WSA_FLAG_OVERLAPPED,
        )
    };
    if s == INVALID_SOCKET {
        return Err(PortError::Os(errno()));
    }
    Ok(s)
}

/// Sockets are overlapped already; completion ports never block on them.
pub fn set_nonblocking(_s: RawSock) -> PortResult<()> {
    Ok(())
}

/// Windows `SO_REUSEADDR` allows port hijacking; keep the port exclusive
/// instead.
pub fn set_reuse_addr(s: RawSock) -> PortResult<()> {
    let opt: i32 = 1;
    cvt(unsafe {
        setsockopt(
            s,
            SOL_SOCKET,
            SO_EXCLUSIVEADDRUSE,
            &opt as *const _ as *const u8,
            mem::size_of_val(&opt) as i32,
        )
    })?;
    Ok(())
}

pub fn bind(s: RawSock, addr: &SocketAddr) -> PortResult<()> {
    let (storage, len) = sockaddr_from(addr);
    cvt(unsafe { ws_bind(s, &storage as *const _ as *const SOCKADDR, len) })?;
    Ok(())
}

pub fn listen(s: RawSock, backlog: i32) -> PortResult<()> {
    cvt(unsafe { ws_listen(s, backlog) })?;
    Ok(())
}

pub fn local_addr(s: RawSock) -> PortResult<SocketAddr> {
    let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
    cvt(unsafe { getsockname(s, &mut storage as *mut _ as *mut SOCKADDR, &mut len) })?;
    sockaddr_to(&storage, len).ok_or(PortError::Unsupported("address family"))
}

pub fn peer_addr(s: RawSock) -> PortResult<SocketAddr> {
    let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
    cvt(unsafe { getpeername(s, &mut storage as *mut _ as *mut SOCKADDR, &mut len) })?;
    sockaddr_to(&storage, len).ok_or(PortError::Unsupported("address family"))
}

/// Shut down both directions.
pub fn shutdown(s: RawSock) -> PortResult<()> {
    cvt(unsafe { ws_shutdown(s, SD_BOTH) })?;
    Ok(())
}

pub fn close(s: RawSock) -> PortResult<()> {
    cvt(unsafe { closesocket(s) })?;
    Ok(())
}

pub fn sockaddr_from(addr: &SocketAddr) -> (SOCKADDR_STORAGE, i32) {
    let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = SOCKADDR_IN {
                sin_family: AF_INET,
                sin_port: a.port().to_be(),
                sin_addr: IN_ADDR {
                    S_un: IN_ADDR_0 {
                        S_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut SOCKADDR_IN, sin) };
            mem::size_of::<SOCKADDR_IN>()
        }
        SocketAddr::V6(a) => {
            let sin6 = SOCKADDR_IN6 {
                sin6_family: AF_INET6,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: IN6_ADDR {
                    u: IN6_ADDR_0 {
                        Byte: a.ip().octets(),
                    },
                },
                Anonymous: SOCKADDR_IN6_0 {
                    sin6_scope_id: a.scope_id(),
                },
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut SOCKADDR_IN6, sin6) };
            mem::size_of::<SOCKADDR_IN6>()
        }
    };
    (storage, len as i32)
}

pub fn sockaddr_to(storage: &SOCKADDR_STORAGE, len: i32) -> Option<SocketAddr> {
    match storage.ss_family {
        AF_INET if len as usize >= mem::size_of::<SOCKADDR_IN>() => {
            let sin = unsafe { &*(storage as *const _ as *const SOCKADDR_IN) };
            let ip = Ipv4Addr::from(unsafe { sin.sin_addr.S_un.S_addr }.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        AF_INET6 if len as usize >= mem::size_of::<SOCKADDR_IN6>() => {
            let sin6 = unsafe { &*(storage as *const _ as *const SOCKADDR_IN6) };
            let ip = Ipv6Addr::from(unsafe { sin6.sin6_addr.u.Byte });
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                unsafe { sin6.Anonymous.sin6_scope_id },
            )))
        }
        _ => None,
    }
}
