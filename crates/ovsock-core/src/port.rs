//! Completion port abstraction.
//!
//! A `CompletionPort` accepts overlapped socket operations and hands back
//! one [`CompletionEntry`] per finished operation, from any worker thread
//! that calls [`wait`](CompletionPort::wait).
//!
//! # Implementors
//!
//! - `IocpPort` (Windows): an I/O completion port. `ConnectEx`/`AcceptEx`
//!   for connect/accept, `WSARecv`/`WSASend` for data.
//!
//! - `UringPort` (Linux): one io_uring shared by all workers. Closest
//!   native equivalent of a completion port.
//!
//! - `EpollPort` (Linux): completions emulated on top of readiness. Used
//!   when io_uring is unavailable (old kernels, seccomp sandboxes).
//!
//! The socket layer only ever talks to `dyn CompletionPort`; which one is
//! in use is decided once when the runtime starts.

use core::fmt;
use core::str::FromStr;
use std::net::SocketAddr;

use crate::entry::{CompletionEntry, OpToken};
use crate::error::PortResult;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Native socket handle.
        pub type RawSock = std::os::unix::io::RawFd;
        /// The "not open" handle value.
        pub const INVALID_SOCK: RawSock = -1;
    } else if #[cfg(windows)] {
        /// Native socket handle (`SOCKET`).
        pub type RawSock = usize;
        /// The "not open" handle value (`INVALID_SOCKET`).
        pub const INVALID_SOCK: RawSock = usize::MAX;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    /// The wildcard address of this family with port 0.
    pub fn unspecified(self) -> SocketAddr {
        match self {
            AddressFamily::Inet => SocketAddr::from(([0, 0, 0, 0], 0)),
            AddressFamily::Inet6 => SocketAddr::from(([0u16; 8], 0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

/// One overlapped request.
///
/// Buffers are raw because the OS keeps them past the call. The caller
/// guarantees they stay valid and unmoved until the matching completion
/// has been returned by [`CompletionPort::wait`].
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    /// Connect `sock` to `addr`. `sock` must already be bound.
    Connect { addr: SocketAddr },
    /// Accept a connection on listener `sock` into the pre-created handle
    /// `accept_into`, which must be associated with the same port.
    Accept { accept_into: RawSock },
    Recv { buf: *mut u8, len: usize },
    Send { buf: *const u8, len: usize },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Connect { .. } => "connect",
            Operation::Accept { .. } => "accept",
            Operation::Recv { .. } => "recv",
            Operation::Send { .. } => "send",
        }
    }
}

/// Completion port operations.
///
/// **Contract:** `submit` and `post` never block. Every submitted operation
/// produces exactly one entry from `wait`, including operations that
/// finished synchronously and operations aborted by [`release`].
///
/// [`release`]: CompletionPort::release
pub trait CompletionPort: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Register `sock` with the port. Completions for it carry `key`.
    fn associate(&self, sock: RawSock, key: u32) -> PortResult<()>;

    /// Start `op` on `sock`. The completion carries `token`.
    ///
    /// # Safety
    ///
    /// Any buffer named by `op` must stay valid, and must not be moved or
    /// accessed mutably by anyone else, until `token`'s completion has been
    /// returned by [`wait`](CompletionPort::wait).
    unsafe fn submit(&self, sock: RawSock, token: OpToken, op: Operation) -> PortResult<()>;

    /// Queue a bare entry carrying `key` and no operation.
    fn post(&self, key: u64) -> PortResult<()>;

    /// Block until at least one entry is available, then fill up to
    /// `out.len()` entries. Returns the number written.
    fn wait(&self, out: &mut [CompletionEntry]) -> PortResult<usize>;

    /// `sock` is about to be closed: abort its outstanding operations.
    /// Aborted operations still complete, with an error.
    fn release(&self, sock: RawSock);

    /// Finish a successful connect so the handle behaves as connected.
    fn complete_connect(&self, sock: RawSock) -> PortResult<()>;

    /// Finish a successful accept of `accepted` on `listener`.
    fn complete_accept(&self, listener: RawSock, accepted: RawSock) -> PortResult<()>;
}

/// Which completion port implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// IOCP on Windows; io_uring on Linux, falling back to epoll.
    #[default]
    Auto,
    IoUring,
    Epoll,
    Iocp,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Auto => "auto",
            Backend::IoUring => "io_uring",
            Backend::Epoll => "epoll",
            Backend::Iocp => "iocp",
        })
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Backend::Auto),
            "io_uring" | "iouring" | "uring" => Ok(Backend::IoUring),
            "epoll" => Ok(Backend::Epoll),
            "iocp" => Ok(Backend::Iocp),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!("auto".parse::<Backend>(), Ok(Backend::Auto));
        assert_eq!("IO_URING".parse::<Backend>(), Ok(Backend::IoUring));
        assert_eq!(" epoll ".parse::<Backend>(), Ok(Backend::Epoll));
        assert_eq!("iocp".parse::<Backend>(), Ok(Backend::Iocp));
        assert!("kqueue".parse::<Backend>().is_err());
        assert_eq!(Backend::IoUring.to_string(), "io_uring");
    }

    #[test]
    fn test_family() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert_eq!(AddressFamily::of(&v4), AddressFamily::Inet);
        assert_eq!(AddressFamily::of(&v6), AddressFamily::Inet6);
        assert!(AddressFamily::Inet6.unspecified().ip().is_unspecified());
        assert_eq!(AddressFamily::Inet.unspecified().port(), 0);
    }
}
