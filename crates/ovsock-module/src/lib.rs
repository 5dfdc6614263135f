//! # ovsock-module: OS backends
//!
//! Implementations of [`ovsock_core::CompletionPort`] plus the socket
//! syscalls the socket layer needs around them.
//!
//! | Platform | Backend    | Notes                                        |
//! |----------|------------|----------------------------------------------|
//! | Windows  | `IocpPort` | native completion port, `ConnectEx/AcceptEx` |
//! | Linux    | `UringPort`| one shared io_uring                          |
//! | Linux    | `EpollPort`| readiness-emulated, fallback for io_uring    |
//!
//! [`select::open_port`] picks one at runtime start.

use std::sync::{Mutex, MutexGuard};

pub mod net;
pub mod select;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod uring_port;
        pub mod epoll_port;
        pub use uring_port::UringPort;
        pub use epoll_port::EpollPort;
    } else if #[cfg(windows)] {
        pub mod iocp_port;
        pub use iocp_port::IocpPort;
    }
}

pub use select::open_port;

#[cfg(all(test, any(target_os = "linux", windows)))]
mod conformance;

/// Lock, recovering the guard from a poisoned mutex.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
