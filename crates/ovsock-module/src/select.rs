//! Backend selection.

use std::sync::Arc;

use ovsock_core::{kinfo, Backend, CompletionPort, PortError, PortResult};

/// Open the completion port for `backend`.
///
/// `Auto` prefers the native port of the platform. On Linux that is
/// io_uring, and when the ring cannot be created (old kernel, seccomp,
/// `RLIMIT_MEMLOCK`) it falls back to epoll.
pub fn open_port(backend: Backend, ring_entries: u32) -> PortResult<Arc<dyn CompletionPort>> {
    let port = open(backend, ring_entries)?;
    kinfo!("completion port: {}", port.name());
    Ok(port)
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use ovsock_core::kwarn;
        use crate::{EpollPort, UringPort};

        fn open(backend: Backend, ring_entries: u32) -> PortResult<Arc<dyn CompletionPort>> {
            match backend {
                Backend::IoUring => Ok(Arc::new(UringPort::new(ring_entries)?)),
                Backend::Epoll => Ok(Arc::new(EpollPort::new()?)),
                Backend::Iocp => Err(PortError::Unsupported("iocp backend on linux")),
                Backend::Auto => match UringPort::new(ring_entries) {
                    Ok(p) => Ok(Arc::new(p)),
                    Err(e) => {
                        kwarn!("io_uring unavailable ({}), using epoll", e);
                        Ok(Arc::new(EpollPort::new()?))
                    }
                },
            }
        }
    } else if #[cfg(windows)] {
        use crate::IocpPort;

        fn open(backend: Backend, _ring_entries: u32) -> PortResult<Arc<dyn CompletionPort>> {
            match backend {
                Backend::Auto | Backend::Iocp => Ok(Arc::new(IocpPort::new(0)?)),
                other => Err(PortError::Unsupported(match other {
                    Backend::IoUring => "io_uring backend on windows",
                    _ => "epoll backend on windows",
                })),
            }
        }
    } else {
        fn open(_backend: Backend, _ring_entries: u32) -> PortResult<Arc<dyn CompletionPort>> {
            Err(PortError::Unsupported("no completion port backend for this platform"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_opens_something() {
        let port = open_port(Backend::Auto, 64).unwrap();
        assert!(!port.name().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_backends() {
        assert_eq!(open_port(Backend::Epoll, 64).unwrap().name(), "epoll");
        assert!(open_port(Backend::Iocp, 64).is_err());
    }
}
