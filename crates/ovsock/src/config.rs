//! Runtime and socket configuration

use std::net::IpAddr;

use ovsock_core::env::{env_get, env_get_opt};
use ovsock_core::{kwarn, Backend, DEFAULT_BUFFER_SIZE};

/// Upper bound on worker threads.
pub const MAX_WORKERS: usize = 256;

/// Receives armed right after a connect or accept completes.
pub const DEFAULT_RECV_DEPTH: usize = 4;

/// Configuration for a [`Runtime`](crate::Runtime)
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker threads draining the completion port (default: 2 x CPUs)
    pub num_workers: usize,

    /// Floor applied to `num_workers`
    pub min_workers: usize,

    /// Completions dequeued per wait
    pub batch_size: usize,

    /// Completion port implementation
    pub backend: Backend,

    /// io_uring submission queue size
    pub ring_entries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            num_workers: (num_cpus * 2).min(MAX_WORKERS),
            min_workers: 2,
            batch_size: 16,
            backend: Backend::Auto,
            ring_entries: 256,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `OVSOCK_WORKERS`, `OVSOCK_BACKEND` and
    /// `OVSOCK_RING_ENTRIES`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.num_workers = env_get("OVSOCK_WORKERS", cfg.num_workers).min(MAX_WORKERS);
        cfg.ring_entries = env_get("OVSOCK_RING_ENTRIES", cfg.ring_entries);
        if let Ok(raw) = std::env::var("OVSOCK_BACKEND") {
            match raw.parse() {
                Ok(b) => cfg.backend = b,
                Err(e) => kwarn!("OVSOCK_BACKEND ignored: {}", e),
            }
        }
        if let Some(min) = env_get_opt("OVSOCK_MIN_WORKERS") {
            cfg.min_workers = min;
        }
        cfg
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n.min(MAX_WORKERS);
        self
    }

    pub fn min_workers(mut self, n: usize) -> Self {
        self.min_workers = n;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn backend(mut self, b: Backend) -> Self {
        self.backend = b;
        self
    }

    pub fn ring_entries(mut self, n: u32) -> Self {
        self.ring_entries = n;
        self
    }

    /// Worker count actually started.
    pub fn effective_workers(&self) -> usize {
        self.num_workers.max(self.min_workers).clamp(1, MAX_WORKERS)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.num_workers == 0 && self.min_workers == 0 {
            return Err("num_workers must be at least 1");
        }
        if self.min_workers > MAX_WORKERS {
            return Err("min_workers exceeds maximum");
        }
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1");
        }
        if self.ring_entries == 0 {
            return Err("ring_entries must be at least 1");
        }
        Ok(())
    }
}

/// What a failed operation on a server tears down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureScope {
    /// Close the whole server on any accept, recv or send failure.
    #[default]
    Server,
    /// Close only the affected client. A failed accept is replaced, or held
    /// back until a client slot frees when the process is out of handles.
    Client,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub failure_scope: FailureScope,
    /// `listen` backlog (default: platform maximum)
    pub backlog: i32,
    /// Receives armed per accepted client
    pub recv_depth: usize,
    pub recv_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            failure_scope: FailureScope::Server,
            backlog: ovsock_module::net::MAX_BACKLOG,
            recv_depth: DEFAULT_RECV_DEPTH,
            recv_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_scope(mut self, scope: FailureScope) -> Self {
        self.failure_scope = scope;
        self
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub fn recv_depth(mut self, n: usize) -> Self {
        self.recv_depth = n;
        self
    }

    pub fn recv_buffer_size(mut self, n: usize) -> Self {
        self.recv_buffer_size = n.max(1);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Receives armed once connected
    pub recv_depth: usize,
    pub recv_buffer_size: usize,
    /// Source address bound before connecting (default: the wildcard of
    /// the candidate's family)
    pub local_ip: Option<IpAddr>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            recv_depth: DEFAULT_RECV_DEPTH,
            recv_buffer_size: DEFAULT_BUFFER_SIZE,
            local_ip: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recv_depth(mut self, n: usize) -> Self {
        self.recv_depth = n;
        self
    }

    pub fn recv_buffer_size(mut self, n: usize) -> Self {
        self.recv_buffer_size = n.max(1);
        self
    }

    pub fn local_ip(mut self, ip: IpAddr) -> Self {
        self.local_ip = Some(ip);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.num_workers >= 2);
        assert_eq!(cfg.num_workers % 2, 0);
        assert_eq!(cfg.batch_size, 16);
        assert_eq!(cfg.backend, Backend::Auto);
        assert!(cfg.validate().is_ok());

        let s = ServerConfig::default();
        assert_eq!(s.failure_scope, FailureScope::Server);
        assert_eq!(s.recv_depth, 4);
        assert_eq!(ClientConfig::default().recv_buffer_size, 8192);
    }

    #[test]
    fn test_effective_workers_floor() {
        let cfg = RuntimeConfig::new().num_workers(1).min_workers(3);
        assert_eq!(cfg.effective_workers(), 3);
        let cfg = RuntimeConfig::new().num_workers(10_000);
        assert_eq!(cfg.effective_workers(), MAX_WORKERS);
    }

    #[test]
    fn test_validate() {
        assert!(RuntimeConfig::new().batch_size(0).validate().is_err());
        assert!(RuntimeConfig::new().num_workers(0).min_workers(0).validate().is_err());
        assert!(RuntimeConfig::new().ring_entries(0).validate().is_err());
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("OVSOCK_WORKERS", "3");
        std::env::set_var("OVSOCK_BACKEND", "epoll");
        std::env::set_var("OVSOCK_RING_ENTRIES", "512");
        let cfg = RuntimeConfig::from_env();
        std::env::remove_var("OVSOCK_WORKERS");
        std::env::remove_var("OVSOCK_BACKEND");
        std::env::remove_var("OVSOCK_RING_ENTRIES");

        assert_eq!(cfg.num_workers, 3);
        assert_eq!(cfg.backend, Backend::Epoll);
        assert_eq!(cfg.ring_entries, 512);
    }
}
