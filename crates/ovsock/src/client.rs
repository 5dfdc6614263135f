//! Outbound TCP connection.
//!
//! State machine:
//!
//! ```text
//! Unopened -> Open -> Connecting -> Connected -> Closed
//!                          |                        ^
//!                          +------------------------+  (connect failed)
//! ```
//!
//! Closed is terminal. Once connected, `recv_depth` receives are kept in
//! flight; each receive that delivers data is replaced by exactly one new
//! receive after `on_data` returns.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, Weak};

use ovsock_core::{
    kdebug, kerror, kwarn, os_error_string, AddressFamily, CompletionContext, OpKind, OpToken,
    Operation, PortError, PortResult, SocketType,
};
use ovsock_module::net;

use crate::config::ClientConfig;
use crate::events::{
    ClientEvents, ClientLink, CloseEvent, CloseReason, ConnectEvent, DataEvent, ErrorEvent,
};
use crate::lock;
use crate::runtime::{CompletionTarget, Runtime};
use crate::socket::{PendingSet, Socket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unopened,
    Open,
    Connecting,
    Connected,
    Closed,
}

pub(crate) struct ClientCore {
    me: Weak<ClientCore>,
    rt: Arc<Runtime>,
    key: u32,
    sock: Socket,
    config: ClientConfig,
    pending: PendingSet,
    events: ClientEvents,
    state: Mutex<ClientState>,
    /// Candidate of the connect in flight.
    target: Mutex<Option<SocketAddr>>,
}

impl ClientCore {
    fn link(&self) -> ClientLink {
        ClientLink {
            core: self.me.clone(),
        }
    }

    fn state(&self) -> ClientState {
        *lock(&self.state)
    }

    fn is_closed(&self) -> bool {
        self.state() == ClientState::Closed
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.is_closed() && self.sock.is_open()
    }

    fn create(&self, family: AddressFamily, ty: SocketType) -> PortResult<()> {
        let mut st = lock(&self.state);
        if *st == ClientState::Closed {
            return Err(PortError::Closed);
        }
        self.sock.create(family, ty)?;
        *st = ClientState::Open;
        Ok(())
    }

    fn connect_to(&self, addrs: &[SocketAddr]) -> bool {
        match self.state() {
            ClientState::Unopened | ClientState::Open => {}
            other => {
                kwarn!("client {}: connect in state {:?}", self.key, other);
                return false;
            }
        }
        for addr in addrs {
            match self.try_connect(addr) {
                Ok(()) => {
                    kdebug!("client {}: connecting to {}", self.key, addr);
                    return true;
                }
                Err(e) => kdebug!("client {}: candidate {} failed: {}", self.key, addr, e),
            }
        }
        kwarn!("client {}: no connect candidate succeeded", self.key);
        false
    }

    fn try_connect(&self, addr: &SocketAddr) -> PortResult<()> {
        let family = AddressFamily::of(addr);
        let created = !self.sock.is_open();
        if created {
            self.create(family, SocketType::Stream)?;
        } else if self.sock.family() != Some(family) {
            return Err(PortError::Unsupported("candidate address family"));
        }
        let attempt = self.bind_and_connect(family, addr);
        if attempt.is_err() && created {
            self.discard_created();
        }
        attempt
    }

    /// Give back a handle a failed candidate opened, so the next candidate
    /// starts from an unopened socket of its own family.
    fn discard_created(&self) {
        let mut st = lock(&self.state);
        if *st != ClientState::Open {
            return;
        }
        if let Err(e) = self.sock.discard() {
            kdebug!("client {}: discard: {}", self.key, e);
        }
        *st = ClientState::Unopened;
    }

    fn bind_and_connect(&self, family: AddressFamily, addr: &SocketAddr) -> PortResult<()> {
        if !self.sock.is_bound() {
            let local = match self.config.local_ip {
                Some(ip) => SocketAddr::new(ip, 0),
                None => family.unspecified(),
            };
            self.sock.bind(&local)?;
        }

        *lock(&self.target) = Some(*addr);
        {
            let mut st = lock(&self.state);
            if *st != ClientState::Open {
                return Err(PortError::Closed);
            }
            *st = ClientState::Connecting;
        }
        let addr = *addr;
        let submitted =
            self.pending
                .submit(&self.sock, self.key, CompletionContext::connect(self.key), |_| {
                    Operation::Connect { addr }
                });
        if submitted.is_err() {
            let mut st = lock(&self.state);
            if *st == ClientState::Connecting {
                *st = ClientState::Open;
            }
        }
        submitted
    }

    pub(crate) fn send(&self, data: &[u8]) -> bool {
        if !self.is_open() {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        self.submit(CompletionContext::send(self.key, data), |c| Operation::Send {
            buf: c.buffer.as_ptr(),
            len: c.buffer.len(),
        })
    }

    fn recv(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        let ctx = CompletionContext::recv(self.key, self.config.recv_buffer_size);
        self.submit(ctx, |c| Operation::Recv {
            buf: c.buffer.as_mut_ptr(),
            len: c.buffer.len(),
        })
    }

    fn submit(
        &self,
        ctx: CompletionContext,
        build: impl FnOnce(&mut CompletionContext) -> Operation,
    ) -> bool {
        let kind = ctx.kind;
        match self.pending.submit(&self.sock, self.key, ctx, build) {
            Ok(()) => true,
            Err(e) => {
                kdebug!("client {}: {} not started: {}", self.key, kind, e);
                self.retire();
                false
            }
        }
    }

    pub(crate) fn close(&self) -> bool {
        self.shut(CloseReason::Local)
    }

    fn shut(&self, reason: CloseReason) -> bool {
        self.shut_with(reason, || {})
    }

    /// Close once. `first` runs only for the call that wins the close.
    fn shut_with(&self, reason: CloseReason, first: impl FnOnce()) -> bool {
        let prev = std::mem::replace(&mut *lock(&self.state), ClientState::Closed);
        if prev == ClientState::Closed {
            return true;
        }
        first();
        let ok = match self.sock.close() {
            Ok(()) => true,
            Err(e) => {
                kwarn!("client {}: close: {}", self.key, e);
                false
            }
        };
        if prev != ClientState::Unopened {
            kdebug!("client {}: closed ({})", self.key, reason);
            self.events.on_close.try_invoke(&CloseEvent { reason });
        }
        self.retire();
        ok
    }

    /// Drop out of the registry once closed and idle.
    fn retire(&self) {
        if self.pending.retire_if_drained(self.is_closed()) {
            self.rt.unregister(self.key);
        }
    }

    /// A live operation failed: report it, then close.
    /// Report a failed operation, then close. Concurrent failures report
    /// once.
    fn fail(&self, op: OpKind, code: i32) {
        self.shut_with(CloseReason::Error { op, code }, || {
            kdebug!("client {}: {} failed: {}", self.key, op, os_error_string(code));
            self.events.on_error.try_invoke(&ErrorEvent { op, code });
        });
    }

    fn on_connected(&self, error: i32) {
        if error != 0 {
            self.fail(OpKind::Connect, error);
            return;
        }
        if let Err(e) = self.sock.complete_connect() {
            if !self.is_closed() {
                kwarn!("client {}: finalizing connect: {}", self.key, e);
            }
            self.fail(OpKind::Connect, e.os_code().unwrap_or(-1));
            return;
        }
        {
            let mut st = lock(&self.state);
            if *st != ClientState::Connecting {
                return;
            }
            *st = ClientState::Connected;
        }

        let peer = self.sock.peer_addr().ok().or(*lock(&self.target));
        let (host, port) = peer.map(|a| net::host_port(&a)).unwrap_or_default();
        self.events.on_connect.try_invoke(&ConnectEvent {
            host,
            port,
            link: self.link(),
        });

        for _ in 0..self.config.recv_depth {
            if !self.recv() {
                break;
            }
        }
    }

    fn on_received(&self, data: Vec<u8>, error: i32) {
        if error != 0 {
            self.fail(OpKind::Recv, error);
            return;
        }
        if self.is_closed() {
            return;
        }
        if data.is_empty() {
            self.shut(CloseReason::PeerShutdown);
            return;
        }
        self.events.on_data.try_invoke(&DataEvent {
            data,
            link: self.link(),
        });
        if !self.recv() && !self.is_closed() {
            kwarn!("client {}: receive not re-armed", self.key);
        }
    }
}

impl CompletionTarget for ClientCore {
    fn on_completion(&self, token: OpToken, bytes: u32, error: u32) {
        let Some(mut ctx) = self.pending.take(token.slot()) else {
            kwarn!("client {}: completion for unknown slot {}", self.key, token.slot());
            return;
        };
        ctx.settle(bytes);
        let error = error as i32;
        match ctx.kind {
            OpKind::Connect => self.on_connected(error),
            OpKind::Recv => self.on_received(ctx.buffer, error),
            OpKind::Send if error != 0 => self.fail(OpKind::Send, error),
            _ => {}
        }
        self.retire();
    }

    fn pending_ops(&self) -> usize {
        self.pending.len()
    }
}

/// An outbound connection on the completion runtime.
///
/// Dropping the socket closes it. Callbacks run on worker threads.
///
/// ```ignore
/// let client = ClientSocket::new();
/// client.events().on_data.set(|ev| println!("{} bytes", ev.data.len()));
/// client.events().on_connect.set(|ev| { ev.link.send(b"ping"); });
/// client.connect("127.0.0.1", 7000);
/// ```
pub struct ClientSocket {
    core: Arc<ClientCore>,
}

impl ClientSocket {
    /// A client on the process-wide runtime.
    pub fn new() -> Self {
        Self::with_runtime(Runtime::global())
    }

    pub fn with_runtime(rt: Arc<Runtime>) -> Self {
        Self::with_config(rt, ClientConfig::default())
    }

    pub fn with_config(rt: Arc<Runtime>, config: ClientConfig) -> Self {
        let core = rt.clone().register(|key| {
            Arc::new_cyclic(|me| ClientCore {
                me: me.clone(),
                sock: Socket::new(rt.clone(), key),
                rt,
                key,
                config,
                pending: PendingSet::default(),
                events: ClientEvents::default(),
                state: Mutex::new(ClientState::Unopened),
                target: Mutex::new(None),
            })
        });
        if let Err(e) = core.sock.hold_runtime() {
            kerror!("client {}: runtime start failed: {}", core.key, e);
        }
        Self { core }
    }

    /// Allocate the handle ahead of `connect`.
    pub fn create(&self, family: AddressFamily, ty: SocketType) -> bool {
        match self.core.create(family, ty) {
            Ok(()) => true,
            Err(e) => {
                kwarn!("client {}: create: {}", self.core.key, e);
                false
            }
        }
    }

    /// Resolve `host` and connect to the first candidate that can be started.
    ///
    /// `true` means a connect is in flight; the outcome arrives as
    /// `on_connect` or `on_error`.
    pub fn connect(&self, host: &str, port: u16) -> bool {
        let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
            Ok(it) => it.collect(),
            Err(e) => {
                kwarn!("client {}: resolve {}:{}: {}", self.core.key, host, port, e);
                return false;
            }
        };
        if addrs.is_empty() {
            kwarn!(
                "client {}: {}",
                self.core.key,
                PortError::Resolve(format!("{}:{}", host, port))
            );
            return false;
        }
        self.core.connect_to(&addrs)
    }

    /// Connect to the first of `addrs` that can be started, in order.
    pub fn connect_to(&self, addrs: &[SocketAddr]) -> bool {
        self.core.connect_to(addrs)
    }

    pub fn send(&self, data: &[u8]) -> bool {
        self.core.send(data)
    }

    /// Put one extra receive in flight.
    pub fn recv(&self) -> bool {
        self.core.recv()
    }

    pub fn close(&self) -> bool {
        self.core.close()
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    pub fn state(&self) -> ClientState {
        self.core.state()
    }

    pub fn events(&self) -> &ClientEvents {
        &self.core.events
    }

    /// Operations submitted and not yet handled.
    pub fn pending_ops(&self) -> usize {
        self.core.pending.len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.sock.local_addr().ok()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.core.sock.peer_addr().ok()
    }

    /// A weak handle for use from callbacks.
    pub fn link(&self) -> ClientLink {
        self.core.link()
    }
}

impl Default for ClientSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, RuntimeConfig};
    use std::net::{IpAddr, Ipv4Addr, TcpListener};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn rt() -> Arc<Runtime> {
        Runtime::new(RuntimeConfig::new().num_workers(2).min_workers(1))
    }

    #[test]
    fn test_connect_to_std_listener() {
        let rt = rt();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = ClientSocket::with_runtime(rt.clone());
        let (tx, rx) = mpsc::channel();
        client.events().on_connect.set(move |ev| {
            tx.send((ev.host.clone(), ev.port)).unwrap();
        });
        assert!(client.connect("127.0.0.1", port));

        let (host, p) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(p, port);
        let (_peer, _) = listener.accept().unwrap();
        assert_eq!(client.state(), ClientState::Connected);
        assert!(client.local_addr().is_some());

        assert!(client.close());
        assert!(!client.is_open());
        assert!(!client.send(b"late"));
    }

    #[test]
    fn test_refused_connect_reports_error() {
        let rt = rt();
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let client = ClientSocket::with_runtime(rt.clone());
        let (tx, rx) = mpsc::channel();
        let connected = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let c = connected.clone();
        client.events().on_connect.set(move |_| {
            c.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        let close_tx = tx.clone();
        client.events().on_error.set(move |ev| {
            tx.send(Some(*ev)).unwrap();
        });
        client.events().on_close.set(move |ev| {
            assert!(matches!(ev.reason, CloseReason::Error { .. }));
            close_tx.send(None).unwrap();
        });

        assert!(client.connect("127.0.0.1", port));
        let err = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert_eq!(err.op, OpKind::Connect);
        assert_ne!(err.code, 0);
        assert!(rx.recv_timeout(TIMEOUT).unwrap().is_none());
        assert!(!connected.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[test]
    fn test_connect_skips_family_mismatch() {
        let rt = rt();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = ClientSocket::with_runtime(rt.clone());
        assert!(client.create(AddressFamily::Inet, SocketType::Stream));
        let (tx, rx) = mpsc::channel();
        client.events().on_connect.set(move |ev| tx.send(ev.port).unwrap());

        let v6: SocketAddr = format!("[::1]:{}", port).parse().unwrap();
        let v4: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        assert!(client.connect_to(&[v6, v4]));
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), port);
    }

    #[test]
    fn test_failed_candidate_handle_reopened_in_next_family() {
        let rt = rt();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        // An IPv4 source address cannot be bound on the IPv6 candidate's
        // handle; the IPv4 candidate must still get a handle of its own.
        let client = ClientSocket::with_config(
            rt.clone(),
            ClientConfig::new().local_ip(Ipv4Addr::LOCALHOST.into()),
        );
        let (tx, rx) = mpsc::channel();
        client.events().on_connect.set(move |ev| tx.send(ev.port).unwrap());

        let v6: SocketAddr = format!("[::1]:{}", port).parse().unwrap();
        let v4: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        assert!(client.connect_to(&[v6, v4]));
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), port);
        assert_eq!(
            client.local_addr().map(|a| a.ip()),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(rt.stats().refs, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_peer_reset_reports_error_then_closes() {
        use std::os::unix::io::AsRawFd;

        let rt = rt();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = ClientSocket::with_runtime(rt.clone());
        let (tx, rx) = mpsc::channel();
        let close_tx = tx.clone();
        client.events().on_error.set(move |ev| tx.send(Ok(ev.op)).unwrap());
        client.events().on_close.set(move |ev| close_tx.send(Err(ev.reason)).unwrap());
        assert!(client.connect("127.0.0.1", port));

        let (peer, _) = listener.accept().unwrap();
        let depth = ClientConfig::default().recv_depth;
        let deadline = Instant::now() + TIMEOUT;
        while client.pending_ops() != depth && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(client.state(), ClientState::Connected);

        // Linger 0: closing sends a reset instead of a FIN.
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        let ret = unsafe {
            libc::setsockopt(
                peer.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const libc::linger as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            )
        };
        assert_eq!(ret, 0);
        drop(peer);

        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ok(OpKind::Recv));
        match rx.recv_timeout(TIMEOUT).unwrap() {
            Err(CloseReason::Error { op, code }) => {
                assert_eq!(op, OpKind::Recv);
                assert_ne!(code, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(client.state(), ClientState::Closed);
        assert!(!client.send(b"late"));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err(), "single close");
    }

    #[test]
    fn test_connect_without_candidates_fails() {
        let client = ClientSocket::with_runtime(rt());
        assert!(!client.connect_to(&[]));
        assert_eq!(client.state(), ClientState::Unopened);
        assert!(!client.send(b"x"));
        assert!(!client.recv());
    }

    #[test]
    fn test_double_close_releases_once() {
        let rt = rt();
        let a = ClientSocket::with_runtime(rt.clone());
        let b = ClientSocket::with_runtime(rt.clone());
        assert!(a.create(AddressFamily::Inet, SocketType::Stream));
        assert_eq!(rt.stats().refs, 2);

        assert!(a.close());
        assert!(a.close());
        assert_eq!(rt.stats().refs, 1);
        assert!(!a.create(AddressFamily::Inet, SocketType::Stream));

        drop(b);
        let s = rt.stats();
        assert_eq!((s.refs, s.starts, s.teardowns), (0, 1, 1));
        drop(a);
        assert_eq!(rt.stats().teardowns, 1);
    }

    #[test]
    fn test_on_close_only_after_open() {
        let client = ClientSocket::with_runtime(rt());
        let (tx, rx) = mpsc::channel::<()>();
        client.events().on_close.set(move |_| tx.send(()).unwrap());
        client.close();
        assert!(rx.try_recv().is_err());
    }
}
