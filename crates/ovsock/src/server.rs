//! Listening TCP socket and its accepted clients.
//!
//! The server keeps one accept in flight per worker thread. Every accepted
//! client lives in an arena addressed by [`ClientId`]; its accept, receive
//! and send contexts are owned and dispatched by the server, so a single
//! completion key covers the listener and all of its clients.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use ovsock_core::{
    kdebug, kerror, kwarn, os_error_string, AddressFamily, ClientId, CompletionContext, OpKind,
    OpToken, Operation, PortError, PortResult, Slab, SocketType,
};
use ovsock_module::net;

use crate::config::{FailureScope, ServerConfig};
use crate::events::{
    ClientConnectEvent, ClientDataEvent, CloseReason, DisconnectEvent, ListeningEvent,
    ServerEvents, ServerLink,
};
use crate::lock;
use crate::runtime::{CompletionTarget, Runtime};
use crate::socket::{PendingSet, Socket};

struct AcceptedClient {
    sock: Arc<Socket>,
    peer: Option<SocketAddr>,
    /// Accept completed; until then the slot only backs a pending accept.
    connected: bool,
}

pub(crate) struct ServerCore {
    me: Weak<ServerCore>,
    rt: Arc<Runtime>,
    key: u32,
    listener: Socket,
    config: ServerConfig,
    pending: PendingSet,
    clients: Mutex<Slab<AcceptedClient>>,
    posted_accepts: AtomicUsize,
    /// Accepts held back while the process is out of handles.
    deferred_accepts: AtomicUsize,
    closed: AtomicBool,
    events: ServerEvents,
}

/// Address to bind for `host`: a numeric address, the IPv4 wildcard for an
/// empty host, otherwise the first resolver result.
fn bind_addr(host: &str, port: u16) -> PortResult<SocketAddr> {
    let host = host.trim();
    if host.is_empty() || host == "*" {
        return Ok(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port));
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .ok_or_else(|| PortError::Resolve(format!("{}:{}", host, port)))
}

impl ServerCore {
    fn link(&self) -> ServerLink {
        ServerLink {
            core: self.me.clone(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.is_closed() && self.listener.is_open()
    }

    fn listen(&self, host: &str, port: u16) -> PortResult<SocketAddr> {
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        let addr = bind_addr(host, port)?;
        let family = AddressFamily::of(&addr);
        if !self.listener.is_open() {
            self.listener.create(family, SocketType::Stream)?;
        } else if self.listener.family() != Some(family) {
            return Err(PortError::Unsupported("listen address family"));
        }
        if let Err(e) = self.listener.set_reuse_addr() {
            kwarn!("server {}: address reuse: {}", self.key, e);
        }
        self.listener.bind(&addr)?;
        self.listener.listen(self.config.backlog)?;
        let local = self.listener.local_addr()?;

        let (host, port) = net::host_port(&local);
        kdebug!("server {}: listening on {}", self.key, local);
        self.events.on_listening.try_invoke(&ListeningEvent { host, port });

        for _ in 0..self.rt.worker_count() {
            if let Err(e) = self.accept() {
                kwarn!("server {}: accept not posted: {}", self.key, e);
            }
        }
        Ok(local)
    }

    /// Post one accept into a freshly created client handle.
    fn accept(&self) -> PortResult<()> {
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        let family = self.listener.family().ok_or(PortError::Closed)?;
        let sock = Arc::new(Socket::new(self.rt.clone(), self.key));
        sock.create(family, SocketType::Stream)?;
        let accept_into = sock.raw();
        let id = ClientId(lock(&self.clients).insert(AcceptedClient {
            sock,
            peer: None,
            connected: false,
        }));

        self.posted_accepts.fetch_add(1, Ordering::SeqCst);
        let ctx = CompletionContext::accept(self.key, id);
        let submitted = self
            .pending
            .submit(&self.listener, self.key, ctx, |_| Operation::Accept { accept_into });
        if let Err(e) = submitted {
            self.posted_accepts.fetch_sub(1, Ordering::SeqCst);
            self.discard_client(id);
            self.retire();
            return Err(e);
        }
        Ok(())
    }

    /// Post a replacement accept, or hold it back until a client slot
    /// frees if handles are exhausted.
    fn replace_accept(&self) {
        match self.accept() {
            Ok(()) => {}
            Err(PortError::Os(code)) if net::is_resource_exhausted(code) => {
                self.defer_accept(code)
            }
            Err(e) => kwarn!("server {}: accept not replaced: {}", self.key, e),
        }
    }

    fn defer_accept(&self, code: i32) {
        if self.deferred_accepts.fetch_add(1, Ordering::SeqCst) == 0 {
            kwarn!(
                "server {}: {}, accepts held until a client closes",
                self.key,
                os_error_string(code)
            );
        }
    }

    fn resume_deferred_accepts(&self) {
        if self.is_closed() {
            return;
        }
        let held = self.deferred_accepts.swap(0, Ordering::SeqCst);
        if held > 0 {
            kdebug!("server {}: re-posting {} held accepts", self.key, held);
        }
        for _ in 0..held {
            self.replace_accept();
        }
    }

    fn client_sock(&self, id: ClientId) -> Option<Arc<Socket>> {
        lock(&self.clients).get(id.0).map(|c| c.sock.clone())
    }

    fn has_client(&self, id: ClientId) -> bool {
        lock(&self.clients).get(id.0).is_some()
    }

    fn submit_for(
        &self,
        id: ClientId,
        ctx: CompletionContext,
        build: impl FnOnce(&mut CompletionContext) -> Operation,
    ) -> PortResult<()> {
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        let sock = self.client_sock(id).ok_or(PortError::Closed)?;
        let submitted = self
            .pending
            .submit(&sock, self.key, ctx.with_client(id), build);
        if submitted.is_err() {
            self.retire();
        }
        submitted
    }

    pub(crate) fn send(&self, data: &[u8], id: ClientId) -> bool {
        if data.is_empty() {
            return self.has_client(id) && !self.is_closed();
        }
        let ctx = CompletionContext::send(self.key, data);
        match self.submit_for(id, ctx, |c| Operation::Send {
            buf: c.buffer.as_ptr(),
            len: c.buffer.len(),
        }) {
            Ok(()) => true,
            Err(e) => {
                kdebug!("server {}: send to {}: {}", self.key, id, e);
                false
            }
        }
    }

    fn recv(&self, id: ClientId) -> PortResult<()> {
        let ctx = CompletionContext::recv(self.key, self.config.recv_buffer_size);
        self.submit_for(id, ctx, |c| Operation::Recv {
            buf: c.buffer.as_mut_ptr(),
            len: c.buffer.len(),
        })
    }

    /// Close a client. `on_disconnect` fires if it had been accepted.
    fn close_client_with(&self, id: ClientId, reason: CloseReason) -> bool {
        let Some(client) = lock(&self.clients).remove(id.0) else {
            return false;
        };
        let ok = close_logged(&client.sock, self.key);
        if client.connected {
            kdebug!("server {}: {} disconnected ({})", self.key, id, reason);
            self.events
                .on_disconnect
                .try_invoke(&DisconnectEvent { client: id, reason });
            self.resume_deferred_accepts();
        }
        ok
    }

    pub(crate) fn close_client(&self, id: ClientId) -> bool {
        self.close_client_with(id, CloseReason::Local)
    }

    /// Drop a client slot that never finished its accept.
    fn discard_client(&self, id: ClientId) {
        let removed = lock(&self.clients).remove(id.0);
        if let Some(client) = removed {
            close_logged(&client.sock, self.key);
        }
    }

    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return true;
        }
        let mut ok = true;
        let keys = lock(&self.clients).keys();
        for k in keys {
            ok &= self.close_client_with(ClientId(k), CloseReason::Local);
        }
        // The listener holds the runtime reference: close it last.
        if let Err(e) = self.listener.close() {
            kwarn!("server {}: close: {}", self.key, e);
            ok = false;
        }
        self.retire();
        ok
    }

    fn retire(&self) {
        if self.pending.retire_if_drained(self.is_closed()) {
            self.rt.unregister(self.key);
        }
    }

    /// Apply the failure policy to a failed operation.
    fn on_failure(&self, op: OpKind, client: Option<ClientId>, code: i32) {
        if self.is_closed() {
            return;
        }
        if let Some(id) = client {
            // Aborted by a local close of this client.
            if !self.has_client(id) {
                return;
            }
        }
        kwarn!(
            "server {}: {} failed{}: {}",
            self.key,
            op,
            client.map(|id| format!(" for {}", id)).unwrap_or_default(),
            os_error_string(code)
        );
        match self.config.failure_scope {
            FailureScope::Server => {
                self.close();
            }
            FailureScope::Client => {
                if let Some(id) = client {
                    self.close_client_with(id, CloseReason::Error { op, code });
                }
                if op == OpKind::Accept {
                    if net::is_resource_exhausted(code) {
                        self.defer_accept(code);
                    } else {
                        self.replace_accept();
                    }
                }
            }
        }
    }

    fn on_accepted(&self, client: Option<ClientId>, error: i32) {
        let Some(id) = client else { return };
        if self.is_closed() {
            self.discard_client(id);
            return;
        }
        if error != 0 {
            self.on_failure(OpKind::Accept, Some(id), error);
            return;
        }
        let Some(sock) = self.client_sock(id) else { return };
        if let Err(e) = self.listener.complete_accept(&sock) {
            self.on_failure(OpKind::Accept, Some(id), e.os_code().unwrap_or(-1));
            return;
        }
        let peer = sock.peer_addr().ok();
        match lock(&self.clients).get_mut(id.0) {
            Some(c) => {
                c.peer = peer;
                c.connected = true;
            }
            None => return,
        }

        self.replace_accept();

        self.events.on_connect.try_invoke(&ClientConnectEvent {
            client: id,
            peer,
            server: self.link(),
        });
        for _ in 0..self.config.recv_depth {
            if self.recv(id).is_err() {
                break;
            }
        }
    }

    fn on_received(&self, client: Option<ClientId>, data: Vec<u8>, error: i32) {
        let Some(id) = client else { return };
        if error != 0 {
            self.on_failure(OpKind::Recv, Some(id), error);
            return;
        }
        if self.is_closed() || !self.has_client(id) {
            return;
        }
        if data.is_empty() {
            self.close_client_with(id, CloseReason::PeerShutdown);
            return;
        }
        self.events.on_data.try_invoke(&ClientDataEvent {
            client: id,
            data,
            server: self.link(),
        });
        if let Err(e) = self.recv(id) {
            if !self.is_closed() && self.has_client(id) {
                kwarn!("server {}: receive for {} not re-armed: {}", self.key, id, e);
                let code = e.os_code().unwrap_or(-1);
                self.close_client_with(id, CloseReason::Error { op: OpKind::Recv, code });
            }
        }
    }
}

fn close_logged(sock: &Socket, key: u32) -> bool {
    match sock.close() {
        Ok(()) => true,
        Err(e) => {
            kwarn!("server {}: client close: {}", key, e);
            false
        }
    }
}

impl CompletionTarget for ServerCore {
    fn on_completion(&self, token: OpToken, bytes: u32, error: u32) {
        let Some(mut ctx) = self.pending.take(token.slot()) else {
            kwarn!("server {}: completion for unknown slot {}", self.key, token.slot());
            return;
        };
        ctx.settle(bytes);
        let error = error as i32;
        match ctx.kind {
            OpKind::Accept => {
                self.posted_accepts.fetch_sub(1, Ordering::SeqCst);
                self.on_accepted(ctx.client, error);
            }
            OpKind::Recv => self.on_received(ctx.client, ctx.buffer, error),
            OpKind::Send if error != 0 => self.on_failure(OpKind::Send, ctx.client, error),
            _ => {}
        }
        self.retire();
    }

    fn pending_ops(&self) -> usize {
        self.pending.len()
    }
}

/// A listening socket on the completion runtime.
///
/// Dropping the server closes it and every accepted client.
pub struct ServerSocket {
    core: Arc<ServerCore>,
}

impl ServerSocket {
    /// A server on the process-wide runtime.
    pub fn new() -> Self {
        Self::with_runtime(Runtime::global())
    }

    pub fn with_runtime(rt: Arc<Runtime>) -> Self {
        Self::with_config(rt, ServerConfig::default())
    }

    pub fn with_config(rt: Arc<Runtime>, config: ServerConfig) -> Self {
        let core = rt.clone().register(|key| {
            Arc::new_cyclic(|me| ServerCore {
                me: me.clone(),
                listener: Socket::new(rt.clone(), key),
                rt,
                key,
                config,
                pending: PendingSet::default(),
                clients: Mutex::new(Slab::new()),
                posted_accepts: AtomicUsize::new(0),
                deferred_accepts: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                events: ServerEvents::default(),
            })
        });
        if let Err(e) = core.listener.hold_runtime() {
            kerror!("server {}: runtime start failed: {}", core.key, e);
        }
        Self { core }
    }

    /// Allocate the listening handle ahead of `listen`.
    pub fn create(&self, family: AddressFamily, ty: SocketType) -> bool {
        if self.core.is_closed() {
            return false;
        }
        match self.core.listener.create(family, ty) {
            Ok(()) => true,
            Err(e) => {
                kwarn!("server {}: create: {}", self.core.key, e);
                false
            }
        }
    }

    /// Bind `host:port`, start listening and post the initial accepts.
    ///
    /// Port `0` picks an ephemeral port; see [`local_addr`](Self::local_addr).
    pub fn listen(&self, host: &str, port: u16) -> bool {
        match self.core.listen(host, port) {
            Ok(_) => true,
            Err(e) => {
                kwarn!("server {}: listen on {}:{}: {}", self.core.key, host, port, e);
                false
            }
        }
    }

    /// Post one additional accept.
    pub fn accept(&self) -> bool {
        match self.core.accept() {
            Ok(()) => true,
            Err(e) => {
                kwarn!("server {}: accept: {}", self.core.key, e);
                false
            }
        }
    }

    pub fn send(&self, data: &[u8], client: ClientId) -> bool {
        self.core.send(data, client)
    }

    /// Put one extra receive in flight for `client`.
    pub fn recv(&self, client: ClientId) -> bool {
        self.core.recv(client).is_ok()
    }

    pub fn close_client(&self, client: ClientId) -> bool {
        self.core.close_client(client)
    }

    pub fn close(&self) -> bool {
        self.core.close()
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    pub fn events(&self) -> &ServerEvents {
        &self.core.events
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.listener.local_addr().ok()
    }

    /// Peer address recorded when `client` was accepted.
    pub fn client_addr(&self, client: ClientId) -> Option<SocketAddr> {
        lock(&self.core.clients).get(client.0).and_then(|c| c.peer)
    }

    /// Accepted clients still open.
    pub fn client_count(&self) -> usize {
        lock(&self.core.clients)
            .iter()
            .filter(|(_, c)| c.connected)
            .count()
    }

    /// Accepts currently in flight.
    pub fn pending_accepts(&self) -> usize {
        self.core.posted_accepts.load(Ordering::SeqCst)
    }

    /// Operations submitted and not yet handled, across all clients.
    pub fn pending_ops(&self) -> usize {
        self.core.pending.len()
    }

    pub fn link(&self) -> ServerLink {
        self.core.link()
    }
}

impl Default for ServerSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.core.close();
    }
}
