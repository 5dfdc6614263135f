//! Base socket: one native handle associated with the runtime's port.
//!
//! `Socket` owns the handle and, for sockets created through the public
//! API, one runtime reference. Accepted clients ride on their server's
//! reference.
//!
//! `PendingSet` is the per-owner table of in-flight contexts. Submission
//! inserts under its lock and dispatch removes under the same lock, so a
//! completion can never observe a half-submitted context.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use ovsock_core::{
    kdebug, ktrace, AddressFamily, CompletionContext, CompletionPort, OpToken, Operation,
    PendingOps, PortError, PortResult, RawSock, SocketType, INVALID_SOCK,
};
use ovsock_module::net;

use crate::runtime::Runtime;
use crate::{lock, read, write};

pub struct Socket {
    rt: Arc<Runtime>,
    handle: RwLock<RawSock>,
    port: RwLock<Option<Arc<dyn CompletionPort>>>,
    /// Completion key the handle is associated under.
    key: u32,
    family: Mutex<Option<AddressFamily>>,
    holds_ref: AtomicBool,
}

impl Socket {
    /// A socket associated under `key`. It holds no runtime reference until
    /// [`hold_runtime`](Self::hold_runtime); accepted clients never do.
    pub(crate) fn new(rt: Arc<Runtime>, key: u32) -> Self {
        Self {
            rt,
            handle: RwLock::new(INVALID_SOCK),
            port: RwLock::new(None),
            key,
            family: Mutex::new(None),
            holds_ref: AtomicBool::new(false),
        }
    }

    /// Take a runtime reference, released again by `close`.
    pub(crate) fn hold_runtime(&self) -> PortResult<()> {
        if self.holds_ref.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.rt.acquire()?;
        self.holds_ref.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Allocate the handle, associate it with the port and let the workers
    /// run.
    pub fn create(&self, family: AddressFamily, ty: SocketType) -> PortResult<()> {
        let mut handle = write(&self.handle);
        if *handle != INVALID_SOCK {
            return Err(PortError::AlreadyOpen);
        }
        let port = self.rt.port().ok_or(PortError::NotInitialized)?;
        let sock = net::socket(family, ty)?;
        if let Err(e) = port.associate(sock, self.key) {
            let _ = net::close(sock);
            return Err(e);
        }
        *handle = sock;
        *write(&self.port) = Some(port);
        *lock(&self.family) = Some(family);
        drop(handle);

        self.rt.resume();
        kdebug!("socket {} created (key {})", sock, self.key);
        Ok(())
    }

    /// Shut down and close the handle, then drop the runtime reference.
    ///
    /// Safe to call repeatedly; only the first call does anything. An error
    /// from shutdown or close is reported after the reference is released.
    pub fn close(&self) -> PortResult<()> {
        let result = self.close_handle();
        if self.holds_ref.swap(false, Ordering::SeqCst) {
            self.rt.release();
        }
        result
    }

    /// Close the handle but keep the runtime reference, leaving the socket
    /// ready for `create` in any family.
    pub fn discard(&self) -> PortResult<()> {
        let result = self.close_handle();
        *lock(&self.family) = None;
        result
    }

    fn close_handle(&self) -> PortResult<()> {
        let mut handle = write(&self.handle);
        if *handle == INVALID_SOCK {
            return Ok(());
        }
        let sock = std::mem::replace(&mut *handle, INVALID_SOCK);
        let mut result = match net::shutdown(sock) {
            Err(PortError::Os(code)) if code == net::NOT_CONNECTED => Ok(()),
            other => other,
        };
        if let Some(port) = write(&self.port).take() {
            port.release(sock);
        }
        if let Err(e) = net::close(sock) {
            result = result.and(Err(e));
        }
        ktrace!("socket {} closed", sock);
        result
    }

    pub fn is_open(&self) -> bool {
        *read(&self.handle) != INVALID_SOCK
    }

    pub fn family(&self) -> Option<AddressFamily> {
        *lock(&self.family)
    }

    /// Current native handle, `INVALID_SOCK` when closed.
    pub fn raw(&self) -> RawSock {
        *read(&self.handle)
    }

    fn with_handle<T>(&self, f: impl FnOnce(RawSock) -> PortResult<T>) -> PortResult<T> {
        let handle = read(&self.handle);
        if *handle == INVALID_SOCK {
            return Err(PortError::Closed);
        }
        f(*handle)
    }

    pub fn bind(&self, addr: &SocketAddr) -> PortResult<()> {
        self.with_handle(|s| net::bind(s, addr))
    }

    /// Bound to a concrete local port.
    pub fn is_bound(&self) -> bool {
        self.with_handle(|s| Ok(net::is_bound(s))).unwrap_or(false)
    }

    pub fn set_reuse_addr(&self) -> PortResult<()> {
        self.with_handle(net::set_reuse_addr)
    }

    pub fn listen(&self, backlog: i32) -> PortResult<()> {
        self.with_handle(|s| net::listen(s, backlog))
    }

    pub fn local_addr(&self) -> PortResult<SocketAddr> {
        self.with_handle(net::local_addr)
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> PortResult<SocketAddr> {
        self.with_handle(net::peer_addr)
    }

    /// Finalize a completed connect.
    pub fn complete_connect(&self) -> PortResult<()> {
        let port = read(&self.port).clone().ok_or(PortError::NotInitialized)?;
        self.with_handle(|s| port.complete_connect(s))
    }

    /// Finalize `accepted` after an accept on this listener completed.
    pub fn complete_accept(&self, accepted: &Socket) -> PortResult<()> {
        let port = read(&self.port).clone().ok_or(PortError::NotInitialized)?;
        self.with_handle(|listener| accepted.with_handle(|s| port.complete_accept(listener, s)))
    }

    /// Start `op` on this handle.
    ///
    /// # Safety
    ///
    /// Buffers named by `op` must stay valid until the completion for
    /// `token` has been dequeued.
    pub(crate) unsafe fn submit(&self, token: OpToken, op: Operation) -> PortResult<()> {
        let handle = read(&self.handle);
        if *handle == INVALID_SOCK {
            return Err(PortError::Closed);
        }
        let port = read(&self.port).clone().ok_or(PortError::NotInitialized)?;
        port.submit(*handle, token, op)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// In-flight contexts of one completion owner.
#[derive(Default)]
pub(crate) struct PendingSet {
    ops: Mutex<PendingOps>,
    retired: AtomicBool,
}

impl PendingSet {
    /// Record `ctx` and start the operation built from it on `sock`.
    ///
    /// On failure the context is dropped again and never completes.
    pub fn submit(
        &self,
        sock: &Socket,
        owner: u32,
        mut ctx: CompletionContext,
        build: impl FnOnce(&mut CompletionContext) -> Operation,
    ) -> PortResult<()> {
        // The heap buffer does not move with the context.
        let op = build(&mut ctx);
        let mut ops = lock(&self.ops);
        let slot = ops.insert(ctx);
        let token = OpToken::new(owner, slot.index);
        // SAFETY: the buffer lives in `ops` until `take` removes it, which
        // only happens once the completion for `token` was dequeued.
        if let Err(e) = unsafe { sock.submit(token, op) } {
            ops.remove(slot);
            return Err(e);
        }
        Ok(())
    }

    /// Remove the context a completion refers to.
    pub fn take(&self, slot: u32) -> Option<CompletionContext> {
        lock(&self.ops).remove_index(slot)
    }

    pub fn len(&self) -> usize {
        lock(&self.ops).len()
    }

    /// `true` exactly once: the first time the owner is closed with nothing
    /// left in flight.
    pub fn retire_if_drained(&self, closed: bool) -> bool {
        let ops = lock(&self.ops);
        closed && ops.is_empty() && !self.retired.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn rt() -> Arc<Runtime> {
        Runtime::new(RuntimeConfig::new().num_workers(2).min_workers(1))
    }

    #[test]
    fn test_create_close_lifecycle() {
        let rt = rt();
        let s = Socket::new(rt.clone(), 1);
        s.hold_runtime().unwrap();
        s.hold_runtime().unwrap();
        assert_eq!(rt.stats().refs, 1);
        assert!(!s.is_open());
        assert!(!rt.is_running());

        s.create(AddressFamily::Inet, SocketType::Stream).unwrap();
        assert!(s.is_open());
        assert!(rt.is_running());
        assert_eq!(s.family(), Some(AddressFamily::Inet));
        assert_eq!(
            s.create(AddressFamily::Inet, SocketType::Stream),
            Err(PortError::AlreadyOpen)
        );

        s.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(s.is_bound());
        assert!(s.local_addr().unwrap().ip().is_loopback());
        assert!(s.peer_addr().is_err());

        // Never connected: shutdown's not-connected error is not a failure.
        s.close().unwrap();
        s.close().unwrap();
        assert!(!s.is_open());
        let st = rt.stats();
        assert_eq!((st.refs, st.starts, st.teardowns), (0, 1, 1));
    }

    #[test]
    fn test_closed_socket_rejects_requests() {
        let rt = rt();
        let s = Socket::new(rt.clone(), 1);
        s.hold_runtime().unwrap();
        assert_eq!(s.bind(&"127.0.0.1:0".parse().unwrap()), Err(PortError::Closed));
        assert!(!s.is_bound());
        assert_eq!(s.raw(), INVALID_SOCK);

        let pending = PendingSet::default();
        let err = pending
            .submit(&s, 1, CompletionContext::recv(1, 16), |c| Operation::Recv {
                buf: c.buffer.as_mut_ptr(),
                len: c.buffer.len(),
            })
            .unwrap_err();
        assert_eq!(err, PortError::Closed);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_socket_without_reference_needs_started_runtime() {
        let rt = rt();
        let s = Socket::new(rt.clone(), 1);
        assert_eq!(
            s.create(AddressFamily::Inet, SocketType::Stream),
            Err(PortError::NotInitialized)
        );
        assert_eq!(rt.stats().refs, 0);
    }

    #[test]
    fn test_discard_keeps_reference() {
        let rt = rt();
        let s = Socket::new(rt.clone(), 1);
        s.hold_runtime().unwrap();
        s.create(AddressFamily::Inet, SocketType::Stream).unwrap();

        s.discard().unwrap();
        assert!(!s.is_open());
        assert_eq!(s.family(), None);
        assert_eq!(rt.stats().refs, 1);

        s.create(AddressFamily::Inet, SocketType::Stream).unwrap();
        assert!(s.is_open());
        s.close().unwrap();
        assert_eq!(rt.stats().refs, 0);
    }

    #[test]
    fn test_retire_once() {
        let p = PendingSet::default();
        assert!(!p.retire_if_drained(false));
        assert!(p.retire_if_drained(true));
        assert!(!p.retire_if_drained(true));
    }
}
