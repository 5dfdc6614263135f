//! Completion contexts: the in-memory record of one outstanding operation.
//!
//! A context is created when an operation is submitted, lives in its
//! owner's pending slab while the OS holds its buffer, and is removed
//! exactly once when the completion is dispatched.

use core::fmt;

use crate::slab::{Slab, SlabKey};

/// Receive buffer capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Operation kind carried by a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    None = 0,
    Accept = 1,
    Recv = 2,
    Send = 3,
    Connect = 4,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpKind::None => "none",
            OpKind::Accept => "accept",
            OpKind::Recv => "recv",
            OpKind::Send => "send",
            OpKind::Connect => "connect",
        })
    }
}

/// Identity of a client accepted by a server.
///
/// Index + generation into the server's client arena. Stays valid while the
/// client is held by the server; after the client is closed the id no longer
/// resolves, even if its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub SlabKey);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}.{}", self.0.index, self.0.generation)
    }
}

/// One pending operation.
pub struct CompletionContext {
    pub kind: OpKind,
    /// Data to send, or space to receive into. Its heap allocation must not
    /// move while the operation is in flight.
    pub buffer: Vec<u8>,
    /// Key of the owning socket (non-owning back-reference).
    pub owner: u32,
    /// For server accept/recv/send contexts: the accepted client involved.
    pub client: Option<ClientId>,
}

impl CompletionContext {
    fn new(kind: OpKind, owner: u32, buffer: Vec<u8>) -> Self {
        Self {
            kind,
            buffer,
            owner,
            client: None,
        }
    }

    pub fn recv(owner: u32, capacity: usize) -> Self {
        Self::new(OpKind::Recv, owner, vec![0; capacity])
    }

    pub fn send(owner: u32, data: &[u8]) -> Self {
        Self::new(OpKind::Send, owner, data.to_vec())
    }

    pub fn connect(owner: u32) -> Self {
        Self::new(OpKind::Connect, owner, Vec::new())
    }

    pub fn accept(owner: u32, client: ClientId) -> Self {
        Self::new(OpKind::Accept, owner, Vec::new()).with_client(client)
    }

    pub fn with_client(mut self, client: ClientId) -> Self {
        self.client = Some(client);
        self
    }

    /// Trim the buffer to what the OS reported transferred.
    pub fn settle(&mut self, bytes: u32) {
        let n = (bytes as usize).min(self.buffer.len());
        self.buffer.truncate(n);
    }
}

impl fmt::Debug for CompletionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionContext")
            .field("kind", &self.kind)
            .field("len", &self.buffer.len())
            .field("owner", &self.owner)
            .field("client", &self.client)
            .finish()
    }
}

/// A socket's set of in-flight contexts.
pub type PendingOps = Slab<CompletionContext>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_settle() {
        let mut ctx = CompletionContext::recv(1, DEFAULT_BUFFER_SIZE);
        assert_eq!(ctx.buffer.len(), 8192);
        ctx.settle(4);
        assert_eq!(ctx.buffer.len(), 4);
        ctx.settle(100);
        assert_eq!(ctx.buffer.len(), 4);
    }

    #[test]
    fn test_send_copies() {
        let data = b"ping".to_vec();
        let ctx = CompletionContext::send(2, &data);
        assert_eq!(ctx.buffer, data);
        assert_eq!(ctx.kind, OpKind::Send);
        assert!(ctx.client.is_none());
    }

    #[test]
    fn test_accept_carries_client() {
        let id = ClientId(SlabKey {
            index: 3,
            generation: 1,
        });
        let ctx = CompletionContext::accept(7, id);
        assert_eq!(ctx.client, Some(id));
        assert_eq!(id.to_string(), "client#3.1");
    }

    #[test]
    fn test_pending_accounting() {
        let mut pending = PendingOps::new();
        let a = pending.insert(CompletionContext::recv(1, 16));
        let b = pending.insert(CompletionContext::send(1, b"x"));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.remove_index(a.index).map(|c| c.kind), Some(OpKind::Recv));
        assert_eq!(pending.remove_index(b.index).map(|c| c.kind), Some(OpKind::Send));
        assert!(pending.is_empty());
    }
}
